use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use chrono::Local;
use clap::{Args, Parser, Subcommand, ValueEnum};
use kpa_core::{
    BackendOptions, BackupStore, CoreError, Engine, EngineConfig, Language, RetentionPolicy,
    RunReport, load_project_config,
};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::console::{Console, describe_edit};

pub const EXIT_SUCCESS: u8 = 0;
pub const EXIT_FAILURE: u8 = 1;
/// Exit status after Ctrl-C.
pub const EXIT_CANCELLED: u8 = 130;

#[derive(Debug, Parser)]
#[command(
    name = "kpa",
    version,
    about = "Local coding assistant: plans, writes and edits code with backups"
)]
pub struct Cli {
    /// Project directory (defaults to the current directory)
    #[arg(short = 'C', long, global = true, default_value = ".")]
    pub dir: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Plan and implement a coding task in the project
    Run {
        /// What to build or change
        task: String,

        #[command(flatten)]
        generation: GenerationArgs,
    },

    /// Ask the model to rewrite a single existing file
    Modify {
        /// File to modify, relative to the project directory
        file: PathBuf,

        /// What to change
        task: String,

        #[command(flatten)]
        generation: GenerationArgs,
    },

    /// Inspect or prune file backups
    Backups {
        #[command(subcommand)]
        action: BackupsCommand,
    },
}

#[derive(Debug, Subcommand)]
pub enum BackupsCommand {
    /// List backups, newest first
    List,

    /// Remove backups outside a retention policy
    Prune {
        /// Keep at most this many backups per file
        #[arg(long)]
        keep_last: Option<usize>,

        /// Remove backups older than this many days
        #[arg(long)]
        max_age_days: Option<u64>,
    },
}

#[derive(Debug, Clone, Args)]
pub struct GenerationArgs {
    /// Model name (each backend has its own default)
    #[arg(short, long)]
    pub model: Option<String>,

    /// Backend: auto, ollama, openai or groq
    #[arg(short, long)]
    pub backend: Option<String>,

    /// Sampling temperature (0.0 to 1.0)
    #[arg(short, long)]
    pub temperature: Option<f32>,

    /// Show context details and debug logs
    #[arg(short, long)]
    pub verbose: bool,

    /// Apply edits without asking
    #[arg(short, long)]
    pub force: bool,

    /// Language of model responses
    #[arg(short, long, value_enum)]
    pub lang: Option<LangArg>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum LangArg {
    En,
    Es,
}

impl From<LangArg> for Language {
    fn from(lang: LangArg) -> Self {
        match lang {
            LangArg::En => Language::En,
            LangArg::Es => Language::Es,
        }
    }
}

impl Cli {
    /// Name of the log directory for this command, if it logs to a file.
    pub fn log_command(&self) -> Option<&'static str> {
        match self.command {
            Commands::Run { .. } => Some("run"),
            Commands::Modify { .. } => Some("modify"),
            Commands::Backups { .. } => None,
        }
    }

    pub fn verbose(&self) -> bool {
        match &self.command {
            Commands::Run { generation, .. } | Commands::Modify { generation, .. } => {
                generation.verbose
            }
            Commands::Backups { .. } => false,
        }
    }

    /// Run the command and return the process exit status.
    pub async fn run(self) -> Result<u8> {
        match self.command {
            Commands::Run { task, generation } => {
                run_task(self.dir, task, generation, BackendOptions::from_env()).await
            }
            Commands::Modify {
                file,
                task,
                generation,
            } => modify_file(self.dir, file, task, generation, BackendOptions::from_env()).await,
            Commands::Backups { action } => backups(self.dir, action),
        }
    }
}

fn engine_config(dir: PathBuf, args: &GenerationArgs) -> EngineConfig {
    EngineConfig::builder()
        .work_dir(dir)
        .verbose(args.verbose)
        .force(args.force)
        .build()
        .with_overrides(
            args.backend.clone(),
            args.model.clone(),
            args.temperature,
            args.lang.map(Language::from),
        )
}

/// Cancel `token` on Ctrl-C.
fn cancel_on_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            debug!("interrupt received");
            token.cancel();
        }
    });
}

async fn run_task(
    dir: PathBuf,
    task: String,
    args: GenerationArgs,
    options: BackendOptions,
) -> Result<u8> {
    let (mut console, prompter, events) = Console::new(args.verbose);
    let config = engine_config(dir, &args);
    let engine = match Engine::with_options(config, options, Arc::new(prompter)).await {
        Ok(engine) => engine,
        Err(e) => return Ok(report_error(&e)),
    };

    println!("Task: {task}\n");

    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(cancel.clone());

    let (result, ()) = tokio::join!(
        engine.run(&task, Some(events), cancel.clone()),
        console.run(cancel.clone()),
    );

    match result {
        Ok(report) => {
            print_summary(&report);
            Ok(if report.success {
                EXIT_SUCCESS
            } else {
                EXIT_FAILURE
            })
        }
        Err(e) => Ok(report_error(&e)),
    }
}

async fn modify_file(
    dir: PathBuf,
    file: PathBuf,
    task: String,
    args: GenerationArgs,
    options: BackendOptions,
) -> Result<u8> {
    let (mut console, prompter, events) = Console::new(args.verbose);
    let config = engine_config(dir, &args);
    let engine = match Engine::with_options(config, options, Arc::new(prompter)).await {
        Ok(engine) => engine,
        Err(e) => return Ok(report_error(&e)),
    };

    println!("Modifying {}...\n", file.display());

    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(cancel.clone());

    let (result, ()) = tokio::join!(
        engine.modify_file(&file, &task, Some(events), cancel.clone()),
        console.run(cancel.clone()),
    );

    match result {
        Ok(edit) if edit.success() => Ok(EXIT_SUCCESS),
        Ok(_) => Ok(EXIT_FAILURE),
        Err(e) => Ok(report_error(&e)),
    }
}

fn backups(dir: PathBuf, action: BackupsCommand) -> Result<u8> {
    let config = match load_project_config(&dir.join(kpa_core::STATE_DIR).join("config.yaml")) {
        Ok(config) => config,
        Err(e) => return Ok(report_error(&e)),
    };
    let store = BackupStore::new(dir.join(&config.backups.dir));

    match action {
        BackupsCommand::List => {
            let entries = match store.list() {
                Ok(entries) => entries,
                Err(e) => return Ok(report_error(&e)),
            };
            if entries.is_empty() {
                println!("No backups in {}", store.dir().display());
            }
            for entry in entries {
                println!(
                    "{}  {}  {}",
                    entry.created_at.format("%Y-%m-%d %H:%M:%S"),
                    entry.original_name,
                    entry.path.display()
                );
            }
        }
        BackupsCommand::Prune {
            keep_last,
            max_age_days,
        } => {
            let configured = RetentionPolicy::from(&config.backups);
            let policy = RetentionPolicy {
                keep_last: keep_last.or(configured.keep_last),
                max_age_days: max_age_days.or(configured.max_age_days),
            };
            if policy.is_empty() {
                println!("No retention policy: pass --keep-last or --max-age-days, or set backups.keepLast / backups.maxAgeDays.");
                return Ok(EXIT_SUCCESS);
            }
            match store.prune(&policy, Local::now().naive_local()) {
                Ok(removed) => println!("Removed {} backup(s)", removed.len()),
                Err(e) => return Ok(report_error(&e)),
            }
        }
    }
    Ok(EXIT_SUCCESS)
}

fn print_summary(report: &RunReport) {
    if report.success {
        println!("\n✓ Task completed successfully!");
        if !report.edits.is_empty() {
            println!("Review the changes and test your code.");
        }
    } else {
        println!("\n✗ Task completed with errors");
        for edit in report.edits.iter().filter(|e| !e.success()) {
            println!("  {}", describe_edit(edit));
        }
    }
    if report.diagnostics > 0 {
        println!("{} backend error(s) were reported above.", report.diagnostics);
    }
}

/// Print `err` with a remediation hint and pick the exit status.
fn report_error(err: &CoreError) -> u8 {
    if matches!(err, CoreError::Cancelled) {
        eprintln!("\nTask cancelled by user");
        return EXIT_CANCELLED;
    }
    eprintln!("✗ {err}");
    if let Some(hint) = err.remediation() {
        eprintln!("  {hint}");
    }
    EXIT_FAILURE
}
