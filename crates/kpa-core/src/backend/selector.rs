use std::fmt;
use std::str::FromStr;

use tracing::{debug, info, instrument};

use super::{
    Backend, BackendOptions, GROQ_BASE_URL, GROQ_DEFAULT_MODEL, HostedBackend, OPENAI_BASE_URL,
    OPENAI_DEFAULT_MODEL, OllamaBackend,
};
use crate::CoreError;

/// Provider names accepted as a backend mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    Ollama,
    OpenAi,
    Groq,
}

/// Order in which `auto` mode tries providers: hosted first, local last.
pub const AUTO_ORDER: [BackendKind; 3] = [BackendKind::Groq, BackendKind::OpenAi, BackendKind::Ollama];

impl BackendKind {
    pub fn name(self) -> &'static str {
        match self {
            Self::Ollama => "ollama",
            Self::OpenAi => "openai",
            Self::Groq => "groq",
        }
    }

    /// Construct this provider. No network traffic happens here.
    pub fn construct(self, options: &BackendOptions) -> Result<Backend, CoreError> {
        Ok(match self {
            Self::Ollama => Backend::Ollama(OllamaBackend::new(options)?),
            Self::OpenAi => Backend::OpenAi(HostedBackend::new(
                options.openai_base_url.as_deref().unwrap_or(OPENAI_BASE_URL),
                options.model.as_deref().unwrap_or(OPENAI_DEFAULT_MODEL),
                options.openai_api_key.clone(),
            )?),
            Self::Groq => Backend::Groq(HostedBackend::new(
                options.groq_base_url.as_deref().unwrap_or(GROQ_BASE_URL),
                options.model.as_deref().unwrap_or(GROQ_DEFAULT_MODEL),
                options.groq_api_key.clone(),
            )?),
        })
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for BackendKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ollama" => Ok(Self::Ollama),
            "openai" => Ok(Self::OpenAi),
            "groq" => Ok(Self::Groq),
            other => Err(CoreError::Configuration(format!(
                "unknown backend '{other}' (expected auto, ollama, openai or groq)"
            ))),
        }
    }
}

/// Resolve `mode` to a constructed backend.
///
/// A provider name is constructed without probing; readiness is checked by
/// the caller. `auto` tries [`AUTO_ORDER`] and returns the first provider that
/// constructs and probes available.
#[instrument(skip(options))]
pub async fn select(mode: &str, options: &BackendOptions) -> Result<Backend, CoreError> {
    if !mode.trim().eq_ignore_ascii_case("auto") {
        let kind: BackendKind = mode.parse()?;
        let backend = kind.construct(options)?;
        info!(backend = kind.name(), model = backend.model(), "using requested backend");
        return Ok(backend);
    }

    for kind in AUTO_ORDER {
        let backend = match kind.construct(options) {
            Ok(backend) => backend,
            Err(e) => {
                debug!(backend = kind.name(), error = %e, "backend construction failed");
                continue;
            }
        };
        if backend.probe().await {
            info!(backend = kind.name(), model = backend.model(), "auto-selected backend");
            return Ok(backend);
        }
        debug!(backend = kind.name(), "backend not available");
    }

    let tried: Vec<&str> = AUTO_ORDER.iter().map(|k| k.name()).collect();
    Err(CoreError::NoBackendAvailable(format!("tried {}", tried.join(", "))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::test_server::{closed_url, serve};

    #[tokio::test]
    async fn test_should_prefer_groq_when_all_available() {
        let (ollama, _rx) = serve(200, "application/json", r#"{"models":[]}"#.into()).await;
        let options = BackendOptions::builder()
            .ollama_url(ollama)
            .openai_api_key("sk-test")
            .groq_api_key("gsk-test")
            .build();

        let backend = select("auto", &options).await.expect("should select");
        assert_eq!(backend.kind(), BackendKind::Groq);
        assert_eq!(backend.model(), GROQ_DEFAULT_MODEL);
    }

    #[tokio::test]
    async fn test_should_fall_back_to_openai_then_ollama() {
        let (ollama, _rx) = serve(200, "application/json", r#"{"models":[]}"#.into()).await;

        let options = BackendOptions::builder()
            .ollama_url(ollama.clone())
            .openai_api_key("sk-test")
            .build();
        let backend = select("auto", &options).await.expect("should select");
        assert_eq!(backend.kind(), BackendKind::OpenAi);

        let options = BackendOptions::builder().ollama_url(ollama).build();
        let backend = select("auto", &options).await.expect("should select");
        assert_eq!(backend.kind(), BackendKind::Ollama);
    }

    #[tokio::test]
    async fn test_should_fail_when_nothing_available() {
        let options = BackendOptions::builder().ollama_url(closed_url().await).build();
        let err = select("auto", &options).await.expect_err("should fail");
        assert!(matches!(err, CoreError::NoBackendAvailable(_)));
        assert!(err.to_string().contains("groq, openai, ollama"));
        assert!(err.remediation().is_some());
    }

    #[tokio::test]
    async fn test_should_reject_unknown_mode() {
        let err = select("claude", &BackendOptions::default())
            .await
            .expect_err("should fail");
        assert!(matches!(err, CoreError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_should_construct_named_backend_without_probing() {
        let backend = select("OpenAI", &BackendOptions::default())
            .await
            .expect("should construct");
        assert_eq!(backend.kind(), BackendKind::OpenAi);
        assert!(!backend.probe().await);
    }

    #[test]
    fn test_should_apply_model_override() {
        let options = BackendOptions::builder().model("llama3").build();
        let backend = BackendKind::Groq.construct(&options).expect("should construct");
        assert_eq!(backend.model(), "llama3");
    }

    #[test]
    fn test_should_parse_kind_names() {
        assert_eq!("groq".parse::<BackendKind>().ok(), Some(BackendKind::Groq));
        assert_eq!(" Ollama ".parse::<BackendKind>().ok(), Some(BackendKind::Ollama));
        assert!("auto".parse::<BackendKind>().is_err());
    }
}
