//! Edit extraction from model output.
//!
//! A block is an edit proposal when its opening fence carries a path
//! (```` ```python:src/app.py ```` or ```` ```:app.py ````) or when its first
//! line is a `# File: path` comment. Fences may be indented, as inside a list
//! item; the body loses the fence's indentation. The block ends at the first
//! line that is exactly a closing fence. Fences nested inside a block are not tracked; the
//! inner closing fence ends the outer block.

use std::path::PathBuf;

const FENCE: &str = "```";

/// One `(path, full replacement content)` pair proposed by the model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EditProposal {
    pub path: PathBuf,
    pub content: String,
}

/// Extract every tagged fenced block from `response`, in order.
///
/// Returns an empty vector when nothing is tagged, which is not an error.
pub fn extract_edits(response: &str) -> Vec<EditProposal> {
    let lines: Vec<&str> = response.lines().collect();
    let mut edits = Vec::new();
    let mut i = 0;

    while i < lines.len() {
        let Some(info) = opening_fence(lines[i]) else {
            i += 1;
            continue;
        };

        let (path, body_start) = match fence_path(info) {
            Some(path) => (Some(path), i + 1),
            None => match lines.get(i + 1).and_then(|l| file_comment_path(l)) {
                Some(path) => (Some(path), i + 2),
                None => (None, i + 1),
            },
        };

        let Some(close) = closing_fence(&lines, body_start) else {
            break;
        };

        if let Some(path) = path {
            let content = dedent(&lines[body_start..close], indent_of(lines[i]));
            edits.push(EditProposal {
                path: PathBuf::from(path),
                content: content.trim().to_owned(),
            });
        }
        i = close + 1;
    }

    edits
}

/// Body of the first fenced block in `response`, tagged or not.
pub fn first_fenced_block(response: &str) -> Option<String> {
    let lines: Vec<&str> = response.lines().collect();
    let open = lines.iter().position(|l| opening_fence(l).is_some())?;
    let close = closing_fence(&lines, open + 1)?;
    Some(dedent(&lines[open + 1..close], indent_of(lines[open])))
}

/// Info string of an opening fence line, e.g. `python:app.py`.
fn opening_fence(line: &str) -> Option<&str> {
    let info = line.trim().strip_prefix(FENCE)?;
    if info.contains('`') {
        return None;
    }
    Some(info.trim())
}

/// Path from an info string of the form `[lang]:path`.
fn fence_path(info: &str) -> Option<&str> {
    let (lang, path) = info.split_once(':')?;
    if !lang.chars().all(|c| c.is_alphanumeric() || c == '_') {
        return None;
    }
    valid_path(path.trim())
}

/// Path from a `# File: path` line.
fn file_comment_path(line: &str) -> Option<&str> {
    let rest = line.trim_start().strip_prefix('#')?;
    let rest = rest.trim_start().strip_prefix("File:")?;
    valid_path(rest.trim())
}

fn valid_path(path: &str) -> Option<&str> {
    (!path.is_empty() && !path.contains(char::is_whitespace)).then_some(path)
}

fn closing_fence(lines: &[&str], from: usize) -> Option<usize> {
    (from..lines.len()).find(|&j| lines[j].trim() == FENCE)
}

fn indent_of(line: &str) -> usize {
    line.len() - line.trim_start().len()
}

/// Join `lines`, removing up to `indent` leading whitespace bytes from each.
fn dedent(lines: &[&str], indent: usize) -> String {
    lines
        .iter()
        .map(|line| {
            let cut = indent.min(indent_of(line));
            &line[cut..]
        })
        .collect::<Vec<_>>()
        .join("\n")
}
