//! Seed changes from fenced code blocks in a task's context.
//!
//! A block's path comes from its info string (`ts src/app.ts`,
//! `ts:src/app.ts` or a bare `src/app.ts`) or from a leading `file:`
//! comment. A single unlabeled block maps to the single target file.

use std::sync::OnceLock;

use regex::Regex;

use super::task::{ChangeOperation, CodeChange};

fn file_comment() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^\s*(?://|#|--|/\*|<!--)\s*(?:file|path)\s*:\s*([^\s*]+)")
            .expect("valid regex")
    })
}

struct Block {
    path: Option<String>,
    content: String,
}

/// Extracts file changes from fenced code blocks.
///
/// Returns an empty list when the context has no usable block.
pub fn extract_code_changes(context: &str, target_files: &[String]) -> Vec<CodeChange> {
    let blocks = fenced_blocks(context);
    let unlabeled = blocks.iter().filter(|b| b.path.is_none()).count();
    let fallback = match (unlabeled, target_files) {
        (1, [single]) => Some(single.clone()),
        _ => None,
    };

    let mut changes: Vec<CodeChange> = Vec::new();
    for block in blocks {
        let Some(path) = block.path.or_else(|| fallback.clone()) else {
            continue;
        };
        let operation = if target_files.iter().any(|t| t == &path) {
            ChangeOperation::Edit
        } else {
            ChangeOperation::Create
        };
        let change = CodeChange {
            path,
            operation,
            content: block.content,
            reason: "provided in task context".to_string(),
        };
        match changes.iter_mut().find(|c| c.path == change.path) {
            Some(existing) => *existing = change,
            None => changes.push(change),
        }
    }

    if !changes.is_empty() {
        tracing::debug!(count = changes.len(), "extracted code changes from task context");
    }
    changes
}

fn fenced_blocks(text: &str) -> Vec<Block> {
    let mut blocks = Vec::new();
    let mut lines = text.lines();

    while let Some(line) = lines.next() {
        let trimmed = line.trim_start();
        let fence_len = trimmed.chars().take_while(|c| *c == '`').count();
        if fence_len < 3 {
            continue;
        }
        let fence = &trimmed[..fence_len];
        let info = trimmed[fence_len..].trim();

        let mut body: Vec<&str> = Vec::new();
        let mut closed = false;
        for inner in lines.by_ref() {
            let inner_trimmed = inner.trim();
            if inner_trimmed.starts_with(fence) && inner_trimmed.trim_start_matches('`').is_empty() {
                closed = true;
                break;
            }
            body.push(inner);
        }
        if !closed {
            break;
        }

        let mut path = path_from_info(info);
        if path.is_none() {
            if let Some(first) = body.first() {
                if let Some(caps) = file_comment().captures(first) {
                    path = Some(caps[1].trim_end_matches("-->").to_string());
                    body.remove(0);
                }
            }
        }

        let mut content = body.join("\n");
        content.push('\n');
        blocks.push(Block { path, content });
    }

    blocks
}

fn path_from_info(info: &str) -> Option<String> {
    if info.is_empty() {
        return None;
    }
    let candidate = match info.split_once(char::is_whitespace) {
        Some((_, rest)) => rest.trim(),
        None => match info.split_once(':') {
            Some((_, rest)) => rest.trim(),
            None => info,
        },
    };
    looks_like_path(candidate).then(|| candidate.to_string())
}

fn looks_like_path(candidate: &str) -> bool {
    !candidate.is_empty()
        && !candidate.contains(char::is_whitespace)
        && (candidate.contains('/') || candidate.contains('.'))
}
