use ellie_core::text::truncate_chars;
use ellie_core::{ChatMessage, EllieError, Result};

/// Authors longer than this are truncated in prompt lines.
pub const MAX_AUTHOR_CHARS: usize = 64;

/// Characters of a line besides author and content: `[` + uuid + `] ` + `: ` + newline.
const LINE_OVERHEAD: usize = 1 + 36 + 2 + 2 + 1;

/// Partitions a contiguous message window into sub-windows whose prompt fits a
/// character budget. Order is preserved and no message is ever split.
#[derive(Debug, Clone)]
pub struct PromptWindowSplitter {
    budget: usize,
    header_chars: usize,
    max_content_chars: usize,
}

impl PromptWindowSplitter {
    /// Fails when the budget cannot hold the header plus one maximal line.
    pub fn new(budget: usize, header: &str, max_content_chars: usize) -> Result<Self> {
        let splitter = Self {
            budget,
            header_chars: header.chars().count(),
            max_content_chars,
        };
        let needed = splitter.header_chars + splitter.max_line_chars();
        if budget < needed {
            return Err(EllieError::ConfigValidation {
                field: "ingestion.window_char_budget".into(),
                reason: format!("budget {budget} cannot hold one message (needs at least {needed})"),
            });
        }
        Ok(splitter)
    }

    /// Upper bound on a formatted line, newline included.
    pub fn max_line_chars(&self) -> usize {
        LINE_OVERHEAD + MAX_AUTHOR_CHARS + self.max_content_chars
    }

    /// `[<id>] <author>: <content>` without trailing newline.
    pub fn format_line(&self, msg: &ChatMessage) -> String {
        format!(
            "[{}] {}: {}",
            msg.id,
            truncate_chars(msg.author.trim(), MAX_AUTHOR_CHARS),
            truncate_chars(msg.content.trim(), self.max_content_chars)
        )
    }

    /// The message lines of one sub-window, newline-terminated.
    pub fn render(&self, window: &[ChatMessage]) -> String {
        window.iter().fold(String::new(), |mut out, msg| {
            out.push_str(&self.format_line(msg));
            out.push('\n');
            out
        })
    }

    pub fn split<'a>(&self, messages: &'a [ChatMessage]) -> Vec<&'a [ChatMessage]> {
        let mut windows = Vec::new();
        let mut start = 0;
        let mut used = self.header_chars;

        for (idx, msg) in messages.iter().enumerate() {
            let line = self.format_line(msg).chars().count() + 1;
            if idx > start && used + line > self.budget {
                windows.push(&messages[start..idx]);
                start = idx;
                used = self.header_chars;
            }
            used += line;
        }
        if start < messages.len() {
            windows.push(&messages[start..]);
        }
        windows
    }
}
