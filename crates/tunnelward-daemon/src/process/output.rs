//! Client output parsing.

use std::collections::VecDeque;
use std::sync::LazyLock;

use regex::Regex;

/// Lines retained per run for failure classification.
pub const OUTPUT_TAIL_LINES: usize = 20;

static URL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)\b(?:https?|tcp)://[^\s"'<>\]\[]+"#).expect("static regex is valid")
});

/// Extract the first tunnel URL from an output line.
pub fn extract_url(line: &str) -> Option<String> {
    URL_RE.find(line).map(|m| {
        m.as_str()
            .trim_end_matches(['.', ',', ';', ')', '}'])
            .to_string()
    })
}

/// Bounded ring of the most recent output lines.
#[derive(Debug, Clone)]
pub struct OutputTail {
    lines: VecDeque<String>,
    capacity: usize,
}

impl Default for OutputTail {
    fn default() -> Self {
        Self::with_capacity(OUTPUT_TAIL_LINES)
    }
}

impl OutputTail {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, line: impl Into<String>) {
        if self.capacity == 0 {
            return;
        }
        if self.lines.len() == self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(line.into());
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines.iter().cloned().collect()
    }
}
