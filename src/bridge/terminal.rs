// src/bridge/terminal.rs - Line-buffered terminal scrollback
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalSnapshot {
    pub lines: Vec<String>,
    /// Text after the last newline, not yet a complete line.
    pub partial: String,
}

/// Bounded scrollback of device output.
#[derive(Debug)]
pub struct TerminalBuffer {
    lines: VecDeque<String>,
    partial: Vec<u8>,
    max_lines: usize,
}

impl TerminalBuffer {
    pub fn new(max_lines: usize) -> Self {
        Self { lines: VecDeque::new(), partial: Vec::new(), max_lines: max_lines.max(1) }
    }

    /// Append raw device bytes; returns the lines completed by them.
    ///
    /// `\r\n` and `\n` end a line, stray `\r` and the raw REPL's `\x04` are dropped.
    pub fn push_bytes(&mut self, bytes: &[u8]) -> Vec<String> {
        let mut completed = Vec::new();
        for &b in bytes {
            match b {
                b'\n' => {
                    let line = String::from_utf8_lossy(&self.partial).into_owned();
                    self.partial.clear();
                    self.push_line(line.clone());
                    completed.push(line);
                }
                b'\r' | 0x04 => {}
                b => self.partial.push(b),
            }
        }
        completed
    }

    fn push_line(&mut self, line: String) {
        if self.lines.len() == self.max_lines {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
    }

    pub fn clear(&mut self) {
        self.lines.clear();
        self.partial.clear();
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty() && self.partial.is_empty()
    }

    pub fn snapshot(&self) -> TerminalSnapshot {
        TerminalSnapshot {
            lines: self.lines.iter().cloned().collect(),
            partial: String::from_utf8_lossy(&self.partial).into_owned(),
        }
    }
}
