// src/ui.rs

//! Yes/no confirmation seam
//!
//! The deployer asks at most one question per invocation (whether to
//! uninstall before a downgrade). [`TerminalPrompt`] asks on stdin; when
//! stdin is not a terminal it answers with its configured default.

use std::io::{self, BufRead, IsTerminal, Write};
use tracing::warn;

pub trait UiService {
    /// Ask a yes/no question
    fn prompt(&self, message: &str) -> bool;
}

pub struct TerminalPrompt {
    /// Answer given without asking (`--yes` / `--no`)
    preset: Option<bool>,
}

impl TerminalPrompt {
    pub fn new() -> Self {
        Self { preset: None }
    }

    /// Always answer `answer` without reading stdin
    pub fn preset(answer: bool) -> Self {
        Self {
            preset: Some(answer),
        }
    }

    fn ask(&self, message: &str) -> io::Result<bool> {
        let mut stdout = io::stdout();
        write!(stdout, "{message} [y/N]: ")?;
        stdout.flush()?;

        let mut input = String::new();
        io::stdin().lock().read_line(&mut input)?;
        Ok(parse_answer(&input))
    }
}

impl Default for TerminalPrompt {
    fn default() -> Self {
        Self::new()
    }
}

impl UiService for TerminalPrompt {
    fn prompt(&self, message: &str) -> bool {
        if let Some(answer) = self.preset {
            return answer;
        }
        if !io::stdin().is_terminal() {
            warn!("{} (no terminal, answering no)", message);
            return false;
        }
        self.ask(message).unwrap_or_else(|e| {
            warn!("Failed to read answer: {}", e);
            false
        })
    }
}

fn parse_answer(input: &str) -> bool {
    matches!(input.trim().to_lowercase().as_str(), "y" | "yes")
}
