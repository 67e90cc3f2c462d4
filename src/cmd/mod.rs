//! CLI command implementations.
//!
//! Each submodule owns one or more related `Commands` variants:
//!
//! | Module     | Commands handled                                          |
//! |------------|-----------------------------------------------------------|
//! | `run`      | `Run`, `Status`, `Resume`, `Approve`, `Cancel`            |
//! | `learning` | `ApplyLearning`, `RevertLearning`, `ViewLearningLog`,     |
//! |            | `ViewLearningStats`, `LearningStatus`                     |
//!
//! Every command returns the structured [`CommandResult`] envelope.

pub mod learning;
pub mod run;

pub use learning::{
    cmd_apply_learning, cmd_learning_status, cmd_revert_learning, cmd_view_learning_log,
    cmd_view_learning_stats,
};
pub use run::{cmd_approve, cmd_cancel, cmd_resume, cmd_run, cmd_status};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::time::Instant;

/// Structured result every command returns.
#[derive(Debug, Clone, Serialize)]
pub struct CommandResult {
    pub success: bool,
    pub command: String,
    pub message: String,
    pub data: Option<Value>,
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub duration_ms: u64,
}

impl CommandResult {
    pub fn ok(command: &str, message: impl Into<String>, data: Option<Value>, started: Instant) -> Self {
        Self {
            success: true,
            command: command.to_string(),
            message: message.into(),
            data,
            error: None,
            timestamp: Utc::now(),
            duration_ms: started.elapsed().as_millis() as u64,
        }
    }

    pub fn err(command: &str, error: impl std::fmt::Display, started: Instant) -> Self {
        Self {
            success: false,
            command: command.to_string(),
            message: String::new(),
            data: None,
            error: Some(error.to_string()),
            timestamp: Utc::now(),
            duration_ms: started.elapsed().as_millis() as u64,
        }
    }

    /// Render for a terminal: styled status line, message, pretty data.
    pub fn print(&self) {
        if self.success {
            println!(
                "{} {}",
                console::style("ok").green().bold(),
                console::style(&self.command).dim()
            );
            if !self.message.is_empty() {
                println!("{}", self.message);
            }
            if let Some(ref data) = self.data {
                println!(
                    "{}",
                    serde_json::to_string_pretty(data).unwrap_or_else(|_| data.to_string())
                );
            }
        } else {
            println!(
                "{} {}",
                console::style("error").red().bold(),
                console::style(&self.command).dim()
            );
            if let Some(ref error) = self.error {
                println!("{}", error);
            }
        }
    }
}
