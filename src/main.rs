use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use conductor::cmd::{
    cmd_apply_learning, cmd_approve, cmd_cancel, cmd_learning_status, cmd_resume,
    cmd_revert_learning, cmd_run, cmd_status, cmd_view_learning_log, cmd_view_learning_stats,
};
use conductor::controller::ApprovalDecision;
use std::path::PathBuf;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "conductor")]
#[command(version, about = "Multi-agent delivery orchestrator")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Project directory holding conductor.toml and the state root.
    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    /// Emit command results as JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start a new workflow execution for a project
    Run { project: String },
    /// List executions, most recent first
    Status,
    /// Resume the most recently updated resumable execution
    Resume,
    /// Resolve an approval gate for an execution phase
    Approve {
        execution: Uuid,
        phase: usize,
        /// approve, reject or revise
        #[arg(value_parser = parse_decision)]
        decision: ApprovalDecision,
        #[arg(long)]
        feedback: Option<String>,
    },
    /// Cancel an active execution
    Cancel { execution: Uuid },
    /// Apply a validated fix proposal (all pending when no id is given)
    ApplyLearning {
        #[arg(long)]
        change_id: Option<String>,
        #[arg(long)]
        dry_run: bool,
    },
    /// Roll an applied fix back
    RevertLearning {
        change_id: String,
        #[arg(long)]
        reason: Option<String>,
    },
    /// Show the audit trail of learning decisions
    ViewLearningLog {
        #[arg(long)]
        limit: Option<usize>,
        /// pending, success, failed, rolled_back, rejected or blocked
        #[arg(long)]
        status: Option<String>,
    },
    /// Show aggregate learning statistics and the weekly report
    ViewLearningStats,
    /// Show the learning pipeline's posture
    LearningStatus,
}

fn parse_decision(s: &str) -> Result<ApprovalDecision, String> {
    match s {
        "approve" => Ok(ApprovalDecision::Approve),
        "reject" => Ok(ApprovalDecision::Reject),
        "revise" => Ok(ApprovalDecision::Revise),
        other => Err(format!(
            "invalid decision '{}'; expected approve, reject or revise",
            other
        )),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("conductor=debug"))
    } else {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("conductor=info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    let result = match &cli.command {
        Commands::Run { project } => cmd_run(&project_dir, project).await,
        Commands::Status => cmd_status(&project_dir).await,
        Commands::Resume => cmd_resume(&project_dir).await,
        Commands::Approve {
            execution,
            phase,
            decision,
            feedback,
        } => cmd_approve(&project_dir, *execution, *phase, *decision, feedback.clone()).await,
        Commands::Cancel { execution } => cmd_cancel(&project_dir, *execution).await,
        Commands::ApplyLearning { change_id, dry_run } => {
            cmd_apply_learning(&project_dir, change_id.as_deref(), *dry_run).await
        }
        Commands::RevertLearning { change_id, reason } => {
            cmd_revert_learning(&project_dir, change_id, reason.as_deref()).await
        }
        Commands::ViewLearningLog { limit, status } => {
            cmd_view_learning_log(&project_dir, *limit, status.as_deref()).await
        }
        Commands::ViewLearningStats => cmd_view_learning_stats(&project_dir).await,
        Commands::LearningStatus => cmd_learning_status(&project_dir).await,
    };

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        result.print();
    }

    if result.success {
        Ok(())
    } else {
        std::process::exit(1);
    }
}
