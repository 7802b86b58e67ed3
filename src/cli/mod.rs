//! CLI commands for agentmesh using clap.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use crate::config::{get_settings_path, load_settings, Settings};
use crate::ledger::Ledger;
use crate::mesh::{Mesh, SendReport};
use crate::protocol::MessageBuilder;
use crate::web::run_server;

/// agentmesh - agent-to-agent messaging, tasks, artifacts and checkpoints.
#[derive(Parser)]
#[command(name = "agentmesh")]
#[command(version)]
#[command(about = "agentmesh - agent-to-agent messaging and task orchestration", long_about = None)]
pub struct Commands {
    /// Settings file (defaults to ~/.agentmesh/settings.json)
    #[arg(long, global = true, env = "AGENTMESH_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the mesh and serve the HTTP API
    Serve {
        /// Bind host
        #[arg(long)]
        host: Option<String>,

        /// Bind port
        #[arg(short, long)]
        port: Option<u16>,

        /// Keep everything in memory
        #[arg(long)]
        ephemeral: bool,
    },

    /// Send a text message through a running server
    Send {
        /// Sender agent id
        #[arg(long, default_value = "cli")]
        from: String,

        /// Recipient agent id(s); omit to broadcast
        #[arg(long)]
        to: Vec<String>,

        /// Only deliver to agents with this capability
        #[arg(long)]
        capability: Option<String>,

        /// Time-to-live in milliseconds
        #[arg(long)]
        ttl_ms: Option<u64>,

        /// Message text
        text: String,

        /// Server base URL
        #[arg(long, default_value = "http://127.0.0.1:3333")]
        server: String,
    },

    /// Inspect the checkpoint ledger
    #[command(subcommand, alias = "cp")]
    Checkpoints(CheckpointCommand),

    /// Show the effective configuration
    Config,
}

#[derive(Subcommand)]
pub enum CheckpointCommand {
    /// List checkpoints, oldest first
    List {
        /// Only this task, agent or message id
        subject: Option<String>,
    },

    /// Show a full checkpoint
    Show {
        /// Checkpoint id
        id: String,
    },

    /// Delete checkpoints older than the given age
    Cleanup {
        /// Maximum age in seconds
        #[arg(long)]
        max_age_secs: u64,
    },

    /// Keep only the newest checkpoints per subject
    Prune {
        #[arg(long)]
        keep: usize,
    },
}

impl Commands {
    /// Run the command.
    pub async fn run(&self) -> Result<()> {
        let settings = load_settings(self.config.as_deref())?;
        match &self.command {
            Command::Serve {
                host,
                port,
                ephemeral,
            } => cmd_serve(settings, host.clone(), *port, *ephemeral).await,
            Command::Send {
                from,
                to,
                capability,
                ttl_ms,
                text,
                server,
            } => cmd_send(from, to, capability.as_deref(), *ttl_ms, text, server).await,
            Command::Checkpoints(cmd) => cmd_checkpoints(&settings, cmd),
            Command::Config => cmd_config(&settings, self.config.as_deref()),
        }
    }
}

// Command implementations

async fn cmd_serve(
    mut settings: Settings,
    host: Option<String>,
    port: Option<u16>,
    ephemeral: bool,
) -> Result<()> {
    if let Some(host) = host {
        settings.web.host = host;
    }
    if let Some(port) = port {
        settings.web.port = port;
    }
    let web = settings.web.clone();

    let mesh = if ephemeral {
        tracing::warn!("Running with in-memory storage; nothing survives a restart");
        Mesh::in_memory(settings)?
    } else {
        Mesh::open(settings)?
    };

    println!("agentmesh listening on http://{}:{}", web.host, web.port);
    run_server(mesh, &web).await
}

async fn cmd_send(
    from: &str,
    to: &[String],
    capability: Option<&str>,
    ttl_ms: Option<u64>,
    text: &str,
    server: &str,
) -> Result<()> {
    let mut builder = MessageBuilder::from(from).text(text);
    builder = if to.is_empty() {
        builder.broadcast()
    } else {
        builder.to_many(to.iter().cloned())
    };
    if let Some(ttl) = ttl_ms {
        builder = builder.ttl(Duration::from_millis(ttl));
    }
    let message = builder.build()?;

    let mut url = format!("{}/api/messages", server.trim_end_matches('/'));
    if let Some(capability) = capability {
        url.push_str("?capability=");
        url.push_str(capability);
    }

    let response = reqwest::Client::new()
        .post(&url)
        .header(reqwest::header::CONTENT_TYPE, "application/json")
        .body(message.serialize()?)
        .send()
        .await
        .with_context(|| format!("Failed to reach {}", server))?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        anyhow::bail!("Server rejected message ({}): {}", status, body);
    }

    let report: SendReport = response.json().await?;
    println!("Message {}", report.message_id);
    for receipt in &report.receipts {
        let status = if receipt.is_delivered() { "delivered" } else { "failed" };
        match &receipt.task_id {
            Some(task) => println!("  {} {} (task {})", receipt.recipient, status, task),
            None => println!("  {} {}", receipt.recipient, status),
        }
    }
    Ok(())
}

fn open_ledger(settings: &Settings) -> Result<Ledger> {
    let path = settings.storage.resolve_data_dir()?.join("ledger.db");
    if !path.exists() {
        anyhow::bail!("No ledger at {}", path.display());
    }
    Ok(Ledger::open(&path)?)
}

fn cmd_checkpoints(settings: &Settings, cmd: &CheckpointCommand) -> Result<()> {
    let ledger = open_ledger(settings)?;
    match cmd {
        CheckpointCommand::List { subject } => {
            let checkpoints = ledger.list_checkpoints(subject.as_deref())?;
            if checkpoints.is_empty() {
                println!("No checkpoints.");
            }
            for cp in checkpoints {
                let at = chrono::DateTime::from_timestamp_millis(cp.created_at)
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_else(|| cp.created_at.to_string());
                println!(
                    "{}  {:<28} #{:<4} {:<24} {}",
                    cp.id, cp.subject_id, cp.sequence, cp.recovery_point, at
                );
            }
        }
        CheckpointCommand::Show { id } => {
            let checkpoint = ledger.restore_checkpoint(id)?;
            println!("{}", serde_json::to_string_pretty(&checkpoint)?);
        }
        CheckpointCommand::Cleanup { max_age_secs } => {
            let deleted = ledger.cleanup_older_than(Duration::from_secs(*max_age_secs))?;
            println!("Deleted {} checkpoint(s).", deleted);
        }
        CheckpointCommand::Prune { keep } => {
            let deleted = ledger.prune(*keep)?;
            println!("Pruned {} checkpoint(s).", deleted);
        }
    }
    Ok(())
}

fn cmd_config(settings: &Settings, path: Option<&Path>) -> Result<()> {
    let path = match path {
        Some(p) => p.to_path_buf(),
        None => get_settings_path()?,
    };
    let source = if path.exists() { "file" } else { "defaults" };
    println!("# {} ({})", path.display(), source);
    println!("{}", serde_json::to_string_pretty(settings)?);
    Ok(())
}
