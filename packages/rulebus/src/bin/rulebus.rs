//! CLI for driving a rulebus engine from the terminal.
//!
//! `run` reads `<topic> <payload>` lines from stdin and prints every
//! publication and log record the engine produces. `definitions` prints the
//! retained device metadata.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rulebus::journal::{Journal, JournalEntry};
use rulebus::{
    load_devices, loopback_device, Engine, EngineBuilder, EngineConfig, InMemoryBus, LogSink,
    MessageBus, Runtime,
};
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "rulebus")]
#[command(about = "Control/rule dispatch engine over an in-memory bus")]
struct Cli {
    /// Print one JSON object per line instead of plain text
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Feed `<topic> <payload>` lines from stdin through the engine
    Run {
        /// Publish device definitions before reading input
        #[arg(long)]
        definitions: bool,
    },

    /// Print the device definition publications
    Definitions,
}

// ============================================================================
// JSON Output
// ============================================================================

#[derive(Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
enum Line<'a> {
    Publish {
        origin: String,
        topic: &'a str,
        payload: &'a str,
        qos: u8,
        retained: bool,
    },
    Log {
        level: &'a str,
        message: &'a str,
    },
}

fn output(entries: &[JournalEntry], json: bool) -> Result<()> {
    for entry in entries {
        if !json {
            println!("{entry}");
            continue;
        }
        let line = match entry {
            JournalEntry::Published(p) => Line::Publish {
                origin: p.origin.to_string(),
                topic: &p.topic,
                payload: &p.payload,
                qos: p.qos.level(),
                retained: p.retained,
            },
            JournalEntry::Logged(record) => Line::Log {
                level: record.level.as_str(),
                message: &record.message,
            },
        };
        println!("{}", serde_json::to_string(&line)?);
    }
    Ok(())
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,rulebus=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let config = EngineConfig::from_env().context("Failed to load configuration")?;

    match cli.command {
        Commands::Run { definitions } => cmd_run(config, definitions, cli.json).await,
        Commands::Definitions => cmd_definitions(config, cli.json),
    }
}

fn build_engine(config: EngineConfig, journal: &Journal) -> Result<Engine> {
    let mut builder = EngineBuilder::new(
        Arc::new(journal.clone()) as Arc<dyn MessageBus>,
        Arc::new(journal.clone()) as Arc<dyn LogSink>,
    )
    .with_device(loopback_device());

    if let Some(path) = &config.devices_file {
        let devices = load_devices(path)?;
        tracing::info!(count = devices.len(), path = %path.display(), "loaded devices");
        builder = builder.with_devices(devices);
    }

    let engine = builder
        .with_config(config)
        .with_fn_rule("announce gauge", "loopback/gauge", |ctx| {
            let message = format!("gauge set to {}", ctx.event().new);
            ctx.info(message);
            Ok(())
        })
        .with_fn_rule("loud button", "loopback/set_loud", |ctx| {
            ctx.info("set_loud button pressed");
            ctx.set("loopback", "gauge", 42)?;
            Ok(())
        })
        .with_fn_rule("silent button", "loopback/set_silent", |ctx| {
            ctx.info("set_silent button pressed");
            ctx.set_silent("loopback", "gauge", 84)?;
            Ok(())
        })
        .build()
        .context("Failed to build engine")?;
    Ok(engine)
}

// ============================================================================
// Commands
// ============================================================================

async fn cmd_run(config: EngineConfig, definitions: bool, json: bool) -> Result<()> {
    let bus = InMemoryBus::new();
    let journal = Journal::wrapping(Arc::new(bus.clone()));
    let engine = Arc::new(build_engine(config, &journal)?);

    if definitions {
        engine.publish_definitions()?;
        output(&journal.take(), json)?;
    }

    let handle = Runtime::new(engine, Arc::new(bus)).start()?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.context("Failed to read stdin")? {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let (topic, payload) = line.split_once(char::is_whitespace).unwrap_or((line, ""));

        if let Err(e) = handle.deliver(topic, payload.trim()).await {
            tracing::warn!(%topic, error = %e, "write rejected");
        }
        output(&journal.take(), json)?;
    }

    handle.shutdown().await;
    Ok(())
}

fn cmd_definitions(config: EngineConfig, json: bool) -> Result<()> {
    let journal = Journal::new();
    let engine = build_engine(config, &journal)?;
    engine.publish_definitions()?;
    output(&journal.take(), json)
}
