use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use drip_engine::{
  ConsoleTransport, DispatchConfig, Dispatcher, EngineConfig, EngineEvent, EngineRunner,
  FlowEngine, TimerScheduler,
};
use drip_flow::{FlowDoc, FlowGraph};
use drip_store::{MemoryStore, SqliteStore, Store};

/// Drip - a chat flow execution engine
#[derive(Parser)]
#[command(name = "drip")]
#[command(version, about, long_about = None)]
struct Cli {
  #[command(subcommand)]
  command: Commands,
}

#[derive(Subcommand)]
enum Commands {
  /// Validate a flow document and report graph errors
  Validate {
    /// Path to the flow file (JSON)
    flow_file: PathBuf,
  },

  /// Run a flow against one contact, taking replies from stdin
  Run {
    /// Path to the flow file (JSON)
    flow_file: PathBuf,

    /// The contact to start the flow for
    #[arg(long, default_value = "contact-1")]
    contact: String,

    /// SQLite database URL (e.g. sqlite://drip.db); in-memory when omitted
    #[arg(long)]
    db: Option<String>,

    /// Seed bindings as key=value pairs
    #[arg(long = "bind", value_name = "KEY=VALUE")]
    bindings: Vec<String>,
  },
}

#[tokio::main]
async fn main() -> Result<()> {
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
    .init();

  let cli = Cli::parse();
  match cli.command {
    Commands::Validate { flow_file } => validate(flow_file).await,
    Commands::Run {
      flow_file,
      contact,
      db,
      bindings,
    } => run(flow_file, contact, db, bindings).await,
  }
}

async fn load_doc(flow_file: &PathBuf) -> Result<FlowDoc> {
  let raw = tokio::fs::read_to_string(flow_file)
    .await
    .with_context(|| format!("failed to read flow file: {}", flow_file.display()))?;
  FlowDoc::from_json(&raw)
    .with_context(|| format!("failed to parse flow file: {}", flow_file.display()))
}

async fn validate(flow_file: PathBuf) -> Result<()> {
  let doc = load_doc(&flow_file).await?;
  match FlowGraph::from_doc(&doc) {
    Ok(graph) => {
      println!(
        "ok: {} v{} ({} nodes, entry {})",
        doc.id,
        doc.version,
        graph.node_count(),
        graph.entry()
      );
      Ok(())
    }
    Err(errors) => {
      for error in &errors {
        eprintln!("error at {}: {}", error.id, error.reason);
      }
      bail!("flow failed validation with {} error(s)", errors.len());
    }
  }
}

async fn run(
  flow_file: PathBuf,
  contact: String,
  db: Option<String>,
  raw_bindings: Vec<String>,
) -> Result<()> {
  let doc = load_doc(&flow_file).await?;
  let bindings = parse_bindings(&raw_bindings)?;

  let store: Arc<dyn Store> = match &db {
    Some(url) => Arc::new(
      SqliteStore::connect(url)
        .await
        .with_context(|| format!("failed to open database: {url}"))?,
    ),
    None => Arc::new(MemoryStore::new()),
  };

  let (tx, rx) = mpsc::unbounded_channel::<EngineEvent>();
  let scheduler = TimerScheduler::new(tx.clone());
  let dispatcher = Dispatcher::new(
    Arc::clone(&store),
    Arc::new(ConsoleTransport),
    DispatchConfig::default(),
  );
  let engine = Arc::new(FlowEngine::new(
    store,
    dispatcher,
    scheduler,
    EngineConfig::default(),
  ));

  engine.activate(&doc).await.with_context(|| {
    format!("flow {} failed validation; run `drip validate` for details", doc.id)
  })?;

  let runner = EngineRunner::new(Arc::clone(&engine), tx.clone(), rx);
  let cancel = CancellationToken::new();
  let runner_task = tokio::spawn(runner.start(cancel.clone()));

  engine
    .start_contact(&doc.id, &contact, bindings)
    .await
    .context("failed to start the contact")?;

  eprintln!("flow {} started for {contact}; type replies, Ctrl-D to quit", doc.id);
  let mut lines = BufReader::new(tokio::io::stdin()).lines();
  loop {
    tokio::select! {
      _ = tokio::signal::ctrl_c() => break,
      line = lines.next_line() => {
        let Some(line) = line.context("failed to read stdin")? else {
          break;
        };
        if line.trim().is_empty() {
          continue;
        }
        let _ = tx.send(EngineEvent::InboundMessage {
          contact_id: contact.clone(),
          body: line,
          received_at: chrono::Utc::now(),
        });
      }
    }
  }

  cancel.cancel();
  let _ = runner_task.await;
  Ok(())
}

fn parse_bindings(raw: &[String]) -> Result<HashMap<String, String>> {
  raw
    .iter()
    .map(|pair| {
      pair
        .split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .with_context(|| format!("invalid binding '{pair}', expected KEY=VALUE"))
    })
    .collect()
}
