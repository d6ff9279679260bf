//! Runs (or resumes) one optimization run described by a JSON file.
//!
//! ```text
//! rondo-run <run.json> [state-dir]
//! ```
//!
//! Evaluations use the local `echo` calculation, which returns input `x` as
//! output `result`. State lives in `<state-dir>/state.json` (default
//! `.rondo`), task statuses included. A run with a fixed `id` picks up where
//! it stopped when the same file is run again; without one every invocation
//! starts afresh. Tasks that finished before the process stopped are
//! collected on resume. Tasks that were still running are lost with it and
//! fail the run.

use anyhow::Context;
use rd_engine::EngineRegistry;
use rd_types::EchoResult;
use rd_workflow::{Controller, FileStore, LocalDispatcher, RunConfig};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut args = std::env::args().skip(1);
    let config_path = args
        .next()
        .context("usage: rondo-run <run.json> [state-dir]")?;
    let state_dir = PathBuf::from(args.next().unwrap_or_else(|| ".rondo".to_string()));

    let run = RunConfig::from_file(&config_path)
        .with_context(|| format!("failed to load run config from {config_path}"))?;
    let store = FileStore::open(state_dir.join("state.json"))
        .map(Arc::new)
        .with_context(|| format!("failed to open state in {}", state_dir.display()))?;
    let dispatcher = LocalDispatcher::new()
        .with_calculation("echo", Arc::new(EchoResult))
        .with_journal(store.clone());

    let mut controller =
        Controller::load_or_create(run, &EngineRegistry::with_builtins(), store, dispatcher)?;
    info!("Driving run {}", controller.run_id());

    let outputs = controller
        .run_to_completion(Duration::from_millis(10))
        .await?;
    println!("{}", serde_json::to_string_pretty(&outputs)?);
    Ok(())
}
