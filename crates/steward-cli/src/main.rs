//! Steward CLI - autonomous delivery-pipeline orchestration
//!
//! Usage:
//!   steward                     Run the pipeline for the current project
//!   steward --phase 2           Work only on phase 2, then stop
//!   steward --dry-run           Print the next recommended action and exit
//!   steward --project <DIR>     Run against a different project directory

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use steward_agent::SessionManager;
use steward_bridge::{flush_notifications, ApprovalManager, BotClient, ControlBridge};
use steward_core::config::{self, StewardConfig, StewardPaths};
use steward_core::manifest::{FailureEntry, ManifestStore, PipelineCommand, Resolution};
use steward_core::{hooks, taxonomy, StewardError};
use steward_orchestrator::{
    next_action, BudgetCalculator, DriftRunner, NextAction, PhaseRunner, RunOutcome,
};
use steward_runtime::{
    HeartbeatWriter, InstanceRegistry, LockManager, RegistryInstance, SignalChannel,
};
use steward_vcs::{CheckpointManager, GitCommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "steward")]
#[command(author, version, about = "Autonomous delivery-pipeline orchestrator")]
struct Cli {
    /// Project directory (defaults to STEWARD_PROJECT_ROOT, then cwd)
    #[arg(short, long)]
    project: Option<PathBuf>,

    /// Work only on this phase, then stop
    #[arg(long)]
    phase: Option<u32>,

    /// Print the next recommended action without doing anything
    #[arg(long)]
    dry_run: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let project_root = config::resolve_project_root(cli.project)?;
    let settings = StewardConfig::load(&project_root)
        .with_context(|| format!("loading config for {}", project_root.display()))?;
    let paths = StewardPaths::new(&project_root);
    std::fs::create_dir_all(&paths.steward_dir)
        .with_context(|| format!("creating {}", paths.steward_dir.display()))?;

    if cli.dry_run {
        return dry_run(&paths, &settings);
    }

    config::verify_agent_auth().context("agent credentials missing")?;

    // Singleton per project
    let lock = LockManager::new(paths.lock_file());
    if let Some(pid) = lock.check_for_running_instance()? {
        bail!(
            "another steward instance (pid {}) is already running for {}",
            pid,
            project_root.display()
        );
    }
    lock.acquire(&project_root)?;

    // Cross-project registry and bot-ownership election
    let registry = Arc::new(InstanceRegistry::new(StewardPaths::registry_file()));
    registry.register_instance(RegistryInstance::for_current_process(&project_root))?;
    let is_bot_owner = registry.claim_bot_ownership(&project_root)?;
    info!(
        "Registered instance for {} (bot owner: {})",
        project_root.display(),
        is_bot_owner
    );

    let store = Arc::new(ManifestStore::new(paths.manifest()));
    let heartbeat = HeartbeatWriter::new(
        registry.clone(),
        store.clone(),
        &project_root,
        Duration::from_secs(settings.heartbeat_interval_secs),
    );
    let (heartbeat_handle, heartbeat_stop) = heartbeat.spawn();

    let bridge_stop = CancellationToken::new();
    if is_bot_owner {
        spawn_bridge(&settings, &paths, &project_root, store.clone(), bridge_stop.clone());
    }

    let runner = build_runner(store.clone(), &settings, &paths, &project_root, cli.phase);

    // The runner gets its own task so a panic inside it still reaches the
    // teardown below instead of unwinding past it
    let mut runner_task = tokio::spawn(async move { runner.run().await });
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("installing SIGTERM handler")?;

    let outcome = tokio::select! {
        joined = &mut runner_task => match joined {
            Ok(outcome) => outcome,
            Err(e) if e.is_panic() => Err(StewardError::Phase(format!(
                "pipeline task panicked: {}",
                panic_message(e)
            ))),
            Err(e) => Err(StewardError::Phase(format!("pipeline task failed: {}", e))),
        },
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupt received, shutting down");
            runner_task.abort();
            Ok(RunOutcome::ShutdownRequested)
        }
        _ = sigterm.recv() => {
            info!("SIGTERM received, shutting down");
            runner_task.abort();
            Ok(RunOutcome::ShutdownRequested)
        }
    };

    // Ordered best-effort teardown: stop timers, remove the lock,
    // deregister, final heartbeat (written by the heartbeat task on cancel)
    bridge_stop.cancel();
    heartbeat_stop.cancel();
    let _ = heartbeat_handle.await;
    lock.release();
    if let Err(e) = registry.deregister(&project_root) {
        warn!("Deregistration failed: {}", e);
    }

    match outcome {
        Ok(RunOutcome::Completed) => {
            info!("Pipeline complete");
            Ok(())
        }
        Ok(RunOutcome::Blocked) => {
            bail!("pipeline blocked; see the latest notification for what to fix")
        }
        Ok(RunOutcome::ShutdownRequested) => {
            info!("Stopped by request");
            Ok(())
        }
        Err(e) => {
            record_crash(&store, &e.to_string());
            error!("Pipeline crashed: {}", e);
            Err(e.into())
        }
    }
}

/// Print the computed next action and its budget reasoning, touch nothing
fn dry_run(paths: &StewardPaths, settings: &StewardConfig) -> Result<()> {
    let store = ManifestStore::new(paths.manifest());
    let manifest = store.read()?;
    let action = next_action(&manifest, settings.freshness_window_days, Utc::now());
    println!("next action: {}", action);

    if let NextAction::RunStage { command, .. } | NextAction::Retry { command, .. } = &action {
        let budgets = BudgetCalculator::new(settings.budgets.clone());
        let budget = budgets.budget_for(*command, &Default::default());
        println!(
            "budget: {} turns, {}ms ({})",
            budget.max_turns, budget.timeout_ms, budget.reasoning
        );
    }
    Ok(())
}

fn build_runner(
    store: Arc<ManifestStore>,
    settings: &StewardConfig,
    paths: &StewardPaths,
    project_root: &Path,
    only_phase: Option<u32>,
) -> PhaseRunner<GitCommand> {
    let sessions = SessionManager::new(settings.agent.binary.clone(), project_root)
        .with_model(settings.agent.effective_model());
    PhaseRunner::new(
        store,
        CheckpointManager::new(GitCommand::new(project_root)),
        sessions,
        BudgetCalculator::new(settings.budgets.clone()),
        DriftRunner::new(project_root),
        SignalChannel::new(
            paths.signal_file(),
            Duration::from_secs(settings.signal_poll_secs),
        ),
        settings.freshness_window_days,
        project_root,
    )
    .with_only_phase(only_phase)
}

/// Start the control bridge and the notification flush loop, when the
/// channel is configured; silence otherwise
fn spawn_bridge(
    settings: &StewardConfig,
    paths: &StewardPaths,
    project_root: &Path,
    store: Arc<ManifestStore>,
    stop: CancellationToken,
) {
    let Ok(token) = std::env::var(&settings.bridge.bot_token_env) else {
        info!(
            "No {} set; running without the control bridge",
            settings.bridge.bot_token_env
        );
        return;
    };
    let Some(chat_id) = settings.bridge.chat_id else {
        info!("No bridge chat_id configured; running without the control bridge");
        return;
    };

    let approvals = ApprovalManager::new(Duration::from_secs(
        settings.bridge.approval_reminder_minutes * 60,
    ));
    let sessions = SessionManager::new(settings.agent.binary.clone(), project_root)
        .with_model(settings.agent.effective_model());
    let mut bridge = ControlBridge::new(
        BotClient::new(token.clone()).with_message_limit(settings.bridge.message_limit),
        chat_id,
        SignalChannel::new(
            paths.signal_file(),
            Duration::from_secs(settings.signal_poll_secs),
        ),
        store.clone(),
        approvals.clone(),
        sessions,
    );
    let control_stop = stop.clone();
    tokio::spawn(async move {
        if let Err(e) = bridge.run(control_stop).await {
            warn!("Control bridge stopped: {}", e);
        }
    });

    let notify_client =
        BotClient::new(token).with_message_limit(settings.bridge.message_limit);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(10));
        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = ticker.tick() => {
                    let flushed =
                        flush_notifications(&notify_client, chat_id, &store, &approvals).await;
                    if let Err(e) = flushed {
                        warn!("Notification flush failed: {}", e);
                    }
                }
            }
        }
    });
}

fn panic_message(e: tokio::task::JoinError) -> String {
    match e.try_into_panic() {
        Ok(payload) => payload
            .downcast_ref::<&str>()
            .map(|s| (*s).to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic payload".to_string()),
        Err(e) => e.to_string(),
    }
}

/// Persist a crash record and emit the structured error block so a wrapping
/// supervisor can parse what happened
fn record_crash(store: &ManifestStore, details: &str) {
    let category = taxonomy::classify(details);
    let write = store.update(|m| {
        m.failures.push(FailureEntry {
            command: PipelineCommand::Execute,
            phase: m.current_phase().unwrap_or(0),
            error_category: category,
            timestamp: Utc::now(),
            retry_count: 0,
            max_retries: 1,
            checkpoint: m.any_active_checkpoint().map(|c| c.tag.clone()),
            resolution: Resolution::Pending,
            details: details.to_string(),
        });
    });
    if let Err(e) = write {
        warn!("Could not persist crash record: {}", e);
    }

    let manifest = store.read().unwrap_or_default();
    let phase = manifest.current_phase().unwrap_or(0);
    let checkpoint = manifest.any_active_checkpoint().map(|c| c.tag.clone());
    eprintln!(
        "{}",
        hooks::render_error_block(
            category,
            PipelineCommand::Execute,
            phase,
            details,
            true,
            1,
            checkpoint.as_deref(),
        )
    );
}
