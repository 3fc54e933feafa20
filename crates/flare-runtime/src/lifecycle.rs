use std::path::Path;
use std::sync::Arc;

use orion_error::op_context;
use orion_error::prelude::*;
use orion_error::ErrorOweBase;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use flare_chain::MorphoFetcher;
use flare_config::FlareConfig;
use flare_core::{MemSignalStore, Notifier, NotifierConfig, SignalStore};
use flare_dsl::{MetricRegistry, Signal, compile, validate_signal};

use crate::error::{RuntimeReason, RuntimeResult};
use crate::queue::JobQueue;
use crate::scheduler::run_scheduler;
use crate::worker::{CompiledCache, WorkerContext, run_worker};

// ---------------------------------------------------------------------------
// TaskGroup — named collection of async tasks for ordered shutdown
// ---------------------------------------------------------------------------

/// A named group of async tasks that are shut down together.
///
/// Groups are assembled in *start order* and joined in *reverse order*
/// (LIFO) during shutdown:
///
///   start:  workers → scheduler
///   join:   scheduler → workers
///
/// The producer stops first, so no new jobs arrive while the workers wind
/// down.
pub(crate) struct TaskGroup {
    name: &'static str,
    handles: Vec<JoinHandle<anyhow::Result<()>>>,
}

impl TaskGroup {
    fn new(name: &'static str) -> Self {
        Self {
            name,
            handles: Vec::new(),
        }
    }

    fn push(&mut self, handle: JoinHandle<anyhow::Result<()>>) {
        self.handles.push(handle);
    }

    /// Join all tasks in this group, returning the first error.
    async fn wait(self) -> RuntimeResult<()> {
        for handle in self.handles {
            handle
                .await
                .map_err(|e| {
                    StructError::from(RuntimeReason::Shutdown)
                        .with_detail(format!("task join error: {e}"))
                })?
                .owe(RuntimeReason::Shutdown)?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Runtime — the top-level lifecycle handle
// ---------------------------------------------------------------------------

pub struct Runtime {
    cancel: CancellationToken,
    groups: Vec<TaskGroup>,
}

impl Runtime {
    /// Bootstrap the engine: load and validate signal definitions, build the
    /// store/fetcher/notifier, then spawn the worker pool and the scheduler.
    ///
    /// `base_dir` is the config file's directory, for resolving the signal
    /// definitions glob.
    #[tracing::instrument(name = "runtime.start", skip_all)]
    pub async fn start(config: FlareConfig, base_dir: &Path) -> RuntimeResult<Self> {
        let mut op = op_context!("runtime-bootstrap").with_auto_log();
        op.record("base_dir", base_dir.display().to_string().as_str());

        let cancel = CancellationToken::new();

        // Phase 1: load config artifacts
        let signals = load_signals(&config.signals.definitions, base_dir)?;
        for signal in &signals {
            for chain_id in &signal.chains {
                if !config.chains.iter().any(|c| c.chain_id == *chain_id) {
                    fl_warn!(conf, signal_id = %signal.id, chain = *chain_id,
                        "signal references a chain with no RPC configured");
                }
            }
        }

        let signal_count = signals.len();
        let store: Arc<MemSignalStore> = Arc::new(MemSignalStore::from_signals(signals));
        let fetcher = MorphoFetcher::new(&config.chains).owe(RuntimeReason::Bootstrap)?;
        let notifier = Notifier::new(NotifierConfig {
            secret: config.webhook.secret.clone(),
            timeout: config.webhook.timeout(),
            max_retries: config.webhook.max_retries,
        })
        .err_conv()?;
        let queue = Arc::new(JobQueue::new());

        fl_info!(sys,
            signals = signal_count,
            chains = config.chains.len(),
            workers = config.scheduler.workers,
            "runtime bootstrap complete"
        );

        // Phase 2: spawn task groups (start order: workers → scheduler)
        let ctx = Arc::new(WorkerContext {
            store: Arc::clone(&store) as Arc<dyn SignalStore>,
            fetcher: Arc::new(fetcher),
            notifier: Arc::new(notifier),
            queue: Arc::clone(&queue),
            cache: CompiledCache::default(),
            chain_semaphore: Arc::new(Semaphore::new(config.scheduler.chain_parallelism)),
            job_deadline: config.scheduler.job_deadline.as_duration(),
        });

        let mut groups: Vec<TaskGroup> = Vec::with_capacity(2);

        let mut worker_group = TaskGroup::new("workers");
        for _ in 0..config.scheduler.workers {
            worker_group.push(tokio::spawn(run_worker(
                Arc::clone(&ctx),
                cancel.child_token(),
            )));
        }
        groups.push(worker_group);

        let mut scheduler_group = TaskGroup::new("scheduler");
        scheduler_group.push(tokio::spawn(run_scheduler(
            Arc::clone(&store) as Arc<dyn SignalStore>,
            queue,
            config.scheduler.tick_interval.as_duration(),
            cancel.child_token(),
        )));
        groups.push(scheduler_group);

        op.mark_suc();
        Ok(Self { cancel, groups })
    }

    /// Request graceful shutdown of all tasks.
    pub fn shutdown(&self) {
        fl_info!(sys, "initiating graceful shutdown");
        self.cancel.cancel();
    }

    /// Wait for all task groups to complete after shutdown, in LIFO order:
    /// scheduler → workers.
    pub async fn wait(mut self) -> RuntimeResult<()> {
        while let Some(group) = self.groups.pop() {
            let name = group.name;
            fl_debug!(sys, task_group = name, "waiting for task group to finish");
            group.wait().await?;
            fl_debug!(sys, task_group = name, "task group finished");
        }
        Ok(())
    }

    /// Returns a clone of the root cancellation token (for signal integration).
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

// ---------------------------------------------------------------------------
// Signal definition loading
// ---------------------------------------------------------------------------

/// Load, parse, validate and pre-compile every signal definition file
/// matching `pattern`. A single bad definition aborts startup with its
/// field tag — an engine silently running a subset of its signals is worse
/// than one that refuses to start.
pub fn load_signals(pattern: &str, base_dir: &Path) -> RuntimeResult<Vec<Signal>> {
    let full = if Path::new(pattern).is_absolute() {
        pattern.to_string()
    } else {
        base_dir.join(pattern).display().to_string()
    };

    let paths = glob::glob(&full).map_err(|e| {
        StructError::from(RuntimeReason::SignalLoad)
            .with_detail(format!("bad signals glob {full:?}: {e}"))
    })?;

    let mut signals: Vec<Signal> = Vec::new();
    for entry in paths {
        let path = entry.map_err(|e| {
            StructError::from(RuntimeReason::SignalLoad).with_detail(format!("signals glob: {e}"))
        })?;
        let content = std::fs::read_to_string(&path).map_err(|e| {
            StructError::from(RuntimeReason::SignalLoad)
                .with_detail(format!("read {}: {e}", path.display()))
        })?;
        let signal: Signal = serde_json::from_str(&content).map_err(|e| {
            StructError::from(RuntimeReason::SignalLoad)
                .with_detail(format!("{}: {e}", path.display()))
        })?;
        validate_signal(&signal, MetricRegistry::global()).map_err(|e| {
            StructError::from(RuntimeReason::SignalLoad)
                .with_detail(format!("{}: {e}", path.display()))
        })?;
        compile(&signal, MetricRegistry::global()).map_err(|e| {
            StructError::from(RuntimeReason::SignalLoad)
                .with_detail(format!("{}: {e}", path.display()))
        })?;
        if signals.iter().any(|s| s.id == signal.id) {
            return Err(StructError::from(RuntimeReason::SignalLoad)
                .with_detail(format!("{}: duplicate signal id `{}`", path.display(), signal.id)));
        }
        signals.push(signal);
    }
    Ok(signals)
}

// ---------------------------------------------------------------------------
// OS signal integration
// ---------------------------------------------------------------------------

pub async fn wait_for_signal(cancel: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to listen for SIGTERM");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                fl_info!(sys, signal = "SIGINT", "received signal, initiating graceful shutdown");
            }
            _ = sigterm.recv() => {
                fl_info!(sys, signal = "SIGTERM", "received signal, initiating graceful shutdown");
            }
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to listen for Ctrl-C");
        fl_info!(sys, "received shutdown signal, initiating graceful shutdown");
    }
    cancel.cancel();
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
