use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use flare_core::eval::{EvalContext, EvalError, EvalReport, evaluate_signal};
use flare_core::{DataFetcher, Notifier, Scope, SignalStore, StoreError, WebhookPayload};
use flare_dsl::compile::{CompileError, CompiledSignal};
use flare_dsl::{MetricRegistry, Signal, compile};

use crate::queue::{Job, JobQueue};

// ---------------------------------------------------------------------------
// CompiledCache
// ---------------------------------------------------------------------------

/// Per-process cache of compiled signals, revalidated by definition hash so
/// an admin edit takes effect on the next evaluation.
#[derive(Default)]
pub struct CompiledCache {
    inner: Mutex<HashMap<String, Arc<CompiledSignal>>>,
}

impl CompiledCache {
    pub fn get_or_compile(&self, signal: &Signal) -> Result<Arc<CompiledSignal>, CompileError> {
        let hash = signal.definition_hash();
        let mut map = self.inner.lock().expect("cache lock poisoned");
        if let Some(cached) = map.get(&signal.id)
            && cached.definition_hash == hash
        {
            return Ok(Arc::clone(cached));
        }
        let compiled = Arc::new(compile(signal, MetricRegistry::global())?);
        map.insert(signal.id.clone(), Arc::clone(&compiled));
        Ok(compiled)
    }
}

// ---------------------------------------------------------------------------
// WorkerContext
// ---------------------------------------------------------------------------

/// Shared dependencies of the worker pool.
pub struct WorkerContext {
    pub store: Arc<dyn SignalStore>,
    pub fetcher: Arc<dyn DataFetcher>,
    pub notifier: Arc<Notifier>,
    pub queue: Arc<JobQueue>,
    pub cache: CompiledCache,
    /// Caps concurrent per-chain evaluations across all jobs.
    pub chain_semaphore: Arc<Semaphore>,
    pub job_deadline: Duration,
}

/// Queue-level retries for jobs failing on a retryable fetch error. The next
/// scheduler tick re-enqueues the signal anyway, so this only smooths short
/// RPC hiccups.
const MAX_JOB_ATTEMPTS: u32 = 3;

#[derive(Debug)]
enum JobError {
    Retryable(EvalError),
    Compile(CompileError),
    Store(StoreError),
}

// ---------------------------------------------------------------------------
// Worker loop
// ---------------------------------------------------------------------------

/// One worker: pop, evaluate under the per-job deadline, release the signal.
#[tracing::instrument(name = "worker", skip_all)]
pub async fn run_worker(ctx: Arc<WorkerContext>, cancel: CancellationToken) -> anyhow::Result<()> {
    loop {
        tokio::select! {
            job = ctx.queue.pop() => {
                let signal_id = job.signal_id.clone();
                let result =
                    tokio::time::timeout(ctx.job_deadline, process_job(&ctx, &job)).await;
                ctx.queue.complete(&signal_id);
                match result {
                    Ok(Ok(())) => {}
                    Ok(Err(JobError::Retryable(e))) => schedule_retry(&ctx, job, e),
                    Ok(Err(JobError::Compile(e))) => {
                        fl_warn!(eval, signal_id = %signal_id, error = %e,
                            "signal failed to compile, dropping job");
                    }
                    Ok(Err(JobError::Store(e))) => {
                        fl_warn!(eval, signal_id = %signal_id, error = %e,
                            "store error, dropping job");
                    }
                    Err(_) => {
                        fl_warn!(eval, signal_id = %signal_id, deadline = ?ctx.job_deadline,
                            "job deadline exceeded, aborted without commit");
                    }
                }
            }
            _ = cancel.cancelled() => break,
        }
    }
    Ok(())
}

fn schedule_retry(ctx: &Arc<WorkerContext>, job: Job, error: EvalError) {
    let next = job.attempt + 1;
    if next >= MAX_JOB_ATTEMPTS {
        fl_warn!(eval, signal_id = %job.signal_id, error = %error, attempts = next,
            "retryable failure, attempts exhausted");
        return;
    }
    let delay = Duration::from_secs(1u64 << next);
    fl_debug!(eval, signal_id = %job.signal_id, attempt = next, delay = ?delay,
        "retryable failure, requeueing");
    let queue = Arc::clone(&ctx.queue);
    let signal_id = job.signal_id;
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        queue.push(Job {
            signal_id,
            attempt: next,
        });
    });
}

// ---------------------------------------------------------------------------
// Job processing
// ---------------------------------------------------------------------------

fn in_cooldown(signal: &Signal, now: DateTime<Utc>) -> bool {
    let Some(last) = signal.last_triggered_at else {
        return false;
    };
    now - last < chrono::Duration::minutes(i64::from(signal.cooldown_minutes))
}

async fn process_job(ctx: &WorkerContext, job: &Job) -> Result<(), JobError> {
    let Some(signal) = ctx
        .store
        .load(&job.signal_id)
        .await
        .map_err(JobError::Store)?
    else {
        fl_debug!(eval, signal_id = %job.signal_id, "signal vanished, dropping job");
        return Ok(());
    };
    if !signal.is_active {
        return Ok(());
    }

    let now = Utc::now();
    if in_cooldown(&signal, now) {
        ctx.store
            .mark_evaluated(&signal.id, now)
            .await
            .map_err(JobError::Store)?;
        fl_debug!(eval, signal_id = %signal.id, "cooldown active, skipping evaluation");
        return Ok(());
    }

    let compiled = ctx.cache.get_or_compile(&signal).map_err(JobError::Compile)?;

    let mut tripped = evaluate_chains(ctx, &signal, &compiled, now).await?;
    if tripped.is_empty() {
        ctx.store
            .mark_evaluated(&signal.id, now)
            .await
            .map_err(JobError::Store)?;
        return Ok(());
    }
    tripped.sort_unstable_by_key(|(chain_id, _)| *chain_id);
    let chains: Vec<u64> = tripped.iter().map(|(chain_id, _)| *chain_id).collect();
    let report = tripped.remove(0).1;

    // Commit before dispatch: cooldown gating holds regardless of delivery
    // outcome, turning at-least-once into at-most-one-notification-per-cooldown.
    ctx.store
        .mark_triggered(&signal.id, now)
        .await
        .map_err(JobError::Store)?;

    let payload = WebhookPayload {
        signal_id: signal.id.clone(),
        signal_name: signal.name.clone(),
        triggered_at: now,
        scope: Scope { chains },
        conditions_met: report.outcomes,
        context: serde_json::json!({}),
    };
    let outcome = ctx.notifier.dispatch(&signal.webhook_url, &payload).await;
    if outcome.success {
        fl_info!(notify, signal_id = %signal.id,
            status = outcome.status.unwrap_or_default(),
            attempts = outcome.attempts,
            duration_ms = outcome.duration_ms,
            "webhook delivered");
    } else {
        fl_warn!(notify, signal_id = %signal.id,
            error = outcome.error.as_deref().unwrap_or("unknown"),
            attempts = outcome.attempts,
            "webhook delivery failed; trigger stays committed");
    }
    Ok(())
}

/// Evaluate the signal on every chain in its scope, bounded by the chain
/// semaphore, and join before the trigger step.
///
/// Chain-fatal leaf errors (`NotFound` / `Schema`) drop that chain from the
/// result; the other chains still count. A retryable error fails the whole
/// job so the queue can retry it — nothing is committed.
async fn evaluate_chains(
    ctx: &WorkerContext,
    signal: &Signal,
    compiled: &Arc<CompiledSignal>,
    now: DateTime<Utc>,
) -> Result<Vec<(u64, EvalReport)>, JobError> {
    let mut join_set = JoinSet::new();
    for chain_id in signal.chains.clone() {
        let fetcher = Arc::clone(&ctx.fetcher);
        let compiled = Arc::clone(compiled);
        let semaphore = Arc::clone(&ctx.chain_semaphore);
        let window = signal.window.duration;
        join_set.spawn(async move {
            let _permit = semaphore.acquire().await.expect("semaphore closed");
            let eval_ctx = EvalContext::new(chain_id, now, window, fetcher.as_ref());
            let result = evaluate_signal(&compiled, &eval_ctx).await;
            (chain_id, result)
        });
    }

    let mut tripped = Vec::new();
    let mut retryable: Option<EvalError> = None;
    while let Some(joined) = join_set.join_next().await {
        match joined {
            Ok((chain_id, Ok(report))) => {
                if report.triggered {
                    tripped.push((chain_id, report));
                }
            }
            Ok((chain_id, Err(e))) => {
                if e.is_retryable() {
                    retryable = Some(e);
                } else {
                    fl_warn!(eval, chain = chain_id, error = %e,
                        "chain evaluation failed, omitted from scope");
                }
            }
            Err(e) => {
                fl_warn!(eval, error = %e, "chain evaluation task panicked");
            }
        }
    }

    if let Some(error) = retryable {
        return Err(JobError::Retryable(error));
    }
    Ok(tripped)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use flare_core::{FetchError, MemSignalStore, NotifierConfig};
    use flare_dsl::{Aggregation, Filter};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;

    /// Per-chain canned state values; missing chains yield `NotFound`,
    /// `Err` entries yield that error.
    struct MockFetcher {
        state: HashMap<u64, Result<f64, FetchError>>,
    }

    #[async_trait]
    impl DataFetcher for MockFetcher {
        async fn fetch_state(
            &self,
            chain_id: u64,
            _entity_type: &str,
            _filters: &[Filter],
            _field: &str,
            _at: DateTime<Utc>,
        ) -> Result<f64, FetchError> {
            self.state
                .get(&chain_id)
                .cloned()
                .unwrap_or_else(|| Err(FetchError::not_found(format!("chain {chain_id}"))))
        }

        async fn fetch_events(
            &self,
            chain_id: u64,
            _event_type: &str,
            _filters: &[Filter],
            _field: &str,
            _aggregation: Aggregation,
            _window_start: DateTime<Utc>,
            _window_end: DateTime<Utc>,
        ) -> Result<f64, FetchError> {
            self.state
                .get(&chain_id)
                .cloned()
                .unwrap_or_else(|| Err(FetchError::not_found(format!("chain {chain_id}"))))
        }
    }

    fn context(
        store: Arc<MemSignalStore>,
        fetcher: MockFetcher,
    ) -> Arc<WorkerContext> {
        Arc::new(WorkerContext {
            store,
            fetcher: Arc::new(fetcher),
            notifier: Arc::new(
                Notifier::new(NotifierConfig {
                    secret: String::new(),
                    timeout: Duration::from_millis(500),
                    max_retries: 0,
                })
                .unwrap(),
            ),
            queue: Arc::new(JobQueue::new()),
            cache: CompiledCache::default(),
            chain_semaphore: Arc::new(Semaphore::new(4)),
            job_deadline: Duration::from_secs(10),
        })
    }

    fn constant_signal(id: &str, webhook_url: &str, triggers: bool) -> Signal {
        let (left, right) = if triggers { (2.0, 1.0) } else { (0.0, 1.0) };
        serde_json::from_value(serde_json::json!({
            "id": id,
            "name": format!("{id} name"),
            "chains": [1],
            "window": { "duration": "1h" },
            "condition": {
                "left": { "type": "constant", "value": left },
                "operator": "gt",
                "right": { "type": "constant", "value": right }
            },
            "webhook_url": webhook_url,
            "cooldown_minutes": 60
        }))
        .unwrap()
    }

    fn state_signal(id: &str, webhook_url: &str, chains: &[u64]) -> Signal {
        serde_json::from_value(serde_json::json!({
            "id": id,
            "name": id,
            "chains": chains,
            "window": { "duration": "1h" },
            "condition": {
                "left": { "type": "state_ref", "entity_type": "market",
                          "field": "utilization", "snapshot": "current" },
                "operator": "gt",
                "right": { "type": "constant", "value": 0.5 }
            },
            "webhook_url": webhook_url,
            "cooldown_minutes": 0
        }))
        .unwrap()
    }

    /// Capture webhook bodies; serves 200 to `count` requests.
    async fn webhook_stub(count: usize) -> (String, JoinHandle<Vec<serde_json::Value>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/hook", listener.local_addr().unwrap());
        let handle = tokio::spawn(async move {
            let mut bodies = Vec::new();
            for _ in 0..count {
                let (mut stream, _) = listener.accept().await.unwrap();
                let mut buf = Vec::new();
                let mut tmp = [0u8; 4096];
                let body_start = loop {
                    let n = stream.read(&mut tmp).await.unwrap();
                    buf.extend_from_slice(&tmp[..n]);
                    if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                        break pos + 4;
                    }
                };
                let headers = String::from_utf8_lossy(&buf[..body_start]).to_ascii_lowercase();
                let content_length: usize = headers
                    .lines()
                    .find_map(|l| l.strip_prefix("content-length:"))
                    .and_then(|v| v.trim().parse().ok())
                    .unwrap_or(0);
                while buf.len() < body_start + content_length {
                    let n = stream.read(&mut tmp).await.unwrap();
                    buf.extend_from_slice(&tmp[..n]);
                }
                bodies.push(serde_json::from_slice(&buf[body_start..]).unwrap());
                stream
                    .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 0\r\nconnection: close\r\n\r\n")
                    .await
                    .unwrap();
                stream.shutdown().await.ok();
            }
            bodies
        });
        (url, handle)
    }

    #[tokio::test]
    async fn triggered_signal_commits_then_notifies() {
        let (url, handle) = webhook_stub(1).await;
        let store = Arc::new(MemSignalStore::from_signals([constant_signal(
            "sig-1", &url, true,
        )]));
        let ctx = context(Arc::clone(&store), MockFetcher { state: HashMap::new() });

        process_job(&ctx, &Job::new("sig-1")).await.unwrap();

        let loaded = store.load("sig-1").await.unwrap().unwrap();
        assert!(loaded.last_triggered_at.is_some());
        assert_eq!(loaded.last_evaluated_at, loaded.last_triggered_at);

        let bodies = handle.await.unwrap();
        assert_eq!(bodies.len(), 1);
        assert_eq!(bodies[0]["signal_id"], "sig-1");
        assert_eq!(bodies[0]["signal_name"], "sig-1 name");
        assert_eq!(bodies[0]["scope"]["chains"], serde_json::json!([1]));
        assert_eq!(bodies[0]["conditions_met"][0]["passed"], true);
    }

    #[tokio::test]
    async fn untriggered_signal_only_marks_evaluated() {
        let store = Arc::new(MemSignalStore::from_signals([constant_signal(
            "sig-1",
            "http://127.0.0.1:1/hook",
            false,
        )]));
        let ctx = context(Arc::clone(&store), MockFetcher { state: HashMap::new() });

        process_job(&ctx, &Job::new("sig-1")).await.unwrap();

        let loaded = store.load("sig-1").await.unwrap().unwrap();
        assert!(loaded.last_triggered_at.is_none());
        assert!(loaded.last_evaluated_at.is_some());
    }

    #[tokio::test]
    async fn cooldown_suppresses_notification_and_trigger_update() {
        let mut signal = constant_signal("sig-1", "http://127.0.0.1:1/hook", true);
        let half_way = Utc::now() - chrono::Duration::minutes(30);
        signal.last_triggered_at = Some(half_way);
        let store = Arc::new(MemSignalStore::from_signals([signal]));
        let ctx = context(Arc::clone(&store), MockFetcher { state: HashMap::new() });

        process_job(&ctx, &Job::new("sig-1")).await.unwrap();

        let loaded = store.load("sig-1").await.unwrap().unwrap();
        assert_eq!(loaded.last_triggered_at, Some(half_way), "trigger unchanged");
        assert!(loaded.last_evaluated_at.unwrap() > half_way, "evaluation recorded");
    }

    #[tokio::test]
    async fn expired_cooldown_retriggers_even_when_delivery_fails() {
        // Webhook endpoint is unreachable; the trigger must still commit.
        let mut signal = constant_signal("sig-1", "http://127.0.0.1:1/hook", true);
        let long_ago = Utc::now() - chrono::Duration::minutes(90);
        signal.last_triggered_at = Some(long_ago);
        let store = Arc::new(MemSignalStore::from_signals([signal]));
        let ctx = context(Arc::clone(&store), MockFetcher { state: HashMap::new() });

        process_job(&ctx, &Job::new("sig-1")).await.unwrap();

        let loaded = store.load("sig-1").await.unwrap().unwrap();
        assert!(loaded.last_triggered_at.unwrap() > long_ago);
    }

    #[tokio::test]
    async fn chain_fatal_errors_drop_only_that_chain() {
        let (url, handle) = webhook_stub(1).await;
        let store = Arc::new(MemSignalStore::from_signals([state_signal(
            "sig-1",
            &url,
            &[1, 137],
        )]));
        let fetcher = MockFetcher {
            state: HashMap::from([
                (1, Ok(0.9)),
                (137, Err(FetchError::not_found("market missing"))),
            ]),
        };
        let ctx = context(Arc::clone(&store), fetcher);

        process_job(&ctx, &Job::new("sig-1")).await.unwrap();

        let bodies = handle.await.unwrap();
        assert_eq!(bodies[0]["scope"]["chains"], serde_json::json!([1]));
    }

    #[tokio::test]
    async fn retryable_fetch_error_fails_the_job_without_commit() {
        let store = Arc::new(MemSignalStore::from_signals([state_signal(
            "sig-1",
            "http://127.0.0.1:1/hook",
            &[1],
        )]));
        let fetcher = MockFetcher {
            state: HashMap::from([(1, Err(FetchError::retryable("rpc timeout")))]),
        };
        let ctx = context(Arc::clone(&store), fetcher);

        let err = process_job(&ctx, &Job::new("sig-1")).await.unwrap_err();
        assert!(matches!(err, JobError::Retryable(_)));

        let loaded = store.load("sig-1").await.unwrap().unwrap();
        assert!(loaded.last_triggered_at.is_none());
        assert!(loaded.last_evaluated_at.is_none());
    }

    #[tokio::test]
    async fn inactive_or_missing_signals_are_dropped() {
        let mut signal = constant_signal("sig-1", "http://127.0.0.1:1/hook", true);
        signal.is_active = false;
        let store = Arc::new(MemSignalStore::from_signals([signal]));
        let ctx = context(Arc::clone(&store), MockFetcher { state: HashMap::new() });

        process_job(&ctx, &Job::new("sig-1")).await.unwrap();
        process_job(&ctx, &Job::new("ghost")).await.unwrap();

        let loaded = store.load("sig-1").await.unwrap().unwrap();
        assert!(loaded.last_evaluated_at.is_none());
    }

    #[tokio::test]
    async fn compiled_cache_revalidates_on_definition_change() {
        let cache = CompiledCache::default();
        let signal = constant_signal("sig-1", "http://127.0.0.1:1/hook", true);
        let a = cache.get_or_compile(&signal).unwrap();
        let b = cache.get_or_compile(&signal).unwrap();
        assert!(Arc::ptr_eq(&a, &b), "unchanged definition hits the cache");

        let mut changed = signal.clone();
        changed.condition = Some(
            serde_json::from_value(serde_json::json!({
                "left": { "type": "constant", "value": 5.0 },
                "operator": "lt",
                "right": { "type": "constant", "value": 6.0 }
            }))
            .unwrap(),
        );
        let c = cache.get_or_compile(&changed).unwrap();
        assert!(!Arc::ptr_eq(&a, &c), "changed definition recompiles");
    }

    #[tokio::test]
    async fn worker_loop_processes_and_stops_on_cancel() {
        let (url, handle) = webhook_stub(1).await;
        let store = Arc::new(MemSignalStore::from_signals([constant_signal(
            "sig-1", &url, true,
        )]));
        let ctx = context(Arc::clone(&store), MockFetcher { state: HashMap::new() });
        let cancel = CancellationToken::new();

        let worker = tokio::spawn(run_worker(Arc::clone(&ctx), cancel.clone()));
        ctx.queue.push(Job::new("sig-1"));

        let bodies = handle.await.unwrap();
        assert_eq!(bodies.len(), 1);

        cancel.cancel();
        worker.await.unwrap().unwrap();
    }
}
