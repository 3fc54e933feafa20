use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use flare_dsl::compile::{CompiledCondition, CompiledExpr, CompiledSignal};
use flare_dsl::{ArithOp, CompareOp, GroupLogic, Snapshot, WindowDuration};

use crate::fetch::{DataFetcher, FetchError};

// ---------------------------------------------------------------------------
// EvalContext
// ---------------------------------------------------------------------------

/// Everything one per-chain evaluation needs: the chain, the reference
/// instant, the resolved window, and the fetcher that turns leaves into
/// numbers.
pub struct EvalContext<'a> {
    pub chain_id: u64,
    pub now: DateTime<Utc>,
    pub window: Duration,
    pub window_start: DateTime<Utc>,
    pub fetcher: &'a dyn DataFetcher,
}

impl<'a> EvalContext<'a> {
    pub fn new(
        chain_id: u64,
        now: DateTime<Utc>,
        window: WindowDuration,
        fetcher: &'a dyn DataFetcher,
    ) -> Self {
        let window: Duration = window.into();
        let window_start = now - chrono::Duration::from_std(window).unwrap_or_default();
        Self {
            chain_id,
            now,
            window,
            window_start,
            fetcher,
        }
    }

    fn instant_for(&self, snapshot: Snapshot) -> DateTime<Utc> {
        match snapshot {
            Snapshot::Current => self.now,
            Snapshot::WindowStart => self.window_start,
            Snapshot::Offset(delta) => {
                self.now - chrono::Duration::from_std(delta.into()).unwrap_or_default()
            }
        }
    }
}

// ---------------------------------------------------------------------------
// EvalError
// ---------------------------------------------------------------------------

/// A leaf failed to resolve. Retryability is inherited from the fetch error:
/// transient transport faults retry the whole job; `NotFound`/`Schema` are
/// fatal for the enclosing chain only.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("leaf {leaf} on chain {chain_id}: {source}")]
pub struct EvalError {
    pub leaf: String,
    pub chain_id: u64,
    #[source]
    pub source: FetchError,
}

impl EvalError {
    pub fn is_retryable(&self) -> bool {
        self.source.is_retryable()
    }
}

// ---------------------------------------------------------------------------
// Expression evaluation
// ---------------------------------------------------------------------------

type EvalFuture<'a> = Pin<Box<dyn Future<Output = Result<f64, EvalError>> + Send + 'a>>;

/// Evaluate a compiled expression to a number.
///
/// Division by zero yields 0 by design: a transient missing denominator must
/// neither raise a false alert nor crash the worker. The occurrence is
/// logged.
pub fn evaluate_expr<'a>(expr: &'a CompiledExpr, ctx: &'a EvalContext<'a>) -> EvalFuture<'a> {
    Box::pin(async move {
        match expr {
            CompiledExpr::Constant { value } => Ok(*value),
            CompiledExpr::Binary { op, left, right } => {
                let l = evaluate_expr(left, ctx).await?;
                let r = evaluate_expr(right, ctx).await?;
                Ok(match op {
                    ArithOp::Add => l + r,
                    ArithOp::Sub => l - r,
                    ArithOp::Mul => l * r,
                    ArithOp::Div => {
                        if r == 0.0 {
                            tracing::warn!(
                                domain = "eval",
                                chain = ctx.chain_id,
                                numerator = l,
                                "division by zero, yielding 0"
                            );
                            0.0
                        } else {
                            l / r
                        }
                    }
                })
            }
            CompiledExpr::State {
                entity_type,
                filters,
                field,
                snapshot,
                ..
            } => {
                let at = ctx.instant_for(*snapshot);
                ctx.fetcher
                    .fetch_state(ctx.chain_id, entity_type, filters, field, at)
                    .await
                    .map_err(|source| EvalError {
                        leaf: format!("{entity_type}.{field}"),
                        chain_id: ctx.chain_id,
                        source,
                    })
            }
            CompiledExpr::Event {
                event_type,
                filters,
                field,
                aggregation,
                window,
                ..
            } => {
                let window = window.map(Duration::from).unwrap_or(ctx.window);
                let start = ctx.now - chrono::Duration::from_std(window).unwrap_or_default();
                ctx.fetcher
                    .fetch_events(
                        ctx.chain_id,
                        event_type,
                        filters,
                        field,
                        *aggregation,
                        start,
                        ctx.now,
                    )
                    .await
                    .map_err(|source| EvalError {
                        leaf: format!("{event_type}.{field}"),
                        chain_id: ctx.chain_id,
                        source,
                    })
            }
        }
    })
}

// ---------------------------------------------------------------------------
// Condition & signal evaluation
// ---------------------------------------------------------------------------

/// Outcome of one comparison; serializes into the webhook payload's
/// `conditions_met` entries.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ConditionOutcome {
    pub left: f64,
    pub op: CompareOp,
    pub right: f64,
    pub passed: bool,
}

/// Comparison with IEEE-754 semantics on finite values. Any NaN operand makes
/// the comparison false — including `neq`, so an unresolved reading can never
/// trip a signal.
fn compare(op: CompareOp, left: f64, right: f64) -> bool {
    if left.is_nan() || right.is_nan() {
        return false;
    }
    match op {
        CompareOp::Gt => left > right,
        CompareOp::Gte => left >= right,
        CompareOp::Lt => left < right,
        CompareOp::Lte => left <= right,
        CompareOp::Eq => left == right,
        CompareOp::Neq => left != right,
    }
}

pub async fn evaluate_condition(
    condition: &CompiledCondition,
    ctx: &EvalContext<'_>,
) -> Result<ConditionOutcome, EvalError> {
    let left = evaluate_expr(&condition.left, ctx).await?;
    let right = evaluate_expr(&condition.right, ctx).await?;
    Ok(ConditionOutcome {
        left,
        op: condition.operator,
        right,
        passed: compare(condition.operator, left, right),
    })
}

/// Result of evaluating a compiled signal on one chain.
#[derive(Debug, Clone, PartialEq)]
pub struct EvalReport {
    pub triggered: bool,
    /// Every condition evaluated this pass, in definition order. Short-
    /// circuiting may leave trailing conditions unevaluated and absent.
    pub outcomes: Vec<ConditionOutcome>,
}

/// Evaluate all of a signal's conditions on the context's chain.
///
/// `AND` groups are true iff every condition passes; `OR` iff any does.
/// Evaluation short-circuits once the group outcome is decided.
pub async fn evaluate_signal(
    compiled: &CompiledSignal,
    ctx: &EvalContext<'_>,
) -> Result<EvalReport, EvalError> {
    let logic = compiled.shape.logic();
    let mut outcomes = Vec::with_capacity(compiled.conditions.len());

    for condition in &compiled.conditions {
        let outcome = evaluate_condition(condition, ctx).await?;
        let passed = outcome.passed;
        outcomes.push(outcome);
        match (logic, passed) {
            (GroupLogic::And, false) => {
                return Ok(EvalReport {
                    triggered: false,
                    outcomes,
                });
            }
            (GroupLogic::Or, true) => {
                return Ok(EvalReport {
                    triggered: true,
                    outcomes,
                });
            }
            _ => {}
        }
    }

    let triggered = matches!(logic, GroupLogic::And);
    Ok(EvalReport {
        triggered,
        outcomes,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
