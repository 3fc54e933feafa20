pub mod compile;
pub mod duration;
pub mod metrics;
pub mod types;
pub mod validate;

pub use compile::{
    CompileError, CompiledCondition, CompiledExpr, CompiledSignal, ConditionShape, compile,
};
pub use duration::{DurationFormatError, WindowDuration};
pub use metrics::{MetricDef, MetricKind, MetricRegistry, PROTOCOL_MORPHO, Unit};
pub use types::{
    Aggregation, ArithOp, CompareOp, Condition, Expr, Filter, FilterOp, FilterValue, GroupLogic,
    Signal, Snapshot, WindowSpec,
};
pub use validate::{MAX_EXPR_DEPTH, ValidationError, validate_signal};
