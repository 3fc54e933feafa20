/// Domain-aware logging macros.
///
/// Each macro injects a `domain` field automatically so callers never need to
/// remember the string literal. The domains are: `sys` (lifecycle), `sched`
/// (scheduler/queue), `eval` (signal evaluation), `chain` (RPC traffic),
/// `notify` (webhook delivery), `conf` (configuration).
///
/// # Usage
///
/// ```ignore
/// use crate::log_macros::*;
///
/// fl_info!(sys, signals = 3, "runtime bootstrap complete");
/// fl_warn!(eval, error = %e, "chain evaluation failed");
/// fl_debug!(sched, signal_id = %id, "job enqueued");
/// ```
///
/// The macros accept any tracing-compatible field syntax after the domain
/// identifier. The domain identifier is **not** a string — it is a bare
/// identifier that the macro converts to a `&str` literal.

// ---------------------------------------------------------------------------
// Core macro — dispatches to the matching tracing level macro.
// ---------------------------------------------------------------------------

/// Internal helper. Do not call directly; use `fl_error!` … `fl_trace!`.
#[doc(hidden)]
macro_rules! fl_log {
    ($level:ident, $domain:ident, $($field:tt)*) => {
        tracing::$level!(domain = stringify!($domain), $($field)*)
    };
}

// ---------------------------------------------------------------------------
// Public per-level macros
// ---------------------------------------------------------------------------

/// Log at ERROR level with an automatic `domain` field.
#[allow(unused_macros)]
macro_rules! fl_error {
    ($domain:ident, $($rest:tt)*) => {
        fl_log!(error, $domain, $($rest)*)
    };
}

/// Log at WARN level with an automatic `domain` field.
macro_rules! fl_warn {
    ($domain:ident, $($rest:tt)*) => {
        fl_log!(warn, $domain, $($rest)*)
    };
}

/// Log at INFO level with an automatic `domain` field.
macro_rules! fl_info {
    ($domain:ident, $($rest:tt)*) => {
        fl_log!(info, $domain, $($rest)*)
    };
}

/// Log at DEBUG level with an automatic `domain` field.
macro_rules! fl_debug {
    ($domain:ident, $($rest:tt)*) => {
        fl_log!(debug, $domain, $($rest)*)
    };
}

/// Log at TRACE level with an automatic `domain` field.
#[allow(unused_macros)]
macro_rules! fl_trace {
    ($domain:ident, $($rest:tt)*) => {
        fl_log!(trace, $domain, $($rest)*)
    };
}
