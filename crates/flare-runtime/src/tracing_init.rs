use std::path::Path;

use anyhow::Result;
use chrono::{SecondsFormat, Utc};
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::{self, FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use flare_config::{LogFormat, LoggingConfig};

// ---------------------------------------------------------------------------
// FlareFormat — single-line, domain-prefixed event rendering
// ---------------------------------------------------------------------------

/// Renders one event per line with the `fl_*!` macros' `domain` tag
/// (`sys`, `sched`, `eval`, `chain`, `notify`, `conf`) pulled out front, so
/// one pipeline stage can be grepped out of a mixed log:
///
/// ```text
/// 2026-03-01T12:00:00.000Z  INFO [sched] tick complete signals=3 pending=3
/// ```
///
/// Events from dependencies carry no `domain` and print without the prefix.
/// Timestamps are UTC RFC 3339 with millisecond precision, matching the
/// `X-Flare-Timestamp` webhook header, so engine logs and receiver logs line
/// up without timezone arithmetic. No colour codes: the engine logs for
/// collectors, not terminals.
struct FlareFormat;

impl<S, N> FormatEvent<S, N> for FlareFormat
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'writer> FormatFields<'writer> + 'static,
{
    fn format_event(
        &self,
        _ctx: &FmtContext<'_, S, N>,
        mut writer: fmt::format::Writer<'_>,
        event: &Event<'_>,
    ) -> std::fmt::Result {
        let mut line = LineVisitor::default();
        event.record(&mut line);

        write!(
            writer,
            "{} {:>5} ",
            Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            event.metadata().level(),
        )?;
        if let Some(domain) = &line.domain {
            write!(writer, "[{domain}] ")?;
        }
        write!(writer, "{}", line.message)?;
        for (name, value) in &line.fields {
            write!(writer, " {name}={value}")?;
        }
        writeln!(writer)
    }
}

/// Splits an event into the `domain` tag, the message, and the key=value
/// remainder, in recording order.
#[derive(Default)]
struct LineVisitor {
    domain: Option<String>,
    message: String,
    fields: Vec<(&'static str, String)>,
}

impl Visit for LineVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        match field.name() {
            "domain" => self.domain = Some(value.to_string()),
            "message" => self.message = value.to_string(),
            name => self.fields.push((name, format!("{value:?}"))),
        }
    }

    // Numeric and bool fields funnel through here via Visit's defaults.
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        match field.name() {
            "domain" => {
                self.domain = Some(format!("{value:?}").trim_matches('"').to_string());
            }
            "message" => self.message = format!("{value:?}"),
            name => self.fields.push((name, format!("{value:?}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Initialise the `tracing` subscriber stack from [`LoggingConfig`]: a
/// stderr layer, plus a file copy when `logging.file` is set.
///
/// Returns the [`WorkerGuard`] for the non-blocking file writer when one was
/// opened; it must be held until the process exits or buffered lines are
/// lost.
///
/// A set `RUST_LOG` environment variable overrides `logging.level`.
pub fn init_tracing(config: &LoggingConfig, base_dir: &Path) -> Result<Option<WorkerGuard>> {
    let filter = match std::env::var("RUST_LOG") {
        Ok(_) => EnvFilter::from_default_env(),
        Err(_) => EnvFilter::try_new(&config.level)
            .map_err(|e| anyhow::anyhow!("invalid logging.level '{}': {e}", config.level))?,
    };

    let stderr_layer = match config.format {
        LogFormat::Plain => fmt::layer()
            .event_format(FlareFormat)
            .with_writer(std::io::stderr)
            .boxed(),
        LogFormat::Json => fmt::layer()
            .json()
            .with_target(false)
            .with_writer(std::io::stderr)
            .boxed(),
    };

    let mut guard: Option<WorkerGuard> = None;
    let file_layer = match &config.file {
        None => None,
        Some(path) => {
            let resolved = if path.is_relative() {
                base_dir.join(path)
            } else {
                path.clone()
            };
            let parent = resolved
                .parent()
                .ok_or_else(|| anyhow::anyhow!("log file path has no parent directory"))?;
            std::fs::create_dir_all(parent)?;
            let file_name = resolved
                .file_name()
                .ok_or_else(|| anyhow::anyhow!("log file path has no file name"))?;
            let appender = tracing_appender::rolling::never(parent, file_name.to_os_string());
            let (non_blocking, file_guard) = tracing_appender::non_blocking(appender);
            guard = Some(file_guard);

            let layer = match config.format {
                LogFormat::Plain => fmt::layer()
                    .event_format(FlareFormat)
                    .with_writer(non_blocking)
                    .boxed(),
                LogFormat::Json => fmt::layer()
                    .json()
                    .with_target(false)
                    .with_ansi(false)
                    .with_writer(non_blocking)
                    .boxed(),
            };
            Some(layer)
        }
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .init();

    Ok(guard)
}
