use std::path::PathBuf;

use serde::Deserialize;

/// Logging knobs for the engine. The `[logging]` section is fully optional.
///
/// Per-target verbosity is expressed directly in `level` as a tracing filter
/// directive (`"info,flare_runtime::worker=debug"`) rather than through a
/// separate override table — one string, same syntax as `RUST_LOG`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Tracing filter directive, e.g. `"info"` or `"info,flare_chain=debug"`.
    /// A set `RUST_LOG` environment variable takes precedence.
    pub level: String,
    /// Optional log file, resolved against the config directory when
    /// relative. Output always goes to stderr; the file is an extra copy.
    pub file: Option<PathBuf>,
    /// `plain` (single-line, domain-prefixed) or `json`.
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
            format: LogFormat::default(),
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Plain,
    Json,
}
