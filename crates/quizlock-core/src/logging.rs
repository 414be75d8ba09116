//! Logging bootstrap for the `quizlock` binary and embedding hosts.
//!
//! Records go through the `log` facade. Lock transitions are logged with
//! attempt and quiz ids only; callers never pass secrets or fingerprints.

use env_logger::Env;
use log::Record;
use serde_json::json;
use std::env;
use std::io::Write;
use std::sync::OnceLock;

static INIT: OnceLock<()> = OnceLock::new();

const FORMAT_ENV: &str = "QUIZLOCK_LOG_FORMAT";
const LEVEL_ENV: &str = "QUIZLOCK_LOG_LEVEL";

/// Output layout of each log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Plain,
}

impl LogFormat {
    /// Anything other than `plain` keeps JSON lines.
    pub fn from_env_value(value: Option<&str>) -> Self {
        match value.map(|v| v.trim().to_ascii_lowercase()) {
            Some(v) if v == "plain" || v == "text" => LogFormat::Plain,
            _ => LogFormat::Json,
        }
    }
}

/// Initialize the global logger. The first caller wins.
///
/// `RUST_LOG` takes precedence, then `QUIZLOCK_LOG_LEVEL`, then
/// `default_level`.
pub fn init(default_level: &str) {
    INIT.get_or_init(|| configure(default_level));
}

fn configure(default_level: &str) {
    let level = env::var(LEVEL_ENV).unwrap_or_else(|_| default_level.to_string());
    let format = LogFormat::from_env_value(env::var(FORMAT_ENV).ok().as_deref());

    let mut builder = env_logger::Builder::from_env(Env::default().default_filter_or(level));
    builder.format(move |buf, record| {
        let line = render(format, &buf.timestamp().to_string(), record);
        writeln!(buf, "{line}")
    });

    if let Err(err) = builder.try_init() {
        eprintln!("failed to initialize logger: {err}");
    }
}

fn render(format: LogFormat, timestamp: &str, record: &Record<'_>) -> String {
    let level = record.level().as_str().to_ascii_lowercase();
    match format {
        LogFormat::Json => json!({
            "timestamp": timestamp,
            "level": level,
            "target": record.target(),
            "message": record.args().to_string(),
        })
        .to_string(),
        LogFormat::Plain => format!(
            "{timestamp} {level} {} - {}",
            record.target(),
            record.args()
        ),
    }
}
