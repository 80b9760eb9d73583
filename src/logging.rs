//! Logging initialization and configuration.
//!
//! Console output goes to stderr; stdout carries the run result.

use anyhow::Result;
use chrono::format::{Item, StrftimeItems};
use tracing::Subscriber;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::time::FormatTime;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::Layered;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer, Registry};

use crate::config::{expand_home, LogConfig};

const DEFAULT_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

type BaseSubscriber = Layered<EnvFilter, Registry>;
type BoxedLayer = Box<dyn Layer<BaseSubscriber> + Send + Sync>;

/// Timestamp style selected by `log.timestampFormat`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogTimer {
    Local,
    Utc,
    Rfc3339,
    Custom(String),
}

impl LogTimer {
    pub fn from_config(cfg: &LogConfig) -> Result<Self> {
        match cfg.timestamp_format.to_lowercase().as_str() {
            "utc" => Ok(LogTimer::Utc),
            "rfc3339" => Ok(LogTimer::Rfc3339),
            "custom" => {
                let format = cfg.custom_timestamp_format.as_ref().ok_or_else(|| {
                    anyhow::anyhow!("customTimestampFormat is required when timestampFormat is 'custom'")
                })?;
                if StrftimeItems::new(format).any(|item| matches!(item, Item::Error)) {
                    anyhow::bail!("Invalid custom timestamp format: {}", format);
                }
                Ok(LogTimer::Custom(format.clone()))
            }
            _ => Ok(LogTimer::Local),
        }
    }
}

impl FormatTime for LogTimer {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        match self {
            LogTimer::Local => write!(w, "{}", chrono::Local::now().format(DEFAULT_TIME_FORMAT)),
            LogTimer::Utc => write!(w, "{}", chrono::Utc::now().format(DEFAULT_TIME_FORMAT)),
            LogTimer::Rfc3339 => write!(
                w,
                "{}",
                chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
            ),
            LogTimer::Custom(format) => write!(w, "{}", chrono::Local::now().format(format)),
        }
    }
}

fn format_layer<S, W>(cfg: &LogConfig, timer: LogTimer, writer: W, ansi: bool) -> Box<dyn Layer<S> + Send + Sync>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let layer = fmt::layer()
        .with_writer(writer)
        .with_ansi(ansi)
        .with_timer(timer)
        .with_level(cfg.show_level)
        .with_target(cfg.show_target)
        .with_thread_names(cfg.show_thread_names)
        .with_thread_ids(cfg.show_thread_ids)
        .with_file(cfg.show_file)
        .with_line_number(cfg.show_file);

    match cfg.format.to_lowercase().as_str() {
        "json" => layer.json().boxed(),
        "compact" => layer.compact().boxed(),
        "pretty" => layer.pretty().boxed(),
        _ => layer.boxed(),
    }
}

/// Filter directives for the crate level plus per-module overrides.
pub fn filter_directives(cfg: &LogConfig) -> Result<String> {
    let level = parse_log_level(&cfg.level)?;
    let mut directives = format!("microbots={}", level);
    let mut modules: Vec<_> = cfg.module_levels.iter().collect();
    modules.sort();
    for (module, module_level) in modules {
        if let Ok(parsed) = parse_log_level(module_level) {
            directives.push_str(&format!(",{}={}", module, parsed));
        }
    }
    Ok(directives)
}

/// Initialize logging from configuration.
///
/// The returned guard flushes the file writer; keep it alive for the
/// lifetime of the process.
pub fn init_logging(cfg: &LogConfig) -> Result<Option<WorkerGuard>> {
    let directives = filter_directives(cfg)?;
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directives));
    let timer = LogTimer::from_config(cfg)?;

    let mut layers: Vec<BoxedLayer> = vec![format_layer(cfg, timer.clone(), std::io::stderr, true)];

    let mut guard = None;
    if let Some(dir) = &cfg.dir {
        let log_dir = expand_home(dir);
        std::fs::create_dir_all(&log_dir)?;
        // microbots.yyyy-MM-dd.log or microbots.yyyy-MM-dd.json
        let suffix = match cfg.format.to_lowercase().as_str() {
            "json" => "json",
            _ => "log",
        };
        let file_appender = tracing_appender::rolling::RollingFileAppender::builder()
            .rotation(tracing_appender::rolling::Rotation::DAILY)
            .filename_prefix("microbots")
            .filename_suffix(suffix)
            .build(&log_dir)
            .map_err(|e| anyhow::anyhow!("Failed to create rolling file appender: {}", e))?;
        let (non_blocking, worker_guard) = tracing_appender::non_blocking(file_appender);
        layers.push(format_layer(cfg, timer, non_blocking, false));
        guard = Some(worker_guard);
    }

    tracing_subscriber::registry()
        .with(env_filter)
        .with(layers)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;

    tracing::debug!(
        level = %cfg.level,
        format = %cfg.format,
        timestamp_format = %cfg.timestamp_format,
        dir = ?cfg.dir,
        "Logging initialized"
    );

    Ok(guard)
}

/// Parse log level string to a filter directive.
pub fn parse_log_level(level_str: &str) -> Result<&'static str> {
    match level_str.to_lowercase().as_str() {
        "trace" => Ok("trace"),
        "debug" => Ok("debug"),
        "info" => Ok("info"),
        "warn" => Ok("warn"),
        "error" => Ok("error"),
        _ => anyhow::bail!("Invalid log level: {}", level_str),
    }
}

/// Initialize simple logging for commands that don't load config.
pub fn init_simple_logging() {
    let _ = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "microbots=info".into()))
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn levels() {
        assert_eq!(parse_log_level("WARN").unwrap(), "warn");
        assert!(parse_log_level("loud").is_err());
    }

    #[test]
    fn module_levels_are_appended_in_order() {
        let mut cfg = LogConfig::default();
        cfg.level = "debug".into();
        cfg.module_levels.insert("bollard".into(), "warn".into());
        cfg.module_levels.insert("hyper".into(), "nonsense".into());
        cfg.module_levels.insert("rig".into(), "info".into());
        assert_eq!(filter_directives(&cfg).unwrap(), "microbots=debug,bollard=warn,rig=info");
    }

    #[test]
    fn custom_timer_needs_a_valid_format() {
        let mut cfg = LogConfig::default();
        cfg.timestamp_format = "custom".into();
        assert!(LogTimer::from_config(&cfg).is_err());
        cfg.custom_timestamp_format = Some("%H:%M:%S".into());
        assert_eq!(LogTimer::from_config(&cfg).unwrap(), LogTimer::Custom("%H:%M:%S".into()));
        cfg.custom_timestamp_format = Some("%Q".into());
        assert!(LogTimer::from_config(&cfg).is_err());
    }

    #[test]
    fn unknown_timestamp_format_is_local() {
        let mut cfg = LogConfig::default();
        cfg.timestamp_format = "whatever".into();
        assert_eq!(LogTimer::from_config(&cfg).unwrap(), LogTimer::Local);
    }
}
