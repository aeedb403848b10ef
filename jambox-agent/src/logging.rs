use anyhow::{Context, Result};
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Logging configuration for the agent
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Default level or filter directive, overridden by RUST_LOG
    pub level: String,
    /// Emit JSON lines instead of human readable output
    pub json_format: bool,
    /// Also write logs to this file (rotated daily)
    pub log_file: Option<String>,
    /// Module-specific log levels
    pub module_levels: Vec<(String, String)>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
            log_file: None,
            module_levels: vec![
                ("hyper".to_string(), "warn".to_string()),
                ("hudsucker".to_string(), "warn".to_string()),
                ("rustls".to_string(), "warn".to_string()),
            ],
        }
    }
}

impl LoggingConfig {
    pub fn filter(&self) -> Result<EnvFilter> {
        let mut filter = EnvFilter::new(&self.level);
        for (module, level) in &self.module_levels {
            let directive = format!("{}={}", module, level);
            filter = filter.add_directive(
                directive
                    .parse()
                    .with_context(|| format!("Invalid log directive: {}", directive))?,
            );
        }
        Ok(filter)
    }
}

/// Initialize logging. The returned guard must live as long as file logging is needed.
pub fn init_logging(config: &LoggingConfig) -> Result<Option<WorkerGuard>> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => config.filter()?,
    };

    let (file_layer, guard) = match &config.log_file {
        Some(path) => {
            let (writer, guard) = tracing_appender::non_blocking(file_appender(path)?);
            (Some(fmt::layer().with_ansi(false).with_writer(writer)), Some(guard))
        }
        None => (None, None),
    };

    let json_layer = config.json_format.then(|| fmt::layer().json().with_target(true));
    let text_layer = (!config.json_format).then(|| fmt::layer().with_target(true));

    let result = tracing_subscriber::registry()
        .with(filter)
        .with(json_layer)
        .with(text_layer)
        .with(file_layer)
        .try_init();

    match result {
        Ok(_) => tracing::debug!("Logging initialized with level: {}", config.level),
        Err(_) => tracing::debug!("Logging already initialized, skipping"),
    }

    Ok(guard)
}

fn file_appender(log_file: &str) -> Result<RollingFileAppender> {
    let log_path = Path::new(log_file);
    let directory = match log_path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let filename = log_path
        .file_name()
        .context("Invalid log file name")?
        .to_string_lossy();

    std::fs::create_dir_all(directory)
        .with_context(|| format!("Failed to create log directory {}", directory.display()))?;

    Ok(RollingFileAppender::new(Rotation::DAILY, directory, filename.as_ref()))
}
