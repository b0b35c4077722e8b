use crate::config::AppConfig;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Install the global subscriber. Keep the guard alive for the process lifetime.
pub fn init_logging(config: &AppConfig) -> WorkerGuard {
    let file_appender = match config.rotation.as_str() {
        "hourly" => tracing_appender::rolling::hourly(&config.log_dir, &config.log_file),
        "daily" => tracing_appender::rolling::daily(&config.log_dir, &config.log_file),
        _ => tracing_appender::rolling::never(&config.log_dir, &config.log_file),
    };

    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter_directives(config)));

    let registry = tracing_subscriber::registry().with(filter);

    if config.use_json {
        let file_layer = fmt::layer()
            .json()
            .with_target(true)
            .with_writer(non_blocking)
            .with_ansi(false);
        registry.with(file_layer).init();
    } else {
        let file_layer = fmt::layer()
            .with_target(false)
            .with_writer(non_blocking)
            .with_ansi(false);
        let stdout_layer = fmt::layer().with_target(false).with_ansi(true);
        registry.with(file_layer).with(stdout_layer).init();
    }

    guard
}

/// Per-buffer data logs are trace level; silence them unless tracing is on.
///
/// The cap only ever lowers the pipeline's verbosity: a level that never
/// reaches trace is left untouched.
fn filter_directives(config: &AppConfig) -> String {
    if config.enable_tracing || !config.log_level.contains("trace") {
        config.log_level.clone()
    } else {
        format!("{},mft_gateway::transfer::pipeline=debug", config.log_level)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(log_level: &str, enable_tracing: bool) -> AppConfig {
        AppConfig::parse(&format!(
            "log_level: \"{}\"\nlog_dir: .\nlog_file: t.log\nuse_json: false\n\
             rotation: never\nenable_tracing: {}\npaths:\n  gateway_home: /tmp\n",
            log_level, enable_tracing
        ))
        .unwrap()
    }

    #[test]
    fn test_filter_directives() {
        assert_eq!(filter_directives(&config("trace", true)), "trace");
        assert_eq!(
            filter_directives(&config("trace", false)),
            "trace,mft_gateway::transfer::pipeline=debug"
        );
    }

    #[test]
    fn test_filter_never_raises_pipeline_level() {
        assert_eq!(filter_directives(&config("info", false)), "info");
        assert_eq!(
            filter_directives(&config("warn,mft_gateway=debug", false)),
            "warn,mft_gateway=debug"
        );
    }
}
