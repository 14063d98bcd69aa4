fn env_truthy(var: &str) -> Option<bool> {
    std::env::var(var).map(|v| v != "0" && !v.is_empty()).ok()
}

pub mod logging {
    use clap::ValueEnum;
    use std::fs::OpenOptions;
    use std::path::PathBuf;
    use std::sync::OnceLock;
    use tracing::level_filters::LevelFilter;
    use tracing_appender::non_blocking::WorkerGuard;
    use tracing_subscriber::EnvFilter;

    #[derive(Clone, Copy, Debug, Default, ValueEnum, PartialEq, Eq, PartialOrd, Ord)]
    pub enum LogLevel {
        Error,
        #[default]
        Warn,
        Info,
        Debug,
        Trace,
    }

    impl LogLevel {
        pub fn as_str(self) -> &'static str {
            match self {
                LogLevel::Error => "error",
                LogLevel::Warn => "warn",
                LogLevel::Info => "info",
                LogLevel::Debug => "debug",
                LogLevel::Trace => "trace",
            }
        }

        pub fn to_filter(self) -> LevelFilter {
            match self {
                LogLevel::Error => LevelFilter::ERROR,
                LogLevel::Warn => LevelFilter::WARN,
                LogLevel::Info => LevelFilter::INFO,
                LogLevel::Debug => LevelFilter::DEBUG,
                LogLevel::Trace => LevelFilter::TRACE,
            }
        }
    }

    #[derive(Clone, Debug, Default)]
    pub struct LogConfig {
        pub level: LogLevel,
        pub file: Option<PathBuf>,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum InitError {
        #[error("failed to open log file {path:?}: {source}")]
        Io {
            path: PathBuf,
            source: std::io::Error,
        },
        #[error("failed to configure logger: {0}")]
        Configure(String),
    }

    static INIT: OnceLock<()> = OnceLock::new();
    static GUARD: OnceLock<WorkerGuard> = OnceLock::new();

    /// Installs the global subscriber. Later calls are no-ops.
    pub fn init(config: &LogConfig) -> Result<(), InitError> {
        if INIT.get().is_some() {
            return Ok(());
        }

        let (env_filter, throttled_deps) = build_env_filter(config.level.to_filter());

        let (writer, guard) = match &config.file {
            Some(path) => {
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .map_err(|source| InitError::Io {
                        path: path.clone(),
                        source,
                    })?;
                tracing_appender::non_blocking(file)
            }
            None => tracing_appender::non_blocking(std::io::stderr()),
        };

        let subscriber = tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_level(true)
            .with_target(config.level >= LogLevel::Debug)
            .with_thread_ids(config.level >= LogLevel::Trace)
            .with_ansi(config.file.is_none())
            .with_writer(writer)
            .finish();

        tracing::subscriber::set_global_default(subscriber)
            .map_err(|err| InitError::Configure(err.to_string()))?;

        let _ = GUARD.set(guard);
        let _ = INIT.set(());
        if throttled_deps {
            tracing::info!(
                "webrtc and websocket dependencies capped at info; set CONCH_TRACE_DEPS=1 or CONCH_LOG_FILTER to override"
            );
        }
        Ok(())
    }

    fn build_env_filter(level: LevelFilter) -> (EnvFilter, bool) {
        if let Ok(filter) = std::env::var("CONCH_LOG_FILTER") {
            return (EnvFilter::new(filter), false);
        }
        let allow_deps = super::env_truthy("CONCH_TRACE_DEPS").unwrap_or(false);
        let (filter, throttled) = default_filter_for(level, allow_deps);
        (EnvFilter::new(filter), throttled)
    }

    /// webrtc-rs is extremely chatty below info; the ICE agent alone logs
    /// every connectivity check.
    const NOISY_DEP_TARGETS: &[&str] = &[
        "webrtc",
        "webrtc_ice",
        "webrtc_dtls",
        "webrtc_sctp",
        "webrtc_srtp",
        "webrtc_mdns",
        "interceptor",
        "tokio_tungstenite",
        "tungstenite",
        "mio",
    ];

    fn default_filter_for(level: LevelFilter, allow_deps: bool) -> (String, bool) {
        let base = match level {
            LevelFilter::TRACE => "info,conch=trace,conch_proto=trace",
            LevelFilter::DEBUG => "info,conch=debug,conch_proto=debug",
            LevelFilter::INFO => "info",
            LevelFilter::WARN => "warn",
            LevelFilter::ERROR => "error",
            LevelFilter::OFF => "off",
        };
        if level >= LevelFilter::DEBUG && !allow_deps {
            (throttle_dependencies(base), true)
        } else {
            (base.to_owned(), false)
        }
    }

    fn throttle_dependencies(base: &str) -> String {
        let mut filter = base.to_owned();
        for target in NOISY_DEP_TARGETS {
            filter.push(',');
            filter.push_str(target);
            filter.push_str("=info");
        }
        filter
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test_timeout::timeout]
        fn quiet_levels_are_untouched() {
            assert_eq!(
                default_filter_for(LevelFilter::WARN, false),
                ("warn".to_string(), false)
            );
            assert_eq!(
                default_filter_for(LevelFilter::INFO, false),
                ("info".to_string(), false)
            );
        }

        #[test_timeout::timeout]
        fn debug_throttles_dependencies_unless_allowed() {
            let (filter, throttled) = default_filter_for(LevelFilter::DEBUG, false);
            assert!(throttled);
            assert!(filter.starts_with("info,conch=debug"));
            assert!(filter.contains("webrtc_ice=info"));
            assert!(filter.contains("tungstenite=info"));

            let (filter, throttled) = default_filter_for(LevelFilter::TRACE, true);
            assert!(!throttled);
            assert_eq!(filter, "info,conch=trace,conch_proto=trace");
        }

        #[test_timeout::timeout]
        fn level_names() {
            assert_eq!(LogLevel::default(), LogLevel::Warn);
            assert_eq!(LogLevel::Trace.as_str(), "trace");
            assert_eq!(LogLevel::Error.to_filter(), LevelFilter::ERROR);
        }
    }
}
