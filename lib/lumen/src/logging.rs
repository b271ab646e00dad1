pub use slog::{crit, debug, error, info, o, trace, warn};
pub use slog::{Discard, Drain, Logger};

/// Builds the default terminal logger. Deployments that need file output or
/// different levels construct their own `Logger` and pass it down instead.
pub fn init() -> Logger {
    use sloggers::{Config, LoggerConfig};

    let config: LoggerConfig = serdeconv::from_toml_str(
        r#"
type = "terminal"
level = "debug"
destination = "stderr"
"#,
    )
    .expect("Error parsing logger config");

    config.build_logger().expect("Error building logger")
}

/// A logger that swallows everything. Used as the fallback when a component
/// is constructed without a parent logger.
pub fn discard() -> Logger {
    Logger::root(Discard, o!())
}
