//! Front over `slog`. Connection internals take an optional parent logger
//! and log with the re-exported macros; embedders that want output on the
//! terminal can start from `terminal()`.

pub use slog::{debug, error, info, o, trace, warn, Discard, Drain, Logger};

use sloggers::{Config, LoggerConfig};

/// Builds a stderr terminal logger at debug level.
pub fn terminal() -> Logger {
    let config: LoggerConfig = serdeconv::from_toml_str(
        r#"
type = "terminal"
level = "debug"
destination = "stderr"
"#,
    )
    .expect("Error parsing logger configuration");

    config.build_logger().expect("Error building logger")
}
