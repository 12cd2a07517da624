/// `logging.rs` — env_logger setup
///
/// Library code only talks to the `log` facade; binaries call `init` once.
use env_logger::Env;

/// Install the global logger. `RUST_LOG` wins over `default_filter`.
/// Calling it twice is harmless.
pub fn init(default_filter: &str) {
    let _ = env_logger::Builder::from_env(Env::default().default_filter_or(default_filter))
        .format_timestamp_millis()
        .try_init();
}
