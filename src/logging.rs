use env_logger::Env;

/// Initialize the process logger from the environment.
///
/// Defaults to `info` when `RUST_LOG` is unset. Safe to call more than
/// once; subsequent calls are no-ops so tests can initialize freely.
pub fn init() {
    let _ = env_logger::Builder::from_env(Env::default().default_filter_or("info")).try_init();
}
