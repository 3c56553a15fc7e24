/// Install a `fmt` subscriber filtered by `RUST_LOG`, if that is set.
///
/// For tests and demos: `lettuce::dev_tracing::init_tracing()`. Does nothing
/// when `RUST_LOG` is unset or a global subscriber already exists.
pub fn init_tracing() {
    if std::env::var_os("RUST_LOG").is_none() {
        return;
    }
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_thread_names(true)
        .try_init();
}
