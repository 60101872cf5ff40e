pub mod metrics;
pub mod shutdown;

/// Applies the `DISABLE_COLORS` override before any logging happens. Call
/// once at process start, before the first log line is printed.
pub fn init() {
    let disable_colors = ["1", "true"].contains(
        &std::env::var("DISABLE_COLORS")
            .unwrap_or_else(|_| String::new())
            .to_lowercase()
            .as_str(),
    );
    owo_colors::set_override(!disable_colors);
}
