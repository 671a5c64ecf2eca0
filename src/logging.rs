use tracing::{Level, error};
use tracing_subscriber::FmtSubscriber;

fn parse_level(level: &str) -> Level {
    level.trim().parse().unwrap_or(Level::INFO)
}

/// Install the global fmt subscriber. Unknown level names fall back to `info`.
pub fn init(level: &str) {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(parse_level(level))
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber).ok();
}

/// Any panic is fatal: log it, then exit so the process supervisor restarts
/// us with clean state.
pub fn install_panic_hook() {
    std::panic::set_hook(Box::new(|info| {
        error!("[FATAL] {}", info);
        std::process::exit(1);
    }));
}
