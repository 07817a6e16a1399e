use std::io::Write;
use std::sync::OnceLock;
use std::time::Instant;

static START_TIME: OnceLock<Instant> = OnceLock::new();

/// Initialize the logger with elapsed-time formatting.
///
/// Verbose selects Info, otherwise Warn. Long-running builds and calibration
/// sweeps report progress through this logger, so the format leads with the
/// wall-clock offset since startup. All output goes to stderr.
pub fn init_logger(verbose: bool) {
    START_TIME.set(Instant::now()).ok();

    let level = if verbose {
        log::LevelFilter::Info
    } else {
        log::LevelFilter::Warn
    };

    env_logger::Builder::from_default_env()
        .filter_level(level)
        .format(|buf, record| {
            let elapsed = START_TIME.get().map(|t| t.elapsed()).unwrap_or_default();
            writeln!(
                buf,
                "[{:>7}.{:03}s] {:<5} {}",
                elapsed.as_secs(),
                elapsed.subsec_millis(),
                record.level(),
                record.args()
            )
        })
        .target(env_logger::Target::Stderr)
        .try_init()
        .ok();
}
