use anyhow::Result;
use flexi_logger::{DeferredNow, Logger, LoggerHandle, Record};

/// Setup console logging for demos and tests.
///
/// The returned handle must be kept alive for as long as log output is
/// wanted; dropping it shuts the logger down.
pub fn setup() -> Result<LoggerHandle, anyhow::Error> {
    let handle = Logger::try_with_env_or_str("info")?
        .format(console_format)
        .start()?;

    log::info!(
        "Adjust the log level by setting RUST_LOG. By default RUST_LOG=info"
    );

    Ok(handle)
}

/// A single-line formatting function for flexi_logger.
pub fn console_format(
    w: &mut dyn std::io::Write,
    now: &mut DeferredNow,
    record: &Record,
) -> Result<(), std::io::Error> {
    writeln!(
        w,
        "{} [{}] [{}:{}] {}",
        record.level(),
        now.format("%H:%M:%S%.6f"),
        record.file().unwrap_or("<unnamed>"),
        record.line().unwrap_or(0),
        record.args(),
    )
}
