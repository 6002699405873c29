use std::fs;

use anyhow::Context;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use advisor_voice::config::paths;

/// Initialize the structured logging system.
///
/// Sets up:
/// - File output: rolling log files in `{data_dir}/logs/advisor-voice.*.log`
///   with daily rotation, keeping the latest 5 files.
/// - Console output (stderr): human-readable. Stdout carries IPC only.
/// - Environment filter: defaults to `info`, configurable via `RUST_LOG`.
pub fn init() -> anyhow::Result<()> {
    let log_dir = paths::get_log_dir();
    fs::create_dir_all(&log_dir)
        .with_context(|| format!("failed to create log directory {}", log_dir.display()))?;

    let file_appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix("advisor-voice")
        .filename_suffix("log")
        .max_log_files(5)
        .build(&log_dir)
        .context("failed to create log file appender")?;

    let file_layer = fmt::layer()
        .with_writer(file_appender)
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true);

    let console_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_ansi(true)
        .with_target(true)
        .compact();

    // tungstenite logs every frame at debug; cpal/rodio are chatty on
    // device probing.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("info,tungstenite=warn,tokio_tungstenite=warn,native_tls=warn,cpal=warn,rodio=warn,symphonia=warn")
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .with(console_layer)
        .try_init()
        .context("logger already initialized")?;

    tracing::info!(
        log_dir = %log_dir.display(),
        "Logger initialized"
    );
    Ok(())
}
