// ABOUTME: Logging setup for the root switcher.
// ABOUTME: Appends structured logs to the initramfs debug file, or stderr when it can't be opened.

use std::fs::OpenOptions;
use std::sync::Mutex;
use tracing_subscriber::EnvFilter;

use crate::config::LogConfig;

fn filter(level: &str, verbosity: u8) -> EnvFilter {
    let level = match verbosity {
        0 => level,
        1 => "debug",
        _ => "trace",
    };
    EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Log to the debug file under the initramfs log directory.
///
/// Timestamps are omitted: devices without an RTC would only ever show the epoch.
pub fn init(config: &LogConfig, verbosity: u8) {
    let file = std::fs::create_dir_all(&config.dir).and_then(|()| {
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(config.path())
    });

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter(&config.level, verbosity))
        .with_target(false)
        .without_time()
        .with_ansi(false)
        .compact();

    match file {
        Ok(file) => builder.with_writer(Mutex::new(file)).init(),
        Err(_) => builder.with_writer(std::io::stderr).init(),
    }
}

/// Log to stderr only; used when mounting an alternate sysroot from a shell.
pub fn init_stderr(config: &LogConfig, verbosity: u8) {
    tracing_subscriber::fmt()
        .with_env_filter(filter(&config.level, verbosity))
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();
}
