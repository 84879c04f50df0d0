//! Logging configuration
//!
//! Console plus a size-rotated, gzip-compressed file appender next to the
//! configured log file path.

use anyhow::{Context, Result};
use log::LevelFilter;
use log4rs::append::console::ConsoleAppender;
use log4rs::append::rolling_file::policy::compound::{
    roll::fixed_window::FixedWindowRoller, trigger::size::SizeTrigger, CompoundPolicy,
};
use log4rs::append::rolling_file::RollingFileAppender;
use log4rs::config::{Appender, Config, Logger, Root};
use log4rs::encode::pattern::PatternEncoder;
use std::fs;
use std::path::Path;

/// Roll the log file when it reaches 5 MB.
const LOG_FILE_SIZE: u64 = 5 * 1024 * 1024;

/// Number of rolled log files to keep.
const LOG_FILE_COUNT: u32 = 3;

const CONSOLE_LOG_PATTERN: &str = "{h({l})} {d(%Y-%m-%d %H:%M:%S)} {M} - {m}{n}";
const FILE_LOG_PATTERN: &str = "{d} {l}::{m}{n}";

/// Initialize logging with the configured level and file path.
pub fn setup_logging(level: &str, log_file: &Path) -> Result<()> {
    if let Some(parent) = log_file.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create log directory {}", parent.display()))?;
    }

    let stdout = ConsoleAppender::builder()
        .encoder(Box::new(PatternEncoder::new(CONSOLE_LOG_PATTERN)))
        .build();

    let roll_pattern = format!("{}.{{}}.gz", log_file.display());
    let roller = FixedWindowRoller::builder()
        .base(1)
        .build(&roll_pattern, LOG_FILE_COUNT)
        .map_err(|e| anyhow::anyhow!("Failed to create log roller: {}", e))?;
    let policy = CompoundPolicy::new(
        Box::new(SizeTrigger::new(LOG_FILE_SIZE)),
        Box::new(roller),
    );
    let file = RollingFileAppender::builder()
        .encoder(Box::new(PatternEncoder::new(FILE_LOG_PATTERN)))
        .build(log_file, Box::new(policy))
        .map_err(|e| anyhow::anyhow!("Failed to create file appender: {}", e))?;

    let root_level = parse_level(level);
    let config = Config::builder()
        .appender(Appender::builder().build("stdout", Box::new(stdout)))
        .appender(Appender::builder().build("file", Box::new(file)))
        // Quiet the noisy dependencies.
        .logger(Logger::builder().build("sqlx::query", LevelFilter::Warn))
        .logger(Logger::builder().build("reqwest", LevelFilter::Warn))
        .logger(Logger::builder().build("tokio", LevelFilter::Warn))
        .build(
            Root::builder()
                .appender("stdout")
                .appender("file")
                .build(root_level),
        )
        .map_err(|e| anyhow::anyhow!("Failed to build logging configuration: {}", e))?;

    log4rs::init_config(config).context("Failed to initialize logging")?;
    Ok(())
}

fn parse_level(level: &str) -> LevelFilter {
    match level.to_lowercase().as_str() {
        "trace" => LevelFilter::Trace,
        "debug" => LevelFilter::Debug,
        "info" => LevelFilter::Info,
        "warn" | "warning" => LevelFilter::Warn,
        "error" => LevelFilter::Error,
        "off" => LevelFilter::Off,
        _ => LevelFilter::Info,
    }
}
