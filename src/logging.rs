use std::io::Write;

use anyhow::{Context, Result};
use flexi_logger::{DeferredNow, Logger as FlexiLogger};
use log::LevelFilter;

use crate::config::Logging;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3fZ";

pub fn init(config: &Logging, verbose: bool) -> Result<()> {
    let level = if verbose {
        LevelFilter::Debug
    } else {
        parse_level(&config.level)
    };

    let logger = FlexiLogger::try_with_str(level.as_str()).context("init logger")?;
    let logger = if config.json {
        logger.format(json_format)
    } else {
        logger.format(plain_format)
    };
    logger.start().context("start logger")?;
    Ok(())
}

fn parse_level(raw: &str) -> LevelFilter {
    match raw.to_ascii_lowercase().as_str() {
        "trace" => LevelFilter::Trace,
        "debug" => LevelFilter::Debug,
        "warn" | "warning" => LevelFilter::Warn,
        "error" => LevelFilter::Error,
        _ => LevelFilter::Info,
    }
}

fn plain_format(
    writer: &mut dyn Write,
    now: &mut DeferredNow,
    record: &log::Record,
) -> std::io::Result<()> {
    write!(
        writer,
        "{} [{}] {}",
        now.now_utc_owned().format(TIMESTAMP_FORMAT),
        record.level(),
        record.args()
    )
}

fn json_format(
    writer: &mut dyn Write,
    now: &mut DeferredNow,
    record: &log::Record,
) -> std::io::Result<()> {
    let line = serde_json::json!({
        "ts": now.now_utc_owned().format(TIMESTAMP_FORMAT).to_string(),
        "level": record.level().to_string(),
        "msg": record.args().to_string(),
    });
    write!(writer, "{line}")
}
