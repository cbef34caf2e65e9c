use std::{io::stderr, path::Path};

use anyhow::Result;
use chrono::Local;
use fern::colors::{Color, ColoredLevelConfig};
use log::{LevelFilter, Record};

fn log_path(record: &Record) -> String {
    match (record.file(), record.line()) {
        (Some(path), Some(line_number)) => format!("{path}:{line_number}"),
        _ => format!("{}", record.target()),
    }
}

/// Logs to stderr in color and, when `log_file` is given, to that file in
/// plain text. Only this crate's records pass the filter.
pub fn setup_logger(log_level: LevelFilter, log_file: Option<&Path>) -> Result<()> {
    let colors = ColoredLevelConfig::new()
        .error(Color::Red)
        .warn(Color::Yellow)
        .info(Color::Green)
        .debug(Color::Magenta)
        .trace(Color::BrightBlue);

    let console = fern::Dispatch::new()
        .format(move |out, message, record| {
            out.finish(format_args!(
                "[{} {} {}] {}",
                Local::now().format("%Y-%m-%dT%H:%M:%S"),
                colors.color(record.level()),
                log_path(record),
                message,
            ))
        })
        .chain(stderr());

    let mut dispatch = fern::Dispatch::new()
        .level_for(env!("CARGO_PKG_NAME"), log_level)
        .level(LevelFilter::Off)
        .chain(console);

    if let Some(path) = log_file {
        let file = fern::Dispatch::new()
            .format(|out, message, record| {
                out.finish(format_args!(
                    "[{} {} {}] {}",
                    Local::now().format("%Y-%m-%dT%H:%M:%S%.3f"),
                    record.level(),
                    log_path(record),
                    message,
                ))
            })
            .chain(fern::log_file(path)?);

        dispatch = dispatch.chain(file);
    }

    dispatch.apply()?;

    Ok(())
}
