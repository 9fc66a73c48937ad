//! Stderr logger behind the `log` facade

use std::io::{IsTerminal, Write};

use log::{Level, LevelFilter, Log, Metadata, Record};

/// Overrides the level picked on the command line
pub const LOG_ENV: &str = "NAOS_LOG";

struct StderrLogger {
    color: bool,
}

impl Log for StderrLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let level_str = match record.level() {
            Level::Error => "ERROR",
            Level::Warn => "WARN ",
            Level::Info => "INFO ",
            Level::Debug => "DEBUG",
            Level::Trace => "TRACE",
        };

        let mut stderr = std::io::stderr().lock();
        let _ = if self.color {
            let level_color = match record.level() {
                Level::Error => "\x1b[31m",
                Level::Warn => "\x1b[33m",
                Level::Info => "\x1b[34m",
                Level::Debug => "\x1b[36m",
                Level::Trace => "\x1b[35m",
            };
            writeln!(stderr, "{level_color}[naos] {level_str}\x1b[0m {}", record.args())
        } else {
            writeln!(stderr, "[naos] {level_str} {}", record.args())
        };
    }

    fn flush(&self) {
        let _ = std::io::stderr().flush();
    }
}

/// Level for `verbose` repetitions of `-v`, or errors only when quiet.
pub fn level_from_flags(verbose: u8, quiet: bool) -> LevelFilter {
    if quiet {
        return LevelFilter::Error;
    }
    match verbose {
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    }
}

/// Installs the logger; `NAOS_LOG` wins over `default` when it parses.
pub fn init(default: LevelFilter) {
    let level = std::env::var(LOG_ENV)
        .ok()
        .and_then(|value| value.parse::<LevelFilter>().ok())
        .unwrap_or(default);

    let logger = Box::new(StderrLogger {
        color: std::io::stderr().is_terminal(),
    });
    if log::set_boxed_logger(logger).is_ok() {
        log::set_max_level(level);
    }
}
