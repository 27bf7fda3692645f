use colored::{ColoredString, Colorize};
use log::{Level, LevelFilter, Metadata, Record};

/// A minimal `log::Log` implementation printing `[E]`/`[!]`/`[*]`/`[D]`/`[T]`
/// prefixed, level-colored lines to stderr.
struct Logger;

fn prefix(level: Level) -> ColoredString {
    match level {
        Level::Error => "[E]".red(),
        Level::Warn => "[!]".yellow(),
        Level::Info => "[*]".normal(),
        Level::Debug => "[D]".blue(),
        Level::Trace => "[T]".purple(),
    }
}

impl log::Log for Logger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        eprintln!("{} {}", prefix(record.level()), record.args());
    }

    fn flush(&self) {}
}

/// Installs the logger at a level derived from the number of `-v` flags:
/// 0 is Info, 1 is Debug, 2 or more is Trace.
pub fn init(verbosity: u8) {
    let level = match verbosity {
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    log::set_max_level(level);
    log::set_boxed_logger(Box::new(Logger)).expect("logger already initialized");
}
