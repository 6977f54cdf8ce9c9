// Process-wide logger.
//
// The runtime owns exactly one logger for its whole life: installed
// by system init, quiesced by system deinit. Everything in the core
// logs through the `log` facade; this is the sink behind it.

use log::{LevelFilter, Log, Metadata, Record};


struct RuntimeLogger;

static LOGGER: RuntimeLogger = RuntimeLogger;

impl Log for RuntimeLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            eprintln!(
                "[{:5}] {}: {}",
                record.level(),
                record.target(),
                record.args()
            );
        }
    }

    fn flush(&self) {}
}


// Install the logger and set the level filter. Re-initialization
// only adjusts the filter; set_logger is one-shot per process.
pub fn init(level: LevelFilter) {
    let _ = log::set_logger(&LOGGER);
    log::set_max_level(level);
}

// The logger statics cannot be uninstalled, so teardown is a
// filter change.
pub fn shutdown() {
    log::set_max_level(LevelFilter::Off);
}
