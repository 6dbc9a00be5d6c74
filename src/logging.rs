//! Logging setup for the broker binary.
//!
//! Every other module logs through the `log` facade only
//! (`log::info!`/`log::warn!`/`log::error!`); no component stores its own
//! logger handle. This function is the single place the concrete sink is
//! wired up, writing to both stdout and a log file.

use std::path::Path;

use log4rs::append::console::ConsoleAppender;
use log4rs::append::file::FileAppender;
use log4rs::config::{Appender, Config, Root};
use log4rs::encode::pattern::PatternEncoder;

const LOG_PATTERN: &str = "{d(%Y-%m-%d %H:%M:%S%.3f)} {l} {t} - {m}{n}";

/// Initialize the global `log` backend to write to both stdout and
/// `log_file`. Safe to call once per process; a second call is ignored
/// with a warning rather than panicking the broker.
pub fn init(log_file: &Path) {
  let console = ConsoleAppender::builder()
    .encoder(Box::new(PatternEncoder::new(LOG_PATTERN)))
    .build();

  let file_appender = match FileAppender::builder()
    .encoder(Box::new(PatternEncoder::new(LOG_PATTERN)))
    .build(log_file)
  {
    Ok(appender) => Some(appender),
    Err(e) => {
      eprintln!("could not open log file {}: {e}, logging to console only", log_file.display());
      None
    }
  };

  let mut builder = Config::builder().appender(Appender::builder().build("console", Box::new(console)));
  let mut root = Root::builder().appender("console");

  if let Some(file_appender) = file_appender {
    builder = builder.appender(Appender::builder().build("file", Box::new(file_appender)));
    root = root.appender("file");
  }

  let config = match builder.build(root.build(log::LevelFilter::Info)) {
    Ok(config) => config,
    Err(e) => {
      eprintln!("failed to build logging config: {e}");
      return;
    }
  };

  if log4rs::init_config(config).is_err() {
    log::warn!("logging was already initialized, ignoring second init() call");
  }
}
