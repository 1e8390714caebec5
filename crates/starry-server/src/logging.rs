use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Mutex;

use tracing_subscriber::filter::LevelFilter;

use crate::error::{ServerError, ServerResult};

/// Map a configured level name onto a filter. Unknown names mean `WARN`.
pub fn parse_level(level: &str) -> LevelFilter {
    match level.trim().to_ascii_uppercase().as_str() {
        "NOTSET" | "TRACE" => LevelFilter::TRACE,
        "DEBUG" => LevelFilter::DEBUG,
        "INFO" => LevelFilter::INFO,
        "WARNING" | "WARN" => LevelFilter::WARN,
        "ERROR" | "CRITICAL" | "FATAL" => LevelFilter::ERROR,
        "OFF" => LevelFilter::OFF,
        _ => LevelFilter::WARN,
    }
}

/// Install the global subscriber, writing to `log_file` (appended) or stdout.
///
/// A subscriber installed earlier wins; calling this again is a no-op.
pub fn init(log_file: Option<&Path>, log_level: &str) -> ServerResult<()> {
    let level = parse_level(log_level);
    let builder = tracing_subscriber::fmt().with_max_level(level).with_target(false);

    let installed = match log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| ServerError::Config(format!("log file {}: {e}", path.display())))?;
            builder.with_ansi(false).with_writer(Mutex::new(file)).try_init()
        }
        None => builder.try_init(),
    };

    if installed.is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_names() {
        assert_eq!(parse_level("WARNING"), LevelFilter::WARN);
        assert_eq!(parse_level("debug"), LevelFilter::DEBUG);
        assert_eq!(parse_level("CRITICAL"), LevelFilter::ERROR);
        assert_eq!(parse_level("NOTSET"), LevelFilter::TRACE);
        assert_eq!(parse_level("verbose"), LevelFilter::WARN);
    }

    #[test]
    fn init_twice_is_harmless() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("starry.log");
        init(Some(&log), "INFO").unwrap();
        init(None, "DEBUG").unwrap();
        assert!(log.exists());
    }

    #[test]
    fn unwritable_log_file_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = init(Some(&dir.path().join("missing/starry.log")), "INFO").unwrap_err();
        assert!(matches!(err, ServerError::Config(_)));
    }
}
