use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

mod background_log;
mod multilog;

pub use background_log::BackgroundLog;
pub use multilog::MultiLogger;

/// One line of the background log.
#[derive(Debug, Serialize, Deserialize)]
struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: Level,
    pub message: String,
    pub target: String,
    pub module: String,
    pub file: String,
    pub line: u32,
}

#[derive(Debug, Serialize, Deserialize, Copy, Clone, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
enum Level {
    Error = 1,
    Warn = 2,
    Info = 3,
    Debug = 4,
    Trace = 5,
}

impl From<log::Level> for Level {
    fn from(value: log::Level) -> Self {
        match value {
            log::Level::Error => Level::Error,
            log::Level::Warn => Level::Warn,
            log::Level::Info => Level::Info,
            log::Level::Debug => Level::Debug,
            log::Level::Trace => Level::Trace,
        }
    }
}

impl From<&log::Record<'_>> for LogEntry {
    fn from(value: &log::Record) -> Self {
        Self {
            timestamp: Utc::now(),
            level: value.level().into(),
            message: value.args().to_string(),
            target: value.target().to_string(),
            module: value.module_path().unwrap_or_default().to_string(),
            file: value.file().unwrap_or_default().to_string(),
            line: value.line().unwrap_or_default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_entry() {
        let before = Utc::now();
        let entry = LogEntry::from(
            &log::Record::builder()
                .args(format_args!("Creating MD RAID /dev/md0"))
                .level(log::Level::Info)
                .target("blkplan::engine::commit")
                .module_path(Some("blkplan::engine::commit"))
                .file(Some("src/engine/commit.rs"))
                .line(Some(1))
                .build(),
        );

        assert!(entry.timestamp >= before);
        assert_eq!(entry.level, Level::Info);
        assert_eq!(entry.message, "Creating MD RAID /dev/md0");
        assert_eq!(entry.target, "blkplan::engine::commit");
        assert_eq!(entry.module, "blkplan::engine::commit");
        assert_eq!(entry.file, "src/engine/commit.rs");
        assert_eq!(entry.line, 1);

        let serialized = serde_json::to_string(&entry).unwrap();
        assert!(serialized.contains(r#""level":"info""#));
    }
}
