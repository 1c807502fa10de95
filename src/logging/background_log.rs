use std::{
    fs::{self, File},
    io::Write,
    path::Path,
    sync::Mutex,
};

use log::{LevelFilter, Log, Record};

use super::LogEntry;

/// Writes every record as one JSON line to a file, truncating the file when
/// created. Failing to open the file disables the logger.
pub struct BackgroundLog {
    target: Option<Mutex<File>>,
    max_level: LevelFilter,
}

fn create_log_file(path: &Path) -> std::io::Result<File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    File::create(path)
}

impl BackgroundLog {
    pub fn new(target: impl AsRef<Path>) -> Self {
        let file = match create_log_file(target.as_ref()) {
            Ok(f) => Some(Mutex::new(f)),
            Err(err) => {
                eprintln!(
                    "Logging setup error: failed to create background log file '{}': {:?}",
                    target.as_ref().display(),
                    err
                );
                None
            }
        };

        Self {
            max_level: LevelFilter::Trace,
            target: file,
        }
    }

    pub fn with_max_level(self, max_level: log::LevelFilter) -> Self {
        Self { max_level, ..self }
    }

    pub fn into_logger(self) -> Box<dyn Log> {
        Box::new(self)
    }

    /// Best effort attempt to write the log entry to the file
    fn write_entry(&self, record: &Record) -> Result<(), Box<dyn std::error::Error + '_>> {
        if let Some(file) = self.target.as_ref() {
            let mut serialized = serde_json::to_string(&LogEntry::from(record))?;
            serialized.push('\n');

            let mut file_lock = file.lock()?;
            file_lock.write_all(serialized.as_bytes())?;
        }

        Ok(())
    }
}

impl Log for BackgroundLog {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        self.target.is_some() && metadata.level() <= self.max_level
    }

    fn log(&self, record: &Record) {
        let _ = self.write_entry(record);
    }

    fn flush(&self) {
        if let Some(Ok(mut file)) = self.target.as_ref().map(|f| f.lock()) {
            let _ = file.flush();
        }
    }
}

#[cfg(test)]
mod tests {
    use log::Level;
    use tempfile::tempdir;

    use super::*;

    #[test]
    fn test_filter() {
        let test_dir = tempdir().unwrap();
        let target = test_dir.path().join("blkplan.log");
        let logger = BackgroundLog::new(target)
            .with_max_level(LevelFilter::Info)
            .into_logger();

        assert!(
            logger.enabled(&log::Metadata::builder().level(Level::Info).build()),
            "Logger should accept the record"
        );
        assert!(
            !logger.enabled(&log::Metadata::builder().level(Level::Debug).build()),
            "Logger should not accept the record"
        );
    }

    #[test]
    fn test_disabled() {
        let test_dir = tempdir().unwrap();
        // A directory cannot be opened as the log file
        let log = BackgroundLog::new(test_dir.path());
        assert!(log.target.is_none(), "Logger target should be none");
        let logger = log.into_logger();
        assert!(
            !logger.enabled(&log::Metadata::builder().level(Level::Error).build()),
            "Logger should NOT accept the record"
        );
    }

    #[test]
    fn test_creates_parent_and_truncates() {
        let test_dir = tempdir().unwrap();
        let target = test_dir.path().join("var/log/blkplan.log");
        fs::create_dir_all(target.parent().unwrap()).unwrap();
        fs::write(&target, "stale content").unwrap();

        let logger = BackgroundLog::new(&target).into_logger();
        logger.log(
            &log::Record::builder()
                .args(format_args!("Probing block devices"))
                .build(),
        );
        logger.flush();

        let content = fs::read_to_string(&target).unwrap();
        assert!(!content.contains("stale content"));
        assert!(content.contains("Probing block devices"));
    }

    #[test]
    fn test_background_log() {
        let test_dir = tempdir().unwrap();
        let target = test_dir.path().join("blkplan.log");
        let logger = BackgroundLog::new(&target).into_logger();

        for message in ["Creating partition /dev/sda1", "Creating partition /dev/sdb1"] {
            logger.log(
                &log::Record::builder()
                    .args(format_args!("{message}"))
                    .level(Level::Info)
                    .target("blkplan::engine::commit")
                    .module_path(Some("blkplan::engine::commit"))
                    .file(Some(file!()))
                    .line(Some(42))
                    .build(),
            );
        }
        logger.flush();

        let content = fs::read_to_string(target).unwrap();
        let entries: Vec<LogEntry> = content
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].level, Level::Info.into());
        assert_eq!(entries[1].message, "Creating partition /dev/sdb1");
        assert_eq!(entries[0].target, "blkplan::engine::commit");
        assert_eq!(entries[0].file, file!());
        assert_eq!(entries[0].line, 42);
    }
}
