use anyhow::Result;
use chrono::Utc;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

use crate::command::Command;

/// Audit trail of completed transfers, separate from diagnostic tracing.
pub trait TransferLogger: Send + Sync {
    fn connect(&self, _peer: &str, _command: &Command) {}
    fn received(&self, _peer: &str, _path: &Path, _bytes: u64) {}
    fn sent(&self, _peer: &str, _path: &Path, _bytes: u64) {}
    fn error(&self, _peer: &str, _msg: &str) {}
}

pub struct NoopLogger;
impl TransferLogger for NoopLogger {}

pub struct TextLogger {
    file: Mutex<File>,
}

impl TextLogger {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let f = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: Mutex::new(f),
        })
    }

    fn line(&self, s: &str) {
        if let Ok(mut f) = self.file.lock() {
            let _ = writeln!(f, "[{}] {}", Utc::now().to_rfc3339(), s);
        }
    }
}

impl TransferLogger for TextLogger {
    fn connect(&self, peer: &str, command: &Command) {
        self.line(&format!("CONNECT peer={peer} command={command:?}"));
    }
    fn received(&self, peer: &str, path: &Path, bytes: u64) {
        self.line(&format!(
            "RECV peer={} path={} bytes={}",
            peer,
            path.display(),
            bytes
        ));
    }
    fn sent(&self, peer: &str, path: &Path, bytes: u64) {
        self.line(&format!(
            "SEND peer={} path={} bytes={}",
            peer,
            path.display(),
            bytes
        ));
    }
    fn error(&self, peer: &str, msg: &str) {
        self.line(&format!("ERROR peer={peer} msg={msg}"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn text_logger_appends_tagged_lines() {
        let temp_dir = TempDir::new().unwrap();
        let log_path = temp_dir.path().join("logs/transfers.log");
        let logger = TextLogger::new(&log_path).unwrap();

        logger.connect("10.0.0.1:1023", &Command::Receive(".".into()));
        logger.received("10.0.0.1:1023", Path::new("/srv/data/a.txt"), 5);
        logger.sent("10.0.0.1:1023", Path::new("/srv/data/b.txt"), 7);
        logger.error("10.0.0.1:1023", "path escapes root");

        let text = std::fs::read_to_string(&log_path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 4);
        assert!(lines[0].contains("CONNECT peer=10.0.0.1:1023"));
        assert!(lines[1].ends_with("RECV peer=10.0.0.1:1023 path=/srv/data/a.txt bytes=5"));
        assert!(lines[2].contains("SEND"));
        assert!(lines[3].contains("ERROR") && lines[3].contains("escapes"));
        assert!(lines.iter().all(|l| l.starts_with('[')));
    }
}
