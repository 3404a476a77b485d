// Logging
//
// Every line goes to stderr as `HH:MM:SS.mmm [component] message`. Once
// `init_file_logging` has run, the same lines are appended to a per-run file
// in the log directory until `stop_file_logging`.

use crate::error::BgxError;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Open log file, if file logging is on.
pub(crate) static LOG_FILE: Mutex<Option<File>> = Mutex::new(None);

const LATEST_LINK: &str = "bgx.log";

/// Wall-clock prefix used on every line.
pub(crate) fn timestamp() -> impl std::fmt::Display {
    chrono::Local::now().format("%H:%M:%S%.3f")
}

/// Write `line` to stderr and, when enabled, the log file.
pub(crate) fn write_line(line: &str) {
    use std::io::Write as _;
    eprintln!("{}", line);
    if let Ok(mut guard) = LOG_FILE.lock() {
        if let Some(file) = guard.as_mut() {
            let _ = writeln!(file, "{}", line);
        }
    }
}

/// Start mirroring log lines into `<log_dir>/<YYYYmmdd-HHMMSS>-bgx.log`.
/// Returns the path of the new file. On Unix `bgx.log` is relinked to it.
pub fn init_file_logging(log_dir: &Path) -> Result<PathBuf, BgxError> {
    std::fs::create_dir_all(log_dir)?;

    let file_name = chrono::Local::now()
        .format("%Y%m%d-%H%M%S-bgx.log")
        .to_string();
    let path = log_dir.join(&file_name);
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)?;

    #[cfg(unix)]
    {
        let link = log_dir.join(LATEST_LINK);
        let _ = std::fs::remove_file(&link);
        if let Err(e) = std::os::unix::fs::symlink(&file_name, &link) {
            write_line(&format!("{} [logging] Could not relink {}: {}", timestamp(), LATEST_LINK, e));
        }
    }

    if let Ok(mut guard) = LOG_FILE.lock() {
        *guard = Some(file);
    }
    write_line(&format!("{} [logging] Writing log to {}", timestamp(), path.display()));
    Ok(path)
}

pub fn stop_file_logging() {
    let closed = match LOG_FILE.lock() {
        Ok(mut guard) => guard.take().is_some(),
        Err(_) => false,
    };
    if closed {
        write_line(&format!("{} [logging] Log file closed", timestamp()));
    }
}

/// `tlog!("[component] fmt", args...)`
macro_rules! tlog {
    ($($arg:tt)*) => {
        $crate::logging::write_line(&format!(
            "{} {}",
            $crate::logging::timestamp(),
            format_args!($($arg)*)
        ))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_logging_writes_and_stops() {
        let dir = std::env::temp_dir().join(format!("bgx-log-test-{}", std::process::id()));
        let path = init_file_logging(&dir).unwrap();
        tlog!("[logging] hello from test");
        stop_file_logging();
        tlog!("[logging] after close");

        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("[logging] hello from test"));
        assert!(!contents.contains("after close"));
        #[cfg(unix)]
        assert!(dir.join(LATEST_LINK).exists());
        let _ = std::fs::remove_dir_all(&dir);
    }
}
