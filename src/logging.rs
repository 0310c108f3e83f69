//! Process-wide logger: `env_logger` writing to stderr and to a run log in
//! the experiment's `logdir`.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

/// Writer that duplicates every write to stderr and a log file.
struct Tee {
    file: File,
}

impl Write for Tee {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        io::stderr().write_all(buf)?;
        self.file.write_all(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        io::stderr().flush()?;
        self.file.flush()
    }
}

/// Path of the run log for a process started at `started` (unix seconds).
pub fn log_file_path(logdir: &Path, started: u64) -> PathBuf {
    logdir.join(format!("run_{started}.log"))
}

/// Install the global logger. `RUST_LOG` overrides the default `info` filter.
///
/// Returns the path of the log file.
pub fn init(logdir: &Path) -> io::Result<PathBuf> {
    fs::create_dir_all(logdir)?;
    let started = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default();
    let path = log_file_path(logdir, started);
    let file = File::create(&path)?;

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .target(env_logger::Target::Pipe(Box::new(Tee { file })))
        .try_init()
        .map_err(|e| io::Error::new(io::ErrorKind::AlreadyExists, e))?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_file_path() {
        let path = log_file_path(Path::new("/runs/exp1"), 1700000000);
        assert_eq!(path, PathBuf::from("/runs/exp1/run_1700000000.log"));
    }

    #[test]
    fn test_tee_writes_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tee.log");
        let mut tee = Tee {
            file: File::create(&path).unwrap(),
        };
        tee.write_all(b"Best iou until now is 0.5\n").unwrap();
        tee.flush().unwrap();
        let content = fs::read_to_string(&path).unwrap();
        assert_eq!(content, "Best iou until now is 0.5\n");
    }
}
