// src/utils/logs.rs: per-stage log routing and the top-level log sink
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};


/// Hands out one log file per stage invocation, numbered in call order:
/// `<log_dir>/processNN.<stage>.logfile`.
#[derive(Debug)]
pub struct StageCounter {
    log_dir: PathBuf,
    count: u32,
}

impl StageCounter {
    pub fn new(log_dir: PathBuf) -> Self {
        StageCounter { log_dir, count: 0 }
    }

    /// Advances the counter; called once as each stage is set up, including
    /// stages that end up skipped, so numbering is stable across resumes.
    pub fn advance(&mut self) -> u32 {
        self.count += 1;
        self.count
    }

    pub fn current(&self) -> u32 {
        self.count
    }

    /// Log path for the stage most recently set up.
    pub fn log_file(&self, stage: &str) -> PathBuf {
        self.log_dir.join(format!("process{:02}.{}.logfile", self.count, stage))
    }
}


/// Writes everything to stderr and to an append-mode log file.
pub struct TeeWriter {
    file: File,
}

impl TeeWriter {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(TeeWriter { file })
    }
}

impl Write for TeeWriter {
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
