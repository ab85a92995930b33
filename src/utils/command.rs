/// Functions and structs for launching the external tools of the pipeline

use std::env;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use log::{debug, info, error, warn};
use tokio::process::Command;
use tokio::time::timeout;

use crate::config::defs::PipelineError;


/// Resolves a configured executable once, at startup. Bare names are
/// searched on PATH; anything containing a separator is taken as a path.
///
/// # Arguments
///
/// * `tool` - Tag used in error messages.
/// * `configured` - Name or path from the configuration.
///
/// # Returns
/// Absolute path of an executable file, or PipelineError::MissingExecutable.
pub fn validate_executable(tool: &str, configured: &Path) -> Result<PathBuf, PipelineError> {
    let missing = || PipelineError::MissingExecutable {
        tool: tool.to_string(),
        path: configured.to_path_buf(),
    };

    let candidate = if configured.components().count() > 1 || configured.is_absolute() {
        Some(configured.to_path_buf())
    } else {
        env::var_os("PATH").and_then(|paths| {
            env::split_paths(&paths)
                .map(|dir| dir.join(configured))
                .find(|p| is_executable(p))
        })
    };

    match candidate {
        Some(path) if is_executable(&path) => {
            let path = path.canonicalize().unwrap_or(path);
            info!("Using {} at {}", tool, path.display());
            Ok(path)
        }
        _ => Err(missing()),
    }
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}


/// Runs `program args..` in `work_dir` with stdout and stderr both appended to
/// `log_file`. Blocks (asynchronously) until exit, or until `limit` elapses.
pub async fn run_logged(
    label: &str,
    program: &Path,
    args: &[String],
    work_dir: &Path,
    log_file: &Path,
    limit: Option<Duration>,
) -> Result<(), PipelineError> {
    let log_handle = OpenOptions::new().create(true).append(true).open(log_file)?;
    let err_handle = log_handle.try_clone()?;

    debug!("{} {} {:?} (cwd {})", label, program.display(), args, work_dir.display());
    let mut child = Command::new(program)
        .args(args)
        .current_dir(work_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::from(log_handle))
        .stderr(Stdio::from(err_handle))
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| PipelineError::ToolExecution {
            tool: label.to_string(),
            error: format!("failed to spawn {}: {}", program.display(), e),
        })?;

    let status = match limit {
        Some(limit) => {
            let waited = timeout(limit, child.wait()).await;
            match waited {
                Ok(status) => status?,
                Err(_) => {
                    error!("{} still running after {}s, killing it", label, limit.as_secs());
                    if let Err(e) = child.kill().await {
                        warn!("Could not kill {}: {}", label, e);
                    }
                    return Err(PipelineError::JobTimeout {
                        job: label.to_string(),
                        secs: limit.as_secs(),
                        log: log_file.to_path_buf(),
                    });
                }
            }
        }
        None => child.wait().await?,
    };

    if status.success() {
        Ok(())
    } else {
        error!("{} failed with {}; see {}", label, status, log_file.display());
        Err(PipelineError::JobFailed {
            job: label.to_string(),
            status: status.to_string(),
            log: log_file.to_path_buf(),
        })
    }
}


/// Executes named jobs of the analysis tool. One job at a time.
pub trait JobRunner {
    async fn run_job(&self, job: &mothur::MothurJob, work_dir: &Path, log_file: &Path) -> Result<(), PipelineError>;
}

/// Builds one cluster consensus from its members and a reference read.
pub trait ConsensusRunner {
    async fn build_consensus(
        &self,
        members: &Path,
        reference: &Path,
        output: &Path,
        work_dir: &Path,
        log_file: &Path,
    ) -> Result<(), PipelineError>;
}


pub mod mothur {
    use std::collections::BTreeMap;
    use std::path::{Path, PathBuf};
    use std::time::Duration;

    use log::info;

    use super::{run_logged, JobRunner};
    use crate::config::defs::{PipelineError, MOTHUR_TAG, MULTIPROCESS_JOBS};

    /// A named job plus its argument map. Keys are unique; rendering order is
    /// sorted by key so the command line never depends on insertion order.
    #[derive(Debug, Clone, PartialEq)]
    pub struct MothurJob {
        pub name: String,
        pub args: BTreeMap<String, String>,
    }

    impl MothurJob {
        pub fn new(name: &str) -> Self {
            MothurJob { name: name.to_string(), args: BTreeMap::new() }
        }

        pub fn arg(mut self, key: &str, value: impl ToString) -> Self {
            self.args.insert(key.to_string(), value.to_string());
            self
        }

        pub fn path_arg(self, key: &str, value: &Path) -> Self {
            let value = value.to_string_lossy().into_owned();
            self.arg(key, value)
        }

        /// Renders the mothur batch-mode command, e.g.
        /// `#align.seqs(fasta=x.fasta, flip=t, processors=4)`.
        pub fn render(&self, workers: usize) -> String {
            let mut parts: Vec<String> = self
                .args
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect();
            if MULTIPROCESS_JOBS.contains(self.name.as_str()) && !self.args.contains_key("processors") {
                parts.push(format!("processors={}", workers));
            }
            format!("#{}({})", self.name, parts.join(", "))
        }
    }

    #[derive(Debug, Clone)]
    pub struct MothurRunner {
        pub executable: PathBuf,
        pub workers: usize,
        pub timeout: Option<Duration>,
    }

    impl MothurRunner {
        pub fn new(executable: PathBuf, workers: usize, timeout: Option<Duration>) -> Self {
            MothurRunner { executable, workers, timeout }
        }
    }

    impl JobRunner for MothurRunner {
        async fn run_job(&self, job: &MothurJob, work_dir: &Path, log_file: &Path) -> Result<(), PipelineError> {
            let batch = job.render(self.workers);
            info!("Running {} job: {}", MOTHUR_TAG, batch);
            run_logged(&job.name, &self.executable, &[batch], work_dir, log_file, self.timeout).await
        }
    }
}


pub mod gcon {
    use std::path::{Path, PathBuf};
    use std::time::Duration;

    use log::info;

    use super::{run_logged, ConsensusRunner};
    use crate::config::defs::{PipelineError, GCON_TAG};

    /// Reference-guided consensus via `gcon.py r <members> <ref> -o <out>`.
    #[derive(Debug, Clone)]
    pub struct GconRunner {
        pub executable: PathBuf,
        pub timeout: Option<Duration>,
    }

    impl GconRunner {
        pub fn new(executable: PathBuf, timeout: Option<Duration>) -> Self {
            GconRunner { executable, timeout }
        }

        pub fn arg_generator(members: &Path, reference: &Path, output: &Path) -> Vec<String> {
            vec![
                "r".to_string(),
                members.to_string_lossy().into_owned(),
                reference.to_string_lossy().into_owned(),
                "-o".to_string(),
                output.to_string_lossy().into_owned(),
            ]
        }
    }

    impl ConsensusRunner for GconRunner {
        async fn build_consensus(
            &self,
            members: &Path,
            reference: &Path,
            output: &Path,
            work_dir: &Path,
            log_file: &Path,
        ) -> Result<(), PipelineError> {
            let args = Self::arg_generator(members, reference, output);
            info!("Running {} on {}", GCON_TAG, members.display());
            run_logged(GCON_TAG, &self.executable, &args, work_dir, log_file, self.timeout).await
        }
    }
}
