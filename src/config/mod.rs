pub mod defs;

use std::path::{Path, PathBuf};
use std::time::Duration;

use log::{debug, info};

use crate::cli::Arguments;
use crate::utils::command::validate_executable;
use crate::utils::file::classify_input;
use crate::utils::system::resolve_workers;
use defs::{PipelineError, RunConfig, GCON_TAG, MOTHUR_TAG};


fn absolute(cwd: &Path, path: &str) -> PathBuf {
    let path = PathBuf::from(path);
    if path.is_absolute() { path } else { cwd.join(path) }
}

fn check_unit_interval(name: &str, value: f64) -> Result<(), PipelineError> {
    if value > 0.0 && value <= 1.0 {
        Ok(())
    } else {
        Err(PipelineError::InvalidConfig(format!("{} must be in (0, 1], got {}", name, value)))
    }
}

/// A reference that exists relative to the launch directory is made absolute,
/// since jobs run inside the output directory. Anything else is passed on
/// untouched for the tool to resolve.
fn resolve_reference(cwd: &Path, reference: &str) -> PathBuf {
    let candidate = absolute(cwd, reference);
    if candidate.exists() {
        candidate
    } else {
        debug!("Reference {} not found locally; leaving it to the tool", reference);
        PathBuf::from(reference)
    }
}


/// Validates parsed arguments and freezes them into a RunConfig.
///
/// # Arguments
///
/// * `args` - Parsed command line.
/// * `cwd` - Directory relative paths are resolved against.
/// * `out_dir` - Existing output directory.
/// * `physical_cores` - Default worker count.
///
/// # Returns
/// RunConfig, or the first configuration error found.
pub fn build_run_config(
    args: &Arguments,
    cwd: &Path,
    out_dir: &Path,
    physical_cores: usize,
) -> Result<RunConfig, PipelineError> {
    check_unit_interval("min-accuracy", args.min_accuracy)?;
    check_unit_interval("fraction", args.fraction)?;
    if !(args.distance >= 0.0) {
        return Err(PipelineError::InvalidConfig(format!("distance must be >= 0, got {}", args.distance)));
    }
    if args.min_cluster_size < 1 {
        return Err(PipelineError::InvalidConfig("min-cluster-size must be at least 1".to_string()));
    }
    if args.workers == Some(0) {
        return Err(PipelineError::InvalidConfig("workers must be at least 1".to_string()));
    }
    if args.job_timeout == Some(0) {
        return Err(PipelineError::InvalidConfig("job-timeout must be at least 1 second".to_string()));
    }

    let input_file = absolute(cwd, &args.input_file);
    if !input_file.is_file() {
        return Err(PipelineError::MissingInput(input_file));
    }
    let data_type = classify_input(&input_file)?;

    let mothur = validate_executable(MOTHUR_TAG, Path::new(&args.mothur))?;
    let consensus_tool = validate_executable(GCON_TAG, Path::new(&args.consensus_tool))?;

    let workers = resolve_workers(args.workers, physical_cores);
    info!("Using {} workers for multi-process jobs", workers);

    Ok(RunConfig {
        input_file,
        out_dir: out_dir.canonicalize()?,
        data_type,
        mothur,
        consensus_tool,
        workers,
        min_accuracy: args.min_accuracy,
        min_ccs_length: args.min_ccs_length,
        min_snr: args.min_snr,
        alignment_reference: resolve_reference(cwd, &args.alignment_reference),
        chimera_reference: resolve_reference(cwd, &args.chimera_reference),
        fraction: args.fraction,
        screen_min_length: args.screen_min_length,
        precluster_diffs: args.precluster_diffs,
        cluster_method: args.clustering_method,
        distance: args.distance,
        min_cluster_size: args.min_cluster_size,
        job_timeout: args.job_timeout.map(Duration::from_secs),
    })
}
