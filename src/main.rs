use std::env;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use env_logger::{Builder, Target};
use log::{LevelFilter, debug, error, info};

use amplicon_pipeline::cli::{parse, Arguments};
use amplicon_pipeline::config::build_run_config;
use amplicon_pipeline::config::defs::{LOG_DIR, PIPELINE_LOG, PipelineError};
use amplicon_pipeline::pipelines::amplicon;
use amplicon_pipeline::utils::ccs::RawDataOpener;
use amplicon_pipeline::utils::command::gcon::GconRunner;
use amplicon_pipeline::utils::command::mothur::MothurRunner;
use amplicon_pipeline::utils::logs::TeeWriter;
use amplicon_pipeline::utils::system::detect_cores_and_load;


#[tokio::main]
async fn main() -> Result<()> {
    let run_start = Instant::now();
    let args = parse();

    let cwd = env::current_dir()?;
    let out_dir = setup_output_dir(&args, &cwd)?;
    init_logging(&out_dir, args.verbose)?;

    println!("\n-------------\n Amplicon Pipeline\n-------------\n");
    info!("The current directory is {:?}", cwd);
    info!("Writing results to {:?}", out_dir);

    let (physical_cores, cpu_load) = detect_cores_and_load().await;
    debug!("Detected {} physical cores; CPU load {}%", physical_cores, cpu_load);

    if let Err(e) = run(&args, &cwd, &out_dir, physical_cores).await {
        error!("Pipeline failed: {} at {} milliseconds.", e, run_start.elapsed().as_millis());
        std::process::exit(1);
    }

    println!("Run complete: {} milliseconds.", run_start.elapsed().as_millis());
    Ok(())
}


async fn run(args: &Arguments, cwd: &Path, out_dir: &Path, physical_cores: usize) -> Result<(), PipelineError> {
    let config = Arc::new(build_run_config(args, cwd, out_dir, physical_cores)?);
    let jobs = MothurRunner::new(config.mothur.clone(), config.workers, config.job_timeout);
    let consensus = GconRunner::new(config.consensus_tool.clone(), config.job_timeout);
    let final_fasta = amplicon::run(config, jobs, consensus, raw_data_opener()).await?;
    info!("Final sequences: {}", final_fasta.display());
    Ok(())
}


#[cfg(feature = "bash5")]
fn raw_data_opener() -> Box<dyn RawDataOpener> {
    Box::new(amplicon_pipeline::utils::bash5::BasH5Opener)
}

#[cfg(not(feature = "bash5"))]
fn raw_data_opener() -> Box<dyn RawDataOpener> {
    Box::new(amplicon_pipeline::utils::ccs::NoRawSupport)
}


/// Creates the output directory and its log directory.
///
/// # Arguments
/// * `args` - The parsed command-line arguments.
/// * `cwd` - The current working directory.
/// # Returns
/// path to the output directory.
fn setup_output_dir(args: &Arguments, cwd: &Path) -> Result<PathBuf> {
    let path = PathBuf::from(&args.out_dir);
    let out_dir = if path.is_absolute() { path } else { cwd.join(path) };
    fs::create_dir_all(out_dir.join(LOG_DIR))?;
    Ok(out_dir)
}


/// Timestamped log lines to stderr and to `log/rna_pipeline.log`.
fn init_logging(out_dir: &Path, verbose: bool) -> Result<()> {
    let log_level = if verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    let sink = TeeWriter::open(&out_dir.join(LOG_DIR).join(PIPELINE_LOG))?;

    Builder::new()
        .filter_level(log_level)
        .format(|buf, record| {
            writeln!(
                buf,
                "[{}] {}: {}",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                record.level(),
                record.args()
            )
        })
        .target(Target::Pipe(Box::new(sink)))
        .init();
    Ok(())
}
