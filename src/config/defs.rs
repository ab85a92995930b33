use std::path::PathBuf;
use std::time::Duration;
use lazy_static::lazy_static;
use std::collections::HashSet;
use thiserror::Error;

// External software
pub const MOTHUR_TAG: &str = "mothur";
pub const GCON_TAG: &str = "gcon.py";

// Mothur jobs
pub const FASTQ_INFO_JOB: &str = "fastq.info";
pub const ALIGN_SEQS_JOB: &str = "align.seqs";
pub const SUMMARY_SEQS_JOB: &str = "summary.seqs";
pub const SCREEN_SEQS_JOB: &str = "screen.seqs";
pub const CHIMERA_UCHIME_JOB: &str = "chimera.uchime";
pub const REMOVE_SEQS_JOB: &str = "remove.seqs";
pub const FILTER_SEQS_JOB: &str = "filter.seqs";
pub const UNIQUE_SEQS_JOB: &str = "unique.seqs";
pub const PRE_CLUSTER_JOB: &str = "pre.cluster";
pub const DIST_SEQS_JOB: &str = "dist.seqs";
pub const CLUSTER_JOB: &str = "cluster";

lazy_static! {
    /// Mothur jobs that accept a `processors` argument.
    pub static ref MULTIPROCESS_JOBS: HashSet<&'static str> = {
        let mut s = HashSet::new();
        s.insert(ALIGN_SEQS_JOB);
        s.insert(SCREEN_SEQS_JOB);
        s.insert(CHIMERA_UCHIME_JOB);
        s.insert(FILTER_SEQS_JOB);
        s.insert(PRE_CLUSTER_JOB);
        s.insert(DIST_SEQS_JOB);
        s
    };
}

// Static Filenames
pub const LOG_DIR: &str = "log";
pub const RESEQ_DIR: &str = "reseq";
pub const PIPELINE_LOG: &str = "rna_pipeline.log";
pub const SENTINEL_TEXT: &str = "complete\n";

// Artifact suffixes
pub const FASTQ_SUFFIX: &str = "fastq";
pub const FILTERED_FASTQ_SUFFIX: &str = "filter.fastq";
pub const FASTA_SUFFIX: &str = "fasta";
pub const QUAL_SUFFIX: &str = "qual";
pub const ALIGN_SUFFIX: &str = "align";
pub const SUMMARY_SUFFIX: &str = "summary";
pub const ACCNOS_SUFFIX: &str = "uchime.accnos";
pub const UCHIME_CLEANUP_SUFFIX: &str = "uchime.cleanup";
pub const FILTERED_FASTA_SUFFIX: &str = "filter.fasta";
pub const NAMES_SUFFIX: &str = "names";
pub const PRECLUSTER_NAMES_SUFFIX: &str = "precluster.names";
pub const DIST_SUFFIX: &str = "phylip.dist";
pub const CLUSTERS_SUFFIX: &str = "list.clusters";
pub const CONSENSUS_SUFFIX: &str = "consensus";
pub const CONSENSUS_CLEANUP_SUFFIX: &str = "consensus.cleanup";
pub const SELECTED_SUFFIX: &str = "consensus.selected";
pub const UCHIME_SCRATCH_TAIL: &str = "_formatted";
/// Appended to an output name while an internal stage is still writing it.
pub const STAGING_TAIL: &str = ".partial";

// Input extensions, compound ones first
pub const RAW_EXTS: &[&'static str] = &["bas.h5", "bax.h5", "fofn"];
pub const RAW_H5_EXTS: &[&'static str] = &["bas.h5", "bax.h5"];
pub const FASTQ_EXTS: &[&'static str] = &["fastq", "fq"];
pub const FASTA_EXTS: &[&'static str] = &["fasta", "fa", "fsa"];

// Static Parameters
pub const DEFAULT_MIN_ACCURACY: f64 = 0.99;
pub const DEFAULT_MIN_CCS_LENGTH: usize = 500;
pub const DEFAULT_MIN_SNR: f32 = 3.75;
pub const DEFAULT_FRACTION: f64 = 0.8;
pub const DEFAULT_PRECLUSTER_DIFFS: u32 = 3;
pub const DEFAULT_DISTANCE: f64 = 0.03;
pub const DEFAULT_MIN_CLUSTER_SIZE: usize = 3;
pub const PHRED_OFFSET: u8 = 33;


/// Entry branch of a run, decided once from the input file's extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    RawInstrument,
    Reads,
    PreAligned,
}

/// What a sequence artifact holds; selects the suffix family for stages
/// that accept either an alignment or a plain FASTA.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeqKind {
    Align,
    Fasta,
}

impl SeqKind {
    pub fn screened_suffix(&self) -> &'static str {
        match self {
            SeqKind::Align => "good.align",
            SeqKind::Fasta => "good.fasta",
        }
    }

    pub fn picked_suffix(&self) -> &'static str {
        match self {
            SeqKind::Align => "pick.align",
            SeqKind::Fasta => "pick.fasta",
        }
    }

    pub fn unique_suffixes(&self) -> [&'static str; 2] {
        match self {
            SeqKind::Align => ["unique.align", NAMES_SUFFIX],
            SeqKind::Fasta => ["unique.fasta", NAMES_SUFFIX],
        }
    }

    pub fn precluster_suffixes(&self) -> [&'static str; 2] {
        match self {
            SeqKind::Align => ["precluster.align", PRECLUSTER_NAMES_SUFFIX],
            SeqKind::Fasta => ["precluster.fasta", PRECLUSTER_NAMES_SUFFIX],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum ClusterMethod {
    Nearest,
    #[default]
    Average,
    Furthest,
}

impl ClusterMethod {
    pub fn list_suffix(&self) -> &'static str {
        match self {
            ClusterMethod::Nearest => "nn.list",
            ClusterMethod::Average => "an.list",
            ClusterMethod::Furthest => "fn.list",
        }
    }

    pub fn mothur_name(&self) -> &'static str {
        match self {
            ClusterMethod::Nearest => "nearest",
            ClusterMethod::Average => "average",
            ClusterMethod::Furthest => "furthest",
        }
    }
}


/// Validated, immutable settings for one run.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub input_file: PathBuf,
    pub out_dir: PathBuf,
    pub data_type: DataType,
    pub mothur: PathBuf,
    pub consensus_tool: PathBuf,
    pub workers: usize,
    pub min_accuracy: f64,
    pub min_ccs_length: usize,
    pub min_snr: f32,
    pub alignment_reference: PathBuf,
    pub chimera_reference: PathBuf,
    pub fraction: f64,
    pub screen_min_length: Option<usize>,
    pub precluster_diffs: u32,
    pub cluster_method: ClusterMethod,
    pub distance: f64,
    pub min_cluster_size: usize,
    pub job_timeout: Option<Duration>,
}

impl RunConfig {
    pub fn log_dir(&self) -> PathBuf {
        self.out_dir.join(LOG_DIR)
    }

    pub fn pipeline_log(&self) -> PathBuf {
        self.log_dir().join(PIPELINE_LOG)
    }
}


#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Sequence file '{0}' must be a bas.h5/bax.h5 file, a fofn of such files, a fastq or a fasta file")]
    UnsupportedInput(PathBuf),

    #[error("Executable '{tool}' not found or not executable: {path}")]
    MissingExecutable { tool: String, path: PathBuf },

    #[error("Required input '{0}' not found")]
    MissingInput(PathBuf),

    #[error("Expected output '{0}' not found!")]
    MissingOutput(PathBuf),

    #[error("Raw data file '{0}' has no CCS data!")]
    NoCcsData(PathBuf),

    #[error("Tool {tool} failed: {error}")]
    ToolExecution { tool: String, error: String },

    #[error("Job {job} exited with {status}; see {}", .log.display())]
    JobFailed { job: String, status: String, log: PathBuf },

    #[error("Job {job} exceeded the {secs}s timeout; see {}", .log.display())]
    JobTimeout { job: String, secs: u64, log: PathBuf },

    #[error("I/O error: {0}")]
    IOError(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<std::io::Error> for PipelineError {
    fn from(e: std::io::Error) -> Self {
        PipelineError::IOError(e.to_string())
    }
}
