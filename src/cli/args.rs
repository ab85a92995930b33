use clap::Parser;

use crate::config::defs::{
    ClusterMethod, DEFAULT_DISTANCE, DEFAULT_FRACTION, DEFAULT_MIN_ACCURACY, DEFAULT_MIN_CCS_LENGTH,
    DEFAULT_MIN_CLUSTER_SIZE, DEFAULT_MIN_SNR, DEFAULT_PRECLUSTER_DIFFS, GCON_TAG, MOTHUR_TAG,
};

#[derive(Parser, Debug, Clone)]
#[command(name = "amplicon-pipeline", version, about = "Amplicon read clustering and consensus pipeline")]
pub struct Arguments {

    #[arg(help = "bas.h5, bax.h5, fofn, fastq or fasta input")]
    pub input_file: String,

    #[arg(short = 'v', long = "verbose", action)]
    pub verbose: bool,

    #[arg(short = 'o', long = "out", default_value = ".", help = "Output directory for all generated files")]
    pub out_dir: String,

    #[arg(long, default_value = MOTHUR_TAG, help = "Name or path of the mothur executable")]
    pub mothur: String,

    #[arg(long = "consensus-tool", default_value = GCON_TAG, help = "Name or path of the consensus tool")]
    pub consensus_tool: String,

    #[arg(short = 'n', long, help = "Processors for multi-process jobs; defaults to the physical core count")]
    pub workers: Option<usize>,

    #[arg(long, default_value_t = DEFAULT_MIN_ACCURACY)]
    pub min_accuracy: f64,

    #[arg(long, default_value_t = DEFAULT_MIN_CCS_LENGTH)]
    pub min_ccs_length: usize,

    #[arg(long, default_value_t = DEFAULT_MIN_SNR)]
    pub min_snr: f32,

    #[arg(long, default_value = "silva.both.align", help = "Reference alignment for align.seqs")]
    pub alignment_reference: String,

    #[arg(long, default_value = "silva.gold.align", help = "Reference for chimera.uchime")]
    pub chimera_reference: String,

    #[arg(long, default_value_t = DEFAULT_FRACTION, help = "Fraction of reads that must span the screening window")]
    pub fraction: f64,

    #[arg(long)]
    pub screen_min_length: Option<usize>,

    #[arg(long, default_value_t = DEFAULT_PRECLUSTER_DIFFS)]
    pub precluster_diffs: u32,

    #[arg(long, default_value = "average", value_enum)]
    pub clustering_method: ClusterMethod,

    #[arg(long, default_value_t = DEFAULT_DISTANCE)]
    pub distance: f64,

    #[arg(long, default_value_t = DEFAULT_MIN_CLUSTER_SIZE)]
    pub min_cluster_size: usize,

    #[arg(long, help = "Kill any external job running longer than this many seconds")]
    pub job_timeout: Option<u64>,
}
