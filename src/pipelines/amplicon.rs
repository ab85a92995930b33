use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::anyhow;
use log::{debug, error, info};

use crate::config::defs::{
    DataType, PipelineError, RunConfig, SeqKind, ACCNOS_SUFFIX, ALIGN_SEQS_JOB, ALIGN_SUFFIX,
    CHIMERA_UCHIME_JOB, CLUSTERS_SUFFIX, CLUSTER_JOB, CONSENSUS_CLEANUP_SUFFIX, CONSENSUS_SUFFIX,
    DIST_SEQS_JOB, DIST_SUFFIX, FASTA_SUFFIX, FASTQ_INFO_JOB, FASTQ_SUFFIX, FILTERED_FASTA_SUFFIX,
    FILTERED_FASTQ_SUFFIX, FILTER_SEQS_JOB, PRE_CLUSTER_JOB, QUAL_SUFFIX, REMOVE_SEQS_JOB,
    RESEQ_DIR, SCREEN_SEQS_JOB, SELECTED_SUFFIX, SUMMARY_SEQS_JOB, SUMMARY_SUFFIX,
    UCHIME_CLEANUP_SUFFIX, UCHIME_SCRATCH_TAIL, UNIQUE_SEQS_JOB,
};
use crate::utils::ccs::{extract_ccs, RawDataOpener};
use crate::utils::cluster::{
    clean_consensus_outputs, copy_fasta_list, read_cluster_list, select_consensus_files,
    separate_clusters, write_path_list,
};
use crate::utils::command::mothur::MothurJob;
use crate::utils::command::{ConsensusRunner, JobRunner};
use crate::utils::fastq::quality_filter;
use crate::utils::file::{
    check_outputs, commit_staged, discard_outputs, file_exists, link_input, output_names, outputs_exist,
    split_root_from_ext, staging_name, write_sentinel, write_staged, Presence,
};
use crate::utils::logs::StageCounter;
use crate::utils::stats::SummaryReader;


/// Screening window derived from the alignment summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScreeningBounds {
    pub max_start: u64,
    pub min_end: u64,
}

/// Suffix family of a sequence artifact, from its terminal extension.
pub fn seq_kind(path: &Path) -> SeqKind {
    match split_root_from_ext(path).1.as_deref() {
        Some(ALIGN_SUFFIX) => SeqKind::Align,
        _ => SeqKind::Fasta,
    }
}

/// Chimeras are removed only when the ID list names at least one read; a
/// missing or zero-byte list means the screened alignment passes through.
pub fn needs_chimera_removal(accnos: &Path) -> bool {
    file_exists(accnos)
}


/// State of one pipeline run: validated settings, stage numbering, the
/// collaborators that do the work and every artifact produced so far.
pub struct PipelineRun<J: JobRunner, C: ConsensusRunner> {
    config: Arc<RunConfig>,
    counter: StageCounter,
    jobs: J,
    consensus: C,
    raw_opener: Box<dyn RawDataOpener>,
    artifacts: Vec<PathBuf>,
}

impl<J: JobRunner, C: ConsensusRunner> PipelineRun<J, C> {
    pub fn new(config: Arc<RunConfig>, jobs: J, consensus: C, raw_opener: Box<dyn RawDataOpener>) -> Self {
        let counter = StageCounter::new(config.log_dir());
        PipelineRun { config, counter, jobs, consensus, raw_opener, artifacts: Vec::new() }
    }

    pub fn work_dir(&self) -> &Path {
        &self.config.out_dir
    }

    /// Artifacts returned by each stage so far, in order.
    pub fn artifacts(&self) -> &[PathBuf] {
        &self.artifacts
    }

    pub fn stages_started(&self) -> u32 {
        self.counter.current()
    }

    /// Numbers the stage, checks its inputs and names its outputs.
    fn process_setup(&mut self, inputs: &[&Path], stage: &str, suffixes: &[&str]) -> Result<Vec<PathBuf>, PipelineError> {
        let number = self.counter.advance();
        let first = inputs.first().ok_or_else(|| PipelineError::InvalidConfig(format!("{} has no input", stage)))?;
        info!("Preparing to run process {:02} {} on \"{}\"", number, stage, first.display());
        for input in inputs {
            if !input.exists() {
                error!("Required input \"{}\" for {} not found", input.display(), stage);
                return Err(PipelineError::MissingInput(input.to_path_buf()));
            }
        }
        Ok(output_names(self.work_dir(), first, suffixes))
    }

    /// Post-condition check, then the outputs join the artifact chain.
    fn process_cleanup(&mut self, outputs: Vec<PathBuf>) -> Result<Vec<PathBuf>, PipelineError> {
        check_outputs(&outputs)?;
        Ok(self.record(outputs))
    }

    fn record(&mut self, outputs: Vec<PathBuf>) -> Vec<PathBuf> {
        self.artifacts.extend(outputs.iter().cloned());
        outputs
    }

    /// Appends a summary line to the log of the stage most recently set up.
    fn note_stage(&self, stage: &str, summary: &str) -> Result<(), PipelineError> {
        let log_file = self.counter.log_file(stage);
        let mut log = OpenOptions::new().create(true).append(true).open(&log_file)?;
        writeln!(log, "{}", summary)?;
        debug!("{} log: {}", stage, log_file.display());
        Ok(())
    }

    /// Shared protocol of every external job: name, guard, run, validate.
    async fn mothur_stage(
        &mut self,
        inputs: &[&Path],
        stage: &str,
        suffixes: &[&str],
        presence: Presence,
        job: MothurJob,
    ) -> Result<Vec<PathBuf>, PipelineError> {
        let outputs = self.process_setup(inputs, stage, suffixes)?;
        if outputs_exist(&outputs, presence) {
            return Ok(self.record(outputs));
        }
        let log_file = self.counter.log_file(&job.name);
        if let Err(e) = self.jobs.run_job(&job, &self.config.out_dir, &log_file).await {
            discard_outputs(&outputs);
            return Err(e);
        }
        self.process_cleanup(outputs)
    }

    async fn mothur_stage_one(
        &mut self,
        inputs: &[&Path],
        stage: &str,
        suffix: &str,
        presence: Presence,
        job: MothurJob,
    ) -> Result<PathBuf, PipelineError> {
        Self::single(self.mothur_stage(inputs, stage, &[suffix], presence, job).await?)
    }

    fn single(outputs: Vec<PathBuf>) -> Result<PathBuf, PipelineError> {
        outputs.into_iter().next().ok_or_else(|| PipelineError::Other(anyhow!("stage declared no output")))
    }


    pub fn extract_raw_ccs(&mut self, raw_input: &Path) -> Result<PathBuf, PipelineError> {
        let outputs = self.process_setup(&[raw_input], "ExtractCcs", &[FASTQ_SUFFIX])?;
        if outputs_exist(&outputs, Presence::NonEmpty) {
            return Self::single(self.record(outputs));
        }
        let opener = self.raw_opener.as_ref();
        let (min_length, min_snr) = (self.config.min_ccs_length, self.config.min_snr);
        let stats = write_staged(&outputs[0], |staged| {
            let stats = extract_ccs(raw_input, staged, opener, min_length, min_snr)?;
            if stats.ccs_total == 0 {
                error!("Raw data file has no CCS data!");
                return Err(PipelineError::NoCcsData(raw_input.to_path_buf()));
            }
            Ok(stats)
        })?;
        self.note_stage(
            "ExtractCcs",
            &format!("{} of {} CCS reads from {} files passed", stats.pass_total, stats.ccs_total, stats.files.len()),
        )?;
        Self::single(self.process_cleanup(outputs)?)
    }

    pub fn filter_fastq(&mut self, fastq: &Path) -> Result<PathBuf, PipelineError> {
        let outputs = self.process_setup(&[fastq], "FilterQuality", &[FILTERED_FASTQ_SUFFIX])?;
        if outputs_exist(&outputs, Presence::NonEmpty) {
            return Self::single(self.record(outputs));
        }
        let min_accuracy = self.config.min_accuracy;
        let stats = write_staged(&outputs[0], |staged| Ok(quality_filter(fastq, staged, min_accuracy)?))?;
        self.note_stage(
            "FilterQuality",
            &format!("{} of {} reads passed (min accuracy {})", stats.passed, stats.total, min_accuracy),
        )?;
        Self::single(self.process_cleanup(outputs)?)
    }

    pub async fn separate_fastq(&mut self, fastq: &Path) -> Result<(PathBuf, PathBuf), PipelineError> {
        let job = MothurJob::new(FASTQ_INFO_JOB)
            .path_arg("fastq", fastq)
            .arg("fasta", "T")
            .arg("qfile", "T");
        let outputs = self
            .mothur_stage(&[fastq], "Fastq.Info", &[FASTA_SUFFIX, QUAL_SUFFIX], Presence::NonEmpty, job)
            .await?;
        pair(outputs, FASTQ_INFO_JOB)
    }

    pub async fn align_sequences(&mut self, fasta: &Path) -> Result<PathBuf, PipelineError> {
        let job = MothurJob::new(ALIGN_SEQS_JOB)
            .path_arg("fasta", fasta)
            .path_arg("reference", &self.config.alignment_reference)
            .arg("flip", "t");
        self.mothur_stage_one(&[fasta], "Align.Seqs", ALIGN_SUFFIX, Presence::NonEmpty, job).await
    }

    pub async fn summarize_sequences(&mut self, align: &Path) -> Result<PathBuf, PipelineError> {
        let job = MothurJob::new(SUMMARY_SEQS_JOB).path_arg("fasta", align);
        self.mothur_stage_one(&[align], "Summary.Seqs", SUMMARY_SUFFIX, Presence::NonEmpty, job).await
    }

    /// Scans the summary table for the screening window. Not a numbered stage.
    pub fn parse_summary_file(&self, summary: &Path) -> Result<ScreeningBounds, PipelineError> {
        info!("Preparing to run SummaryReader...");
        let reader = SummaryReader::from_path(summary, self.config.fraction)?;
        info!("Identifying full-length alignment positions...");
        let (start, end) = reader.full_length_positions();
        info!("Full-length start is NAST Alignment position {}", start);
        info!("Full-length end is NAST Alignment position {}", end);
        info!("Calculating minimum allowed alignment positions...");
        let (max_start, min_end) = reader.allowed_positions();
        info!("Maximum allowed start is NAST Alignment position {}", max_start);
        info!("Minimum allowed end is NAST Alignment position {}", min_end);
        Ok(ScreeningBounds { max_start, min_end })
    }

    pub async fn screen_sequences(&mut self, align: &Path, bounds: ScreeningBounds) -> Result<PathBuf, PipelineError> {
        let mut job = MothurJob::new(SCREEN_SEQS_JOB)
            .path_arg("fasta", align)
            .arg("start", bounds.max_start)
            .arg("end", bounds.min_end);
        if let Some(min_length) = self.config.screen_min_length {
            job = job.arg("minlength", min_length);
        }
        let suffix = seq_kind(align).screened_suffix();
        self.mothur_stage_one(&[align], "Screen.Seqs", suffix, Presence::NonEmpty, job).await
    }

    pub async fn find_chimeras(&mut self, align: &Path) -> Result<PathBuf, PipelineError> {
        let job = MothurJob::new(CHIMERA_UCHIME_JOB)
            .path_arg("fasta", align)
            .path_arg("reference", &self.config.chimera_reference);
        self.mothur_stage_one(&[align], "UCHIME", ACCNOS_SUFFIX, Presence::MayBeEmpty, job).await
    }

    /// Deletes the `*_formatted` scratch that chimera detection leaves in the
    /// working directory.
    pub fn cleanup_uchime_output(&mut self, screened: &Path) -> Result<PathBuf, PipelineError> {
        let outputs = self.process_setup(&[screened], "UchimeCleanup", &[UCHIME_CLEANUP_SUFFIX])?;
        if outputs_exist(&outputs, Presence::NonEmpty) {
            return Self::single(self.record(outputs));
        }
        for entry in fs::read_dir(self.work_dir())? {
            let path = entry?.path();
            let is_scratch = path
                .file_name()
                .map(|n| n.to_string_lossy().ends_with(UCHIME_SCRATCH_TAIL))
                .unwrap_or(false);
            if is_scratch && path.is_file() {
                debug!("Removing {}", path.display());
                fs::remove_file(&path)?;
            }
        }
        write_sentinel(&outputs[0])?;
        self.note_stage("UchimeCleanup", "scratch removed")?;
        Self::single(self.process_cleanup(outputs)?)
    }

    pub async fn remove_sequences(&mut self, align: &Path, accnos: &Path) -> Result<PathBuf, PipelineError> {
        let job = MothurJob::new(REMOVE_SEQS_JOB)
            .path_arg("fasta", align)
            .path_arg("accnos", accnos);
        let suffix = seq_kind(align).picked_suffix();
        self.mothur_stage_one(&[align, accnos], "Remove.Seqs", suffix, Presence::NonEmpty, job).await
    }

    pub async fn filter_sequences(&mut self, align: &Path, trump: &str) -> Result<PathBuf, PipelineError> {
        let job = MothurJob::new(FILTER_SEQS_JOB)
            .path_arg("fasta", align)
            .arg("vertical", "T")
            .arg("trump", trump);
        self.mothur_stage_one(&[align], "Filter.Seqs", FILTERED_FASTA_SUFFIX, Presence::NonEmpty, job).await
    }

    pub async fn unique_sequences(&mut self, fasta: &Path) -> Result<(PathBuf, PathBuf), PipelineError> {
        let job = MothurJob::new(UNIQUE_SEQS_JOB).path_arg("fasta", fasta);
        let suffixes = seq_kind(fasta).unique_suffixes();
        let outputs = self.mothur_stage(&[fasta], "Unique.Seqs", &suffixes, Presence::NonEmpty, job).await?;
        pair(outputs, UNIQUE_SEQS_JOB)
    }

    pub async fn precluster_sequences(&mut self, fasta: &Path, names: &Path) -> Result<(PathBuf, PathBuf), PipelineError> {
        let job = MothurJob::new(PRE_CLUSTER_JOB)
            .path_arg("fasta", fasta)
            .path_arg("name", names)
            .arg("diffs", self.config.precluster_diffs);
        let suffixes = seq_kind(fasta).precluster_suffixes();
        let outputs = self.mothur_stage(&[fasta, names], "Pre.Cluster", &suffixes, Presence::NonEmpty, job).await?;
        pair(outputs, PRE_CLUSTER_JOB)
    }

    pub async fn calculate_distance_matrix(&mut self, fasta: &Path) -> Result<PathBuf, PipelineError> {
        let job = MothurJob::new(DIST_SEQS_JOB)
            .path_arg("fasta", fasta)
            .arg("calc", "onegap")
            .arg("countends", "F")
            .arg("output", "lt");
        self.mothur_stage_one(&[fasta], "Dist.Seqs", DIST_SUFFIX, Presence::NonEmpty, job).await
    }

    pub async fn cluster_sequences(&mut self, distances: &Path, names: &Path) -> Result<PathBuf, PipelineError> {
        let method = self.config.cluster_method;
        let job = MothurJob::new(CLUSTER_JOB)
            .path_arg("phylip", distances)
            .path_arg("name", names)
            .arg("method", method.mothur_name());
        self.mothur_stage_one(&[distances, names], "Cluster", method.list_suffix(), Presence::NonEmpty, job).await
    }

    pub fn separate_cluster_sequences(&mut self, list_file: &Path, sequences: &Path) -> Result<PathBuf, PipelineError> {
        let outputs = self.process_setup(&[list_file, sequences], "ClusterSeparator", &[CLUSTERS_SUFFIX])?;
        if outputs_exist(&outputs, Presence::NonEmpty) {
            return Self::single(self.record(outputs));
        }
        let reseq_dir = self.work_dir().join(RESEQ_DIR);
        let (distance, min_size) = (self.config.distance, self.config.min_cluster_size);
        let clusters = write_staged(&outputs[0], |staged| {
            let clusters = separate_clusters(list_file, sequences, &reseq_dir, staged, distance, min_size)?;
            if clusters.is_empty() {
                return Err(PipelineError::Other(anyhow!(
                    "No clusters of at least {} reads at distance {}",
                    min_size,
                    distance
                )));
            }
            Ok(clusters)
        })?;
        self.note_stage("ClusterSeparator", &format!("{} clusters at distance {}", clusters.len(), distance))?;
        Self::single(self.process_cleanup(outputs)?)
    }

    /// Builds one consensus per cluster. Clusters whose consensus already
    /// exists are left alone; single-read clusters are their own consensus.
    pub async fn generate_consensus_sequences(&mut self, clusters_file: &Path) -> Result<PathBuf, PipelineError> {
        let outputs = self.process_setup(&[clusters_file], "ClusterResequencer", &[CONSENSUS_SUFFIX])?;
        if outputs_exist(&outputs, Presence::NonEmpty) {
            return Self::single(self.record(outputs));
        }
        let log_file = self.counter.log_file("gcon");
        let mut rows = Vec::new();
        for cluster in read_cluster_list(clusters_file)? {
            let consensus = cluster.consensus();
            let staged = staging_name(&consensus);
            if file_exists(&consensus) {
                debug!("Consensus for {} already present", cluster.name);
            } else if cluster.size == 1 {
                fs::copy(&cluster.members, &staged)?;
                commit_staged(&staged, &consensus)?;
            } else {
                let built = self
                    .consensus
                    .build_consensus(&cluster.members, &cluster.reference, &staged, &cluster.dir(), &log_file)
                    .await;
                if let Err(e) = built {
                    discard_outputs(&[staged]);
                    return Err(e);
                }
                commit_staged(&staged, &consensus)?;
            }
            rows.push((cluster.name, consensus));
        }
        write_staged(&outputs[0], |staged| Ok(write_path_list(staged, &rows)?))?;
        Self::single(self.process_cleanup(outputs)?)
    }

    pub fn cleanup_consensus_folder(&mut self, consensus_list: &Path) -> Result<PathBuf, PipelineError> {
        let outputs = self.process_setup(&[consensus_list], "ConsensusCleanup", &[CONSENSUS_CLEANUP_SUFFIX])?;
        if outputs_exist(&outputs, Presence::NonEmpty) {
            return Self::single(self.record(outputs));
        }
        write_staged(&outputs[0], |staged| Ok(clean_consensus_outputs(consensus_list, staged)?))?;
        self.note_stage("ConsensusCleanup", "cluster folders reduced to members, reference and consensus")?;
        Self::single(self.process_cleanup(outputs)?)
    }

    pub fn select_final_sequences(&mut self, consensus_list: &Path) -> Result<PathBuf, PipelineError> {
        let outputs = self.process_setup(&[consensus_list], "SequenceSelector", &[SELECTED_SUFFIX])?;
        if outputs_exist(&outputs, Presence::NonEmpty) {
            return Self::single(self.record(outputs));
        }
        let selected = write_staged(&outputs[0], |staged| Ok(select_consensus_files(consensus_list, staged)?))?;
        self.note_stage("SequenceSelector", &format!("{} sequences selected", selected.len()))?;
        Self::single(self.process_cleanup(outputs)?)
    }

    pub fn output_final_sequences(&mut self, selected: &Path) -> Result<PathBuf, PipelineError> {
        let outputs = self.process_setup(&[selected], "SequenceWriter", &[FASTA_SUFFIX])?;
        if outputs_exist(&outputs, Presence::NonEmpty) {
            return Self::single(self.record(outputs));
        }
        write_staged(&outputs[0], |staged| Ok(copy_fasta_list(selected, staged)?))?;
        self.note_stage("SequenceWriter", &format!("final sequences in {}", outputs[0].display()))?;
        Self::single(self.process_cleanup(outputs)?)
    }


    /// Runs every stage in order and returns the final FASTA.
    pub async fn run(&mut self) -> Result<PathBuf, PipelineError> {
        let sequence_file = link_input(&self.config.input_file, &self.config.out_dir)?;
        info!("Working on {} in {}", sequence_file.display(), self.config.out_dir.display());

        let reads = match self.config.data_type {
            DataType::RawInstrument => Some(self.extract_raw_ccs(&sequence_file)?),
            DataType::Reads => Some(sequence_file.clone()),
            DataType::PreAligned => None,
        };

        // Cluster members are drawn from the filtered reads when there are any
        let (fasta, member_source) = match reads {
            Some(fastq) => {
                let filtered = self.filter_fastq(&fastq)?;
                let (fasta, _qual) = self.separate_fastq(&filtered).await?;
                (fasta, filtered)
            }
            None => (sequence_file.clone(), sequence_file),
        };

        let aligned = self.align_sequences(&fasta).await?;
        let summary = self.summarize_sequences(&aligned).await?;
        let bounds = self.parse_summary_file(&summary)?;
        let screened = self.screen_sequences(&aligned, bounds).await?;

        let chimera_ids = self.find_chimeras(&screened).await?;
        self.cleanup_uchime_output(&screened)?;
        let no_chimeras = if needs_chimera_removal(&chimera_ids) {
            self.remove_sequences(&screened, &chimera_ids).await?
        } else {
            info!("No chimeras found, keeping {}", screened.display());
            screened
        };

        let filtered = self.filter_sequences(&no_chimeras, ".").await?;
        let (unique, names) = self.unique_sequences(&filtered).await?;
        let (preclustered, names) = self.precluster_sequences(&unique, &names).await?;

        let distances = self.calculate_distance_matrix(&preclustered).await?;
        let list_file = self.cluster_sequences(&distances, &names).await?;

        let clusters = self.separate_cluster_sequences(&list_file, &member_source)?;
        let consensus = self.generate_consensus_sequences(&clusters).await?;
        self.cleanup_consensus_folder(&consensus)?;
        let selected = self.select_final_sequences(&consensus)?;
        let final_fasta = self.output_final_sequences(&selected)?;

        info!("Final sequences written to {}", final_fasta.display());
        Ok(final_fasta)
    }
}

fn pair(outputs: Vec<PathBuf>, job: &str) -> Result<(PathBuf, PathBuf), PipelineError> {
    match <[PathBuf; 2]>::try_from(outputs) {
        Ok([first, second]) => Ok((first, second)),
        Err(_) => Err(PipelineError::Other(anyhow!("{} must yield two outputs", job))),
    }
}


/// Entry point used by `main`.
pub async fn run<J: JobRunner, C: ConsensusRunner>(
    config: Arc<RunConfig>,
    jobs: J,
    consensus: C,
    raw_opener: Box<dyn RawDataOpener>,
) -> Result<PathBuf, PipelineError> {
    PipelineRun::new(config, jobs, consensus, raw_opener).run().await
}


#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_seq_kind() {
        assert_eq!(seq_kind(Path::new("x.good.align")), SeqKind::Align);
        assert_eq!(seq_kind(Path::new("x.filter.fasta")), SeqKind::Fasta);
    }

    #[test]
    fn test_needs_chimera_removal() -> std::io::Result<()> {
        let dir = tempdir()?;
        let accnos = dir.path().join("x.good.uchime.accnos");
        assert!(!needs_chimera_removal(&accnos));
        fs::write(&accnos, "")?;
        assert!(!needs_chimera_removal(&accnos));
        fs::write(&accnos, "r7\n")?;
        assert!(needs_chimera_removal(&accnos));
        Ok(())
    }
}
