use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use tempfile::{tempdir, TempDir};

use amplicon_pipeline::config::defs::{ClusterMethod, DataType, PipelineError, RunConfig, LOG_DIR};
use amplicon_pipeline::pipelines::amplicon::PipelineRun;
use amplicon_pipeline::utils::ccs::{CcsRead, RawDataOpener, Zmw};
use amplicon_pipeline::utils::command::mothur::MothurJob;
use amplicon_pipeline::utils::command::{ConsensusRunner, JobRunner};
use amplicon_pipeline::utils::fastx::{read_records, write_fasta_record};
use amplicon_pipeline::utils::file::output_name;


type CallLog = Arc<Mutex<Vec<String>>>;

/// Stands in for mothur: writes the files each job would produce.
struct FakeMothur {
    calls: CallLog,
    chimeras: Vec<String>,
    silent_job: Option<String>,
    failing_job: Option<String>,
}

impl FakeMothur {
    fn new(calls: CallLog) -> Self {
        FakeMothur { calls, chimeras: Vec::new(), silent_job: None, failing_job: None }
    }

    fn arg(job: &MothurJob, key: &str) -> Result<PathBuf> {
        job.args
            .get(key)
            .map(PathBuf::from)
            .ok_or_else(|| anyhow!("{} called without {}", job.name, key))
    }

    fn copy_fasta(src: &Path, dst: &Path, exclude: &[String]) -> Result<Vec<String>> {
        let mut out = fs::File::create(dst)?;
        let mut ids = Vec::new();
        for record in read_records(src)? {
            if exclude.iter().any(|id| id == record.id()) {
                continue;
            }
            write_fasta_record(&mut out, record.id(), None, record.seq())?;
            ids.push(record.id().to_string());
        }
        Ok(ids)
    }

    fn write_names(path: &Path, ids: &[String]) -> Result<()> {
        let mut out = fs::File::create(path)?;
        for id in ids {
            writeln!(out, "{}\t{}", id, id)?;
        }
        Ok(())
    }

    fn execute(&self, job: &MothurJob, work: &Path) -> Result<()> {
        match job.name.as_str() {
            "fastq.info" => {
                let fastq = Self::arg(job, "fastq")?;
                let mut fasta = fs::File::create(output_name(work, &fastq, "fasta"))?;
                let mut qual = fs::File::create(output_name(work, &fastq, "qual"))?;
                for record in read_records(&fastq)? {
                    write_fasta_record(&mut fasta, record.id(), None, record.seq())?;
                    writeln!(qual, ">{}\n{}", record.id(), vec!["40"; record.seq().len()].join(" "))?;
                }
            }
            "align.seqs" | "screen.seqs" | "filter.seqs" => {
                let input = Self::arg(job, "fasta")?;
                let suffix = match job.name.as_str() {
                    "align.seqs" => "align",
                    "screen.seqs" => "good.align",
                    _ => "filter.fasta",
                };
                Self::copy_fasta(&input, &output_name(work, &input, suffix), &[])?;
            }
            "summary.seqs" => {
                let input = Self::arg(job, "fasta")?;
                let mut out = fs::File::create(output_name(work, &input, "summary"))?;
                writeln!(out, "seqname\tstart\tend\tnbases\tambigs\tpolymer\tnumSeqs")?;
                for record in read_records(&input)? {
                    let len = record.seq().len();
                    writeln!(out, "{}\t1\t{}\t{}\t0\t3\t1", record.id(), len, len)?;
                }
            }
            "chimera.uchime" => {
                let input = Self::arg(job, "fasta")?;
                let mut out = fs::File::create(output_name(work, &input, "uchime.accnos"))?;
                for id in &self.chimeras {
                    writeln!(out, "{}", id)?;
                }
                fs::write(work.join("scratch.fasta_formatted"), "x")?;
            }
            "remove.seqs" => {
                let input = Self::arg(job, "fasta")?;
                Self::copy_fasta(&input, &output_name(work, &input, "pick.align"), &self.chimeras)?;
            }
            "unique.seqs" => {
                let input = Self::arg(job, "fasta")?;
                let ids = Self::copy_fasta(&input, &output_name(work, &input, "unique.fasta"), &[])?;
                Self::write_names(&output_name(work, &input, "names"), &ids)?;
            }
            "pre.cluster" => {
                let input = Self::arg(job, "fasta")?;
                let ids = Self::copy_fasta(&input, &output_name(work, &input, "precluster.fasta"), &[])?;
                Self::write_names(&output_name(work, &input, "precluster.names"), &ids)?;
            }
            "dist.seqs" => {
                let input = Self::arg(job, "fasta")?;
                fs::write(output_name(work, &input, "phylip.dist"), "3\nr1\nr2\t0.01\nr3\t0.01\t0.02\n")?;
            }
            "cluster" => {
                let phylip = Self::arg(job, "phylip")?;
                let names = fs::read_to_string(Self::arg(job, "name")?)?;
                let ids: Vec<&str> = names.lines().filter_map(|l| l.split('\t').nth(1)).collect();
                let singles = ids.join("\t");
                let list = format!(
                    "label\tnumOtus\nunique\t{}\t{}\n0.03\t1\t{}\n",
                    ids.len(),
                    singles,
                    ids.join(",")
                );
                fs::write(output_name(work, &phylip, "an.list"), list)?;
            }
            other => return Err(anyhow!("unexpected job {}", other)),
        }
        Ok(())
    }
}

impl JobRunner for FakeMothur {
    async fn run_job(&self, job: &MothurJob, work_dir: &Path, log_file: &Path) -> Result<(), PipelineError> {
        self.calls.lock().unwrap().push(job.name.clone());
        fs::write(log_file, job.render(2))?;
        if self.silent_job.as_deref() == Some(job.name.as_str()) {
            return Ok(());
        }
        self.execute(job, work_dir)?;
        if self.failing_job.as_deref() == Some(job.name.as_str()) {
            return Err(PipelineError::JobFailed {
                job: job.name.clone(),
                status: "exit status: 137".to_string(),
                log: log_file.to_path_buf(),
            });
        }
        Ok(())
    }
}


/// Writes the first member as the consensus.
struct FakeGcon {
    calls: CallLog,
}

impl ConsensusRunner for FakeGcon {
    async fn build_consensus(
        &self,
        members: &Path,
        _reference: &Path,
        output: &Path,
        _work_dir: &Path,
        _log_file: &Path,
    ) -> Result<(), PipelineError> {
        self.calls.lock().unwrap().push(members.display().to_string());
        let records = read_records(members)?;
        let first = records.first().ok_or_else(|| anyhow!("empty cluster"))?;
        let mut out = fs::File::create(output)?;
        write_fasta_record(&mut out, "consensus", None, first.seq())?;
        Ok(())
    }
}


/// Gets partway through a consensus and dies.
struct CrashingGcon;

impl ConsensusRunner for CrashingGcon {
    async fn build_consensus(
        &self,
        _members: &Path,
        _reference: &Path,
        output: &Path,
        _work_dir: &Path,
        log_file: &Path,
    ) -> Result<(), PipelineError> {
        fs::write(output, ">consensus\nACGT")?;
        Err(PipelineError::JobFailed {
            job: "gcon".to_string(),
            status: "signal: 9 (SIGKILL)".to_string(),
            log: log_file.to_path_buf(),
        })
    }
}


/// Raw data keyed by file name; records every file it is asked to open.
struct FakeRawData {
    movies: HashMap<String, Vec<Zmw>>,
    opened: CallLog,
}

impl RawDataOpener for FakeRawData {
    fn open(&self, path: &Path) -> Result<Vec<Zmw>> {
        let key = path.file_name().unwrap().to_string_lossy().into_owned();
        self.opened.lock().unwrap().push(key.clone());
        self.movies.get(&key).cloned().ok_or_else(|| anyhow!("no raw data for {}", key))
    }
}

fn zmw(name: &str, len: usize, snr: f32) -> Zmw {
    Zmw {
        name: name.to_string(),
        ccs: Some(CcsRead { seq: b"ACGT".repeat(len / 4), qual: vec![40; len / 4 * 4] }),
        snr: vec![snr; 4],
    }
}


struct Workspace {
    _dir: TempDir,
    out_dir: PathBuf,
    input: PathBuf,
}

fn workspace(input_name: &str, contents: &str) -> Result<Workspace> {
    let dir = tempdir()?;
    let out_dir = dir.path().join("out");
    fs::create_dir_all(out_dir.join(LOG_DIR))?;
    let input = dir.path().join(input_name);
    fs::write(&input, contents)?;
    Ok(Workspace { out_dir, input, _dir: dir })
}

fn reads_fastq() -> String {
    let seqs = ["ACGTACGTACGTACGTACGT", "ACGTACGTACGTACGTACGA", "ACGTACGTACGTACGTACCA", "ACGTACGTACGTACGTAGGA"];
    seqs.iter()
        .enumerate()
        .map(|(i, s)| format!("@r{}\n{}\n+\n{}\n", i + 1, s, "I".repeat(s.len())))
        .collect()
}

fn config(ws: &Workspace, data_type: DataType) -> Arc<RunConfig> {
    Arc::new(RunConfig {
        input_file: ws.input.clone(),
        out_dir: ws.out_dir.clone(),
        data_type,
        mothur: PathBuf::from("/usr/bin/mothur"),
        consensus_tool: PathBuf::from("/usr/bin/gcon.py"),
        workers: 2,
        min_accuracy: 0.99,
        min_ccs_length: 8,
        min_snr: 3.75,
        alignment_reference: PathBuf::from("silva.both.align"),
        chimera_reference: PathBuf::from("silva.gold.align"),
        fraction: 0.8,
        screen_min_length: None,
        precluster_diffs: 3,
        cluster_method: ClusterMethod::Average,
        distance: 0.03,
        min_cluster_size: 3,
        job_timeout: None,
    })
}

fn no_raw() -> Box<dyn RawDataOpener> {
    Box::new(FakeRawData { movies: HashMap::new(), opened: CallLog::default() })
}

fn calls(log: &CallLog) -> Vec<String> {
    log.lock().unwrap().clone()
}

const ALL_JOBS: [&str; 10] = [
    "fastq.info",
    "align.seqs",
    "summary.seqs",
    "screen.seqs",
    "chimera.uchime",
    "filter.seqs",
    "unique.seqs",
    "pre.cluster",
    "dist.seqs",
    "cluster",
];


#[tokio::test]
async fn test_reads_run_produces_named_consensus() -> Result<()> {
    let ws = workspace("reads.fastq", &reads_fastq())?;
    let jobs = CallLog::default();
    let gcon = CallLog::default();
    let mut run = PipelineRun::new(
        config(&ws, DataType::Reads),
        FakeMothur::new(jobs.clone()),
        FakeGcon { calls: gcon.clone() },
        no_raw(),
    );

    let final_fasta = run.run().await?;

    assert_eq!(calls(&jobs), ALL_JOBS);
    assert_eq!(calls(&gcon).len(), 1);
    let records = read_records(&final_fasta)?;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].id(), "Cluster0001_NumReads4");
    assert_eq!(records[0].seq(), b"ACGTACGTACGTACGTACGT");

    assert!(ws.out_dir.join("reads.fastq").exists());
    assert!(!ws.out_dir.join("scratch.fasta_formatted").exists());
    assert!(ws.out_dir.join("log").join("process01.FilterQuality.logfile").exists());
    assert!(ws.out_dir.join("log").join("process02.fastq.info.logfile").exists());
    assert!(ws.out_dir.join("reseq").join("Cluster0001").join("Cluster0001_consensus.fasta").exists());
    Ok(())
}

#[tokio::test]
async fn test_second_run_executes_nothing() -> Result<()> {
    let ws = workspace("reads.fastq", &reads_fastq())?;

    let first_jobs = CallLog::default();
    let mut first = PipelineRun::new(
        config(&ws, DataType::Reads),
        FakeMothur::new(first_jobs.clone()),
        FakeGcon { calls: CallLog::default() },
        no_raw(),
    );
    let final_fasta = first.run().await?;
    let first_bytes = fs::read(&final_fasta)?;

    let second_jobs = CallLog::default();
    let second_gcon = CallLog::default();
    let mut second = PipelineRun::new(
        config(&ws, DataType::Reads),
        FakeMothur::new(second_jobs.clone()),
        FakeGcon { calls: second_gcon.clone() },
        no_raw(),
    );
    let again = second.run().await?;

    assert!(calls(&second_jobs).is_empty());
    assert!(calls(&second_gcon).is_empty());
    assert_eq!(again, final_fasta);
    assert_eq!(fs::read(&again)?, first_bytes);
    assert_eq!(first.stages_started(), second.stages_started());
    Ok(())
}

#[tokio::test]
async fn test_missing_output_halts_and_rerun_resumes() -> Result<()> {
    let ws = workspace("reads.fastq", &reads_fastq())?;

    let jobs = CallLog::default();
    let mut broken = FakeMothur::new(jobs.clone());
    broken.silent_job = Some("cluster".to_string());
    let mut run = PipelineRun::new(
        config(&ws, DataType::Reads),
        broken,
        FakeGcon { calls: CallLog::default() },
        no_raw(),
    );
    match run.run().await {
        Err(PipelineError::MissingOutput(path)) => {
            assert!(path.to_string_lossy().ends_with(".phylip.an.list"));
        }
        other => panic!("expected a missing output, got {:?}", other),
    }
    assert_eq!(calls(&jobs).last().map(String::as_str), Some("cluster"));
    assert!(!ws.out_dir.join("reseq").exists());

    let resumed = CallLog::default();
    let mut rerun = PipelineRun::new(
        config(&ws, DataType::Reads),
        FakeMothur::new(resumed.clone()),
        FakeGcon { calls: CallLog::default() },
        no_raw(),
    );
    rerun.run().await?;
    assert_eq!(calls(&resumed), vec!["cluster"]);
    Ok(())
}

#[tokio::test]
async fn test_chimeras_are_removed_when_listed() -> Result<()> {
    let ws = workspace("reads.fastq", &reads_fastq())?;
    let jobs = CallLog::default();
    let mut mothur = FakeMothur::new(jobs.clone());
    mothur.chimeras = vec!["r2".to_string()];
    let mut run = PipelineRun::new(
        config(&ws, DataType::Reads),
        mothur,
        FakeGcon { calls: CallLog::default() },
        no_raw(),
    );

    let final_fasta = run.run().await?;

    let called = calls(&jobs);
    let remove_at = called.iter().position(|j| j == "remove.seqs").expect("remove.seqs ran");
    assert_eq!(called[remove_at + 1], "filter.seqs");
    assert!(run.artifacts().iter().any(|p| p.to_string_lossy().ends_with(".good.pick.align")));
    assert!(run.artifacts().iter().any(|p| p.to_string_lossy().ends_with(".good.pick.filter.fasta")));

    let records = read_records(&final_fasta)?;
    assert_eq!(records[0].id(), "Cluster0001_NumReads3");
    Ok(())
}

#[tokio::test]
async fn test_empty_chimera_list_passes_screened_alignment_through() -> Result<()> {
    let ws = workspace("reads.fastq", &reads_fastq())?;
    let jobs = CallLog::default();
    let mut run = PipelineRun::new(
        config(&ws, DataType::Reads),
        FakeMothur::new(jobs.clone()),
        FakeGcon { calls: CallLog::default() },
        no_raw(),
    );
    run.run().await?;

    assert!(!calls(&jobs).contains(&"remove.seqs".to_string()));
    let accnos = ws.out_dir.join("reads.filter.good.uchime.accnos");
    assert_eq!(fs::metadata(&accnos)?.len(), 0);
    assert!(run.artifacts().contains(&ws.out_dir.join("reads.filter.good.filter.fasta")));
    Ok(())
}

#[tokio::test]
async fn test_fasta_input_skips_read_stages() -> Result<()> {
    let fasta = ">s1\nACGTACGTAC\n>s2\nACGTACGTAA\n>s3\nACGTACGTCC\n";
    let ws = workspace("seqs.fasta", fasta)?;
    let jobs = CallLog::default();
    let mut run = PipelineRun::new(
        config(&ws, DataType::PreAligned),
        FakeMothur::new(jobs.clone()),
        FakeGcon { calls: CallLog::default() },
        no_raw(),
    );

    let final_fasta = run.run().await?;

    assert_eq!(calls(&jobs), &ALL_JOBS[1..]);
    assert_eq!(read_records(&final_fasta)?[0].id(), "Cluster0001_NumReads3");
    Ok(())
}

#[tokio::test]
async fn test_fofn_extracts_each_file_once_into_one_fastq() -> Result<()> {
    let ws = workspace("movies.fofn", "m1.1.bax.h5\n\nm1.2.bax.h5\n")?;
    let input_dir = ws.input.parent().unwrap().to_path_buf();
    fs::write(input_dir.join("m1.1.bax.h5"), "")?;
    fs::write(input_dir.join("m1.2.bax.h5"), "")?;

    let opened = CallLog::default();
    let raw = FakeRawData {
        movies: HashMap::from([
            ("m1.1.bax.h5".to_string(), vec![zmw("m1/1/ccs", 12, 5.0), zmw("m1/2/ccs", 4, 5.0)]),
            ("m1.2.bax.h5".to_string(), vec![zmw("m1/3/ccs", 12, 5.0), zmw("m1/4/ccs", 12, 1.0)]),
        ]),
        opened: opened.clone(),
    };
    let mut run = PipelineRun::new(
        config(&ws, DataType::RawInstrument),
        FakeMothur::new(CallLog::default()),
        FakeGcon { calls: CallLog::default() },
        Box::new(raw),
    );

    let fofn = ws.out_dir.join("movies.fofn");
    fs::copy(&ws.input, &fofn)?;
    fs::copy(input_dir.join("m1.1.bax.h5"), ws.out_dir.join("m1.1.bax.h5"))?;
    fs::copy(input_dir.join("m1.2.bax.h5"), ws.out_dir.join("m1.2.bax.h5"))?;

    let fastq = run.extract_raw_ccs(&fofn)?;
    assert_eq!(fastq, ws.out_dir.join("movies.fastq"));
    assert_eq!(calls(&opened), vec!["m1.1.bax.h5", "m1.2.bax.h5"]);

    let filtered = run.filter_fastq(&fastq)?;
    let ids: Vec<String> = read_records(&filtered)?.iter().map(|r| r.id().to_string()).collect();
    assert_eq!(ids, vec!["m1/1/ccs", "m1/3/ccs"]);
    Ok(())
}

#[tokio::test]
async fn test_raw_input_without_ccs_reads_fails() -> Result<()> {
    let ws = workspace("empty.bax.h5", "")?;
    let raw = FakeRawData {
        movies: HashMap::from([("empty.bax.h5".to_string(), Vec::new())]),
        opened: CallLog::default(),
    };
    let jobs = CallLog::default();
    let mut run = PipelineRun::new(
        config(&ws, DataType::RawInstrument),
        FakeMothur::new(jobs.clone()),
        FakeGcon { calls: CallLog::default() },
        Box::new(raw),
    );

    assert!(matches!(run.run().await, Err(PipelineError::NoCcsData(_))));
    assert!(calls(&jobs).is_empty());
    assert!(!ws.out_dir.join("empty.fastq").exists());
    Ok(())
}

#[tokio::test]
async fn test_failed_extraction_is_redone_on_rerun() -> Result<()> {
    let ws = workspace("movies.fofn", "m1.1.bax.h5\nm1.2.bax.h5\n")?;
    let fofn = ws.out_dir.join("movies.fofn");
    fs::copy(&ws.input, &fofn)?;
    fs::write(ws.out_dir.join("m1.1.bax.h5"), "")?;
    fs::write(ws.out_dir.join("m1.2.bax.h5"), "")?;
    let part1 = ("m1.1.bax.h5".to_string(), vec![zmw("m1/1/ccs", 12, 5.0)]);
    let part2 = ("m1.2.bax.h5".to_string(), vec![zmw("m1/3/ccs", 12, 5.0)]);

    let unreadable = FakeRawData { movies: HashMap::from([part1.clone()]), opened: CallLog::default() };
    let mut first = PipelineRun::new(
        config(&ws, DataType::RawInstrument),
        FakeMothur::new(CallLog::default()),
        FakeGcon { calls: CallLog::default() },
        Box::new(unreadable),
    );
    assert!(first.extract_raw_ccs(&fofn).is_err());
    let fastq = ws.out_dir.join("movies.fastq");
    assert!(!fastq.exists());
    assert!(!ws.out_dir.join("movies.fastq.partial").exists());

    let opened = CallLog::default();
    let readable = FakeRawData { movies: HashMap::from([part1, part2]), opened: opened.clone() };
    let mut rerun = PipelineRun::new(
        config(&ws, DataType::RawInstrument),
        FakeMothur::new(CallLog::default()),
        FakeGcon { calls: CallLog::default() },
        Box::new(readable),
    );
    assert_eq!(rerun.extract_raw_ccs(&fofn)?, fastq);
    assert_eq!(calls(&opened), vec!["m1.1.bax.h5", "m1.2.bax.h5"]);
    assert_eq!(read_records(&fastq)?.len(), 2);
    Ok(())
}

#[tokio::test]
async fn test_malformed_reads_leave_no_filtered_output() -> Result<()> {
    let ws = workspace("reads.fastq", "@a\nACGT\n+\nIIII\n@b\nACGT\nIIII\n@c\nACGT\n+\nIIII\n")?;
    let mut first = PipelineRun::new(
        config(&ws, DataType::Reads),
        FakeMothur::new(CallLog::default()),
        FakeGcon { calls: CallLog::default() },
        no_raw(),
    );
    assert!(first.filter_fastq(&ws.input).is_err());
    let filtered = ws.out_dir.join("reads.filter.fastq");
    assert!(!filtered.exists());
    assert!(!ws.out_dir.join("reads.filter.fastq.partial").exists());

    fs::write(&ws.input, "@a\nACGT\n+\nIIII\n@b\nACGT\n+\nIIII\n@c\nACGT\n+\nIIII\n")?;
    let mut rerun = PipelineRun::new(
        config(&ws, DataType::Reads),
        FakeMothur::new(CallLog::default()),
        FakeGcon { calls: CallLog::default() },
        no_raw(),
    );
    assert_eq!(rerun.filter_fastq(&ws.input)?, filtered);
    assert_eq!(read_records(&filtered)?.len(), 3);
    assert!(ws.out_dir.join("log").join("process01.FilterQuality.logfile").exists());
    Ok(())
}

#[tokio::test]
async fn test_failed_job_output_is_not_reused() -> Result<()> {
    let ws = workspace("reads.fastq", &reads_fastq())?;
    let mut crashing = FakeMothur::new(CallLog::default());
    crashing.failing_job = Some("align.seqs".to_string());
    let mut first = PipelineRun::new(
        config(&ws, DataType::Reads),
        crashing,
        FakeGcon { calls: CallLog::default() },
        no_raw(),
    );
    assert!(matches!(first.run().await, Err(PipelineError::JobFailed { .. })));
    assert!(!ws.out_dir.join("reads.filter.align").exists());

    let jobs = CallLog::default();
    let mut rerun = PipelineRun::new(
        config(&ws, DataType::Reads),
        FakeMothur::new(jobs.clone()),
        FakeGcon { calls: CallLog::default() },
        no_raw(),
    );
    rerun.run().await?;
    assert_eq!(calls(&jobs), &ALL_JOBS[1..]);
    Ok(())
}

#[tokio::test]
async fn test_crashed_consensus_is_rebuilt() -> Result<()> {
    let ws = workspace("reads.fastq", &reads_fastq())?;
    let mut first = PipelineRun::new(
        config(&ws, DataType::Reads),
        FakeMothur::new(CallLog::default()),
        CrashingGcon,
        no_raw(),
    );
    assert!(matches!(first.run().await, Err(PipelineError::JobFailed { .. })));
    let cluster_dir = ws.out_dir.join("reseq").join("Cluster0001");
    assert!(!cluster_dir.join("Cluster0001_consensus.fasta").exists());
    assert!(!cluster_dir.join("Cluster0001_consensus.fasta.partial").exists());

    let gcon = CallLog::default();
    let mut rerun = PipelineRun::new(
        config(&ws, DataType::Reads),
        FakeMothur::new(CallLog::default()),
        FakeGcon { calls: gcon.clone() },
        no_raw(),
    );
    let final_fasta = rerun.run().await?;
    assert_eq!(calls(&gcon).len(), 1);
    assert_eq!(read_records(&final_fasta)?[0].seq(), b"ACGTACGTACGTACGTACGT");
    Ok(())
}
