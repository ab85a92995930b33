// src/utils/ccs.rs: circular-consensus read extraction from raw instrument data
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};
use log::{error, info};

use crate::config::defs::{PHRED_OFFSET, RAW_H5_EXTS};
use crate::utils::fastx::write_fastq_record;
use crate::utils::file::split_root_from_ext;


/// Consensus read of one ZMW. Qualities are raw Phred values, not ASCII.
#[derive(Debug, Clone, PartialEq)]
pub struct CcsRead {
    pub seq: Vec<u8>,
    pub qual: Vec<u8>,
}

/// One observation unit: its read name, CCS read if any, and per-channel SNR.
#[derive(Debug, Clone, PartialEq)]
pub struct Zmw {
    pub name: String,
    pub ccs: Option<CcsRead>,
    pub snr: Vec<f32>,
}

/// Loads the ZMWs of one raw-data file.
pub trait RawDataOpener {
    fn open(&self, path: &Path) -> Result<Vec<Zmw>>;
}

/// Stand-in for builds without HDF5 support; every raw file is refused.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoRawSupport;

impl RawDataOpener for NoRawSupport {
    fn open(&self, path: &Path) -> Result<Vec<Zmw>> {
        Err(anyhow!(
            "Cannot read {}: raw instrument data needs a build with the `bash5` feature",
            path.display()
        ))
    }
}


#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileCcsStats {
    pub file: PathBuf,
    pub ccs: u64,
    pub passed: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ExtractStats {
    pub files: Vec<FileCcsStats>,
    pub ccs_total: u64,
    pub pass_total: u64,
}


/// round(100 * passed / total), and 0 when nothing was observed.
pub fn pass_percentage(passed: u64, total: u64) -> u64 {
    if total == 0 {
        return 0;
    }
    (100.0 * passed as f64 / total as f64).round() as u64
}


pub fn is_raw_h5(path: &Path) -> bool {
    matches!(split_root_from_ext(path).1, Some(ext) if RAW_H5_EXTS.iter().any(|e| e.eq_ignore_ascii_case(&ext)))
}

/// Expands a raw input into the list of raw-data files it names: a single
/// bas.h5/bax.h5, or every entry of a FOFN manifest.
pub fn parse_input_file(input: &Path) -> Result<Vec<PathBuf>> {
    if is_raw_h5(input) {
        return Ok(vec![input.to_path_buf()]);
    }
    match split_root_from_ext(input).1.as_deref() {
        Some(ext) if ext.eq_ignore_ascii_case("fofn") => parse_fofn(input),
        _ => {
            let msg = format!("Input file must be BasH5, BaxH5, or FOFN: {}", input.display());
            error!("{}", msg);
            Err(anyhow!(msg))
        }
    }
}

/// Reads a FOFN: one path per line, blank lines skipped. Relative entries
/// are resolved against the manifest's directory.
pub fn parse_fofn(fofn: &Path) -> Result<Vec<PathBuf>> {
    let base = fs::canonicalize(fofn)?
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_default();
    let reader = BufReader::new(File::open(fofn)?);
    let mut entries = Vec::new();
    for line in reader.lines() {
        let line = line?;
        let entry = line.trim();
        if entry.is_empty() {
            continue;
        }
        let path = PathBuf::from(entry);
        if !is_raw_h5(&path) {
            let msg = format!("FOFN entries must be BasH5 or BaxH5, found '{}'", entry);
            error!("{}", msg);
            return Err(anyhow!(msg));
        }
        entries.push(if path.is_absolute() { path } else { base.join(path) });
    }
    Ok(entries)
}


/// Writes the CCS reads of every raw file in `input` that pass the length and
/// SNR gates to one FASTQ, logging per-file and aggregate pass rates.
///
/// # Arguments
///
/// * `input` - bas.h5, bax.h5 or FOFN.
/// * `output` - FASTQ to create.
/// * `opener` - Raw-data reader.
/// * `min_length` - Minimum CCS length.
/// * `min_snr` - Minimum of the per-channel HQ region SNR.
///
/// # Returns
/// ExtractStats with per-file and total counts.
pub fn extract_ccs(
    input: &Path,
    output: &Path,
    opener: &dyn RawDataOpener,
    min_length: usize,
    min_snr: f32,
) -> Result<ExtractStats> {
    let raw_files = parse_input_file(input)?;
    let mut writer = BufWriter::new(File::create(output)?);
    let mut stats = ExtractStats::default();

    info!("Extracting fastq CCS reads from input files");
    for raw_file in raw_files {
        let label = raw_file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        info!("Extracting fastq CCS reads from {}", label);

        let mut file_stats = FileCcsStats { file: raw_file.clone(), ccs: 0, passed: 0 };
        for zmw in opener.open(&raw_file)? {
            let Some(ccs) = zmw.ccs else { continue };
            file_stats.ccs += 1;

            if ccs.seq.len() < min_length {
                continue;
            }
            let zmw_snr = zmw.snr.iter().cloned().fold(f32::INFINITY, f32::min);
            if zmw.snr.is_empty() || zmw_snr < min_snr {
                continue;
            }
            file_stats.passed += 1;

            let qual: Vec<u8> = ccs.qual.iter().map(|q| q.saturating_add(PHRED_OFFSET).min(126)).collect();
            write_fastq_record(&mut writer, &zmw.name, None, &ccs.seq, &qual)?;
        }

        info!(
            "Identified {} CCS reads, of which {} ({}%) passed filter",
            file_stats.ccs,
            file_stats.passed,
            pass_percentage(file_stats.passed, file_stats.ccs)
        );
        stats.ccs_total += file_stats.ccs;
        stats.pass_total += file_stats.passed;
        stats.files.push(file_stats);
    }
    writer.flush()?;

    info!(
        "Found a total of {} CCS reads, of which {} ({}%) passed filter",
        stats.ccs_total,
        stats.pass_total,
        pass_percentage(stats.pass_total, stats.ccs_total)
    );
    Ok(stats)
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::fastx::read_records;
    use std::collections::HashMap;
    use tempfile::tempdir;

    /// In-memory raw data keyed by file name.
    pub struct FakeRawData(pub HashMap<String, Vec<Zmw>>);

    impl RawDataOpener for FakeRawData {
        fn open(&self, path: &Path) -> Result<Vec<Zmw>> {
            let key = path.file_name().unwrap().to_string_lossy().into_owned();
            self.0.get(&key).cloned().ok_or_else(|| anyhow!("no such raw file {}", key))
        }
    }

    pub fn zmw(name: &str, len: usize, snr: f32) -> Zmw {
        Zmw {
            name: name.to_string(),
            ccs: Some(CcsRead { seq: vec![b'A'; len], qual: vec![30; len] }),
            snr: vec![snr, snr + 1.0, snr + 2.0, snr + 3.0],
        }
    }

    #[test]
    fn test_pass_percentage() {
        assert_eq!(pass_percentage(37, 100), 37);
        assert_eq!(pass_percentage(1, 3), 33);
        assert_eq!(pass_percentage(2, 3), 67);
        assert_eq!(pass_percentage(0, 0), 0);
    }

    #[test]
    fn test_parse_fofn_resolves_relative_entries() -> Result<()> {
        let dir = tempdir()?;
        let fofn = dir.path().join("movies.fofn");
        fs::write(&fofn, "a.bax.h5\n\n/abs/b.bas.h5\n")?;
        let entries = parse_fofn(&fofn)?;
        assert_eq!(entries, vec![fs::canonicalize(dir.path())?.join("a.bax.h5"), PathBuf::from("/abs/b.bas.h5")]);

        fs::write(&fofn, "a.bax.h5\nreads.fastq\n")?;
        assert!(parse_fofn(&fofn).is_err());
        Ok(())
    }

    #[test]
    fn test_extract_counts_and_filters() -> Result<()> {
        let dir = tempdir()?;
        let input = dir.path().join("m1.bas.h5");
        let output = dir.path().join("m1.fastq");
        let mut zmws = Vec::new();
        for i in 0..100 {
            // 37 long, high-SNR reads; the rest fail one gate or the other
            let (len, snr) = if i < 37 { (600, 5.0) } else if i % 2 == 0 { (100, 5.0) } else { (600, 1.0) };
            zmws.push(zmw(&format!("m1/{}/ccs", i), len, snr));
        }
        zmws.push(Zmw { name: "m1/999".into(), ccs: None, snr: vec![] });
        let opener = FakeRawData(HashMap::from([("m1.bas.h5".to_string(), zmws)]));

        let stats = extract_ccs(&input, &output, &opener, 500, 3.75)?;
        assert_eq!(stats.ccs_total, 100);
        assert_eq!(stats.pass_total, 37);
        assert_eq!(pass_percentage(stats.pass_total, stats.ccs_total), 37);

        let records = read_records(&output)?;
        assert_eq!(records.len(), 37);
        assert_eq!(records[0].id(), "m1/0/ccs");
        Ok(())
    }

    #[test]
    fn test_extract_with_no_ccs_reads_does_not_panic() -> Result<()> {
        let dir = tempdir()?;
        let input = dir.path().join("empty.bax.h5");
        let output = dir.path().join("empty.fastq");
        let opener = FakeRawData(HashMap::from([("empty.bax.h5".to_string(), vec![])]));
        let stats = extract_ccs(&input, &output, &opener, 500, 3.75)?;
        assert_eq!(stats.ccs_total, 0);
        assert_eq!(pass_percentage(stats.pass_total, stats.ccs_total), 0);
        Ok(())
    }
}
