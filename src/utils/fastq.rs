// src/utils/fastq.rs: read-level quality filtering
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use anyhow::{anyhow, Result};
use log::info;
use seq_io::fastq::{Reader, Record};

use crate::config::defs::PHRED_OFFSET;
use crate::utils::fastx::write_fastq_record;
use crate::utils::file::open_maybe_gzipped;


#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FilterStats {
    pub total: u64,
    pub passed: u64,
}


/// Expected fraction of correct base calls for a read, from Phred+33 qualities.
/// An empty read has accuracy 0.
pub fn predicted_accuracy(qual: &[u8]) -> f64 {
    if qual.is_empty() {
        return 0.0;
    }
    let expected_errors: f64 = qual
        .iter()
        .map(|&q| {
            let phred = q.saturating_sub(PHRED_OFFSET) as f64;
            10f64.powf(-phred / 10.0)
        })
        .sum();
    1.0 - expected_errors / qual.len() as f64
}


/// Copies reads whose predicted accuracy is at least `min_accuracy`.
///
/// # Arguments
///
/// * `input` - FASTQ, optionally gzipped.
/// * `output` - FASTQ of passing reads.
/// * `min_accuracy` - Threshold in (0, 1].
///
/// # Returns
/// FilterStats with read totals.
pub fn quality_filter(input: &Path, output: &Path, min_accuracy: f64) -> Result<FilterStats> {
    let mut reader = Reader::new(open_maybe_gzipped(input)?);
    let mut writer = BufWriter::new(File::create(output)?);
    let mut stats = FilterStats::default();

    while let Some(record) = reader.next() {
        let record = record.map_err(|e| anyhow!("Malformed FASTQ in {}: {}", input.display(), e))?;
        stats.total += 1;
        if predicted_accuracy(record.qual()) < min_accuracy {
            continue;
        }
        stats.passed += 1;
        let head = String::from_utf8_lossy(record.head());
        let (id, desc) = match head.split_once(char::is_whitespace) {
            Some((id, desc)) => (id, Some(desc)),
            None => (head.as_ref(), None),
        };
        write_fastq_record(&mut writer, id, desc, record.seq(), record.qual())?;
    }
    writer.flush()?;

    info!(
        "Quality filter kept {} of {} reads (min accuracy {})",
        stats.passed, stats.total, min_accuracy
    );
    Ok(stats)
}
