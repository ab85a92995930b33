/// Alignment summary statistics used to pick the screening window
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use anyhow::{Result, anyhow};


/// One row of a `summary.seqs` table.
#[derive(Debug, Clone, PartialEq)]
pub struct SummaryRow {
    pub name: String,
    pub start: u64,
    pub end: u64,
    pub nbases: u64,
}

/// Parsed summary table plus the coverage fraction used for the window.
#[derive(Debug)]
pub struct SummaryReader {
    rows: Vec<SummaryRow>,
    fraction: f64,
}

impl SummaryReader {
    /// Reads a tab-separated summary with a header line
    /// (`seqname start end nbases ambigs polymer [numSeqs]`).
    pub fn from_path(path: &Path, fraction: f64) -> Result<Self> {
        let reader = BufReader::new(File::open(path)?);
        let mut rows = Vec::new();
        for (idx, line) in reader.lines().enumerate() {
            let line = line?;
            if idx == 0 || line.trim().is_empty() {
                continue;
            }
            rows.push(parse_row(&line).map_err(|e| anyhow!("{}:{}: {}", path.display(), idx + 1, e))?);
        }
        Self::from_rows(rows, fraction)
    }

    pub fn from_rows(rows: Vec<SummaryRow>, fraction: f64) -> Result<Self> {
        if rows.is_empty() {
            return Err(anyhow!("Summary table has no sequences"));
        }
        if !(fraction > 0.0 && fraction <= 1.0) {
            return Err(anyhow!("Fraction must be in (0, 1], got {}", fraction));
        }
        Ok(SummaryReader { rows, fraction })
    }

    /// The most frequent start and end coordinates (ties go to the smaller value).
    pub fn full_length_positions(&self) -> (u64, u64) {
        let starts: Vec<u64> = self.rows.iter().map(|r| r.start).collect();
        let ends: Vec<u64> = self.rows.iter().map(|r| r.end).collect();
        (mode(&starts), mode(&ends))
    }

    /// Maximum allowed start and minimum allowed end such that `fraction` of
    /// the sequences start at or before, and end at or after, those positions.
    pub fn allowed_positions(&self) -> (u64, u64) {
        let mut starts: Vec<u64> = self.rows.iter().map(|r| r.start).collect();
        let mut ends: Vec<u64> = self.rows.iter().map(|r| r.end).collect();
        starts.sort_unstable();
        ends.sort_unstable_by(|a, b| b.cmp(a));
        let idx = covering_index(self.rows.len(), self.fraction);
        (starts[idx], ends[idx])
    }
}

fn parse_row(line: &str) -> Result<SummaryRow> {
    let mut fields = line.split('\t');
    macro_rules! next {
        () => {
            fields.next().ok_or_else(|| anyhow!("missing field"))?
        };
    }
    Ok(SummaryRow {
        name: next!().to_string(),
        start: next!().trim().parse()?,
        end: next!().trim().parse()?,
        nbases: next!().trim().parse()?,
    })
}

/// Slack for products such as 5 * 0.6 that land just above a whole number.
const INDEX_EPSILON: f64 = 1e-9;

/// Index of the element that covers `fraction` of `n` sorted values.
fn covering_index(n: usize, fraction: f64) -> usize {
    let needed = (n as f64 * fraction - INDEX_EPSILON).ceil() as usize;
    needed.clamp(1, n) - 1
}

fn mode(values: &[u64]) -> u64 {
    let mut counts: HashMap<u64, usize> = HashMap::new();
    for &v in values {
        *counts.entry(v).or_insert(0) += 1;
    }
    counts
        .into_iter()
        .max_by(|(va, ca), (vb, cb)| ca.cmp(cb).then(vb.cmp(va)))
        .map(|(v, _)| v)
        .unwrap_or(0)
}
