// src/utils/cluster.rs: OTU separation, consensus bookkeeping and final FASTA output
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};
use fxhash::FxHashMap;
use log::{debug, info, warn};

use crate::utils::fastx::{for_each_record, read_records, record_counter, write_fasta_record, SequenceRecord};
use crate::utils::file::{file_exists, write_sentinel};

const UNIQUE_LABEL: &str = "unique";


/// One distance level of a mothur list file.
#[derive(Debug, Clone, PartialEq)]
pub struct ListLevel {
    pub label: String,
    pub distance: f64,
    pub clusters: Vec<Vec<String>>,
}

/// Parses `label numOtus otu1 otu2 ..`, members comma-separated. A header
/// line beginning with `label` is skipped.
pub fn parse_list_file(path: &Path) -> Result<Vec<ListLevel>> {
    let reader = BufReader::new(File::open(path)?);
    let mut levels = Vec::new();
    for (idx, line) in reader.lines().enumerate() {
        let line = line?;
        let mut fields = line.split_whitespace();
        let Some(label) = fields.next() else { continue };
        if label == "label" {
            continue;
        }
        let distance = if label == UNIQUE_LABEL {
            0.0
        } else {
            label
                .parse::<f64>()
                .map_err(|_| anyhow!("{}:{}: bad distance label '{}'", path.display(), idx + 1, label))?
        };
        let declared: usize = fields
            .next()
            .ok_or_else(|| anyhow!("{}:{}: missing OTU count", path.display(), idx + 1))?
            .parse()?;
        let clusters: Vec<Vec<String>> = fields
            .map(|otu| otu.split(',').filter(|m| !m.is_empty()).map(String::from).collect())
            .collect();
        if clusters.len() != declared {
            warn!(
                "List level {} declares {} OTUs but lists {}",
                label,
                declared,
                clusters.len()
            );
        }
        levels.push(ListLevel { label: label.to_string(), distance, clusters });
    }
    Ok(levels)
}

/// The level with the largest distance not above `max_distance`.
pub fn choose_level(levels: &[ListLevel], max_distance: f64) -> Option<&ListLevel> {
    levels
        .iter()
        .filter(|level| level.distance <= max_distance + f64::EPSILON)
        .max_by(|a, b| a.distance.total_cmp(&b.distance))
}


/// A separated cluster and its files under `reseq/<name>/`.
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterEntry {
    pub name: String,
    pub members: PathBuf,
    pub reference: PathBuf,
    pub size: usize,
}

impl ClusterEntry {
    pub fn new(reseq_dir: &Path, name: &str, size: usize) -> Self {
        let dir = reseq_dir.join(name);
        ClusterEntry {
            name: name.to_string(),
            members: dir.join(format!("{}.fasta", name)),
            reference: dir.join(format!("{}_ref.fasta", name)),
            size,
        }
    }

    pub fn dir(&self) -> PathBuf {
        self.members.parent().map(Path::to_path_buf).unwrap_or_default()
    }

    pub fn consensus(&self) -> PathBuf {
        self.dir().join(format!("{}_consensus.fasta", self.name))
    }
}

pub fn cluster_name(index: usize) -> String {
    format!("Cluster{:04}", index)
}


/// Writes the members of every sufficiently large cluster at the chosen
/// distance into `reseq_dir/ClusterNNNN/`, plus a reference holding the
/// longest member, and records them in `output`.
///
/// # Arguments
///
/// * `list_file` - mothur list file.
/// * `sequence_file` - FASTA or FASTQ holding every clustered read.
/// * `reseq_dir` - Root of the per-cluster directories.
/// * `output` - The `list.clusters` table.
/// * `distance` - Maximum clustering distance.
/// * `min_size` - Smallest cluster kept.
///
/// # Returns
/// The kept clusters, in list order.
pub fn separate_clusters(
    list_file: &Path,
    sequence_file: &Path,
    reseq_dir: &Path,
    output: &Path,
    distance: f64,
    min_size: usize,
) -> Result<Vec<ClusterEntry>> {
    let levels = parse_list_file(list_file)?;
    let level = choose_level(&levels, distance)
        .ok_or_else(|| anyhow!("No clustering level at or below distance {} in {}", distance, list_file.display()))?;
    info!(
        "Using clusters at level {} ({} OTUs)",
        level.label,
        level.clusters.len()
    );

    let candidates: Vec<&Vec<String>> = level
        .clusters
        .iter()
        .filter(|members| members.len() >= min_size)
        .collect();
    let mut owner: FxHashMap<&str, usize> = FxHashMap::default();
    for (idx, members) in candidates.iter().enumerate() {
        for member in members.iter() {
            owner.insert(member.as_str(), idx);
        }
    }

    let mut grouped: Vec<Vec<SequenceRecord>> = vec![Vec::new(); candidates.len()];
    for_each_record(sequence_file, |record| {
        if let Some(&idx) = owner.get(record.id()) {
            grouped[idx].push(record.into_fasta());
        }
        Ok(())
    })?;

    fs::create_dir_all(reseq_dir)?;
    let mut entries = Vec::new();
    for (members, records) in candidates.iter().zip(grouped.into_iter()) {
        if records.len() < members.len() {
            warn!(
                "{} of {} cluster members missing from {}",
                members.len() - records.len(),
                members.len(),
                sequence_file.display()
            );
        }
        if records.is_empty() || records.len() < min_size {
            continue;
        }
        let entry = ClusterEntry::new(reseq_dir, &cluster_name(entries.len() + 1), records.len());
        fs::create_dir_all(entry.dir())?;
        write_fasta_file(&entry.members, &records)?;

        let mut longest = &records[0];
        for record in &records[1..] {
            if record.seq().len() > longest.seq().len() {
                longest = record;
            }
        }
        write_fasta_file(&entry.reference, std::slice::from_ref(longest))?;
        debug!("{}: {} members", entry.name, entry.size);
        entries.push(entry);
    }

    write_cluster_list(output, &entries)?;
    info!(
        "Separated {} clusters of at least {} reads",
        entries.len(),
        min_size
    );
    Ok(entries)
}

fn write_fasta_file(path: &Path, records: &[SequenceRecord]) -> Result<()> {
    let mut writer = BufWriter::new(File::create(path)?);
    for record in records {
        write_fasta_record(&mut writer, record.id(), None, record.seq())?;
    }
    writer.flush()?;
    Ok(())
}

/// `<name>\t<members>\t<reference>\t<size>` per cluster.
pub fn write_cluster_list(path: &Path, entries: &[ClusterEntry]) -> Result<()> {
    let mut writer = BufWriter::new(File::create(path)?);
    for entry in entries {
        writeln!(
            writer,
            "{}\t{}\t{}\t{}",
            entry.name,
            entry.members.display(),
            entry.reference.display(),
            entry.size
        )?;
    }
    writer.flush()?;
    Ok(())
}

pub fn read_cluster_list(path: &Path) -> Result<Vec<ClusterEntry>> {
    read_table(path, 4)?
        .into_iter()
        .map(|fields| -> Result<ClusterEntry> {
            Ok(ClusterEntry {
                name: fields[0].clone(),
                members: PathBuf::from(&fields[1]),
                reference: PathBuf::from(&fields[2]),
                size: fields[3].parse()?,
            })
        })
        .collect()
}


/// `<cluster>\t<path>` per line; used for the consensus and selection tables.
pub fn write_path_list(path: &Path, rows: &[(String, PathBuf)]) -> Result<()> {
    let mut writer = BufWriter::new(File::create(path)?);
    for (name, file) in rows {
        writeln!(writer, "{}\t{}", name, file.display())?;
    }
    writer.flush()?;
    Ok(())
}

pub fn read_path_list(path: &Path) -> Result<Vec<(String, PathBuf)>> {
    Ok(read_table(path, 2)?
        .into_iter()
        .map(|mut fields| {
            let file = PathBuf::from(fields.swap_remove(1));
            (fields.swap_remove(0), file)
        })
        .collect())
}

fn read_table(path: &Path, columns: usize) -> Result<Vec<Vec<String>>> {
    let reader = BufReader::new(File::open(path)?);
    let mut rows = Vec::new();
    for (idx, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let fields: Vec<String> = line.split('\t').map(String::from).collect();
        if fields.len() != columns {
            return Err(anyhow!(
                "{}:{}: expected {} columns, found {}",
                path.display(),
                idx + 1,
                columns,
                fields.len()
            ));
        }
        rows.push(fields);
    }
    Ok(rows)
}


/// Removes per-cluster scratch, keeping the members, reference and consensus
/// files, then writes the `output` sentinel.
pub fn clean_consensus_outputs(consensus_list: &Path, output: &Path) -> Result<()> {
    let mut removed = 0usize;
    for (name, consensus) in read_path_list(consensus_list)? {
        let Some(dir) = consensus.parent() else { continue };
        if !dir.is_dir() {
            continue;
        }
        let keep = [
            format!("{}.fasta", name),
            format!("{}_ref.fasta", name),
            format!("{}_consensus.fasta", name),
        ];
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let file_name = entry.file_name().to_string_lossy().into_owned();
            if keep.contains(&file_name) {
                continue;
            }
            let path = entry.path();
            if path.is_dir() {
                fs::remove_dir_all(&path)?;
            } else {
                fs::remove_file(&path)?;
            }
            removed += 1;
        }
    }
    info!("Removed {} consensus scratch files", removed);
    write_sentinel(output)?;
    Ok(())
}


/// Picks, per cluster, the consensus when it is non-empty and otherwise the
/// cluster's reference read.
pub fn select_consensus_files(consensus_list: &Path, output: &Path) -> Result<Vec<(String, PathBuf)>> {
    let mut selected = Vec::new();
    for (name, consensus) in read_path_list(consensus_list)? {
        if file_exists(&consensus) {
            selected.push((name, consensus));
            continue;
        }
        let reference = consensus.with_file_name(format!("{}_ref.fasta", name));
        if !file_exists(&reference) {
            return Err(anyhow!("{} has neither a consensus nor a reference sequence", name));
        }
        warn!("{} has no consensus, falling back to its reference read", name);
        selected.push((name, reference));
    }
    write_path_list(output, &selected)?;
    info!("Selected {} final sequences", selected.len());
    Ok(selected)
}


/// Concatenates the selected FASTA files into `output`, naming each record
/// `<cluster>_NumReads<N>` with N the size of the cluster's members file.
pub fn copy_fasta_list(selected_list: &Path, output: &Path) -> Result<()> {
    let mut writer = BufWriter::new(File::create(output)?);
    let mut written = 0usize;
    for (name, fasta) in read_path_list(selected_list)? {
        let members = fasta.with_file_name(format!("{}.fasta", name));
        let num_reads = record_counter(&members)?;
        let header = format!("{}_NumReads{}", name, num_reads);
        for record in read_records(&fasta)? {
            write_fasta_record(&mut writer, &header, None, record.seq())?;
            written += 1;
        }
    }
    writer.flush()?;
    info!("Wrote {} final sequences to {}", written, output.display());
    Ok(())
}
