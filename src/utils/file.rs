// src/utils/file.rs: artifact naming, checkpoint and post-condition checks
use std::fs::{self, File};
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use log::{error, info, warn};

use crate::config::defs::{
    DataType, PipelineError, FASTA_EXTS, FASTQ_EXTS, RAW_EXTS, RAW_H5_EXTS, SENTINEL_TEXT, STAGING_TAIL,
};


/// How strictly a declared output is checked before a stage is skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Presence {
    /// Must exist with at least one byte.
    NonEmpty,
    /// Existence is enough; a zero-byte file is a legitimate result.
    MayBeEmpty,
}


/// Splits a file name into its root and terminal extension.
/// `bas.h5` and `bax.h5` count as one extension.
///
/// # Arguments
///
/// * `path` - Any path; only the file name is considered.
///
/// # Returns
/// (root, extension). The extension is None when the name has no dot.
pub fn split_root_from_ext(path: &Path) -> (String, Option<String>) {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    for ext in RAW_H5_EXTS {
        let tail = format!(".{}", ext);
        if name.len() > tail.len() && name.to_ascii_lowercase().ends_with(&tail) {
            let root = name[..name.len() - tail.len()].to_string();
            return (root, Some(name[name.len() - ext.len()..].to_string()));
        }
    }

    match name.rfind('.') {
        Some(idx) if idx > 0 => (name[..idx].to_string(), Some(name[idx + 1..].to_string())),
        _ => (name, None),
    }
}


/// Decides the entry branch of a run from the input's extension.
pub fn classify_input(path: &Path) -> Result<DataType, PipelineError> {
    let ext = split_root_from_ext(path).1.map(|e| e.to_ascii_lowercase()).unwrap_or_default();
    let data_type = if RAW_EXTS.contains(&ext.as_str()) {
        DataType::RawInstrument
    } else if FASTQ_EXTS.contains(&ext.as_str()) {
        DataType::Reads
    } else if FASTA_EXTS.contains(&ext.as_str()) {
        DataType::PreAligned
    } else {
        error!("Unsupported input file {}", path.display());
        return Err(PipelineError::UnsupportedInput(path.to_path_buf()));
    };
    info!("Input file {} classified as {:?}", path.display(), data_type);
    Ok(data_type)
}


/// Derives the output artifact for a stage: the terminal extension of
/// `input` is replaced by `suffix` and the result is placed in `work_dir`.
///
/// # Arguments
///
/// * `work_dir` - Directory owning every artifact of the run.
/// * `input` - Artifact the stage consumes.
/// * `suffix` - Logical suffix, possibly dotted (e.g. `filter.fastq`).
///
/// # Returns
/// PathBuf of the output artifact.
pub fn output_name(work_dir: &Path, input: &Path, suffix: &str) -> PathBuf {
    let (root, _) = split_root_from_ext(input);
    work_dir.join(format!("{}.{}", root, suffix))
}

/// Multi-artifact form of [`output_name`]; order follows `suffixes`.
pub fn output_names(work_dir: &Path, input: &Path, suffixes: &[&str]) -> Vec<PathBuf> {
    suffixes
        .iter()
        .map(|suffix| output_name(work_dir, input, suffix))
        .collect()
}


/// True when a file exists and is non-empty.
pub fn file_exists(path: &Path) -> bool {
    fs::metadata(path)
        .map(|m| m.is_file() && m.len() > 0)
        .unwrap_or(false)
}

/// Checkpoint test: true iff every output is already present.
/// A single absent output means the stage runs again from scratch.
pub fn outputs_exist(outputs: &[PathBuf], presence: Presence) -> bool {
    let all_present = outputs.iter().all(|path| match presence {
        Presence::NonEmpty => file_exists(path),
        Presence::MayBeEmpty => path.is_file(),
    });

    if all_present {
        info!("Output files detected, skipping process...");
    } else {
        info!("Output files not found, running process...");
    }
    all_present
}


/// Post-condition check after a stage claims completion.
///
/// # Arguments
///
/// * `outputs` - Every artifact the stage declared.
///
/// # Returns
/// Ok if all exist, otherwise PipelineError::MissingOutput for the first absent one.
pub fn check_outputs(outputs: &[PathBuf]) -> Result<(), PipelineError> {
    for output in outputs {
        if output.exists() {
            info!("Expected output \"{}\" found", output.display());
        } else {
            error!("Expected output \"{}\" not found!", output.display());
            return Err(PipelineError::MissingOutput(output.clone()));
        }
    }
    info!("All expected output files found - process successful!");
    Ok(())
}


/// Sibling path an output is written under until its stage succeeds.
pub fn staging_name(output: &Path) -> PathBuf {
    let mut name = output.as_os_str().to_os_string();
    name.push(STAGING_TAIL);
    PathBuf::from(name)
}

/// Moves a staged file onto its final name. Nothing staged, nothing moved.
pub fn commit_staged(staged: &Path, output: &Path) -> io::Result<()> {
    if staged.exists() {
        fs::rename(staged, output)?;
    }
    Ok(())
}

/// Runs `write` against the staging name of `output`. The staged file is
/// renamed into place only on success and removed on failure, so the
/// checkpoint never sees a truncated output.
pub fn write_staged<T, F>(output: &Path, write: F) -> Result<T, PipelineError>
where
    F: FnOnce(&Path) -> Result<T, PipelineError>,
{
    let staged = staging_name(output);
    match write(&staged) {
        Ok(value) => {
            commit_staged(&staged, output)?;
            Ok(value)
        }
        Err(e) => {
            discard_outputs(&[staged]);
            Err(e)
        }
    }
}

/// Deletes whatever a failed stage left at its declared output paths.
pub fn discard_outputs(outputs: &[PathBuf]) {
    for output in outputs {
        match fs::remove_file(output) {
            Ok(()) => warn!("Removed incomplete output \"{}\"", output.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!("Could not remove incomplete output \"{}\": {}", output.display(), e),
        }
    }
}


/// Writes a small completion marker for stages that have no natural output.
pub fn write_sentinel(path: &Path) -> io::Result<()> {
    fs::write(path, SENTINEL_TEXT)
}


/// Links the input file into the output directory unless something with
/// that name is already there.
///
/// # Returns
/// Path of the artifact inside `out_dir`.
pub fn link_input(input: &Path, out_dir: &Path) -> io::Result<PathBuf> {
    let file_name = input
        .file_name()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "input has no file name"))?;
    let link_path = out_dir.join(file_name);
    if fs::symlink_metadata(&link_path).is_ok() {
        return Ok(link_path);
    }
    let abs_path = fs::canonicalize(input)?;
    if abs_path == link_path {
        return Ok(link_path);
    }
    #[cfg(unix)]
    std::os::unix::fs::symlink(&abs_path, &link_path)?;
    #[cfg(not(unix))]
    fs::copy(&abs_path, &link_path).map(|_| ())?;
    Ok(link_path)
}


pub fn is_gzipped(path: &Path) -> io::Result<bool> {
    let mut file = File::open(path)?;
    let mut buffer = [0u8; 2];
    match file.read_exact(&mut buffer) {
        Ok(()) => Ok(buffer == [0x1F, 0x8B]), // Gzip magic bytes
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

/// Either an uncompressed or gzipped file reader
pub enum FileReader {
    Uncompressed(BufReader<File>),
    Gzipped(GzDecoder<File>),
}

impl Read for FileReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            FileReader::Uncompressed(r) => r.read(buf),
            FileReader::Gzipped(r) => r.read(buf),
        }
    }
}

pub fn open_maybe_gzipped(path: &Path) -> io::Result<FileReader> {
    let file = File::open(path)?;
    if is_gzipped(path)? {
        Ok(FileReader::Gzipped(GzDecoder::new(file)))
    } else {
        Ok(FileReader::Uncompressed(BufReader::new(file)))
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_split_root_from_ext() {
        assert_eq!(split_root_from_ext(Path::new("/data/sample.fastq")), ("sample".to_string(), Some("fastq".to_string())));
        assert_eq!(split_root_from_ext(Path::new("m1.bas.h5")), ("m1".to_string(), Some("bas.h5".to_string())));
        assert_eq!(split_root_from_ext(Path::new("m1.1.bax.h5")), ("m1.1".to_string(), Some("bax.h5".to_string())));
        assert_eq!(split_root_from_ext(Path::new("noext")), ("noext".to_string(), None));
    }

    #[test]
    fn test_classify_input() {
        assert_eq!(classify_input(Path::new("m1.bas.h5")).unwrap(), DataType::RawInstrument);
        assert_eq!(classify_input(Path::new("m1.1.BAX.H5")).unwrap(), DataType::RawInstrument);
        assert_eq!(classify_input(Path::new("movies.fofn")).unwrap(), DataType::RawInstrument);
        assert_eq!(classify_input(Path::new("reads.fq")).unwrap(), DataType::Reads);
        assert_eq!(classify_input(Path::new("reads.fastq")).unwrap(), DataType::Reads);
        assert_eq!(classify_input(Path::new("seqs.fsa")).unwrap(), DataType::PreAligned);
        assert!(matches!(classify_input(Path::new("reads.bam")), Err(PipelineError::UnsupportedInput(_))));
        assert!(classify_input(Path::new("noext")).is_err());
    }

    #[test]
    fn test_output_name_replaces_terminal_extension() {
        let work = Path::new("/run");
        assert_eq!(output_name(work, Path::new("/in/sample.fastq"), "filter.fastq"), PathBuf::from("/run/sample.filter.fastq"));
        assert_eq!(output_name(work, Path::new("/run/sample.filter.fastq"), "fasta"), PathBuf::from("/run/sample.filter.fasta"));
        assert_eq!(output_name(work, Path::new("movie.bas.h5"), "fastq"), PathBuf::from("/run/movie.fastq"));
        assert_eq!(output_name(work, Path::new("plain"), "align"), PathBuf::from("/run/plain.align"));
    }

    #[test]
    fn test_output_name_is_deterministic() {
        let work = Path::new("/run");
        let input = Path::new("sample.good.align");
        let first = output_names(work, input, &["unique.align", "names"]);
        let second = output_names(work, input, &["unique.align", "names"]);
        assert_eq!(first, second);
        assert_eq!(first, vec![PathBuf::from("/run/sample.good.unique.align"), PathBuf::from("/run/sample.good.names")]);
    }

    #[test]
    fn test_outputs_exist_requires_all_non_empty() -> io::Result<()> {
        let dir = tempdir()?;
        let a = dir.path().join("a.fasta");
        let b = dir.path().join("a.qual");
        fs::write(&a, ">r\nACGT\n")?;
        assert!(!outputs_exist(&[a.clone(), b.clone()], Presence::NonEmpty));

        fs::write(&b, "")?;
        assert!(!outputs_exist(&[a.clone(), b.clone()], Presence::NonEmpty));
        assert!(outputs_exist(&[a.clone(), b.clone()], Presence::MayBeEmpty));

        fs::write(&b, ">r\n40 40 40 40\n")?;
        assert!(outputs_exist(&[a, b], Presence::NonEmpty));
        Ok(())
    }

    #[test]
    fn test_check_outputs_reports_missing() -> io::Result<()> {
        let dir = tempdir()?;
        let present = dir.path().join("x.align");
        let absent = dir.path().join("x.summary");
        fs::write(&present, "")?;
        assert!(check_outputs(&[present.clone()]).is_ok());
        match check_outputs(&[present, absent.clone()]) {
            Err(PipelineError::MissingOutput(p)) => assert_eq!(p, absent),
            other => panic!("unexpected result: {:?}", other),
        }
        Ok(())
    }

    #[test]
    fn test_write_staged_commits_only_on_success() -> io::Result<()> {
        let dir = tempdir()?;
        let output = dir.path().join("reads.filter.fastq");
        assert_eq!(staging_name(&output), dir.path().join("reads.filter.fastq.partial"));

        let failed: Result<(), PipelineError> = write_staged(&output, |staged| {
            fs::write(staged, "@a\nACGT\n+\nIIII\n")?;
            Err(PipelineError::InvalidConfig("malformed record".to_string()))
        });
        assert!(failed.is_err());
        assert!(!output.exists());
        assert!(!staging_name(&output).exists());

        let written = write_staged(&output, |staged| {
            fs::write(staged, "@a\nACGT\n+\nIIII\n")?;
            Ok(1)
        });
        assert_eq!(written.ok(), Some(1));
        assert_eq!(fs::read_to_string(&output)?, "@a\nACGT\n+\nIIII\n");
        assert!(!staging_name(&output).exists());
        Ok(())
    }

    #[test]
    fn test_discard_outputs_ignores_absent_files() -> io::Result<()> {
        let dir = tempdir()?;
        let written = dir.path().join("x.align");
        let absent = dir.path().join("x.summary");
        fs::write(&written, ">r1\nAC")?;
        discard_outputs(&[written.clone(), absent.clone()]);
        assert!(!written.exists());
        assert!(!absent.exists());
        Ok(())
    }

    #[test]
    fn test_link_input_keeps_existing() -> io::Result<()> {
        let src_dir = tempdir()?;
        let out_dir = tempdir()?;
        let input = src_dir.path().join("reads.fastq");
        fs::write(&input, "@r\nACGT\n+\nIIII\n")?;

        let linked = link_input(&input, out_dir.path())?;
        assert_eq!(linked, out_dir.path().join("reads.fastq"));
        assert_eq!(fs::read_to_string(&linked)?, "@r\nACGT\n+\nIIII\n");
        assert_eq!(link_input(&input, out_dir.path())?, linked);
        Ok(())
    }
}
