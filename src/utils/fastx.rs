use seq_io::fasta::{Reader as FastaReader, OwnedRecord as FastaOwnedRecord};
use seq_io::fastq::{Reader as FastqReader, OwnedRecord as FastqOwnedRecord};
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use crate::config::defs::{FASTA_EXTS, FASTQ_EXTS};
use crate::utils::file::{open_maybe_gzipped, FileReader};

const FASTA_TAG : &str = "fasta";
const FASTQ_TAG : &str = "fastq";

/// Defines FASTA and FASTQ as part of a unified FASTX structure.
#[derive(Clone, Debug, PartialEq)]
pub enum SequenceRecord {
    Fasta {
        id: String,
        desc: Option<String>,
        seq: Vec<u8>,
    },
    Fastq {
        id: String,
        desc: Option<String>,
        seq: Vec<u8>,
        qual: Vec<u8>,
    },
}

/// Maps id and seq to the correct file type.
impl SequenceRecord {
    pub fn id(&self) -> &str {
        match self {
            SequenceRecord::Fasta { id, .. } => id,
            SequenceRecord::Fastq { id, .. } => id,
        }
    }

    pub fn seq(&self) -> &[u8] {
        match self {
            SequenceRecord::Fasta { seq, .. } => seq,
            SequenceRecord::Fastq { seq, .. } => seq,
        }
    }

    /// Drops quality values, keeping id and description.
    pub fn into_fasta(self) -> SequenceRecord {
        match self {
            SequenceRecord::Fastq { id, desc, seq, .. } => SequenceRecord::Fasta { id, desc, seq },
            fasta => fasta,
        }
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        match self {
            SequenceRecord::Fastq { id, desc, seq, qual } => {
                write_fastq_record(writer, id, desc.as_deref(), seq, qual)
            }
            SequenceRecord::Fasta { id, desc, seq } => {
                write_fasta_record(writer, id, desc.as_deref(), seq)
            }
        }
    }
}

impl From<FastaOwnedRecord> for SequenceRecord {
    fn from(record: FastaOwnedRecord) -> Self {
        let (id, desc) = parse_header(&record.head, '>');
        SequenceRecord::Fasta {
            id,
            desc,
            seq: record.seq,
        }
    }
}

impl From<FastqOwnedRecord> for SequenceRecord {
    fn from(record: FastqOwnedRecord) -> Self {
        let (id, desc) = parse_header(&record.head, '@');
        SequenceRecord::Fastq {
            id,
            desc,
            seq: record.seq,
            qual: record.qual,
        }
    }
}


/// Enum to hold either FASTA or FASTQ reader
pub enum SequenceReader {
    Fasta(FastaReader<FileReader>),
    Fastq(FastqReader<FileReader>),
}

/// Creates a SequenceReader for either FASTA or FASTQ files.
///
///
/// # Arguments
///
/// * `path`: &Path - Valid path to a fastx file, optionally gzipped.
///
/// # Returns
/// io::Result<SequenceReader>: Result bearing the correct SequenceReader.
///
pub fn sequence_reader(path: &Path) -> io::Result<SequenceReader> {
    let filetype = fastx_filetype(path)?;
    let reader = open_maybe_gzipped(path)?;
    match filetype {
        FASTA_TAG => Ok(SequenceReader::Fasta(FastaReader::new(reader))),
        FASTQ_TAG => Ok(SequenceReader::Fastq(FastqReader::new(reader))),
        _ => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Unsupported file type for path: {:?}", path),
        )),
    }
}

/// Calls `f` on every record of a FASTA or FASTQ file, stopping at the first error.
pub fn for_each_record<F>(path: &Path, mut f: F) -> anyhow::Result<()>
where
    F: FnMut(SequenceRecord) -> anyhow::Result<()>,
{
    match sequence_reader(path)? {
        SequenceReader::Fasta(reader) => {
            for record in reader.into_records() {
                f(record?.into())?;
            }
        }
        SequenceReader::Fastq(reader) => {
            for record in reader.into_records() {
                f(record?.into())?;
            }
        }
    }
    Ok(())
}

/// Reads every record of a FASTA or FASTQ file into memory.
pub fn read_records(path: &Path) -> anyhow::Result<Vec<SequenceRecord>> {
    let mut records = Vec::new();
    for_each_record(path, |record| {
        records.push(record);
        Ok(())
    })?;
    Ok(records)
}

/// Writes records to a new file, FASTA or FASTQ per record variant.
pub fn write_records(path: &Path, records: &[SequenceRecord]) -> io::Result<()> {
    let mut writer = BufWriter::new(File::create(path)?);
    for record in records {
        record.write_to(&mut writer)?;
    }
    writer.flush()
}


pub fn write_fasta_record<W: Write>(
    writer: &mut W,
    id: &str,
    desc: Option<&str>,
    seq: &[u8],
) -> io::Result<()> {
    // Write header
    writer.write_all(b">")?;
    writer.write_all(id.as_bytes())?;
    if let Some(desc) = desc {
        writer.write_all(b" ")?;
        writer.write_all(desc.as_bytes())?;
    }
    writer.write_all(b"\n")?;

    // Write sequence (with line wrapping, e.g., 80 chars per line)
    for chunk in seq.chunks(80) {
        writer.write_all(chunk)?;
        writer.write_all(b"\n")?;
    }
    Ok(())
}

pub fn write_fastq_record<W: Write>(
    writer: &mut W,
    id: &str,
    desc: Option<&str>,
    seq: &[u8],
    qual: &[u8],
) -> io::Result<()> {
    // Write header
    writer.write_all(b"@")?;
    writer.write_all(id.as_bytes())?;
    if let Some(desc) = desc {
        writer.write_all(b" ")?;
        writer.write_all(desc.as_bytes())?;
    }
    writer.write_all(b"\n")?;

    // Write sequence
    writer.write_all(seq)?;
    writer.write_all(b"\n")?;

    // Write separator
    writer.write_all(b"+")?;
    writer.write_all(b"\n")?;

    // Write quality scores
    writer.write_all(qual)?;
    writer.write_all(b"\n")?;
    Ok(())
}


/// Determines if a file path is a FASTA, FASTQ, or neither.
/// Checks extensions, not the body; a trailing `.gz` is looked through.
///
/// # Arguments
///
/// * `path` - Path of a FASTX file.
///
/// # Returns
/// Result<&str>. Ok fastq or fasta, or err.
///
fn fastx_filetype(path: &Path) -> io::Result<&'static str> {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();
    let name = name.strip_suffix(".gz").unwrap_or(&name);
    let ext = name.rsplit('.').next().unwrap_or("");

    if FASTA_EXTS.iter().any(|&e| e == ext) || ext == "align" {
        return Ok(FASTA_TAG);
    }
    if FASTQ_EXTS.iter().any(|&e| e == ext) {
        return Ok(FASTQ_TAG);
    }

    Err(io::Error::new(
        io::ErrorKind::InvalidData,
        format!(
            "File '{}' has invalid extension '{}'. Expected FASTA ({:?}) or FASTQ ({:?}).",
            path.display(),
            ext,
            FASTA_EXTS,
            FASTQ_EXTS
        ),
    ))
}


/// Parses a FASTX header.
///
///
/// # Arguments
///
/// * `head` - Header line of a FASTX record.
/// * 'prefix' - Leading, defining character of the header. > for FASTA, @ for FASTQ.
///
/// # Returns
/// Tuple: (id, desc) split of header on whitespace.
///
fn parse_header(head: &[u8], prefix: char) -> (String, Option<String>) {
    let head_str = String::from_utf8_lossy(head).into_owned();
    let parts: Vec<&str> = head_str.splitn(2, |c: char| c.is_whitespace()).collect();
    let id = parts[0].trim_start_matches(prefix).to_string();
    let desc = parts.get(1).map(|s| s.to_string()).filter(|s| !s.is_empty());
    (id, desc)
}


/// Counts the number of records in a FASTA or FASTQ.
///
///
/// # Arguments
///
/// * `path` - Valid path to a fastx file.
///
/// # Returns
/// u64: Number of records in the file.
///
pub fn record_counter(path: &Path) -> anyhow::Result<u64> {
    let mut counter = 0;
    for_each_record(path, |_| {
        counter += 1;
        Ok(())
    })?;
    Ok(counter)
}


#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_sequence_reader_fasta() -> io::Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("reads.fasta");
        std::fs::write(&path, ">seq1 testFASTA\nATCG\n")?;

        match sequence_reader(&path)? {
            SequenceReader::Fasta(_) => Ok(()),
            _ => Err(io::Error::new(io::ErrorKind::Other, "Expected Fasta reader")),
        }
    }

    #[test]
    fn test_sequence_reader_fastq() -> io::Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("reads.fq");
        std::fs::write(&path, "@seq1\nATCG\n+\nIIII\n")?;

        match sequence_reader(&path)? {
            SequenceReader::Fastq(_) => Ok(()),
            _ => Err(io::Error::new(io::ErrorKind::Other, "Expected Fastq reader")),
        }
    }

    #[test]
    fn test_sequence_reader_rejects_unknown() {
        assert!(sequence_reader(Path::new("reads.txt")).is_err());
    }

    #[test]
    fn test_parse_header() {
        assert_eq!(parse_header(b"m1/12/ccs extra words", '@'), ("m1/12/ccs".to_string(), Some("extra words".to_string())));
        assert_eq!(parse_header(b"read1", '>'), ("read1".to_string(), None));
    }

    #[test]
    fn test_records_written_and_read_back() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("out.fastq");
        let records = vec![
            SequenceRecord::Fastq { id: "a".into(), desc: None, seq: b"ACGT".to_vec(), qual: b"IIII".to_vec() },
            SequenceRecord::Fastq { id: "b".into(), desc: Some("x".into()), seq: b"GG".to_vec(), qual: b"##".to_vec() },
        ];
        write_records(&path, &records)?;
        assert_eq!(record_counter(&path)?, 2);
        assert_eq!(read_records(&path)?, records);
        Ok(())
    }
}
