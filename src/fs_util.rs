use std::fs;
use std::io::{Read, Write};

use camino::{Utf8Path, Utf8PathBuf};
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::domain::{CleanReads, Sample};
use crate::error::UploaderError;

/// Moves a sample's cleaned reads to `{guid}.reads*.fastq.gz` beside them.
pub fn rename_clean_reads(sample: &mut Sample) -> Result<(), UploaderError> {
    let guid = sample
        .guid()
        .ok_or_else(|| {
            UploaderError::Invariant(format!("sample {} has no identifier", sample.name()))
        })?
        .to_string();
    let clean = sample.clean.take().ok_or_else(|| {
        UploaderError::Invariant(format!("sample {} has no cleaned reads", sample.name()))
    })?;
    let renamed = match clean {
        CleanReads::Single(path) => {
            CleanReads::Single(move_to(&path, &format!("{guid}.reads.fastq.gz"))?)
        }
        CleanReads::Paired(path1, path2) => CleanReads::Paired(
            move_to(&path1, &format!("{guid}.reads_1.fastq.gz"))?,
            move_to(&path2, &format!("{guid}.reads_2.fastq.gz"))?,
        ),
    };
    sample.clean = Some(renamed);
    Ok(())
}

fn move_to(path: &Utf8Path, file_name: &str) -> Result<Utf8PathBuf, UploaderError> {
    let target = path.with_file_name(file_name);
    fs::rename(path, &target)
        .map_err(|err| UploaderError::Filesystem(format!("rename {path} to {target}: {err}")))?;
    debug!("renamed {path} to {target}");
    Ok(target)
}

/// Rewrites the first `guid` in a gzipped FASTA as `guid|name`. A file
/// without the identifier is left untouched.
pub fn update_fasta_header(path: &Utf8Path, guid: &str, name: &str) -> Result<(), UploaderError> {
    let file = fs::File::open(path)
        .map_err(|err| UploaderError::Filesystem(format!("open {path}: {err}")))?;
    let mut contents = String::new();
    GzDecoder::new(file)
        .read_to_string(&mut contents)
        .map_err(|err| UploaderError::Filesystem(format!("decompress {path}: {err}")))?;

    if !contents.contains(guid) {
        warn!("Could not rename {guid} inside {name}.fasta.gz");
        return Ok(());
    }
    let contents = contents.replacen(guid, &format!("{guid}|{name}"), 1);

    let parent = path.parent().filter(|dir| !dir.as_str().is_empty());
    let temp = match parent {
        Some(dir) => NamedTempFile::new_in(dir),
        None => NamedTempFile::new_in("."),
    }
    .map_err(|err| UploaderError::Filesystem(format!("create temp file for {path}: {err}")))?;
    let mut encoder = GzEncoder::new(temp, Compression::default());
    encoder.write_all(contents.as_bytes())?;
    let temp = encoder.finish()?;
    temp.persist(path)
        .map_err(|err| UploaderError::Filesystem(format!("replace {path}: {err}")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ReadInput, SampleRecord};

    fn write_gz(path: &Utf8Path, text: &str) {
        let mut encoder = GzEncoder::new(fs::File::create(path).unwrap(), Compression::default());
        encoder.write_all(text.as_bytes()).unwrap();
        encoder.finish().unwrap();
    }

    fn read_gz(path: &Utf8Path) -> String {
        let mut text = String::new();
        GzDecoder::new(fs::File::open(path).unwrap())
            .read_to_string(&mut text)
            .unwrap();
        text
    }

    fn scratch() -> (tempfile::TempDir, Utf8PathBuf) {
        let temp = tempfile::tempdir().unwrap();
        let dir = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        (temp, dir)
    }

    #[test]
    fn header_gains_local_name() {
        let (_temp, dir) = scratch();
        let path = dir.join("s1.fasta.gz");
        write_gz(&path, ">abc-123\nACGT\n");

        update_fasta_header(&path, "abc-123", "s1").unwrap();

        assert_eq!(read_gz(&path), ">abc-123|s1\nACGT\n");
    }

    #[test]
    fn missing_identifier_leaves_file_alone() {
        let (_temp, dir) = scratch();
        let path = dir.join("s1.fasta.gz");
        write_gz(&path, ">other\nACGT\n");

        update_fasta_header(&path, "abc-123", "s1").unwrap();

        assert_eq!(read_gz(&path), ">other\nACGT\n");
    }

    #[test]
    fn paired_reads_are_renamed_by_identifier() {
        let (_temp, dir) = scratch();
        let read1 = dir.join("s1.reads_1.fastq.gz");
        let read2 = dir.join("s1.reads_2.fastq.gz");
        fs::write(&read1, b"r1").unwrap();
        fs::write(&read2, b"r2").unwrap();
        let mut sample = Sample::new(SampleRecord {
            batch: "b".to_string(),
            run_number: String::new(),
            sample_name: "s1".to_string(),
            control: String::new(),
            collection_date: "2022-01-01".to_string(),
            tags: vec![],
            country: "GBR".to_string(),
            region: String::new(),
            district: String::new(),
            specimen_organism: "SARS-CoV-2".to_string(),
            host: "human".to_string(),
            instrument_platform: "Illumina".to_string(),
            primer_scheme: "auto".to_string(),
            input: ReadInput::Paired("s1_1.fastq.gz".into(), "s1_2.fastq.gz".into()),
            passthrough: Vec::new(),
        });
        sample.clean = Some(CleanReads::Paired(read1.clone(), read2.clone()));
        sample.assign_guid("g1".to_string()).unwrap();

        rename_clean_reads(&mut sample).unwrap();

        assert_eq!(
            sample.clean,
            Some(CleanReads::Paired(
                dir.join("g1.reads_1.fastq.gz"),
                dir.join("g1.reads_2.fastq.gz")
            ))
        );
        assert!(!read1.as_std_path().exists());
        assert_eq!(fs::read(dir.join("g1.reads_2.fastq.gz")).unwrap(), b"r2");
    }
}
