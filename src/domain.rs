use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

use crate::error::UploaderError;

/// Layout of an upload CSV, inferred from its columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SchemaKind {
    Fastq,
    PairedFastq,
    Bam,
    PairedBam,
}

impl SchemaKind {
    pub fn is_paired(self) -> bool {
        matches!(self, SchemaKind::PairedFastq | SchemaKind::PairedBam)
    }

    pub fn is_alignment(self) -> bool {
        matches!(self, SchemaKind::Bam | SchemaKind::PairedBam)
    }

    pub fn name(self) -> &'static str {
        match self {
            SchemaKind::Fastq => "FastqSchema",
            SchemaKind::PairedFastq => "PairedFastqSchema",
            SchemaKind::Bam => "BamSchema",
            SchemaKind::PairedBam => "PairedBamSchema",
        }
    }
}

impl fmt::Display for SchemaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadInput {
    Single(Utf8PathBuf),
    Paired(Utf8PathBuf, Utf8PathBuf),
    Alignment(Utf8PathBuf),
}

/// Decontaminated reads produced for one sample.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CleanReads {
    Single(Utf8PathBuf),
    Paired(Utf8PathBuf, Utf8PathBuf),
}

impl CleanReads {
    pub fn paths(&self) -> Vec<&Utf8PathBuf> {
        match self {
            CleanReads::Single(path) => vec![path],
            CleanReads::Paired(path1, path2) => vec![path1, path2],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Checksums {
    Single(String),
    Paired(String, String),
}

impl Checksums {
    /// The checksum sent to the identifier service: read 1 for pairs.
    pub fn key(&self) -> &str {
        match self {
            Checksums::Single(md5) => md5,
            Checksums::Paired(md5_1, _) => md5_1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DecontaminationStats {
    #[serde(rename = "in")]
    pub count_in: u64,
    #[serde(rename = "out")]
    pub count_out: u64,
    pub fraction: f64,
}

/// One validated row of the upload CSV.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleRecord {
    pub batch: String,
    pub run_number: String,
    pub sample_name: String,
    pub control: String,
    pub collection_date: String,
    pub tags: Vec<String>,
    pub country: String,
    pub region: String,
    pub district: String,
    pub specimen_organism: String,
    pub host: String,
    pub instrument_platform: String,
    pub primer_scheme: String,
    pub input: ReadInput,
    /// Columns not consumed by the uploader, in upload CSV order, carried
    /// into the mapping CSV.
    pub passthrough: Vec<(String, String)>,
}

#[derive(Debug, Clone)]
pub struct Sample {
    pub record: SampleRecord,
    pub reads: ReadInput,
    pub clean: Option<CleanReads>,
    pub checksums: Option<Checksums>,
    guid: Option<String>,
    pub gpas_run_number: String,
    pub stats: Option<DecontaminationStats>,
}

impl Sample {
    pub fn new(record: SampleRecord) -> Self {
        Self {
            reads: record.input.clone(),
            record,
            clean: None,
            checksums: None,
            guid: None,
            gpas_run_number: String::new(),
            stats: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.record.sample_name
    }

    pub fn guid(&self) -> Option<&str> {
        self.guid.as_deref()
    }

    pub fn assign_guid(&mut self, guid: String) -> Result<(), UploaderError> {
        if let Some(existing) = &self.guid {
            return Err(UploaderError::Invariant(format!(
                "sample {} already has identifier {existing}",
                self.name()
            )));
        }
        self.guid = Some(guid);
        Ok(())
    }
}

/// Immutable description of one sample's transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadUnit {
    pub sample_label: String,
    pub local_path1: Utf8PathBuf,
    pub local_path2: Option<Utf8PathBuf>,
    pub remote_url1: String,
    pub remote_url2: Option<String>,
}

impl UploadUnit {
    pub fn transfers(&self) -> Vec<(&Utf8PathBuf, &str)> {
        let mut transfers = vec![(&self.local_path1, self.remote_url1.as_str())];
        if let (Some(path), Some(url)) = (&self.local_path2, &self.remote_url2) {
            transfers.push((path, url.as_str()));
        }
        transfers
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileType {
    Json,
    Fasta,
    Bam,
    Vcf,
}

impl FileType {
    pub fn extension(self) -> &'static str {
        match self {
            FileType::Json => "json",
            FileType::Fasta => "fasta.gz",
            FileType::Bam => "bam",
            FileType::Vcf => "vcf",
        }
    }

    pub fn parse_list(value: &str) -> Result<Vec<FileType>, UploaderError> {
        let mut types = Vec::new();
        let mut unknown = Vec::new();
        for item in value.trim_matches(',').split(',') {
            match item.trim().parse::<FileType>() {
                Ok(file_type) if !types.contains(&file_type) => types.push(file_type),
                Ok(_) => {}
                Err(_) => unknown.push(item.trim().to_string()),
            }
        }
        if !unknown.is_empty() {
            return Err(UploaderError::InvalidFileType(unknown.join(", ")));
        }
        Ok(types)
    }
}

impl fmt::Display for FileType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FileType::Json => write!(f, "json"),
            FileType::Fasta => write!(f, "fasta"),
            FileType::Bam => write!(f, "bam"),
            FileType::Vcf => write!(f, "vcf"),
        }
    }
}

impl FromStr for FileType {
    type Err = UploaderError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "json" => Ok(FileType::Json),
            "fasta" => Ok(FileType::Fasta),
            "bam" => Ok(FileType::Bam),
            "vcf" => Ok(FileType::Vcf),
            other => Err(UploaderError::InvalidFileType(other.to_string())),
        }
    }
}

/// Samples addressed by the status/download fetcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Targets {
    ByIdentifier(Vec<String>),
    ByIdentifierWithLocalName(HashMap<String, String>),
}

impl Targets {
    pub fn identifiers(&self) -> Vec<String> {
        match self {
            Targets::ByIdentifier(guids) => guids.clone(),
            Targets::ByIdentifierWithLocalName(names) => {
                let mut guids = names.keys().cloned().collect::<Vec<_>>();
                guids.sort();
                guids
            }
        }
    }

    pub fn local_name(&self, guid: &str) -> Option<&str> {
        match self {
            Targets::ByIdentifier(_) => None,
            Targets::ByIdentifierWithLocalName(names) => names.get(guid).map(String::as_str),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Targets::ByIdentifier(guids) => guids.len(),
            Targets::ByIdentifierWithLocalName(names) => names.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub const GOOD_STATUSES: [&str; 2] = ["Unreleased", "Released"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SampleStatus {
    pub sample: String,
    pub status: String,
}

impl SampleStatus {
    pub fn unknown(sample: &str) -> Self {
        Self {
            sample: sample.to_string(),
            status: "Unknown".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn record() -> SampleRecord {
        SampleRecord {
            batch: "run1".to_string(),
            run_number: "run1.1".to_string(),
            sample_name: "s1".to_string(),
            control: String::new(),
            collection_date: "2022-01-01".to_string(),
            tags: vec!["site1".to_string()],
            country: "GBR".to_string(),
            region: String::new(),
            district: String::new(),
            specimen_organism: "SARS-CoV-2".to_string(),
            host: "human".to_string(),
            instrument_platform: "Nanopore".to_string(),
            primer_scheme: "auto".to_string(),
            input: ReadInput::Single("s1.fastq.gz".into()),
            passthrough: Vec::new(),
        }
    }

    #[test]
    fn guid_is_assigned_once() {
        let mut sample = Sample::new(record());
        sample.assign_guid("abc".to_string()).unwrap();
        let err = sample.assign_guid("def".to_string()).unwrap_err();
        assert_matches!(err, UploaderError::Invariant(_));
        assert_eq!(sample.guid(), Some("abc"));
    }

    #[test]
    fn parse_file_types() {
        let types = FileType::parse_list("json,fasta,json,").unwrap();
        assert_eq!(types, vec![FileType::Json, FileType::Fasta]);
        assert_eq!(FileType::Fasta.extension(), "fasta.gz");
    }

    #[test]
    fn parse_file_types_rejects_unknown() {
        let err = FileType::parse_list("json,cram").unwrap_err();
        assert_matches!(err, UploaderError::InvalidFileType(value) if value == "cram");
    }

    #[test]
    fn paired_checksum_key_is_read_one() {
        let checksums = Checksums::Paired("aaa".to_string(), "bbb".to_string());
        assert_eq!(checksums.key(), "aaa");
    }
}
