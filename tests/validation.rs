use std::fs;

use assert_matches::assert_matches;
use camino::{Utf8Path, Utf8PathBuf};

use gpas_uploader::domain::{ReadInput, SchemaKind};
use gpas_uploader::error::UploaderError;
use gpas_uploader::validation::{CsvValidator, Validator};

const HEADER: &str = "batch,run_number,sample_name,control,collection_date,tags,\
                      country,region,district,specimen_organism,host,\
                      instrument_platform,primer_scheme";

fn scratch() -> (tempfile::TempDir, Utf8PathBuf) {
    let temp = tempfile::tempdir().unwrap();
    let dir = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
    (temp, dir)
}

fn write_csv(dir: &Utf8Path, extra_header: &str, rows: &[&str]) -> Utf8PathBuf {
    let path = dir.join("upload.csv");
    let mut content = format!("{HEADER},{extra_header}\n");
    for row in rows {
        content.push_str(row);
        content.push('\n');
    }
    fs::write(&path, content).unwrap();
    path
}

fn touch(dir: &Utf8Path, names: &[&str]) {
    for name in names {
        fs::write(dir.join(name), b"reads").unwrap();
    }
}

fn errors(err: UploaderError) -> Vec<(Option<String>, String)> {
    match err {
        UploaderError::Validation(report) => {
            assert_eq!(report.status, "failure");
            report
                .errors
                .into_iter()
                .map(|issue| (issue.sample_name, issue.error))
                .collect()
        }
        other => panic!("expected validation error, got {other:?}"),
    }
}

#[test]
fn paired_fastq_batch_resolves_paths_against_csv_dir() {
    let (_temp, dir) = scratch();
    touch(&dir, &["a_1.fastq.gz", "a_2.fastq.gz"]);
    let path = write_csv(
        &dir,
        "zone,fastq1,fastq2,lab_id",
        &["b1,r1,a,,2022-03-01,site1:site2,GBR,,,SARS-CoV-2,human,Illumina,auto,\
           north,a_1.fastq.gz,a_2.fastq.gz,L7"],
    );

    let batch = CsvValidator.validate(&path).unwrap();

    assert_eq!(batch.schema, SchemaKind::PairedFastq);
    let record = &batch.records[0];
    assert_eq!(
        record.input,
        ReadInput::Paired(dir.join("a_1.fastq.gz"), dir.join("a_2.fastq.gz"))
    );
    assert_eq!(record.tags, vec!["site1", "site2"]);
    assert_eq!(
        record.passthrough,
        vec![
            ("zone".to_string(), "north".to_string()),
            ("lab_id".to_string(), "L7".to_string()),
        ]
    );
}

#[test]
fn nanopore_bam_is_single_alignment() {
    let (_temp, dir) = scratch();
    touch(&dir, &["a.bam"]);
    let path = write_csv(
        &dir,
        "bam",
        &["b1,,a,negative,2022-03-01,site1,GBR,,,SARS-CoV-2,human,Nanopore,auto,a.bam"],
    );

    let batch = CsvValidator.validate(&path).unwrap();

    assert_eq!(batch.schema, SchemaKind::Bam);
    assert_eq!(batch.records[0].input, ReadInput::Alignment(dir.join("a.bam")));
}

#[test]
fn illumina_bam_is_paired_alignment() {
    let (_temp, dir) = scratch();
    touch(&dir, &["a.bam"]);
    let path = write_csv(
        &dir,
        "bam",
        &["b1,,a,,2022-03-01,site1,GBR,,,SARS-CoV-2,human,Illumina,auto,a.bam"],
    );

    assert_eq!(CsvValidator.validate(&path).unwrap().schema, SchemaKind::PairedBam);
}

#[test]
fn mixed_read_columns_cannot_be_inferred() {
    let (_temp, dir) = scratch();
    let path = write_csv(
        &dir,
        "fastq,fastq1",
        &["b1,,a,,2022-03-01,site1,GBR,,,SARS-CoV-2,human,Nanopore,auto,a.fastq.gz,a_1.fastq.gz"],
    );

    let errors = errors(CsvValidator.validate(&path).unwrap_err());
    assert_eq!(errors.len(), 1);
    assert!(errors[0].1.starts_with("could not infer upload CSV schema"));
}

#[test]
fn row_problems_are_collected_per_sample() {
    let (_temp, dir) = scratch();
    touch(&dir, &["a.fastq.gz"]);
    let path = write_csv(
        &dir,
        "fastq",
        &[
            "b1,,a,,2022-03-01,site1,GBR,,,SARS-CoV-2,human,Nanopore,auto,a.fastq.gz",
            "b1,,a,maybe,2022-03-01,site1,GBR,,,SARS-CoV-2,human,Nanopore,auto,missing.fastq.gz",
        ],
    );

    let errors = errors(CsvValidator.validate(&path).unwrap_err());

    let sample_a = Some("a".to_string());
    assert!(errors.contains(&(sample_a.clone(), "sample_name must be unique".to_string())));
    assert!(errors.contains(&(sample_a.clone(), "fastq file does not exist".to_string())));
    assert!(errors.iter().any(|(sample, error)| {
        sample == &sample_a && error.starts_with("maybe in the control field is not valid")
    }));
}

#[test]
fn one_platform_per_batch() {
    let (_temp, dir) = scratch();
    touch(&dir, &["a.bam", "b.bam"]);
    let path = write_csv(
        &dir,
        "bam",
        &[
            "b1,,a,,2022-03-01,site1,GBR,,,SARS-CoV-2,human,Illumina,auto,a.bam",
            "b1,,b,,2022-03-01,site1,GBR,,,SARS-CoV-2,human,Nanopore,auto,b.bam",
        ],
    );

    let errors = errors(CsvValidator.validate(&path).unwrap_err());
    assert!(errors.contains(&(
        None,
        "instrument_platform must be the same for all samples in a submission".to_string()
    )));
}

#[test]
fn missing_required_column_is_reported() {
    let (_temp, dir) = scratch();
    let path = dir.join("upload.csv");
    fs::write(
        &path,
        "batch,sample_name,instrument_platform,fastq\nb1,a,Nanopore,a.fastq.gz\n",
    )
    .unwrap();

    let errors = errors(CsvValidator.validate(&path).unwrap_err());
    assert!(errors.contains(&(None, "missing column run_number".to_string())));
    assert!(errors.contains(&(None, "missing column tags".to_string())));
}

#[test]
fn unreadable_csv_is_a_validation_failure() {
    let (_temp, dir) = scratch();
    let err = CsvValidator.validate(&dir.join("absent.csv")).unwrap_err();
    assert_matches!(
        err,
        UploaderError::Validation(report)
            if report.errors[0].error.starts_with("failed to parse upload CSV")
    );
}
