use std::collections::{BTreeSet, HashMap, HashSet};

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{Local, NaiveDate};
use tracing::{debug, info};

use crate::domain::{ReadInput, SampleRecord, SchemaKind};
use crate::error::{UploaderError, ValidationIssue, ValidationReport};

const BASE_COLUMNS: [&str; 11] = [
    "batch",
    "run_number",
    "sample_name",
    "control",
    "collection_date",
    "tags",
    "country",
    "specimen_organism",
    "host",
    "instrument_platform",
    "primer_scheme",
];
const OPTIONAL_COLUMNS: [&str; 2] = ["region", "district"];
const NOT_EMPTY: [&str; 8] = [
    "sample_name",
    "collection_date",
    "tags",
    "country",
    "specimen_organism",
    "host",
    "instrument_platform",
    "primer_scheme",
];
const CONTROLS: [&str; 2] = ["positive", "negative"];
const INSTRUMENTS: [&str; 2] = ["Illumina", "Nanopore"];
const EARLIEST_COLLECTION: &str = "2019-01-01";

/// Checked contents of an upload CSV.
#[derive(Debug, Clone)]
pub struct ValidatedBatch {
    pub records: Vec<SampleRecord>,
    pub schema: SchemaKind,
}

pub trait Validator {
    fn validate(&self, path: &Utf8Path) -> Result<ValidatedBatch, UploaderError>;
}

/// Reads and checks an upload CSV, collecting every problem before failing.
#[derive(Debug, Clone, Copy, Default)]
pub struct CsvValidator;

impl Validator for CsvValidator {
    fn validate(&self, path: &Utf8Path) -> Result<ValidatedBatch, UploaderError> {
        let table = Table::read(path).map_err(|err| {
            fail(vec![issue(None, format!("failed to parse upload CSV ({err})"))])
        })?;
        let schema = infer_schema(&table)?;
        debug!("Inferred {schema} for {path}");

        let base_dir = path
            .parent()
            .filter(|dir| !dir.as_str().is_empty())
            .map(Utf8Path::to_path_buf)
            .unwrap_or_else(|| Utf8PathBuf::from("."));
        let input_columns = input_columns(schema);

        let missing = BASE_COLUMNS
            .iter()
            .chain(input_columns)
            .filter(|column| !table.has(column))
            .map(|column| issue(None, format!("missing column {column}")))
            .collect::<Vec<_>>();
        if !missing.is_empty() {
            return Err(fail(missing));
        }

        let mut issues = check_rows(&table, schema, &base_dir);
        issues.sort_by(|a, b| (&a.sample_name, &a.error).cmp(&(&b.sample_name, &b.error)));
        issues.dedup();
        if !issues.is_empty() {
            return Err(fail(issues));
        }

        let records = table
            .rows
            .iter()
            .map(|row| build_record(row, &table.headers, schema, &base_dir, input_columns))
            .collect();
        info!("Validation successful");
        Ok(ValidatedBatch { records, schema })
    }
}

struct Table {
    headers: Vec<String>,
    rows: Vec<HashMap<String, String>>,
}

impl Table {
    fn read(path: &Utf8Path) -> Result<Self, csv::Error> {
        let mut reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_path(path)?;
        let headers = reader.headers()?.iter().map(str::to_string).collect::<Vec<_>>();
        let mut rows = Vec::new();
        for record in reader.records() {
            let record = record?;
            rows.push(
                headers
                    .iter()
                    .cloned()
                    .zip(record.iter().map(str::to_string))
                    .collect(),
            );
        }
        Ok(Self { headers, rows })
    }

    fn has(&self, column: &str) -> bool {
        self.headers.iter().any(|header| header == column)
    }

    fn platforms(&self) -> Vec<&str> {
        self.rows
            .iter()
            .filter_map(|row| row.get("instrument_platform").map(String::as_str))
            .collect()
    }
}

fn infer_schema(table: &Table) -> Result<SchemaKind, UploaderError> {
    let platforms = table.platforms();
    let (fastq, fastq1, fastq2, bam) = (
        table.has("fastq"),
        table.has("fastq1"),
        table.has("fastq2"),
        table.has("bam"),
    );
    if bam && !(fastq || fastq1 || fastq2) {
        if platforms.contains(&"Illumina") {
            return Ok(SchemaKind::PairedBam);
        }
        return Ok(SchemaKind::Bam);
    }
    if fastq && !(fastq1 || fastq2 || bam) && platforms.contains(&"Nanopore") {
        return Ok(SchemaKind::Fastq);
    }
    if fastq1 && fastq2 && !(fastq || bam) && platforms.contains(&"Illumina") {
        return Ok(SchemaKind::PairedFastq);
    }
    Err(fail(vec![issue(
        None,
        "could not infer upload CSV schema. For Nanopore samples, column \
         'instrument_platform' must be 'Nanopore', and either column 'fastq' or \
         column 'bam' must be valid paths. For Illumina samples, column \
         'instrument_platform' must be 'Illumina' and either columns 'bam' or \
         'fastq1' and 'fastq2' must be valid paths."
            .to_string(),
    )]))
}

fn input_columns(schema: SchemaKind) -> &'static [&'static str] {
    match schema {
        SchemaKind::Fastq => &["fastq"],
        SchemaKind::PairedFastq => &["fastq1", "fastq2"],
        SchemaKind::Bam | SchemaKind::PairedBam => &["bam"],
    }
}

fn check_rows(table: &Table, schema: SchemaKind, base_dir: &Utf8Path) -> Vec<ValidationIssue> {
    let mut issues = Vec::new();
    let mut names = HashSet::new();
    let mut seen_inputs: HashMap<&str, HashSet<&str>> = HashMap::new();
    let suffix = if schema.is_alignment() { ".bam" } else { ".fastq.gz" };

    let platforms = table
        .platforms()
        .into_iter()
        .filter(|platform| !platform.is_empty())
        .collect::<BTreeSet<_>>();
    if platforms.len() > 1 {
        issues.push(issue(
            None,
            "instrument_platform must be the same for all samples in a submission".to_string(),
        ));
    }

    for row in &table.rows {
        let value = |column: &str| row.get(column).map(String::as_str).unwrap_or("");
        let name = value("sample_name");
        let label = (!name.is_empty()).then(|| name.to_string());
        let mut report = |error: String| issues.push(issue(label.clone(), error));

        for column in NOT_EMPTY {
            if value(column).is_empty() {
                report(format!("{column} cannot be empty"));
            }
        }
        if !name.is_empty() && !names.insert(name) {
            report("sample_name must be unique".to_string());
        }
        if !name.is_empty() && !is_identifier(name) {
            report("sample_name can only contain characters (A-Za-z0-9._-)".to_string());
        }
        for column in ["batch", "run_number"] {
            if !value(column).is_empty() && !is_identifier(value(column)) {
                report(format!("{column} can only contain characters (A-Za-z0-9._-)"));
            }
        }

        let control = value("control");
        if !control.is_empty() && !CONTROLS.contains(&control) {
            report(format!(
                "{control} in the control field is not valid; field must be either empty or \
                 contain one of the keywords {}",
                CONTROLS.join(", ")
            ));
        }
        let date = value("collection_date");
        if !date.is_empty() && !valid_collection_date(date) {
            report(format!(
                "collection_date must be in format YYYY-MM-DD between {EARLIEST_COLLECTION} and {}",
                Local::now().date_naive()
            ));
        }
        let tags = value("tags");
        if !tags.is_empty() {
            let parts = split_tags(tags);
            if parts.is_empty() {
                report("tags cannot be empty".to_string());
            } else if parts.iter().collect::<HashSet<_>>().len() != parts.len() {
                report("tags cannot be repeated".to_string());
            }
        }
        for (column, allowed) in [
            ("specimen_organism", "SARS-CoV-2"),
            ("host", "human"),
            ("primer_scheme", "auto"),
        ] {
            if !value(column).is_empty() && value(column) != allowed {
                report(format!("{column} can only contain the keyword {allowed}"));
            }
        }
        let platform = value("instrument_platform");
        if !platform.is_empty() && !INSTRUMENTS.contains(&platform) {
            report(format!(
                "instrument_platform can only contain one of {INSTRUMENTS:?}"
            ));
        }

        for &column in input_columns(schema) {
            let input = value(column);
            if input.is_empty() {
                report(format!("{column} cannot be empty"));
                continue;
            }
            if !input.ends_with(suffix) {
                report(format!("{column} must end with .fastq.gz or .bam as appropriate"));
            }
            if !seen_inputs.entry(column).or_default().insert(input) {
                report(format!("{column} must be unique"));
            }
            if !resolve(base_dir, input).as_std_path().is_file() {
                report(format!("{column} file does not exist"));
            }
        }
        if schema == SchemaKind::PairedFastq
            && !value("fastq1").is_empty()
            && value("fastq1") == value("fastq2")
        {
            report("fastq1 and fastq2 cannot be the same".to_string());
        }
    }
    issues
}

fn build_record(
    row: &HashMap<String, String>,
    headers: &[String],
    schema: SchemaKind,
    base_dir: &Utf8Path,
    input_columns: &[&str],
) -> SampleRecord {
    let value = |column: &str| row.get(column).cloned().unwrap_or_default();
    let path = |column: &str| resolve(base_dir, &value(column));
    let input = match schema {
        SchemaKind::Fastq => ReadInput::Single(path("fastq")),
        SchemaKind::PairedFastq => ReadInput::Paired(path("fastq1"), path("fastq2")),
        SchemaKind::Bam | SchemaKind::PairedBam => ReadInput::Alignment(path("bam")),
    };
    let passthrough = headers
        .iter()
        .filter(|column| {
            let column = column.as_str();
            !BASE_COLUMNS.contains(&column)
                && !OPTIONAL_COLUMNS.contains(&column)
                && !input_columns.contains(&column)
        })
        .map(|column| (column.clone(), value(column)))
        .collect::<Vec<_>>();

    SampleRecord {
        batch: value("batch"),
        run_number: value("run_number"),
        sample_name: value("sample_name"),
        control: value("control"),
        collection_date: value("collection_date"),
        tags: split_tags(&value("tags")),
        country: value("country"),
        region: value("region"),
        district: value("district"),
        specimen_organism: value("specimen_organism"),
        host: value("host"),
        instrument_platform: value("instrument_platform"),
        primer_scheme: value("primer_scheme"),
        input,
        passthrough,
    }
}

fn resolve(base_dir: &Utf8Path, path: &str) -> Utf8PathBuf {
    let path = Utf8Path::new(path);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base_dir.join(path)
    }
}

/// Colon-delimited tags with empty entries dropped.
pub fn split_tags(value: &str) -> Vec<String> {
    value
        .trim_matches(|c: char| c == ':' || c.is_whitespace())
        .split(':')
        .map(str::trim)
        .filter(|tag| !tag.is_empty())
        .map(str::to_string)
        .collect()
}

fn is_identifier(value: &str) -> bool {
    value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
}

fn valid_collection_date(value: &str) -> bool {
    let Ok(date) = NaiveDate::parse_from_str(value, "%Y-%m-%d") else {
        return false;
    };
    let Ok(earliest) = NaiveDate::parse_from_str(EARLIEST_COLLECTION, "%Y-%m-%d") else {
        return false;
    };
    date.format("%Y-%m-%d").to_string() == value
        && earliest < date
        && date < Local::now().date_naive()
}

fn issue(sample_name: Option<String>, error: String) -> ValidationIssue {
    ValidationIssue { sample_name, error }
}

fn fail(errors: Vec<ValidationIssue>) -> UploaderError {
    UploaderError::Validation(ValidationReport::failure(errors))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_drop_empty_entries() {
        assert_eq!(split_tags(":site1::site2: "), vec!["site1", "site2"]);
        assert!(split_tags(":::").is_empty());
    }

    #[test]
    fn collection_date_must_be_canonical_and_in_range() {
        assert!(valid_collection_date("2022-03-01"));
        assert!(!valid_collection_date("2022-3-1"));
        assert!(!valid_collection_date("2018-12-31"));
        assert!(!valid_collection_date("2999-01-01"));
    }
}
