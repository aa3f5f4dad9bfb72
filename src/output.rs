use std::io::{self, Write};

use clap::ValueEnum;
use serde::Serialize;
use serde_json::json;

use crate::domain::{ReadInput, SampleStatus};
use crate::error::{UploaderError, ValidationReport};
use crate::progress::{ProgressEvent, ProgressSink};
use crate::submission::SubmissionSummary;
use crate::validation::ValidatedBatch;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    Text,
    Json,
}

impl OutputMode {
    pub fn from_flag(json_messages: bool) -> Self {
        if json_messages {
            OutputMode::Json
        } else {
            OutputMode::Text
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum StatusFormat {
    #[default]
    Table,
    Csv,
    Json,
}

#[derive(Debug, Clone, Serialize)]
struct ValidatedSample<'a> {
    sample_name: &'a str,
    files: Vec<&'a str>,
}

/// One-line JSON messages on stdout: progress events followed by exactly
/// one terminal object.
pub struct JsonOutput;

impl JsonOutput {
    pub fn print_validation_success(batch: &ValidatedBatch) -> io::Result<()> {
        Self::emit(&validation_success(batch))
    }

    pub fn print_validation_failure(report: &ValidationReport) -> io::Result<()> {
        Self::emit(&json!({ "validation": report }))
    }

    pub fn print_exception(error: &UploaderError) -> io::Result<()> {
        if let UploaderError::Validation(report) = error {
            return Self::print_validation_failure(report);
        }
        Self::emit(&json!({
            "exception": error.to_string(),
            "traceback": format!("{}: {error:?}", error.class_name()),
        }))
    }

    /// Terminal object for failures outside the uploader's own error type.
    pub fn print_unexpected(message: &str) -> io::Result<()> {
        Self::emit(&json!({ "exception": message, "traceback": "" }))
    }

    pub fn print_submission(summary: &SubmissionSummary) -> io::Result<()> {
        Self::emit(&json!({ "submission": summary }))
    }

    pub fn print_statuses(statuses: &[SampleStatus]) -> io::Result<()> {
        Self::print_json(&statuses)
    }

    fn emit<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout().lock();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        stdout.flush()
    }

    fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}

impl ProgressSink for JsonOutput {
    fn event(&self, event: ProgressEvent) {
        // Best effort.
        let _ = Self::emit(&json!({ "progress": event }));
    }
}

pub fn validation_success(batch: &ValidatedBatch) -> serde_json::Value {
    let samples = batch
        .records
        .iter()
        .map(|record| ValidatedSample {
            sample_name: &record.sample_name,
            files: match &record.input {
                ReadInput::Single(path) | ReadInput::Alignment(path) => vec![path.as_str()],
                ReadInput::Paired(path1, path2) => vec![path1.as_str(), path2.as_str()],
            },
        })
        .collect::<Vec<_>>();
    json!({ "validation": { "status": "success", "samples": samples } })
}

pub fn render_status_table(statuses: &[SampleStatus]) -> String {
    let width = statuses
        .iter()
        .map(|status| status.sample.len())
        .chain(std::iter::once("sample".len()))
        .max()
        .unwrap_or(0);
    let mut table = format!("{:<width$}  status\n", "sample");
    for status in statuses {
        table.push_str(&format!("{:<width$}  {}\n", status.sample, status.status));
    }
    table
}

pub fn render_status_csv(statuses: &[SampleStatus]) -> Result<String, UploaderError> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    for status in statuses {
        writer.serialize(status)?;
    }
    let bytes = writer
        .into_inner()
        .map_err(|err| UploaderError::Csv(err.to_string()))?;
    String::from_utf8(bytes).map_err(|err| UploaderError::Csv(err.to_string()))
}
