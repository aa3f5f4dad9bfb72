use miette::Diagnostic;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum UploaderError {
    #[error("{0}")]
    Validation(ValidationReport),

    #[error("authorisation failed (HTTP {status}). Invalid token?")]
    Authentication { status: u16 },

    #[error("permission denied: {0}")]
    Permission(String),

    #[error("command for {label} exited with code {code:?}: {command}\n{stderr}")]
    Subprocess {
        label: String,
        command: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("submission failed: {0}")]
    Submission(String),

    #[error("request failed: {0}")]
    Transport(String),

    #[error("portal returned status {status}: {message}")]
    Status { status: u16, message: String },

    #[error("no identifier left for checksum {checksum} (sample {sample})")]
    Reconciliation { checksum: String, sample: String },

    #[error("invariant violated: {0}")]
    Invariant(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("failed to read token file: {0}")]
    Token(String),

    #[error("csv error: {0}")]
    Csv(String),

    #[error("invalid file type(s): {0}")]
    InvalidFileType(String),

    #[error("required tool not found: {0}")]
    MissingTool(String),

    #[error("could not find data directory: {0}")]
    MissingData(String),

    #[error("unexpected response from portal: {0}")]
    Protocol(String),
}

impl UploaderError {
    /// Network-level failures worth another attempt. Application responses never are.
    pub fn is_transient(&self) -> bool {
        matches!(self, UploaderError::Transport(_))
    }

    pub fn class_name(&self) -> &'static str {
        match self {
            UploaderError::Validation(_) => "ValidationError",
            UploaderError::Authentication { .. } | UploaderError::Permission(_) => {
                "AuthenticationError"
            }
            UploaderError::Subprocess { .. } => "SubprocessError",
            UploaderError::Submission(_) => "SubmissionError",
            UploaderError::Transport(_) => "TransportError",
            UploaderError::Status { .. } => "HTTPStatusError",
            UploaderError::Reconciliation { .. } => "KeyError",
            UploaderError::Invariant(_) => "AssertionError",
            UploaderError::Filesystem(_) | UploaderError::Token(_) => "OSError",
            UploaderError::Csv(_) => "CsvError",
            UploaderError::InvalidFileType(_) => "ValueError",
            UploaderError::MissingTool(_) | UploaderError::MissingData(_) => {
                "FileNotFoundError"
            }
            UploaderError::Protocol(_) => "ProtocolError",
        }
    }
}

impl From<reqwest::Error> for UploaderError {
    fn from(err: reqwest::Error) -> Self {
        // Malformed requests and unreadable bodies fail the same way every time.
        if err.is_builder() || err.is_decode() {
            return UploaderError::Protocol(err.to_string());
        }
        UploaderError::Transport(err.to_string())
    }
}

impl From<std::io::Error> for UploaderError {
    fn from(err: std::io::Error) -> Self {
        UploaderError::Filesystem(err.to_string())
    }
}

impl From<csv::Error> for UploaderError {
    fn from(err: csv::Error) -> Self {
        UploaderError::Csv(err.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationIssue {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sample_name: Option<String>,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationReport {
    pub status: String,
    pub errors: Vec<ValidationIssue>,
}

impl ValidationReport {
    pub fn failure(errors: Vec<ValidationIssue>) -> Self {
        Self {
            status: "failure".to_string(),
            errors,
        }
    }
}

impl std::fmt::Display for ValidationReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "failed to validate upload CSV ({} errors):",
            self.errors.len()
        )?;
        for issue in &self.errors {
            match &issue.sample_name {
                Some(name) => writeln!(f, "  {name}: {}", issue.error)?,
                None => writeln!(f, "  {}", issue.error)?,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn only_transport_errors_are_transient() {
        assert!(UploaderError::Transport("reset".to_string()).is_transient());
        assert!(!UploaderError::Status {
            status: 503,
            message: String::new()
        }
        .is_transient());
        assert!(!UploaderError::Authentication { status: 401 }.is_transient());
    }

    #[test]
    fn malformed_request_is_not_retried() {
        let err = reqwest::Client::new()
            .put("not-a-url/guid.reads.fastq.gz")
            .build()
            .unwrap_err();
        let err = UploaderError::from(err);
        assert_matches!(err, UploaderError::Protocol(_));
        assert!(!err.is_transient());
    }

    #[test]
    fn report_lists_every_issue() {
        let report = ValidationReport::failure(vec![
            ValidationIssue {
                sample_name: Some("s1".to_string()),
                error: "fastq does not exist".to_string(),
            },
            ValidationIssue {
                sample_name: None,
                error: "could not infer upload CSV schema".to_string(),
            },
        ]);
        let text = report.to_string();
        assert!(text.contains("2 errors"));
        assert!(text.contains("s1: fastq does not exist"));
    }
}
