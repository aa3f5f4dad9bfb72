use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use camino::Utf8PathBuf;
use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::error::UploaderError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Dev,
    Staging,
    #[default]
    Prod,
}

impl Environment {
    pub fn host(self) -> String {
        if let Ok(host) = std::env::var("GPAS_HOST") {
            if !host.trim().is_empty() {
                return host.trim().trim_end_matches('/').to_string();
            }
        }
        match self {
            Environment::Dev => "https://portal.dev.gpas.ox.ac.uk".to_string(),
            Environment::Staging => "https://portal.staging.gpas.ox.ac.uk".to_string(),
            Environment::Prod => "https://portal.gpas.ox.ac.uk".to_string(),
        }
    }

    pub fn endpoints(self) -> Endpoints {
        Endpoints::for_host(&self.host())
    }
}

/// Base URLs of the two portal APIs; both end with a slash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    pub ords: String,
    pub api: String,
}

impl Endpoints {
    pub fn for_host(host: &str) -> Self {
        let host = host.trim_end_matches('/');
        Self {
            ords: format!("{host}/ords/grep/electron/"),
            api: format!("{host}/ords/gpas_pub/gpasapi/"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Token {
    pub access_token: String,
}

impl Token {
    pub fn load(path: &Path) -> Result<Self, UploaderError> {
        let content = fs::read_to_string(path)
            .map_err(|err| UploaderError::Token(format!("{}: {err}", path.display())))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, UploaderError> {
        let token: Token = serde_json::from_str(content)
            .map_err(|err| UploaderError::Token(err.to_string()))?;
        if token.access_token.trim().is_empty() {
            return Err(UploaderError::Token("access_token is empty".to_string()));
        }
        Ok(token)
    }
}

#[derive(Debug, Clone)]
pub struct UploadOptions {
    pub working_dir: Utf8PathBuf,
    pub out_dir: Utf8PathBuf,
    /// Concurrent decontamination workers.
    pub processes: usize,
    /// Concurrent sample uploads.
    pub connections: usize,
}

impl Default for UploadOptions {
    fn default() -> Self {
        Self {
            working_dir: Utf8PathBuf::from("/tmp"),
            out_dir: Utf8PathBuf::from("."),
            processes: default_processes(),
            connections: 10,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchOptions {
    pub connections: usize,
    pub timeout: Duration,
    pub out_dir: Utf8PathBuf,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            connections: 16,
            timeout: Duration::from_secs(30),
            out_dir: Utf8PathBuf::from("."),
        }
    }
}

/// Available CPUs; forced to one where fork-based pooling is unavailable.
pub fn default_processes() -> usize {
    if cfg!(windows) {
        return 1;
    }
    std::thread::available_parallelism()
        .map(|count| count.get())
        .unwrap_or(1)
}

/// Worker count for decontamination; unset or zero means one per CPU.
pub fn resolve_processes(requested: Option<usize>) -> usize {
    match requested {
        Some(processes) if processes > 0 => processes,
        _ => default_processes(),
    }
}

/// Locates an external binary: `GPAS_<NAME>_PATH`, then `$PATH`.
pub fn binary_path(name: &str) -> Result<PathBuf, UploaderError> {
    let env_var = format!("GPAS_{}_PATH", name.to_uppercase());
    if let Some(path) = std::env::var_os(&env_var).map(PathBuf::from) {
        if path.exists() {
            return Ok(path);
        }
    }
    find_in_path(name).ok_or_else(|| UploaderError::MissingTool(name.to_string()))
}

fn find_in_path(name: &str) -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    for path in std::env::split_paths(&path_var) {
        let exe = path.join(format!("{name}.exe"));
        if exe.exists() {
            return Some(exe);
        }
        let plain = path.join(name);
        if plain.exists() {
            return Some(plain);
        }
    }
    None
}

/// Reference data directory: `GPAS_DATA_PATH`, then `data/` next to the executable.
pub fn data_path() -> Result<PathBuf, UploaderError> {
    if let Some(path) = std::env::var_os("GPAS_DATA_PATH").map(PathBuf::from) {
        if path.exists() {
            return Ok(path);
        }
    }
    let beside_exe = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join("data")));
    match beside_exe {
        Some(path) if path.exists() => Ok(path),
        _ => Err(UploaderError::MissingData(
            "set GPAS_DATA_PATH to the reference data directory".to_string(),
        )),
    }
}

pub fn reference_path(organism: &str) -> Result<PathBuf, UploaderError> {
    let file = match organism {
        "SARS-CoV-2" => "MN908947_no_polyA.fasta",
        other => {
            return Err(UploaderError::MissingData(format!(
                "no decontamination reference for {other}"
            )));
        }
    };
    Ok(data_path()?.join("refs").join(file))
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn endpoints_join_host() {
        let endpoints = Endpoints::for_host("http://localhost:8080/");
        assert_eq!(endpoints.ords, "http://localhost:8080/ords/grep/electron/");
        assert_eq!(endpoints.api, "http://localhost:8080/ords/gpas_pub/gpasapi/");
    }

    #[test]
    fn parse_token() {
        let token = Token::parse(r#"{"access_token": "abc", "expires_in": 3600}"#).unwrap();
        assert_eq!(token.access_token, "abc");
    }

    #[test]
    fn empty_token_is_rejected() {
        let err = Token::parse(r#"{"access_token": " "}"#).unwrap_err();
        assert_matches!(err, UploaderError::Token(_));
    }

    #[test]
    fn zero_processes_means_all_cpus() {
        assert_eq!(resolve_processes(Some(0)), default_processes());
        assert_eq!(resolve_processes(None), default_processes());
        assert_eq!(resolve_processes(Some(3)), 3);
    }

    #[test]
    fn unknown_organism_has_no_reference() {
        let err = reference_path("E. coli").unwrap_err();
        assert_matches!(err, UploaderError::MissingData(_));
    }
}
