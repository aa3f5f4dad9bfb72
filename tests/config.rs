use assert_matches::assert_matches;

use gpas_uploader::config::{Endpoints, FetchOptions, Token, UploadOptions};
use gpas_uploader::error::UploaderError;

#[test]
fn endpoints_share_host() {
    let endpoints = Endpoints::for_host("https://portal.example.org");
    assert!(endpoints.ords.starts_with("https://portal.example.org/"));
    assert!(endpoints.api.starts_with("https://portal.example.org/"));
    assert!(endpoints.ords.ends_with('/'));
    assert!(endpoints.api.ends_with('/'));
}

#[test]
fn token_requires_access_token_field() {
    let err = Token::parse(r#"{"refresh_token": "abc"}"#).unwrap_err();
    assert_matches!(err, UploaderError::Token(_));
}

#[test]
fn token_file_is_read() {
    let temp = tempfile::tempdir().unwrap();
    let path = temp.path().join("token.json");
    std::fs::write(&path, r#"{"access_token": "secret"}"#).unwrap();
    assert_eq!(Token::load(&path).unwrap().access_token, "secret");
}

#[test]
fn default_concurrency_limits() {
    let upload = UploadOptions::default();
    assert_eq!(upload.connections, 10);
    assert!(upload.processes >= 1);
    assert_eq!(FetchOptions::default().connections, 16);
}
