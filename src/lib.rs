pub mod app;
pub mod checksum;
pub mod config;
pub mod decontam;
pub mod domain;
pub mod error;
pub mod executor;
pub mod fetcher;
pub mod fs_util;
pub mod mapping;
pub mod output;
pub mod portal;
pub mod progress;
pub mod retry;
pub mod runner;
pub mod submission;
pub mod upload;
pub mod validation;
