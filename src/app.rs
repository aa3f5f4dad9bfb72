use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::fs;

use camino::Utf8PathBuf;
use chrono::{DateTime, Local, TimeZone};
use tracing::{debug, info, warn};

use crate::checksum::{assign_guids, checksum_keys, hash_samples};
use crate::config::UploadOptions;
use crate::decontam::{Decontaminator, Toolchain};
use crate::domain::{Sample, SchemaKind};
use crate::error::UploaderError;
use crate::fs_util::rename_clean_reads;
use crate::mapping::write_mapping;
use crate::portal::{
    ErrorReport, ExceptionDetails, GuidRequest, GuidRequestBatch, PortalClient, UserDetails,
    bucket_from_par,
};
use crate::progress::ProgressSink;
use crate::retry::RetryPolicy;
use crate::runner::CommandRunner;
use crate::submission::{BatchInfo, Finalizer, SubmissionSummary, build_submission};
use crate::upload::{UploadEngine, upload_units};
use crate::validation::ValidatedBatch;

/// Where a batch is in the upload pipeline. States only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum BatchState {
    Validated,
    Decontaminated,
    /// Terminal: no credential, nothing left to do after cleaning reads.
    NoToken,
    Hashed,
    Reconciled,
    MappingWritten,
    FilesRenamed,
    /// Terminal: dry run stops before any upload.
    DryRunStop,
    Submitted,
}

impl fmt::Display for BatchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum UploadOutcome {
    NoToken,
    DryRun {
        batch_guid: String,
        mapping: Utf8PathBuf,
    },
    Submitted {
        summary: SubmissionSummary,
        mapping: Utf8PathBuf,
    },
}

/// Collaborators a batch talks to. Without a client the batch stops after
/// decontamination.
#[derive(Clone, Copy)]
pub struct Services<'a> {
    pub runner: &'a dyn CommandRunner,
    pub client: Option<&'a dyn PortalClient>,
    pub sink: &'a dyn ProgressSink,
}

pub struct Batch<'a> {
    samples: Vec<Sample>,
    schema: SchemaKind,
    uploaded_on: String,
    state: BatchState,
    user: Option<UserDetails>,
    options: UploadOptions,
    tools: Toolchain,
    services: Services<'a>,
    transport_policy: RetryPolicy,
    finalisation_policy: RetryPolicy,
}

impl<'a> Batch<'a> {
    /// Builds a batch from validated records, fetching the uploader's
    /// details first when a portal client is available.
    pub async fn new(
        validated: ValidatedBatch,
        options: UploadOptions,
        tools: Toolchain,
        services: Services<'a>,
    ) -> Result<Self, UploaderError> {
        let user = match services.client {
            Some(client) => Some(client.user_details().await?),
            None => None,
        };
        let mut samples = validated
            .records
            .into_iter()
            .map(Sample::new)
            .collect::<Vec<_>>();
        number_runs(&mut samples);
        Ok(Self {
            samples,
            schema: validated.schema,
            uploaded_on: upload_timestamp(&Local::now()),
            state: BatchState::Validated,
            user,
            options,
            tools,
            services,
            transport_policy: RetryPolicy::transport(),
            finalisation_policy: RetryPolicy::finalisation(),
        })
    }

    pub fn with_policies(mut self, transport: RetryPolicy, finalisation: RetryPolicy) -> Self {
        self.transport_policy = transport;
        self.finalisation_policy = finalisation;
        self
    }

    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    pub fn state(&self) -> BatchState {
        self.state
    }

    /// Drives the batch to a terminal state. Any failure is reported to the
    /// portal once, on a best-effort basis, and then returned unchanged.
    pub async fn upload(&mut self, dry_run: bool) -> Result<UploadOutcome, UploaderError> {
        match self.run(dry_run).await {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                self.report_failure(&err).await;
                Err(err)
            }
        }
    }

    async fn run(&mut self, dry_run: bool) -> Result<UploadOutcome, UploaderError> {
        if self.state != BatchState::Validated {
            return Err(UploaderError::Invariant(format!(
                "batch already ran (state {})",
                self.state
            )));
        }
        info!("Using {} processes", self.options.processes);
        fs::create_dir_all(&self.options.working_dir).map_err(|err| {
            UploaderError::Filesystem(format!("create {}: {err}", self.options.working_dir))
        })?;

        let decontaminator = Decontaminator {
            runner: self.services.runner,
            tools: &self.tools,
            working_dir: &self.options.working_dir,
            workers: self.options.processes,
            sink: self.services.sink,
        };
        decontaminator.run(&mut self.samples, self.schema).await?;
        self.advance(BatchState::Decontaminated);

        let (Some(client), Some(user)) = (self.services.client, self.user.clone()) else {
            warn!("No token provided, quitting after decontamination");
            for sample in &self.samples {
                if let Some(clean) = &sample.clean {
                    let paths = clean.paths().iter().map(|path| path.as_str()).collect::<Vec<_>>();
                    info!("{}: {}", sample.name(), paths.join(" "));
                }
            }
            self.advance(BatchState::NoToken);
            return Ok(UploadOutcome::NoToken);
        };

        hash_samples(&mut self.samples).await?;
        self.advance(BatchState::Hashed);

        let request = GuidRequest {
            batch: GuidRequestBatch {
                organisation: user.organisation.clone(),
                uploaded_on: self.uploaded_on.clone(),
                uploaded_by: user.user.clone(),
                samples: checksum_keys(&self.samples)?,
            },
        };
        debug!("Fetching identifiers for {} sample(s)", request.batch.samples.len());
        let response = client.create_sample_guids(&request).await?;
        assign_guids(&mut self.samples, &response)?;
        let batch_guid = response.batch.guid;
        self.advance(BatchState::Reconciled);

        let mapping = write_mapping(&self.options.out_dir, &batch_guid, &self.samples)?;
        self.advance(BatchState::MappingWritten);

        for sample in &mut self.samples {
            rename_clean_reads(sample)?;
        }
        self.advance(BatchState::FilesRenamed);

        if dry_run {
            info!("Dry run; skipping upload of batch {batch_guid}");
            self.advance(BatchState::DryRunStop);
            return Ok(UploadOutcome::DryRun { batch_guid, mapping });
        }

        let par = client.fetch_par().await?;
        let bucket = bucket_from_par(&par)?;
        let units = upload_units(&self.samples, &par, &batch_guid)?;
        UploadEngine {
            client,
            concurrency: self.options.connections,
            policy: self.transport_policy,
            sink: self.services.sink,
        }
        .upload(&units)
        .await?;

        let payload = build_submission(
            &self.samples,
            &BatchInfo {
                batch_guid: &batch_guid,
                bucket: &bucket,
                uploaded_on: &self.uploaded_on,
                user: &user,
            },
        )?;
        Finalizer {
            client,
            policy: self.finalisation_policy,
        }
        .finalize(&payload, &par)
        .await?;
        self.advance(BatchState::Submitted);

        Ok(UploadOutcome::Submitted {
            summary: SubmissionSummary {
                status: "success".to_string(),
                batch: batch_guid,
                samples: self.samples.iter().map(|sample| sample.name().to_string()).collect(),
            },
            mapping,
        })
    }

    fn advance(&mut self, next: BatchState) {
        debug!("batch state {} -> {next}", self.state);
        self.state = next;
    }

    async fn report_failure(&self, err: &UploaderError) {
        let Some(client) = self.services.client else {
            return;
        };
        let report = ErrorReport {
            exception: ExceptionDetails {
                class: err.class_name().to_string(),
                message: err.to_string(),
                traceback: format!("{err:?}"),
                timestamp: upload_timestamp(&Local::now()),
            },
            uploader: format!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION")),
        };
        if let Err(log_err) = client.log_error(&report).await {
            warn!("Could not report error to portal: {log_err}");
        }
    }
}

/// Numbers distinct non-empty run names from 1 in sorted order. Samples
/// without a run name get an empty run number.
pub fn number_runs(samples: &mut [Sample]) {
    let names = samples
        .iter()
        .map(|sample| sample.record.run_number.as_str())
        .filter(|name| !name.is_empty())
        .collect::<BTreeSet<_>>();
    let numbers = names
        .into_iter()
        .enumerate()
        .map(|(index, name)| (name.to_string(), (index + 1).to_string()))
        .collect::<HashMap<_, _>>();
    for sample in samples {
        sample.gpas_run_number = numbers
            .get(&sample.record.run_number)
            .cloned()
            .unwrap_or_default();
    }
}

/// Millisecond ISO timestamp with `Z` before the offset, as the portal expects.
pub fn upload_timestamp<Tz: TimeZone>(time: &DateTime<Tz>) -> String
where
    Tz::Offset: fmt::Display,
{
    time.format("%Y-%m-%dT%H:%M:%S%.3fZ%:z").to_string()
}
