use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};

use camino::{Utf8Path, Utf8PathBuf};
use tracing::{debug, info, warn};

use crate::domain::{FileType, GOOD_STATUSES, SampleStatus, Targets};
use crate::error::UploaderError;
use crate::executor::{collect_all, run_bounded};
use crate::fs_util::update_fasta_header;
use crate::portal::PortalClient;
use crate::retry::{RetryPolicy, with_retry};

/// Queries and downloads results for many samples over one shared client.
pub struct Fetcher<'a> {
    pub client: &'a dyn PortalClient,
    pub connections: usize,
    pub policy: RetryPolicy,
}

impl Fetcher<'_> {
    /// One status per identifier, in identifier order. Any HTTP 401 fails
    /// the whole query once every in-flight request has finished.
    pub async fn status(&self, targets: &Targets) -> Result<Vec<SampleStatus>, UploaderError> {
        self.client.user_details().await?;
        let guids = unique(targets.identifiers());
        info!("Querying status for {} sample(s)", guids.len());

        let completed = AtomicUsize::new(0);
        let tasks = guids
            .iter()
            .map(|guid| (guid.clone(), self.status_one(guid, &completed, guids.len())))
            .collect();
        let results = collect_all(&guids, run_bounded(self.connections, tasks).await)?;

        let mut statuses = guids
            .iter()
            .filter_map(|guid| results.get(guid).cloned())
            .collect::<Vec<_>>();
        if let Targets::ByIdentifierWithLocalName(_) = targets {
            debug!("Renaming");
            for status in &mut statuses {
                if let Some(name) = targets.local_name(&status.sample) {
                    status.sample = name.to_string();
                }
            }
        }
        Ok(statuses)
    }

    async fn status_one(
        &self,
        guid: &str,
        completed: &AtomicUsize,
        total: usize,
    ) -> Result<SampleStatus, UploaderError> {
        let result = with_retry(&self.policy, || self.client.sample_detail(guid)).await;
        let done = completed.fetch_add(1, Ordering::Relaxed) + 1;
        debug!("Queried {done}/{total}");
        match result {
            Ok(detail) => {
                let status = detail.status.unwrap_or_else(|| "Unknown".to_string());
                if !GOOD_STATUSES.contains(&status.as_str()) {
                    warn!("Sample {guid} has status {status}");
                }
                Ok(SampleStatus {
                    sample: guid.to_string(),
                    status,
                })
            }
            Err(err @ UploaderError::Authentication { .. }) => Err(err),
            Err(err) => {
                warn!("{guid}: {err}");
                Ok(SampleStatus::unknown(guid))
            }
        }
    }

    /// Writes `{name-or-identifier}.{extension}` under `out_dir` for every
    /// identifier and file type. Outputs the portal cannot supply are
    /// skipped; the returned paths are the files actually written.
    pub async fn download(
        &self,
        targets: &Targets,
        file_types: &[FileType],
        out_dir: &Utf8Path,
    ) -> Result<Vec<Utf8PathBuf>, UploaderError> {
        tokio::fs::create_dir_all(out_dir)
            .await
            .map_err(|err| UploaderError::Filesystem(format!("create {out_dir}: {err}")))?;
        let guids = unique(targets.identifiers());
        info!("Fetching file types {file_types:?} for {} sample(s)", guids.len());

        let mut order = Vec::new();
        let mut tasks = Vec::new();
        for guid in &guids {
            for file_type in file_types {
                let label = format!("{guid}.{file_type}");
                order.push(label.clone());
                let name = targets.local_name(guid);
                tasks.push((label, self.download_one(guid, *file_type, name, out_dir)));
            }
        }
        let results = collect_all(&order, run_bounded(self.connections, tasks).await)?;

        let written = order
            .iter()
            .filter_map(|label| results.get(label).cloned().flatten())
            .collect::<Vec<_>>();
        info!("Downloaded {} of {} file(s)", written.len(), order.len());
        Ok(written)
    }

    async fn download_one(
        &self,
        guid: &str,
        file_type: FileType,
        name: Option<&str>,
        out_dir: &Utf8Path,
    ) -> Result<Option<Utf8PathBuf>, UploaderError> {
        let fetched = with_retry(&self.policy, || self.client.get_output(guid, file_type)).await;
        let bytes = match fetched {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!("Skipping {guid}.{file_type} ({err})");
                return Ok(None);
            }
        };
        let prefix = name.unwrap_or(guid);
        let path = out_dir.join(format!("{prefix}.{}", file_type.extension()));
        tokio::fs::write(&path, bytes)
            .await
            .map_err(|err| UploaderError::Filesystem(format!("write {path}: {err}")))?;
        debug!("wrote {path}");
        if let (Some(name), FileType::Fasta) = (name, file_type) {
            let (fasta, guid, name) = (path.clone(), guid.to_string(), name.to_string());
            tokio::task::spawn_blocking(move || update_fasta_header(&fasta, &guid, &name))
                .await
                .map_err(|err| UploaderError::Invariant(format!("rename task failed: {err}")))??;
        }
        Ok(Some(path))
    }
}

fn unique(guids: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    guids
        .into_iter()
        .filter(|guid| seen.insert(guid.clone()))
        .collect()
}
