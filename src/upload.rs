use tracing::{debug, info};

use crate::domain::{CleanReads, Sample, UploadUnit};
use crate::error::UploaderError;
use crate::executor::{collect_all, run_bounded};
use crate::portal::PortalClient;
use crate::progress::{ProgressEvent, ProgressSink, Status};
use crate::retry::{RetryPolicy, with_retry};

pub const UPLOAD: &str = "upload";

/// Builds each sample's transfer under `{par}{batch_guid}/`.
pub fn upload_units(
    samples: &[Sample],
    par: &str,
    batch_guid: &str,
) -> Result<Vec<UploadUnit>, UploaderError> {
    let prefix = format!("{par}{batch_guid}/");
    samples
        .iter()
        .map(|sample| {
            let guid = sample.guid().ok_or_else(|| {
                UploaderError::Invariant(format!("sample {} has no identifier", sample.name()))
            })?;
            let clean = sample.clean.as_ref().ok_or_else(|| {
                UploaderError::Invariant(format!("sample {} has no cleaned reads", sample.name()))
            })?;
            Ok(match clean {
                CleanReads::Single(path) => UploadUnit {
                    sample_label: sample.name().to_string(),
                    local_path1: path.clone(),
                    local_path2: None,
                    remote_url1: format!("{prefix}{guid}.reads.fastq.gz"),
                    remote_url2: None,
                },
                CleanReads::Paired(path1, path2) => UploadUnit {
                    sample_label: sample.name().to_string(),
                    local_path1: path1.clone(),
                    local_path2: Some(path2.clone()),
                    remote_url1: format!("{prefix}{guid}.reads_1.fastq.gz"),
                    remote_url2: Some(format!("{prefix}{guid}.reads_2.fastq.gz")),
                },
            })
        })
        .collect()
}

pub struct UploadEngine<'a> {
    pub client: &'a dyn PortalClient,
    pub concurrency: usize,
    pub policy: RetryPolicy,
    pub sink: &'a dyn ProgressSink,
}

impl UploadEngine<'_> {
    /// Transfers every unit. All units run to completion before the first
    /// failure, in unit order, is returned.
    pub async fn upload(&self, units: &[UploadUnit]) -> Result<(), UploaderError> {
        info!("Uploading {} sample(s)", units.len());
        let order = units
            .iter()
            .map(|unit| unit.sample_label.clone())
            .collect::<Vec<_>>();
        let tasks = units
            .iter()
            .map(|unit| (unit.sample_label.clone(), self.upload_unit(unit)))
            .collect();
        collect_all(&order, run_bounded(self.concurrency, tasks).await)?;
        Ok(())
    }

    async fn upload_unit(&self, unit: &UploadUnit) -> Result<(), UploaderError> {
        self.sink
            .event(ProgressEvent::sample(UPLOAD, Status::Started, &unit.sample_label));
        for (path, url) in unit.transfers() {
            with_retry(&self.policy, || self.client.put_file(url, path)).await?;
            debug!(sample = %unit.sample_label, %path, "uploaded file");
        }
        self.sink
            .event(ProgressEvent::sample(UPLOAD, Status::Finished, &unit.sample_label));
        info!("Uploaded {}", unit.sample_label);
        Ok(())
    }
}
