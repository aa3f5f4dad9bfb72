use serde::Serialize;
use tracing::info;

use crate::domain::{Checksums, CleanReads, Sample};
use crate::error::UploaderError;
use crate::portal::{
    Instrument, PortalClient, SubmissionBatch, SubmissionPayload, SubmissionReads, SubmissionSample,
    UserDetails,
};
use crate::retry::{RetryPolicy, with_retry};

pub const DONE_MARKER: &str = "upload_done.txt";

/// Batch-level facts shared by every sample in the submission.
#[derive(Debug, Clone)]
pub struct BatchInfo<'a> {
    pub batch_guid: &'a str,
    pub bucket: &'a str,
    pub uploaded_on: &'a str,
    pub user: &'a UserDetails,
}

pub fn build_submission(
    samples: &[Sample],
    info: &BatchInfo<'_>,
) -> Result<SubmissionPayload, UploaderError> {
    let samples = samples
        .iter()
        .map(submission_sample)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(SubmissionPayload {
        status: "completed".to_string(),
        batch: SubmissionBatch {
            file_name: info.batch_guid.to_string(),
            bucket_name: info.bucket.to_string(),
            uploaded_on: info.uploaded_on.to_string(),
            uploaded_by: info.user.user.clone(),
            organisation: info.user.organisation.clone(),
            samples,
        },
    })
}

fn submission_sample(sample: &Sample) -> Result<SubmissionSample, UploaderError> {
    let missing = |what: &str| {
        UploaderError::Invariant(format!("sample {} has no {what}", sample.name()))
    };
    let guid = sample.guid().ok_or_else(|| missing("identifier"))?;
    let clean = sample.clean.as_ref().ok_or_else(|| missing("cleaned reads"))?;
    let checksums = sample.checksums.as_ref().ok_or_else(|| missing("checksum"))?;
    let uri = |path: &camino::Utf8PathBuf| path.file_name().unwrap_or(path.as_str()).to_string();
    let reads = match (clean, checksums) {
        (CleanReads::Single(path), Checksums::Single(md5)) => SubmissionReads::Single {
            uri: uri(path),
            md5: md5.clone(),
        },
        (CleanReads::Paired(path1, path2), Checksums::Paired(md5_1, md5_2)) => {
            SubmissionReads::Paired {
                r1_uri: uri(path1),
                r1_md5: md5_1.clone(),
                r2_uri: uri(path2),
                r2_md5: md5_2.clone(),
            }
        }
        _ => return Err(missing("checksum for each read file")),
    };
    let record = &sample.record;
    Ok(SubmissionSample {
        name: guid.to_string(),
        run_number: sample.gpas_run_number.clone(),
        tags: record.tags.clone(),
        control: record.control.clone(),
        collection_date: record.collection_date.clone(),
        country: record.country.clone(),
        region: record.region.clone(),
        district: record.district.clone(),
        specimen: record.specimen_organism.clone(),
        host: record.host.clone(),
        instrument: Instrument {
            platform: record.instrument_platform.clone(),
        },
        primer_scheme: record.primer_scheme.clone(),
        decontamination: sample.stats,
        reads,
    })
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubmissionSummary {
    pub status: String,
    pub batch: String,
    pub samples: Vec<String>,
}

pub struct Finalizer<'a> {
    pub client: &'a dyn PortalClient,
    pub policy: RetryPolicy,
}

impl Finalizer<'_> {
    /// Posts the batch metadata, then marks the upload done. The marker is
    /// only written once the metadata has been accepted.
    pub async fn finalize(
        &self,
        payload: &SubmissionPayload,
        par: &str,
    ) -> Result<(), UploaderError> {
        let batch_guid = &payload.batch.file_name;
        let response = with_retry(&self.policy, || self.client.submit_batch(payload)).await?;
        if response.status.as_deref() != Some("success") {
            return Err(UploaderError::Submission(response.error_msg.unwrap_or_else(|| {
                format!(
                    "unexpected submission status {:?}",
                    response.status.as_deref().unwrap_or("")
                )
            })));
        }
        let marker = format!("{par}{batch_guid}/{DONE_MARKER}");
        with_retry(&self.policy, || self.client.put_marker(&marker)).await?;
        info!("Finished uploading batch {batch_guid}");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use assert_matches::assert_matches;

    use super::*;
    use crate::domain::{DecontaminationStats, ReadInput, SampleRecord};
    use crate::portal::mock::{MockPortal, PAR};

    fn user() -> UserDetails {
        UserDetails {
            user: "uploader@example.com".to_string(),
            organisation: "Test Org".to_string(),
            allowed_tags: vec![],
        }
    }

    fn sample() -> Sample {
        let mut sample = Sample::new(SampleRecord {
            batch: "b".to_string(),
            run_number: "r1".to_string(),
            sample_name: "s1".to_string(),
            control: "negative".to_string(),
            collection_date: "2022-03-01".to_string(),
            tags: vec!["site1".to_string(), "site2".to_string()],
            country: "GBR".to_string(),
            region: String::new(),
            district: String::new(),
            specimen_organism: "SARS-CoV-2".to_string(),
            host: "human".to_string(),
            instrument_platform: "Nanopore".to_string(),
            primer_scheme: "auto".to_string(),
            input: ReadInput::Single("s1.fastq.gz".into()),
            passthrough: Vec::new(),
        });
        sample.clean = Some(CleanReads::Single("/work/guid-0.reads.fastq.gz".into()));
        sample.checksums = Some(Checksums::Single("abc".to_string()));
        sample.stats = Some(DecontaminationStats {
            count_in: 10,
            count_out: 9,
            fraction: 0.1,
        });
        sample.gpas_run_number = "1".to_string();
        sample.assign_guid("guid-0".to_string()).unwrap();
        sample
    }

    fn payload() -> SubmissionPayload {
        let user = user();
        build_submission(
            &[sample()],
            &BatchInfo {
                batch_guid: "batch-guid",
                bucket: "input-bucket",
                uploaded_on: "2022-03-01T10:00:00.000Z+00:00",
                user: &user,
            },
        )
        .unwrap()
    }

    fn finalizer(portal: &MockPortal) -> Finalizer<'_> {
        Finalizer {
            client: portal,
            policy: RetryPolicy::finalisation().with_delays(Duration::ZERO, Duration::ZERO),
        }
    }

    #[test]
    fn payload_describes_each_sample() {
        let value = serde_json::to_value(payload()).unwrap();
        assert_eq!(value["status"], "completed");
        assert_eq!(value["batch"]["bucket_name"], "input-bucket");
        let sample = &value["batch"]["samples"][0];
        assert_eq!(sample["name"], "guid-0");
        assert_eq!(sample["run_number"], "1");
        assert_eq!(sample["se_reads"]["uri"], "guid-0.reads.fastq.gz");
        assert_eq!(sample["se_reads"]["md5"], "abc");
        assert_eq!(sample["decontamination"]["out"], 9);
        assert_eq!(sample["tags"][1], "site2");
    }

    #[tokio::test]
    async fn marker_follows_accepted_metadata() {
        let portal = MockPortal::default();
        finalizer(&portal).finalize(&payload(), PAR).await.unwrap();
        assert_eq!(
            portal.calls(),
            vec![
                "submit_batch batch-guid".to_string(),
                format!("put_marker {PAR}batch-guid/upload_done.txt"),
            ]
        );
    }

    #[tokio::test]
    async fn failed_metadata_post_skips_marker() {
        let portal = MockPortal::default();
        portal.fail_submission_with_status(500);
        let err = finalizer(&portal).finalize(&payload(), PAR).await.unwrap_err();
        assert_matches!(err, UploaderError::Status { status: 500, .. });
        assert_eq!(portal.count("submit_batch"), 2);
        assert_eq!(portal.count("put_marker"), 0);
    }

    #[tokio::test]
    async fn application_failure_status_is_a_submission_error() {
        let portal = MockPortal::default();
        portal.respond_to_submission("error", Some("duplicate batch"));
        let err = finalizer(&portal).finalize(&payload(), PAR).await.unwrap_err();
        assert_matches!(err, UploaderError::Submission(message) if message == "duplicate batch");
        assert_eq!(portal.count("submit_batch"), 1);
        assert_eq!(portal.count("put_marker"), 0);
    }
}
