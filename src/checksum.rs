use std::collections::{HashMap, VecDeque};
use std::fs::File;
use std::io::{BufReader, Read};

use camino::{Utf8Path, Utf8PathBuf};
use tracing::debug;

use crate::domain::{Checksums, CleanReads, Sample};
use crate::error::UploaderError;
use crate::portal::GuidResponse;

const CHUNK_SIZE: usize = 64 * 1024;

/// Hex MD5 of a file, read in fixed-size chunks.
pub fn md5_file(path: &Utf8Path) -> Result<String, UploaderError> {
    let file = File::open(path)
        .map_err(|err| UploaderError::Filesystem(format!("open {path}: {err}")))?;
    let mut reader = BufReader::new(file);
    let mut context = md5::Context::new();
    let mut buffer = vec![0u8; CHUNK_SIZE];
    loop {
        let read = reader.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        context.consume(&buffer[..read]);
    }
    Ok(format!("{:x}", context.compute()))
}

async fn md5_file_blocking(path: Utf8PathBuf) -> Result<String, UploaderError> {
    tokio::task::spawn_blocking(move || md5_file(&path))
        .await
        .map_err(|err| UploaderError::Invariant(format!("checksum task failed: {err}")))?
}

/// Populates each sample's checksums from its cleaned reads.
pub async fn hash_samples(samples: &mut [Sample]) -> Result<(), UploaderError> {
    for sample in samples.iter_mut() {
        let clean = sample.clean.clone().ok_or_else(|| {
            UploaderError::Invariant(format!("sample {} has no cleaned reads", sample.name()))
        })?;
        let checksums = match clean {
            CleanReads::Single(path) => Checksums::Single(md5_file_blocking(path).await?),
            CleanReads::Paired(path1, path2) => Checksums::Paired(
                md5_file_blocking(path1).await?,
                md5_file_blocking(path2).await?,
            ),
        };
        debug!(sample = sample.name(), checksum = checksums.key(), "hashed reads");
        sample.checksums = Some(checksums);
    }
    Ok(())
}

/// Checksums to send to the identifier service, one per sample in order.
pub fn checksum_keys(samples: &[Sample]) -> Result<Vec<String>, UploaderError> {
    samples
        .iter()
        .map(|sample| {
            sample
                .checksums
                .as_ref()
                .map(|checksums| checksums.key().to_string())
                .ok_or_else(|| {
                    UploaderError::Invariant(format!("sample {} has no checksum", sample.name()))
                })
        })
        .collect()
}

/// Assigns one server identifier per sample, consuming identifiers for a
/// shared checksum in the order the server listed them.
pub fn assign_guids(samples: &mut [Sample], response: &GuidResponse) -> Result<(), UploaderError> {
    let mut pool: HashMap<&str, VecDeque<&str>> = HashMap::new();
    for pair in &response.batch.samples {
        pool.entry(pair.hash.as_str())
            .or_default()
            .push_back(pair.guid.as_str());
    }

    for sample in samples.iter_mut() {
        let checksum = sample
            .checksums
            .as_ref()
            .map(|checksums| checksums.key().to_string())
            .ok_or_else(|| {
                UploaderError::Invariant(format!("sample {} has no checksum", sample.name()))
            })?;
        let guid = pool
            .get_mut(checksum.as_str())
            .and_then(VecDeque::pop_front)
            .ok_or_else(|| UploaderError::Reconciliation {
                checksum: checksum.clone(),
                sample: sample.name().to_string(),
            })?;
        sample.assign_guid(guid.to_string())?;
    }

    let surplus = pool.values().map(VecDeque::len).sum::<usize>();
    if surplus > 0 {
        return Err(UploaderError::Protocol(format!(
            "identifier service returned {surplus} unassigned identifier(s)"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use assert_matches::assert_matches;

    use super::*;
    use crate::domain::{ReadInput, SampleRecord};
    use crate::portal::{GuidResponseBatch, HashGuid};

    fn sample(name: &str, checksum: &str) -> Sample {
        let mut sample = Sample::new(SampleRecord {
            batch: "b".to_string(),
            run_number: String::new(),
            sample_name: name.to_string(),
            control: String::new(),
            collection_date: "2022-01-01".to_string(),
            tags: vec![],
            country: "GBR".to_string(),
            region: String::new(),
            district: String::new(),
            specimen_organism: "SARS-CoV-2".to_string(),
            host: "human".to_string(),
            instrument_platform: "Nanopore".to_string(),
            primer_scheme: "auto".to_string(),
            input: ReadInput::Single(format!("{name}.fastq.gz").into()),
            passthrough: Vec::new(),
        });
        sample.checksums = Some(Checksums::Single(checksum.to_string()));
        sample
    }

    fn response(pairs: &[(&str, &str)]) -> GuidResponse {
        GuidResponse {
            batch: GuidResponseBatch {
                guid: "batch".to_string(),
                samples: pairs
                    .iter()
                    .map(|(hash, guid)| HashGuid {
                        hash: hash.to_string(),
                        guid: guid.to_string(),
                    })
                    .collect(),
            },
        }
    }

    #[test]
    fn md5_of_known_content() {
        let temp = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(temp.path().join("reads.fastq")).unwrap();
        std::fs::write(&path, b"hello world").unwrap();
        assert_eq!(md5_file(&path).unwrap(), "5eb63bbbe01eeed093cb22bb8f5acdc3");
    }

    #[test]
    fn shared_checksums_get_distinct_identifiers() {
        let mut samples = vec![
            sample("a", "h1"),
            sample("b", "h1"),
            sample("c", "h2"),
            sample("d", "h1"),
        ];
        let response = response(&[("h1", "g1"), ("h2", "g2"), ("h1", "g3"), ("h1", "g4")]);
        assign_guids(&mut samples, &response).unwrap();

        let guids = samples
            .iter()
            .map(|sample| sample.guid().unwrap().to_string())
            .collect::<Vec<_>>();
        assert_eq!(guids, vec!["g1", "g3", "g2", "g4"]);
        assert_eq!(guids.iter().collect::<HashSet<_>>().len(), 4);
    }

    #[test]
    fn too_few_identifiers_is_fatal() {
        let mut samples = vec![sample("a", "h1"), sample("b", "h1")];
        let response = response(&[("h1", "g1")]);
        let err = assign_guids(&mut samples, &response).unwrap_err();
        assert_matches!(err, UploaderError::Reconciliation { sample, .. } if sample == "b");
    }

    #[test]
    fn surplus_identifiers_are_rejected() {
        let mut samples = vec![sample("a", "h1")];
        let response = response(&[("h1", "g1"), ("h9", "g9")]);
        let err = assign_guids(&mut samples, &response).unwrap_err();
        assert_matches!(err, UploaderError::Protocol(_));
    }

    #[test]
    fn keys_follow_sample_order() {
        let samples = vec![sample("a", "h2"), sample("b", "h1")];
        assert_eq!(checksum_keys(&samples).unwrap(), vec!["h2", "h1"]);
    }
}
