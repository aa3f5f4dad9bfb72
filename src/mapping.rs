use std::collections::HashMap;
use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use tracing::info;

use crate::domain::Sample;
use crate::error::UploaderError;

pub const MAPPING_COLUMNS: [&str; 6] = [
    "local_batch",
    "local_run_number",
    "local_sample_name",
    "gpas_batch",
    "gpas_run_number",
    "gpas_sample_name",
];

pub fn mapping_path(out_dir: &Utf8Path, batch_guid: &str) -> Utf8PathBuf {
    out_dir.join(format!("{batch_guid}.mapping.csv"))
}

/// Writes `{batch_guid}.mapping.csv`: fixed columns first, then any
/// passthrough columns in the order they appear in the upload CSV.
pub fn write_mapping(
    out_dir: &Utf8Path,
    batch_guid: &str,
    samples: &[Sample],
) -> Result<Utf8PathBuf, UploaderError> {
    fs::create_dir_all(out_dir)
        .map_err(|err| UploaderError::Filesystem(format!("create {out_dir}: {err}")))?;
    let path = mapping_path(out_dir, batch_guid);

    let mut extra = Vec::new();
    for (column, _) in samples.iter().flat_map(|sample| &sample.record.passthrough) {
        if !extra.contains(column) {
            extra.push(column.clone());
        }
    }

    let mut writer = csv::Writer::from_path(&path)?;
    let mut header = MAPPING_COLUMNS
        .iter()
        .map(|column| column.to_string())
        .collect::<Vec<_>>();
    header.extend(extra.iter().cloned());
    writer.write_record(&header)?;

    for sample in samples {
        let guid = sample.guid().ok_or_else(|| {
            UploaderError::Invariant(format!("sample {} has no identifier", sample.name()))
        })?;
        let record = &sample.record;
        let mut row = vec![
            record.batch.clone(),
            record.run_number.clone(),
            record.sample_name.clone(),
            batch_guid.to_string(),
            sample.gpas_run_number.clone(),
            guid.to_string(),
        ];
        row.extend(extra.iter().map(|column| {
            record
                .passthrough
                .iter()
                .find(|(name, _)| name == column)
                .map(|(_, value)| value.clone())
                .unwrap_or_default()
        }));
        writer.write_record(&row)?;
    }
    writer.flush()?;
    info!("Saved mapping CSV to {path}");
    Ok(path)
}

/// Reads a mapping CSV into `gpas_sample_name -> local_sample_name`.
pub fn read_mapping(path: &Utf8Path) -> Result<HashMap<String, String>, UploaderError> {
    if !path.as_std_path().is_file() {
        return Err(UploaderError::Filesystem(format!("mapping CSV not found: {path}")));
    }
    let mut reader = csv::Reader::from_path(path)?;
    let headers = reader.headers()?.clone();
    let missing = MAPPING_COLUMNS
        .iter()
        .filter(|column| !headers.iter().any(|header| header == **column))
        .copied()
        .collect::<Vec<_>>();
    if !missing.is_empty() {
        return Err(UploaderError::Csv(format!(
            "mapping CSV is missing column(s): {}",
            missing.join(", ")
        )));
    }
    let position = |name: &str| headers.iter().position(|header| header == name);
    let (Some(local_index), Some(guid_index)) =
        (position("local_sample_name"), position("gpas_sample_name"))
    else {
        return Err(UploaderError::Csv("mapping CSV header is malformed".to_string()));
    };

    let mut names = HashMap::new();
    for row in reader.records() {
        let row = row?;
        let (Some(local_name), Some(guid)) = (row.get(local_index), row.get(guid_index)) else {
            continue;
        };
        if !guid.is_empty() {
            names.insert(guid.to_string(), local_name.to_string());
        }
    }
    Ok(names)
}
