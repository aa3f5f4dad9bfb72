use std::collections::HashMap;

use camino::{Utf8Path, Utf8PathBuf};
use tracing::{debug, info};

use crate::config;
use crate::domain::{CleanReads, DecontaminationStats, ReadInput, Sample, SchemaKind};
use crate::error::UploaderError;
use crate::executor::{collect_all, run_bounded};
use crate::progress::{ProgressEvent, ProgressSink, Status};
use crate::runner::{CommandRunner, ShellTask, TaskOutput, run_task};

pub const BAM_CONVERSION: &str = "bam_conversion";
pub const DECONTAMINATION: &str = "decontamination";

/// Executables and reference used to clean reads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Toolchain {
    pub samtools: String,
    pub read_it_and_keep: String,
    pub reference: Utf8PathBuf,
}

impl Toolchain {
    pub fn discover(organism: &str, alignment: bool) -> Result<Self, UploaderError> {
        let samtools = if alignment {
            path_string(config::binary_path("samtools")?)?
        } else {
            "samtools".to_string()
        };
        Ok(Self {
            samtools,
            read_it_and_keep: path_string(config::binary_path("readItAndKeep")?)?,
            reference: Utf8PathBuf::from_path_buf(config::reference_path(organism)?)
                .map_err(|_| UploaderError::Filesystem("non-utf8 reference path".to_string()))?,
        })
    }
}

fn path_string(path: std::path::PathBuf) -> Result<String, UploaderError> {
    path.into_os_string()
        .into_string()
        .map_err(|_| UploaderError::Filesystem("non-utf8 tool path".to_string()))
}

fn quote(value: &str) -> String {
    if value
        .chars()
        .all(|ch| ch.is_ascii_alphanumeric() || "-_./:+=".contains(ch))
    {
        return value.to_string();
    }
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Conversion command for an alignment input, and the reads it will produce.
pub fn conversion_task(
    sample: &Sample,
    schema: SchemaKind,
    working_dir: &Utf8Path,
    tools: &Toolchain,
) -> Result<(ShellTask, ReadInput), UploaderError> {
    let ReadInput::Alignment(bam) = &sample.reads else {
        return Err(UploaderError::Invariant(format!(
            "sample {} has no alignment to convert",
            sample.name()
        )));
    };
    let name = sample.name();
    let samtools = quote(&tools.samtools);
    let (command, reads) = if schema.is_paired() {
        let fastq1 = working_dir.join(format!("{name}_1.fastq.gz"));
        let fastq2 = working_dir.join(format!("{name}_2.fastq.gz"));
        let command = format!(
            "{samtools} sort {} | {samtools} fastq -N -1 {} -2 {}",
            quote(bam.as_str()),
            quote(fastq1.as_str()),
            quote(fastq2.as_str())
        );
        (command, ReadInput::Paired(fastq1, fastq2))
    } else {
        let fastq = working_dir.join(format!("{name}.fastq.gz"));
        let command = format!(
            "{samtools} fastq -0 {} {}",
            quote(fastq.as_str()),
            quote(bam.as_str())
        );
        (command, ReadInput::Single(fastq))
    };
    Ok((
        ShellTask {
            label: name.to_string(),
            action: BAM_CONVERSION.to_string(),
            command,
        },
        reads,
    ))
}

/// readItAndKeep invocation: `ont` for unpaired reads, `illumina` for pairs.
pub fn decontamination_task(
    sample: &Sample,
    working_dir: &Utf8Path,
    tools: &Toolchain,
) -> Result<(ShellTask, CleanReads), UploaderError> {
    let name = sample.name();
    let prefix = working_dir.join(name);
    let base = format!(
        "{} --enumerate_names --ref_fasta {}",
        quote(&tools.read_it_and_keep),
        quote(tools.reference.as_str())
    );
    let (command, clean) = match &sample.reads {
        ReadInput::Single(fastq) => (
            format!(
                "{base} --tech ont --reads1 {} --outprefix {}",
                quote(fastq.as_str()),
                quote(prefix.as_str())
            ),
            CleanReads::Single(working_dir.join(format!("{name}.reads.fastq.gz"))),
        ),
        ReadInput::Paired(fastq1, fastq2) => (
            format!(
                "{base} --tech illumina --reads1 {} --reads2 {} --outprefix {}",
                quote(fastq1.as_str()),
                quote(fastq2.as_str()),
                quote(prefix.as_str())
            ),
            CleanReads::Paired(
                working_dir.join(format!("{name}.reads_1.fastq.gz")),
                working_dir.join(format!("{name}.reads_2.fastq.gz")),
            ),
        ),
        ReadInput::Alignment(_) => {
            return Err(UploaderError::Invariant(format!(
                "sample {name} must be converted before decontamination"
            )));
        }
    };
    Ok((
        ShellTask {
            label: name.to_string(),
            action: DECONTAMINATION.to_string(),
            command,
        },
        clean,
    ))
}

/// Parses readItAndKeep's four counters (input 1, input 2, kept 1, kept 2).
pub fn parse_decontamination_stats(stdout: &str) -> Result<DecontaminationStats, UploaderError> {
    let counts = stdout
        .trim()
        .lines()
        .map(|line| {
            let field = line.rsplit('\t').next().unwrap_or(line).trim();
            field.parse::<u64>().map_err(|_| {
                UploaderError::Protocol(format!("unparseable decontamination counter: {line:?}"))
            })
        })
        .collect::<Result<Vec<_>, _>>()?;
    let &[input1, input2, kept1, kept2] = counts.as_slice() else {
        return Err(UploaderError::Protocol(format!(
            "expected 4 decontamination counters, found {}",
            counts.len()
        )));
    };
    let count_in = input1 + input2;
    let count_out = kept1 + kept2;
    if count_out > count_in {
        return Err(UploaderError::Invariant(format!(
            "decontamination kept {count_out} of {count_in} reads"
        )));
    }
    let fraction = if count_in == 0 {
        0.0
    } else {
        let raw = (count_in - count_out) as f64 / count_in as f64;
        (raw * 10_000.0).round() / 10_000.0
    };
    Ok(DecontaminationStats {
        count_in,
        count_out,
        fraction,
    })
}

pub struct Decontaminator<'a> {
    pub runner: &'a dyn CommandRunner,
    pub tools: &'a Toolchain,
    pub working_dir: &'a Utf8Path,
    pub workers: usize,
    pub sink: &'a dyn ProgressSink,
}

impl Decontaminator<'_> {
    /// Converts alignments if needed, then cleans every sample's reads.
    pub async fn run(
        &self,
        samples: &mut [Sample],
        schema: SchemaKind,
    ) -> Result<(), UploaderError> {
        if schema.is_alignment() {
            let mut targets = HashMap::new();
            let mut tasks = Vec::new();
            for sample in samples.iter() {
                let (task, reads) = conversion_task(sample, schema, self.working_dir, self.tools)?;
                targets.insert(task.label.clone(), reads);
                tasks.push(task);
            }
            self.run_stage(BAM_CONVERSION, "Converting", &tasks).await?;
            for sample in samples.iter_mut() {
                if let Some(reads) = targets.remove(sample.name()) {
                    sample.reads = reads;
                }
            }
        }

        let mut targets = HashMap::new();
        let mut tasks = Vec::new();
        for sample in samples.iter() {
            let (task, clean) = decontamination_task(sample, self.working_dir, self.tools)?;
            targets.insert(task.label.clone(), clean);
            tasks.push(task);
        }
        let outputs = self.run_stage(DECONTAMINATION, "Decontaminating", &tasks).await?;
        for sample in samples.iter_mut() {
            let output = outputs.get(sample.name()).ok_or_else(|| {
                UploaderError::Invariant(format!("no decontamination result for {}", sample.name()))
            })?;
            let stats = parse_decontamination_stats(&output.stdout)?;
            debug!(sample = sample.name(), ?stats, "decontaminated");
            sample.stats = Some(stats);
            sample.clean = targets.remove(sample.name());
        }
        Ok(())
    }

    async fn run_stage(
        &self,
        action: &str,
        participle: &str,
        tasks: &[ShellTask],
    ) -> Result<HashMap<String, TaskOutput>, UploaderError> {
        self.sink.event(ProgressEvent::stage(action, Status::Started));
        info!("{participle} {} sample(s) with {} worker(s)", tasks.len(), self.workers);
        let order = tasks.iter().map(|task| task.label.clone()).collect::<Vec<_>>();
        let futures = tasks
            .iter()
            .map(|task| (task.label.clone(), run_task(self.runner, task, self.sink)))
            .collect();
        let outputs = collect_all(&order, run_bounded(self.workers, futures).await)?;
        self.sink.event(ProgressEvent::stage(action, Status::Finished));
        info!("Finished {} {} sample(s)", participle.to_lowercase(), tasks.len());
        Ok(outputs)
    }
}
