//! Storage helpers for the local store: YAML metadata, JSON lines, plain
//! logs, and a Parquet file of scalar metrics.

use std::fs;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use arrow::array::{Array, ArrayRef, Float64Array, Int64Array, StringArray, TimestampMicrosecondArray};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef, TimeUnit};
use arrow::error::ArrowError;
use arrow::record_batch::RecordBatch;
use chrono::{DateTime, Utc};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::arrow_writer::ArrowWriter;
use parquet::file::properties::WriterProperties;
use serde::{Deserialize, Serialize};

use crate::data::LineValue;
use crate::error::Result;
use crate::models::{LogLine, RunState};
use crate::record::ScalarRecord;

// ─── Directory helpers ────────────────────────────────────────────────────────

pub fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path)?;
    Ok(())
}

// ─── YAML I/O ─────────────────────────────────────────────────────────────────

pub fn save_yaml<T: Serialize>(path: &Path, data: &T) -> Result<()> {
    let content = serde_yaml::to_string(data)?;
    fs::write(path, content)?;
    Ok(())
}

pub fn load_yaml<T>(path: &Path) -> Result<T>
where
    T: serde::de::DeserializeOwned + Default,
{
    if !path.exists() {
        return Ok(T::default());
    }
    let content = fs::read_to_string(path)?;
    Ok(serde_yaml::from_str(&content)?)
}

/// Metadata stored alongside a run in `run.yaml`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunMetadata {
    pub id: String,
    pub project: String,
    pub experiment_name: String,
    pub status: RunState,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_secs: Option<f64>,
    pub description: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl Default for RunMetadata {
    fn default() -> Self {
        Self {
            id: String::new(),
            project: String::new(),
            experiment_name: String::new(),
            status: RunState::NotStarted,
            started_at: Utc::now(),
            finished_at: None,
            duration_secs: None,
            description: None,
            tags: Vec::new(),
        }
    }
}

pub fn save_run_metadata(run_dir: &Path, meta: &RunMetadata) -> Result<()> {
    save_yaml(&run_dir.join("run.yaml"), meta)
}

pub fn load_run_metadata(run_dir: &Path) -> Result<RunMetadata> {
    load_yaml(&run_dir.join("run.yaml"))
}

// ─── Line-oriented files ──────────────────────────────────────────────────────

/// Append one JSON document per item.
pub fn append_jsonl<T: Serialize>(path: &Path, items: &[T]) -> Result<()> {
    if items.is_empty() {
        return Ok(());
    }
    let mut f = fs::OpenOptions::new().create(true).append(true).open(path)?;
    for item in items {
        let line = serde_json::to_string(item)?;
        writeln!(f, "{line}")?;
    }
    Ok(())
}

/// Append console lines as `[timestamp] [LEVEL] message`.
pub fn append_log_lines(path: &Path, lines: &[LogLine]) -> Result<()> {
    if lines.is_empty() {
        return Ok(());
    }
    let mut f = fs::OpenOptions::new().create(true).append(true).open(path)?;
    for line in lines {
        let ts = line.created_at.format("%Y-%m-%dT%H:%M:%S%.3fZ");
        writeln!(f, "[{ts}] [{}] {}", line.level, line.message)?;
    }
    Ok(())
}

// ─── Parquet scalar metrics ───────────────────────────────────────────────────

fn scalar_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new("key", DataType::Utf8, false),
        Field::new("step", DataType::Int64, false),
        Field::new("epoch", DataType::Int64, false),
        Field::new("value", DataType::Float64, true),
        Field::new("sentinel", DataType::Utf8, true),
        Field::new(
            "timestamp",
            DataType::Timestamp(TimeUnit::Microsecond, Some("UTC".into())),
            false,
        ),
    ]))
}

/// Append scalar records to a Parquet file.
/// Strategy: read existing → concat → write back. Called once per delivered
/// batch, so the rewrite cost is amortized over the batch.
pub fn append_scalars(path: &Path, records: &[ScalarRecord]) -> Result<()> {
    if records.is_empty() {
        return Ok(());
    }
    let new_batch = scalars_to_record_batch(records)?;
    let final_batch = if path.exists() {
        let existing = read_parquet(path)?;
        arrow::compute::concat_batches(&scalar_schema(), &[existing, new_batch])?
    } else {
        new_batch
    };
    write_parquet(path, &final_batch)
}

/// Read every scalar record back, in file order.
pub fn read_scalars(path: &Path) -> Result<Vec<ScalarRecord>> {
    if !path.exists() {
        return Ok(vec![]);
    }
    let batch = read_parquet(path)?;
    record_batch_to_scalars(&batch)
}

fn read_parquet(path: &Path) -> Result<RecordBatch> {
    let file = fs::File::open(path)?;
    let builder = ParquetRecordBatchReaderBuilder::try_new(file)?;
    let reader = builder.build()?;
    let mut batches = vec![];
    for batch in reader {
        batches.push(batch?);
    }
    match batches.len() {
        0 => Ok(RecordBatch::new_empty(scalar_schema())),
        1 => Ok(batches.remove(0)),
        _ => Ok(arrow::compute::concat_batches(&scalar_schema(), &batches)?),
    }
}

fn write_parquet(path: &Path, batch: &RecordBatch) -> Result<()> {
    let file = fs::File::create(path)?;
    let props = WriterProperties::builder()
        .set_compression(parquet::basic::Compression::SNAPPY)
        .build();
    let mut writer = ArrowWriter::try_new(file, batch.schema(), Some(props))?;
    writer.write(batch)?;
    writer.close()?;
    Ok(())
}

fn scalars_to_record_batch(records: &[ScalarRecord]) -> Result<RecordBatch> {
    let keys: Vec<&str> = records.iter().map(|r| r.key.as_str()).collect();
    let steps: Vec<i64> = records.iter().map(|r| r.step as i64).collect();
    let epochs: Vec<i64> = records.iter().map(|r| r.epoch as i64).collect();
    let values: Vec<Option<f64>> = records.iter().map(|r| r.value.finite()).collect();
    let sentinels: Vec<Option<&str>> = records.iter().map(|r| r.value.sentinel()).collect();
    let timestamps: Vec<i64> = records.iter().map(|r| r.created_at.timestamp_micros()).collect();

    let arrays: Vec<ArrayRef> = vec![
        Arc::new(StringArray::from(keys)),
        Arc::new(Int64Array::from(steps)),
        Arc::new(Int64Array::from(epochs)),
        Arc::new(Float64Array::from(values)),
        Arc::new(StringArray::from(sentinels)),
        Arc::new(TimestampMicrosecondArray::from(timestamps).with_timezone("UTC")),
    ];
    Ok(RecordBatch::try_new(scalar_schema(), arrays)?)
}

fn column<'a, T: 'static>(batch: &'a RecordBatch, name: &str) -> Result<&'a T> {
    let array = batch
        .column_by_name(name)
        .ok_or_else(|| ArrowError::SchemaError(format!("missing column `{name}`")))?;
    Ok(array
        .as_any()
        .downcast_ref::<T>()
        .ok_or_else(|| ArrowError::SchemaError(format!("unexpected type for column `{name}`")))?)
}

fn record_batch_to_scalars(batch: &RecordBatch) -> Result<Vec<ScalarRecord>> {
    let keys = column::<StringArray>(batch, "key")?;
    let steps = column::<Int64Array>(batch, "step")?;
    let epochs = column::<Int64Array>(batch, "epoch")?;
    let values = column::<Float64Array>(batch, "value")?;
    let sentinels = column::<StringArray>(batch, "sentinel")?;
    let timestamps = column::<TimestampMicrosecondArray>(batch, "timestamp")?;

    let mut out = Vec::with_capacity(batch.num_rows());
    for row in 0..batch.num_rows() {
        let value = if values.is_null(row) {
            if sentinels.is_null(row) {
                LineValue::NaN
            } else {
                LineValue::from_sentinel(sentinels.value(row)).unwrap_or(LineValue::NaN)
            }
        } else {
            LineValue::Number(values.value(row))
        };
        out.push(ScalarRecord {
            key: keys.value(row).to_string(),
            step: steps.value(row) as u64,
            epoch: epochs.value(row) as u64,
            value,
            created_at: DateTime::<Utc>::from_timestamp_micros(timestamps.value(row))
                .unwrap_or_default(),
        });
    }
    Ok(out)
}
