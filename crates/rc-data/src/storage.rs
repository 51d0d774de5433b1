use std::collections::BTreeMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arrow::array::{Array, ArrayRef, BooleanArray, Float64Array};
use arrow::record_batch::RecordBatch;
use arrow::datatypes::{DataType, Field, Schema};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;
use rc_types::TelemetryError;

use crate::series::{Column, TelemetrySeries, SCLK};

/// Parquet cache for parsed telemetry, one file per named series.
#[derive(Debug)]
pub struct SeriesStore {
    pub data_root: PathBuf,
}

impl SeriesStore {
    pub fn new<P: AsRef<Path>>(data_root: P) -> Result<Self, TelemetryError> {
        let data_root = data_root.as_ref().to_path_buf();
        std::fs::create_dir_all(&data_root)
            .map_err(|e| TelemetryError::io(data_root.display().to_string(), e))?;

        Ok(Self { data_root })
    }

    /// Storage path for a named series
    pub fn path_for(&self, name: &str) -> PathBuf {
        self.data_root.join(format!("{name}.parquet"))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.path_for(name).is_file()
    }

    /// Save a series to Parquet
    pub fn save(&self, name: &str, series: &TelemetrySeries) -> Result<PathBuf, TelemetryError> {
        let path = self.path_for(name);
        let batch = series_to_record_batch(series)?;

        // Written aside and renamed so concurrent readers never see a partial file.
        let staging = self.data_root.join(format!("{name}.parquet.{}.tmp", std::process::id()));
        let file = File::create(&staging).map_err(|e| TelemetryError::io(staging.display().to_string(), e))?;
        let props = WriterProperties::builder()
            .set_compression(Compression::SNAPPY)
            .build();
        let mut writer = ArrowWriter::try_new(file, batch.schema(), Some(props)).map_err(columnar)?;
        writer.write(&batch).map_err(columnar)?;
        writer.close().map_err(columnar)?;
        std::fs::rename(&staging, &path).map_err(|e| TelemetryError::io(path.display().to_string(), e))?;

        tracing::info!("Stored {} rows of {} in {}", series.len(), name, path.display());
        Ok(path)
    }

    /// Load a series from Parquet
    pub fn load(&self, name: &str) -> Result<TelemetrySeries, TelemetryError> {
        let path = self.path_for(name);
        let file = File::open(&path).map_err(|e| TelemetryError::io(path.display().to_string(), e))?;
        let reader = ParquetRecordBatchReaderBuilder::try_new(file)
            .map_err(columnar)?
            .build()
            .map_err(columnar)?;

        let mut index = Vec::new();
        let mut channels: BTreeMap<String, Column> = BTreeMap::new();
        for batch in reader {
            let batch = batch.map_err(columnar)?;
            append_record_batch(&batch, &mut index, &mut channels)?;
        }

        tracing::debug!("Loaded {} rows of {} from {}", index.len(), name, path.display());
        TelemetrySeries::from_columns(index, channels)
    }

    /// Names of every stored series
    pub fn list(&self) -> Result<Vec<String>, TelemetryError> {
        let entries = std::fs::read_dir(&self.data_root)
            .map_err(|e| TelemetryError::io(self.data_root.display().to_string(), e))?;

        let mut names = Vec::new();
        for entry in entries {
            let path = entry
                .map_err(|e| TelemetryError::io(self.data_root.display().to_string(), e))?
                .path();
            if path.extension().and_then(|s| s.to_str()) != Some("parquet") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                names.push(stem.to_string());
            }
        }
        names.sort();
        Ok(names)
    }
}

fn columnar<E: std::fmt::Display>(e: E) -> TelemetryError {
    TelemetryError::Columnar {
        message: e.to_string(),
    }
}

fn series_to_record_batch(series: &TelemetrySeries) -> Result<RecordBatch, TelemetryError> {
    let mut fields = vec![Field::new(SCLK, DataType::Float64, false)];
    let mut arrays: Vec<ArrayRef> = vec![Arc::new(Float64Array::from(series.index().to_vec()))];

    for (name, column) in series.channels() {
        match column {
            Column::Numeric(values) => {
                fields.push(Field::new(name, DataType::Float64, true));
                arrays.push(Arc::new(Float64Array::from(values.clone())));
            }
            Column::Flag(values) => {
                fields.push(Field::new(name, DataType::Boolean, true));
                arrays.push(Arc::new(BooleanArray::from(values.clone())));
            }
        }
    }

    RecordBatch::try_new(Arc::new(Schema::new(fields)), arrays).map_err(columnar)
}

fn append_record_batch(
    batch: &RecordBatch,
    index: &mut Vec<f64>,
    channels: &mut BTreeMap<String, Column>,
) -> Result<(), TelemetryError> {
    let schema = batch.schema();
    for (field, array) in schema.fields().iter().zip(batch.columns()) {
        let name = field.name();
        match field.data_type() {
            DataType::Float64 => {
                let values = array
                    .as_any()
                    .downcast_ref::<Float64Array>()
                    .ok_or_else(|| columnar(format!("Invalid Float64 column {name}")))?;
                if name == SCLK {
                    if values.null_count() > 0 {
                        return Err(columnar("SCLK column contains nulls"));
                    }
                    index.extend(values.values().iter().copied());
                    continue;
                }
                match channels
                    .entry(name.clone())
                    .or_insert_with(|| Column::Numeric(Vec::new()))
                {
                    Column::Numeric(column) => column.extend(values.iter()),
                    Column::Flag(_) => return Err(TelemetryError::MixedChannel { channel: name.clone() }),
                }
            }
            DataType::Boolean => {
                let values = array
                    .as_any()
                    .downcast_ref::<BooleanArray>()
                    .ok_or_else(|| columnar(format!("Invalid Boolean column {name}")))?;
                match channels
                    .entry(name.clone())
                    .or_insert_with(|| Column::Flag(Vec::new()))
                {
                    Column::Flag(column) => column.extend(values.iter()),
                    Column::Numeric(_) => return Err(TelemetryError::MixedChannel { channel: name.clone() }),
                }
            }
            other => return Err(columnar(format!("Unsupported column type {other} for {name}"))),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample() -> TelemetrySeries {
        let mut channels = BTreeMap::new();
        channels.insert(
            "ROVER_X [METERS]".to_string(),
            Column::Numeric(vec![Some(0.5), None, Some(2.5)]),
        );
        channels.insert(
            "STRAIGHT_STEERING".to_string(),
            Column::Flag(vec![Some(true), Some(false), None]),
        );
        TelemetrySeries::from_columns(vec![100.0, 100.5, 101.0], channels).unwrap()
    }

    #[test]
    fn test_storage_roundtrip() {
        let temp_dir = tempdir().unwrap();
        let store = SeriesStore::new(temp_dir.path()).unwrap();
        let series = sample();

        let path = store.save("sol01578", &series).unwrap();
        assert!(path.ends_with("sol01578.parquet"));
        assert!(store.contains("sol01578"));

        let loaded = store.load("sol01578").unwrap();
        assert_eq!(loaded, series);
        assert_eq!(store.list().unwrap(), vec!["sol01578".to_string()]);
    }

    #[test]
    fn test_missing_series() {
        let temp_dir = tempdir().unwrap();
        let store = SeriesStore::new(temp_dir.path()).unwrap();
        assert!(matches!(store.load("absent"), Err(TelemetryError::Io { .. })));
        assert!(store.list().unwrap().is_empty());
    }
}
