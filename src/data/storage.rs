//! Array file stores with clean feature flag handling.
//!
//! The dark cache and the "save" export are both plain typed-array files: a
//! small string metadata map plus one or more rows of `f64`. A missing file
//! is reported as `Ok(None)`, never as an error.
use crate::error::{AppResult, DaqError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

/// Rows of floating-point values with string metadata.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ArrayFile {
    /// Free-form metadata (cache key, exposure, timestamp, ...).
    pub metadata: BTreeMap<String, String>,
    /// Array rows. A dark cache has one row; an export has two.
    pub rows: Vec<Vec<f64>>,
}

impl ArrayFile {
    /// File holding the given rows and no metadata.
    pub fn new(rows: Vec<Vec<f64>>) -> Self {
        Self {
            metadata: BTreeMap::new(),
            rows,
        }
    }

    /// Adds a metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.metadata.insert(key.into(), value.to_string());
        self
    }
}

/// Load/save of array files by path.
pub trait ArrayStore: Send + Sync {
    /// Reads `path`. Absence is `Ok(None)`.
    fn load(&self, path: &Path) -> AppResult<Option<ArrayFile>>;

    /// Writes `file` to `path`, replacing any previous content.
    fn save(&self, path: &Path, file: &ArrayFile) -> AppResult<()>;
}

/// On-disk format for array files.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageFormat {
    /// Compact binary encoding.
    #[default]
    Bincode,
    /// Human-readable CSV with a JSON metadata header.
    Csv,
}

/// Builds the store for the configured format.
pub fn store_for(format: StorageFormat) -> Arc<dyn ArrayStore> {
    match format {
        StorageFormat::Bincode => Arc::new(BincodeArrayStore),
        StorageFormat::Csv => Arc::new(CsvArrayStore::new()),
    }
}

fn ensure_parent(path: &Path) -> AppResult<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

// ============================================================================
// Bincode Store
// ============================================================================

/// Stores array files with `bincode`.
#[derive(Clone, Copy, Debug, Default)]
pub struct BincodeArrayStore;

impl ArrayStore for BincodeArrayStore {
    fn load(&self, path: &Path) -> AppResult<Option<ArrayFile>> {
        let bytes = match std::fs::read(path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        Ok(Some(bincode::deserialize(&bytes)?))
    }

    fn save(&self, path: &Path, file: &ArrayFile) -> AppResult<()> {
        ensure_parent(path)?;
        let bytes = bincode::serialize(file)?;
        std::fs::write(path, bytes)?;
        tracing::debug!(path = %path.display(), rows = file.rows.len(), "Array file written");
        Ok(())
    }
}

// ============================================================================
// CSV Store
// ============================================================================

#[cfg(feature = "storage_csv")]
mod csv_enabled {
    use super::*;
    use std::fs::File;
    use std::io::Write;

    /// Stores array files as CSV, one record per row.
    #[derive(Clone, Copy, Debug, Default)]
    pub struct CsvArrayStore;

    impl CsvArrayStore {
        /// Creates the store.
        pub fn new() -> Self {
            Self
        }
    }

    impl ArrayStore for CsvArrayStore {
        fn load(&self, path: &Path) -> AppResult<Option<ArrayFile>> {
            let content = match std::fs::read_to_string(path) {
                Ok(content) => content,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
                Err(err) => return Err(err.into()),
            };

            let header: String = content
                .lines()
                .filter_map(|line| line.strip_prefix("# "))
                .collect::<Vec<_>>()
                .join("\n");
            let metadata = if header.is_empty() {
                BTreeMap::new()
            } else {
                serde_json::from_str(&header)
                    .map_err(|e| DaqError::Storage(format!("invalid CSV metadata: {e}")))?
            };

            let mut reader = csv::ReaderBuilder::new()
                .has_headers(false)
                .comment(Some(b'#'))
                .flexible(true)
                .from_reader(content.as_bytes());
            let mut rows = Vec::new();
            for record in reader.records() {
                let record =
                    record.map_err(|e| DaqError::Storage(format!("invalid CSV record: {e}")))?;
                let row = record
                    .iter()
                    .map(|field| field.trim().parse::<f64>())
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(|e| DaqError::Storage(format!("invalid CSV value: {e}")))?;
                rows.push(row);
            }

            Ok(Some(ArrayFile { metadata, rows }))
        }

        fn save(&self, path: &Path, file: &ArrayFile) -> AppResult<()> {
            ensure_parent(path)?;
            let mut out = File::create(path)?;

            if !file.metadata.is_empty() {
                let json_string = serde_json::to_string_pretty(&file.metadata)
                    .map_err(|e| DaqError::Storage(format!("metadata serialization: {e}")))?;
                for line in json_string.lines() {
                    writeln!(out, "# {line}")?;
                }
            }

            let mut writer = csv::WriterBuilder::new()
                .has_headers(false)
                .flexible(true)
                .from_writer(out);
            for row in &file.rows {
                writer
                    .write_record(row.iter().map(|v| v.to_string()))
                    .map_err(|e| DaqError::Storage(format!("CSV write failed: {e}")))?;
            }
            writer.flush()?;
            tracing::debug!(path = %path.display(), rows = file.rows.len(), "CSV array file written");
            Ok(())
        }
    }
}

#[cfg(not(feature = "storage_csv"))]
mod csv_disabled {
    use super::*;

    /// Placeholder when the `storage_csv` feature is off.
    #[derive(Clone, Copy, Debug, Default)]
    pub struct CsvArrayStore;

    impl CsvArrayStore {
        /// Creates the store.
        pub fn new() -> Self {
            Self
        }
    }

    impl ArrayStore for CsvArrayStore {
        fn load(&self, _path: &Path) -> AppResult<Option<ArrayFile>> {
            Err(DaqError::FeatureNotEnabled("storage_csv".to_string()))
        }

        fn save(&self, _path: &Path, _file: &ArrayFile) -> AppResult<()> {
            Err(DaqError::FeatureNotEnabled("storage_csv".to_string()))
        }
    }
}

#[cfg(feature = "storage_csv")]
pub use csv_enabled::CsvArrayStore;

#[cfg(not(feature = "storage_csv"))]
pub use csv_disabled::CsvArrayStore;

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ArrayFile {
        ArrayFile::new(vec![vec![400.0, 500.5, 600.0], vec![-1.25, 0.0, 3.5]])
            .with_metadata("device_id", "mock")
            .with_metadata("exposure_s", 0.5)
    }

    #[test]
    fn test_bincode_missing_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let loaded = BincodeArrayStore.load(&dir.path().join("absent.bin")).unwrap();
        assert!(loaded.is_none());
    }

    #[test]
    fn test_bincode_save_creates_parent_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/dark.bin");
        BincodeArrayStore.save(&path, &sample()).unwrap();
        assert_eq!(BincodeArrayStore.load(&path).unwrap(), Some(sample()));
    }

    #[test]
    fn test_bincode_garbage_is_storage_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("garbage.bin");
        std::fs::write(&path, b"\xff").unwrap();
        assert!(matches!(
            BincodeArrayStore.load(&path),
            Err(DaqError::Storage(_))
        ));
    }

    #[cfg(feature = "storage_csv")]
    #[test]
    fn test_csv_writes_metadata_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.csv");
        CsvArrayStore::new().save(&path, &sample()).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("# {"));
        assert!(text.contains("\"device_id\": \"mock\""));

        let loaded = CsvArrayStore::new().load(&path).unwrap().unwrap();
        assert_eq!(loaded, sample());
    }

    #[cfg(not(feature = "storage_csv"))]
    #[test]
    fn test_csv_disabled_reports_feature() {
        let err = CsvArrayStore::new()
            .load(Path::new("data.csv"))
            .unwrap_err();
        assert!(matches!(err, DaqError::FeatureNotEnabled(_)));
    }
}
