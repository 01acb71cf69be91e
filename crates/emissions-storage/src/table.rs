//! `item_details_emissions` as an append-only directory of parquet part files.
//!
//! Each successful append writes exactly one part file holding every row of one
//! partition. The file is staged under a hidden temp name and renamed into place,
//! so readers never observe a partially written partition.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use arrow_array::{Array, ArrayRef, Date32Array, Float64Array, RecordBatch, StringArray};
use arrow_schema::{ArrowError, DataType, Field, Schema, SchemaRef};
use chrono::{Datelike, NaiveDate};
use emissions_core::{
    ColumnType, EmissionRecord, PartitionKey, UnknownColumn, ITEM_DETAILS_COLUMNS, TABLE_NAME,
};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::{ArrowWriter, ProjectionMask};
use parquet::errors::ParquetError;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::sha256_hex;

/// Days between 0001-01-01 (CE day 1) and the Unix epoch.
const UNIX_EPOCH_DAYS_FROM_CE: i32 = 719_163;

const PART_PREFIX: &str = "part-";
const PART_EXTENSION: &str = "parquet";
const TEMP_SUFFIX: &str = ".tmp";

/// Staged part files older than this belong to an append that never finished.
pub const STALE_TEMP_AGE: Duration = Duration::from_secs(60 * 60);

const REPORT_MONTH: &str = "reportMonth";
const EMISSION_SCOPE: &str = "emissionScope";

#[derive(Debug, Error)]
pub enum TableError {
    #[error("table {} does not exist", .0.display())]
    NotFound(PathBuf),
    #[error("querying {}: {message}", .path.display())]
    Query { path: PathBuf, message: String },
    #[error("part file {} does not carry the item-details schema: {found}", .path.display())]
    SchemaMismatch { path: PathBuf, found: String },
    #[error("row stamped {found} cannot be appended to partition {expected}")]
    PartitionMismatch { expected: String, found: String },
    #[error("refusing to append an empty partition {0}")]
    EmptyAppend(String),
    #[error("io on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Arrow(#[from] ArrowError),
    #[error(transparent)]
    Parquet(#[from] ParquetError),
    #[error(transparent)]
    Column(#[from] UnknownColumn),
}

impl TableError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    fn query(path: &Path, message: impl ToString) -> Self {
        Self::Query {
            path: path.to_path_buf(),
            message: message.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppendedPartition {
    pub key: PartitionKey,
    pub file: PathBuf,
    pub rows: usize,
    pub sha256: String,
}

/// Arrow schema of the table, derived from [`ITEM_DETAILS_COLUMNS`].
pub fn item_details_schema() -> SchemaRef {
    let fields = ITEM_DETAILS_COLUMNS
        .iter()
        .map(|col| {
            let data_type = match col.column_type {
                ColumnType::Utf8 => DataType::Utf8,
                ColumnType::Float64 => DataType::Float64,
                ColumnType::Date => DataType::Date32,
            };
            Field::new(col.name, data_type, true)
        })
        .collect::<Vec<_>>();
    Arc::new(Schema::new(fields))
}

fn date_to_days(date: NaiveDate) -> i32 {
    date.num_days_from_ce() - UNIX_EPOCH_DAYS_FROM_CE
}

fn days_to_date(days: i32) -> Option<NaiveDate> {
    NaiveDate::from_num_days_from_ce_opt(days.checked_add(UNIX_EPOCH_DAYS_FROM_CE)?)
}

pub fn records_to_batch(records: &[EmissionRecord]) -> Result<RecordBatch, ArrowError> {
    let columns = ITEM_DETAILS_COLUMNS
        .iter()
        .map(|col| -> ArrayRef {
            match col.column_type {
                ColumnType::Utf8 => Arc::new(StringArray::from(
                    records.iter().map(|r| r.text(col.name)).collect::<Vec<_>>(),
                )),
                ColumnType::Float64 => Arc::new(Float64Array::from(
                    records.iter().map(|r| r.number(col.name)).collect::<Vec<_>>(),
                )),
                ColumnType::Date => Arc::new(Date32Array::from(
                    records
                        .iter()
                        .map(|r| r.date(col.name).map(date_to_days))
                        .collect::<Vec<_>>(),
                )),
            }
        })
        .collect::<Vec<_>>();
    RecordBatch::try_new(item_details_schema(), columns)
}

fn has_item_details_schema(schema: &Schema) -> bool {
    let expected = item_details_schema();
    schema.fields().len() == expected.fields().len()
        && schema
            .fields()
            .iter()
            .zip(expected.fields().iter())
            .all(|(found, want)| found.name() == want.name() && found.data_type() == want.data_type())
}

fn downcast<'a, T: 'static>(batch: &'a RecordBatch, index: usize, path: &Path) -> Result<&'a T, TableError> {
    batch
        .column(index)
        .as_any()
        .downcast_ref::<T>()
        .ok_or_else(|| TableError::query(path, format!("column {index} has an unexpected array type")))
}

fn batch_to_records(batch: &RecordBatch, path: &Path) -> Result<Vec<EmissionRecord>, TableError> {
    let mut records = vec![EmissionRecord::default(); batch.num_rows()];
    for (index, col) in ITEM_DETAILS_COLUMNS.iter().enumerate() {
        match col.column_type {
            ColumnType::Utf8 => {
                let array = downcast::<StringArray>(batch, index, path)?;
                for (row, record) in records.iter_mut().enumerate() {
                    let value = (!array.is_null(row)).then(|| array.value(row).to_string());
                    record.set_text(col.name, value)?;
                }
            }
            ColumnType::Float64 => {
                let array = downcast::<Float64Array>(batch, index, path)?;
                for (row, record) in records.iter_mut().enumerate() {
                    let value = (!array.is_null(row)).then(|| array.value(row));
                    record.set_number(col.name, value)?;
                }
            }
            ColumnType::Date => {
                let array = downcast::<Date32Array>(batch, index, path)?;
                for (row, record) in records.iter_mut().enumerate() {
                    let value = if array.is_null(row) {
                        None
                    } else {
                        Some(days_to_date(array.value(row)).ok_or_else(|| {
                            TableError::query(path, format!("{} out of range at row {row}", col.name))
                        })?)
                    };
                    record.set_date(col.name, value)?;
                }
            }
        }
    }
    Ok(records)
}

/// Handle on the table directory. Cheap to clone; holds no open files.
#[derive(Debug, Clone)]
pub struct ItemDetailsTable {
    root: PathBuf,
}

impl ItemDetailsTable {
    /// The table lives at `{lakehouse_dir}/item_details_emissions`.
    pub fn open(lakehouse_dir: impl AsRef<Path>) -> Self {
        Self {
            root: lakehouse_dir.as_ref().join(TABLE_NAME),
        }
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    pub fn exists(&self) -> bool {
        self.root.is_dir()
    }

    /// Completed part files, sorted by name. Temp files are invisible.
    pub fn part_files(&self) -> Result<Vec<PathBuf>, TableError> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(TableError::NotFound(self.root.clone()))
            }
            Err(err) => return Err(TableError::query(&self.root, err)),
        };

        let mut files = Vec::new();
        for entry in entries {
            let path = entry.map_err(|err| TableError::query(&self.root, err))?.path();
            let is_part = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with(PART_PREFIX))
                && path.extension().and_then(|e| e.to_str()) == Some(PART_EXTENSION);
            if is_part && path.is_file() {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }

    fn read_part(&self, path: &Path) -> Result<Vec<EmissionRecord>, TableError> {
        let file = File::open(path).map_err(|err| TableError::query(path, err))?;
        let reader = ParquetRecordBatchReaderBuilder::try_new(file)
            .map_err(|err| TableError::query(path, err))?
            .build()
            .map_err(|err| TableError::query(path, err))?;

        let mut records = Vec::new();
        for batch in reader {
            let batch = batch.map_err(|err| TableError::query(path, err))?;
            if !has_item_details_schema(&batch.schema()) {
                return Err(TableError::SchemaMismatch {
                    path: path.to_path_buf(),
                    found: batch.schema().to_string(),
                });
            }
            records.extend(batch_to_records(&batch, path)?);
        }
        Ok(records)
    }

    /// Every row in the table, part file by part file.
    pub fn scan(&self) -> Result<Vec<EmissionRecord>, TableError> {
        let mut records = Vec::new();
        for path in self.part_files()? {
            records.extend(self.read_part(&path)?);
        }
        Ok(records)
    }

    /// Row counts per distinct `(reportMonth, emissionScope)` pair.
    /// Rows with a null month or scope are not counted as any partition.
    pub fn partition_row_counts(&self) -> Result<BTreeMap<(NaiveDate, String), usize>, TableError> {
        let mut counts = BTreeMap::new();
        for path in self.part_files()? {
            read_partition_columns(&path, |month, scope| {
                *counts.entry((month, scope.to_string())).or_default() += 1;
            })?;
        }
        Ok(counts)
    }

    /// `SELECT DISTINCT reportMonth, emissionScope FROM item_details_emissions`.
    pub fn distinct_partitions(&self) -> Result<BTreeSet<(NaiveDate, String)>, TableError> {
        let mut pairs = BTreeSet::new();
        for path in self.part_files()? {
            read_partition_columns(&path, |month, scope| {
                pairs.insert((month, scope.to_string()));
            })?;
        }
        Ok(pairs)
    }

    /// Remove staged part files last modified more than `older_than` ago.
    /// Returns how many were removed. A missing table has nothing to sweep.
    pub fn sweep_stale_temp_files(&self, older_than: Duration) -> Result<usize, TableError> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(err) => return Err(TableError::io(&self.root, err)),
        };
        let staged_prefix = format!(".{PART_PREFIX}");
        let now = SystemTime::now();

        let mut removed = 0;
        for entry in entries {
            let entry = entry.map_err(|err| TableError::io(&self.root, err))?;
            let is_staged = entry
                .file_name()
                .to_str()
                .is_some_and(|n| n.starts_with(&staged_prefix) && n.ends_with(TEMP_SUFFIX));
            if !is_staged {
                continue;
            }
            let path = entry.path();
            let age = entry
                .metadata()
                .and_then(|m| m.modified())
                .map(|modified| now.duration_since(modified).unwrap_or_default())
                .map_err(|err| TableError::io(&path, err))?;
            if age < older_than {
                continue;
            }
            fs::remove_file(&path).map_err(|err| TableError::io(&path, err))?;
            debug!(file = %path.display(), age_secs = age.as_secs(), "removed stale staged part file");
            removed += 1;
        }
        Ok(removed)
    }

    /// Append all rows of one partition as a single part file.
    pub fn append_partition(
        &self,
        key: &PartitionKey,
        records: &[EmissionRecord],
    ) -> Result<AppendedPartition, TableError> {
        if records.is_empty() {
            return Err(TableError::EmptyAppend(key.to_string()));
        }
        if let Some(stray) = records.iter().find(|r| !r.belongs_to(key)) {
            return Err(TableError::PartitionMismatch {
                expected: key.to_string(),
                found: format!(
                    "{}/{}",
                    stray
                        .report_month
                        .map(emissions_core::format_month)
                        .unwrap_or_else(|| "null".to_string()),
                    stray.emission_scope.as_deref().unwrap_or("null")
                ),
            });
        }

        let batch = records_to_batch(records)?;
        let mut bytes = Vec::new();
        let mut writer = ArrowWriter::try_new(&mut bytes, batch.schema(), None)?;
        writer.write(&batch)?;
        writer.close()?;
        let sha256 = sha256_hex(&bytes);

        fs::create_dir_all(&self.root).map_err(|err| TableError::io(&self.root, err))?;

        let stem = format!("{PART_PREFIX}{}-{}-{}", key.month_str(), key.scope, Uuid::new_v4());
        let final_path = self.root.join(format!("{stem}.{PART_EXTENSION}"));
        let temp_path = self.root.join(format!(".{stem}{TEMP_SUFFIX}"));

        if let Err(err) = write_synced(&temp_path, &bytes).and_then(|()| fs::rename(&temp_path, &final_path)) {
            let _ = fs::remove_file(&temp_path);
            return Err(TableError::io(&final_path, err));
        }

        debug!(file = %final_path.display(), bytes = bytes.len(), "part file committed");
        match self.sweep_stale_temp_files(STALE_TEMP_AGE) {
            Ok(0) => {}
            Ok(removed) => info!(removed, "swept stale staged part files"),
            Err(err) => warn!(error = %err, "could not sweep stale staged part files"),
        }
        info!(partition = %key, rows = records.len(), "appended partition to {TABLE_NAME}");
        Ok(AppendedPartition {
            key: *key,
            file: final_path,
            rows: records.len(),
            sha256,
        })
    }
}

fn write_synced(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut file = fs::OpenOptions::new().create_new(true).write(true).open(path)?;
    file.write_all(bytes)?;
    file.sync_all()
}

/// Stream only the partition columns of one part file. The file must still
/// carry the full item-details schema.
fn read_partition_columns(
    path: &Path,
    mut visit: impl FnMut(NaiveDate, &str),
) -> Result<(), TableError> {
    let file = File::open(path).map_err(|err| TableError::query(path, err))?;
    let builder = ParquetRecordBatchReaderBuilder::try_new(file).map_err(|err| TableError::query(path, err))?;
    if !has_item_details_schema(builder.schema()) {
        return Err(TableError::SchemaMismatch {
            path: path.to_path_buf(),
            found: builder.schema().to_string(),
        });
    }

    let roots = [REPORT_MONTH, EMISSION_SCOPE]
        .into_iter()
        .map(|name| {
            ITEM_DETAILS_COLUMNS
                .iter()
                .position(|col| col.name == name)
                .ok_or_else(|| TableError::query(path, format!("no {name} column")))
        })
        .collect::<Result<Vec<_>, _>>()?;
    let mask = ProjectionMask::roots(builder.parquet_schema(), roots);
    let reader = builder
        .with_projection(mask)
        .build()
        .map_err(|err| TableError::query(path, err))?;

    for batch in reader {
        let batch = batch.map_err(|err| TableError::query(path, err))?;
        let months = projected::<Date32Array>(&batch, REPORT_MONTH, path)?;
        let scopes = projected::<StringArray>(&batch, EMISSION_SCOPE, path)?;
        for row in 0..batch.num_rows() {
            if months.is_null(row) || scopes.is_null(row) {
                continue;
            }
            let month = days_to_date(months.value(row))
                .ok_or_else(|| TableError::query(path, format!("{REPORT_MONTH} out of range at row {row}")))?;
            visit(month, scopes.value(row));
        }
    }
    Ok(())
}

fn projected<'a, T: 'static>(batch: &'a RecordBatch, name: &str, path: &Path) -> Result<&'a T, TableError> {
    batch
        .column_by_name(name)
        .and_then(|column| column.as_any().downcast_ref::<T>())
        .ok_or_else(|| TableError::query(path, format!("projected column {name} is missing or mistyped")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use emissions_core::EmissionScope;
    use tempfile::tempdir;

    fn ymd(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn row(key: &PartitionKey, item: &str, latest: Option<f64>) -> EmissionRecord {
        EmissionRecord {
            item_name: Some(item.to_string()),
            latest_month_emissions: latest,
            report_month: Some(key.month),
            emission_scope: Some(key.scope.as_str().to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn missing_directory_reports_not_found() {
        let dir = tempdir().unwrap();
        let table = ItemDetailsTable::open(dir.path());
        assert!(!table.exists());
        assert!(matches!(table.distinct_partitions(), Err(TableError::NotFound(_))));
    }

    #[test]
    fn appended_partitions_are_visible_as_distinct_pairs() {
        let dir = tempdir().unwrap();
        let table = ItemDetailsTable::open(dir.path());
        let jan = PartitionKey::new(ymd(2024, 1, 1), EmissionScope::Scope1);
        let feb = PartitionKey::new(ymd(2024, 2, 1), EmissionScope::Scope3);

        let appended = table
            .append_partition(&jan, &[row(&jan, "vm-a", Some(1.25)), row(&jan, "vm-b", None)])
            .unwrap();
        assert_eq!(appended.rows, 2);
        assert!(appended.file.starts_with(table.path()));
        table.append_partition(&feb, &[row(&feb, "sql-a", Some(3.0))]).unwrap();

        let pairs = table.distinct_partitions().unwrap();
        assert_eq!(
            pairs.into_iter().collect::<Vec<_>>(),
            vec![(ymd(2024, 1, 1), "Scope1".to_string()), (ymd(2024, 2, 1), "Scope3".to_string())]
        );
        let counts = table.partition_row_counts().unwrap();
        assert_eq!(counts.get(&(ymd(2024, 1, 1), "Scope1".to_string())), Some(&2));
    }

    #[test]
    fn scan_round_trips_nulls_and_dates() {
        let dir = tempdir().unwrap();
        let table = ItemDetailsTable::open(dir.path());
        let key = PartitionKey::new(ymd(2023, 6, 1), EmissionScope::Scope2);
        let mut full = row(&key, "storage-01", Some(0.5));
        full.location = Some("westeurope".into());
        let sparse = EmissionRecord {
            report_month: Some(key.month),
            emission_scope: Some("Scope2".into()),
            ..Default::default()
        };

        table.append_partition(&key, &[full.clone(), sparse.clone()]).unwrap();
        assert_eq!(table.scan().unwrap(), vec![full, sparse]);
    }

    #[test]
    fn batch_schema_matches_canonical_columns() {
        let key = PartitionKey::new(ymd(2024, 3, 1), EmissionScope::Scope1);
        let batch = records_to_batch(&[row(&key, "x", None)]).unwrap();
        assert_eq!(batch.num_columns(), 13);
        assert_eq!(batch.schema().field(5).name(), "reportMonth");
        assert_eq!(batch.schema().field(5).data_type(), &DataType::Date32);
        assert!(has_item_details_schema(&batch.schema()));
    }

    #[test]
    fn rejects_rows_from_another_partition_and_empty_appends() {
        let dir = tempdir().unwrap();
        let table = ItemDetailsTable::open(dir.path());
        let key = PartitionKey::new(ymd(2024, 1, 1), EmissionScope::Scope1);
        let other = PartitionKey::new(ymd(2024, 1, 1), EmissionScope::Scope2);

        assert!(matches!(
            table.append_partition(&key, &[row(&other, "x", None)]),
            Err(TableError::PartitionMismatch { .. })
        ));
        assert!(matches!(table.append_partition(&key, &[]), Err(TableError::EmptyAppend(_))));
        assert!(!table.exists());
    }

    #[test]
    fn temp_files_are_invisible_to_readers() {
        let dir = tempdir().unwrap();
        let table = ItemDetailsTable::open(dir.path());
        fs::create_dir_all(table.path()).unwrap();
        fs::write(table.path().join(".part-2024-01-01-Scope1-x.tmp"), b"partial").unwrap();

        assert!(table.part_files().unwrap().is_empty());
        assert!(table.distinct_partitions().unwrap().is_empty());
    }

    #[test]
    fn partition_pairs_skip_rows_without_month_or_scope() {
        let dir = tempdir().unwrap();
        let table = ItemDetailsTable::open(dir.path());
        let key = PartitionKey::new(ymd(2024, 4, 1), EmissionScope::Scope2);
        table
            .append_partition(&key, &[row(&key, "a", None), row(&key, "b", None)])
            .unwrap();

        let unstamped = EmissionRecord {
            item_name: Some("orphan".into()),
            report_month: Some(ymd(2024, 5, 1)),
            ..Default::default()
        };
        let batch = records_to_batch(&[unstamped]).unwrap();
        let file = File::create(table.path().join("part-unstamped.parquet")).unwrap();
        let mut writer = ArrowWriter::try_new(file, batch.schema(), None).unwrap();
        writer.write(&batch).unwrap();
        writer.close().unwrap();

        let counts = table.partition_row_counts().unwrap();
        assert_eq!(counts.len(), 1);
        assert_eq!(counts.get(&(ymd(2024, 4, 1), "Scope2".to_string())), Some(&2));
        assert_eq!(
            table.distinct_partitions().unwrap(),
            BTreeSet::from([(ymd(2024, 4, 1), "Scope2".to_string())])
        );
        assert_eq!(table.scan().unwrap().len(), 3);
    }

    #[test]
    fn append_sweeps_abandoned_staged_files_only() {
        let dir = tempdir().unwrap();
        let table = ItemDetailsTable::open(dir.path());
        fs::create_dir_all(table.path()).unwrap();

        let abandoned = table.path().join(".part-2024-01-01-Scope1-old.tmp");
        let in_flight = table.path().join(".part-2024-01-01-Scope2-new.tmp");
        let unrelated = table.path().join(".keep.tmp");
        for path in [&abandoned, &in_flight, &unrelated] {
            fs::write(path, b"partial").unwrap();
        }
        let long_ago = SystemTime::now() - STALE_TEMP_AGE - Duration::from_secs(60);
        for path in [&abandoned, &unrelated] {
            File::options().write(true).open(path).unwrap().set_modified(long_ago).unwrap();
        }

        let key = PartitionKey::new(ymd(2024, 3, 1), EmissionScope::Scope3);
        table.append_partition(&key, &[row(&key, "vm", Some(1.0))]).unwrap();

        assert!(!abandoned.exists());
        assert!(in_flight.exists());
        assert!(unrelated.exists());
        assert_eq!(table.sweep_stale_temp_files(Duration::ZERO).unwrap(), 1);
        assert!(!in_flight.exists());
    }

    #[test]
    fn sweeping_a_missing_table_is_a_no_op() {
        let dir = tempdir().unwrap();
        let table = ItemDetailsTable::open(dir.path());
        assert_eq!(table.sweep_stale_temp_files(STALE_TEMP_AGE).unwrap(), 0);
    }

    #[test]
    fn unreadable_part_file_is_a_query_error_not_absence() {
        let dir = tempdir().unwrap();
        let table = ItemDetailsTable::open(dir.path());
        fs::create_dir_all(table.path()).unwrap();
        fs::write(table.path().join("part-corrupt.parquet"), b"not parquet").unwrap();

        assert!(matches!(table.distinct_partitions(), Err(TableError::Query { .. })));
    }

    #[test]
    fn foreign_schema_is_rejected() {
        let dir = tempdir().unwrap();
        let table = ItemDetailsTable::open(dir.path());
        fs::create_dir_all(table.path()).unwrap();

        let schema = Arc::new(Schema::new(vec![Field::new("other", DataType::Utf8, true)]));
        let batch = RecordBatch::try_new(
            schema.clone(),
            vec![Arc::new(StringArray::from(vec![Some("x")])) as ArrayRef],
        )
        .unwrap();
        let file = File::create(table.path().join("part-foreign.parquet")).unwrap();
        let mut writer = ArrowWriter::try_new(file, schema, None).unwrap();
        writer.write(&batch).unwrap();
        writer.close().unwrap();

        assert!(matches!(table.scan(), Err(TableError::SchemaMismatch { .. })));
        assert!(matches!(table.distinct_partitions(), Err(TableError::SchemaMismatch { .. })));
    }

    #[test]
    fn epoch_day_conversion_is_inverse() {
        let date = ymd(2024, 5, 1);
        assert_eq!(date_to_days(ymd(1970, 1, 1)), 0);
        assert_eq!(days_to_date(date_to_days(date)), Some(date));
    }
}
