//! Dataset equivalence: two datasets are equal when they hold the same
//! multiset of records, whatever their file layout or row order.

use crate::error::{Error, Result};
use crate::io::{list_data_files, read_rows, read_schema};
use crate::record::{Row, Schema, Value};
use rayon::prelude::*;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// A dataset decoded into a multiset of canonical rows.
#[derive(Clone, Debug)]
pub struct Dataset {
    pub schema: Schema,
    pub files: Vec<PathBuf>,
    pub records: BTreeMap<Row, usize>,
    pub total: usize,
}

impl Dataset {
    pub fn from_rows(schema: Schema, rows: impl IntoIterator<Item = Row>) -> Self {
        let mut records = BTreeMap::new();
        let mut total = 0;
        for row in rows {
            *records.entry(canonical_row(row)).or_insert(0) += 1;
            total += 1;
        }
        Self { schema, files: Vec::new(), records, total }
    }

    pub fn distinct(&self) -> usize {
        self.records.len()
    }
}

fn canonical_row(row: Row) -> Row {
    row.into_iter().map(|(k, v)| (k, v.canonical())).collect()
}

/// Loads every data file under `path`. All files must share one schema.
pub fn load_dataset(path: impl AsRef<Path>) -> Result<Dataset> {
    let path = path.as_ref();
    if !path.exists() {
        return Err(Error::NoDataFiles(path.to_path_buf()));
    }
    let files = list_data_files(path)?;
    let Some(first) = files.first() else {
        return Err(Error::NoDataFiles(path.to_path_buf()));
    };
    let schema = read_schema(first)?;

    let per_file: Vec<Vec<Row>> = files
        .par_iter()
        .map(|file| {
            let file_schema = read_schema(file)?;
            if !file_schema.same_fields(&schema) {
                return Err(Error::SchemaMismatch { left: schema.to_string(), right: file_schema.to_string() });
            }
            let rows = read_rows(file)?;
            debug!(file = %file.display(), rows = rows.len(), "decoded");
            Ok(rows)
        })
        .collect::<Result<_>>()?;

    let mut dataset = Dataset::from_rows(schema, per_file.into_iter().flatten());
    dataset.files = files;
    info!(path = %path.display(), files = dataset.files.len(), records = dataset.total, distinct = dataset.distinct(), "dataset loaded");
    Ok(dataset)
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct MultiplicityMismatch {
    pub row: Row,
    pub left: usize,
    pub right: usize,
}

/// Differences between two datasets. Empty means equivalent.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ComparisonReport {
    pub left_records: usize,
    pub right_records: usize,
    pub only_in_left: Vec<(Row, usize)>,
    pub only_in_right: Vec<(Row, usize)>,
    pub multiplicity: Vec<MultiplicityMismatch>,
}

impl ComparisonReport {
    pub fn is_equivalent(&self) -> bool {
        self.only_in_left.is_empty() && self.only_in_right.is_empty() && self.multiplicity.is_empty()
    }

    /// The same report with left and right swapped.
    pub fn mirrored(&self) -> Self {
        Self {
            left_records: self.right_records,
            right_records: self.left_records,
            only_in_left: self.only_in_right.clone(),
            only_in_right: self.only_in_left.clone(),
            multiplicity: self
                .multiplicity
                .iter()
                .map(|m| MultiplicityMismatch { row: m.row.clone(), left: m.right, right: m.left })
                .collect(),
        }
    }

    /// Whether any differing row has `field == value`.
    pub fn mentions(&self, field: &str, value: &Value) -> bool {
        let hit = |row: &Row| row.get(field) == Some(value);
        self.only_in_left.iter().any(|(r, _)| hit(r))
            || self.only_in_right.iter().any(|(r, _)| hit(r))
            || self.multiplicity.iter().any(|m| hit(&m.row))
    }
}

pub fn compare_loaded(left: &Dataset, right: &Dataset) -> Result<ComparisonReport> {
    if !left.schema.same_fields(&right.schema) {
        return Err(Error::SchemaMismatch { left: left.schema.to_string(), right: right.schema.to_string() });
    }
    let mut report = ComparisonReport { left_records: left.total, right_records: right.total, ..Default::default() };
    for (row, &n) in &left.records {
        match right.records.get(row) {
            None => report.only_in_left.push((row.clone(), n)),
            Some(&m) if m != n => report.multiplicity.push(MultiplicityMismatch { row: row.clone(), left: n, right: m }),
            Some(_) => {}
        }
    }
    for (row, &m) in &right.records {
        if !left.records.contains_key(row) {
            report.only_in_right.push((row.clone(), m));
        }
    }
    Ok(report)
}

/// Loads both locations and compares them. With `expected_schema`, both
/// sides must carry that schema.
pub fn compare_datasets(
    left: impl AsRef<Path>,
    right: impl AsRef<Path>,
    expected_schema: Option<&Schema>,
) -> Result<ComparisonReport> {
    let (left, right) = (left.as_ref(), right.as_ref());
    let (left, right) = rayon::join(|| load_dataset(left), || load_dataset(right));
    let (left, right) = (left?, right?);
    if let Some(expected) = expected_schema {
        for side in [&left, &right] {
            if !side.schema.same_fields(expected) {
                return Err(Error::SchemaMismatch { left: expected.to_string(), right: side.schema.to_string() });
            }
        }
    }
    let report = compare_loaded(&left, &right)?;
    info!(
        equivalent = report.is_equivalent(),
        left_records = report.left_records,
        right_records = report.right_records,
        only_in_left = report.only_in_left.len(),
        only_in_right = report.only_in_right.len(),
        multiplicity = report.multiplicity.len(),
        "datasets compared"
    );
    Ok(report)
}

pub fn datasets_equivalent(left: impl AsRef<Path>, right: impl AsRef<Path>) -> Result<bool> {
    Ok(compare_datasets(left, right, None)?.is_equivalent())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{Field, FieldType, OutputPair};

    fn pairs(items: &[(&str, i32)]) -> Dataset {
        Dataset::from_rows(Schema::output_pair(), items.iter().map(|(k, c)| Row::from(OutputPair::new(*k, *c))))
    }

    #[test]
    fn row_order_does_not_matter() {
        let a = pairs(&[("x", 2), ("y", 1)]);
        let b = pairs(&[("y", 1), ("x", 2)]);
        assert!(compare_loaded(&a, &b).unwrap().is_equivalent());
    }

    #[test]
    fn duplicates_count() {
        let a = pairs(&[("x", 2), ("x", 2)]);
        let b = pairs(&[("x", 2)]);
        let report = compare_loaded(&a, &b).unwrap();
        assert!(!report.is_equivalent());
        assert_eq!(report.multiplicity, vec![MultiplicityMismatch { row: OutputPair::new("x", 2).into(), left: 2, right: 1 }]);
    }

    #[test]
    fn changed_count_is_reported_on_both_sides() {
        let a = pairs(&[("x", 2), ("y", 1)]);
        let b = pairs(&[("x", 3), ("y", 1)]);
        let report = compare_loaded(&a, &b).unwrap();
        assert!(report.mentions(OutputPair::KEY_FIELD, &Value::from("x")));
        assert!(!report.mentions(OutputPair::KEY_FIELD, &Value::from("y")));
        assert_eq!(report.only_in_left.len(), 1);
        assert_eq!(report.only_in_right.len(), 1);
        assert_eq!(compare_loaded(&b, &a).unwrap(), report.mirrored());
    }

    #[test]
    fn negative_zero_equals_zero() {
        let schema = Schema::new(vec![Field::required("d", FieldType::Double)]);
        let row = |d: f64| Row::from([("d".to_string(), Value::Double(d))]);
        let a = Dataset::from_rows(schema.clone(), [row(0.0), row(f64::NAN)]);
        let b = Dataset::from_rows(schema, [row(-0.0), row(-f64::NAN)]);
        assert!(compare_loaded(&a, &b).unwrap().is_equivalent());
    }

    #[test]
    fn different_schemas_are_an_error() {
        let a = pairs(&[("x", 1)]);
        let b = Dataset::from_rows(Schema::tweet(), []);
        assert!(matches!(compare_loaded(&a, &b), Err(Error::SchemaMismatch { .. })));
    }

    #[test]
    fn missing_location_has_no_data() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_dataset(dir.path().join("nope")).unwrap_err();
        assert!(matches!(err, Error::NoDataFiles(_)));
        let err = load_dataset(dir.path()).unwrap_err();
        assert!(matches!(err, Error::NoDataFiles(_)));
    }
}
