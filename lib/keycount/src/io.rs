use crate::config::Codec;
use crate::error::{Error, Result};
use crate::record::{FieldType, Row, Schema, Value};
use parquet::data_type::{BoolType, ByteArray, ByteArrayType, DataType, DoubleType, Int32Type, Int64Type};
use parquet::file::properties::WriterProperties;
use parquet::file::reader::{FileReader, RowGroupReader};
use parquet::file::serialized_reader::SerializedFileReader;
use parquet::file::writer::SerializedFileWriter;
use parquet::record::Field as ParquetField;
use parquet::schema::parser::parse_message_type;
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::fs::{self, File};
use std::hash::Hasher;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub fn ensure_dir(path: impl AsRef<Path>) -> Result<()> {
    fs::create_dir_all(path.as_ref())?;
    Ok(())
}

/// Data files under `path`, sorted. A plain file is returned as is. Files
/// whose names start with `_` or `.` (markers, checksums, scratch) are skipped.
pub fn list_data_files(path: impl AsRef<Path>) -> Result<Vec<PathBuf>> {
    let path = path.as_ref();
    if path.is_file() {
        return Ok(vec![path.to_path_buf()]);
    }
    let mut files = Vec::new();
    let walker = walkdir::WalkDir::new(path)
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !is_hidden(e.file_name().to_string_lossy().as_ref()));
    for entry in walker {
        let entry = entry?;
        if entry.file_type().is_file() {
            files.push(entry.path().to_path_buf());
        }
    }
    files.sort();
    Ok(files)
}

fn is_hidden(name: &str) -> bool {
    name.starts_with('_') || name.starts_with('.')
}

pub fn open_writer(path: impl AsRef<Path>) -> Result<BufWriter<File>> {
    if let Some(parent) = path.as_ref().parent() {
        ensure_dir(parent)?;
    }
    let file = File::create(path)?;
    Ok(BufWriter::new(file))
}

// ========== Shuffle framing: [klen u32 le][vlen u32 le][key][value] ==========

pub const FRAME_HEADER_BYTES: usize = 8;

pub fn write_bin(buf: &mut Vec<u8>, key: &[u8], value: &[u8]) {
    buf.extend_from_slice(&(key.len() as u32).to_le_bytes());
    buf.extend_from_slice(&(value.len() as u32).to_le_bytes());
    buf.extend_from_slice(key);
    buf.extend_from_slice(value);
}

/// Reads the frame starting at `off`, returning `(key, value, next_offset)`,
/// or `None` when no complete frame starts there.
pub fn read_bin_line(bytes: &[u8], off: usize) -> Option<(&[u8], &[u8], usize)> {
    let header = bytes.get(off..off.checked_add(FRAME_HEADER_BYTES)?)?;
    let klen = u32::from_le_bytes(header[0..4].try_into().ok()?) as usize;
    let vlen = u32::from_le_bytes(header[4..8].try_into().ok()?) as usize;
    let key_start = off + FRAME_HEADER_BYTES;
    let val_start = key_start.checked_add(klen)?;
    let end = val_start.checked_add(vlen)?;
    if end > bytes.len() {
        return None;
    }
    Some((&bytes[key_start..val_start], &bytes[val_start..end], end))
}

pub fn hash_to_partition(key_bytes: &[u8], num_partitions: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    hasher.write(key_bytes);
    (hasher.finish() as usize) % num_partitions.max(1)
}

// ========== Parquet datasets ==========

/// One independently readable slice of an input dataset: a row group.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DataSplit {
    pub file: PathBuf,
    pub row_group: usize,
    pub rows: i64,
}

impl fmt::Display for DataSplit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.file.display(), self.row_group)
    }
}

/// Reads records of type `T` from data files.
pub trait Format<T>: Send + Sync {
    fn plan(&self, files: &[PathBuf]) -> Result<Vec<DataSplit>>;
    fn read_split(&self, split: &DataSplit, f: &mut dyn FnMut(T) -> Result<()>) -> Result<()>;
}

/// Writes one reduce partition's output records as a single file in `dir`.
pub trait Sink<T>: Send + Sync {
    fn write_partition(&self, dir: &Path, partition: usize, records: Vec<T>) -> Result<PathBuf>;
}

/// Parquet input; optionally checks every file against an expected schema.
#[derive(Clone, Debug, Default)]
pub struct ParquetFormat {
    pub expected: Option<Schema>,
}

impl ParquetFormat {
    pub fn new(expected: Option<Schema>) -> Self {
        Self { expected }
    }
}

impl Format<Row> for ParquetFormat {
    fn plan(&self, files: &[PathBuf]) -> Result<Vec<DataSplit>> {
        let mut splits = Vec::new();
        for file in files {
            let reader = SerializedFileReader::new(File::open(file)?)?;
            let schema = Schema::from_parquet(reader.metadata().file_metadata().schema_descr())?;
            if let Some(expected) = &self.expected {
                if !expected.same_fields(&schema) {
                    return Err(Error::Schema(format!(
                        "{} has schema {}, expected {}",
                        file.display(),
                        schema,
                        expected
                    )));
                }
            }
            for (row_group, meta) in reader.metadata().row_groups().iter().enumerate() {
                splits.push(DataSplit { file: file.clone(), row_group, rows: meta.num_rows() });
            }
        }
        Ok(splits)
    }

    fn read_split(&self, split: &DataSplit, f: &mut dyn FnMut(Row) -> Result<()>) -> Result<()> {
        let reader = SerializedFileReader::new(File::open(&split.file)?)?;
        let row_group = reader.get_row_group(split.row_group)?;
        for row in row_group.get_row_iter(None)? {
            f(row_from_parquet(&row?)?)?;
        }
        Ok(())
    }
}

pub fn read_schema(path: impl AsRef<Path>) -> Result<Schema> {
    let reader = SerializedFileReader::new(File::open(path.as_ref())?)?;
    Schema::from_parquet(reader.metadata().file_metadata().schema_descr())
}

/// Every row of one parquet file, in file order.
pub fn read_rows(path: impl AsRef<Path>) -> Result<Vec<Row>> {
    let reader = SerializedFileReader::new(File::open(path.as_ref())?)?;
    let mut rows = Vec::new();
    for row in reader.get_row_iter(None)? {
        rows.push(row_from_parquet(&row?)?);
    }
    Ok(rows)
}

fn row_from_parquet(row: &parquet::record::Row) -> Result<Row> {
    row.get_column_iter()
        .map(|(name, field)| Ok((name.clone(), value_from_parquet(name, field)?)))
        .collect()
}

fn value_from_parquet(name: &str, field: &ParquetField) -> Result<Value> {
    Ok(match field {
        ParquetField::Null => Value::Null,
        ParquetField::Bool(b) => Value::Bool(*b),
        ParquetField::Int(i) => Value::Int32(*i),
        ParquetField::Long(l) => Value::Int64(*l),
        ParquetField::Double(d) => Value::Double(*d),
        ParquetField::Str(s) => Value::String(s.clone()),
        ParquetField::Bytes(b) => Value::Bytes(b.data().to_vec()),
        other => return Err(Error::Schema(format!("column '{name}' holds unsupported value {other}"))),
    })
}

/// Writes `rows` as one parquet file, `row_group_rows` rows per row group.
pub fn write_rows(path: impl AsRef<Path>, schema: &Schema, rows: &[Row], codec: Codec, row_group_rows: usize) -> Result<()> {
    for row in rows {
        schema.validate(row)?;
    }
    let message = parse_message_type(&schema.to_message_type())?;
    let props = WriterProperties::builder().set_compression(codec.compression()).build();
    if let Some(parent) = path.as_ref().parent() {
        ensure_dir(parent)?;
    }
    let file = File::create(path.as_ref())?;
    let mut writer = SerializedFileWriter::new(file, Arc::new(message), Arc::new(props))?;

    for chunk in rows.chunks(row_group_rows.max(1)) {
        let mut row_group = writer.next_row_group()?;
        for field in &schema.fields {
            let mut col = row_group
                .next_column()?
                .ok_or_else(|| Error::Schema(format!("no column writer for '{}'", field.name)))?;
            match field.ty {
                FieldType::Bool => write_column::<BoolType>(col.typed(), chunk, &field.name, field.nullable, |v| match v {
                    Value::Bool(b) => Some(*b),
                    _ => None,
                })?,
                FieldType::Int32 => write_column::<Int32Type>(col.typed(), chunk, &field.name, field.nullable, |v| match v {
                    Value::Int32(i) => Some(*i),
                    _ => None,
                })?,
                FieldType::Int64 => write_column::<Int64Type>(col.typed(), chunk, &field.name, field.nullable, |v| match v {
                    Value::Int64(i) => Some(*i),
                    _ => None,
                })?,
                FieldType::Double => write_column::<DoubleType>(col.typed(), chunk, &field.name, field.nullable, |v| match v {
                    Value::Double(d) => Some(*d),
                    _ => None,
                })?,
                FieldType::String | FieldType::Bytes => {
                    write_column::<ByteArrayType>(col.typed(), chunk, &field.name, field.nullable, |v| match v {
                        Value::String(s) => Some(ByteArray::from(s.as_str())),
                        Value::Bytes(b) => Some(ByteArray::from(b.clone())),
                        _ => None,
                    })?
                }
            }
            col.close()?;
        }
        row_group.close()?;
    }
    writer.close()?;
    Ok(())
}

fn write_column<T: DataType>(
    writer: &mut parquet::column::writer::ColumnWriterImpl<'_, T>,
    rows: &[Row],
    name: &str,
    nullable: bool,
    pick: impl Fn(&Value) -> Option<T::T>,
) -> Result<()> {
    let mut values = Vec::with_capacity(rows.len());
    let mut def_levels = Vec::with_capacity(rows.len());
    for row in rows {
        match row.get(name) {
            None | Some(Value::Null) => def_levels.push(0),
            Some(v) => {
                let picked = pick(v).ok_or_else(|| Error::Schema(format!("field '{name}' has mismatched value {v}")))?;
                values.push(picked);
                def_levels.push(1);
            }
        }
    }
    let defs = if nullable { Some(def_levels.as_slice()) } else { None };
    writer.write_batch(&values[..], defs, None)?;
    Ok(())
}

/// Parquet output; one `part-NNNNN.parquet` file per reduce partition.
#[derive(Clone, Debug)]
pub struct ParquetRowSink {
    pub schema: Schema,
    pub codec: Codec,
    pub row_group_rows: usize,
}

impl ParquetRowSink {
    pub fn new(schema: Schema, codec: Codec, row_group_rows: usize) -> Self {
        Self { schema, codec, row_group_rows }
    }

    pub fn part_file_name(partition: usize) -> String {
        format!("part-{:05}.parquet", partition)
    }
}

impl<T: Into<Row> + Send> Sink<T> for ParquetRowSink {
    fn write_partition(&self, dir: &Path, partition: usize, records: Vec<T>) -> Result<PathBuf> {
        let rows: Vec<Row> = records.into_iter().map(Into::into).collect();
        let path = dir.join(Self::part_file_name(partition));
        write_rows(&path, &self.schema, &rows, self.codec, self.row_group_rows)?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{Field, OutputPair, Tweet};

    #[test]
    fn frames_read_back_in_sequence_and_stop_at_truncation() {
        let mut buf = Vec::new();
        write_bin(&mut buf, b"alpha", b"1");
        write_bin(&mut buf, b"", b"22");
        let (k, v, next) = read_bin_line(&buf, 0).unwrap();
        assert_eq!((k, v), (&b"alpha"[..], &b"1"[..]));
        let (k, v, end) = read_bin_line(&buf, next).unwrap();
        assert_eq!((k, v), (&b""[..], &b"22"[..]));
        assert_eq!(end, buf.len());
        assert!(read_bin_line(&buf, end).is_none());
        assert!(read_bin_line(&buf[..buf.len() - 1], next).is_none());
    }

    #[test]
    fn partitioning_is_stable_and_in_range() {
        for n in 1..8 {
            let p = hash_to_partition(b"miguno", n);
            assert!(p < n);
            assert_eq!(p, hash_to_partition(b"miguno", n));
        }
    }

    #[test]
    fn list_data_files_skips_markers() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("part-00000.parquet"), b"x").unwrap();
        fs::write(dir.path().join("_SUCCESS"), b"").unwrap();
        fs::write(dir.path().join(".part-00000.parquet.crc"), b"").unwrap();
        let files = list_data_files(dir.path()).unwrap();
        assert_eq!(files, vec![dir.path().join("part-00000.parquet")]);
    }

    #[test]
    fn rows_survive_a_parquet_write_with_several_row_groups() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tweets.parquet");
        let rows: Vec<Row> = (0..5)
            .map(|i| Tweet { username: format!("user{}", i % 2), tweet: format!("tweet {i}"), timestamp: i }.into())
            .collect();
        write_rows(&path, &Schema::tweet(), &rows, Codec::Snappy, 2).unwrap();

        assert!(read_schema(&path).unwrap().same_fields(&Schema::tweet()));
        assert_eq!(read_rows(&path).unwrap(), rows);

        let splits = ParquetFormat::new(Some(Schema::tweet())).plan(&[path.clone()]).unwrap();
        assert_eq!(splits.iter().map(|s| s.rows).collect::<Vec<_>>(), vec![2, 2, 1]);
        let mut seen = Vec::new();
        ParquetFormat::default().read_split(&splits[1], &mut |row| {
            seen.push(row);
            Ok(())
        })
        .unwrap();
        assert_eq!(seen, rows[2..4].to_vec());
    }

    #[test]
    fn nullable_columns_write_nulls() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("opt.parquet");
        let schema = Schema::new(vec![Field::optional("category", FieldType::String)]);
        let mut present = Row::new();
        present.insert("category".into(), "x".into());
        let mut absent = Row::new();
        absent.insert("category".into(), Value::Null);
        write_rows(&path, &schema, &[present.clone(), absent.clone()], Codec::Uncompressed, 10).unwrap();
        assert_eq!(read_rows(&path).unwrap(), vec![present, absent]);
    }

    #[test]
    fn plan_rejects_unexpected_input_schema() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pairs.parquet");
        ParquetRowSink::new(Schema::output_pair(), Codec::Snappy, 10)
            .write_partition(dir.path(), 0, vec![OutputPair::new("x", 1)])
            .unwrap();
        std::fs::rename(dir.path().join(ParquetRowSink::part_file_name(0)), &path).unwrap();
        let err = ParquetFormat::new(Some(Schema::tweet())).plan(&[path]).unwrap_err();
        assert!(matches!(err, Error::Schema(_)));
    }
}
