//! The binary trajectory format shared by the interpreter and every
//! generated artifact.
//!
//! All integers are little-endian `i32`, all samples little-endian `f64`:
//!
//! ```text
//! version | numFields | numFields x (nameLen, name bytes) | saveModN | numRecords
//! numRecords x numFields x f64, column-major
//! ```

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;
use thiserror::Error;

pub const FORMAT_VERSION: i32 = 1;

/// Upper bound on capacity reserved from a header count; larger vectors grow
/// as data actually arrives.
pub(crate) const MAX_PREALLOC: usize = 1 << 16;

#[derive(Debug, Error)]
pub enum FormatError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("unsupported format version {0}")]
    UnsupportedVersion(i32),
    #[error("malformed data: {0}")]
    Invalid(String),
}

/// Recorded samples of a run, stored one column per field.
#[derive(Debug, Clone, PartialEq)]
pub struct Trajectory {
    names: Vec<String>,
    save_mod_n: u32,
    columns: Vec<Vec<f64>>,
}

impl Trajectory {
    pub fn new(names: Vec<String>, save_mod_n: u32) -> Self {
        let columns = vec![Vec::new(); names.len()];
        Self {
            names,
            save_mod_n,
            columns,
        }
    }

    /// Appends one record; `record` holds one value per field.
    pub fn push_record(&mut self, record: &[f64]) {
        debug_assert_eq!(record.len(), self.columns.len());
        for (column, value) in self.columns.iter_mut().zip(record) {
            column.push(*value);
        }
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn save_mod_n(&self) -> u32 {
        self.save_mod_n
    }

    pub fn num_fields(&self) -> usize {
        self.names.len()
    }

    pub fn num_records(&self) -> usize {
        self.columns.first().map_or(0, Vec::len)
    }

    pub fn column(&self, name: &str) -> Option<&[f64]> {
        let index = self.names.iter().position(|n| n == name)?;
        Some(&self.columns[index])
    }

    pub fn column_at(&self, index: usize) -> Option<&[f64]> {
        self.columns.get(index).map(Vec::as_slice)
    }

    pub fn record(&self, index: usize) -> Option<Vec<f64>> {
        if index >= self.num_records() {
            return None;
        }
        Some(self.columns.iter().map(|column| column[index]).collect())
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<(), FormatError> {
        write_i32(writer, FORMAT_VERSION)?;
        write_i32(writer, count_to_i32(self.names.len(), "field count")?)?;
        for name in &self.names {
            write_i32(writer, count_to_i32(name.len(), "name length")?)?;
            writer.write_all(name.as_bytes())?;
        }
        write_i32(writer, count_to_i32(self.save_mod_n as usize, "save interval")?)?;
        write_i32(writer, count_to_i32(self.num_records(), "record count")?)?;
        for column in &self.columns {
            for value in column {
                writer.write_all(&value.to_le_bytes())?;
            }
        }
        Ok(())
    }

    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self, FormatError> {
        let version = read_i32(reader)?;
        if version != FORMAT_VERSION {
            return Err(FormatError::UnsupportedVersion(version));
        }
        let num_fields = read_count(reader, "field count")?;
        let mut names = Vec::with_capacity(num_fields.min(MAX_PREALLOC));
        for _ in 0..num_fields {
            let len = read_count(reader, "name length")?;
            let mut bytes = Vec::with_capacity(len.min(MAX_PREALLOC));
            reader.by_ref().take(len as u64).read_to_end(&mut bytes)?;
            if bytes.len() != len {
                return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
            }
            let name = String::from_utf8(bytes)
                .map_err(|_| FormatError::Invalid("field name is not UTF-8".to_string()))?;
            names.push(name);
        }
        let save_mod_n = read_count(reader, "save interval")? as u32;
        let num_records = read_count(reader, "record count")?;
        let mut columns = Vec::with_capacity(num_fields.min(MAX_PREALLOC));
        for _ in 0..num_fields {
            let mut column = Vec::with_capacity(num_records.min(MAX_PREALLOC));
            for _ in 0..num_records {
                column.push(read_f64(reader)?);
            }
            columns.push(column);
        }
        Ok(Self {
            names,
            save_mod_n,
            columns,
        })
    }

    pub fn write_file(&self, path: &Path) -> Result<(), FormatError> {
        let mut writer = BufWriter::new(File::create(path)?);
        self.write_to(&mut writer)?;
        writer.flush()?;
        Ok(())
    }

    pub fn read_file(path: &Path) -> Result<Self, FormatError> {
        let mut reader = BufReader::new(File::open(path)?);
        Self::read_from(&mut reader)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::new();
        // Writing into a Vec only fails on counts that overflow i32.
        if let Err(err) = self.write_to(&mut bytes) {
            tracing::warn!(%err, "trajectory too large to serialise");
            bytes.clear();
        }
        bytes
    }

    pub fn from_bytes(mut bytes: &[u8]) -> Result<Self, FormatError> {
        Self::read_from(&mut bytes)
    }
}

/// Number of records a run of `iterations` produces when saving every
/// `save_mod_n`-th iteration starting at iteration 0.
pub fn record_count(iterations: u64, save_mod_n: u32) -> u64 {
    let n = u64::from(save_mod_n.max(1));
    iterations.div_ceil(n)
}

pub(crate) fn write_i32<W: Write>(writer: &mut W, value: i32) -> io::Result<()> {
    writer.write_all(&value.to_le_bytes())
}

pub(crate) fn read_i32<R: Read>(reader: &mut R) -> io::Result<i32> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf)?;
    Ok(i32::from_le_bytes(buf))
}

pub(crate) fn read_f64<R: Read>(reader: &mut R) -> io::Result<f64> {
    let mut buf = [0u8; 8];
    reader.read_exact(&mut buf)?;
    Ok(f64::from_le_bytes(buf))
}

pub(crate) fn read_count<R: Read>(reader: &mut R, what: &str) -> Result<usize, FormatError> {
    let value = read_i32(reader)?;
    usize::try_from(value).map_err(|_| FormatError::Invalid(format!("negative {what} {value}")))
}

pub(crate) fn count_to_i32(value: usize, what: &str) -> Result<i32, FormatError> {
    i32::try_from(value).map_err(|_| FormatError::Invalid(format!("{what} {value} exceeds i32")))
}
