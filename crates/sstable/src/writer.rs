use anyhow::{bail, Result};
use byteorder::{LittleEndian, WriteBytesExt};
use memtable::Value;
use std::fs::{File, OpenOptions};
use std::io::{Seek, Write};
use std::path::Path;

use crate::format::{write_footer, TYPE_LIVE, TYPE_TOMBSTONE};

/// Streams sorted key-value records into a new SSTable file.
///
/// The caller feeds [`add`](SstWriter::add) strictly ascending keys (the
/// engine guarantees this via skip-list iteration or a sorted merge) and
/// then calls [`finish`](SstWriter::finish), which appends the dense index
/// and footer. The file is only a valid SSTable once `finish` has returned:
/// a crash mid-write leaves a file with no usable footer, which
/// [`SstReader::open`](crate::SstReader::open) rejects.
pub struct SstWriter {
    file: File,
    /// In-memory dense index: one `(key, data_offset)` pair per record.
    index: Vec<(Vec<u8>, u64)>,
}

impl SstWriter {
    /// Creates (or truncates) the file at `path` for writing.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        Ok(Self {
            file,
            index: Vec::new(),
        })
    }

    /// Appends one record to the data section and tracks its index entry.
    ///
    /// # Record layout
    ///
    /// ```text
    /// type(u8) | key_len(u32) | value_len(u32) | key | value
    /// ```
    ///
    /// Tombstones are written with type 1, a zero `value_len`, and no value
    /// bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if `key` is not strictly greater than the previous
    /// key, or on any I/O failure.
    pub fn add(&mut self, key: &[u8], value: &Value) -> Result<()> {
        if let Some((last, _)) = self.index.last() {
            if last.as_slice() >= key {
                bail!("keys must be added in strictly ascending order");
            }
        }

        let offset = self.file.stream_position()?;
        self.index.push((key.to_vec(), offset));

        match value {
            Value::Live(v) => {
                self.file.write_u8(TYPE_LIVE)?;
                self.file.write_u32::<LittleEndian>(key.len() as u32)?;
                self.file.write_u32::<LittleEndian>(v.len() as u32)?;
                self.file.write_all(key)?;
                self.file.write_all(v)?;
            }
            Value::Tombstone => {
                self.file.write_u8(TYPE_TOMBSTONE)?;
                self.file.write_u32::<LittleEndian>(key.len() as u32)?;
                self.file.write_u32::<LittleEndian>(0)?;
                self.file.write_all(key)?;
            }
        }
        Ok(())
    }

    /// Number of records added so far.
    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Finalizes the SSTable: appends the dense index and the footer, then
    /// flushes and fsyncs.
    ///
    /// # Index entry layout
    ///
    /// ```text
    /// key_len(u32) | data_offset(u64) | key
    /// ```
    pub fn finish(mut self) -> Result<()> {
        let index_offset = self.file.stream_position()?;

        for (key, data_offset) in &self.index {
            self.file.write_u32::<LittleEndian>(key.len() as u32)?;
            self.file.write_u64::<LittleEndian>(*data_offset)?;
            self.file.write_all(key)?;
        }

        write_footer(&mut self.file, index_offset)?;

        self.file.flush()?;
        self.file.sync_all()?;
        Ok(())
    }
}
