use anyhow::{bail, Context, Result};
use byteorder::{LittleEndian, ReadBytesExt};
use memtable::Value;
use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use crate::format::{read_footer, FOOTER_BYTES, TYPE_LIVE, TYPE_TOMBSTONE};

/// Reads an SSTable file for point lookups and sequential scans.
///
/// On [`open`](SstReader::open) the entire dense **index** is loaded into
/// memory as a sorted `Vec<(key, data_offset)>`. Point lookups binary-search
/// the index and then need a single seek + read.
///
/// The data file is **not** kept open between lookups — each
/// [`get`](SstReader::get) opens the file, seeks, reads the record, and
/// closes the handle. This keeps ownership simple, lets a reader be shared
/// behind `Arc` without interior mutability, and makes closing a reader
/// just dropping it.
pub struct SstReader {
    /// Path to the `.sst` file on disk.
    path: PathBuf,
    /// Sorted dense index: one `(key, data_offset)` pair per data record.
    index: Vec<(Vec<u8>, u64)>,
    /// Byte offset where the data section ends and the index begins.
    data_end: u64,
}

impl SstReader {
    /// Opens an SSTable file and loads its index into memory.
    ///
    /// # Validation
    ///
    /// - The file must be at least 8 bytes (footer size).
    /// - The `index_offset` must point inside the file.
    /// - Index entries must fill the region between `index_offset` and the
    ///   footer exactly, in strictly ascending key order.
    ///
    /// A file that fails any check (e.g. a flush that crashed before the
    /// footer was written) is rejected and no reader is constructed.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path_buf = path.as_ref().to_path_buf();
        let mut f = File::open(&path_buf)
            .with_context(|| format!("open sstable {}", path_buf.display()))?;
        let filesize = f.metadata()?.len();

        if filesize < FOOTER_BYTES {
            bail!("sstable file too small: {} bytes", filesize);
        }

        let (index_offset, _) = read_footer(&mut f)?;
        let footer_start = filesize - FOOTER_BYTES;
        if index_offset > footer_start {
            bail!("index offset {} out of range", index_offset);
        }

        f.seek(SeekFrom::Start(index_offset))?;
        let mut rdr = BufReader::new(f);
        let mut index: Vec<(Vec<u8>, u64)> = Vec::new();
        let mut pos = index_offset;

        while pos < footer_start {
            // key_len (u32) + data_offset (u64) + key bytes
            let key_len = rdr.read_u32::<LittleEndian>()? as u64;
            if pos + 12 + key_len > footer_start {
                bail!("index entry runs past file end");
            }
            let data_offset = rdr.read_u64::<LittleEndian>()?;
            let mut key = vec![0u8; key_len as usize];
            rdr.read_exact(&mut key)?;

            if let Some((last, _)) = index.last() {
                if last.as_slice() >= key.as_slice() {
                    bail!("index keys not in ascending order");
                }
            }
            if data_offset >= index_offset {
                bail!("data offset {} points outside data section", data_offset);
            }
            index.push((key, data_offset));
            pos += 12 + key_len;
        }

        Ok(Self {
            path: path_buf,
            index,
            data_end: index_offset,
        })
    }

    /// Point lookup for a single key.
    ///
    /// Returns `Ok(Some(value))` if the key exists in this SSTable — the
    /// value is tagged, so a tombstone comes back as
    /// [`Value::Tombstone`] and the engine decides what it means for the
    /// lookup. Returns `Ok(None)` if the key is not in the index.
    ///
    /// # Errors
    ///
    /// Returns an error on I/O failure or if the on-disk record does not
    /// match the index (corruption).
    pub fn get(&self, key: &[u8]) -> Result<Option<Value>> {
        let slot = match self
            .index
            .binary_search_by(|(k, _)| k.as_slice().cmp(key))
        {
            Ok(i) => i,
            Err(_) => return Ok(None),
        };
        let offset = self.index[slot].1;

        // Open per call to keep API & ownership simple and avoid a mutable
        // File in the struct.
        let mut f = File::open(&self.path)?;
        f.seek(SeekFrom::Start(offset))?;

        let (stored_key, value) = read_record(&mut f)?;
        if stored_key != key {
            bail!("index pointed to mismatching key at offset {}", offset);
        }
        Ok(Some(value))
    }

    /// The materialized index, exposed for compaction and dump tooling.
    pub fn index(&self) -> &[(Vec<u8>, u64)] {
        &self.index
    }

    /// Number of records in this SSTable.
    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Sequential cursor over the data section in ascending key order,
    /// tombstones included.
    ///
    /// The scan owns its own file handle, so it can run while other threads
    /// serve point lookups from the same reader. Compaction merges two of
    /// these.
    pub fn scan(&self) -> Result<Scan> {
        let f = File::open(&self.path)?;
        Ok(Scan {
            rdr: BufReader::new(f),
            pos: 0,
            data_end: self.data_end,
        })
    }
}

/// Reads one data record at the current position: header, key, value.
fn read_record<R: Read>(r: &mut R) -> Result<(Vec<u8>, Value)> {
    let entry_type = r.read_u8()?;
    let key_len = r.read_u32::<LittleEndian>()? as usize;
    let value_len = r.read_u32::<LittleEndian>()? as usize;

    let mut key = vec![0u8; key_len];
    r.read_exact(&mut key)?;

    match entry_type {
        TYPE_TOMBSTONE => Ok((key, Value::Tombstone)),
        TYPE_LIVE => {
            let mut value = vec![0u8; value_len];
            r.read_exact(&mut value)?;
            Ok((key, Value::Live(value)))
        }
        other => bail!("unknown record type {}", other),
    }
}

/// Iterator over `(key, value)` pairs of one SSTable's data section.
pub struct Scan {
    rdr: BufReader<File>,
    pos: u64,
    data_end: u64,
}

impl Iterator for Scan {
    type Item = Result<(Vec<u8>, Value)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.data_end {
            return None;
        }
        match read_record(&mut self.rdr) {
            Ok((key, value)) => {
                let value_bytes = match &value {
                    Value::Live(v) => v.len() as u64,
                    Value::Tombstone => 0,
                };
                self.pos += crate::format::RECORD_HEADER_BYTES + key.len() as u64 + value_bytes;
                Some(Ok((key, value)))
            }
            Err(e) => {
                self.pos = self.data_end; // stop after an error
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SstWriter;
    use tempfile::tempdir;

    fn write_sample(path: &Path) -> Result<()> {
        let mut w = SstWriter::create(path)?;
        w.add(b"a", &Value::Live(b"apple".to_vec()))?;
        w.add(b"b", &Value::Live(b"banana".to_vec()))?;
        w.add(b"c", &Value::Live(b"".to_vec()))?;
        w.add(b"d", &Value::Tombstone)?;
        w.finish()
    }

    // -------------------- Basic open & get --------------------

    #[test]
    fn open_and_get_entries() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("sample.sst");
        write_sample(&path)?;

        let reader = SstReader::open(&path)?;
        assert_eq!(reader.len(), 4);

        assert_eq!(reader.get(b"a")?, Some(Value::Live(b"apple".to_vec())));
        assert_eq!(reader.get(b"b")?, Some(Value::Live(b"banana".to_vec())));
        assert_eq!(reader.get(b"c")?, Some(Value::Live(b"".to_vec())));
        assert_eq!(reader.get(b"d")?, Some(Value::Tombstone));
        assert_eq!(reader.get(b"nope")?, None);

        Ok(())
    }

    #[test]
    fn index_is_sorted_and_dense() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("sorted.sst");

        let mut w = SstWriter::create(&path)?;
        for i in 0..100u32 {
            w.add(
                format!("k{:03}", i).as_bytes(),
                &Value::Live(format!("v{}", i).into_bytes()),
            )?;
        }
        w.finish()?;

        let reader = SstReader::open(&path)?;
        assert_eq!(reader.index().len(), 100);
        for pair in reader.index().windows(2) {
            assert!(pair[0].0 < pair[1].0);
        }
        Ok(())
    }

    // -------------------- Validation errors --------------------

    #[test]
    fn open_file_too_small() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tiny.sst");
        std::fs::write(&path, b"short").unwrap();

        assert!(SstReader::open(&path).is_err());
    }

    #[test]
    fn open_bad_index_offset() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("badoff.sst");

        // Footer-only file whose index offset points past the footer.
        let data = u64::MAX.to_le_bytes();
        std::fs::write(&path, data).unwrap();

        assert!(SstReader::open(&path).is_err());
    }

    #[test]
    fn open_truncated_index() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("trunc.sst");
        write_sample(&path)?;

        // Chop bytes out of the middle of the index region, keeping the
        // footer, so an entry runs past the file end.
        let bytes = std::fs::read(&path)?;
        let footer = &bytes[bytes.len() - 8..];
        let mut mangled = bytes[..bytes.len() - 20].to_vec();
        mangled.extend_from_slice(footer);
        std::fs::write(&path, &mangled)?;

        assert!(SstReader::open(&path).is_err());
        Ok(())
    }

    #[test]
    fn open_nonexistent_file() {
        assert!(SstReader::open("/tmp/no_such_file_emberkv.sst").is_err());
    }

    // -------------------- Scans --------------------

    #[test]
    fn scan_yields_records_in_order() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("scan.sst");
        write_sample(&path)?;

        let reader = SstReader::open(&path)?;
        let records: Vec<(Vec<u8>, Value)> =
            reader.scan()?.collect::<Result<_>>()?;

        assert_eq!(records.len(), 4);
        assert_eq!(records[0], (b"a".to_vec(), Value::Live(b"apple".to_vec())));
        assert_eq!(records[3], (b"d".to_vec(), Value::Tombstone));
        for pair in records.windows(2) {
            assert!(pair[0].0 < pair[1].0);
        }
        Ok(())
    }

    #[test]
    fn scan_empty_table() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("empty.sst");
        SstWriter::create(&path)?.finish()?;

        let reader = SstReader::open(&path)?;
        assert!(reader.is_empty());
        assert_eq!(reader.scan()?.count(), 0);
        Ok(())
    }

    // -------------------- Multiple gets on same reader --------------------

    #[test]
    fn multiple_gets_same_reader() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("multi.sst");

        let mut w = SstWriter::create(&path)?;
        for i in 0..100u64 {
            w.add(
                format!("k{:03}", i).as_bytes(),
                &Value::Live(format!("v{:03}", i).into_bytes()),
            )?;
        }
        w.finish()?;

        let reader = SstReader::open(&path)?;
        // Read all keys twice to ensure re-opening the file works.
        for _ in 0..2 {
            for i in 0..100u64 {
                let key = format!("k{:03}", i).into_bytes();
                let value = reader.get(&key)?.unwrap();
                assert_eq!(value, Value::Live(format!("v{:03}", i).into_bytes()));
            }
        }
        Ok(())
    }

    // -------------------- Large values --------------------

    #[test]
    fn large_value_roundtrip() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("bigval.sst");

        let big = vec![b'x'; 500_000];
        let mut w = SstWriter::create(&path)?;
        w.add(b"big", &Value::Live(big.clone()))?;
        w.finish()?;

        let reader = SstReader::open(&path)?;
        assert_eq!(reader.get(b"big")?, Some(Value::Live(big)));
        Ok(())
    }

    #[test]
    fn binary_keys_roundtrip() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("bin.sst");

        let mut w = SstWriter::create(&path)?;
        w.add(&[0x00], &Value::Live(vec![0x01]))?;
        w.add(&[0x00, 0x00], &Value::Live(vec![0x02]))?;
        w.add(&[0xFF], &Value::Tombstone)?;
        w.finish()?;

        let reader = SstReader::open(&path)?;
        assert_eq!(reader.get(&[0x00])?, Some(Value::Live(vec![0x01])));
        assert_eq!(reader.get(&[0x00, 0x00])?, Some(Value::Live(vec![0x02])));
        assert_eq!(reader.get(&[0xFF])?, Some(Value::Tombstone));
        assert_eq!(reader.get(&[0x01])?, None);
        Ok(())
    }
}
