//! # Write-ahead log
//!
//! Append-only durable record of every write accepted by the EmberKV
//! memtable. Each record is framed with a length and a CRC32 so that replay
//! after a crash can distinguish a torn tail (stop cleanly) from actual
//! corruption (error out).
//!
//! ## Record framing
//!
//! ```text
//! [record_len(u32 LE)][crc32(u32 LE)][body]
//! body: op(u8) | key_len(u32 LE) | key | [value_len(u32 LE) | value]
//! ```
//!
//! `record_len` counts the crc field plus the body. The CRC covers the body
//! only. Op 0 is a put (value present), op 1 is a delete (no value bytes).
//! Records carry no sequence number: replay order is file order, and the
//! engine's write lock serializes appenders.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use crc32fast::Hasher as Crc32;
use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, Read, Write};
use std::path::Path;

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalRecord {
    Put { key: Vec<u8>, value: Vec<u8> },
    Del { key: Vec<u8> },
}

#[derive(Debug, Error)]
pub enum WalError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("corrupt record")]
    Corrupt,
}

/// WAL writer that appends records and optionally fsyncs each one.
///
/// The engine opens the log with `sync = true`, so a successful [`append`]
/// means the record is on stable storage. Benchmarks may disable syncing.
///
/// [`append`]: WalWriter::append
pub struct WalWriter {
    file: File,
    sync: bool,
}

impl WalWriter {
    pub fn create<P: AsRef<Path>>(path: P, sync: bool) -> Result<Self, WalError> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(path)?;
        Ok(Self { file, sync })
    }

    /// Append a record. Writes the full frame and (when `sync` is set)
    /// calls `sync_all` before returning.
    ///
    /// Any write or sync error surfaces to the caller; the log is never
    /// retried or repaired at this layer.
    pub fn append(&mut self, record: &WalRecord) -> Result<(), WalError> {
        let mut buf = Vec::new();
        match record {
            WalRecord::Put { key, value } => {
                buf.write_u8(0)?; // op = put
                buf.write_u32::<LittleEndian>(key.len() as u32)?;
                buf.extend_from_slice(key);
                buf.write_u32::<LittleEndian>(value.len() as u32)?;
                buf.extend_from_slice(value);
            }
            WalRecord::Del { key } => {
                buf.write_u8(1)?; // op = del
                buf.write_u32::<LittleEndian>(key.len() as u32)?;
                buf.extend_from_slice(key);
            }
        }

        let mut hasher = Crc32::new();
        hasher.update(&buf);
        let crc = hasher.finalize();

        // full record: record_len(u32) [not counting this header], crc(u32), body
        let record_len = buf.len() as u32 + 4 /*crc*/;
        self.file.write_u32::<LittleEndian>(record_len)?;
        self.file.write_u32::<LittleEndian>(crc)?;
        self.file.write_all(&buf)?;
        self.file.flush()?;

        if self.sync {
            self.file.sync_all()?;
        }
        Ok(())
    }

    /// Force an fsync regardless of the `sync` flag.
    pub fn sync(&mut self) -> Result<(), WalError> {
        self.file.sync_all()?;
        Ok(())
    }
}

/// WAL reader that yields records in append order. Stops on EOF.
pub struct WalReader<R: Read> {
    rdr: BufReader<R>,
}

impl WalReader<File> {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<WalReader<File>, WalError> {
        let f = File::open(path)?;
        Ok(WalReader {
            rdr: BufReader::new(f),
        })
    }
}

impl<R: Read> WalReader<R> {
    pub fn from_reader(reader: R) -> Self {
        WalReader {
            rdr: BufReader::new(reader),
        }
    }

    /// Replay every intact record in order.
    ///
    /// A record cut short by a crash mid-append (torn tail) ends replay
    /// cleanly: everything before it was acknowledged with its own fsync
    /// and is returned. A CRC mismatch or an unknown op byte is
    /// [`WalError::Corrupt`].
    pub fn replay<F>(&mut self, mut apply: F) -> Result<(), WalError>
    where
        F: FnMut(WalRecord),
    {
        loop {
            let record_len = match self.rdr.read_u32::<LittleEndian>() {
                Ok(v) => v,
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(()),
                Err(e) => return Err(WalError::Io(e)),
            };
            if record_len < 4 {
                return Err(WalError::Corrupt);
            }
            let crc = match self.rdr.read_u32::<LittleEndian>() {
                Ok(v) => v,
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(()),
                Err(e) => return Err(WalError::Io(e)),
            };
            let mut body = vec![0u8; (record_len - 4) as usize];
            match self.rdr.read_exact(&mut body) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(()),
                Err(e) => return Err(WalError::Io(e)),
            }

            let mut hasher = Crc32::new();
            hasher.update(&body);
            if hasher.finalize() != crc {
                return Err(WalError::Corrupt);
            }

            let mut br = &body[..];
            let op = br.read_u8()?;
            let key_len = br.read_u32::<LittleEndian>()?;
            let mut key = vec![0u8; key_len as usize];
            br.read_exact(&mut key)?;
            match op {
                0 => {
                    let val_len = br.read_u32::<LittleEndian>()?;
                    let mut val = vec![0u8; val_len as usize];
                    br.read_exact(&mut val)?;
                    apply(WalRecord::Put { key, value: val });
                }
                1 => {
                    apply(WalRecord::Del { key });
                }
                _ => {
                    return Err(WalError::Corrupt);
                }
            }
        }
    }
}
