//! # EmberKV engine
//!
//! The LSM coordinator: one WAL-backed [`Memtable`] in front of a
//! newest-first stack of immutable [`SstReader`]s.
//!
//! Writes go to the memtable (WAL-first); when it fills, it is flushed to a
//! new SSTable and a fresh memtable takes over. Reads check the memtable,
//! then each SSTable from newest to oldest — the first hit wins, and a
//! tombstone hit is a definitive "not present". [`compact`](Engine::compact)
//! merges the two oldest SSTables into one, with the newer input winning on
//! key collisions and tombstones preserved.
//!
//! All state sits behind a single readers–writer lock: [`get`](Engine::get)
//! takes it shared, everything else exclusive. The compaction merge itself
//! runs outside the lock — the inputs are immutable — and only the final
//! table swap re-acquires it.
//!
//! One engine instance exclusively owns its directory; running two engines
//! over the same directory is undefined behavior.

use std::cmp::Ordering;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use memtable::{Memtable, Value};
use sstable::{SstReader, SstWriter};

mod config;

pub use config::{Config, DEFAULT_MAX_MEMTABLE_BYTES};

/// Filename of the active memtable's log, deleted and recreated at each flush.
const WAL_FILE: &str = "active.wal";

/// Embeddable ordered key-value store.
///
/// Shared references suffice for every operation, so an `Engine` can be
/// wrapped in an `Arc` and driven from multiple threads. Writers to the
/// same key resolve by lock acquisition order; the last writer wins.
pub struct Engine {
    dir: PathBuf,
    max_memtable_bytes: usize,
    inner: RwLock<Inner>,
}

struct Inner {
    memtable: Memtable,
    /// Newest first: `tables[0]` shadows `tables[1]`, and so on.
    tables: Vec<Arc<SstReader>>,
    /// Latch preventing overlapping compactions while the merge runs
    /// outside the lock.
    compacting: bool,
}

impl Engine {
    /// Opens the engine in `config.dir`, creating the directory if absent.
    ///
    /// Existing SSTables are loaded newest-first (filenames embed a
    /// zero-padded nanosecond timestamp, so lexicographically greater means
    /// newer). Files that fail format validation — e.g. a flush that
    /// crashed before writing its footer — are skipped with a warning.
    /// Leftover `active.wal` records are replayed into the fresh memtable
    /// before any write is accepted.
    pub fn open(config: Config) -> Result<Engine> {
        let dir = config.dir;
        fs::create_dir_all(&dir)
            .with_context(|| format!("create database directory {}", dir.display()))?;

        let mut sst_paths: Vec<PathBuf> = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            match path.extension().and_then(|e| e.to_str()) {
                Some("sst") => sst_paths.push(path),
                Some("tmp") => {
                    // Output of a compaction that never committed.
                    debug!(path = %path.display(), "removing orphaned temp file");
                    fs::remove_file(&path)?;
                }
                _ => {}
            }
        }
        sst_paths.sort();
        sst_paths.reverse(); // newest first

        let mut tables = Vec::new();
        for path in sst_paths {
            match SstReader::open(&path) {
                Ok(reader) => tables.push(Arc::new(reader)),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping invalid sstable")
                }
            }
        }

        let memtable = Memtable::open(dir.join(WAL_FILE), config.max_memtable_bytes)?;
        if !memtable.is_empty() {
            info!(
                entries = memtable.len(),
                "recovered memtable from write-ahead log"
            );
        }
        debug!(dir = %dir.display(), tables = tables.len(), "engine opened");

        Ok(Engine {
            dir,
            max_memtable_bytes: config.max_memtable_bytes,
            inner: RwLock::new(Inner {
                memtable,
                tables,
                compacting: false,
            }),
        })
    }

    /// Inserts or updates a key-value pair.
    ///
    /// The write is durable once this returns. If it fills the memtable,
    /// the flush runs synchronously before the call returns.
    pub fn put(&self, key: Vec<u8>, value: Vec<u8>) -> Result<()> {
        let mut inner = self.inner.write();
        inner.memtable.put(key, value)?;
        if inner.memtable.is_full() {
            self.flush_locked(&mut inner)?;
        }
        Ok(())
    }

    /// Looks up a key: memtable first, then SSTables newest to oldest.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let inner = self.inner.read();

        if let Some(value) = inner.memtable.get(key) {
            return Ok(value.as_live().map(|v| v.to_vec()));
        }

        for table in &inner.tables {
            match table.get(key)? {
                Some(Value::Live(v)) => return Ok(Some(v)),
                // A tombstone shadows every older table below it.
                Some(Value::Tombstone) => return Ok(None),
                None => {}
            }
        }
        Ok(None)
    }

    /// Deletes a key by writing a tombstone.
    ///
    /// The tombstone is WAL-durable and shadows any older value in any
    /// lower SSTable, whether or not the key currently exists.
    pub fn delete(&self, key: Vec<u8>) -> Result<()> {
        let mut inner = self.inner.write();
        inner.memtable.delete(key)?;
        Ok(())
    }

    /// Number of live SSTables.
    pub fn table_count(&self) -> usize {
        self.inner.read().tables.len()
    }

    /// Flushes the current memtable to an SSTable regardless of fullness.
    /// A no-op on an empty memtable.
    pub fn flush(&self) -> Result<()> {
        let mut inner = self.inner.write();
        self.flush_locked(&mut inner)
    }

    /// Merges the two oldest SSTables into one. No-op with fewer than two
    /// tables or while another compaction is in flight.
    ///
    /// The merge itself runs without holding the lock — the inputs are
    /// immutable, and new flushes may prepend tables in the meantime. The
    /// lock is re-acquired only to swap the merged table in. The output
    /// takes over the newer input's filename (via a temp file and an atomic
    /// rename), so its position in filename order survives a restart; the
    /// older input's file is then deleted.
    pub fn compact(&self) -> Result<()> {
        let (older, newer) = {
            let mut inner = self.inner.write();
            if inner.tables.len() < 2 || inner.compacting {
                return Ok(());
            }
            inner.compacting = true;
            let n = inner.tables.len();
            (Arc::clone(&inner.tables[n - 1]), Arc::clone(&inner.tables[n - 2]))
        };

        let result = self.merge_and_swap(&older, &newer);
        self.inner.write().compacting = false;
        result
    }

    /// Closes the engine: fsyncs and closes the memtable's WAL and drops
    /// every SSTable reader. Consuming `self` makes use-after-close a
    /// compile error.
    pub fn close(self) -> Result<()> {
        let inner = self.inner.into_inner();
        inner.memtable.close()?;
        Ok(())
    }

    /// Writes the memtable out as a new SSTable and retires its WAL.
    /// Runs under the exclusive lock.
    fn flush_locked(&self, inner: &mut Inner) -> Result<()> {
        if inner.memtable.is_empty() {
            return Ok(());
        }

        let sst_path = self.next_sst_path()?;
        let mut writer = SstWriter::create(&sst_path)?;
        for (key, value) in inner.memtable.iter() {
            writer.add(key, value)?;
        }
        let entries = writer.len();
        writer.finish()?;

        let reader = SstReader::open(&sst_path)
            .with_context(|| format!("reopen flushed sstable {}", sst_path.display()))?;
        inner.tables.insert(0, Arc::new(reader)); // newest first

        // Every record in the WAL now lives in the SSTable; retire it and
        // start a fresh memtable at the same path.
        let wal_path = inner.memtable.wal_path().to_path_buf();
        fs::remove_file(&wal_path)?;
        let fresh = Memtable::open(&wal_path, self.max_memtable_bytes)?;
        let old = std::mem::replace(&mut inner.memtable, fresh);
        old.close()?;

        info!(path = %sst_path.display(), entries, "flushed memtable to sstable");
        Ok(())
    }

    /// Streaming two-way merge of the two oldest tables, then the swap.
    fn merge_and_swap(&self, older: &SstReader, newer: &SstReader) -> Result<()> {
        let tmp_path = newer.path().with_extension("sst.tmp");

        let merge = || -> Result<usize> {
            let mut writer = SstWriter::create(&tmp_path)?;

            let mut scan_a = older.scan()?;
            let mut scan_b = newer.scan()?;
            let mut next_a = scan_a.next().transpose()?;
            let mut next_b = scan_b.next().transpose()?;

            loop {
                match (next_a.take(), next_b.take()) {
                    (None, None) => break,
                    (Some((k, v)), None) => {
                        writer.add(&k, &v)?;
                        next_a = scan_a.next().transpose()?;
                    }
                    (None, Some((k, v))) => {
                        writer.add(&k, &v)?;
                        next_b = scan_b.next().transpose()?;
                    }
                    (Some((ka, va)), Some((kb, vb))) => match ka.cmp(&kb) {
                        Ordering::Less => {
                            writer.add(&ka, &va)?;
                            next_a = scan_a.next().transpose()?;
                            next_b = Some((kb, vb));
                        }
                        Ordering::Greater => {
                            writer.add(&kb, &vb)?;
                            next_b = scan_b.next().transpose()?;
                            next_a = Some((ka, va));
                        }
                        Ordering::Equal => {
                            // Newer input wins; the older version is dropped.
                            // Tombstones are kept: an even older table may
                            // still hold the key.
                            writer.add(&kb, &vb)?;
                            next_a = scan_a.next().transpose()?;
                            next_b = scan_b.next().transpose()?;
                        }
                    },
                }
            }

            let entries = writer.len();
            writer.finish()?;
            Ok(entries)
        };

        let entries = match merge() {
            Ok(entries) => entries,
            Err(e) => {
                let _ = fs::remove_file(&tmp_path);
                return Err(e);
            }
        };

        // Commit: retire the two inputs and slot the merged table in as the
        // oldest entry, under the newer input's name. The rename is the
        // commit point — before it, any error leaves the pre-compaction
        // state fully intact.
        let mut inner = self.inner.write();
        let newer_path = newer.path();
        if let Err(e) = fs::rename(&tmp_path, newer_path) {
            let _ = fs::remove_file(&tmp_path);
            return Err(e.into());
        }
        let n = inner.tables.len();
        inner.tables.truncate(n - 2);

        let merged = SstReader::open(newer_path)
            .with_context(|| format!("reopen compacted sstable {}", newer_path.display()))?;
        inner.tables.push(Arc::new(merged));

        // The older file's every key is shadowed by the merged table, so a
        // failure here is not fatal: the next startup reads a consistent
        // (if redundant) set of tables.
        if let Err(e) = fs::remove_file(older.path()) {
            warn!(path = %older.path().display(), error = %e, "could not remove retired sstable");
        }

        info!(
            older = %older.path().display(),
            output = %newer_path.display(),
            entries,
            "compacted two oldest sstables"
        );
        Ok(())
    }

    /// Next flush output path: a zero-padded nanosecond timestamp, so
    /// lexicographic filename order matches age. On a collision the
    /// timestamp is bumped until the name is free.
    fn next_sst_path(&self) -> Result<PathBuf> {
        let mut nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .context("system clock before unix epoch")?
            .as_nanos();
        loop {
            let path = self.dir.join(format!("{:020}.sst", nanos));
            if !path.exists() {
                return Ok(path);
            }
            nanos += 1;
        }
    }
}
