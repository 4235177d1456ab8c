//! # SSTable — Sorted String Table
//!
//! Immutable, on-disk storage files for the EmberKV storage engine.
//!
//! When the in-memory [`memtable::Memtable`] exceeds its size threshold the
//! engine flushes it to disk as an SSTable. SSTables are **write-once,
//! read-many** — once created they are never modified, only superseded by
//! compaction.
//!
//! ## File layout
//!
//! ```text
//! ┌───────────────────────────────────────────────┐
//! │ DATA SECTION (sorted records)                 │
//! │                                               │
//! │ type (u8) | key_len (u32) | value_len (u32)   │
//! │ key | value                                   │
//! │                                               │
//! │ ... repeated for each entry ...               │
//! ├───────────────────────────────────────────────┤
//! │ INDEX SECTION (key → data_offset mapping)     │
//! │                                               │
//! │ key_len (u32) | data_offset (u64) | key       │
//! │                                               │
//! │ ... one dense entry per data record ...       │
//! ├───────────────────────────────────────────────┤
//! │ FOOTER (always last 8 bytes)                  │
//! │                                               │
//! │ index_offset (u64 LE)                         │
//! └───────────────────────────────────────────────┘
//! ```
//!
//! All integers are little-endian. Type 0 is a live value, type 1 a
//! tombstone (written with `value_len == 0`). Records appear in strictly
//! ascending key order, and the index mirrors that order, so lookups
//! binary-search the in-memory index and read a single record.

mod format;
mod reader;
mod writer;

pub use format::{FOOTER_BYTES, RECORD_HEADER_BYTES, TYPE_LIVE, TYPE_TOMBSTONE};
pub use reader::{Scan, SstReader};
pub use writer::SstWriter;
