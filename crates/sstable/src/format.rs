//! SSTable binary format constants and footer read/write helpers.
//!
//! The footer is always the **last 8 bytes** of an SSTable file:
//!
//! ```text
//! [index_offset: u64 LE]
//! ```

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Result as IoResult, Seek, SeekFrom, Write};

/// Record type byte for a live key-value pair.
pub const TYPE_LIVE: u8 = 0;

/// Record type byte for a tombstone (deletion marker).
pub const TYPE_TOMBSTONE: u8 = 1;

/// Size of the footer in bytes: 8 (`index_offset`).
pub const FOOTER_BYTES: u64 = 8;

/// Size of a data record header: type (1) + key_len (4) + value_len (4).
pub const RECORD_HEADER_BYTES: u64 = 9;

/// Returns the byte offset where the footer starts: `filesize - 8`.
///
/// Uses [`u64::saturating_sub`] so files smaller than 8 bytes return 0
/// rather than underflowing.
pub fn footer_pos(filesize: u64) -> u64 {
    filesize.saturating_sub(FOOTER_BYTES)
}

/// Writes the SSTable footer (`index_offset`) to `w`.
pub fn write_footer<W: Write>(w: &mut W, index_offset: u64) -> IoResult<()> {
    w.write_u64::<LittleEndian>(index_offset)?;
    Ok(())
}

/// Reads the SSTable footer from `r`, returning `(index_offset, filesize)`.
///
/// The reader is seeked to the end to determine file size, then to the
/// footer position. After this call the cursor is at the end of the file.
pub fn read_footer<R: Read + Seek>(r: &mut R) -> IoResult<(u64, u64)> {
    let filesize = r.seek(SeekFrom::End(0))?;
    r.seek(SeekFrom::Start(footer_pos(filesize)))?;
    let index_offset = r.read_u64::<LittleEndian>()?;
    Ok((index_offset, filesize))
}
