//! BSDIFF40 patch application.
//!
//! Layout: a 32-byte header (`BSDIFF40`, control block length, diff block
//! length, new file size) followed by three bzip2 streams: control triples,
//! diff bytes (added to the old bytes) and extra bytes (copied verbatim).
//! Integers are 8-byte sign-magnitude little-endian.

use crate::error::{Error, Result};

use bzip2::read::BzDecoder;
use std::io::Read;

pub const MAGIC: &[u8; 8] = b"BSDIFF40";

const HEADER_LEN: usize = 32;

/// Upfront reservation cap; the output grows past it only as blocks decode.
const PREALLOC_LIMIT: usize = 64 * 1024 * 1024;

/// Decode a sign-magnitude 64-bit integer.
fn offtin(buf: &[u8]) -> i64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[..8]);
    let negative = bytes[7] & 0x80 != 0;
    bytes[7] &= 0x7f;
    let magnitude = i64::from_le_bytes(bytes);
    if negative {
        -magnitude
    } else {
        magnitude
    }
}

fn corrupt(msg: impl Into<String>) -> Error {
    Error::PatchCorrupt(format!("bsdiff: {}", msg.into()))
}

fn read_exact(reader: &mut impl Read, buf: &mut [u8], what: &str) -> Result<()> {
    reader
        .read_exact(buf)
        .map_err(|e| corrupt(format!("reading {}: {}", what, e)))
}

/// Append exactly `len` decoded bytes to `out`, growing it as data arrives.
fn read_block(reader: &mut impl Read, out: &mut Vec<u8>, len: usize, what: &str) -> Result<()> {
    let read = reader
        .by_ref()
        .take(len as u64)
        .read_to_end(out)
        .map_err(|e| corrupt(format!("reading {}: {}", what, e)))?;
    if read != len {
        return Err(corrupt(format!("{} truncated", what)));
    }
    Ok(())
}

/// Apply a BSDIFF40 patch to `old`.
pub fn apply(old: &[u8], patch: &[u8]) -> Result<Vec<u8>> {
    if patch.len() < HEADER_LEN || &patch[..8] != MAGIC {
        return Err(corrupt("missing BSDIFF40 header"));
    }
    let ctrl_len = offtin(&patch[8..16]);
    let diff_len = offtin(&patch[16..24]);
    let new_size = offtin(&patch[24..32]);
    if ctrl_len < 0 || diff_len < 0 || new_size < 0 {
        return Err(corrupt("negative length in header"));
    }
    let (ctrl_len, diff_len, new_size) = (ctrl_len as usize, diff_len as usize, new_size as usize);

    let ctrl_end = HEADER_LEN
        .checked_add(ctrl_len)
        .filter(|&end| end <= patch.len())
        .ok_or_else(|| corrupt("control block runs past the end"))?;
    let diff_end = ctrl_end
        .checked_add(diff_len)
        .filter(|&end| end <= patch.len())
        .ok_or_else(|| corrupt("diff block runs past the end"))?;

    let mut ctrl = BzDecoder::new(&patch[HEADER_LEN..ctrl_end]);
    let mut diff = BzDecoder::new(&patch[ctrl_end..diff_end]);
    let mut extra = BzDecoder::new(&patch[diff_end..]);

    let mut new: Vec<u8> = Vec::new();
    new.try_reserve(new_size.min(PREALLOC_LIMIT))
        .map_err(|e| corrupt(format!("cannot allocate output: {}", e)))?;
    let mut old_pos = 0i64;
    let mut triple = [0u8; 24];

    while new.len() < new_size {
        read_exact(&mut ctrl, &mut triple, "control triple")?;
        let add_len = offtin(&triple[0..8]);
        let copy_len = offtin(&triple[8..16]);
        let seek = offtin(&triple[16..24]);
        if add_len < 0 || copy_len < 0 {
            return Err(corrupt("negative block length"));
        }
        let (add_len, copy_len) = (add_len as usize, copy_len as usize);

        if add_len > new_size - new.len() {
            return Err(corrupt("diff block overruns the output"));
        }
        let start = new.len();
        read_block(&mut diff, &mut new, add_len, "diff block")?;
        for (i, byte) in new[start..].iter_mut().enumerate() {
            let old_byte = old_pos
                .checked_add(i as i64)
                .and_then(|idx| usize::try_from(idx).ok())
                .and_then(|idx| old.get(idx));
            if let Some(old_byte) = old_byte {
                *byte = byte.wrapping_add(*old_byte);
            }
        }
        old_pos = old_pos
            .checked_add(add_len as i64)
            .ok_or_else(|| corrupt("old position overflows"))?;

        if copy_len > new_size - new.len() {
            return Err(corrupt("extra block overruns the output"));
        }
        read_block(&mut extra, &mut new, copy_len, "extra block")?;
        old_pos = old_pos
            .checked_add(seek)
            .ok_or_else(|| corrupt("seek overflows the old position"))?;
    }

    Ok(new)
}
