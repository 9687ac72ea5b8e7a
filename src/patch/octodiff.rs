//! OctoDiff binary deltas.
//!
//! OctoDiff is a binary patching format from Octopus Deploy.
//! It stores instructions to transform a "basis" file into a "target" file
//! using two commands:
//! - Copy: read bytes from the basis file
//! - Write: insert new bytes from the delta
//!
//! The header carries the SHA-1 of the target, checked after application.
//!
//! Deltas are built rsync-style: the basis is cut into fixed blocks, each with
//! a rolling Adler-32 weak sum and a SHA-1 strong sum; a window slides over the
//! target and emits a Copy whenever both sums match a block.
//!
//! Reference: https://github.com/OctopusDeploy/Octodiff

use crate::error::{Error, Result};

use binrw::prelude::*;
use rayon::prelude::*;
use sha1::{Digest, Sha1};
use std::collections::HashMap;
use std::io::{Cursor, Read, Seek, SeekFrom};

/// Magic bytes at start of OctoDiff files
pub const MAGIC: &[u8; 9] = b"OCTODELTA";

/// End of metadata marker
const END_MARKER: &[u8; 3] = b">>>";

/// Command byte for Copy instruction
const CMD_COPY: u8 = 0x60;

/// Command byte for Write instruction
const CMD_WRITE: u8 = 0x80;

/// Basis block size used when building deltas.
pub const BLOCK_SIZE: usize = 2048;

const HASH_ALGO: &[u8] = b"SHA1";

/// OctoDiff file header
#[derive(Debug, BinRead, BinWrite)]
#[brw(little, magic = b"OCTODELTA")]
struct Header {
    /// Version (should be 0x01)
    version: u8,

    /// Hash algorithm name length
    hash_algo_len: u8,

    /// Hash algorithm name bytes (typically "SHA1")
    #[br(count = hash_algo_len)]
    hash_algo: Vec<u8>,

    /// Hash length in bytes
    hash_len: i32,

    /// Hash of the expected output file
    #[br(count = hash_len)]
    hash: Vec<u8>,

    /// End of metadata marker
    #[br(assert(end_marker == *END_MARKER, "invalid end marker"))]
    end_marker: [u8; 3],
}

/// A delta command
#[derive(Debug)]
enum Command {
    /// Copy bytes from the basis file
    Copy { offset: u64, length: usize },
    /// Write new bytes from the delta file
    Write { length: usize },
}

fn read_i64<R: Read>(reader: &mut R, what: &str) -> Result<i64> {
    let mut buf = [0u8; 8];
    reader
        .read_exact(&mut buf)
        .map_err(|e| Error::PatchCorrupt(format!("reading {}: {}", what, e)))?;
    Ok(i64::from_le_bytes(buf))
}

fn non_negative(value: i64, what: &str) -> Result<u64> {
    u64::try_from(value).map_err(|_| Error::PatchCorrupt(format!("negative {}: {}", what, value)))
}

/// Read the next command from the delta stream
fn read_command<R: Read>(reader: &mut R) -> Result<Option<Command>> {
    let mut cmd_byte = [0u8; 1];
    match reader.read_exact(&mut cmd_byte) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(Error::PatchCorrupt(format!("reading command byte: {}", e))),
    }

    match cmd_byte[0] {
        CMD_COPY => {
            let offset = non_negative(read_i64(reader, "copy offset")?, "copy offset")?;
            let length = non_negative(read_i64(reader, "copy length")?, "copy length")?;
            Ok(Some(Command::Copy {
                offset,
                length: length as usize,
            }))
        }
        CMD_WRITE => {
            let length = non_negative(read_i64(reader, "write length")?, "write length")?;
            Ok(Some(Command::Write {
                length: length as usize,
            }))
        }
        unknown => Err(Error::PatchCorrupt(format!("unknown command byte: 0x{:02x}", unknown))),
    }
}

/// Applies a delta to produce the target file
///
/// Implements `Read` so you can stream the output without buffering.
/// Call [`verify`](Self::verify) after reading to the end.
pub struct DeltaReader<B: Read + Seek, D: Read + Seek> {
    /// The basis (original) file
    basis: B,
    /// The delta (patch) file
    delta: D,
    /// Current command being processed
    current: Option<CommandState>,
    /// Expected output hash (for verification)
    expected_hash: Vec<u8>,
    hasher: Sha1,
}

/// State for partially-processed command
enum CommandState {
    Copy { remaining: usize },
    Write { remaining: usize },
}

impl<B: Read + Seek, D: Read + Seek> DeltaReader<B, D> {
    /// Create a new delta reader
    ///
    /// - `basis`: The original file to patch
    /// - `delta`: The delta/patch file
    pub fn new(basis: B, mut delta: D) -> Result<Self> {
        let header = Header::read(&mut delta)
            .map_err(|e| Error::PatchCorrupt(format!("reading OctoDiff header: {}", e)))?;

        if header.version != 0x01 {
            return Err(Error::PatchCorrupt(format!(
                "unsupported OctoDiff version: {}",
                header.version
            )));
        }
        if header.hash_algo != HASH_ALGO {
            return Err(Error::PatchCorrupt(format!(
                "unsupported OctoDiff hash algorithm: {}",
                String::from_utf8_lossy(&header.hash_algo)
            )));
        }

        Ok(Self {
            basis,
            delta,
            current: None,
            expected_hash: header.hash,
            hasher: Sha1::new(),
        })
    }

    /// SHA-1 of the target as recorded in the header.
    pub fn expected_hash(&self) -> &[u8] {
        &self.expected_hash
    }

    /// Check the SHA-1 of everything read so far against the header.
    pub fn verify(self) -> Result<()> {
        let actual = self.hasher.finalize();
        if actual.as_slice() == self.expected_hash.as_slice() {
            return Ok(());
        }
        Err(Error::HashMismatch {
            what: format!(
                "OctoDiff output (SHA-1 expected {}, got {})",
                hex(&self.expected_hash),
                hex(&actual)
            ),
            expected: sha1_prefix(&self.expected_hash),
            actual: sha1_prefix(&actual),
        })
    }

    /// Read and set up the next command
    fn advance(&mut self) -> Result<bool> {
        match read_command(&mut self.delta)? {
            Some(Command::Copy { offset, length }) => {
                self.basis
                    .seek(SeekFrom::Start(offset))
                    .map_err(|e| Error::PatchCorrupt(format!("seeking in basis file: {}", e)))?;
                self.current = Some(CommandState::Copy { remaining: length });
                Ok(true)
            }
            Some(Command::Write { length }) => {
                self.current = Some(CommandState::Write { remaining: length });
                Ok(true)
            }
            None => {
                self.current = None;
                Ok(false)
            }
        }
    }
}

impl<B: Read + Seek, D: Read + Seek> Read for DeltaReader<B, D> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        loop {
            // If no current command, try to get the next one
            if self.current.is_none() {
                match self.advance() {
                    Ok(true) => {}
                    Ok(false) => return Ok(0), // EOF
                    Err(e) => return Err(std::io::Error::other(e)),
                }
            }

            let (source, remaining): (&mut dyn Read, &mut usize) = match &mut self.current {
                Some(CommandState::Copy { remaining }) => (&mut self.basis, remaining),
                Some(CommandState::Write { remaining }) => (&mut self.delta, remaining),
                None => continue,
            };
            if *remaining == 0 {
                self.current = None;
                continue;
            }

            let to_read = buf.len().min(*remaining);
            let n = source.read(&mut buf[..to_read])?;
            if n == 0 {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "basis or delta ended early",
                ));
            }
            *remaining -= n;
            if *remaining == 0 {
                self.current = None;
            }
            self.hasher.update(&buf[..n]);
            return Ok(n);
        }
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// First eight bytes of a SHA-1, for reporting through [`Error::HashMismatch`].
fn sha1_prefix(digest: &[u8]) -> crate::hash::Hash {
    let mut bytes = [0u8; 8];
    let n = digest.len().min(8);
    bytes[..n].copy_from_slice(&digest[..n]);
    crate::hash::Hash::new(u64::from_le_bytes(bytes))
}

/// Adler-32 style checksum with 16-bit halves, as OctoDiff uses.
fn weak_sum(block: &[u8]) -> u32 {
    let mut a: u16 = 1;
    let mut b: u16 = 0;
    for &z in block {
        a = a.wrapping_add(z as u16);
        b = b.wrapping_add(a);
    }
    ((b as u32) << 16) | a as u32
}

/// Slide the window one byte: drop `remove`, append `add`.
fn roll(sum: u32, remove: u8, add: u8) -> u32 {
    let mut b = (sum >> 16) as u16;
    let mut a = sum as u16;
    a = a.wrapping_sub(remove as u16).wrapping_add(add as u16);
    b = b
        .wrapping_sub((BLOCK_SIZE as u16).wrapping_mul(remove as u16))
        .wrapping_add(a)
        .wrapping_sub(1);
    ((b as u32) << 16) | a as u32
}

struct Signature {
    /// weak sum -> indices of full-size basis blocks
    by_weak: HashMap<u32, Vec<usize>>,
    strong: Vec<[u8; 20]>,
}

fn signature(basis: &[u8]) -> Signature {
    let blocks: Vec<(u32, [u8; 20])> = basis
        .par_chunks_exact(BLOCK_SIZE)
        .map(|block| (weak_sum(block), Sha1::digest(block).into()))
        .collect();

    let mut by_weak: HashMap<u32, Vec<usize>> = HashMap::new();
    for (idx, (weak, _)) in blocks.iter().enumerate() {
        by_weak.entry(*weak).or_default().push(idx);
    }
    Signature {
        by_weak,
        strong: blocks.into_iter().map(|(_, s)| s).collect(),
    }
}

/// Accumulates commands, merging adjacent copies.
struct DeltaWriter {
    out: Vec<u8>,
    copy: Option<(u64, u64)>,
}

impl DeltaWriter {
    fn copy(&mut self, offset: u64, length: u64) {
        match &mut self.copy {
            Some((start, len)) if *start + *len == offset => *len += length,
            _ => {
                self.flush_copy();
                self.copy = Some((offset, length));
            }
        }
    }

    fn write(&mut self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        self.flush_copy();
        self.out.push(CMD_WRITE);
        self.out.extend_from_slice(&(data.len() as i64).to_le_bytes());
        self.out.extend_from_slice(data);
    }

    fn flush_copy(&mut self) {
        if let Some((offset, length)) = self.copy.take() {
            self.out.push(CMD_COPY);
            self.out.extend_from_slice(&(offset as i64).to_le_bytes());
            self.out.extend_from_slice(&(length as i64).to_le_bytes());
        }
    }

    fn finish(mut self) -> Vec<u8> {
        self.flush_copy();
        self.out
    }
}

/// Build a delta turning `basis` into `target`. Deterministic for equal inputs.
pub fn build_delta(basis: &[u8], target: &[u8]) -> Result<Vec<u8>> {
    let target_hash: [u8; 20] = Sha1::digest(target).into();
    let header = Header {
        version: 0x01,
        hash_algo_len: HASH_ALGO.len() as u8,
        hash_algo: HASH_ALGO.to_vec(),
        hash_len: target_hash.len() as i32,
        hash: target_hash.to_vec(),
        end_marker: *END_MARKER,
    };
    let mut out = Cursor::new(Vec::new());
    header
        .write(&mut out)
        .map_err(|e| Error::PatchCorrupt(format!("writing OctoDiff header: {}", e)))?;

    let sig = signature(basis);
    let mut writer = DeltaWriter {
        out: out.into_inner(),
        copy: None,
    };

    let mut literal_start = 0;
    let mut i = 0;
    let mut weak = if target.len() >= BLOCK_SIZE {
        weak_sum(&target[..BLOCK_SIZE])
    } else {
        0
    };

    while i + BLOCK_SIZE <= target.len() {
        let window = &target[i..i + BLOCK_SIZE];
        let matched = sig.by_weak.get(&weak).and_then(|candidates| {
            let strong: [u8; 20] = Sha1::digest(window).into();
            candidates.iter().copied().find(|&c| sig.strong[c] == strong)
        });

        if let Some(block) = matched {
            writer.write(&target[literal_start..i]);
            writer.copy((block * BLOCK_SIZE) as u64, BLOCK_SIZE as u64);
            i += BLOCK_SIZE;
            literal_start = i;
            if i + BLOCK_SIZE <= target.len() {
                weak = weak_sum(&target[i..i + BLOCK_SIZE]);
            }
            continue;
        }

        if i + BLOCK_SIZE < target.len() {
            weak = roll(weak, target[i], target[i + BLOCK_SIZE]);
        }
        i += 1;
    }
    writer.write(&target[literal_start..]);

    Ok(writer.finish())
}

/// Apply a delta, returning the target bytes. The SHA-1 is verified.
pub fn apply_to_vec(basis: &[u8], delta: &[u8]) -> Result<Vec<u8>> {
    let mut reader = DeltaReader::new(Cursor::new(basis), Cursor::new(delta))?;
    let mut out = Vec::new();
    reader
        .read_to_end(&mut out)
        .map_err(|e| Error::PatchCorrupt(e.to_string()))?;
    reader.verify()?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pseudo_random(len: usize, seed: u64) -> Vec<u8> {
        let mut state = seed.wrapping_mul(6364136223846793005).wrapping_add(1);
        (0..len)
            .map(|_| {
                state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
                (state >> 33) as u8
            })
            .collect()
    }

    #[test]
    fn test_header_parsing() {
        // Minimal valid OctoDiff header
        let mut data = Vec::new();
        data.extend_from_slice(MAGIC); // Magic
        data.push(0x01); // Version
        data.push(4); // Hash algo name length
        data.extend_from_slice(b"SHA1"); // Hash algo name
        data.extend_from_slice(&20i32.to_le_bytes()); // Hash length
        data.extend_from_slice(&[0u8; 20]); // Hash (zeros)
        data.extend_from_slice(END_MARKER); // End marker

        let header = Header::read(&mut Cursor::new(&data)).unwrap();
        assert_eq!(header.version, 0x01);
        assert_eq!(&header.hash_algo, b"SHA1");
        assert_eq!(header.hash.len(), 20);
    }

    #[test]
    fn test_rolling_sum_matches_direct() {
        let data = pseudo_random(BLOCK_SIZE + 100, 7);
        let mut sum = weak_sum(&data[..BLOCK_SIZE]);
        for i in 0..100 {
            sum = roll(sum, data[i], data[i + BLOCK_SIZE]);
            assert_eq!(sum, weak_sum(&data[i + 1..i + 1 + BLOCK_SIZE]), "offset {}", i + 1);
        }
    }

    #[test]
    fn test_shifted_content_reuses_basis_blocks() -> Result<()> {
        let basis = pseudo_random(BLOCK_SIZE * 20, 1);
        let mut target = b"a few inserted bytes".to_vec();
        target.extend_from_slice(&basis[..BLOCK_SIZE * 10]);
        target.extend_from_slice(&pseudo_random(500, 2));
        target.extend_from_slice(&basis[BLOCK_SIZE * 12..]);

        let delta = build_delta(&basis, &target)?;
        assert!(delta.starts_with(MAGIC));
        // Mostly copies: far smaller than the target
        assert!(delta.len() < target.len() / 10, "delta is {} bytes", delta.len());
        assert_eq!(apply_to_vec(&basis, &delta)?, target);
        Ok(())
    }

    #[test]
    fn test_unrelated_and_empty_inputs() -> Result<()> {
        let basis = pseudo_random(5000, 3);
        let target = pseudo_random(7000, 4);
        assert_eq!(apply_to_vec(&basis, &build_delta(&basis, &target)?)?, target);
        assert_eq!(apply_to_vec(&basis, &build_delta(&basis, &[])?)?, Vec::<u8>::new());
        assert_eq!(apply_to_vec(&[], &build_delta(&[], &target)?)?, target);
        Ok(())
    }

    #[test]
    fn test_build_is_deterministic() -> Result<()> {
        let basis = pseudo_random(BLOCK_SIZE * 8, 5);
        let mut target = basis.clone();
        target[3000] ^= 0xff;
        assert_eq!(build_delta(&basis, &target)?, build_delta(&basis, &target)?);
        Ok(())
    }

    #[test]
    fn test_wrong_basis_fails_verification() -> Result<()> {
        let basis = pseudo_random(BLOCK_SIZE * 4, 6);
        let target = basis[BLOCK_SIZE..].to_vec();
        let delta = build_delta(&basis, &target)?;

        let mut other = basis.clone();
        other[BLOCK_SIZE + 10] ^= 1;
        assert!(matches!(
            apply_to_vec(&other, &delta),
            Err(Error::HashMismatch { .. })
        ));
        Ok(())
    }

    #[test]
    fn test_unknown_command_is_corrupt() -> Result<()> {
        let mut delta = build_delta(b"", b"")?;
        delta.push(0x42);
        assert!(matches!(apply_to_vec(b"", &delta), Err(Error::PatchCorrupt(_))));
        Ok(())
    }
}
