//! Syntax-tree parse stage support.
//!
//! Parsing itself is a collaborator behind [`UastParser`]; this module owns
//! the gating (language support, blob size cap), the bounded parallelism
//! policy, and the spill path that keeps huge commits from holding every
//! parse resident at once.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crc32fast::Hasher;

use crate::error::{EngineError, Result};
use crate::memory::trim_native_allocator;
use crate::model::ObjectHash;

/// Largest blob the parse stage will consider.
pub const MAX_PARSE_BLOB_SIZE: usize = 256 * 1024;
/// Commits touching more files than this spill parses to disk.
pub const UAST_SPILL_THRESHOLD: usize = 32;
/// A native-allocator trim is requested every this many spilled files.
pub const UAST_SPILL_TRIM_INTERVAL: usize = 16;
/// Commits with at most this many changes parse sequentially.
pub const PARSE_SEQUENTIAL_MAX: usize = 4;
/// Upper bound on concurrent parses for one commit.
pub const MAX_PARALLEL_PARSES: usize = 4;

/// An opaque parsed syntax tree. Holds native memory accounted by
/// `byte_size`; released when the last reference drops.
pub trait SyntaxTree: Send + Sync {
    /// Resident size of the parse, in bytes.
    fn byte_size(&self) -> usize;
    /// Serialize for spill-to-disk.
    fn to_bytes(&self) -> Result<Vec<u8>>;
}

/// Language detection + parsing collaborator.
pub trait UastParser: Send + Sync {
    /// Whether `path` belongs to a supported language.
    fn supports(&self, path: &str) -> bool;
    /// Parse `blob` as the contents of `path`.
    fn parse(&self, path: &str, blob: &[u8]) -> Result<Arc<dyn SyntaxTree>>;
}

/// Whether this change should be parsed at all.
pub fn should_parse(parser: &dyn UastParser, path: &str, blob_size: usize) -> bool {
    blob_size <= MAX_PARSE_BLOB_SIZE && parser.supports(path)
}

/// One serialized spill record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpilledUast {
    /// Path the parse applied to.
    pub path: String,
    /// Blob that was parsed.
    pub hash: ObjectHash,
    /// Serialized tree payload.
    pub payload: Vec<u8>,
}

/// Streaming writer for spilled parse records.
///
/// Frames are `[path_len u32][path][hash 20][payload_len u32][payload]
/// [crc32 u32]` with the checksum covering everything before it. Each
/// record is written and the in-memory tree released immediately, bounding
/// peak native memory to a single parse.
pub struct UastSpillWriter {
    file: BufWriter<File>,
    path: PathBuf,
    records: usize,
}

impl UastSpillWriter {
    /// Create the spill file at `path`.
    pub fn create(path: PathBuf) -> Result<Self> {
        let file = File::create(&path)?;
        Ok(Self {
            file: BufWriter::new(file),
            path,
            records: 0,
        })
    }

    /// Append one parsed record. Requests a native trim every
    /// [`UAST_SPILL_TRIM_INTERVAL`] records.
    pub fn append(&mut self, path: &str, hash: ObjectHash, tree: &dyn SyntaxTree) -> Result<()> {
        let payload = tree.to_bytes()?;
        let mut hasher = Hasher::new();

        let path_bytes = path.as_bytes();
        let path_len = (path_bytes.len() as u32).to_le_bytes();
        let payload_len = (payload.len() as u32).to_le_bytes();

        for part in [&path_len[..], path_bytes, &hash.0[..], &payload_len[..], &payload[..]] {
            hasher.update(part);
            self.file.write_all(part)?;
        }
        self.file.write_all(&hasher.finalize().to_le_bytes())?;

        self.records += 1;
        if self.records % UAST_SPILL_TRIM_INTERVAL == 0 {
            trim_native_allocator();
        }
        Ok(())
    }

    /// Flush and return the spill path.
    pub fn finish(mut self) -> Result<PathBuf> {
        self.file.flush()?;
        Ok(self.path)
    }

    /// Number of records written so far.
    pub fn records(&self) -> usize {
        self.records
    }
}

/// Read every record back from a spill file, verifying checksums.
pub fn read_spill(path: &Path) -> Result<Vec<SpilledUast>> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut records = Vec::new();

    loop {
        let mut len_buf = [0u8; 4];
        match reader.read_exact(&mut len_buf) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e.into()),
        }
        let path_len = u32::from_le_bytes(len_buf) as usize;

        let mut path_bytes = vec![0u8; path_len];
        reader.read_exact(&mut path_bytes)?;
        let mut hash_bytes = [0u8; 20];
        reader.read_exact(&mut hash_bytes)?;
        let mut payload_len_buf = [0u8; 4];
        reader.read_exact(&mut payload_len_buf)?;
        let payload_len = u32::from_le_bytes(payload_len_buf) as usize;
        let mut payload = vec![0u8; payload_len];
        reader.read_exact(&mut payload)?;
        let mut crc_buf = [0u8; 4];
        reader.read_exact(&mut crc_buf)?;

        let mut hasher = Hasher::new();
        hasher.update(&len_buf);
        hasher.update(&path_bytes);
        hasher.update(&hash_bytes);
        hasher.update(&payload_len_buf);
        hasher.update(&payload);
        if hasher.finalize() != u32::from_le_bytes(crc_buf) {
            return Err(EngineError::Corruption(format!(
                "spill frame checksum mismatch in {}",
                path.display()
            )));
        }

        let record_path = String::from_utf8(path_bytes)
            .map_err(|_| EngineError::Corruption("spill frame path is not UTF-8".into()))?;
        records.push(SpilledUast {
            path: record_path,
            hash: ObjectHash(hash_bytes),
            payload,
        });
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FlatTree(Vec<u8>);

    impl SyntaxTree for FlatTree {
        fn byte_size(&self) -> usize {
            self.0.len()
        }

        fn to_bytes(&self) -> Result<Vec<u8>> {
            Ok(self.0.clone())
        }
    }

    #[test]
    fn spill_round_trip() {
        let dir = tempfile::tempdir().expect("tmpdir");
        let spill_path = dir.path().join("uast-0.bin");
        let mut writer = UastSpillWriter::create(spill_path.clone()).expect("create");
        writer
            .append("src/a.rs", ObjectHash([1; 20]), &FlatTree(vec![9, 9, 9]))
            .expect("append");
        writer
            .append("src/b.rs", ObjectHash([2; 20]), &FlatTree(vec![7]))
            .expect("append");
        assert_eq!(writer.records(), 2);
        let path = writer.finish().expect("finish");

        let records = read_spill(&path).expect("read back");
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].path, "src/a.rs");
        assert_eq!(records[0].payload, vec![9, 9, 9]);
        assert_eq!(records[1].hash, ObjectHash([2; 20]));
    }

    #[test]
    fn corrupted_spill_is_detected() {
        let dir = tempfile::tempdir().expect("tmpdir");
        let spill_path = dir.path().join("uast-1.bin");
        let mut writer = UastSpillWriter::create(spill_path.clone()).expect("create");
        writer
            .append("x.rs", ObjectHash([3; 20]), &FlatTree(vec![1, 2, 3, 4]))
            .expect("append");
        let path = writer.finish().expect("finish");

        // Flip one payload byte.
        let mut bytes = std::fs::read(&path).expect("read file");
        let n = bytes.len();
        bytes[n - 6] ^= 0xFF;
        std::fs::write(&path, bytes).expect("rewrite");

        match read_spill(&path) {
            Err(EngineError::Corruption(message)) => {
                assert!(message.contains("checksum"), "unexpected: {message}")
            }
            other => panic!("expected corruption error, got {other:?}"),
        }
    }

    #[test]
    fn size_cap_gates_parsing() {
        struct RustOnly;
        impl UastParser for RustOnly {
            fn supports(&self, path: &str) -> bool {
                path.ends_with(".rs")
            }
            fn parse(&self, _path: &str, blob: &[u8]) -> Result<Arc<dyn SyntaxTree>> {
                Ok(Arc::new(FlatTree(blob.to_vec())))
            }
        }
        assert!(should_parse(&RustOnly, "a.rs", 1024));
        assert!(!should_parse(&RustOnly, "a.py", 1024));
        assert!(!should_parse(&RustOnly, "a.rs", MAX_PARSE_BLOB_SIZE + 1));
    }
}
