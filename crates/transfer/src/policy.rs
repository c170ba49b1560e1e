use std::ops::Range;

use serde::{Deserialize, Serialize};

use crate::{DEFAULT_CHUNK_SIZE, TransferError};

/// Unit multiplier of a configured chunk size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChunkUnit {
    #[serde(rename = "byte")]
    Byte,
    #[serde(rename = "kibibyte")]
    Kibibyte,
    #[serde(rename = "mebibyte")]
    Mebibyte,
}

impl ChunkUnit {
    pub fn bytes(&self) -> u64 {
        match self {
            ChunkUnit::Byte => 1,
            ChunkUnit::Kibibyte => 1024,
            ChunkUnit::Mebibyte => 1024 * 1024,
        }
    }
}

/// Configured chunk size as `size × unit`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkSize {
    pub size: u64,
    pub unit: ChunkUnit,
}

impl ChunkSize {
    pub fn new(size: u64, unit: ChunkUnit) -> Self {
        Self { size, unit }
    }

    pub fn bytes(size: u64) -> Self {
        Self::new(size, ChunkUnit::Byte)
    }

    /// Size in bytes.
    pub fn value(&self) -> u64 {
        self.size.saturating_mul(self.unit.bytes())
    }
}

impl Default for ChunkSize {
    fn default() -> Self {
        Self::new(DEFAULT_CHUNK_SIZE / ChunkUnit::Mebibyte.bytes(), ChunkUnit::Mebibyte)
    }
}

/// Maps file sizes and offsets to fixed-size chunk boundaries.
///
/// Both the request planner ("how many requests") and the byte reader
/// ("which range") go through this type so they cannot disagree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkPolicy {
    chunk_size: u64,
}

impl ChunkPolicy {
    pub fn new(chunk_size: ChunkSize) -> Result<Self, TransferError> {
        let chunk_size = chunk_size.value();
        if chunk_size == 0 {
            return Err(TransferError::InvalidChunkSize);
        }
        Ok(Self { chunk_size })
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    /// `ceil(file_size / chunk_size)`.
    pub fn chunk_count(&self, file_size: u64) -> usize {
        file_size.div_ceil(self.chunk_size) as usize
    }

    /// Byte range `[i·C, min((i+1)·C, F))` of chunk `index`.
    ///
    /// An index past the last chunk yields an empty range at `file_size`.
    pub fn chunk_range(&self, file_size: u64, index: usize) -> Range<u64> {
        let start = (index as u64)
            .saturating_mul(self.chunk_size)
            .min(file_size);
        let end = start.saturating_add(self.chunk_size).min(file_size);
        start..end
    }

    /// All chunk ranges of a file, in order.
    pub fn ranges(&self, file_size: u64) -> impl Iterator<Item = Range<u64>> + '_ {
        (0..self.chunk_count(file_size)).map(move |i| self.chunk_range(file_size, i))
    }

    /// Index of the chunk starting at `offset`.
    ///
    /// The offset must sit exactly on a chunk boundary: anything else means
    /// the server reported an offset this client never produced.
    pub fn chunk_index(&self, offset: u64) -> Result<usize, TransferError> {
        if offset % self.chunk_size != 0 {
            return Err(TransferError::MisalignedOffset {
                offset,
                chunk_size: self.chunk_size,
            });
        }
        Ok((offset / self.chunk_size) as usize)
    }

    /// Length of the chunk that starts at `offset`.
    pub fn chunk_len_at(&self, file_size: u64, offset: u64) -> u64 {
        file_size.saturating_sub(offset).min(self.chunk_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(size: u64) -> ChunkPolicy {
        ChunkPolicy::new(ChunkSize::bytes(size)).unwrap()
    }

    #[test]
    fn chunk_size_units() {
        assert_eq!(ChunkSize::new(3, ChunkUnit::Kibibyte).value(), 3072);
        assert_eq!(ChunkSize::new(2, ChunkUnit::Mebibyte).value(), 2 * 1048576);
        assert_eq!(ChunkSize::default().value(), DEFAULT_CHUNK_SIZE);
    }

    #[test]
    fn zero_chunk_size_rejected() {
        let err = ChunkPolicy::new(ChunkSize::bytes(0)).unwrap_err();
        assert!(matches!(err, TransferError::InvalidChunkSize));
    }

    #[test]
    fn chunk_count_is_ceiling() {
        let p = policy(100);
        assert_eq!(p.chunk_count(0), 0);
        assert_eq!(p.chunk_count(1), 1);
        assert_eq!(p.chunk_count(100), 1);
        assert_eq!(p.chunk_count(150), 2);
        assert_eq!(p.chunk_count(250), 3);
        assert_eq!(p.chunk_count(300), 3);
    }

    #[test]
    fn ranges_cover_file_without_gaps() {
        for chunk in [1u64, 7, 64, 100, 1000] {
            let p = policy(chunk);
            for file_size in [0u64, 1, 99, 100, 101, 250, 999, 4096] {
                let ranges: Vec<_> = p.ranges(file_size).collect();
                assert_eq!(ranges.len(), p.chunk_count(file_size));
                let mut next = 0;
                for r in &ranges {
                    assert_eq!(r.start, next, "gap or overlap at {next}");
                    assert!(r.end > r.start);
                    assert!(r.end - r.start <= chunk);
                    next = r.end;
                }
                assert_eq!(next, file_size);
            }
        }
    }

    #[test]
    fn last_chunk_is_short() {
        let p = policy(100);
        assert_eq!(p.chunk_range(250, 0), 0..100);
        assert_eq!(p.chunk_range(250, 2), 200..250);
        assert_eq!(p.chunk_range(250, 5), 250..250);
    }

    #[test]
    fn chunk_index_requires_boundary() {
        let p = policy(100);
        assert_eq!(p.chunk_index(0).unwrap(), 0);
        assert_eq!(p.chunk_index(200).unwrap(), 2);
        let err = p.chunk_index(150).unwrap_err();
        assert!(matches!(
            err,
            TransferError::MisalignedOffset {
                offset: 150,
                chunk_size: 100
            }
        ));
    }

    #[test]
    fn chunk_len_at_offset() {
        let p = policy(100);
        assert_eq!(p.chunk_len_at(150, 0), 100);
        assert_eq!(p.chunk_len_at(150, 100), 50);
        assert_eq!(p.chunk_len_at(150, 150), 0);
    }

    #[test]
    fn chunk_size_serde_names() {
        let json = serde_json::to_string(&ChunkSize::new(5, ChunkUnit::Mebibyte)).unwrap();
        assert_eq!(json, r#"{"size":5,"unit":"mebibyte"}"#);
    }
}
