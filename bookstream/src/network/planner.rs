//! Chunk sizing for progressive range loads.

use super::probe::ConnectionClass;
use super::transport::ByteRange;

const KB: u64 = 1024;
const MB: u64 = 1024 * KB;

/// Smallest chunk ever planned.
pub const MIN_CHUNK_BYTES: u64 = 64 * KB;

/// Largest chunk ever planned.
pub const MAX_CHUNK_BYTES: u64 = 2 * MB;

/// Pure chunk-size policy.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChunkPlanner;

impl ChunkPlanner {
    /// Chunk size for a resource of `total_bytes` on a `class` connection.
    ///
    /// | total       | slow   | medium | fast   |
    /// |-------------|--------|--------|--------|
    /// | < 1 MB      | 64 KB  | 64 KB  | 64 KB  |
    /// | 1 – 10 MB   | 128 KB | 256 KB | 256 KB |
    /// | >= 10 MB    | 256 KB | 512 KB | 2 MB   |
    pub fn plan(total_bytes: u64, class: ConnectionClass) -> u64 {
        if total_bytes < MB {
            MIN_CHUNK_BYTES
        } else if total_bytes < 10 * MB {
            match class {
                ConnectionClass::Slow => 128 * KB,
                ConnectionClass::Medium | ConnectionClass::Fast => 256 * KB,
            }
        } else {
            match class {
                ConnectionClass::Slow => 256 * KB,
                ConnectionClass::Medium => 512 * KB,
                ConnectionClass::Fast => MAX_CHUNK_BYTES,
            }
        }
    }

    /// Number of chunks needed to cover `total_bytes`.
    pub fn chunk_count(total_bytes: u64, chunk_bytes: u64) -> u64 {
        if chunk_bytes == 0 {
            return 0;
        }
        total_bytes.div_ceil(chunk_bytes)
    }

    /// Inclusive byte range of chunk `index`, `None` past the end.
    pub fn chunk_range(index: u64, chunk_bytes: u64, total_bytes: u64) -> Option<ByteRange> {
        let start = index.checked_mul(chunk_bytes)?;
        if start >= total_bytes {
            return None;
        }
        let end = (start + chunk_bytes).min(total_bytes) - 1;
        Some(ByteRange::new(start, end))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_table() {
        use ConnectionClass::*;
        let cases = [
            (0, Slow, 64 * KB),
            (MB - 1, Fast, 64 * KB),
            (MB, Slow, 128 * KB),
            (MB, Medium, 256 * KB),
            (10 * MB - 1, Fast, 256 * KB),
            (10 * MB, Slow, 256 * KB),
            (10 * MB, Medium, 512 * KB),
            (10 * MB, Fast, 2 * MB),
            (500 * MB, Fast, 2 * MB),
        ];
        for (total, class, expected) in cases {
            assert_eq!(ChunkPlanner::plan(total, class), expected, "{} {}", total, class);
        }
    }

    #[test]
    fn test_plan_stays_within_bounds() {
        for total in [0, 1, MB, 5 * MB, 10 * MB, 1024 * MB] {
            for class in [ConnectionClass::Slow, ConnectionClass::Medium, ConnectionClass::Fast] {
                let chunk = ChunkPlanner::plan(total, class);
                assert!((MIN_CHUNK_BYTES..=MAX_CHUNK_BYTES).contains(&chunk));
            }
        }
    }

    #[test]
    fn test_chunk_ranges_cover_total_exactly() {
        let total = 1_000_000;
        let chunk = 256 * KB;
        let count = ChunkPlanner::chunk_count(total, chunk);
        assert_eq!(count, 4);

        let last = ChunkPlanner::chunk_range(count - 1, chunk, total).unwrap();
        assert_eq!(last.end, total - 1);
        assert!(ChunkPlanner::chunk_range(count, chunk, total).is_none());

        let covered: u64 = (0..count)
            .map(|i| ChunkPlanner::chunk_range(i, chunk, total).unwrap().len())
            .sum();
        assert_eq!(covered, total);
    }
}
