use serde::{Deserialize, Serialize};

/// One binary megabyte.
pub const MIB: u64 = 1024 * 1024;

/// Tunables for choosing between a single PUT and a multipart upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StrategyConfig {
    /// Files of at least this many bytes use multipart.
    pub multipart_threshold: u64,
    pub min_part_size: u64,
    pub max_part_size: u64,
    /// Number of parts the part size aims for before clamping.
    pub target_part_count: u64,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            multipart_threshold: 16 * MIB,
            min_part_size: 5 * MIB,
            max_part_size: 64 * MIB,
            target_part_count: 6,
        }
    }
}

impl StrategyConfig {
    /// Computes the multipart part size for a file of `size` bytes.
    ///
    /// `ceil(size / target_part_count)`, rounded up to a whole MiB, then
    /// clamped into `[min_part_size, max_part_size]`.
    pub fn part_size_for(&self, size: u64) -> u64 {
        let target = self.target_part_count.max(1);
        let raw = size.div_ceil(target);
        let rounded = raw.div_ceil(MIB).saturating_mul(MIB);
        let max = self.max_part_size.max(self.min_part_size).max(1);
        rounded.clamp(self.min_part_size.max(1), max)
    }
}

/// How a file will be moved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStrategy {
    Single,
    Multipart { part_size: u64 },
}

/// Picks the transfer strategy for a file of `size` bytes.
pub fn select_strategy(size: u64, config: &StrategyConfig) -> TransferStrategy {
    if size < config.multipart_threshold {
        TransferStrategy::Single
    } else {
        TransferStrategy::Multipart {
            part_size: config.part_size_for(size),
        }
    }
}

/// Half-open byte range `[start, end)` within a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Number of parts of `part_size` bytes needed to cover `size` bytes.
///
/// An empty file still occupies one (empty) part.
pub fn part_count(size: u64, part_size: u64) -> u64 {
    if part_size == 0 {
        return 0;
    }
    size.div_ceil(part_size).max(1)
}

/// Byte range of the 1-based `part_number`. The final part may be short.
pub fn part_range(part_number: u32, part_size: u64, size: u64) -> ByteRange {
    let start = u64::from(part_number.saturating_sub(1))
        .saturating_mul(part_size)
        .min(size);
    let end = start.saturating_add(part_size).min(size);
    ByteRange::new(start, end)
}
