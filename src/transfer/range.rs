use std::fmt;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Block size used by block-size mode when the caller passes a non-positive one.
pub const DEFAULT_BLOCK_SIZE: i64 = 256 * 1024;

/// Half-open byte interval `[begin, end)`.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Range {
    pub begin: i64,
    pub end: i64,
}

impl Range {
    pub fn new(begin: i64, end: i64) -> Self {
        Self { begin, end }
    }

    /// Remaining length. Negative when `begin` has been pushed past `end`,
    /// which callers treat as done.
    pub fn len(&self) -> i64 {
        self.end - self.begin
    }

    pub fn is_empty(&self) -> bool {
        self.len() <= 0
    }

    /// Cuts the range at its midpoint and returns the upper half, keeping the
    /// lower half in place. Nothing changes when the upper half would be
    /// shorter than `floor`.
    pub fn split_half(&mut self, floor: i64) -> Option<Range> {
        let middle = (self.begin + self.end) / 2;
        if middle <= self.begin || self.end - middle < floor {
            return None;
        }
        let upper = Range::new(middle, self.end);
        self.end = middle;
        Some(upper)
    }
}

impl fmt::Display for Range {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{{}-{}}}", self.begin, self.end)
    }
}

pub type RangeList = Vec<Range>;

/// Sum of the outstanding bytes of every range in the list.
pub fn remaining_len(ranges: &[Range]) -> i64 {
    ranges.iter().map(|r| r.len().max(0)).sum()
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum RangeGenMode {
    /// Split the file into `parallel` equal shares.
    #[default]
    Default,
    /// Split the file into fixed-size blocks.
    BlockSize,
}

#[derive(Debug, Clone)]
struct GenState {
    total: i64,
    begin: i64,
    block_size: i64,
    parallel: usize,
    count: usize,
}

/// The only authority for minting new ranges of a file. `begin` only moves
/// forward; once it reaches `total` the generator is exhausted.
#[derive(Debug)]
pub struct RangeListGen {
    mode: RangeGenMode,
    state: Mutex<GenState>,
}

impl RangeListGen {
    /// Equal shares of `[begin, total)`. `count` is the number of ranges
    /// already minted, used when rebuilding a generator from saved state.
    pub fn new_default(total: i64, begin: i64, count: usize, parallel: usize) -> Self {
        let mut parallel = parallel.max(1);
        let remaining = (total - begin).max(0);
        if remaining > 0 && parallel as i64 > remaining {
            parallel = remaining as usize;
        }
        let block_size = if remaining > 0 {
            remaining / parallel as i64
        } else {
            0
        };
        Self {
            mode: RangeGenMode::Default,
            state: Mutex::new(GenState {
                total,
                begin,
                block_size,
                parallel,
                count,
            }),
        }
    }

    pub fn new_block_size(total: i64, begin: i64, block_size: i64) -> Self {
        let block_size = if block_size <= 0 {
            DEFAULT_BLOCK_SIZE
        } else {
            block_size
        };
        Self {
            mode: RangeGenMode::BlockSize,
            state: Mutex::new(GenState {
                total,
                begin,
                block_size,
                parallel: 1,
                count: 0,
            }),
        }
    }

    pub fn mode(&self) -> RangeGenMode {
        self.mode
    }

    pub fn total(&self) -> i64 {
        self.state.lock().total
    }

    pub fn begin(&self) -> i64 {
        self.state.lock().begin
    }

    pub fn block_size(&self) -> i64 {
        self.state.lock().block_size
    }

    /// Bytes not yet handed out as ranges.
    pub fn remaining(&self) -> i64 {
        let state = self.state.lock();
        (state.total - state.begin).max(0)
    }

    pub fn is_done(&self) -> bool {
        let state = self.state.lock();
        state.begin >= state.total
    }

    /// Number of ranges this generator is still expected to produce.
    pub fn range_count(&self) -> usize {
        let state = self.state.lock();
        match self.mode {
            RangeGenMode::Default => {
                if state.begin >= state.total {
                    0
                } else {
                    state.parallel.saturating_sub(state.count)
                }
            }
            RangeGenMode::BlockSize => {
                let left = (state.total - state.begin).max(0);
                ((left + state.block_size - 1) / state.block_size) as usize
            }
        }
    }

    /// Mints the next range and its index, or `None` once exhausted.
    pub fn gen_range(&self) -> Option<(usize, Range)> {
        let mut state = self.state.lock();
        if state.begin >= state.total {
            return None;
        }

        state.count += 1;
        let end = match self.mode {
            RangeGenMode::Default => {
                // the last share absorbs the rounding remainder
                if state.count >= state.parallel {
                    state.total
                } else {
                    state.begin + state.block_size
                }
            }
            RangeGenMode::BlockSize => (state.begin + state.block_size).min(state.total),
        };

        let range = Range::new(state.begin, end);
        state.begin = end;
        Some((state.count - 1, range))
    }
}
