//! Seeded train/validation/test partitioning
//!
//! Each stage draws one permutation from a `StdRng` seeded with the
//! configured seed. The held-out side gets `ceil(fraction * n)` rows and the
//! kept side the remainder, so the same input and seed always give the same
//! partitions. Two stages (0.2 of all rows, then 0.25 of the rest) give
//! 60/20/20.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::fmt;
use tracing::debug;

use crate::error::{Error, Result};

/// Partition tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Split {
    /// Training rows
    Train,
    /// Validation rows
    Val,
    /// Test rows
    Test,
}

impl Split {
    /// All tags in output order
    pub const ALL: [Split; 3] = [Split::Train, Split::Val, Split::Test];

    /// Suffix used in output file names
    pub fn as_str(&self) -> &'static str {
        match self {
            Split::Train => "train",
            Split::Val => "val",
            Split::Test => "test",
        }
    }
}

impl fmt::Display for Split {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Original positional row indices assigned to one split, in draw order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    /// Which split this is
    pub split: Split,
    /// Row indices into the source table
    pub indices: Vec<usize>,
}

impl Partition {
    /// Number of rows
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    /// Whether the partition has no rows
    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }
}

/// The three partitions of one table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionSet {
    /// Training partition
    pub train: Partition,
    /// Validation partition
    pub val: Partition,
    /// Test partition
    pub test: Partition,
}

impl PartitionSet {
    /// Partitions in train, val, test order
    pub fn iter(&self) -> impl Iterator<Item = &Partition> {
        [&self.train, &self.val, &self.test].into_iter()
    }

    /// Total rows across all partitions
    pub fn total(&self) -> usize {
        self.iter().map(Partition::len).sum()
    }
}

/// Shuffle `indices` and split off `ceil(test_fraction * n)` of them.
///
/// Returns `(kept, held_out)`. Fails if the kept side would be empty.
pub fn train_test_split(indices: &[usize], test_fraction: f64, seed: u64) -> Result<(Vec<usize>, Vec<usize>)> {
    let n = indices.len();
    let n_test = (test_fraction * n as f64).ceil() as usize;
    let n_train = n.saturating_sub(n_test);

    if n_train == 0 || n_test == 0 {
        return Err(Error::InsufficientRows {
            rows: n,
            fraction: test_fraction,
        });
    }

    let mut rng = StdRng::seed_from_u64(seed);
    let mut permutation: Vec<usize> = (0..n).collect();
    permutation.shuffle(&mut rng);

    let held_out = permutation[..n_test].iter().map(|&p| indices[p]).collect();
    let kept = permutation[n_test..].iter().map(|&p| indices[p]).collect();

    Ok((kept, held_out))
}

/// Partition `n_rows` rows into train/val/test
pub fn partition_rows(n_rows: usize, test_fraction: f64, val_fraction: f64, seed: u64) -> Result<PartitionSet> {
    let all: Vec<usize> = (0..n_rows).collect();

    let (rest, test) = train_test_split(&all, test_fraction, seed)?;
    let (train, val) = train_test_split(&rest, val_fraction, seed)?;

    debug!(
        "Partitioned {} rows: {} train, {} val, {} test",
        n_rows,
        train.len(),
        val.len(),
        test.len()
    );

    Ok(PartitionSet {
        train: Partition { split: Split::Train, indices: train },
        val: Partition { split: Split::Val, indices: val },
        test: Partition { split: Split::Test, indices: test },
    })
}
