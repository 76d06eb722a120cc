//! Phase and shard definitions for the orchestrator.
//!
//! This module provides:
//! - `Phase`, the ordered Map → Reduce → Report enumeration
//! - `ShardSet`, the fixed `0..N` collection of shard ids shared by Map and Reduce

use anyhow::Result;
use serde::{Deserialize, Serialize};

/// Identifier of a single shard within a phase.
pub type ShardId = u32;

/// One of the three sequential stages of a run.
///
/// The derive order is the execution order, so `Phase::Map < Phase::Reduce`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    /// Sharded; workers write into the intermediate area
    Map,
    /// Sharded; workers read intermediate data and write output
    Reduce,
    /// Single worker, no shard parameter
    Report,
}

impl Phase {
    /// All phases in execution order.
    pub const ALL: [Phase; 3] = [Phase::Map, Phase::Reduce, Phase::Report];

    /// Name passed to workers and used in log file names.
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Map => "map",
            Phase::Reduce => "reduce",
            Phase::Report => "report",
        }
    }

    /// Whether the phase fans out over the shard set.
    pub fn is_sharded(&self) -> bool {
        !matches!(self, Phase::Report)
    }

    /// The phase that runs after this one's barrier, if any.
    pub fn next(&self) -> Option<Phase> {
        match self {
            Phase::Map => Some(Phase::Reduce),
            Phase::Reduce => Some(Phase::Report),
            Phase::Report => None,
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Phase {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "map" => Ok(Phase::Map),
            "reduce" => Ok(Phase::Reduce),
            "report" => Ok(Phase::Report),
            _ => anyhow::bail!("Invalid phase '{}'. Valid values: map, reduce, report", s),
        }
    }
}

/// Ordered, fixed-size set of shard ids `0..count`.
///
/// A shard is a coordinate rather than a resource, so the set only stores its size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardSet {
    count: u32,
}

impl ShardSet {
    pub fn new(count: u32) -> Self {
        Self { count }
    }

    pub fn len(&self) -> usize {
        self.count as usize
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Number of shards, as passed to workers.
    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn contains(&self, shard: ShardId) -> bool {
        shard < self.count
    }

    /// Shard ids in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = ShardId> + use<> {
        0..self.count
    }
}

impl Default for ShardSet {
    fn default() -> Self {
        Self::new(4)
    }
}
