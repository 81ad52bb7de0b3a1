//! Error types for the chunk editing core.

use std::fmt;

use thiserror::Error;
use uuid::Uuid;

use crate::world::{BlockPos, ChunkPos};

/// Failures reported by the live world.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WorldError {
    /// The chunk is not loaded right now. It may be loaded again later.
    #[error("chunk {0} is not currently loaded")]
    NotLoaded(ChunkPos),

    /// The vertical section range is empty or wider than a layer mask can track.
    #[error("invalid section range {min}..={max}")]
    InvalidBounds {
        /// Lowest section index.
        min: i32,
        /// Highest section index.
        max: i32,
    },

    /// An entity was placed in a chunk that is not loaded.
    #[error("entity {id} lies in unloaded chunk {chunk}")]
    EntityOutsideLoaded {
        /// The entity being placed.
        id: Uuid,
        /// Chunk containing its position.
        chunk: ChunkPos,
    },
}

/// Failures reported by a section store.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// The store's chunk is not loaded in the world.
    #[error("chunk {0} is not currently loaded")]
    NotLoaded(ChunkPos),
}

/// The edit-set array a shape error refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditArray {
    /// Per-layer block ordinals.
    Blocks,
    /// Per-layer biome cells.
    Biomes,
    /// Per-layer emitted light.
    BlockLight,
    /// Per-layer sky light.
    SkyLight,
    /// Per-chunk height map.
    HeightMap,
}

impl fmt::Display for EditArray {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Blocks => "block array",
            Self::Biomes => "biome array",
            Self::BlockLight => "block light array",
            Self::SkyLight => "sky light array",
            Self::HeightMap => "height map",
        };
        f.write_str(name)
    }
}

/// Failures of a single commit.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommitError {
    /// An edit-set array has the wrong length. Nothing was applied.
    #[error("malformed edit: {array} for layer {layer:?} has {actual} entries, expected {expected}")]
    MalformedEdit {
        /// Which array is wrong.
        array: EditArray,
        /// Section index, if the array is per layer.
        layer: Option<i32>,
        /// Required length.
        expected: usize,
        /// Supplied length.
        actual: usize,
    },

    /// A tile is keyed outside the chunk or outside its vertical range. Nothing was applied.
    #[error("malformed edit: tile at {pos} lies outside the chunk")]
    TileOutOfBounds {
        /// Offending chunk-local position.
        pos: BlockPos,
    },

    /// The chunk is not loaded. Nothing was applied.
    #[error("chunk {0} is not currently loaded")]
    NotLoaded(ChunkPos),

    /// A tile or entity task failed after block data was written. Blocks stay applied.
    #[error("deferred {task} task failed: {reason}")]
    DeferredTask {
        /// Task label, e.g. `"entity removal"`.
        task: &'static str,
        /// Error message or panic payload.
        reason: String,
    },

    /// The execution contexts went away before reporting a result.
    #[error("commit was abandoned before it completed")]
    Abandoned,
}

impl From<StoreError> for CommitError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotLoaded(pos) => Self::NotLoaded(pos),
        }
    }
}

/// Failures of the execution contexts.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// A worker thread could not be spawned.
    #[error("failed to spawn {name} worker: {source}")]
    Spawn {
        /// Worker thread name.
        name: &'static str,
        /// Underlying OS error.
        #[source]
        source: std::io::Error,
    },

    /// The scheduler was shut down; the job was not queued.
    #[error("{0} context is shut down")]
    Closed(&'static str),

    /// A worker submitted to a full queue it must not wait on.
    #[error("{0} queue is full")]
    Full(&'static str),
}
