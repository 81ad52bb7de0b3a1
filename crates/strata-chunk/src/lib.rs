//! Chunk editing core: section cache, transactional commits and undo snapshots.
//!
//! Edits are expressed as [`EditSet`]s of compact [`BlockOrdinal`]s and applied
//! to a [`ChunkSectionStore`], which mediates between the ordinal view and the
//! native [`LiveChunk`] held by the [`World`]. Tile and entity side effects run
//! on the [`EditScheduler`]'s execution contexts after all block data is in
//! place.

pub mod codec;
pub mod commit;
pub mod context;
pub mod edit_set;
pub mod error;
pub mod layer_cache;
pub mod packed;
pub mod scheduler;
pub mod section;
pub mod snapshot;
pub mod store;
mod sync;
pub mod world;

pub use codec::{
    BiomeDef, BiomeId, BlockDef, BlockOrdinal, BlockPalette, OrdinalCodec, PLAINS, PaletteError,
};
pub use commit::{CommitHandle, CommitOutcome, LayerMask};
pub use context::{EditContext, EditSettings};
pub use edit_set::EditSet;
pub use error::{CommitError, EditArray, SchedulerError, StoreError, WorldError};
pub use layer_cache::{DenseLayer, LayerCache, LayerGuard, dense_air};
pub use packed::{NibbleArray, PackedArray};
pub use scheduler::{EditScheduler, ExecutionContext, Job};
pub use section::{
    BIOME_CELLS, HEIGHT_MAP_LEN, NativeBiome, NativeBlock, NativeSection, SECTION_SIZE,
    SECTION_VOLUME, biome_index, block_index, section_of,
};
pub use snapshot::Snapshot;
pub use store::{ChunkSectionStore, SectionStores};
pub use world::{
    ALL_DIRTY, BlockPos, ChunkPos, EntityRecord, HeightMapKind, LIGHT_DIRTY, LiveChunk,
    MAX_SECTIONS, NETWORK_DIRTY, Payload, SAVE_DIRTY, TileRecord, World, WorldHandle,
};
