//! In-memory live world: the native chunks edits are committed into.
//!
//! The world owns every loaded [`LiveChunk`], keyed by [`ChunkPos`]. A chunk
//! that is unloaded and loaded again is a *different* object with a new
//! identity; section stores use that identity to notice reloads. Nothing here
//! knows about ordinals.

use std::fmt;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use dashmap::DashMap;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::WorldError;
use crate::section::{
    HEIGHT_MAP_LEN, NativeBiome, NativeBlock, NativeSection, biome_index, block_index, section_of,
};
use crate::sync::lock;

/// Dirty-flag bit: chunk needs saving.
pub const SAVE_DIRTY: u8 = 0b0000_0001;
/// Dirty-flag bit: chunk lighting needs resending or recomputing.
pub const LIGHT_DIRTY: u8 = 0b0000_0010;
/// Dirty-flag bit: chunk needs resending to viewers.
pub const NETWORK_DIRTY: u8 = 0b0000_0100;
/// All dirty flags combined.
pub const ALL_DIRTY: u8 = SAVE_DIRTY | LIGHT_DIRTY | NETWORK_DIRTY;

/// The widest section range a chunk may span.
pub const MAX_SECTIONS: i32 = 64;

// ---------------------------------------------------------------------------
// Coordinates and payloads
// ---------------------------------------------------------------------------

/// Horizontal chunk coordinate.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChunkPos {
    /// Chunk-grid X.
    pub x: i32,
    /// Chunk-grid Z.
    pub z: i32,
}

impl ChunkPos {
    /// Creates a chunk coordinate.
    pub fn new(x: i32, z: i32) -> Self {
        Self { x, z }
    }

    /// Chunk containing the world-space point `(x, z)`.
    pub fn containing(x: f64, z: f64) -> Self {
        Self {
            x: (x.floor() as i32) >> 4,
            z: (z.floor() as i32) >> 4,
        }
    }
}

impl fmt::Display for ChunkPos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.x, self.z)
    }
}

/// Block position with chunk-local `x`/`z` (`0..16`) and absolute `y`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlockPos {
    /// Local X in `0..16`.
    pub x: i32,
    /// Absolute height.
    pub y: i32,
    /// Local Z in `0..16`.
    pub z: i32,
}

impl BlockPos {
    /// Creates a block position.
    pub fn new(x: i32, y: i32, z: i32) -> Self {
        Self { x, y, z }
    }

    /// Returns `true` if `x` and `z` address a column of a single chunk.
    pub fn is_local(&self) -> bool {
        (0..16).contains(&self.x) && (0..16).contains(&self.z)
    }
}

impl fmt::Display for BlockPos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {})", self.x, self.y, self.z)
    }
}

/// Opaque serialized tag data. The core never looks inside.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Payload(Arc<[u8]>);

impl Payload {
    /// An empty payload.
    pub fn empty() -> Self {
        Self(Arc::from(Vec::new()))
    }

    /// The raw bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Self(Arc::from(bytes))
    }
}

impl From<&[u8]> for Payload {
    fn from(bytes: &[u8]) -> Self {
        Self(Arc::from(bytes))
    }
}

/// Block-attached data (chests, signs, ...).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TileRecord {
    /// Tile type id, e.g. `"Chest"`. Empty ids are not instantiable.
    pub id: String,
    /// Serialized tile tag.
    pub payload: Payload,
}

/// A free-standing entity.
#[derive(Clone, Debug, PartialEq)]
pub struct EntityRecord {
    /// Stable identifier.
    pub id: Uuid,
    /// Entity type id, e.g. `"Pig"`. Empty kinds are not spawnable.
    pub kind: String,
    /// World-space position.
    pub position: [f64; 3],
    /// Yaw and pitch in degrees.
    pub rotation: [f32; 2],
    /// Serialized entity tag.
    pub payload: Payload,
}

/// Height map variants kept per chunk.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum HeightMapKind {
    /// Highest non-air block.
    WorldSurface,
    /// Highest block that blocks motion, ignoring fluids.
    OceanFloor,
    /// Highest block that blocks motion or holds a fluid.
    MotionBlocking,
    /// As [`HeightMapKind::MotionBlocking`], ignoring leaves.
    MotionBlockingNoLeaves,
}

impl HeightMapKind {
    /// Every kind, in declaration order.
    pub const ALL: [Self; 4] = [
        Self::WorldSurface,
        Self::OceanFloor,
        Self::MotionBlocking,
        Self::MotionBlockingNoLeaves,
    ];
}

// ---------------------------------------------------------------------------
// LiveChunk
// ---------------------------------------------------------------------------

/// A loaded native chunk.
///
/// Every section slot has its own lock; a section is either absent (`None`,
/// implicitly air) or fully allocated. Tiles, entities and height maps are
/// guarded separately.
#[derive(Debug)]
pub struct LiveChunk {
    pos: ChunkPos,
    /// Unique per load; a reloaded chunk gets a new identity.
    identity: u64,
    min_section: i32,
    max_section: i32,
    default_biome: NativeBiome,
    sections: Box<[Mutex<Option<NativeSection>>]>,
    height_maps: Mutex<FxHashMap<HeightMapKind, [i32; HEIGHT_MAP_LEN]>>,
    tiles: Mutex<FxHashMap<BlockPos, TileRecord>>,
    entities: Mutex<FxHashMap<Uuid, EntityRecord>>,
    dirty: AtomicU8,
    version: AtomicU64,
}

impl LiveChunk {
    fn new(
        pos: ChunkPos,
        identity: u64,
        min_section: i32,
        max_section: i32,
        default_biome: NativeBiome,
    ) -> Self {
        let count = (max_section - min_section + 1) as usize;
        Self {
            pos,
            identity,
            min_section,
            max_section,
            default_biome,
            sections: (0..count).map(|_| Mutex::new(None)).collect(),
            height_maps: Mutex::new(FxHashMap::default()),
            tiles: Mutex::new(FxHashMap::default()),
            entities: Mutex::new(FxHashMap::default()),
            dirty: AtomicU8::new(0),
            version: AtomicU64::new(0),
        }
    }

    /// Deep copy under a new identity, as if saved and loaded again.
    fn reloaded(&self, identity: u64) -> Self {
        let copy = Self::new(
            self.pos,
            identity,
            self.min_section,
            self.max_section,
            self.default_biome,
        );
        for (slot, source) in copy.sections.iter().zip(self.sections.iter()) {
            *lock(slot) = lock(source).clone();
        }
        *lock(&copy.height_maps) = lock(&self.height_maps).clone();
        *lock(&copy.tiles) = lock(&self.tiles).clone();
        *lock(&copy.entities) = lock(&self.entities).clone();
        copy
    }

    /// Chunk coordinate.
    pub fn pos(&self) -> ChunkPos {
        self.pos
    }

    /// Load identity. Two handles with equal identity are the same load.
    pub fn identity(&self) -> u64 {
        self.identity
    }

    /// Lowest section index.
    pub fn min_section(&self) -> i32 {
        self.min_section
    }

    /// Highest section index.
    pub fn max_section(&self) -> i32 {
        self.max_section
    }

    /// Biome given to sections this chunk allocates on its own.
    pub fn default_biome(&self) -> NativeBiome {
        self.default_biome
    }

    /// Locks section `layer`. Returns `None` if the layer is out of range.
    pub fn lock_section(&self, layer: i32) -> Option<MutexGuard<'_, Option<NativeSection>>> {
        if layer < self.min_section || layer > self.max_section {
            return None;
        }
        Some(lock(&self.sections[(layer - self.min_section) as usize]))
    }

    /// Returns `true` if section `layer` is allocated.
    pub fn has_section(&self, layer: i32) -> bool {
        self.lock_section(layer).is_some_and(|slot| slot.is_some())
    }

    /// Block at local `(x, z)` and absolute `y`; air when absent or out of range.
    pub fn block(&self, x: i32, y: i32, z: i32) -> NativeBlock {
        self.lock_section(section_of(y))
            .and_then(|slot| slot.as_ref().map(|s| s.block(block_index(x, y, z))))
            .unwrap_or(NativeBlock::AIR)
    }

    /// Writes a block directly, allocating its section if needed.
    ///
    /// This is the world's own mutation path (gameplay, generation, tests); edits
    /// go through a section store instead. Out-of-range heights are ignored.
    pub fn set_block(&self, x: i32, y: i32, z: i32, block: NativeBlock) {
        let Some(mut slot) = self.lock_section(section_of(y)) else {
            tracing::warn!("LiveChunk::set_block out of range: ({}, {}, {})", x, y, z);
            return;
        };
        if slot.is_none() && block.is_air() {
            return;
        }
        slot.get_or_insert_with(|| NativeSection::new_air(self.default_biome))
            .set_block(block_index(x, y, z), block);
        self.version.fetch_add(1, Ordering::Relaxed);
    }

    /// Biome at `(x, y, z)`, or `None` when the section is absent.
    pub fn biome(&self, x: i32, y: i32, z: i32) -> Option<NativeBiome> {
        self.lock_section(section_of(y))
            .and_then(|slot| slot.as_ref().map(|s| s.biome(biome_index(x, y, z))))
    }

    /// Height map of `kind`, if one was ever written.
    pub fn height_map(&self, kind: HeightMapKind) -> Option<[i32; HEIGHT_MAP_LEN]> {
        lock(&self.height_maps).get(&kind).copied()
    }

    /// Replaces the height map of `kind`.
    pub fn set_height_map(&self, kind: HeightMapKind, heights: [i32; HEIGHT_MAP_LEN]) {
        lock(&self.height_maps).insert(kind, heights);
    }

    /// Tile at `pos`.
    pub fn tile(&self, pos: BlockPos) -> Option<TileRecord> {
        lock(&self.tiles).get(&pos).cloned()
    }

    /// Copy of every tile.
    pub fn tiles(&self) -> FxHashMap<BlockPos, TileRecord> {
        lock(&self.tiles).clone()
    }

    /// Stores a tile, returning the one it replaced.
    pub fn insert_tile(&self, pos: BlockPos, tile: TileRecord) -> Option<TileRecord> {
        lock(&self.tiles).insert(pos, tile)
    }

    /// Removes and returns the tile at `pos`.
    pub fn remove_tile(&self, pos: BlockPos) -> Option<TileRecord> {
        lock(&self.tiles).remove(&pos)
    }

    /// Removes every tile matching `predicate` and returns them.
    pub fn drain_tiles<F>(&self, mut predicate: F) -> Vec<(BlockPos, TileRecord)>
    where
        F: FnMut(&BlockPos) -> bool,
    {
        let mut tiles = lock(&self.tiles);
        let doomed: Vec<BlockPos> = tiles.keys().filter(|pos| predicate(pos)).copied().collect();
        doomed
            .into_iter()
            .filter_map(|pos| tiles.remove(&pos).map(|tile| (pos, tile)))
            .collect()
    }

    /// Entity with `id`.
    pub fn entity(&self, id: Uuid) -> Option<EntityRecord> {
        lock(&self.entities).get(&id).cloned()
    }

    /// Copy of every entity.
    pub fn entities(&self) -> Vec<EntityRecord> {
        lock(&self.entities).values().cloned().collect()
    }

    /// Stores an entity, returning the one it replaced.
    pub fn insert_entity(&self, entity: EntityRecord) -> Option<EntityRecord> {
        lock(&self.entities).insert(entity.id, entity)
    }

    /// Removes and returns the entity with `id`.
    pub fn remove_entity(&self, id: Uuid) -> Option<EntityRecord> {
        lock(&self.entities).remove(&id)
    }

    /// Current dirty flags.
    pub fn dirty_flags(&self) -> u8 {
        self.dirty.load(Ordering::Acquire)
    }

    /// Returns `true` if every bit of `flags` is set.
    pub fn is_dirty(&self, flags: u8) -> bool {
        self.dirty_flags() & flags == flags
    }

    /// Sets `flags` and bumps the version.
    pub fn mark_dirty(&self, flags: u8) {
        self.dirty.fetch_or(flags, Ordering::AcqRel);
        self.version.fetch_add(1, Ordering::Relaxed);
    }

    /// Clears `flags`.
    pub fn clear_dirty(&self, flags: u8) {
        self.dirty.fetch_and(!flags, Ordering::AcqRel);
    }

    /// Mutation counter.
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Relaxed)
    }
}

// ---------------------------------------------------------------------------
// World
// ---------------------------------------------------------------------------

/// Shared handle to a [`World`].
pub type WorldHandle = Arc<World>;

/// All loaded chunks of one dimension.
#[derive(Debug)]
pub struct World {
    chunks: DashMap<ChunkPos, Arc<LiveChunk>>,
    min_section: i32,
    max_section: i32,
    default_biome: NativeBiome,
    next_identity: AtomicU64,
}

impl World {
    /// Creates an empty world whose chunks span sections `min_section..=max_section`.
    ///
    /// # Errors
    ///
    /// [`WorldError::InvalidBounds`] if the range is empty or wider than
    /// [`MAX_SECTIONS`].
    pub fn new(min_section: i32, max_section: i32) -> Result<Self, WorldError> {
        if max_section < min_section || max_section - min_section >= MAX_SECTIONS {
            return Err(WorldError::InvalidBounds {
                min: min_section,
                max: max_section,
            });
        }
        Ok(Self {
            chunks: DashMap::new(),
            min_section,
            max_section,
            default_biome: NativeBiome(1),
            next_identity: AtomicU64::new(1),
        })
    }

    /// Sets the biome chunks use when they allocate sections on their own.
    pub fn with_default_biome(mut self, biome: NativeBiome) -> Self {
        self.default_biome = biome;
        self
    }

    /// Lowest section index of every chunk.
    pub fn min_section(&self) -> i32 {
        self.min_section
    }

    /// Highest section index of every chunk.
    pub fn max_section(&self) -> i32 {
        self.max_section
    }

    /// Returns the chunk at `pos`, loading an empty one if needed.
    pub fn load_chunk(&self, pos: ChunkPos) -> Arc<LiveChunk> {
        self.chunks
            .entry(pos)
            .or_insert_with(|| Arc::new(self.fresh_chunk(pos)))
            .clone()
    }

    /// Unloads the chunk at `pos`. Handles held elsewhere stay valid but detached.
    pub fn unload_chunk(&self, pos: ChunkPos) -> Option<Arc<LiveChunk>> {
        self.chunks.remove(&pos).map(|(_, chunk)| chunk)
    }

    /// Replaces the chunk at `pos` with a copy under a new identity.
    ///
    /// # Errors
    ///
    /// [`WorldError::NotLoaded`] if nothing is loaded at `pos`.
    pub fn reload_chunk(&self, pos: ChunkPos) -> Result<Arc<LiveChunk>, WorldError> {
        let current = self.chunk(pos)?;
        let identity = self.next_identity.fetch_add(1, Ordering::Relaxed);
        let reloaded = Arc::new(current.reloaded(identity));
        self.chunks.insert(pos, Arc::clone(&reloaded));
        tracing::debug!(chunk = %pos, identity, "chunk reloaded");
        Ok(reloaded)
    }

    /// The chunk currently loaded at `pos`.
    ///
    /// # Errors
    ///
    /// [`WorldError::NotLoaded`] if nothing is loaded at `pos`.
    pub fn chunk(&self, pos: ChunkPos) -> Result<Arc<LiveChunk>, WorldError> {
        self.chunks
            .get(&pos)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or(WorldError::NotLoaded(pos))
    }

    /// Returns `true` if a chunk is loaded at `pos`.
    pub fn is_loaded(&self, pos: ChunkPos) -> bool {
        self.chunks.contains_key(&pos)
    }

    /// Number of loaded chunks.
    pub fn loaded_count(&self) -> usize {
        self.chunks.len()
    }

    /// Places an entity into the chunk containing its position.
    ///
    /// # Errors
    ///
    /// [`WorldError::EntityOutsideLoaded`] if that chunk is not loaded.
    pub fn spawn_entity(&self, entity: EntityRecord) -> Result<ChunkPos, WorldError> {
        let pos = ChunkPos::containing(entity.position[0], entity.position[2]);
        let chunk = self
            .chunk(pos)
            .map_err(|_| WorldError::EntityOutsideLoaded { id: entity.id, chunk: pos })?;
        chunk.insert_entity(entity);
        Ok(pos)
    }

    /// Scans every loaded chunk for entity `id`.
    pub fn find_entity_chunk(&self, id: Uuid) -> Option<Arc<LiveChunk>> {
        self.chunks
            .iter()
            .find(|entry| entry.value().entity(id).is_some())
            .map(|entry| Arc::clone(entry.value()))
    }

    fn fresh_chunk(&self, pos: ChunkPos) -> LiveChunk {
        let identity = self.next_identity.fetch_add(1, Ordering::Relaxed);
        LiveChunk::new(
            pos,
            identity,
            self.min_section,
            self.max_section,
            self.default_biome,
        )
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
