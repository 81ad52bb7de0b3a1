//! Per-chunk section store: a lazily filled, thread-safe ordinal view of one
//! live chunk.
//!
//! The store never owns the chunk. It resolves it through the world on every
//! access and compares load identities; when the world hands back a different
//! object the store bumps its generation, which makes every cached layer stale.
//!
//! Lock order is fixed: store commit lock, then the cached layer, then the
//! live section. The live-reference `RwLock` is never held while taking a
//! layer or section lock.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, TryLockError};

use dashmap::DashMap;
use rustc_hash::FxHashMap;
use uuid::Uuid;

use crate::codec::{BiomeId, BlockOrdinal, OrdinalCodec};
use crate::context::EditContext;
use crate::error::StoreError;
use crate::layer_cache::{DenseLayer, LayerCache, dense_air};
use crate::section::{HEIGHT_MAP_LEN, NativeSection, biome_index, block_index, section_of};
use crate::sync::{read, write};
use crate::world::{BlockPos, ChunkPos, EntityRecord, HeightMapKind, LIGHT_DIRTY, LiveChunk, TileRecord};

#[derive(Debug, Default)]
struct LiveRef {
    chunk: Option<Arc<LiveChunk>>,
    generation: u64,
}

/// Ordinal view of one chunk, shared by every thread editing it.
pub struct ChunkSectionStore<C: OrdinalCodec> {
    pub(crate) ctx: Arc<EditContext<C>>,
    pub(crate) pos: ChunkPos,
    pub(crate) min_section: i32,
    pub(crate) max_section: i32,
    live: RwLock<LiveRef>,
    pub(crate) cache: LayerCache,
    /// Set while a commit runs; forced reloads are ignored meanwhile.
    commit_in_flight: AtomicBool,
    create_snapshot: AtomicBool,
    pub(crate) commit_lock: Mutex<()>,
}

/// Clears the in-flight flag when a commit leaves, even by unwinding.
pub(crate) struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl<C: OrdinalCodec> ChunkSectionStore<C> {
    /// Creates an empty store for the chunk at `pos`. Nothing is resolved yet.
    pub fn new(ctx: Arc<EditContext<C>>, pos: ChunkPos) -> Self {
        let min_section = ctx.world().min_section();
        let max_section = ctx.world().max_section();
        let create_snapshot = ctx.settings().create_snapshots;
        Self {
            ctx,
            pos,
            min_section,
            max_section,
            live: RwLock::new(LiveRef::default()),
            cache: LayerCache::new(min_section, max_section),
            commit_in_flight: AtomicBool::new(false),
            create_snapshot: AtomicBool::new(create_snapshot),
            commit_lock: Mutex::new(()),
        }
    }

    /// Collaborators this store was created with.
    pub fn context(&self) -> &Arc<EditContext<C>> {
        &self.ctx
    }

    /// Chunk coordinate.
    pub fn pos(&self) -> ChunkPos {
        self.pos
    }

    /// Lowest section index.
    pub fn min_section(&self) -> i32 {
        self.min_section
    }

    /// Highest section index.
    pub fn max_section(&self) -> i32 {
        self.max_section
    }

    /// Current cache generation.
    pub fn generation(&self) -> u64 {
        read(&self.live).generation
    }

    /// Number of layers currently cached and valid.
    pub fn cached_layers(&self) -> usize {
        self.cache.cached_count(self.generation())
    }

    /// Whether commits on this store capture a snapshot.
    pub fn creates_snapshot(&self) -> bool {
        self.create_snapshot.load(Ordering::Relaxed)
    }

    /// Turns snapshot capture on or off for later commits.
    pub fn set_create_snapshot(&self, enabled: bool) {
        self.create_snapshot.store(enabled, Ordering::Relaxed);
    }

    pub(crate) fn in_range(&self, layer: i32) -> bool {
        (self.min_section..=self.max_section).contains(&layer)
    }

    pub(crate) fn enter_commit(&self) -> InFlight<'_> {
        self.commit_in_flight.store(true, Ordering::Release);
        InFlight(&self.commit_in_flight)
    }

    /// The live chunk and the generation cached layers must carry.
    ///
    /// Swaps in the world's current object, and bumps the generation, if its
    /// identity differs from the one this store last saw.
    pub(crate) fn resolve(&self) -> Result<(Arc<LiveChunk>, u64), StoreError> {
        let current = self
            .ctx
            .world()
            .chunk(self.pos)
            .map_err(|_| StoreError::NotLoaded(self.pos))?;
        {
            let live = read(&self.live);
            if let Some(chunk) = &live.chunk
                && chunk.identity() == current.identity()
            {
                return Ok((Arc::clone(chunk), live.generation));
            }
        }
        let mut live = write(&self.live);
        if let Some(chunk) = &live.chunk
            && chunk.identity() == current.identity()
        {
            return Ok((Arc::clone(chunk), live.generation));
        }
        if let Some(previous) = &live.chunk {
            tracing::debug!(
                chunk = %self.pos,
                from = previous.identity(),
                to = current.identity(),
                "live chunk identity changed; cache invalidated"
            );
        }
        live.chunk = Some(Arc::clone(&current));
        live.generation += 1;
        Ok((current, live.generation))
    }

    /// Bumps the generation if `identity` is still the resolved chunk.
    /// Returns the old and new generation.
    pub(crate) fn bump_generation(&self, identity: u64) -> Option<(u64, u64)> {
        let mut live = write(&self.live);
        if live.chunk.as_ref().map(|chunk| chunk.identity()) != Some(identity) {
            return None;
        }
        let from = live.generation;
        live.generation += 1;
        Some((from, live.generation))
    }

    /// Returns `true` if the world still holds the chunk object with `identity`.
    pub(crate) fn is_current(&self, identity: u64) -> bool {
        self.ctx
            .world()
            .chunk(self.pos)
            .is_ok_and(|chunk| chunk.identity() == identity)
    }

    /// Decodes a native section into ordinals.
    pub(crate) fn decode(&self, section: Option<&NativeSection>) -> DenseLayer {
        let mut dense = dense_air();
        if let Some(section) = section {
            let codec = self.ctx.codec();
            for (index, slot) in dense.iter_mut().enumerate() {
                *slot = codec.encode_block(section.block(index));
            }
        }
        dense
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    /// Whether `layer` is allocated in the live chunk.
    pub fn has_section(&self, layer: i32) -> bool {
        self.resolve()
            .is_ok_and(|(chunk, _)| chunk.has_section(layer))
    }

    /// Runs `f` over the cached dense view of `layer`, decoding it first on a miss.
    fn with_layer<R>(
        &self,
        layer: i32,
        force_reload: bool,
        f: impl FnOnce(&DenseLayer) -> R,
    ) -> Result<R, StoreError> {
        let (chunk, generation) = self.resolve()?;
        let force = force_reload && !self.commit_in_flight.load(Ordering::Acquire);
        let Some(mut cached) = self.cache.lock(layer) else {
            return Ok(f(&dense_air()));
        };
        if !force && let Some(data) = cached.get(generation) {
            return Ok(f(data));
        }
        let data = match chunk.lock_section(layer) {
            Some(slot) => self.decode(slot.as_ref()),
            None => dense_air(),
        };
        let result = f(&data);
        cached.store(generation, data);
        Ok(result)
    }

    /// Copy of the dense ordinal view of `layer`.
    ///
    /// Layers outside the chunk's range read as air. While a commit is in
    /// flight `force_reload` is ignored and the cached view is returned.
    ///
    /// # Errors
    ///
    /// [`StoreError::NotLoaded`] if the chunk is not loaded.
    pub fn load_layer(&self, layer: i32, force_reload: bool) -> Result<DenseLayer, StoreError> {
        if !self.in_range(layer) {
            return Ok(dense_air());
        }
        self.with_layer(layer, force_reload, |data| data.clone())
    }

    /// Ordinal at chunk-local `(x, z)` and absolute `y`; air when unavailable.
    pub fn read_block(&self, x: i32, y: i32, z: i32) -> BlockOrdinal {
        let layer = section_of(y);
        if !self.in_range(layer) {
            return BlockOrdinal::AIR;
        }
        let index = block_index(x, y, z);
        self.with_layer(layer, false, |data| data[index])
            .unwrap_or(BlockOrdinal::AIR)
    }

    /// Biome at `(x, y, z)`; the codec default when unavailable.
    pub fn read_biome(&self, x: i32, y: i32, z: i32) -> BiomeId {
        let codec = self.ctx.codec();
        self.with_section(y, |section| codec.encode_biome(section.biome(biome_index(x, y, z))))
            .unwrap_or_else(|| codec.default_biome())
    }

    /// Sky light at `(x, y, z)`; zero when unavailable.
    pub fn read_sky_light(&self, x: i32, y: i32, z: i32) -> u8 {
        self.with_section(y, |section| section.sky_light(block_index(x, y, z)))
            .unwrap_or(0)
    }

    /// Block light at `(x, y, z)`; zero when unavailable.
    pub fn read_emitted_light(&self, x: i32, y: i32, z: i32) -> u8 {
        self.with_section(y, |section| section.block_light(block_index(x, y, z)))
            .unwrap_or(0)
    }

    fn with_section<R>(&self, y: i32, f: impl FnOnce(&NativeSection) -> R) -> Option<R> {
        let (chunk, _) = self.resolve().ok()?;
        let slot = chunk.lock_section(section_of(y))?;
        slot.as_ref().map(f)
    }

    /// Height map of `kind`; zeros when never written or unavailable.
    pub fn read_height_map(&self, kind: HeightMapKind) -> [i32; HEIGHT_MAP_LEN] {
        self.resolve()
            .ok()
            .and_then(|(chunk, _)| chunk.height_map(kind))
            .unwrap_or([0; HEIGHT_MAP_LEN])
    }

    /// Tile at chunk-local `(x, y, z)`.
    pub fn tile(&self, x: i32, y: i32, z: i32) -> Option<TileRecord> {
        let (chunk, _) = self.resolve().ok()?;
        chunk.tile(BlockPos::new(x & 15, y, z & 15))
    }

    /// Every tile of the chunk.
    pub fn tiles(&self) -> FxHashMap<BlockPos, TileRecord> {
        self.resolve()
            .map(|(chunk, _)| chunk.tiles())
            .unwrap_or_default()
    }

    /// Entity `id`, if it is in this chunk.
    pub fn entity(&self, id: Uuid) -> Option<EntityRecord> {
        let (chunk, _) = self.resolve().ok()?;
        chunk.entity(id)
    }

    /// Every entity in the chunk.
    pub fn entities(&self) -> Vec<EntityRecord> {
        self.resolve()
            .map(|(chunk, _)| chunk.entities())
            .unwrap_or_default()
    }

    // -----------------------------------------------------------------------
    // Maintenance
    // -----------------------------------------------------------------------

    /// Zeroes block light, and sky light when `sky`, of an allocated section.
    ///
    /// Returns `true` if a section was cleared.
    pub fn remove_section_lighting(&self, layer: i32, sky: bool) -> bool {
        let Ok((chunk, _)) = self.resolve() else {
            return false;
        };
        let cleared = match chunk.lock_section(layer) {
            Some(mut slot) => match slot.as_mut() {
                Some(section) => {
                    section.block_light_mut().fill(0);
                    if sky {
                        section.sky_light_mut().fill(0);
                    }
                    true
                }
                None => false,
            },
            None => false,
        };
        if cleared {
            chunk.mark_dirty(LIGHT_DIRTY);
        }
        cleared
    }

    /// Drops one cached layer.
    pub fn trim_layer(&self, layer: i32) {
        self.cache.invalidate(layer);
    }

    /// Releases cached layers. `aggressive` also forgets the live chunk, so the
    /// next access resolves it from scratch.
    ///
    /// Returns `false`, doing nothing, while a commit holds the store.
    pub fn trim(&self, aggressive: bool) -> bool {
        let _guard = match self.commit_lock.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => return false,
        };
        if aggressive {
            let mut live = write(&self.live);
            live.chunk = None;
            live.generation += 1;
        }
        self.cache.clear();
        true
    }
}

// ---------------------------------------------------------------------------
// Store registry
// ---------------------------------------------------------------------------

/// One [`ChunkSectionStore`] per chunk, created on first access.
pub struct SectionStores<C: OrdinalCodec> {
    ctx: Arc<EditContext<C>>,
    stores: DashMap<ChunkPos, Arc<ChunkSectionStore<C>>>,
}

impl<C: OrdinalCodec> SectionStores<C> {
    /// Creates an empty registry.
    pub fn new(ctx: Arc<EditContext<C>>) -> Self {
        Self {
            ctx,
            stores: DashMap::new(),
        }
    }

    /// Store for `pos`, creating it if needed.
    pub fn get_or_create(&self, pos: ChunkPos) -> Arc<ChunkSectionStore<C>> {
        self.stores
            .entry(pos)
            .or_insert_with(|| Arc::new(ChunkSectionStore::new(Arc::clone(&self.ctx), pos)))
            .clone()
    }

    /// Existing store for `pos`.
    pub fn get(&self, pos: ChunkPos) -> Option<Arc<ChunkSectionStore<C>>> {
        self.stores.get(&pos).map(|entry| Arc::clone(entry.value()))
    }

    /// Forgets the store for `pos`.
    pub fn remove(&self, pos: ChunkPos) -> Option<Arc<ChunkSectionStore<C>>> {
        self.stores.remove(&pos).map(|(_, store)| store)
    }

    /// Trims every store; returns how many were trimmed.
    pub fn trim_all(&self, aggressive: bool) -> usize {
        let stores: Vec<_> = self
            .stores
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        stores.iter().filter(|store| store.trim(aggressive)).count()
    }

    /// Number of stores.
    pub fn len(&self) -> usize {
        self.stores.len()
    }

    /// Returns `true` if no store exists yet.
    pub fn is_empty(&self) -> bool {
        self.stores.is_empty()
    }
}
