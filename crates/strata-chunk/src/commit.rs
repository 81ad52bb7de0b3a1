//! Commit pipeline: applies one [`EditSet`] to a [`ChunkSectionStore`] as a
//! single logical transaction.
//!
//! Block, biome, light and height-map data are written synchronously by the
//! committing thread under the store's commit lock, layer by layer from the
//! bottom up. Tile and entity changes are queued as an ordered chain on the
//! side-effect context; dirty marking and the caller's finalizer then run on
//! the structural context. The returned [`CommitHandle`] resolves once the
//! finalizer has run.

use std::mem;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError, bounded};
use rustc_hash::{FxHashMap, FxHashSet};
use uuid::Uuid;

use crate::codec::{BiomeId, BlockOrdinal, OrdinalCodec};
use crate::edit_set::EditSet;
use crate::error::CommitError;
use crate::scheduler::{ContextSender, ExecutionContext, Job, panic_message};
use crate::section::{HEIGHT_MAP_LEN, NativeBlock, NativeSection};
use crate::snapshot::{Snapshot, SnapshotBuilder};
use crate::store::ChunkSectionStore;
use crate::sync::lock;
use crate::world::{
    BlockPos, ChunkPos, EntityRecord, LIGHT_DIRTY, LiveChunk, NETWORK_DIRTY, SAVE_DIRTY,
    TileRecord, World, WorldHandle,
};

// ---------------------------------------------------------------------------
// Outcome
// ---------------------------------------------------------------------------

/// Set of section indices, one bit per layer of a chunk.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LayerMask {
    min_section: i32,
    bits: u64,
}

impl LayerMask {
    /// An empty mask for a chunk whose lowest section is `min_section`.
    pub fn new(min_section: i32) -> Self {
        Self {
            min_section,
            bits: 0,
        }
    }

    /// Adds `layer`. Layers the mask cannot represent are ignored.
    pub fn insert(&mut self, layer: i32) {
        if let Some(bit) = self.bit(layer) {
            self.bits |= bit;
        }
    }

    /// Returns `true` if `layer` is in the mask.
    pub fn contains(&self, layer: i32) -> bool {
        self.bit(layer).is_some_and(|bit| self.bits & bit != 0)
    }

    /// Returns `true` if no layer is set.
    pub fn is_empty(&self) -> bool {
        self.bits == 0
    }

    /// Number of layers set.
    pub fn len(&self) -> usize {
        self.bits.count_ones() as usize
    }

    /// Raw bits; bit `i` is section `min_section + i`.
    pub fn bits(&self) -> u64 {
        self.bits
    }

    /// Layers set, low to high.
    pub fn layers(&self) -> impl Iterator<Item = i32> {
        let (min, bits) = (self.min_section, self.bits);
        (0..64).filter(move |i| bits & (1u64 << i) != 0).map(move |i| min + i)
    }

    fn bit(&self, layer: i32) -> Option<u64> {
        let offset = layer.checked_sub(self.min_section)?;
        (0..64).contains(&offset).then(|| 1u64 << offset)
    }
}

/// What a finished commit did.
#[derive(Clone, Debug)]
pub struct CommitOutcome {
    /// Layers whose block data was written.
    pub touched: LayerMask,
    /// Whether any biome cell was written.
    pub biomes_changed: bool,
    /// Whether any light channel was written.
    pub lighting_changed: bool,
    /// Whether any height map was written.
    pub height_maps_changed: bool,
    /// Entities queued for removal that were actually removed.
    pub confirmed_removals: FxHashSet<Uuid>,
    /// Pre-edit capture, if the store creates snapshots.
    pub snapshot: Option<Arc<Snapshot>>,
}

impl CommitOutcome {
    fn new(min_section: i32) -> Self {
        Self {
            touched: LayerMask::new(min_section),
            biomes_changed: false,
            lighting_changed: false,
            height_maps_changed: false,
            confirmed_removals: FxHashSet::default(),
            snapshot: None,
        }
    }

    /// Returns `true` if block, biome or light data changed.
    pub fn changed(&self) -> bool {
        !self.touched.is_empty() || self.biomes_changed || self.lighting_changed
    }
}

type CommitResult = Result<CommitOutcome, CommitError>;

/// Completion handle of one commit. Dropping it does not cancel anything.
pub struct CommitHandle {
    pos: ChunkPos,
    receiver: Receiver<CommitResult>,
    result: Mutex<Option<CommitResult>>,
}

impl CommitHandle {
    /// Chunk the commit applies to.
    pub fn pos(&self) -> ChunkPos {
        self.pos
    }

    /// Returns `true` once the finalizer has run.
    pub fn is_complete(&self) -> bool {
        self.poll(None).is_some()
    }

    /// The result, if the commit already finished.
    pub fn try_result(&self) -> Option<CommitResult> {
        self.poll(None)
    }

    /// Blocks up to `timeout` for the result.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<CommitResult> {
        self.poll(Some(timeout))
    }

    /// Blocks until the commit finishes.
    pub fn wait(self) -> CommitResult {
        let settled = self
            .result
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner);
        match settled {
            Some(result) => result,
            None => self.receiver.recv().unwrap_or(Err(CommitError::Abandoned)),
        }
    }

    fn poll(&self, timeout: Option<Duration>) -> Option<CommitResult> {
        let mut slot = lock(&self.result);
        if slot.is_none() {
            let received = match timeout {
                None => match self.receiver.try_recv() {
                    Ok(result) => result,
                    Err(TryRecvError::Empty) => return None,
                    Err(TryRecvError::Disconnected) => Err(CommitError::Abandoned),
                },
                Some(timeout) => match self.receiver.recv_timeout(timeout) {
                    Ok(result) => result,
                    Err(RecvTimeoutError::Timeout) => return None,
                    Err(RecvTimeoutError::Disconnected) => Err(CommitError::Abandoned),
                },
            };
            *slot = Some(received);
        }
        slot.clone()
    }
}

// ---------------------------------------------------------------------------
// Commit
// ---------------------------------------------------------------------------

#[derive(Default)]
struct LayerWrite {
    allocated: bool,
    biomes_changed: bool,
}

impl<C: OrdinalCodec> ChunkSectionStore<C> {
    /// Applies `edit` and runs `finalizer` exactly once when done.
    ///
    /// Block, biome, light and height-map data are in place when this returns.
    /// Tile and entity changes, dirty marking and `finalizer` follow on the
    /// execution contexts; wait on the handle to observe them.
    ///
    /// # Errors
    ///
    /// [`CommitError::MalformedEdit`] or [`CommitError::TileOutOfBounds`] for a
    /// bad edit and [`CommitError::NotLoaded`] for an unloaded chunk. Nothing
    /// is applied and `finalizer` is not run in those cases.
    pub fn commit<F>(&self, mut edit: EditSet, finalizer: F) -> Result<CommitHandle, CommitError>
    where
        F: FnOnce() + Send + 'static,
    {
        edit.validate(self.min_section, self.max_section)?;
        let _commit = lock(&self.commit_lock);
        let _in_flight = self.enter_commit();
        let (chunk, generation) = self.resolve()?;
        let codec = Arc::clone(self.ctx.codec());
        let started = Instant::now();
        tracing::debug!(
            chunk = %self.pos,
            block_layers = edit.blocks.len(),
            biome_layers = edit.biomes.len(),
            "commit started"
        );

        for layer in edit.blocks.keys().filter(|layer| !self.in_range(**layer)) {
            tracing::warn!(chunk = %self.pos, layer, "block layer outside the chunk ignored");
        }

        let mut snapshot = self
            .creates_snapshot()
            .then(|| SnapshotBuilder::new(self.pos, codec.default_biome()));
        let mut outcome = CommitOutcome::new(self.min_section);
        let mut dirty = 0u8;

        // Tiles sitting on blocks this edit replaces go away with the block.
        let evicted = chunk.drain_tiles(|pos| edit.overwrites(*pos));
        if !evicted.is_empty() {
            dirty |= SAVE_DIRTY | NETWORK_DIRTY;
        }
        if let Some(snapshot) = snapshot.as_mut() {
            for (pos, tile) in evicted {
                snapshot.store_tile(pos, tile);
            }
        }

        let mut allocated = false;
        for layer in self.min_section..=self.max_section {
            let biomes = edit.biomes.get(&layer).map(Vec::as_slice);
            let write = match edit.blocks.get(&layer) {
                Some(blocks) if blocks.iter().any(|ordinal| !ordinal.is_reserved()) => {
                    outcome.touched.insert(layer);
                    self.write_layer(&chunk, generation, layer, blocks, biomes, snapshot.as_mut())
                }
                _ => match biomes {
                    Some(cells) => self.write_biomes(&chunk, layer, cells, snapshot.as_mut()),
                    None => LayerWrite::default(),
                },
            };
            allocated |= write.allocated;
            outcome.biomes_changed |= write.biomes_changed;
        }
        if allocated && let Some((from, to)) = self.bump_generation(chunk.identity()) {
            self.cache.restamp(outcome.touched.layers(), from, to);
        }

        for (&layer, levels) in &edit.block_light {
            outcome.lighting_changed |= write_light(&chunk, layer, levels, false);
        }
        for (&layer, levels) in &edit.sky_light {
            outcome.lighting_changed |= write_light(&chunk, layer, levels, true);
        }
        for (&kind, heights) in &edit.height_maps {
            let mut map = [0; HEIGHT_MAP_LEN];
            map.copy_from_slice(heights);
            chunk.set_height_map(kind, map);
            outcome.height_maps_changed = true;
        }

        if !outcome.touched.is_empty() || outcome.biomes_changed {
            dirty |= SAVE_DIRTY | NETWORK_DIRTY;
        }
        if outcome.lighting_changed {
            dirty |= LIGHT_DIRTY | NETWORK_DIRTY;
        }
        if outcome.height_maps_changed {
            dirty |= SAVE_DIRTY;
        }

        let mut tasks = Vec::with_capacity(3);
        if !edit.tiles.is_empty() {
            tasks.push(DeferredTask::ReplaceTiles(mem::take(&mut edit.tiles)));
        }
        if !edit.entity_adds.is_empty() {
            tasks.push(DeferredTask::AddEntities(mem::take(&mut edit.entity_adds)));
        }
        if !edit.entity_removes.is_empty() {
            tasks.push(DeferredTask::RemoveEntities(mem::take(&mut edit.entity_removes)));
        }
        if !tasks.is_empty() {
            dirty |= SAVE_DIRTY | NETWORK_DIRTY;
        }

        let (reply, receiver) = bounded(1);
        let scheduler = self.ctx.scheduler();
        let chain = Chain {
            pos: self.pos,
            chunk,
            world: Arc::clone(self.ctx.world()),
            world_fallback: self.ctx.settings().remove_entity_from_world_on_chunk_fail,
            tasks,
            snapshot,
            outcome,
            dirty,
            finalizer: Box::new(finalizer),
            structural: scheduler.sender(ExecutionContext::Structural),
            reply,
            started,
        };
        let job: Job = Box::new(move || chain.run());
        match scheduler.sender(ExecutionContext::SideEffects) {
            Some(side_effects) => {
                if let Err(job) = side_effects.send(job) {
                    tracing::debug!(context = ?side_effects.context(), "context closed or saturated; running inline");
                    job();
                }
            }
            None => job(),
        }

        Ok(CommitHandle {
            pos: self.pos,
            receiver,
            result: Mutex::new(None),
        })
    }

    /// Writes the block array of one layer, then its biome overlay.
    fn write_layer(
        &self,
        chunk: &LiveChunk,
        generation: u64,
        layer: i32,
        blocks: &[BlockOrdinal],
        biomes: Option<&[Option<BiomeId>]>,
        snapshot: Option<&mut SnapshotBuilder>,
    ) -> LayerWrite {
        let codec = self.ctx.codec();
        let mut write = LayerWrite::default();
        let Some(mut cached) = self.cache.lock(layer) else {
            return write;
        };
        let Some(mut slot) = chunk.lock_section(layer) else {
            return write;
        };
        let overlays_biomes = biomes.is_some_and(|cells| cells.iter().any(Option::is_some));
        if let Some(snapshot) = snapshot {
            snapshot.store_section(layer, slot.as_ref(), blocks, overlays_biomes, &**codec);
        }

        // The live section may have moved on since the cached view was taken.
        let mut dense = self.decode(slot.as_ref());
        let palette_len = slot.as_ref().map_or(0, NativeSection::palette_len);
        for (index, &ordinal) in blocks.iter().enumerate() {
            if ordinal.is_reserved() {
                continue;
            }
            let native = if codec.is_air(ordinal) {
                NativeBlock::AIR
            } else {
                codec.decode_block(ordinal)
            };
            dense[index] = if native.is_air() {
                BlockOrdinal::AIR
            } else {
                codec.encode_block(native)
            };
            match slot.as_mut() {
                Some(section) => section.set_block(index, native),
                None if native.is_air() => {}
                None => {
                    let mut section = NativeSection::new_air(codec.decode_biome(codec.default_biome()));
                    section.set_block(index, native);
                    *slot = Some(section);
                    write.allocated = true;
                }
            }
        }
        // Overwritten palette entries linger until compacted.
        if palette_len > 0
            && let Some(section) = slot.as_mut()
            && section.palette_len() > palette_len
        {
            section.compact();
        }
        if let Some(cells) = biomes {
            let (changed, allocated) = apply_biome_cells(&mut slot, cells, &**codec);
            write.biomes_changed = changed;
            write.allocated |= allocated;
        }

        if self.is_current(chunk.identity()) {
            cached.store(generation, dense);
        } else {
            tracing::debug!(chunk = %self.pos, layer, "chunk replaced mid-commit; cached layer reset");
            cached.clear();
        }
        write
    }

    /// Merges a biome overlay into a layer that has no block data.
    fn write_biomes(
        &self,
        chunk: &LiveChunk,
        layer: i32,
        cells: &[Option<BiomeId>],
        snapshot: Option<&mut SnapshotBuilder>,
    ) -> LayerWrite {
        if cells.iter().all(Option::is_none) {
            return LayerWrite::default();
        }
        let Some(mut slot) = chunk.lock_section(layer) else {
            return LayerWrite::default();
        };
        let codec = self.ctx.codec();
        if let Some(snapshot) = snapshot {
            snapshot.store_biomes(layer, slot.as_ref(), &**codec);
        }
        let (biomes_changed, allocated) = apply_biome_cells(&mut slot, cells, &**codec);
        LayerWrite {
            allocated,
            biomes_changed,
        }
    }
}

/// Writes the set cells of `cells`, allocating an air section to carry them if
/// needed. Returns `(changed, allocated)`.
fn apply_biome_cells<C: OrdinalCodec + ?Sized>(
    slot: &mut Option<NativeSection>,
    cells: &[Option<BiomeId>],
    codec: &C,
) -> (bool, bool) {
    if cells.iter().all(Option::is_none) {
        return (false, false);
    }
    let allocated = slot.is_none();
    let section =
        slot.get_or_insert_with(|| NativeSection::new_air(codec.decode_biome(codec.default_biome())));
    for (cell, biome) in cells.iter().enumerate() {
        if let Some(biome) = biome {
            section.set_biome(cell, codec.decode_biome(*biome));
        }
    }
    (true, allocated)
}

/// Overwrites one light channel of an allocated section.
fn write_light(chunk: &LiveChunk, layer: i32, levels: &[u8], sky: bool) -> bool {
    let Some(mut slot) = chunk.lock_section(layer) else {
        tracing::warn!(chunk = %chunk.pos(), layer, "light layer outside the chunk ignored");
        return false;
    };
    let Some(section) = slot.as_mut() else {
        return false;
    };
    let channel = if sky {
        section.sky_light_mut()
    } else {
        section.block_light_mut()
    };
    channel.copy_from(levels);
    true
}

// ---------------------------------------------------------------------------
// Deferred chain
// ---------------------------------------------------------------------------

enum DeferredTask {
    ReplaceTiles(FxHashMap<BlockPos, TileRecord>),
    AddEntities(Vec<EntityRecord>),
    RemoveEntities(FxHashSet<Uuid>),
}

impl DeferredTask {
    fn label(&self) -> &'static str {
        match self {
            Self::ReplaceTiles(_) => "tile replacement",
            Self::AddEntities(_) => "entity addition",
            Self::RemoveEntities(_) => "entity removal",
        }
    }

    fn run(
        self,
        chunk: &LiveChunk,
        world: &World,
        world_fallback: bool,
        mut snapshot: Option<&mut SnapshotBuilder>,
        confirmed: &mut FxHashSet<Uuid>,
    ) -> Result<(), String> {
        match self {
            Self::ReplaceTiles(tiles) => {
                for (pos, tile) in tiles {
                    if tile.id.is_empty() {
                        tracing::error!(chunk = %chunk.pos(), %pos, "tile without an id skipped");
                        continue;
                    }
                    if let Some(old) = chunk.insert_tile(pos, tile)
                        && let Some(snapshot) = snapshot.as_deref_mut()
                    {
                        snapshot.store_tile(pos, old);
                    }
                }
            }
            Self::AddEntities(entities) => {
                for entity in entities {
                    if entity.kind.is_empty() {
                        tracing::error!(chunk = %chunk.pos(), id = %entity.id, "entity without a kind skipped");
                        continue;
                    }
                    let id = entity.id;
                    if let Some(snapshot) = snapshot.as_deref_mut() {
                        if let Some(old) = chunk.entity(id) {
                            snapshot.store_entity(old);
                        }
                        snapshot.note_added_entity(id);
                    }
                    world.spawn_entity(entity).map_err(|err| err.to_string())?;
                }
            }
            Self::RemoveEntities(ids) => {
                for id in ids {
                    if let Some(removed) = chunk.remove_entity(id) {
                        if let Some(snapshot) = snapshot.as_deref_mut() {
                            snapshot.store_entity(removed);
                        }
                        confirmed.insert(id);
                    } else if world_fallback
                        && let Some(other) = world.find_entity_chunk(id)
                        && other.remove_entity(id).is_some()
                    {
                        tracing::debug!(%id, found_in = %other.pos(), "entity removed outside the edited chunk");
                        other.mark_dirty(SAVE_DIRTY | NETWORK_DIRTY);
                        confirmed.insert(id);
                    }
                }
            }
        }
        Ok(())
    }
}

/// Everything the deferred half of a commit needs, moved onto the
/// side-effect context in one piece.
struct Chain {
    pos: ChunkPos,
    chunk: Arc<LiveChunk>,
    world: WorldHandle,
    world_fallback: bool,
    tasks: Vec<DeferredTask>,
    snapshot: Option<SnapshotBuilder>,
    outcome: CommitOutcome,
    dirty: u8,
    finalizer: Box<dyn FnOnce() + Send>,
    structural: Option<ContextSender>,
    reply: Sender<CommitResult>,
    started: Instant,
}

impl Chain {
    /// Runs the tasks in order, stopping at the first failure, then hands the
    /// finalize step to the structural context.
    fn run(self) {
        let Chain {
            pos,
            chunk,
            world,
            world_fallback,
            tasks,
            mut snapshot,
            mut outcome,
            dirty,
            finalizer,
            structural,
            reply,
            started,
        } = self;

        let mut failure = None;
        for task in tasks {
            let label = task.label();
            let result = catch_unwind(AssertUnwindSafe(|| {
                task.run(
                    &chunk,
                    &world,
                    world_fallback,
                    snapshot.as_mut(),
                    &mut outcome.confirmed_removals,
                )
            }));
            let reason = match result {
                Ok(Ok(())) => continue,
                Ok(Err(reason)) => reason,
                Err(payload) => panic_message(payload.as_ref()),
            };
            tracing::error!(chunk = %pos, task = label, "deferred task failed: {}", reason);
            failure = Some(CommitError::DeferredTask {
                task: label,
                reason,
            });
            break;
        }
        outcome.snapshot = snapshot.map(|builder| Arc::new(builder.finish()));

        let finalize: Job = Box::new(move || {
            if dirty != 0 {
                chunk.mark_dirty(dirty);
            }
            if let Err(payload) = catch_unwind(AssertUnwindSafe(finalizer)) {
                tracing::error!(chunk = %pos, "commit finalizer panicked: {}", panic_message(payload.as_ref()));
            }
            tracing::debug!(
                chunk = %pos,
                touched = outcome.touched.len(),
                elapsed_us = started.elapsed().as_micros() as u64,
                "commit finished"
            );
            let _ = reply.send(failure.map_or(Ok(outcome), Err));
        });
        match structural {
            Some(structural) => {
                if let Err(finalize) = structural.send(finalize) {
                    tracing::debug!(context = ?structural.context(), "context closed or saturated; running inline");
                    finalize();
                }
            }
            None => finalize(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
