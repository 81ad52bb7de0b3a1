//! Immutable pre-edit captures used for undo.
//!
//! A [`Snapshot`] owns copies of exactly what one commit overwrote: the block
//! pre-image of every position it wrote, the biome cells of every layer whose
//! biomes it overlaid, and the tiles and entities it replaced or removed. It
//! never refers back to the live chunk. Anything outside that domain reads as
//! the default.

use std::collections::BTreeMap;

use rustc_hash::{FxHashMap, FxHashSet};
use uuid::Uuid;

use crate::codec::{BiomeId, BlockOrdinal, OrdinalCodec};
use crate::edit_set::EditSet;
use crate::layer_cache::{DenseLayer, dense_air};
use crate::section::{BIOME_CELLS, NativeSection, SECTION_VOLUME, biome_index, block_index, section_of};
use crate::world::{BlockPos, ChunkPos, EntityRecord, TileRecord};

/// One bit per block of a section.
type TouchMask = Box<[u64; SECTION_VOLUME / 64]>;

fn is_set(mask: &TouchMask, index: usize) -> bool {
    mask[index / 64] & (1 << (index % 64)) != 0
}

/// Captured state of one layer.
#[derive(Clone, Debug)]
struct SnapshotLayer {
    blocks: Option<DenseLayer>,
    touched: Option<TouchMask>,
    biomes: Option<Box<[BiomeId; BIOME_CELLS]>>,
    /// Whether the section existed before the commit.
    allocated: bool,
}

/// Pre-edit state of one chunk, as captured by a single commit.
#[derive(Clone, Debug)]
pub struct Snapshot {
    pos: ChunkPos,
    default_biome: BiomeId,
    layers: BTreeMap<i32, SnapshotLayer>,
    tiles: FxHashMap<BlockPos, TileRecord>,
    entities: FxHashMap<Uuid, EntityRecord>,
    added_entities: FxHashSet<Uuid>,
}

impl Snapshot {
    /// Chunk this snapshot was taken from.
    pub fn pos(&self) -> ChunkPos {
        self.pos
    }

    /// Pre-edit ordinal at `(x, y, z)`; air where the commit wrote nothing.
    pub fn read_block(&self, x: i32, y: i32, z: i32) -> BlockOrdinal {
        let index = block_index(x, y, z);
        self.layers
            .get(&section_of(y))
            .and_then(|layer| match (&layer.blocks, &layer.touched) {
                (Some(blocks), Some(touched)) if is_set(touched, index) => Some(blocks[index]),
                _ => None,
            })
            .unwrap_or(BlockOrdinal::AIR)
    }

    /// Returns `true` if the commit wrote the block at `(x, y, z)`.
    pub fn was_touched(&self, x: i32, y: i32, z: i32) -> bool {
        self.layers
            .get(&section_of(y))
            .and_then(|layer| layer.touched.as_ref())
            .is_some_and(|touched| is_set(touched, block_index(x, y, z)))
    }

    /// Pre-edit biome at `(x, y, z)`; the default biome for uncaptured layers.
    pub fn read_biome(&self, x: i32, y: i32, z: i32) -> BiomeId {
        self.layers
            .get(&section_of(y))
            .and_then(|layer| layer.biomes.as_ref())
            .map_or(self.default_biome, |biomes| biomes[biome_index(x, y, z)])
    }

    /// Tile the commit replaced or evicted at chunk-local `(x, y, z)`.
    pub fn tile(&self, x: i32, y: i32, z: i32) -> Option<&TileRecord> {
        self.tiles.get(&BlockPos::new(x & 15, y, z & 15))
    }

    /// Every captured tile.
    pub fn tiles(&self) -> &FxHashMap<BlockPos, TileRecord> {
        &self.tiles
    }

    /// Entity the commit replaced or removed.
    pub fn entity(&self, id: Uuid) -> Option<&EntityRecord> {
        self.entities.get(&id)
    }

    /// Every captured entity.
    pub fn entities(&self) -> impl Iterator<Item = &EntityRecord> {
        self.entities.values()
    }

    /// Layers with captured block or biome data, low to high.
    pub fn captured_layers(&self) -> impl Iterator<Item = i32> + '_ {
        self.layers.keys().copied()
    }

    /// Returns `true` if `layer` was captured.
    pub fn has_layer(&self, layer: i32) -> bool {
        self.layers.contains_key(&layer)
    }

    /// Whether `layer`'s section existed before the commit. `false` if not captured.
    pub fn was_allocated(&self, layer: i32) -> bool {
        self.layers.get(&layer).is_some_and(|layer| layer.allocated)
    }

    /// Returns `true` if nothing was captured.
    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
            && self.tiles.is_empty()
            && self.entities.is_empty()
            && self.added_entities.is_empty()
    }

    /// Builds the edit that reverts the originating commit.
    ///
    /// Written blocks get their pre-image back, captured biome layers are
    /// rewritten in full, captured tiles and entities are put back and entities
    /// the commit spawned are removed. Light and height maps are not captured
    /// and stay as the commit left them.
    pub fn restore_edit(&self) -> EditSet {
        let mut edit = EditSet::new();
        for (&layer, captured) in &self.layers {
            if let (Some(blocks), Some(touched)) = (&captured.blocks, &captured.touched) {
                let ordinals = (0..SECTION_VOLUME)
                    .map(|index| {
                        if is_set(touched, index) {
                            blocks[index]
                        } else {
                            BlockOrdinal::RESERVED
                        }
                    })
                    .collect();
                edit.set_layer_blocks(layer, ordinals);
            }
            if let Some(biomes) = &captured.biomes {
                edit.set_layer_biomes(layer, biomes.iter().copied().map(Some).collect());
            }
        }
        for (pos, tile) in &self.tiles {
            edit.set_tile(*pos, tile.clone());
        }
        for entity in self.entities.values() {
            edit.add_entity(entity.clone());
        }
        for id in &self.added_entities {
            if !self.entities.contains_key(id) {
                edit.remove_entity(*id);
            }
        }
        edit
    }
}

/// Accumulates a [`Snapshot`] while a commit runs. The first capture of any
/// piece of state wins; later captures of the same thing are ignored.
#[derive(Debug)]
pub(crate) struct SnapshotBuilder {
    snapshot: Snapshot,
}

impl SnapshotBuilder {
    pub(crate) fn new(pos: ChunkPos, default_biome: BiomeId) -> Self {
        Self {
            snapshot: Snapshot {
                pos,
                default_biome,
                layers: BTreeMap::new(),
                tiles: FxHashMap::default(),
                entities: FxHashMap::default(),
                added_entities: FxHashSet::default(),
            },
        }
    }

    /// Captures blocks of `layer` before `written` is applied to it, and its
    /// biome cells when `with_biomes` says the same commit overlays them.
    pub(crate) fn store_section<C: OrdinalCodec + ?Sized>(
        &mut self,
        layer: i32,
        section: Option<&NativeSection>,
        written: &[BlockOrdinal],
        with_biomes: bool,
        codec: &C,
    ) {
        let default_biome = self.snapshot.default_biome;
        let entry = self.layer_entry(layer, section);
        if entry.blocks.is_none() {
            let mut blocks = dense_air();
            if let Some(section) = section {
                for (index, slot) in blocks.iter_mut().enumerate() {
                    *slot = codec.encode_block(section.block(index));
                }
            }
            let mut touched: TouchMask = Box::new([0; SECTION_VOLUME / 64]);
            for (index, ordinal) in written.iter().enumerate() {
                if !ordinal.is_reserved() {
                    touched[index / 64] |= 1 << (index % 64);
                }
            }
            entry.blocks = Some(blocks);
            entry.touched = Some(touched);
        }
        if with_biomes && entry.biomes.is_none() {
            entry.biomes = Some(capture_biomes(section, codec, default_biome));
        }
    }

    /// Captures only the biome cells of `layer`.
    pub(crate) fn store_biomes<C: OrdinalCodec + ?Sized>(
        &mut self,
        layer: i32,
        section: Option<&NativeSection>,
        codec: &C,
    ) {
        let default_biome = self.snapshot.default_biome;
        let entry = self.layer_entry(layer, section);
        if entry.biomes.is_none() {
            entry.biomes = Some(capture_biomes(section, codec, default_biome));
        }
    }

    pub(crate) fn store_tile(&mut self, pos: BlockPos, tile: TileRecord) {
        self.snapshot.tiles.entry(pos).or_insert(tile);
    }

    pub(crate) fn store_entity(&mut self, entity: EntityRecord) {
        self.snapshot.entities.entry(entity.id).or_insert(entity);
    }

    pub(crate) fn note_added_entity(&mut self, id: Uuid) {
        self.snapshot.added_entities.insert(id);
    }

    pub(crate) fn finish(self) -> Snapshot {
        self.snapshot
    }

    fn layer_entry(&mut self, layer: i32, section: Option<&NativeSection>) -> &mut SnapshotLayer {
        self.snapshot
            .layers
            .entry(layer)
            .or_insert_with(|| SnapshotLayer {
                blocks: None,
                touched: None,
                biomes: None,
                allocated: section.is_some(),
            })
    }
}

fn capture_biomes<C: OrdinalCodec + ?Sized>(
    section: Option<&NativeSection>,
    codec: &C,
    default_biome: BiomeId,
) -> Box<[BiomeId; BIOME_CELLS]> {
    let mut biomes = Box::new([default_biome; BIOME_CELLS]);
    if let Some(section) = section {
        for (cell, slot) in biomes.iter_mut().enumerate() {
            *slot = codec.encode_biome(section.biome(cell));
        }
    }
    biomes
}
