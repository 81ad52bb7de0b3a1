//! Edit sets: the bundle of overlays one commit applies to one chunk.
//!
//! Everything is optional. Block layers are 4096 ordinals where
//! [`BlockOrdinal::RESERVED`] means "leave alone"; biome layers are 64 cells
//! where `None` means "keep". Shapes are only checked by
//! [`EditSet::validate`], so hand-built overlays of the wrong length surface
//! as [`CommitError::MalformedEdit`] instead of a panic.

use std::collections::BTreeMap;

use rustc_hash::{FxHashMap, FxHashSet};
use uuid::Uuid;

use crate::codec::{BiomeId, BlockOrdinal};
use crate::error::{CommitError, EditArray};
use crate::section::{BIOME_CELLS, HEIGHT_MAP_LEN, SECTION_VOLUME, biome_index, block_index, section_of};
use crate::world::{BlockPos, EntityRecord, HeightMapKind, TileRecord};

/// Pending changes for a single chunk.
#[derive(Clone, Debug, Default)]
pub struct EditSet {
    pub(crate) blocks: BTreeMap<i32, Vec<BlockOrdinal>>,
    pub(crate) biomes: BTreeMap<i32, Vec<Option<BiomeId>>>,
    pub(crate) block_light: BTreeMap<i32, Vec<u8>>,
    pub(crate) sky_light: BTreeMap<i32, Vec<u8>>,
    pub(crate) height_maps: BTreeMap<HeightMapKind, Vec<i32>>,
    pub(crate) entity_adds: Vec<EntityRecord>,
    pub(crate) entity_removes: FxHashSet<Uuid>,
    pub(crate) tiles: FxHashMap<BlockPos, TileRecord>,
}

impl EditSet {
    /// An empty edit set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets one block at local `(x, z)` and absolute `y`.
    ///
    /// The layer's array is created on first use, filled with
    /// [`BlockOrdinal::RESERVED`] so every other block is left alone.
    pub fn set_block(&mut self, x: i32, y: i32, z: i32, ordinal: BlockOrdinal) -> &mut Self {
        let layer = self
            .blocks
            .entry(section_of(y))
            .or_insert_with(|| vec![BlockOrdinal::RESERVED; SECTION_VOLUME]);
        if let Some(slot) = layer.get_mut(block_index(x, y, z)) {
            *slot = ordinal;
        }
        self
    }

    /// Replaces the whole block array of `layer`.
    pub fn set_layer_blocks(&mut self, layer: i32, ordinals: Vec<BlockOrdinal>) -> &mut Self {
        self.blocks.insert(layer, ordinals);
        self
    }

    /// Sets the biome cell containing `(x, y, z)`.
    pub fn set_biome(&mut self, x: i32, y: i32, z: i32, biome: BiomeId) -> &mut Self {
        let layer = self
            .biomes
            .entry(section_of(y))
            .or_insert_with(|| vec![None; BIOME_CELLS]);
        if let Some(cell) = layer.get_mut(biome_index(x, y, z)) {
            *cell = Some(biome);
        }
        self
    }

    /// Replaces the whole biome overlay of `layer`.
    pub fn set_layer_biomes(&mut self, layer: i32, cells: Vec<Option<BiomeId>>) -> &mut Self {
        self.biomes.insert(layer, cells);
        self
    }

    /// Replaces the block-light channel of `layer`.
    pub fn set_block_light(&mut self, layer: i32, levels: Vec<u8>) -> &mut Self {
        self.block_light.insert(layer, levels);
        self
    }

    /// Replaces the sky-light channel of `layer`.
    pub fn set_sky_light(&mut self, layer: i32, levels: Vec<u8>) -> &mut Self {
        self.sky_light.insert(layer, levels);
        self
    }

    /// Replaces the height map of `kind`.
    pub fn set_height_map(&mut self, kind: HeightMapKind, heights: Vec<i32>) -> &mut Self {
        self.height_maps.insert(kind, heights);
        self
    }

    /// Queues an entity to spawn.
    pub fn add_entity(&mut self, entity: EntityRecord) -> &mut Self {
        self.entity_adds.push(entity);
        self
    }

    /// Queues an entity to despawn.
    pub fn remove_entity(&mut self, id: Uuid) -> &mut Self {
        self.entity_removes.insert(id);
        self
    }

    /// Queues a tile at chunk-local `pos`, replacing whatever is there.
    pub fn set_tile(&mut self, pos: BlockPos, tile: TileRecord) -> &mut Self {
        self.tiles.insert(pos, tile);
        self
    }

    /// Block array of `layer`, if any.
    pub fn layer_blocks(&self, layer: i32) -> Option<&[BlockOrdinal]> {
        self.blocks.get(&layer).map(Vec::as_slice)
    }

    /// Biome overlay of `layer`, if any.
    pub fn layer_biomes(&self, layer: i32) -> Option<&[Option<BiomeId>]> {
        self.biomes.get(&layer).map(Vec::as_slice)
    }

    /// Block ordinal this edit writes at `(x, y, z)`, or reserved when untouched.
    pub fn block(&self, x: i32, y: i32, z: i32) -> BlockOrdinal {
        self.blocks
            .get(&section_of(y))
            .and_then(|layer| layer.get(block_index(x, y, z)))
            .copied()
            .unwrap_or(BlockOrdinal::RESERVED)
    }

    /// Entities queued for spawning.
    pub fn entity_adds(&self) -> &[EntityRecord] {
        &self.entity_adds
    }

    /// Entity ids queued for removal.
    pub fn entity_removes(&self) -> &FxHashSet<Uuid> {
        &self.entity_removes
    }

    /// Tiles queued for placement.
    pub fn tiles(&self) -> &FxHashMap<BlockPos, TileRecord> {
        &self.tiles
    }

    /// Returns `true` if this edit writes a real block at `pos`.
    pub(crate) fn overwrites(&self, pos: BlockPos) -> bool {
        !self.block(pos.x, pos.y, pos.z).is_reserved()
    }

    /// Returns `true` if the edit carries nothing at all.
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
            && self.biomes.is_empty()
            && self.block_light.is_empty()
            && self.sky_light.is_empty()
            && self.height_maps.is_empty()
            && self.entity_adds.is_empty()
            && self.entity_removes.is_empty()
            && self.tiles.is_empty()
    }

    /// Checks every array length and tile key against a chunk spanning
    /// `min_section..=max_section`.
    ///
    /// Layers outside the range are tolerated here and ignored by the commit.
    ///
    /// # Errors
    ///
    /// [`CommitError::MalformedEdit`] for a wrong-length array,
    /// [`CommitError::TileOutOfBounds`] for a tile outside the chunk.
    pub fn validate(&self, min_section: i32, max_section: i32) -> Result<(), CommitError> {
        check_layers(&self.blocks, EditArray::Blocks, SECTION_VOLUME)?;
        check_layers(&self.biomes, EditArray::Biomes, BIOME_CELLS)?;
        check_layers(&self.block_light, EditArray::BlockLight, SECTION_VOLUME)?;
        check_layers(&self.sky_light, EditArray::SkyLight, SECTION_VOLUME)?;
        for heights in self.height_maps.values() {
            if heights.len() != HEIGHT_MAP_LEN {
                return Err(CommitError::MalformedEdit {
                    array: EditArray::HeightMap,
                    layer: None,
                    expected: HEIGHT_MAP_LEN,
                    actual: heights.len(),
                });
            }
        }
        let bottom = min_section * 16;
        let top = max_section * 16 + 15;
        if let Some(pos) = self
            .tiles
            .keys()
            .find(|pos| !pos.is_local() || pos.y < bottom || pos.y > top)
        {
            return Err(CommitError::TileOutOfBounds { pos: *pos });
        }
        Ok(())
    }
}

fn check_layers<T>(
    layers: &BTreeMap<i32, Vec<T>>,
    array: EditArray,
    expected: usize,
) -> Result<(), CommitError> {
    match layers.iter().find(|(_, values)| values.len() != expected) {
        Some((layer, values)) => Err(CommitError::MalformedEdit {
            array,
            layer: Some(*layer),
            expected,
            actual: values.len(),
        }),
        None => Ok(()),
    }
}
