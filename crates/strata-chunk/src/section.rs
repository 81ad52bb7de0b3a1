//! Native section storage as the live world keeps it.
//!
//! A [`NativeSection`] holds the 16×16×16 blocks of one vertical slice of a
//! chunk in palette-compressed form, plus coarse biome cells and the two light
//! channels. Edits never address it directly: they go through the ordinal
//! codec and the section store.

use serde::{Deserialize, Serialize};
use static_assertions::const_assert_eq;

use crate::packed::{NibbleArray, PackedArray};

/// Side length of a section in blocks.
pub const SECTION_SIZE: usize = 16;

/// Blocks per section (16³).
pub const SECTION_VOLUME: usize = SECTION_SIZE * SECTION_SIZE * SECTION_SIZE;

/// Biome cells per section; one cell covers 4×4×4 blocks.
pub const BIOME_CELLS: usize = 64;

/// Columns per chunk, i.e. entries in one height map.
pub const HEIGHT_MAP_LEN: usize = SECTION_SIZE * SECTION_SIZE;

const_assert_eq!(SECTION_VOLUME, 4096);
const_assert_eq!(BIOME_CELLS * 64, SECTION_VOLUME);

/// Runtime block id as understood by the live world.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NativeBlock(pub u32);

impl NativeBlock {
    /// The world's only air block.
    pub const AIR: Self = Self(0);

    /// Returns `true` for [`NativeBlock::AIR`].
    pub fn is_air(self) -> bool {
        self == Self::AIR
    }
}

/// Biome id as understood by the live world.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NativeBiome(pub u8);

/// Index of block `(x, y, z)` inside its section. Coordinates are masked to 4 bits.
pub fn block_index(x: i32, y: i32, z: i32) -> usize {
    (((y & 15) << 8) | ((z & 15) << 4) | (x & 15)) as usize
}

/// Index of the biome cell containing block `(x, y, z)`.
pub fn biome_index(x: i32, y: i32, z: i32) -> usize {
    ((((y & 15) >> 2) << 4) | (((z & 15) >> 2) << 2) | ((x & 15) >> 2)) as usize
}

/// Section index holding absolute block height `y`.
pub fn section_of(y: i32) -> i32 {
    y >> 4
}

/// One allocated 16×16×16 slice of a live chunk.
#[derive(Clone, Debug)]
pub struct NativeSection {
    /// Distinct blocks present; index 0 is whatever the section was created with.
    palette: Vec<NativeBlock>,
    /// Palette index per block.
    indices: PackedArray,
    biomes: [NativeBiome; BIOME_CELLS],
    block_light: NibbleArray,
    sky_light: NibbleArray,
}

impl NativeSection {
    /// An all-air section whose biome cells all hold `biome`.
    pub fn new_air(biome: NativeBiome) -> Self {
        Self {
            palette: vec![NativeBlock::AIR],
            indices: PackedArray::new(0, SECTION_VOLUME),
            biomes: [biome; BIOME_CELLS],
            block_light: NibbleArray::new(),
            sky_light: NibbleArray::new(),
        }
    }

    /// Block at section index `index`.
    pub fn block(&self, index: usize) -> NativeBlock {
        self.palette[usize::from(self.indices.get(index))]
    }

    /// Writes `block` at section index `index`, growing the palette if needed.
    pub fn set_block(&mut self, index: usize, block: NativeBlock) {
        let slot = self.palette_slot(block);
        self.indices.set(index, slot as u16);
    }

    /// Biome of cell `cell`.
    pub fn biome(&self, cell: usize) -> NativeBiome {
        self.biomes[cell]
    }

    /// Overwrites biome cell `cell`.
    pub fn set_biome(&mut self, cell: usize, biome: NativeBiome) {
        self.biomes[cell] = biome;
    }

    /// All biome cells.
    pub fn biomes(&self) -> &[NativeBiome; BIOME_CELLS] {
        &self.biomes
    }

    /// Emitted (block) light at `index`.
    pub fn block_light(&self, index: usize) -> u8 {
        self.block_light.get(index)
    }

    /// Sky light at `index`.
    pub fn sky_light(&self, index: usize) -> u8 {
        self.sky_light.get(index)
    }

    /// Mutable block-light channel.
    pub fn block_light_mut(&mut self) -> &mut NibbleArray {
        &mut self.block_light
    }

    /// Mutable sky-light channel.
    pub fn sky_light_mut(&mut self) -> &mut NibbleArray {
        &mut self.sky_light
    }

    /// Number of palette entries, used or not.
    pub fn palette_len(&self) -> usize {
        self.palette.len()
    }

    /// Returns `true` if every block is air.
    pub fn is_empty(&self) -> bool {
        let air_slots: Vec<bool> = self.palette.iter().map(|b| b.is_air()).collect();
        if self.indices.bits() == 0 {
            return air_slots[0];
        }
        self.indices.iter().all(|slot| air_slots[usize::from(slot)])
    }

    /// Drops unused palette entries and narrows the index width when possible.
    pub fn compact(&mut self) {
        if self.indices.bits() == 0 {
            return;
        }
        let mut used = vec![false; self.palette.len()];
        for slot in self.indices.iter() {
            used[usize::from(slot)] = true;
        }

        let mut remap = vec![0u16; self.palette.len()];
        let mut palette = Vec::with_capacity(self.palette.len());
        for (old, block) in self.palette.iter().enumerate() {
            if used[old] {
                remap[old] = palette.len() as u16;
                palette.push(*block);
            }
        }

        let mut indices = PackedArray::new(width_for(palette.len()), SECTION_VOLUME);
        for index in 0..SECTION_VOLUME {
            indices.set(index, remap[usize::from(self.indices.get(index))]);
        }
        self.palette = palette;
        self.indices = indices;
    }

    fn palette_slot(&mut self, block: NativeBlock) -> usize {
        if let Some(slot) = self.palette.iter().position(|&b| b == block) {
            return slot;
        }
        let width = width_for(self.palette.len() + 1);
        if width != self.indices.bits() {
            self.indices = self.indices.with_width(width);
        }
        self.palette.push(block);
        self.palette.len() - 1
    }
}

/// Index width needed to address a palette of `size` entries.
fn width_for(size: usize) -> u8 {
    match size {
        0 | 1 => 0,
        2..=4 => 2,
        5..=16 => 4,
        17..=256 => 8,
        _ => 16,
    }
}
