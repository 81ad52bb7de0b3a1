//! Ordinal codec: compact per-process block and biome ordinals on one side,
//! native world ids on the other.
//!
//! Edits are expressed in ordinals. Every conversion is total: anything the
//! codec does not recognize resolves to air (blocks) or the default biome.

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::section::{NativeBiome, NativeBlock};

// ---------------------------------------------------------------------------
// Ordinals
// ---------------------------------------------------------------------------

/// Compact block variant identifier, valid only for the lifetime of the process.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlockOrdinal(pub u16);

impl BlockOrdinal {
    /// "Leave this block alone". Never materialized as a real block.
    pub const RESERVED: Self = Self(0);
    /// Canonical air.
    pub const AIR: Self = Self(1);
    /// Cave air; stored as canonical air.
    pub const CAVE_AIR: Self = Self(2);
    /// Void air; stored as canonical air.
    pub const VOID_AIR: Self = Self(3);

    /// Returns `true` for the reserved sentinel.
    pub fn is_reserved(self) -> bool {
        self == Self::RESERVED
    }

    /// Returns `true` for air, cave air and void air.
    pub fn is_air_family(self) -> bool {
        matches!(self.0, 1..=3)
    }
}

/// Compact biome identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BiomeId(pub u16);

/// Conversions between ordinals and native ids.
///
/// Implementations must be total: lookups never fail, they fall back to air or
/// to [`OrdinalCodec::default_biome`].
pub trait OrdinalCodec: Send + Sync + 'static {
    /// Ordinal for a native block; unknown blocks encode as [`BlockOrdinal::AIR`].
    fn encode_block(&self, block: NativeBlock) -> BlockOrdinal;

    /// Native block for an ordinal; reserved and unknown ordinals decode as air.
    fn decode_block(&self, ordinal: BlockOrdinal) -> NativeBlock;

    /// Biome id for a native biome; unknown biomes encode as the default.
    fn encode_biome(&self, biome: NativeBiome) -> BiomeId;

    /// Native biome for a biome id; unknown ids decode as the default.
    fn decode_biome(&self, biome: BiomeId) -> NativeBiome;

    /// Biome given to freshly allocated sections.
    fn default_biome(&self) -> BiomeId;

    /// Whether `ordinal` belongs to the air family.
    fn is_air(&self, ordinal: BlockOrdinal) -> bool {
        ordinal.is_air_family()
    }
}

// ---------------------------------------------------------------------------
// Palette
// ---------------------------------------------------------------------------

/// A block variant known to the palette.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockDef {
    /// Namespaced name, e.g. `"minecraft:stone"`.
    pub name: String,
    /// Id of this variant in the live world.
    pub native: NativeBlock,
}

/// A biome known to the palette.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BiomeDef {
    /// Namespaced name, e.g. `"minecraft:plains"`.
    pub name: String,
    /// Id of this biome in the live world.
    pub native: NativeBiome,
}

/// Errors raised while building a [`BlockPalette`].
#[derive(Debug, Error)]
pub enum PaletteError {
    /// A block or biome with this name was already registered.
    #[error("duplicate palette entry: {0}")]
    DuplicateName(String),
    /// Every ordinal has been handed out.
    #[error("palette is full ({0} entries)")]
    Full(usize),
}

/// Name of the reserved sentinel entry.
const RESERVED_NAME: &str = "strata:__reserved__";

/// Default biome registered by every palette.
pub const PLAINS: &str = "minecraft:plains";

/// Registry-backed [`OrdinalCodec`].
///
/// Built once at startup. Ordinals are assigned sequentially: 0 is the
/// reserved sentinel, 1..=3 the air family, registered blocks follow. Several
/// ordinals may share a native id; encoding picks the first one registered.
pub struct BlockPalette {
    /// Dense table where `index == ordinal`.
    blocks: Vec<BlockDef>,
    block_names: FxHashMap<String, BlockOrdinal>,
    native_blocks: FxHashMap<NativeBlock, BlockOrdinal>,
    biomes: Vec<BiomeDef>,
    biome_names: FxHashMap<String, BiomeId>,
    native_biomes: FxHashMap<NativeBiome, BiomeId>,
}

impl BlockPalette {
    /// Creates a palette holding the reserved sentinel, the air family and plains.
    pub fn new() -> Self {
        let mut palette = Self {
            blocks: Vec::new(),
            block_names: FxHashMap::default(),
            native_blocks: FxHashMap::default(),
            biomes: Vec::new(),
            biome_names: FxHashMap::default(),
            native_biomes: FxHashMap::default(),
        };
        let builtins = [
            RESERVED_NAME,
            "minecraft:air",
            "minecraft:cave_air",
            "minecraft:void_air",
        ];
        for name in builtins {
            palette.push_block(BlockDef {
                name: name.to_string(),
                native: NativeBlock::AIR,
            });
        }
        // The sentinel must never win the native → ordinal lookup.
        palette
            .native_blocks
            .insert(NativeBlock::AIR, BlockOrdinal::AIR);
        palette.push_biome(BiomeDef {
            name: PLAINS.to_string(),
            native: NativeBiome(1),
        });
        palette
    }

    /// Registers a block variant and returns its ordinal.
    ///
    /// # Errors
    ///
    /// [`PaletteError::DuplicateName`] if the name is taken,
    /// [`PaletteError::Full`] once all `u16` ordinals are used.
    pub fn register_block(&mut self, def: BlockDef) -> Result<BlockOrdinal, PaletteError> {
        if self.block_names.contains_key(&def.name) {
            return Err(PaletteError::DuplicateName(def.name));
        }
        if self.blocks.len() > usize::from(u16::MAX) {
            return Err(PaletteError::Full(self.blocks.len()));
        }
        Ok(self.push_block(def))
    }

    /// Registers a biome and returns its id.
    ///
    /// # Errors
    ///
    /// Same conditions as [`BlockPalette::register_block`].
    pub fn register_biome(&mut self, def: BiomeDef) -> Result<BiomeId, PaletteError> {
        if self.biome_names.contains_key(&def.name) {
            return Err(PaletteError::DuplicateName(def.name));
        }
        if self.biomes.len() > usize::from(u16::MAX) {
            return Err(PaletteError::Full(self.biomes.len()));
        }
        Ok(self.push_biome(def))
    }

    /// Ordinal registered under `name`.
    pub fn block(&self, name: &str) -> Option<BlockOrdinal> {
        self.block_names.get(name).copied()
    }

    /// Biome id registered under `name`.
    pub fn biome(&self, name: &str) -> Option<BiomeId> {
        self.biome_names.get(name).copied()
    }

    /// Definition behind an ordinal.
    pub fn block_def(&self, ordinal: BlockOrdinal) -> Option<&BlockDef> {
        self.blocks.get(usize::from(ordinal.0))
    }

    /// Number of block ordinals, builtins included.
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    /// Returns `true` if only the builtins are registered.
    pub fn is_empty(&self) -> bool {
        self.blocks.len() <= 4
    }

    fn push_block(&mut self, def: BlockDef) -> BlockOrdinal {
        let ordinal = BlockOrdinal(self.blocks.len() as u16);
        self.block_names.insert(def.name.clone(), ordinal);
        self.native_blocks.entry(def.native).or_insert(ordinal);
        self.blocks.push(def);
        ordinal
    }

    fn push_biome(&mut self, def: BiomeDef) -> BiomeId {
        let id = BiomeId(self.biomes.len() as u16);
        self.biome_names.insert(def.name.clone(), id);
        self.native_biomes.entry(def.native).or_insert(id);
        self.biomes.push(def);
        id
    }
}

impl Default for BlockPalette {
    fn default() -> Self {
        Self::new()
    }
}

impl OrdinalCodec for BlockPalette {
    fn encode_block(&self, block: NativeBlock) -> BlockOrdinal {
        self.native_blocks
            .get(&block)
            .copied()
            .unwrap_or(BlockOrdinal::AIR)
    }

    fn decode_block(&self, ordinal: BlockOrdinal) -> NativeBlock {
        if ordinal.is_reserved() {
            return NativeBlock::AIR;
        }
        self.blocks
            .get(usize::from(ordinal.0))
            .map_or(NativeBlock::AIR, |def| def.native)
    }

    fn encode_biome(&self, biome: NativeBiome) -> BiomeId {
        self.native_biomes
            .get(&biome)
            .copied()
            .unwrap_or_else(|| self.default_biome())
    }

    fn decode_biome(&self, biome: BiomeId) -> NativeBiome {
        let fallback = self.biomes[usize::from(self.default_biome().0)].native;
        self.biomes
            .get(usize::from(biome.0))
            .map_or(fallback, |def| def.native)
    }

    fn default_biome(&self) -> BiomeId {
        BiomeId(0)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn stone() -> BlockDef {
        BlockDef {
            name: "minecraft:stone".to_string(),
            native: NativeBlock(16),
        }
    }

    #[test]
    fn test_builtin_ordinals() {
        let palette = BlockPalette::new();
        assert_eq!(palette.block("minecraft:air"), Some(BlockOrdinal::AIR));
        assert_eq!(palette.block("minecraft:cave_air"), Some(BlockOrdinal::CAVE_AIR));
        assert_eq!(palette.block("minecraft:void_air"), Some(BlockOrdinal::VOID_AIR));
        assert_eq!(palette.biome(PLAINS), Some(palette.default_biome()));
        assert!(palette.is_empty());
    }

    #[test]
    fn test_register_assigns_sequential_ordinals() {
        let mut palette = BlockPalette::new();
        let stone = palette.register_block(stone()).unwrap();
        let dirt = palette
            .register_block(BlockDef {
                name: "minecraft:dirt".to_string(),
                native: NativeBlock(48),
            })
            .unwrap();
        assert_eq!(stone, BlockOrdinal(4));
        assert_eq!(dirt, BlockOrdinal(5));
        assert_eq!(palette.len(), 6);
        assert_eq!(palette.block("minecraft:dirt"), Some(dirt));
        assert_eq!(palette.block("minecraft:gravel"), None);
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let mut palette = BlockPalette::new();
        palette.register_block(stone()).unwrap();
        let result = palette.register_block(stone());
        assert!(matches!(result, Err(PaletteError::DuplicateName(_))));
    }

    #[test]
    fn test_block_roundtrip_through_native() {
        let mut palette = BlockPalette::new();
        let stone = palette.register_block(stone()).unwrap();
        assert_eq!(palette.decode_block(stone), NativeBlock(16));
        assert_eq!(palette.encode_block(NativeBlock(16)), stone);
    }

    #[test]
    fn test_unknown_inputs_resolve_to_defaults() {
        let palette = BlockPalette::new();
        assert_eq!(palette.decode_block(BlockOrdinal(9_999)), NativeBlock::AIR);
        assert_eq!(palette.decode_block(BlockOrdinal::RESERVED), NativeBlock::AIR);
        assert_eq!(palette.encode_block(NativeBlock(777)), BlockOrdinal::AIR);
        assert_eq!(palette.encode_biome(NativeBiome(200)), palette.default_biome());
        assert_eq!(palette.decode_biome(BiomeId(500)), NativeBiome(1));
    }

    #[test]
    fn test_native_air_encodes_as_canonical_air() {
        let palette = BlockPalette::new();
        assert_eq!(palette.encode_block(NativeBlock::AIR), BlockOrdinal::AIR);
        assert_eq!(palette.decode_block(BlockOrdinal::CAVE_AIR), NativeBlock::AIR);
    }

    #[test]
    fn test_air_family() {
        let palette = BlockPalette::new();
        assert!(palette.is_air(BlockOrdinal::AIR));
        assert!(palette.is_air(BlockOrdinal::VOID_AIR));
        assert!(!palette.is_air(BlockOrdinal::RESERVED));
        assert!(!palette.is_air(BlockOrdinal(4)));
    }

    #[test]
    fn test_biome_registration() {
        let mut palette = BlockPalette::new();
        let desert = palette
            .register_biome(BiomeDef {
                name: "minecraft:desert".to_string(),
                native: NativeBiome(2),
            })
            .unwrap();
        assert_eq!(desert, BiomeId(1));
        assert_eq!(palette.decode_biome(desert), NativeBiome(2));
        assert_eq!(palette.encode_biome(NativeBiome(2)), desert);
    }
}
