//! Per-layer cache of dense ordinal arrays.
//!
//! Each cached layer remembers the store generation it was decoded under; a
//! lookup with any other generation misses. Every layer has its own lock, held
//! by readers while they copy the array out and by the committing thread while
//! it rewrites the matching native section.

use std::sync::{Mutex, MutexGuard};

use crate::codec::BlockOrdinal;
use crate::section::SECTION_VOLUME;
use crate::sync::lock;

/// One section's blocks as ordinals, indexed like a native section.
pub type DenseLayer = Box<[BlockOrdinal; SECTION_VOLUME]>;

/// A dense layer of canonical air.
pub fn dense_air() -> DenseLayer {
    Box::new([BlockOrdinal::AIR; SECTION_VOLUME])
}

#[derive(Debug, Default)]
struct CachedLayer {
    data: Option<DenseLayer>,
    generation: u64,
}

/// Cache of dense layers for sections `min_section..=max_section`.
#[derive(Debug)]
pub struct LayerCache {
    min_section: i32,
    slots: Box<[Mutex<CachedLayer>]>,
}

/// Exclusive access to one cached layer.
pub struct LayerGuard<'a> {
    slot: MutexGuard<'a, CachedLayer>,
}

impl LayerGuard<'_> {
    /// The cached array, if it was stored under `generation`.
    pub fn get(&self, generation: u64) -> Option<&DenseLayer> {
        self.slot
            .data
            .as_ref()
            .filter(|_| self.slot.generation == generation)
    }

    /// Replaces the cached array.
    pub fn store(&mut self, generation: u64, data: DenseLayer) {
        self.slot.data = Some(data);
        self.slot.generation = generation;
    }

    /// Drops the cached array.
    pub fn clear(&mut self) {
        self.slot.data = None;
    }
}

impl LayerCache {
    /// Creates an empty cache for the given section range.
    pub fn new(min_section: i32, max_section: i32) -> Self {
        let count = (max_section - min_section + 1).max(0) as usize;
        Self {
            min_section,
            slots: (0..count).map(|_| Mutex::new(CachedLayer::default())).collect(),
        }
    }

    /// Locks `layer`. Returns `None` outside the cached range.
    pub fn lock(&self, layer: i32) -> Option<LayerGuard<'_>> {
        let index = usize::try_from(layer - self.min_section).ok()?;
        self.slots.get(index).map(|slot| LayerGuard { slot: lock(slot) })
    }

    /// Copy of `layer` if it is cached under `generation`.
    pub fn get(&self, layer: i32, generation: u64) -> Option<DenseLayer> {
        self.lock(layer)?.get(generation).cloned()
    }

    /// Stores `data` for `layer` under `generation`.
    pub fn store(&self, layer: i32, generation: u64, data: DenseLayer) {
        if let Some(mut guard) = self.lock(layer) {
            guard.store(generation, data);
        }
    }

    /// Drops `layer`.
    pub fn invalidate(&self, layer: i32) {
        if let Some(mut guard) = self.lock(layer) {
            guard.clear();
        }
    }

    /// Drops every layer.
    pub fn clear(&self) {
        for slot in self.slots.iter() {
            lock(slot).data = None;
        }
    }

    /// Moves the given layers from generation `from` to `to`.
    ///
    /// Layers cached under any other generation are left alone; they are
    /// already stale or already current.
    pub fn restamp<I>(&self, layers: I, from: u64, to: u64)
    where
        I: IntoIterator<Item = i32>,
    {
        for layer in layers {
            if let Some(mut guard) = self.lock(layer)
                && guard.slot.data.is_some()
                && guard.slot.generation == from
            {
                guard.slot.generation = to;
            }
        }
    }

    /// Number of layers cached under `generation`.
    pub fn cached_count(&self, generation: u64) -> usize {
        self.slots
            .iter()
            .filter(|slot| {
                let slot = lock(slot);
                slot.data.is_some() && slot.generation == generation
            })
            .count()
    }
}
