//! Shared collaborators handed to every section store.

use std::sync::Arc;

use crate::codec::OrdinalCodec;
use crate::scheduler::EditScheduler;
use crate::world::WorldHandle;

/// Behaviour switches for commits.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EditSettings {
    /// Whether new stores capture a snapshot on every commit.
    pub create_snapshots: bool,
    /// When an entity queued for removal is not in the edited chunk, look for
    /// it in every loaded chunk. Entities removed this way are not captured
    /// for undo.
    pub remove_entity_from_world_on_chunk_fail: bool,
}

impl Default for EditSettings {
    fn default() -> Self {
        Self {
            create_snapshots: true,
            remove_entity_from_world_on_chunk_fail: false,
        }
    }
}

/// World, codec, scheduler and settings, passed explicitly instead of living
/// in globals.
pub struct EditContext<C: OrdinalCodec> {
    world: WorldHandle,
    codec: Arc<C>,
    scheduler: Arc<EditScheduler>,
    settings: EditSettings,
}

impl<C: OrdinalCodec> EditContext<C> {
    /// Bundles the collaborators.
    pub fn new(
        world: WorldHandle,
        codec: Arc<C>,
        scheduler: Arc<EditScheduler>,
        settings: EditSettings,
    ) -> Arc<Self> {
        Arc::new(Self {
            world,
            codec,
            scheduler,
            settings,
        })
    }

    /// The live world.
    pub fn world(&self) -> &WorldHandle {
        &self.world
    }

    /// The ordinal codec.
    pub fn codec(&self) -> &Arc<C> {
        &self.codec
    }

    /// The execution contexts.
    pub fn scheduler(&self) -> &Arc<EditScheduler> {
        &self.scheduler
    }

    /// Commit settings.
    pub fn settings(&self) -> EditSettings {
        self.settings
    }
}
