//! End-to-end commit pipeline tests: block writes, snapshots, deferred tile and
//! entity tasks, finalizers and undo, across real worker threads.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::time::Duration;

use strata_chunk::{
    BiomeDef, BiomeId, BlockDef, BlockOrdinal, BlockPalette, BlockPos, ChunkPos,
    ChunkSectionStore, CommitError, CommitHandle, CommitOutcome, EditArray, EditContext,
    EditScheduler, EditSet, EditSettings, EntityRecord, HeightMapKind, LIGHT_DIRTY, NETWORK_DIRTY,
    NativeBiome, NativeBlock, NativeSection, Payload, SAVE_DIRTY, SECTION_VOLUME, SectionStores, TileRecord,
    World, WorldHandle,
};
use uuid::Uuid;

const WAIT: Duration = Duration::from_secs(10);
const ORIGIN: ChunkPos = ChunkPos { x: 0, z: 0 };
const EAST: ChunkPos = ChunkPos { x: 1, z: 0 };

struct Ids {
    stone: BlockOrdinal,
    dirt: BlockOrdinal,
    chest: BlockOrdinal,
    desert: BiomeId,
}

struct Harness {
    world: WorldHandle,
    stores: SectionStores<BlockPalette>,
    ids: Ids,
}

fn palette() -> (BlockPalette, Ids) {
    let mut palette = BlockPalette::new();
    let mut block = |name: &str, native: u32| {
        palette
            .register_block(BlockDef {
                name: name.to_string(),
                native: NativeBlock(native),
            })
            .unwrap()
    };
    let stone = block("minecraft:stone", 16);
    let dirt = block("minecraft:dirt", 48);
    let chest = block("minecraft:chest", 864);
    let desert = palette
        .register_biome(BiomeDef {
            name: "minecraft:desert".to_string(),
            native: NativeBiome(2),
        })
        .unwrap();
    (
        palette,
        Ids {
            stone,
            dirt,
            chest,
            desert,
        },
    )
}

fn world() -> WorldHandle {
    let world = Arc::new(World::new(-4, 19).unwrap());
    world.load_chunk(ORIGIN);
    world.load_chunk(EAST);
    world
}

fn harness_with(settings: EditSettings) -> Harness {
    let world = world();
    let (palette, ids) = palette();
    let scheduler = Arc::new(EditScheduler::new(64, 64).unwrap());
    let ctx = EditContext::new(Arc::clone(&world), Arc::new(palette), scheduler, settings);
    Harness {
        world,
        stores: SectionStores::new(ctx),
        ids,
    }
}

fn harness() -> Harness {
    harness_with(EditSettings::default())
}

fn finish(handle: CommitHandle) -> CommitOutcome {
    handle
        .wait_timeout(WAIT)
        .expect("commit did not finish in time")
        .expect("commit failed")
}

fn entity(id: u128, kind: &str, x: f64, z: f64) -> EntityRecord {
    EntityRecord {
        id: Uuid::from_u128(id),
        kind: kind.to_string(),
        position: [x, 65.0, z],
        rotation: [90.0, 0.0],
        payload: Payload::from(vec![id as u8]),
    }
}

fn tile(id: &str) -> TileRecord {
    TileRecord {
        id: id.to_string(),
        payload: Payload::from(id.as_bytes()),
    }
}

fn counter() -> (Arc<AtomicUsize>, impl FnOnce() + Send + 'static) {
    let count = Arc::new(AtomicUsize::new(0));
    let inner = Arc::clone(&count);
    (count, move || {
        inner.fetch_add(1, Ordering::SeqCst);
    })
}

// ---------------------------------------------------------------------------
// Block data
// ---------------------------------------------------------------------------

#[test]
fn test_round_trip_reads_back_committed_blocks() {
    let h = harness();
    let store = h.stores.get_or_create(ORIGIN);
    let mut edit = EditSet::new();
    edit.set_block(1, -60, 1, h.ids.stone)
        .set_block(15, 300, 15, h.ids.dirt)
        .set_block(7, 64, 9, h.ids.chest)
        .set_block(2, 5, 2, BlockOrdinal::CAVE_AIR);

    let outcome = finish(store.commit(edit, || {}).unwrap());
    assert!(outcome.touched.contains(-4));
    assert!(outcome.touched.contains(18));
    assert!(outcome.touched.contains(4));
    assert!(outcome.touched.contains(0));

    assert_eq!(store.read_block(1, -60, 1), h.ids.stone);
    assert_eq!(store.read_block(15, 300, 15), h.ids.dirt);
    assert_eq!(store.read_block(7, 64, 9), h.ids.chest);
    assert_eq!(store.read_block(2, 5, 2), BlockOrdinal::AIR);

    // A cold store decodes the same values from the live chunk.
    let cold = ChunkSectionStore::new(Arc::clone(store.context()), ORIGIN);
    assert_eq!(cold.read_block(1, -60, 1), h.ids.stone);
    assert_eq!(cold.read_block(15, 300, 15), h.ids.dirt);
    assert_eq!(h.world.chunk(ORIGIN).unwrap().block(7, 64, 9), NativeBlock(864));
}

#[test]
fn test_reads_outside_section_range_are_air() {
    let h = harness();
    let store = h.stores.get_or_create(ORIGIN);
    let mut edit = EditSet::new();
    edit.set_layer_blocks(25, vec![h.ids.stone; SECTION_VOLUME]);
    let outcome = finish(store.commit(edit, || {}).unwrap());
    assert!(outcome.touched.is_empty());
    assert_eq!(store.read_block(0, 25 * 16, 0), BlockOrdinal::AIR);
    assert_eq!(store.read_block(0, -65, 0), BlockOrdinal::AIR);
    assert_eq!(store.read_biome(0, -65, 0), BiomeId(0));
}

#[test]
fn test_reserved_layer_is_a_no_op() {
    let h = harness();
    let store = h.stores.get_or_create(ORIGIN);
    let mut edit = EditSet::new();
    edit.set_layer_blocks(2, vec![BlockOrdinal::RESERVED; SECTION_VOLUME]);
    let (count, finalizer) = counter();

    let outcome = finish(store.commit(edit, finalizer).unwrap());
    assert!(outcome.touched.is_empty());
    assert!(!outcome.changed());
    assert!(!store.has_section(2));
    assert!(outcome.snapshot.unwrap().is_empty());
    assert_eq!(count.load(Ordering::SeqCst), 1);
    assert_eq!(h.world.chunk(ORIGIN).unwrap().dirty_flags(), 0);
}

#[test]
fn test_air_write_into_absent_section_does_not_allocate() {
    let h = harness();
    let store = h.stores.get_or_create(ORIGIN);
    let mut edit = EditSet::new();
    edit.set_block(0, 48, 0, BlockOrdinal::AIR);
    let outcome = finish(store.commit(edit, || {}).unwrap());
    assert!(outcome.touched.contains(3));
    assert!(!store.has_section(3));
}

#[test]
fn test_commit_picks_up_blocks_changed_behind_the_cache() {
    let h = harness();
    let store = h.stores.get_or_create(ORIGIN);
    assert_eq!(store.read_block(1, 0, 1), BlockOrdinal::AIR);
    h.world.chunk(ORIGIN).unwrap().set_block(1, 0, 1, NativeBlock(48));

    let mut edit = EditSet::new();
    edit.set_block(0, 0, 0, h.ids.stone);
    finish(store.commit(edit, || {}).unwrap());

    assert_eq!(store.read_block(0, 0, 0), h.ids.stone);
    assert_eq!(store.read_block(1, 0, 1), h.ids.dirt);
    assert_eq!(store.load_layer(0, false).unwrap()[1 | (1 << 4)], h.ids.dirt);
}

#[test]
fn test_repeated_overwrites_keep_section_palette_small() {
    let world = world();
    let mut palette = BlockPalette::new();
    let ordinals: Vec<BlockOrdinal> = (0..40u32)
        .map(|i| {
            palette
                .register_block(BlockDef {
                    name: format!("test:block_{i}"),
                    native: NativeBlock(1000 + i),
                })
                .unwrap()
        })
        .collect();
    let scheduler = Arc::new(EditScheduler::new(64, 64).unwrap());
    let ctx = EditContext::new(
        Arc::clone(&world),
        Arc::new(palette),
        scheduler,
        EditSettings::default(),
    );
    let store = ChunkSectionStore::new(ctx, ORIGIN);

    for &ordinal in &ordinals {
        let mut edit = EditSet::new();
        edit.set_block(0, 0, 0, ordinal);
        finish(store.commit(edit, || {}).unwrap());
    }

    let chunk = world.chunk(ORIGIN).unwrap();
    let palette_len = chunk
        .lock_section(0)
        .unwrap()
        .as_ref()
        .map(NativeSection::palette_len)
        .unwrap();
    assert!(palette_len <= 2, "palette kept {palette_len} entries");
    assert_eq!(store.read_block(0, 0, 0), ordinals[39]);
    assert_eq!(store.read_block(1, 0, 0), BlockOrdinal::AIR);
}

#[test]
fn test_biome_only_overlay_allocates_air_section() {
    let h = harness();
    let store = h.stores.get_or_create(ORIGIN);
    assert!(!store.has_section(6));
    let mut edit = EditSet::new();
    edit.set_biome(0, 96, 0, h.ids.desert);

    let outcome = finish(store.commit(edit, || {}).unwrap());
    assert!(outcome.biomes_changed);
    assert!(outcome.touched.is_empty());
    assert!(store.has_section(6));
    assert_eq!(store.read_block(0, 96, 0), BlockOrdinal::AIR);
    assert_eq!(store.read_biome(0, 96, 0), h.ids.desert);
    assert_eq!(store.read_biome(8, 96, 8), BiomeId(0));
    assert!(h.world.chunk(ORIGIN).unwrap().is_dirty(SAVE_DIRTY | NETWORK_DIRTY));
}

#[test]
fn test_new_section_carries_biome_overlay() {
    let h = harness();
    let store = h.stores.get_or_create(ORIGIN);
    let mut edit = EditSet::new();
    edit.set_block(0, 0, 0, h.ids.stone).set_biome(0, 0, 0, h.ids.desert);
    let outcome = finish(store.commit(edit, || {}).unwrap());
    assert!(outcome.biomes_changed);
    assert_eq!(store.read_biome(0, 0, 0), h.ids.desert);
    assert_eq!(store.read_biome(12, 12, 12), BiomeId(0));
}

#[test]
fn test_lighting_and_height_maps() {
    let h = harness();
    let store = h.stores.get_or_create(ORIGIN);
    let heights: Vec<i32> = (0..256).collect();
    let mut edit = EditSet::new();
    edit.set_block(0, 0, 0, h.ids.stone)
        .set_block_light(0, vec![0x17; SECTION_VOLUME])
        .set_sky_light(5, vec![15; SECTION_VOLUME])
        .set_height_map(HeightMapKind::MotionBlocking, heights.clone());

    let outcome = finish(store.commit(edit, || {}).unwrap());
    assert!(outcome.lighting_changed);
    assert!(outcome.height_maps_changed);
    assert_eq!(store.read_emitted_light(3, 3, 3), 7);
    // Light never lands in an absent section.
    assert!(!store.has_section(5));
    assert_eq!(store.read_sky_light(0, 80, 0), 0);
    assert_eq!(store.read_height_map(HeightMapKind::MotionBlocking).to_vec(), heights);
    assert_eq!(store.read_height_map(HeightMapKind::OceanFloor), [0; 256]);
    assert!(h.world.chunk(ORIGIN).unwrap().is_dirty(LIGHT_DIRTY));
}

// ---------------------------------------------------------------------------
// Failures at the boundary
// ---------------------------------------------------------------------------

#[test]
fn test_malformed_edit_touches_nothing() {
    let h = harness();
    let store = h.stores.get_or_create(ORIGIN);
    let mut edit = EditSet::new();
    edit.set_block(0, 0, 0, h.ids.stone)
        .set_layer_biomes(1, vec![Some(h.ids.desert); 10]);
    let (count, finalizer) = counter();

    let err = store.commit(edit, finalizer).err().unwrap();
    assert_eq!(
        err,
        CommitError::MalformedEdit {
            array: EditArray::Biomes,
            layer: Some(1),
            expected: 64,
            actual: 10,
        }
    );
    assert_eq!(store.read_block(0, 0, 0), BlockOrdinal::AIR);
    assert!(!store.has_section(0));
    assert_eq!(count.load(Ordering::SeqCst), 0);
}

#[test]
fn test_commit_to_unloaded_chunk_fails() {
    let h = harness();
    let store = h.stores.get_or_create(ChunkPos::new(9, 9));
    let mut edit = EditSet::new();
    edit.set_block(0, 0, 0, h.ids.stone);
    let err = store.commit(edit, || {}).err().unwrap();
    assert_eq!(err, CommitError::NotLoaded(ChunkPos::new(9, 9)));
}

// ---------------------------------------------------------------------------
// Snapshots and undo
// ---------------------------------------------------------------------------

#[test]
fn test_snapshot_holds_pre_images_only_for_touched_blocks() {
    let h = harness();
    let chunk = h.world.chunk(ORIGIN).unwrap();
    chunk.set_block(3, 70, 3, NativeBlock(16));
    chunk.set_block(5, 70, 5, NativeBlock(16));
    let store = h.stores.get_or_create(ORIGIN);

    let mut edit = EditSet::new();
    edit.set_block(3, 70, 3, h.ids.dirt).set_block(4, 70, 4, h.ids.dirt);
    let snapshot = finish(store.commit(edit, || {}).unwrap())
        .snapshot
        .expect("snapshots are on by default");

    assert_eq!(snapshot.pos(), ORIGIN);
    assert_eq!(snapshot.read_block(3, 70, 3), h.ids.stone);
    assert_eq!(snapshot.read_block(4, 70, 4), BlockOrdinal::AIR);
    assert!(snapshot.was_touched(4, 70, 4));
    // Untouched, even though it is stone in the same layer.
    assert!(!snapshot.was_touched(5, 70, 5));
    assert_eq!(snapshot.read_block(5, 70, 5), BlockOrdinal::AIR);
    assert!(snapshot.has_layer(4));
    assert!(snapshot.was_allocated(4));
    assert!(!snapshot.has_layer(10));
    assert_eq!(snapshot.captured_layers().collect::<Vec<_>>(), vec![4]);

    // Later edits do not leak into the snapshot.
    let mut edit = EditSet::new();
    edit.set_block(3, 70, 3, h.ids.chest);
    finish(store.commit(edit, || {}).unwrap());
    assert_eq!(snapshot.read_block(3, 70, 3), h.ids.stone);
}

#[test]
fn test_snapshots_can_be_disabled_per_store() {
    let h = harness();
    let store = h.stores.get_or_create(ORIGIN);
    store.set_create_snapshot(false);
    let mut edit = EditSet::new();
    edit.set_block(0, 0, 0, h.ids.stone);
    assert!(finish(store.commit(edit, || {}).unwrap()).snapshot.is_none());
}

#[test]
fn test_overwritten_tile_is_evicted_and_captured() {
    let h = harness();
    let chunk = h.world.chunk(ORIGIN).unwrap();
    chunk.set_block(8, 64, 8, NativeBlock(864));
    chunk.insert_tile(BlockPos::new(8, 64, 8), tile("Chest"));
    chunk.insert_tile(BlockPos::new(9, 64, 9), tile("Sign"));
    let store = h.stores.get_or_create(ORIGIN);

    let mut edit = EditSet::new();
    edit.set_block(8, 64, 8, h.ids.stone);
    let snapshot = finish(store.commit(edit, || {}).unwrap()).snapshot.unwrap();

    assert!(store.tile(8, 64, 8).is_none());
    assert_eq!(store.tile(9, 64, 9), Some(tile("Sign")));
    assert_eq!(snapshot.tile(8, 64, 8), Some(&tile("Chest")));
    assert!(snapshot.tile(9, 64, 9).is_none());
}

#[test]
fn test_tile_replacement_captures_previous_tile() {
    let h = harness();
    let chunk = h.world.chunk(ORIGIN).unwrap();
    chunk.insert_tile(BlockPos::new(1, 1, 1), tile("Furnace"));
    let store = h.stores.get_or_create(ORIGIN);

    let mut edit = EditSet::new();
    edit.set_tile(BlockPos::new(1, 1, 1), tile("Hopper"))
        .set_tile(BlockPos::new(2, 1, 2), tile(""));
    let snapshot = finish(store.commit(edit, || {}).unwrap()).snapshot.unwrap();

    assert_eq!(store.tile(1, 1, 1), Some(tile("Hopper")));
    // Tiles without an id are not instantiable and are skipped.
    assert!(store.tile(2, 1, 2).is_none());
    assert_eq!(snapshot.tile(1, 1, 1), Some(&tile("Furnace")));
}

#[test]
fn test_restore_edit_undoes_commit() {
    let h = harness();
    let chunk = h.world.chunk(ORIGIN).unwrap();
    chunk.set_block(8, 64, 8, NativeBlock(864));
    chunk.insert_tile(BlockPos::new(8, 64, 8), tile("Chest"));
    h.world.spawn_entity(entity(1, "Pig", 4.5, 4.5)).unwrap();
    let store = h.stores.get_or_create(ORIGIN);

    let mut edit = EditSet::new();
    edit.set_block(8, 64, 8, h.ids.stone)
        .set_block(0, 64, 0, h.ids.stone)
        .set_biome(0, 64, 0, h.ids.desert)
        .set_tile(BlockPos::new(0, 64, 0), tile("Sign"))
        .add_entity(entity(2, "Cow", 2.0, 2.0))
        .remove_entity(Uuid::from_u128(1));
    let outcome = finish(store.commit(edit, || {}).unwrap());
    assert!(store.tile(8, 64, 8).is_none());
    assert_eq!(store.tile(0, 64, 0), Some(tile("Sign")));
    assert!(store.entity(Uuid::from_u128(1)).is_none());
    assert!(store.entity(Uuid::from_u128(2)).is_some());

    let undo = outcome.snapshot.unwrap().restore_edit();
    finish(store.commit(undo, || {}).unwrap());

    assert_eq!(store.read_block(8, 64, 8), h.ids.chest);
    assert_eq!(store.read_block(0, 64, 0), BlockOrdinal::AIR);
    assert_eq!(store.read_biome(0, 64, 0), BiomeId(0));
    assert_eq!(store.tile(8, 64, 8), Some(tile("Chest")));
    assert!(store.tile(0, 64, 0).is_none());
    assert_eq!(store.entity(Uuid::from_u128(1)), Some(entity(1, "Pig", 4.5, 4.5)));
    assert!(store.entity(Uuid::from_u128(2)).is_none());
}

#[test]
fn test_undoing_air_write_leaves_absent_section_absent() {
    let h = harness();
    let store = h.stores.get_or_create(ORIGIN);
    let mut edit = EditSet::new();
    edit.set_block(0, 48, 0, BlockOrdinal::AIR);
    let outcome = finish(store.commit(edit, || {}).unwrap());
    assert!(!store.has_section(3));

    let undo = outcome.snapshot.unwrap().restore_edit();
    assert!(undo.layer_biomes(3).is_none());
    let undone = finish(store.commit(undo, || {}).unwrap());
    assert!(!undone.biomes_changed);
    assert!(!store.has_section(3));
}

// ---------------------------------------------------------------------------
// Entities
// ---------------------------------------------------------------------------

#[test]
fn test_removal_set_is_trimmed_to_actual_removals() {
    let h = harness();
    h.world.spawn_entity(entity(1, "Pig", 1.0, 1.0)).unwrap();
    let store = h.stores.get_or_create(ORIGIN);

    let mut edit = EditSet::new();
    edit.remove_entity(Uuid::from_u128(1))
        .remove_entity(Uuid::from_u128(2));
    let outcome = finish(store.commit(edit, || {}).unwrap());

    assert_eq!(outcome.confirmed_removals.len(), 1);
    assert!(outcome.confirmed_removals.contains(&Uuid::from_u128(1)));
    assert!(store.entities().is_empty());
}

#[test]
fn test_world_fallback_removes_entity_elsewhere() {
    let settings = EditSettings {
        remove_entity_from_world_on_chunk_fail: true,
        ..EditSettings::default()
    };
    let h = harness_with(settings);
    // The pig lives one chunk east of the edited chunk.
    h.world.spawn_entity(entity(1, "Pig", 20.0, 1.0)).unwrap();
    let store = h.stores.get_or_create(ORIGIN);

    let mut edit = EditSet::new();
    edit.remove_entity(Uuid::from_u128(1));
    let outcome = finish(store.commit(edit, || {}).unwrap());

    assert!(outcome.confirmed_removals.contains(&Uuid::from_u128(1)));
    let east = h.world.chunk(EAST).unwrap();
    assert!(east.entity(Uuid::from_u128(1)).is_none());
    assert!(east.is_dirty(SAVE_DIRTY));
    // Entities removed elsewhere are not captured for undo.
    assert!(outcome.snapshot.unwrap().entity(Uuid::from_u128(1)).is_none());
}

#[test]
fn test_world_fallback_is_off_by_default() {
    let h = harness();
    h.world.spawn_entity(entity(1, "Pig", 20.0, 1.0)).unwrap();
    let store = h.stores.get_or_create(ORIGIN);
    let mut edit = EditSet::new();
    edit.remove_entity(Uuid::from_u128(1));
    let outcome = finish(store.commit(edit, || {}).unwrap());
    assert!(outcome.confirmed_removals.is_empty());
    assert!(h.world.chunk(EAST).unwrap().entity(Uuid::from_u128(1)).is_some());
}

// ---------------------------------------------------------------------------
// Finalizer and deferred failures
// ---------------------------------------------------------------------------

#[test]
fn test_finalizer_runs_once_for_empty_edit() {
    let h = harness();
    let store = h.stores.get_or_create(ORIGIN);
    let (count, finalizer) = counter();
    let outcome = finish(store.commit(EditSet::new(), finalizer).unwrap());
    assert!(!outcome.changed());
    assert_eq!(count.load(Ordering::SeqCst), 1);
}

#[test]
fn test_finalizer_runs_on_structural_context() {
    let h = harness();
    let store = h.stores.get_or_create(ORIGIN);
    let (tx, rx) = mpsc::channel();
    let handle = store
        .commit(EditSet::new(), move || {
            let name = std::thread::current().name().map(str::to_string);
            tx.send(name).unwrap();
        })
        .unwrap();
    finish(handle);
    assert_eq!(rx.recv_timeout(WAIT).unwrap().as_deref(), Some("strata-structural"));
}

#[test]
fn test_finalizer_can_commit_a_follow_up_edit() {
    let h = harness();
    let store = h.stores.get_or_create(ORIGIN);
    let follow_up = Arc::clone(&store);
    let dirt = h.ids.dirt;
    let (tx, rx) = mpsc::channel();

    let mut edit = EditSet::new();
    edit.set_block(0, 0, 0, h.ids.stone);
    finish(
        store
            .commit(edit, move || {
                let mut edit = EditSet::new();
                edit.set_block(1, 0, 1, dirt);
                let _ = tx.send(follow_up.commit(edit, || {}));
            })
            .unwrap(),
    );

    finish(rx.recv_timeout(WAIT).unwrap().unwrap());
    assert_eq!(store.read_block(0, 0, 0), h.ids.stone);
    assert_eq!(store.read_block(1, 0, 1), dirt);
}

#[test]
fn test_deferred_failure_keeps_blocks_and_still_finalizes() {
    let h = harness();
    h.world.spawn_entity(entity(1, "Pig", 1.0, 1.0)).unwrap();
    let store = h.stores.get_or_create(ORIGIN);
    let (count, finalizer) = counter();

    let mut edit = EditSet::new();
    edit.set_block(0, 0, 0, h.ids.stone)
        // Lands in an unloaded chunk, so the spawn fails.
        .add_entity(entity(2, "Cow", 1000.0, 1000.0))
        .remove_entity(Uuid::from_u128(1));
    let result = store.commit(edit, finalizer).unwrap().wait_timeout(WAIT).unwrap();

    match result {
        Err(CommitError::DeferredTask { task, .. }) => assert_eq!(task, "entity addition"),
        other => panic!("expected a deferred task failure, got {other:?}"),
    }
    assert_eq!(count.load(Ordering::SeqCst), 1);
    // Block data is not rolled back.
    assert_eq!(store.read_block(0, 0, 0), h.ids.stone);
    // The chain stopped before the removal task.
    assert!(store.entity(Uuid::from_u128(1)).is_some());
    assert!(h.world.chunk(ORIGIN).unwrap().is_dirty(SAVE_DIRTY));
}

#[test]
fn test_panicking_finalizer_still_resolves_handle() {
    let h = harness();
    let store = h.stores.get_or_create(ORIGIN);
    let mut edit = EditSet::new();
    edit.set_block(0, 0, 0, h.ids.stone);
    let handle = store.commit(edit, || panic!("finalizer exploded")).unwrap();
    assert!(finish(handle).touched.contains(0));
}

#[test]
fn test_commit_runs_inline_after_scheduler_shutdown() {
    let world = world();
    let (palette, ids) = palette();
    let mut scheduler = EditScheduler::new(4, 4).unwrap();
    scheduler.shutdown();
    let ctx = EditContext::new(
        Arc::clone(&world),
        Arc::new(palette),
        Arc::new(scheduler),
        EditSettings::default(),
    );
    let store = ChunkSectionStore::new(ctx, ORIGIN);
    let (count, finalizer) = counter();

    let mut edit = EditSet::new();
    edit.set_block(0, 0, 0, ids.stone);
    let handle = store.commit(edit, finalizer).unwrap();
    assert!(handle.is_complete());
    assert_eq!(count.load(Ordering::SeqCst), 1);
    assert!(handle.wait().is_ok());
}

// ---------------------------------------------------------------------------
// Identity and concurrency
// ---------------------------------------------------------------------------

#[test]
fn test_reloaded_chunk_invalidates_cache() {
    let h = harness();
    let store = h.stores.get_or_create(ORIGIN);
    assert_eq!(store.read_block(0, 0, 0), BlockOrdinal::AIR);
    let generation = store.generation();

    let reloaded = h.world.reload_chunk(ORIGIN).unwrap();
    reloaded.set_block(0, 0, 0, NativeBlock(16));
    assert_eq!(store.read_block(0, 0, 0), h.ids.stone);
    assert!(store.generation() > generation);

    let mut edit = EditSet::new();
    edit.set_block(1, 0, 1, h.ids.dirt);
    finish(store.commit(edit, || {}).unwrap());
    assert_eq!(h.world.chunk(ORIGIN).unwrap().block(1, 0, 1), NativeBlock(48));
}

#[test]
fn test_distinct_chunks_do_not_wait_on_each_other() {
    let h = harness();
    let origin = h.stores.get_or_create(ORIGIN);
    let east = h.stores.get_or_create(EAST);
    let origin_chunk = h.world.chunk(ORIGIN).unwrap();

    // Park an origin commit inside its layer write, holding origin's commit lock.
    let guard = origin_chunk.lock_section(0).unwrap();
    let stone = h.ids.stone;
    let (started, entered) = mpsc::channel();
    let stalled = std::thread::spawn(move || {
        let mut edit = EditSet::new();
        edit.set_block(0, 0, 0, stone);
        started.send(()).unwrap();
        origin.commit(edit, || {}).map(finish)
    });
    entered.recv_timeout(WAIT).unwrap();

    let (count, finalizer) = counter();
    let mut edit = EditSet::new();
    edit.set_block(5, 5, 5, stone);
    let outcome = finish(east.commit(edit, finalizer).unwrap());
    assert!(outcome.touched.contains(0));
    assert_eq!(count.load(Ordering::SeqCst), 1);
    assert_eq!(east.read_block(5, 5, 5), stone);
    assert!(!stalled.is_finished());

    drop(guard);
    let outcome = stalled.join().unwrap().unwrap();
    assert!(outcome.touched.contains(0));
    assert_eq!(origin_chunk.block(0, 0, 0), NativeBlock(16));
}

#[test]
fn test_concurrent_commits_never_tear_a_layer() {
    let h = harness();
    let store = h.stores.get_or_create(ORIGIN);
    let choices = [h.ids.stone, h.ids.dirt, h.ids.chest];

    std::thread::scope(|scope| {
        for worker in 0..6 {
            let store = Arc::clone(&store);
            scope.spawn(move || {
                for round in 0..10 {
                    let ordinal = choices[(worker + round) % choices.len()];
                    let mut edit = EditSet::new();
                    edit.set_layer_blocks(1, vec![ordinal; SECTION_VOLUME]);
                    finish(store.commit(edit, || {}).unwrap());
                    let seen = store.load_layer(1, false).unwrap();
                    assert!(seen.iter().all(|o| *o == seen[0]));
                }
            });
        }
    });

    let layer = store.load_layer(1, true).unwrap();
    assert!(choices.contains(&layer[0]));
    assert!(layer.iter().all(|o| *o == layer[0]));
}
