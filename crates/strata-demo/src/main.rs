//! Demo binary that edits an in-memory world from several threads at once.
//!
//! Every chunk receives a "build" commit (a filled section, a chest with its
//! tile, a pig, some desert) followed by a "carve" commit that punches holes,
//! replaces the chest and removes the pig. All workers also write disjoint
//! columns of one shared hub chunk. Afterwards every commit is undone through
//! its snapshot and the world is checked to be empty again.
//!
//! Run with `cargo run -p strata-demo -- --chunks 16 --seed 7`.

use std::collections::BTreeMap;
use std::ops::RangeInclusive;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use clap::Parser;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use strata_chunk::{
    BIOME_CELLS, BiomeDef, BiomeId, BlockDef, BlockOrdinal, BlockPalette, BlockPos, ChunkPos,
    CommitError, CommitHandle, CommitOutcome, EditContext, EditScheduler, EditSet, EditSettings,
    EntityRecord, NativeBiome, NativeBlock, OrdinalCodec, PaletteError, Payload, SECTION_VOLUME,
    SchedulerError, SectionStores, Snapshot, StoreError, TileRecord, World, WorldError,
};
use strata_config::{CliArgs, Config, ConfigError, default_config_dir};
use tracing::{error, info, warn};
use uuid::Uuid;

const COMMIT_TIMEOUT: Duration = Duration::from_secs(30);
const HUB: ChunkPos = ChunkPos { x: -1, z: -1 };
const CHUNKS_PER_ROW: i32 = 8;

#[derive(Debug, thiserror::Error)]
enum DemoError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    World(#[from] WorldError),
    #[error(transparent)]
    Palette(#[from] PaletteError),
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Commit(#[from] CommitError),
    #[error("commit to chunk {0} did not finish in time")]
    Timeout(ChunkPos),
    #[error("edit worker panicked")]
    WorkerPanicked,
    #[error("undo left {0} values behind")]
    UndoMismatch(usize),
}

/// Ordinals the demo writes.
struct Ids {
    solids: Vec<BlockOrdinal>,
    chest: BlockOrdinal,
    desert: BiomeId,
}

impl Ids {
    fn random_solid(&self, rng: &mut ChaCha8Rng) -> BlockOrdinal {
        self.solids[rng.random_range(0..self.solids.len())]
    }
}

type History = BTreeMap<ChunkPos, Vec<Arc<Snapshot>>>;

fn main() {
    let args = CliArgs::parse();
    if let Err(err) = run(&args) {
        error!("demo failed: {err}");
        eprintln!("strata-demo: {err}");
        std::process::exit(1);
    }
}

fn run(args: &CliArgs) -> Result<(), DemoError> {
    let config_dir = args
        .config
        .clone()
        .or_else(default_config_dir)
        .unwrap_or_else(|| PathBuf::from(".strata"));

    let mut config = Config::load_or_create(&config_dir).unwrap_or_else(|e| {
        eprintln!("Failed to load config: {e}, using defaults");
        Config::default()
    });
    config.apply_cli_overrides(args);

    let log_dir = config_dir.join("logs");
    strata_log::init_logging(Some(&log_dir), cfg!(debug_assertions), Some(&config));
    config.world.validate()?;

    let world = Arc::new(World::new(
        config.world.min_section,
        config.world.max_section,
    )?);
    let chunk_count = i32::try_from(args.chunks.max(1)).unwrap_or(i32::MAX);
    let chunks: Vec<ChunkPos> = (0..chunk_count)
        .map(|i| ChunkPos::new(i % CHUNKS_PER_ROW, i / CHUNKS_PER_ROW))
        .collect();
    for &pos in &chunks {
        world.load_chunk(pos);
    }
    world.load_chunk(HUB);

    let (palette, ids) = build_palette()?;
    let scheduler = Arc::new(EditScheduler::new(
        config.edit.side_effect_queue,
        config.edit.structural_queue,
    )?);
    let settings = EditSettings::from(&config.edit);
    let ctx = EditContext::new(Arc::clone(&world), Arc::new(palette), scheduler, settings);
    let stores = SectionStores::new(ctx);
    info!(
        chunks = chunks.len(),
        min_section = world.min_section(),
        max_section = world.max_section(),
        snapshots = settings.create_snapshots,
        "world ready"
    );

    let started = Instant::now();
    let finalized = Arc::new(AtomicUsize::new(0));
    let history = edit_phase(&stores, &chunks, &ids, args.seed, &finalized)?;
    info!(
        commits = history.values().map(Vec::len).sum::<usize>(),
        finalized = finalized.load(Ordering::SeqCst),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "edit phase finished"
    );

    if !settings.create_snapshots {
        warn!("snapshots are disabled; skipping undo");
        return Ok(());
    }

    let started = Instant::now();
    let undone = undo_phase(&stores, history)?;
    info!(
        undone,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "undo phase finished"
    );

    let mut checked = chunks;
    checked.push(HUB);
    verify_empty(&stores, &checked)?;
    info!(trimmed = stores.trim_all(false), "world restored and caches trimmed");
    Ok(())
}

fn build_palette() -> Result<(BlockPalette, Ids), PaletteError> {
    let mut palette = BlockPalette::new();
    let mut solids = Vec::new();
    for (name, native) in [
        ("minecraft:stone", 16),
        ("minecraft:granite", 17),
        ("minecraft:dirt", 48),
        ("minecraft:oak_planks", 80),
    ] {
        solids.push(palette.register_block(BlockDef {
            name: name.to_string(),
            native: NativeBlock(native),
        })?);
    }
    let chest = palette.register_block(BlockDef {
        name: "minecraft:chest".to_string(),
        native: NativeBlock(864),
    })?;
    let desert = palette.register_biome(BiomeDef {
        name: "minecraft:desert".to_string(),
        native: NativeBiome(2),
    })?;
    Ok((palette, Ids { solids, chest, desert }))
}

fn settle(handle: CommitHandle) -> Result<CommitOutcome, DemoError> {
    let pos = handle.pos();
    handle
        .wait_timeout(COMMIT_TIMEOUT)
        .ok_or(DemoError::Timeout(pos))?
        .map_err(DemoError::from)
}

// ---------------------------------------------------------------------------
// Edit phase
// ---------------------------------------------------------------------------

fn edit_phase(
    stores: &SectionStores<BlockPalette>,
    chunks: &[ChunkPos],
    ids: &Ids,
    seed: u64,
    finalized: &Arc<AtomicUsize>,
) -> Result<History, DemoError> {
    // The hub chunk gives every worker its own column, so at most 256 workers.
    let workers = num_cpus::get().clamp(1, chunks.len().min(256));
    info!(workers, "starting edit workers");

    let per_worker: Vec<Result<Vec<(ChunkPos, Arc<Snapshot>)>, DemoError>> =
        thread::scope(|scope| {
            let handles: Vec<_> = (0..workers)
                .map(|worker| {
                    scope.spawn(move || {
                        edit_worker(stores, chunks, ids, seed, worker, workers, finalized)
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|handle| handle.join().unwrap_or(Err(DemoError::WorkerPanicked)))
                .collect()
        });

    let mut history = History::new();
    for result in per_worker {
        for (pos, snapshot) in result? {
            history.entry(pos).or_default().push(snapshot);
        }
    }
    Ok(history)
}

fn edit_worker(
    stores: &SectionStores<BlockPalette>,
    chunks: &[ChunkPos],
    ids: &Ids,
    seed: u64,
    worker: usize,
    workers: usize,
    finalized: &Arc<AtomicUsize>,
) -> Result<Vec<(ChunkPos, Arc<Snapshot>)>, DemoError> {
    let mut snapshots = Vec::new();
    let mut commit = |pos: ChunkPos, edit: EditSet| -> Result<CommitOutcome, DemoError> {
        let counter = Arc::clone(finalized);
        let handle = stores.get_or_create(pos).commit(edit, move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })?;
        let outcome = settle(handle)?;
        if let Some(snapshot) = &outcome.snapshot {
            snapshots.push((pos, Arc::clone(snapshot)));
        }
        Ok(outcome)
    };

    for index in (worker..chunks.len()).step_by(workers) {
        let pos = chunks[index];
        let mut rng = ChaCha8Rng::seed_from_u64(seed ^ (index as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15));
        let store = stores.get_or_create(pos);
        let layers = store.min_section()..=store.max_section();

        let build = build_edit(&mut rng, layers, pos, ids);
        let built = commit(pos, build.edit)?;
        let carved = commit(pos, carve_edit(&mut rng, build.layer, build.chest, build.pig, ids))?;
        tracing::debug!(
            chunk = %pos,
            layer = build.layer,
            built_layers = built.touched.len(),
            removed = carved.confirmed_removals.len(),
            "chunk edited"
        );
    }

    let hub = stores.get_or_create(HUB);
    let (x, z) = ((worker % 16) as i32, (worker / 16) as i32);
    let bottom = hub.min_section() * 16;
    let mut rng = ChaCha8Rng::seed_from_u64(seed.wrapping_add(worker as u64));
    let mut column = EditSet::new();
    for y in bottom..bottom + 16 {
        column.set_block(x, y, z, ids.random_solid(&mut rng));
    }
    commit(HUB, column)?;
    Ok(snapshots)
}

struct BuildEdit {
    edit: EditSet,
    layer: i32,
    chest: BlockPos,
    pig: Uuid,
}

/// Fills one random layer, drops a chest with its tile and spawns a pig.
fn build_edit(
    rng: &mut ChaCha8Rng,
    layers: RangeInclusive<i32>,
    pos: ChunkPos,
    ids: &Ids,
) -> BuildEdit {
    let layer = rng.random_range(layers);
    let base_y = layer * 16;
    let fill: Vec<BlockOrdinal> = (0..SECTION_VOLUME).map(|_| ids.random_solid(rng)).collect();

    let mut edit = EditSet::new();
    edit.set_layer_blocks(layer, fill)
        .set_block_light(layer, vec![rng.random_range(0..16); SECTION_VOLUME]);
    for _ in 0..8 {
        edit.set_biome(
            rng.random_range(0..16),
            base_y + rng.random_range(0..16),
            rng.random_range(0..16),
            ids.desert,
        );
    }

    let chest = BlockPos::new(
        rng.random_range(0..16),
        base_y + rng.random_range(0..16),
        rng.random_range(0..16),
    );
    edit.set_block(chest.x, chest.y, chest.z, ids.chest).set_tile(
        chest,
        TileRecord {
            id: "minecraft:chest".to_string(),
            payload: Payload::from(vec![0u8; 27]),
        },
    );

    let pig = Uuid::new_v4();
    edit.add_entity(EntityRecord {
        id: pig,
        kind: "minecraft:pig".to_string(),
        position: [
            f64::from(pos.x * 16) + 8.5,
            f64::from(base_y + 16),
            f64::from(pos.z * 16) + 8.5,
        ],
        rotation: [rng.random_range(0.0..360.0), 0.0],
        payload: Payload::empty(),
    });

    BuildEdit {
        edit,
        layer,
        chest,
        pig,
    }
}

/// Punches holes into `layer`, replaces the chest and removes the pig.
fn carve_edit(
    rng: &mut ChaCha8Rng,
    layer: i32,
    chest: BlockPos,
    pig: Uuid,
    ids: &Ids,
) -> EditSet {
    let mut edit = EditSet::new();
    for _ in 0..256 {
        let ordinal = if rng.random_bool(0.5) {
            BlockOrdinal::AIR
        } else {
            ids.random_solid(rng)
        };
        edit.set_block(
            rng.random_range(0..16),
            layer * 16 + rng.random_range(0..16),
            rng.random_range(0..16),
            ordinal,
        );
    }
    edit.set_block(chest.x, chest.y, chest.z, ids.solids[0])
        .remove_entity(pig);
    edit
}

// ---------------------------------------------------------------------------
// Undo phase
// ---------------------------------------------------------------------------

/// Reverts every chunk's commits newest first.
fn undo_phase(stores: &SectionStores<BlockPalette>, history: History) -> Result<usize, DemoError> {
    let mut undone = 0;
    for (pos, snapshots) in history {
        let store = stores.get_or_create(pos);
        for snapshot in snapshots.iter().rev() {
            settle(store.commit(snapshot.restore_edit(), || {})?)?;
            undone += 1;
        }
    }
    Ok(undone)
}

fn verify_empty(stores: &SectionStores<BlockPalette>, chunks: &[ChunkPos]) -> Result<(), DemoError> {
    let mut leftovers = 0;
    for &pos in chunks {
        let store = stores.get_or_create(pos);
        let default_biome = store.context().codec().default_biome();
        for layer in store.min_section()..=store.max_section() {
            let blocks = store.load_layer(layer, true)?;
            leftovers += blocks.iter().filter(|o| **o != BlockOrdinal::AIR).count();
            for cell in 0..BIOME_CELLS as i32 {
                let (x, y, z) = ((cell & 3) * 4, layer * 16 + ((cell >> 4) & 3) * 4, ((cell >> 2) & 3) * 4);
                if store.read_biome(x, y, z) != default_biome {
                    leftovers += 1;
                }
            }
        }
        let stray = store.tiles().len() + store.entities().len();
        if stray > 0 {
            warn!(chunk = %pos, stray, "tiles or entities survived undo");
        }
        leftovers += stray;
    }
    if leftovers > 0 {
        return Err(DemoError::UndoMismatch(leftovers));
    }
    Ok(())
}
