//! Shared test fixtures: tile/PNG builders, stub stage adapters and a
//! fully wired orchestrator stack on a temp directory.

use std::io::Cursor;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use image::{ImageFormat, Rgba, RgbaImage};
use parking_lot::Mutex;
use tempfile::TempDir;

use crate::artifact_store::{atomic_write, ArtifactStore};
use crate::config::{Config, MeshFormat};
use crate::error::{GenError, GenResult};
use crate::events::ProgressBus;
use crate::pipeline::Pipeline;
use crate::reconstruct::MeshArtifact;
use crate::registry::{ObjectRegistry, Quality};
use crate::scheduler::Scheduler;
use crate::stage::{CancelToken, Reconstruct, Synthesize, Understand};
use crate::tile_store::TileStore;
use crate::understand::Attributes;

/// `px * px` solid-color pixel list for `save_tile`.
pub(crate) fn solid_pixels(px: u32, rgba: [u8; 4]) -> Vec<[u8; 4]> {
    vec![rgba; (px * px) as usize]
}

/// Encoded solid-color PNG.
pub(crate) fn solid_png(w: u32, h: u32, rgba: [u8; 4]) -> Vec<u8> {
    let mut img = RgbaImage::new(w, h);
    for px in img.pixels_mut() {
        *px = Rgba(rgba);
    }
    encode(img)
}

/// Encoded PNG with per-pixel gradient, guaranteed to pass the synthesis
/// sanity check.
pub(crate) fn diverse_png(w: u32, h: u32) -> Vec<u8> {
    let mut img = RgbaImage::new(w, h);
    for y in 0..h {
        for x in 0..w {
            img.put_pixel(
                x,
                y,
                Rgba([(x * 7 % 256) as u8, (y * 11 % 256) as u8, ((x + y) % 256) as u8, 255]),
            );
        }
    }
    encode(img)
}

fn encode(img: RgbaImage) -> Vec<u8> {
    let mut buf = Cursor::new(Vec::new());
    img.write_to(&mut buf, ImageFormat::Png).unwrap();
    buf.into_inner()
}

/// Poll `f` until it returns true or the timeout elapses.
pub(crate) fn wait_until(timeout: Duration, f: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if f() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    f()
}

/// Understand stub returning fixed attributes.
#[derive(Clone)]
pub(crate) struct StubUnderstand {
    pub attrs: Attributes,
    pub calls: Arc<AtomicUsize>,
}

impl StubUnderstand {
    pub fn new(attrs: Attributes) -> Self {
        Self {
            attrs,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl Understand for StubUnderstand {
    fn extract(&self, _image_png: &[u8], cancel: &CancelToken) -> GenResult<Attributes> {
        cancel.check()?;
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.attrs.clone())
    }
}

/// Synthesize stub returning a configurable PNG and recording prompts.
#[derive(Clone)]
pub(crate) struct StubSynthesize {
    pub png: Arc<Mutex<Vec<u8>>>,
    pub calls: Arc<AtomicUsize>,
    pub prompts: Arc<Mutex<Vec<String>>>,
}

impl StubSynthesize {
    pub fn new(png: Vec<u8>) -> Self {
        Self {
            png: Arc::new(Mutex::new(png)),
            calls: Arc::new(AtomicUsize::new(0)),
            prompts: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl Synthesize for StubSynthesize {
    fn generate(&self, prompt: &str, cancel: &CancelToken) -> GenResult<Vec<u8>> {
        cancel.check()?;
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.prompts.lock().push(prompt.to_string());
        Ok(self.png.lock().clone())
    }
}

/// Reconstruct stub that writes a minimal valid OBJ, or fails once its
/// call count reaches `fail_after`.
#[derive(Clone)]
pub(crate) struct StubReconstruct {
    pub calls: Arc<AtomicUsize>,
    pub fail_after: Arc<AtomicUsize>,
}

impl StubReconstruct {
    pub fn new() -> Self {
        Self {
            calls: Arc::new(AtomicUsize::new(0)),
            fail_after: Arc::new(AtomicUsize::new(usize::MAX)),
        }
    }
}

impl Reconstruct for StubReconstruct {
    fn reconstruct(
        &self,
        _image_png: &[u8],
        out_path: &Path,
        cancel: &CancelToken,
    ) -> GenResult<MeshArtifact> {
        cancel.check()?;
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call >= self.fail_after.load(Ordering::SeqCst) {
            return Err(GenError::StageFatal {
                stage: "reconstruct",
                attempts: 1,
                message: "stub failure".to_string(),
            });
        }
        let path = out_path.with_extension("obj");
        atomic_write(
            &path,
            b"v 0 0 0\nv 1 0 0\nv 1 1 0\nv 0 1 0\nv 0 0 1\nf 1 2 3\n",
        )?;
        Ok(MeshArtifact {
            path,
            format: MeshFormat::Obj,
            quality: Quality::Light,
        })
    }
}

/// Counters shared with the stub adapters of a `TestStack`.
pub(crate) struct StubCounters {
    pub understand: Arc<AtomicUsize>,
    pub synthesize: Arc<AtomicUsize>,
    pub reconstruct: Arc<AtomicUsize>,
    pub prompts: Arc<Mutex<Vec<String>>>,
    pub reconstruct_fail_after: Arc<AtomicUsize>,
}

/// A fully wired orchestrator core on a temp root, with stub stages.
pub(crate) struct TestStack {
    pub config: Config,
    pub tiles: Arc<TileStore>,
    pub artifacts: Arc<ArtifactStore>,
    pub registry: Arc<ObjectRegistry>,
    pub bus: Arc<ProgressBus>,
    pub pipeline: Arc<Pipeline>,
    pub scheduler: Scheduler,
    pub counters: StubCounters,
    pub _temp: TempDir,
}

/// Config tuned for tests: tiny tiles, no cooldown, no refiner.
pub(crate) fn test_config(root: &Path, workers: usize, cooldown_ms: u64) -> Config {
    Config {
        root: root.to_path_buf(),
        tile_px: 8,
        max_workers: workers,
        per_tile_cooldown_ms: cooldown_ms,
        enable_refiner: false,
        refine_delay_secs: 0,
        refine_timeout_secs: 5,
        tile_scale: 1.0,
        ..Config::default()
    }
}

pub(crate) fn stub_stack(workers: usize, cooldown_ms: u64) -> TestStack {
    let temp = TempDir::new().unwrap();
    let config = test_config(temp.path(), workers, cooldown_ms);

    let tiles = Arc::new(
        TileStore::new(
            config.tiles_dir(),
            config.images_cache_dir(),
            config.tile_px,
            config.memory_cache_tiles,
        )
        .unwrap(),
    );
    let artifacts =
        Arc::new(ArtifactStore::new(config.pipe_dir(), config.glb_dir()).unwrap());
    let registry = Arc::new(ObjectRegistry::open(config.objects_json_path()).unwrap());
    let bus = Arc::new(ProgressBus::new());

    let understand = StubUnderstand::new(Attributes {
        category: "car".to_string(),
        colors: vec!["red".to_string()],
        details: vec![],
        fallback: false,
        ..Attributes::fallback()
    });
    let synthesize = StubSynthesize::new(diverse_png(16, 16));
    let reconstruct = StubReconstruct::new();
    let counters = StubCounters {
        understand: Arc::clone(&understand.calls),
        synthesize: Arc::clone(&synthesize.calls),
        reconstruct: Arc::clone(&reconstruct.calls),
        prompts: Arc::clone(&synthesize.prompts),
        reconstruct_fail_after: Arc::clone(&reconstruct.fail_after),
    };

    let pipeline = Arc::new(Pipeline::new(
        Arc::clone(&artifacts),
        Box::new(understand),
        Box::new(synthesize),
        Box::new(reconstruct),
        config.vlm_logs_dir(),
        config.reconstruct.output_format,
    ));

    let scheduler = Scheduler::new(
        &config,
        Arc::clone(&tiles),
        Arc::clone(&pipeline),
        Arc::clone(&registry),
        Arc::clone(&bus),
    )
    .unwrap();

    TestStack {
        config,
        tiles,
        artifacts,
        registry,
        bus,
        pipeline,
        scheduler,
        counters,
        _temp: temp,
    }
}
