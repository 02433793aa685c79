//! GeoPlace generation orchestrator core.
//!
//! Users paint a very large tiled canvas; modified tiles are turned into
//! 3D mesh assets by a three-stage external pipeline (understand ->
//! synthesize -> reconstruct) with caching, retries, timeouts and
//! deterministic fallbacks. This crate owns the tile store, the artifact
//! cache, the authoritative object registry, the job scheduler and the
//! progress bus; the painting UI, the 3D viewer and the HTTP/WebSocket
//! framing mount on top of [`Orchestrator`].

pub mod api;
mod artifact_store;
mod config;
mod error;
mod events;
mod pipeline;
mod reconstruct;
mod registry;
mod scheduler;
mod search;
mod stage;
mod synthesize;
mod tile_store;
mod understand;
#[cfg(test)]
pub(crate) mod test_utils;

use std::sync::Arc;

use bytes::Bytes;
use serde_json::Value;
use tracing::info;

pub use crate::api::{
    AdminCount, GenerateRequest, GenerateResponse, ModelStatus, PaintRequest, PaintResponse,
    PublicInfo, SearchResponse,
};
pub use crate::artifact_store::{ArtifactKey, ArtifactStore, PipelineMeta};
pub use crate::config::{
    Config, MeshFormat, ReconstructConfig, SearchConfig, SynthesizeConfig, TransportMode,
    UnderstandConfig,
};
pub use crate::error::{GenError, GenResult};
pub use crate::events::{Event, JobStage, ProgressBus, Subscription};
pub use crate::pipeline::{LightOutput, Pipeline, RefineMeta};
pub use crate::reconstruct::{MeshArtifact, ReconstructTool};
pub use crate::registry::{ObjectRegistry, PlacedObject, Quality};
pub use crate::scheduler::{Job, JobStatus, Scheduler};
pub use crate::search::{SearchResult, SearchService};
pub use crate::stage::{CancelToken, Reconstruct, StageLog, Synthesize, Understand};
pub use crate::synthesize::{ImageSynthesizer, SynthesisBackend};
pub use crate::tile_store::{TileInfo, TileStore};
pub use crate::understand::{Attributes, Orientation, SizeClass, UnderstandClient};

use crate::reconstruct::looks_placeholder;

/// The wired generation core: one instance owns all orchestrator state.
pub struct Orchestrator {
    config: Config,
    tiles: Arc<TileStore>,
    artifacts: Arc<ArtifactStore>,
    registry: Arc<ObjectRegistry>,
    bus: Arc<ProgressBus>,
    scheduler: Scheduler,
    search: SearchService,
}

impl Orchestrator {
    /// Build all components from a configuration.
    pub fn new(config: Config) -> GenResult<Self> {
        let tiles = Arc::new(TileStore::new(
            config.tiles_dir(),
            config.images_cache_dir(),
            config.tile_px,
            config.memory_cache_tiles,
        )?);
        let artifacts = Arc::new(ArtifactStore::new(config.pipe_dir(), config.glb_dir())?);
        let registry = Arc::new(ObjectRegistry::open(config.objects_json_path())?);
        let bus = Arc::new(ProgressBus::new());

        let understand =
            UnderstandClient::new(config.understand.clone(), config.vlm_logs_dir())?;
        let synthesize =
            ImageSynthesizer::from_config(&config.synthesize, config.sd_logs_dir());
        let reconstruct = ReconstructTool::new(
            config.reconstruct.clone(),
            config.recon_logs_dir(),
            config.recon_debug_dir(),
            config.recon_outputs_dir(),
        );
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
            pipeline,
            Arc::clone(&registry),
            Arc::clone(&bus),
        )?;
        let search = SearchService::new(&config.search, config.vlm_logs_dir())?;

        info!(root = %config.root.display(), workers = config.max_workers, "orchestrator ready");
        Ok(Self {
            config,
            tiles,
            artifacts,
            registry,
            bus,
            scheduler,
            search,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Paint ingress: persist a tile raster and mark it dirty. Never
    /// blocks on generation.
    pub fn paint(&self, request: PaintRequest) -> GenResult<PaintResponse> {
        if let Some(size) = request.tile_size {
            if size != self.config.tile_px {
                return Err(GenError::InvalidInput(format!(
                    "tile_size {size} does not match configured {}",
                    self.config.tile_px
                )));
            }
        }
        self.tiles
            .save_tile(request.tile_x, request.tile_y, &request.pixels)?;
        Ok(PaintResponse {
            ok: true,
            modified_count: self.tiles.dirty_count(),
        })
    }

    /// Queue a generation job; empty/omitted tiles mean the dirty set.
    pub fn generate(&self, request: GenerateRequest) -> GenResult<GenerateResponse> {
        let (job_id, tiles) = self
            .scheduler
            .enqueue(request.tiles.unwrap_or_default(), true)?;
        Ok(GenerateResponse { job_id, tiles })
    }

    pub fn job_status(&self, job_id: &str) -> Option<Job> {
        self.scheduler.status(job_id)
    }

    pub fn cancel_job(&self, job_id: &str) -> bool {
        self.scheduler.cancel(job_id)
    }

    /// Tile raster for viewers. Never a miss: unknown tiles come back as
    /// a synthesized transparent PNG.
    pub fn tile_png(&self, x: i32, y: i32) -> Bytes {
        self.tiles.get_tile_bytes(x, y)
    }

    /// Registry contents (`/objects.json`).
    pub fn objects(&self) -> Vec<PlacedObject> {
        self.registry.load()
    }

    pub fn list_tiles(&self) -> Vec<TileInfo> {
        self.tiles.list_tiles()
    }

    /// Installed asset bytes, refusing placeholder meshes so viewers run
    /// their own fallback instead of parsing a broken file.
    pub fn asset_bytes(&self, file_name: &str) -> GenResult<Bytes> {
        if file_name.contains('/') || file_name.contains("..") {
            return Err(GenError::InvalidInput("invalid asset name".to_string()));
        }
        let path = self.artifacts.asset_dir().join(file_name);
        let bytes = std::fs::read(&path)?;
        if looks_placeholder(&bytes[..bytes.len().min(64)]) {
            return Err(GenError::InvalidInput(
                "not found (placeholder)".to_string(),
            ));
        }
        Ok(Bytes::from(bytes))
    }

    pub fn search(&self, query: &str, top_k: usize, target: Option<&str>) -> SearchResponse {
        SearchResponse {
            query: query.to_string(),
            results: self.search.search(query, top_k, target),
        }
    }

    /// Preview of the LM payload the search rerank would send.
    pub fn format_prompt(&self, query: &str, target: Option<&str>) -> Value {
        self.search.format_for_lm(query, target)
    }

    pub fn public_info(&self) -> PublicInfo {
        PublicInfo {
            public_url: self.config.public_url.clone(),
            notes: "If null, use local host links (a tunnel can set public_url in config)"
                .to_string(),
        }
    }

    pub fn model_status(&self) -> ModelStatus {
        ModelStatus {
            understand_configured: self.config.understand.url.is_some(),
            synthesize_worker_configured: self.config.synthesize.worker_python.is_some()
                && self.config.synthesize.worker_script.is_some(),
            reconstruct_configured: self
                .config
                .reconstruct
                .dir
                .as_ref()
                .is_some_and(|d| d.exists()),
            lm_search_configured: self.config.search.lm_url.is_some(),
        }
    }

    /// Admin: drop the pipeline artifact cache.
    pub fn clear_cache(&self) -> GenResult<AdminCount> {
        let removed = self.artifacts.clear()?;
        Ok(AdminCount { ok: true, removed })
    }

    /// Admin: delete installed mesh assets (registry file kept).
    pub fn delete_models(&self) -> GenResult<AdminCount> {
        let removed = self.artifacts.delete_meshes()?;
        Ok(AdminCount { ok: true, removed })
    }

    /// Admin: drop cached tile images.
    pub fn delete_images(&self) -> GenResult<AdminCount> {
        let removed = self.tiles.clear_images()?;
        Ok(AdminCount { ok: true, removed })
    }

    /// Viewer connect: the hello event plus a live event subscription.
    pub fn subscribe(&self) -> (Event, Subscription) {
        let hello = Event::Hello {
            objects: self.registry.load(),
            modified: self.tiles.dirty_snapshot(),
        };
        (hello, self.bus.subscribe())
    }

    pub fn unsubscribe(&self, id: u64) {
        self.bus.unsubscribe(id);
    }

    /// Any client message is treated as a keep-alive.
    pub fn ping(&self) -> Event {
        Event::PingAck
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{solid_pixels, test_config, wait_until};
    use std::time::Duration;
    use tempfile::TempDir;

    fn orchestrator(temp: &TempDir) -> Orchestrator {
        Orchestrator::new(test_config(temp.path(), 2, 0)).unwrap()
    }

    fn paint_request(core: &Orchestrator, x: i32, y: i32) -> PaintRequest {
        PaintRequest {
            tile_x: x,
            tile_y: y,
            pixels: solid_pixels(core.config().tile_px, [255, 0, 0, 255]),
            tile_size: None,
            user_id: "u1".to_string(),
        }
    }

    /// Full stack with unconfigured externals: understanding falls back,
    /// synthesis uses the builtin renderer, reconstruction installs the
    /// textured-quad fallback. The job still completes end to end.
    #[test]
    fn test_paint_generate_end_to_end() {
        let temp = TempDir::new().unwrap();
        let core = orchestrator(&temp);

        let resp = core.paint(paint_request(&core, 3, 4)).unwrap();
        assert!(resp.ok);
        assert_eq!(resp.modified_count, 1);

        let gen = core.generate(GenerateRequest::default()).unwrap();
        assert_eq!(gen.tiles, vec![(3, 4)]);

        assert!(wait_until(Duration::from_secs(15), || {
            core.job_status(&gen.job_id)
                .is_some_and(|j| j.status == JobStatus::LightReady)
        }));

        let objects = core.objects();
        assert_eq!(objects.len(), 1);
        let object = &objects[0];
        assert_eq!(object.id, "tile_3_4");
        assert_eq!(object.world, [3.0, 0.0, 4.0]);
        assert_eq!(object.scale, 1.0);
        assert_eq!(object.quality, Quality::Fallback);
        assert!(object.asset_url.ends_with("_fallback.obj"));
        assert!(core.tiles.dirty_snapshot().is_empty());

        // The fallback asset is served, with its texture and MTL present.
        let name = object.asset_url.rsplit('/').next().unwrap();
        assert!(core.asset_bytes(name).is_ok());
    }

    #[test]
    fn test_paint_rejects_bad_payloads() {
        let temp = TempDir::new().unwrap();
        let core = orchestrator(&temp);

        let mut request = paint_request(&core, 0, 0);
        request.pixels.pop();
        assert!(matches!(
            core.paint(request),
            Err(GenError::InvalidInput(_))
        ));

        let mut request = paint_request(&core, 0, 0);
        request.tile_size = Some(64);
        assert!(matches!(
            core.paint(request),
            Err(GenError::InvalidInput(_))
        ));
        assert_eq!(core.tiles.dirty_count(), 0);
    }

    #[test]
    fn test_generate_without_dirty_tiles_is_invalid() {
        let temp = TempDir::new().unwrap();
        let core = orchestrator(&temp);
        assert!(matches!(
            core.generate(GenerateRequest::default()),
            Err(GenError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_tile_png_never_misses() {
        let temp = TempDir::new().unwrap();
        let core = orchestrator(&temp);
        let bytes = core.tile_png(42, -7);
        let img = image::load_from_memory(&bytes).unwrap().to_rgba8();
        assert_eq!(img.dimensions(), (8, 8));
        assert_eq!(img.get_pixel(0, 0).0[3], 0);
    }

    #[test]
    fn test_asset_bytes_guards() {
        let temp = TempDir::new().unwrap();
        let core = orchestrator(&temp);
        let glb_dir = core.config().glb_dir();

        std::fs::write(glb_dir.join("real.glb"), b"glTF\x02rest").unwrap();
        std::fs::write(glb_dir.join("fake.glb"), b"GLB_PLACEHOLDER").unwrap();

        assert!(core.asset_bytes("real.glb").is_ok());
        assert!(matches!(
            core.asset_bytes("fake.glb"),
            Err(GenError::InvalidInput(_))
        ));
        assert!(core.asset_bytes("../objects.json").is_err());
        assert!(core.asset_bytes("missing.glb").is_err());
    }

    #[test]
    fn test_hello_carries_state() {
        let temp = TempDir::new().unwrap();
        let core = orchestrator(&temp);
        core.paint(paint_request(&core, 1, 2)).unwrap();

        let (hello, sub) = core.subscribe();
        match hello {
            Event::Hello { objects, modified } => {
                assert!(objects.is_empty());
                assert_eq!(modified, vec![(1, 2)]);
            }
            other => panic!("expected hello, got {other:?}"),
        }
        assert_eq!(core.ping(), Event::PingAck);
        core.unsubscribe(sub.id);
    }

    #[test]
    fn test_admin_surface() {
        let temp = TempDir::new().unwrap();
        let core = orchestrator(&temp);

        let status = core.model_status();
        assert!(!status.understand_configured);
        assert!(!status.synthesize_worker_configured);
        assert!(!status.reconstruct_configured);

        // Seed some cache state, then clear it through the admin calls.
        core.paint(paint_request(&core, 0, 0)).unwrap();
        let key = ArtifactKey::from_bytes(b"x");
        core.artifacts.store_image(&key, b"png").unwrap();

        assert_eq!(core.clear_cache().unwrap().removed, 1);
        assert!(core.delete_images().unwrap().removed >= 1);

        std::fs::write(core.config().glb_dir().join("a_light.glb"), b"glTF").unwrap();
        assert_eq!(core.delete_models().unwrap().removed, 1);

        let info = core.public_info();
        assert!(info.public_url.is_none());
        assert!(!info.notes.is_empty());
    }

    #[test]
    fn test_search_surface() {
        let temp = TempDir::new().unwrap();
        let core = orchestrator(&temp);
        let response = core.search("car", 5, None);
        assert_eq!(response.query, "car");
        assert!(response.results.is_empty());

        let payload = core.format_prompt("car", None);
        assert_eq!(payload["model"], "gpt-4o-mini");
    }
}
