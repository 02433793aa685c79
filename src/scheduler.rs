//! Batch generation scheduler.
//!
//! Jobs are served FIFO by a bounded pool of workers; tiles within a job
//! run sequentially on one worker so progress reporting stays ordered and
//! the external stages are rate-limited per job. Cancellation is
//! cooperative: the running tile finishes (or times out in its stage) and
//! the remaining tiles are skipped.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::error::{GenError, GenResult};
use crate::events::{Event, JobStage, ProgressBus};
use crate::pipeline::Pipeline;
use crate::registry::{ObjectRegistry, PlacedObject, Quality};
use crate::stage::{epoch_millis, epoch_secs, CancelToken};
use crate::tile_store::{TileCoord, TileStore};

/// Lifecycle of a generation job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Processing,
    LightReady,
    Refining,
    RefinedReady,
    Error,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::LightReady
                | JobStatus::RefinedReady
                | JobStatus::Error
                | JobStatus::Cancelled
        )
    }
}

/// One batch generation job.
#[derive(Debug, Clone, Serialize)]
pub struct Job {
    pub job_id: String,
    pub tiles: Vec<TileCoord>,
    pub status: JobStatus,
    pub progress: usize,
    pub total: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_tile: Option<TileCoord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub started_at: u64,
    pub refined: bool,
}

struct Inner {
    pool: Arc<rayon::ThreadPool>,
    jobs: RwLock<HashMap<String, Job>>,
    cancels: Mutex<HashMap<String, CancelToken>>,
    tiles: Arc<TileStore>,
    pipeline: Arc<Pipeline>,
    registry: Arc<ObjectRegistry>,
    bus: Arc<ProgressBus>,
    cooldown: Duration,
    enable_refiner: bool,
    refine_delay: Duration,
    refine_timeout: Duration,
    tile_scale: f64,
    seq: AtomicU64,
}

/// The scheduler: accepts batches, assigns workers, emits progress.
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    pub fn new(
        config: &Config,
        tiles: Arc<TileStore>,
        pipeline: Arc<Pipeline>,
        registry: Arc<ObjectRegistry>,
        bus: Arc<ProgressBus>,
    ) -> GenResult<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.max_workers.max(1))
            .thread_name(|idx| format!("gen-worker-{idx}"))
            .build()
            .map_err(|e| GenError::Config(format!("failed to build worker pool: {e}")))?;

        Ok(Self {
            inner: Arc::new(Inner {
                pool: Arc::new(pool),
                jobs: RwLock::new(HashMap::new()),
                cancels: Mutex::new(HashMap::new()),
                tiles,
                pipeline,
                registry,
                bus,
                cooldown: Duration::from_millis(config.per_tile_cooldown_ms),
                enable_refiner: config.enable_refiner,
                refine_delay: Duration::from_secs(config.refine_delay_secs),
                refine_timeout: Duration::from_secs(config.refine_timeout_secs),
                tile_scale: config.tile_scale,
                seq: AtomicU64::new(0),
            }),
        })
    }

    /// Queue a generation job over the given tiles; an empty list means
    /// the current dirty snapshot.
    ///
    /// The tile list is deduplicated preserving insertion order. Returns
    /// the job id and the tiles the job will process.
    pub fn enqueue(
        &self,
        requested: Vec<TileCoord>,
        refine: bool,
    ) -> GenResult<(String, Vec<TileCoord>)> {
        let tiles = if requested.is_empty() {
            self.inner.tiles.dirty_snapshot()
        } else {
            let mut seen = std::collections::HashSet::new();
            requested
                .into_iter()
                .filter(|t| seen.insert(*t))
                .collect()
        };
        if tiles.is_empty() {
            return Err(GenError::InvalidInput("no modified tiles".to_string()));
        }

        let seq = self.inner.seq.fetch_add(1, Ordering::Relaxed);
        let job_id = format!("job_{}_{seq}", epoch_millis());
        let job = Job {
            job_id: job_id.clone(),
            tiles: tiles.clone(),
            status: JobStatus::Queued,
            progress: 0,
            total: tiles.len(),
            current_tile: None,
            error: None,
            started_at: epoch_secs(),
            refined: false,
        };
        let token = CancelToken::new();

        self.inner.jobs.write().insert(job_id.clone(), job);
        self.inner
            .cancels
            .lock()
            .insert(job_id.clone(), token.clone());

        info!(job_id, tiles = tiles.len(), "job queued");
        let inner = Arc::clone(&self.inner);
        let spawn_id = job_id.clone();
        let spawn_tiles = tiles.clone();
        self.inner.pool.spawn_fifo(move || {
            inner.run_light_job(&spawn_id, &spawn_tiles, refine, &token);
        });

        Ok((job_id, tiles))
    }

    /// Request cooperative cancellation. Returns false for unknown jobs.
    pub fn cancel(&self, job_id: &str) -> bool {
        match self.inner.cancels.lock().get(job_id) {
            Some(token) => {
                info!(job_id, "cancellation requested");
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Snapshot of a job's current state.
    pub fn status(&self, job_id: &str) -> Option<Job> {
        self.inner.jobs.read().get(job_id).cloned()
    }
}

impl Inner {
    fn update_job(&self, job_id: &str, f: impl FnOnce(&mut Job)) {
        if let Some(job) = self.jobs.write().get_mut(job_id) {
            f(job);
        }
    }

    fn finish_cancelled(&self, job_id: &str) {
        info!(job_id, "job cancelled, remaining tiles skipped");
        self.update_job(job_id, |job| {
            job.status = JobStatus::Cancelled;
            job.current_tile = None;
        });
    }

    fn run_light_job(
        self: &Arc<Self>,
        job_id: &str,
        tiles: &[TileCoord],
        refine: bool,
        token: &CancelToken,
    ) {
        info!(job_id, tiles = tiles.len(), "job started");
        self.update_job(job_id, |job| job.status = JobStatus::Processing);

        for (idx, &tile) in tiles.iter().enumerate() {
            if token.is_cancelled() {
                self.finish_cancelled(job_id);
                return;
            }
            self.update_job(job_id, |job| job.current_tile = Some(tile));

            match self.process_tile(tile, token) {
                Ok(object) => {
                    // The registry write has been persisted before this
                    // progress event goes out.
                    self.update_job(job_id, |job| {
                        job.progress = idx + 1;
                        job.current_tile = None;
                    });
                    self.bus.publish(&Event::JobProgress {
                        job_id: job_id.to_string(),
                        stage: JobStage::Light,
                        entry: Some(object),
                        progress: idx + 1,
                    });
                }
                Err(GenError::Cancelled) => {
                    self.finish_cancelled(job_id);
                    return;
                }
                Err(e) => {
                    error!(job_id, ?tile, error = %e, "tile failed, aborting job");
                    self.update_job(job_id, |job| {
                        job.status = JobStatus::Error;
                        job.error = Some(e.to_string());
                        job.current_tile = None;
                    });
                    self.bus.publish(&Event::JobError {
                        job_id: job_id.to_string(),
                        tile,
                        message: e.to_string(),
                    });
                    return;
                }
            }

            if idx + 1 < tiles.len() && !self.cooldown.is_zero() {
                std::thread::sleep(self.cooldown);
            }
        }

        self.tiles.clear_dirty(tiles);
        self.update_job(job_id, |job| job.status = JobStatus::LightReady);
        self.bus.publish(&Event::JobDone {
            job_id: job_id.to_string(),
            stage: JobStage::Light,
        });
        info!(job_id, "light pass complete");

        if refine && self.enable_refiner {
            self.update_job(job_id, |job| job.status = JobStatus::Refining);
            let inner = Arc::clone(self);
            let refine_id = job_id.to_string();
            let refine_tiles = tiles.to_vec();
            let refine_token = token.clone();
            self.pool.spawn_fifo(move || {
                inner.run_refine_job(&refine_id, &refine_tiles, &refine_token);
            });
        }
    }

    fn process_tile(&self, tile: TileCoord, token: &CancelToken) -> GenResult<PlacedObject> {
        let bytes = self.tiles.get_tile_bytes(tile.0, tile.1);
        let output = self.pipeline.run_light(&bytes, token)?;

        let asset_name = output
            .asset
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default();
        let size = output
            .meta
            .attributes
            .as_ref()
            .map(|a| a.size)
            .unwrap_or_default();
        let quality = output.meta.quality.unwrap_or(Quality::Light);

        let object = PlacedObject::new(
            tile,
            self.tile_scale,
            size,
            format!("/assets/glb/{asset_name}"),
            quality,
            output.meta.attributes.clone(),
        );
        self.registry.register(object.clone())?;
        Ok(object)
    }

    fn run_refine_job(self: &Arc<Self>, job_id: &str, tiles: &[TileCoord], token: &CancelToken) {
        if !self.refine_delay.is_zero() {
            std::thread::sleep(self.refine_delay);
        }
        info!(job_id, tiles = tiles.len(), "refine pass started");

        for (idx, &tile) in tiles.iter().enumerate() {
            if token.is_cancelled() {
                self.finish_cancelled(job_id);
                return;
            }

            let id = PlacedObject::id_for(tile);
            let Some(mut object) = self.registry.get(&id) else {
                warn!(job_id, %id, "refine: object not found, skipping");
                continue;
            };
            let asset_path = self
                .pipeline
                .asset_path_for_url(&object.asset_url);

            match self.refine_with_timeout(&asset_path) {
                Ok((_refined_path, meta)) => {
                    object.asset_url = format!("/assets/glb/{}", meta.refined);
                    object.quality = Quality::Refined;
                    if let Err(e) = self.registry.register(object.clone()) {
                        error!(job_id, error = %e, "refine: registry write failed");
                        self.fail_refine(job_id, tile, &e.to_string());
                        return;
                    }
                    self.update_job(job_id, |job| job.progress = idx + 1);
                    self.bus.publish(&Event::JobProgress {
                        job_id: job_id.to_string(),
                        stage: JobStage::Refine,
                        entry: Some(object),
                        progress: idx + 1,
                    });
                }
                Err(e) => {
                    error!(job_id, ?tile, error = %e, "refine failed, aborting pass");
                    self.fail_refine(job_id, tile, &e.to_string());
                    return;
                }
            }
        }

        self.update_job(job_id, |job| {
            job.status = JobStatus::RefinedReady;
            job.refined = true;
        });
        self.bus.publish(&Event::JobDone {
            job_id: job_id.to_string(),
            stage: JobStage::Refine,
        });
        info!(job_id, "refine pass complete");
    }

    fn fail_refine(&self, job_id: &str, tile: TileCoord, message: &str) {
        self.update_job(job_id, |job| {
            job.status = JobStatus::Error;
            job.error = Some(message.to_string());
        });
        self.bus.publish(&Event::JobError {
            job_id: job_id.to_string(),
            tile,
            message: message.to_string(),
        });
    }

    /// Run one refine with a bounded wait so a wedged pass cannot hang the
    /// refine worker forever.
    fn refine_with_timeout(
        &self,
        asset_path: &std::path::Path,
    ) -> GenResult<(std::path::PathBuf, crate::pipeline::RefineMeta)> {
        let (tx, rx) = crossbeam_channel::bounded(1);
        let pipeline = Arc::clone(&self.pipeline);
        let path = asset_path.to_path_buf();
        std::thread::spawn(move || {
            let _ = tx.send(pipeline.run_refine(&path));
        });

        match rx.recv_timeout(self.refine_timeout) {
            Ok(result) => result,
            Err(_) => Err(GenError::StageFatal {
                stage: "refine",
                attempts: 1,
                message: format!("timed out after {:?}", self.refine_timeout),
            }),
        }
    }
}
