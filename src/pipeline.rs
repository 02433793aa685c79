//! Per-tile pipeline: understand -> synthesize -> reconstruct, with
//! content-addressed caching and structured failure.
//!
//! Any stage failure writes an error meta (so the cache never serves a
//! half-finished result) and re-raises to the scheduler; no partial asset
//! is ever registered.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{info, warn};

use crate::artifact_store::{atomic_copy, ArtifactKey, ArtifactStore, PipelineMeta};
use crate::config::MeshFormat;
use crate::error::{GenError, GenResult};
use crate::registry::Quality;
use crate::stage::{CancelToken, Reconstruct, StageLog, Synthesize, Understand};
use crate::synthesize::{derive_prompt, sanity_check_png};

/// Result of a light-quality pipeline run.
#[derive(Debug, Clone)]
pub struct LightOutput {
    pub asset: PathBuf,
    pub meta: PipelineMeta,
}

/// Result of a refine pass.
#[derive(Debug, Clone, serde::Serialize)]
pub struct RefineMeta {
    pub base: String,
    pub refined: String,
    pub quality: Quality,
}

/// Composition of the three stage adapters over the artifact store.
pub struct Pipeline {
    artifacts: Arc<ArtifactStore>,
    understand: Box<dyn Understand>,
    synthesize: Box<dyn Synthesize>,
    reconstruct: Box<dyn Reconstruct>,
    vlm_logs_dir: PathBuf,
    output_format: MeshFormat,
}

impl Pipeline {
    pub fn new(
        artifacts: Arc<ArtifactStore>,
        understand: Box<dyn Understand>,
        synthesize: Box<dyn Synthesize>,
        reconstruct: Box<dyn Reconstruct>,
        vlm_logs_dir: PathBuf,
        output_format: MeshFormat,
    ) -> Self {
        Self {
            artifacts,
            understand,
            synthesize,
            reconstruct,
            vlm_logs_dir,
            output_format,
        }
    }

    /// Generate (or serve from cache) the light-quality asset for a tile
    /// raster.
    pub fn run_light(&self, tile_bytes: &[u8], cancel: &CancelToken) -> GenResult<LightOutput> {
        let key = ArtifactKey::from_bytes(tile_bytes);

        if let Some((asset, meta)) = self.artifacts.cached_asset(&key) {
            info!(%key, "pipeline cache hit");
            return Ok(LightOutput { asset, meta });
        }

        match self.run_light_uncached(&key, tile_bytes, cancel) {
            Ok(output) => Ok(output),
            Err(e) => {
                if !e.is_cancelled() {
                    warn!(%key, error = %e, "pipeline run failed, writing error meta");
                    let _ = self.artifacts.store_meta(&PipelineMeta {
                        key: key.as_str().to_string(),
                        error: Some(e.to_string()),
                        ..PipelineMeta::default()
                    });
                }
                Err(e)
            }
        }
    }

    fn run_light_uncached(
        &self,
        key: &ArtifactKey,
        tile_bytes: &[u8],
        cancel: &CancelToken,
    ) -> GenResult<LightOutput> {
        let attrs = self.understand.extract(tile_bytes, cancel)?;
        let prompt = derive_prompt(&attrs);

        // Persist the understanding for this key; the search service
        // answers queries out of these records.
        let mut log = StageLog::new("understand");
        log.input_digest = Some(key.as_str().to_string());
        log.prompt = Some(prompt.clone());
        log.parsed = serde_json::to_value(&attrs).ok();
        log.write(&self.vlm_logs_dir, "attrs");

        cancel.check()?;
        let png = self.synthesize.generate(&prompt, cancel)?;
        self.artifacts.store_image(key, &png)?;
        sanity_check_png(&png)?;

        cancel.check()?;
        let out_path = self.artifacts.light_asset_path(key, self.output_format);
        let artifact = self.reconstruct.reconstruct(&png, &out_path, cancel)?;

        let asset_name = artifact
            .path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_string();
        let meta = PipelineMeta {
            key: key.as_str().to_string(),
            attributes: Some(attrs),
            prompt: Some(prompt),
            quality: Some(artifact.quality),
            asset: Some(asset_name),
            output_type: Some(artifact.format.extension().to_string()),
            error: None,
            trace: None,
        };
        self.artifacts.store_meta(&meta)?;
        info!(%key, asset = %artifact.path.display(), "pipeline run complete");

        Ok(LightOutput {
            asset: artifact.path,
            meta,
        })
    }

    /// Absolute path of an installed asset given its served URL.
    pub fn asset_path_for_url(&self, asset_url: &str) -> PathBuf {
        let name = asset_url.rsplit('/').next().unwrap_or(asset_url);
        self.artifacts.asset_dir().join(name)
    }

    /// Refine pass: currently a deterministic decoration that copies the
    /// installed asset to a `_refined` sibling. Reserved hook for a
    /// higher-step synthesis pass over the same asset path.
    pub fn run_refine(&self, asset: &Path) -> GenResult<(PathBuf, RefineMeta)> {
        let stem = asset
            .file_stem()
            .and_then(|s| s.to_str())
            .ok_or_else(|| GenError::InvalidInput("asset has no file stem".to_string()))?;
        let ext = asset
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("glb");

        let base = stem.strip_suffix("_light").unwrap_or(stem);
        let refined_name = format!("{base}_refined.{ext}");
        let refined = asset
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join(&refined_name);

        if !refined.exists() {
            atomic_copy(asset, &refined)?;
        }

        let meta = RefineMeta {
            base: asset
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or_default()
                .to_string(),
            refined: refined_name,
            quality: Quality::Refined,
        };
        Ok((refined, meta))
    }
}
