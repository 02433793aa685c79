//! Configuration for the generation orchestrator.
//!
//! Loaded from a TOML file with serde defaults, so a missing file or a
//! partial file both yield a working configuration. Path accessors derive
//! the on-disk layout (tiles, caches, logs, assets) from a single root.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{GenError, GenResult};

/// Transport mode for the Understand stage endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportMode {
    /// JSON body with `image_b64` plus chat messages.
    ImageB64,
    /// OpenAI-style chat messages with a data-URL image.
    OpenaiChat,
    /// multipart/form-data file upload.
    Multipart,
}

impl Default for TransportMode {
    fn default() -> Self {
        TransportMode::ImageB64
    }
}

/// Output format requested from the mesh reconstruction tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MeshFormat {
    Glb,
    Obj,
}

impl MeshFormat {
    pub fn extension(self) -> &'static str {
        match self {
            MeshFormat::Glb => "glb",
            MeshFormat::Obj => "obj",
        }
    }

    pub fn as_str(self) -> &'static str {
        self.extension()
    }
}

impl Default for MeshFormat {
    fn default() -> Self {
        MeshFormat::Glb
    }
}

/// Understand (image -> attributes) endpoint settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UnderstandConfig {
    /// Endpoint URL. `None` means the stage falls back immediately.
    pub url: Option<String>,
    /// Optional bearer token.
    pub token: Option<String>,
    pub timeout_secs: u64,
    /// Total attempts (a timeout counts as one).
    pub retries: u32,
    pub mode: TransportMode,
}

impl Default for UnderstandConfig {
    fn default() -> Self {
        Self {
            url: None,
            token: None,
            timeout_secs: 10,
            retries: 2,
            mode: TransportMode::default(),
        }
    }
}

/// Synthesize (prompt -> image) settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SynthesizeConfig {
    /// Python interpreter of the dedicated worker venv. `None` selects the
    /// built-in deterministic renderer.
    pub worker_python: Option<PathBuf>,
    /// Worker script implementing the `--prompt/--out/--steps` contract.
    pub worker_script: Option<PathBuf>,
    pub model_id: String,
    pub steps_light: u32,
    pub steps_high: u32,
    pub resolution: u32,
    pub timeout_secs: u64,
    /// Total attempts.
    pub retries: u32,
}

impl Default for SynthesizeConfig {
    fn default() -> Self {
        Self {
            worker_python: None,
            worker_script: None,
            model_id: "runwayml/stable-diffusion-v1-5".to_string(),
            steps_light: 20,
            steps_high: 50,
            resolution: 512,
            timeout_secs: 240,
            retries: 3,
        }
    }
}

/// Reconstruct (image -> mesh) tool settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconstructConfig {
    /// Directory of the reconstruction tool. `None` means the stage goes
    /// straight to its deterministic fallback.
    pub dir: Option<PathBuf>,
    /// Entry script name inside `dir`.
    pub entry: String,
    /// Interpreter used to run the entry script.
    pub python: Option<PathBuf>,
    pub bake_texture: bool,
    pub output_format: MeshFormat,
    pub timeout_secs: u64,
}

impl Default for ReconstructConfig {
    fn default() -> Self {
        Self {
            dir: None,
            entry: "run.py".to_string(),
            python: None,
            bake_texture: true,
            output_format: MeshFormat::default(),
            timeout_secs: 300,
        }
    }
}

/// Search service settings.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct SearchConfig {
    /// Optional LM rerank endpoint; keyword scoring is used without it.
    pub lm_url: Option<String>,
    pub lm_token: Option<String>,
    pub timeout_secs: Option<u64>,
}

/// Top-level orchestrator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Root under which data/, cache/ and assets/ live.
    pub root: PathBuf,
    pub tile_px: u32,
    pub canvas_width: u32,
    pub canvas_height: u32,
    pub max_workers: usize,
    pub per_tile_cooldown_ms: u64,
    pub enable_refiner: bool,
    pub refine_delay_secs: u64,
    pub refine_timeout_secs: u64,
    /// Tile-to-meter scale for world placement.
    pub tile_scale: f64,
    /// Bound on the in-memory tile cache (entries).
    pub memory_cache_tiles: usize,
    /// Externally reachable URL advertised to frontends.
    pub public_url: Option<String>,
    pub understand: UnderstandConfig,
    pub synthesize: SynthesizeConfig,
    pub reconstruct: ReconstructConfig,
    pub search: SearchConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            root: PathBuf::from("."),
            tile_px: 32,
            canvas_width: 20000,
            canvas_height: 20000,
            max_workers: 4,
            per_tile_cooldown_ms: 5000,
            enable_refiner: true,
            refine_delay_secs: 5,
            refine_timeout_secs: 60,
            tile_scale: 1.0,
            memory_cache_tiles: 500,
            public_url: None,
            understand: UnderstandConfig::default(),
            synthesize: SynthesizeConfig::default(),
            reconstruct: ReconstructConfig::default(),
            search: SearchConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> GenResult<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| GenError::Config(e.to_string()))
    }

    /// Canonical per-tile raster files.
    pub fn tiles_dir(&self) -> PathBuf {
        self.root.join("data").join("tiles")
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.root.join("cache")
    }

    /// Legacy disk tile cache.
    pub fn images_cache_dir(&self) -> PathBuf {
        self.cache_dir().join("images")
    }

    /// Content-addressed pipeline artifacts.
    pub fn pipe_dir(&self) -> PathBuf {
        self.cache_dir().join("pipe")
    }

    /// Understand stage logs (consumed by the search service).
    pub fn vlm_logs_dir(&self) -> PathBuf {
        self.cache_dir().join("vlm_logs")
    }

    /// Reconstruction invocation logs.
    pub fn recon_logs_dir(&self) -> PathBuf {
        self.cache_dir().join("triposr_logs")
    }

    /// Snapshots of reconstruction output dirs, kept for offline debugging.
    pub fn recon_debug_dir(&self) -> PathBuf {
        self.cache_dir().join("triposr_debug")
    }

    /// Stabilized reconstruction outputs prior to install.
    pub fn recon_outputs_dir(&self) -> PathBuf {
        self.cache_dir().join("triposr_outputs")
    }

    /// Synthesize worker invocation logs.
    pub fn sd_logs_dir(&self) -> PathBuf {
        self.cache_dir().join("sd_logs")
    }

    /// Installed mesh assets and the object registry.
    pub fn glb_dir(&self) -> PathBuf {
        self.root.join("assets").join("glb")
    }

    pub fn objects_json_path(&self) -> PathBuf {
        self.glb_dir().join("objects.json")
    }

    /// URL path under which installed assets are served.
    pub fn asset_url(&self, file_name: &str) -> String {
        format!("/assets/glb/{file_name}")
    }
}
