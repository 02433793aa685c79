//! Typed request/response shapes for the ingress surface.
//!
//! The HTTP/WebSocket transport is out of scope; these DTOs define the
//! JSON bodies a transport layer maps onto `Orchestrator` methods.

use serde::{Deserialize, Serialize};

use crate::search::SearchResult;
use crate::tile_store::TileCoord;

/// `POST /paint` body.
#[derive(Debug, Clone, Deserialize)]
pub struct PaintRequest {
    pub tile_x: i32,
    pub tile_y: i32,
    /// One `[r, g, b, a]` quadruple per pixel, row-major.
    pub pixels: Vec<[u8; 4]>,
    #[serde(default)]
    pub tile_size: Option<u32>,
    #[serde(default)]
    pub user_id: String,
}

/// `POST /paint` response.
#[derive(Debug, Clone, Serialize)]
pub struct PaintResponse {
    pub ok: bool,
    pub modified_count: usize,
}

/// `POST /generate` body; omitted tiles mean "all dirty tiles".
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GenerateRequest {
    #[serde(default)]
    pub tiles: Option<Vec<TileCoord>>,
}

/// `POST /generate` response.
#[derive(Debug, Clone, Serialize)]
pub struct GenerateResponse {
    pub job_id: String,
    pub tiles: Vec<TileCoord>,
}

/// `GET /search` response.
#[derive(Debug, Clone, Serialize)]
pub struct SearchResponse {
    pub query: String,
    pub results: Vec<SearchResult>,
}

/// `GET /public_info` response.
#[derive(Debug, Clone, Serialize)]
pub struct PublicInfo {
    pub public_url: Option<String>,
    pub notes: String,
}

/// `GET /admin/models` response: which external backends are configured.
#[derive(Debug, Clone, Serialize)]
pub struct ModelStatus {
    pub understand_configured: bool,
    pub synthesize_worker_configured: bool,
    pub reconstruct_configured: bool,
    pub lm_search_configured: bool,
}

/// Admin mutation response.
#[derive(Debug, Clone, Serialize)]
pub struct AdminCount {
    pub ok: bool,
    pub removed: usize,
}
