//! Tile store: canonical per-tile rasters, read-through caches, dirty set.
//!
//! Read priority for a tile: memory cache, canonical on-disk file, legacy
//! disk cache, freshly synthesized transparent tile. Placeholder tiles are
//! cached in memory only so they can never poison the disk cache.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::time::Duration;

use bytes::Bytes;
use image::{ImageFormat, RgbaImage};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::{GenError, GenResult};

const PNG_MAGIC: &[u8; 8] = b"\x89PNG\r\n\x1a\n";

/// Tile coordinate on the canvas grid.
pub type TileCoord = (i32, i32);

/// Saved-tile listing entry for viewers.
#[derive(Debug, Clone, serde::Serialize)]
pub struct TileInfo {
    pub x: i32,
    pub y: i32,
    pub url: String,
}

/// Bounded in-memory tile cache with FIFO eviction.
///
/// Single map, single mutex: at the target sizes (~500 entries of small
/// PNGs) contention is negligible and the eviction order stays trivial.
struct MemoryCache {
    entries: HashMap<TileCoord, Bytes>,
    order: VecDeque<TileCoord>,
    capacity: usize,
}

impl MemoryCache {
    fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            order: VecDeque::new(),
            capacity,
        }
    }

    fn get(&self, coord: &TileCoord) -> Option<Bytes> {
        self.entries.get(coord).cloned()
    }

    fn insert(&mut self, coord: TileCoord, data: Bytes) {
        if self.capacity == 0 {
            return;
        }
        if self.entries.insert(coord, data).is_none() {
            self.order.push_back(coord);
        }
        while self.entries.len() > self.capacity {
            match self.order.pop_front() {
                Some(oldest) => {
                    self.entries.remove(&oldest);
                }
                None => break,
            }
        }
    }

    fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }
}

/// Owner of tile raster files, caches and the dirty set.
pub struct TileStore {
    tiles_dir: PathBuf,
    cache_dir: PathBuf,
    tile_px: u32,
    memory: Mutex<MemoryCache>,
    dirty: Mutex<BTreeSet<TileCoord>>,
}

impl TileStore {
    pub fn new(
        tiles_dir: PathBuf,
        cache_dir: PathBuf,
        tile_px: u32,
        memory_capacity: usize,
    ) -> GenResult<Self> {
        std::fs::create_dir_all(&tiles_dir)?;
        std::fs::create_dir_all(&cache_dir)?;
        Ok(Self {
            tiles_dir,
            cache_dir,
            tile_px,
            memory: Mutex::new(MemoryCache::new(memory_capacity)),
            dirty: Mutex::new(BTreeSet::new()),
        })
    }

    pub fn tile_px(&self) -> u32 {
        self.tile_px
    }

    fn tile_file_name(x: i32, y: i32) -> String {
        format!("tile_{x}_{y}.png")
    }

    fn canonical_path(&self, x: i32, y: i32) -> PathBuf {
        self.tiles_dir.join(Self::tile_file_name(x, y))
    }

    fn cache_path(&self, x: i32, y: i32) -> PathBuf {
        self.cache_dir.join(Self::tile_file_name(x, y))
    }

    /// Persist a painted tile and mark it dirty.
    ///
    /// Rejects payloads whose pixel count does not match `tile_px²`; the
    /// dirty set is untouched on rejection. The write goes through to the
    /// disk and memory caches so reads immediately serve the new raster.
    pub fn save_tile(&self, x: i32, y: i32, pixels: &[[u8; 4]]) -> GenResult<()> {
        let expected = (self.tile_px * self.tile_px) as usize;
        if pixels.len() != expected {
            return Err(GenError::InvalidInput(format!(
                "pixel length mismatch: got {}, expected {expected}",
                pixels.len()
            )));
        }

        let bytes = encode_rgba_png(self.tile_px, self.tile_px, pixels)?;
        let path = self.canonical_path(x, y);
        std::fs::write(&path, &bytes)?;

        let data = Bytes::from(bytes);
        // Cache write failures must not fail the save.
        if let Err(e) = std::fs::write(self.cache_path(x, y), &data) {
            warn!(x, y, error = %e, "disk cache write failed");
        }
        self.memory.lock().insert((x, y), data);

        self.dirty.lock().insert((x, y));
        debug!(x, y, "tile saved");
        Ok(())
    }

    /// Fetch the PNG bytes for a tile. Never fails: a missing tile yields
    /// a freshly synthesized transparent raster (memory-cached only).
    pub fn get_tile_bytes(&self, x: i32, y: i32) -> Bytes {
        let coord = (x, y);
        if let Some(data) = self.memory.lock().get(&coord) {
            return data;
        }

        // Canonical file wins over the disk cache so stale placeholder
        // files cannot mask a newly painted tile.
        let canonical = self.canonical_path(x, y);
        if let Ok(bytes) = std::fs::read(&canonical) {
            let data = Bytes::from(bytes);
            if let Err(e) = std::fs::write(self.cache_path(x, y), &data) {
                warn!(x, y, error = %e, "disk cache backfill failed");
            }
            self.memory.lock().insert(coord, data.clone());
            return data;
        }

        if let Some(data) = self.read_cache_checked(x, y) {
            self.memory.lock().insert(coord, data.clone());
            return data;
        }

        let data = match self.transparent_tile() {
            Ok(data) => data,
            Err(e) => {
                warn!(x, y, error = %e, "transparent tile synthesis failed");
                Bytes::new()
            }
        };
        self.memory.lock().insert(coord, data.clone());
        data
    }

    /// Read a tile from the legacy disk cache, tolerating in-flight writes.
    ///
    /// A bad PNG header is re-read up to 3 times; if it stays corrupt the
    /// file is deleted so the tile regenerates on the fallback path.
    fn read_cache_checked(&self, x: i32, y: i32) -> Option<Bytes> {
        let path = self.cache_path(x, y);
        if !path.exists() {
            return None;
        }
        for attempt in 0..3 {
            match std::fs::read(&path) {
                Ok(bytes) if bytes.len() >= PNG_MAGIC.len() && bytes[..8] == PNG_MAGIC[..] => {
                    return Some(Bytes::from(bytes));
                }
                Ok(_) => {
                    debug!(x, y, attempt, "cached tile has bad PNG header");
                    std::thread::sleep(Duration::from_millis(50));
                }
                Err(_) => return None,
            }
        }
        warn!(x, y, "cached tile corrupt after retries, deleting");
        let _ = std::fs::remove_file(&path);
        None
    }

    fn transparent_tile(&self) -> GenResult<Bytes> {
        let img = RgbaImage::new(self.tile_px, self.tile_px);
        let mut buf = Cursor::new(Vec::new());
        img.write_to(&mut buf, ImageFormat::Png)?;
        Ok(Bytes::from(buf.into_inner()))
    }

    /// Current dirty set, without clearing it.
    pub fn dirty_snapshot(&self) -> Vec<TileCoord> {
        self.dirty.lock().iter().copied().collect()
    }

    pub fn dirty_count(&self) -> usize {
        self.dirty.lock().len()
    }

    /// Remove a subset of tiles from the dirty set.
    pub fn clear_dirty(&self, tiles: &[TileCoord]) {
        let mut dirty = self.dirty.lock();
        for coord in tiles {
            dirty.remove(coord);
        }
    }

    pub fn mark_dirty(&self, coord: TileCoord) {
        self.dirty.lock().insert(coord);
    }

    /// Enumerate all saved tiles for viewers.
    pub fn list_tiles(&self) -> Vec<TileInfo> {
        let mut tiles = Vec::new();
        let Ok(entries) = std::fs::read_dir(&self.tiles_dir) else {
            return tiles;
        };
        for entry in entries.flatten() {
            if let Some((x, y)) = parse_tile_name(&entry.path()) {
                tiles.push(TileInfo {
                    x,
                    y,
                    url: format!("/data/tiles/tile_{x}_{y}.png"),
                });
            }
        }
        tiles.sort_by_key(|t| (t.x, t.y));
        tiles
    }

    /// Drop the disk and memory caches (admin surface). Canonical tile
    /// files are untouched.
    pub fn clear_images(&self) -> GenResult<usize> {
        let mut removed = 0;
        if let Ok(entries) = std::fs::read_dir(&self.cache_dir) {
            for entry in entries.flatten() {
                if entry.path().extension().is_some_and(|e| e == "png")
                    && std::fs::remove_file(entry.path()).is_ok()
                {
                    removed += 1;
                }
            }
        }
        self.memory.lock().clear();
        Ok(removed)
    }
}

fn parse_tile_name(path: &Path) -> Option<(i32, i32)> {
    let stem = path.file_stem()?.to_str()?;
    if path.extension()? != "png" {
        return None;
    }
    let rest = stem.strip_prefix("tile_")?;
    let (x, y) = rest.split_once('_')?;
    Some((x.parse().ok()?, y.parse().ok()?))
}

/// Encode an RGBA pixel list as PNG bytes.
pub fn encode_rgba_png(width: u32, height: u32, pixels: &[[u8; 4]]) -> GenResult<Vec<u8>> {
    let mut raw = Vec::with_capacity(pixels.len() * 4);
    for px in pixels {
        raw.extend_from_slice(px);
    }
    let img = RgbaImage::from_raw(width, height, raw).ok_or_else(|| {
        GenError::InvalidInput("pixel buffer does not match dimensions".to_string())
    })?;
    let mut buf = Cursor::new(Vec::new());
    img.write_to(&mut buf, ImageFormat::Png)?;
    Ok(buf.into_inner())
}
