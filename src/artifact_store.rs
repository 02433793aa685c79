//! Content-addressed cache of pipeline artifacts.
//!
//! Everything is keyed by the sha256 of the source tile raster. The store
//! holds the attributes/prompt meta JSON, the synthesized PNG and the
//! installed mesh assets. Writes are temp-then-rename so readers racing a
//! writer see either the old file or nothing.

use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;

use crate::config::MeshFormat;
use crate::error::GenResult;
use crate::registry::Quality;
use crate::understand::Attributes;

/// Cache key: sha256 of the tile raster bytes, hex-encoded.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ArtifactKey(String);

impl ArtifactKey {
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self(hex::encode(Sha256::digest(bytes)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ArtifactKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Meta record for one pipeline run, cached next to its artifacts.
///
/// A meta carrying `error` never satisfies a cache hit; the pipeline will
/// retry the generation on the next request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineMeta {
    pub key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attributes: Option<Attributes>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quality: Option<Quality>,
    /// Installed asset file name (relative to the asset dir).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub asset: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace: Option<String>,
}

/// Owner of the pipe cache directory and the installed asset directory.
pub struct ArtifactStore {
    pipe_dir: PathBuf,
    asset_dir: PathBuf,
}

impl ArtifactStore {
    pub fn new(pipe_dir: PathBuf, asset_dir: PathBuf) -> GenResult<Self> {
        std::fs::create_dir_all(&pipe_dir)?;
        std::fs::create_dir_all(&asset_dir)?;
        Ok(Self {
            pipe_dir,
            asset_dir,
        })
    }

    pub fn asset_dir(&self) -> &Path {
        &self.asset_dir
    }

    fn meta_path(&self, key: &ArtifactKey) -> PathBuf {
        self.pipe_dir.join(format!("{key}.json"))
    }

    /// Cached synthesized image for a key.
    pub fn image_path(&self, key: &ArtifactKey) -> PathBuf {
        self.pipe_dir.join(format!("{key}_sd.png"))
    }

    /// Install target for the light-quality asset of a key.
    pub fn light_asset_path(&self, key: &ArtifactKey, format: MeshFormat) -> PathBuf {
        self.asset_dir
            .join(format!("{key}_light.{}", format.extension()))
    }

    pub fn load_meta(&self, key: &ArtifactKey) -> Option<PipelineMeta> {
        let content = std::fs::read_to_string(self.meta_path(key)).ok()?;
        serde_json::from_str(&content).ok()
    }

    pub fn store_meta(&self, meta: &PipelineMeta) -> GenResult<()> {
        let path = self.pipe_dir.join(format!("{}.json", meta.key));
        atomic_write(&path, &serde_json::to_vec_pretty(meta)?)
    }

    pub fn store_image(&self, key: &ArtifactKey, png: &[u8]) -> GenResult<()> {
        atomic_write(&self.image_path(key), png)
    }

    /// Cache hit: meta present without error and the referenced asset file
    /// still on disk.
    pub fn cached_asset(&self, key: &ArtifactKey) -> Option<(PathBuf, PipelineMeta)> {
        let meta = self.load_meta(key)?;
        if meta.error.is_some() {
            return None;
        }
        let asset = self.asset_dir.join(meta.asset.as_deref()?);
        if asset.exists() {
            Some((asset, meta))
        } else {
            None
        }
    }

    /// Drop the pipe cache (admin surface). Installed assets are untouched.
    pub fn clear(&self) -> GenResult<usize> {
        let mut removed = 0;
        for entry in std::fs::read_dir(&self.pipe_dir)?.flatten() {
            if entry.path().is_file() && std::fs::remove_file(entry.path()).is_ok() {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Delete installed mesh assets, keeping the registry file itself.
    pub fn delete_meshes(&self) -> GenResult<usize> {
        let mut removed = 0;
        for entry in std::fs::read_dir(&self.asset_dir)?.flatten() {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            if path.file_name().is_some_and(|n| n == "objects.json") {
                continue;
            }
            let mesh_adjacent = path
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| matches!(e, "glb" | "obj" | "mtl" | "ply" | "png"));
            if mesh_adjacent && std::fs::remove_file(&path).is_ok() {
                removed += 1;
            }
        }
        Ok(removed)
    }
}

/// Write bytes via a temp file in the destination directory plus rename.
pub(crate) fn atomic_write(path: &Path, bytes: &[u8]) -> GenResult<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent)?;
    let mut tmp = NamedTempFile::new_in(parent)?;
    tmp.write_all(bytes)?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Copy a file into place via a temp file in the destination directory.
pub(crate) fn atomic_copy(src: &Path, dest: &Path) -> GenResult<()> {
    let bytes = std::fs::read(src)?;
    atomic_write(dest, &bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store(temp: &TempDir) -> ArtifactStore {
        ArtifactStore::new(temp.path().join("pipe"), temp.path().join("glb")).unwrap()
    }

    #[test]
    fn test_key_is_stable_sha256() {
        let a = ArtifactKey::from_bytes(b"same bytes");
        let b = ArtifactKey::from_bytes(b"same bytes");
        let c = ArtifactKey::from_bytes(b"other bytes");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.as_str().len(), 64);
    }

    #[test]
    fn test_meta_roundtrip() {
        let temp = TempDir::new().unwrap();
        let store = store(&temp);
        let key = ArtifactKey::from_bytes(b"tile");

        let meta = PipelineMeta {
            key: key.as_str().to_string(),
            prompt: Some("voxel-style car".to_string()),
            quality: Some(Quality::Light),
            asset: Some(format!("{key}_light.glb")),
            output_type: Some("glb".to_string()),
            ..PipelineMeta::default()
        };
        store.store_meta(&meta).unwrap();

        let loaded = store.load_meta(&key).unwrap();
        assert_eq!(loaded.prompt.as_deref(), Some("voxel-style car"));
        assert_eq!(loaded.quality, Some(Quality::Light));
    }

    #[test]
    fn test_error_meta_is_not_a_cache_hit() {
        let temp = TempDir::new().unwrap();
        let store = store(&temp);
        let key = ArtifactKey::from_bytes(b"tile");
        let asset_name = format!("{key}_light.glb");
        std::fs::write(temp.path().join("glb").join(&asset_name), b"glTFdata").unwrap();

        store
            .store_meta(&PipelineMeta {
                key: key.as_str().to_string(),
                asset: Some(asset_name.clone()),
                error: Some("synthesize failed".to_string()),
                ..PipelineMeta::default()
            })
            .unwrap();
        assert!(store.cached_asset(&key).is_none());

        store
            .store_meta(&PipelineMeta {
                key: key.as_str().to_string(),
                asset: Some(asset_name),
                ..PipelineMeta::default()
            })
            .unwrap();
        assert!(store.cached_asset(&key).is_some());
    }

    #[test]
    fn test_cache_hit_requires_asset_file() {
        let temp = TempDir::new().unwrap();
        let store = store(&temp);
        let key = ArtifactKey::from_bytes(b"tile");
        store
            .store_meta(&PipelineMeta {
                key: key.as_str().to_string(),
                asset: Some("missing.glb".to_string()),
                ..PipelineMeta::default()
            })
            .unwrap();
        assert!(store.cached_asset(&key).is_none());
    }

    #[test]
    fn test_clear_removes_pipe_entries_only() {
        let temp = TempDir::new().unwrap();
        let store = store(&temp);
        let key = ArtifactKey::from_bytes(b"tile");
        store.store_image(&key, b"pngdata").unwrap();
        std::fs::write(temp.path().join("glb/keep.glb"), b"glTF").unwrap();

        let removed = store.clear().unwrap();
        assert_eq!(removed, 1);
        assert!(temp.path().join("glb/keep.glb").exists());
    }

    #[test]
    fn test_delete_meshes_spares_registry() {
        let temp = TempDir::new().unwrap();
        let store = store(&temp);
        let glb = temp.path().join("glb");
        std::fs::write(glb.join("a_light.glb"), b"glTF").unwrap();
        std::fs::write(glb.join("a_light.mtl"), b"newmtl").unwrap();
        std::fs::write(glb.join("a_fallback.png"), b"png").unwrap();
        std::fs::write(glb.join("objects.json"), b"[]").unwrap();

        let removed = store.delete_meshes().unwrap();
        assert_eq!(removed, 3);
        assert!(glb.join("objects.json").exists());
    }

    #[test]
    fn test_atomic_write_replaces_contents() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("file.bin");
        atomic_write(&path, b"first").unwrap();
        atomic_write(&path, b"second").unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"second");
    }
}
