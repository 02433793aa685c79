//! Mesh reconstruction stage: synthesized PNG -> installed mesh asset.
//!
//! Drives an external image-to-3D tool as a subprocess, then discovers its
//! outputs with bounded rounds, per-file stability checks and atomic
//! installs. A naive list-once-and-move here intermittently misses files
//! on some platforms; the rounds + stability + snapshot discipline is the
//! contract. Every invocation leaves a log and a snapshot of the output
//! directory for offline debugging.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::{Duration, Instant};

use serde_json::json;
use tracing::{debug, info, warn};

use crate::artifact_store::{atomic_copy, atomic_write};
use crate::config::{MeshFormat, ReconstructConfig};
use crate::error::{GenError, GenResult};
use crate::registry::Quality;
use crate::stage::{backoff_delay, run_with_deadline, stamp, CancelToken, Reconstruct};

pub const GLB_MAGIC: &[u8; 4] = b"glTF";

/// Byte markers of known placeholder meshes; such files are never served
/// or installed as real assets.
pub const PLACEHOLDER_MARKERS: [&[u8]; 3] =
    [b"GLB_PLACEHOLDER", b"GLB_FALLBACK", b"DUMMY_GLB"];

/// Bounds on the post-run output discovery loop.
#[derive(Debug, Clone)]
pub struct DiscoveryPolicy {
    pub rounds: u32,
    pub deadline: Duration,
    pub stability_interval: Duration,
}

impl Default for DiscoveryPolicy {
    fn default() -> Self {
        Self {
            rounds: 5,
            deadline: Duration::from_secs(60),
            stability_interval: Duration::from_millis(500),
        }
    }
}

/// An installed mesh asset.
#[derive(Debug, Clone)]
pub struct MeshArtifact {
    pub path: PathBuf,
    pub format: MeshFormat,
    pub quality: Quality,
}

/// An OBJ is usable only with at least 5 vertex lines; the textured-quad
/// fallback has exactly 4, so this also keeps fallbacks self-describing.
pub fn validate_obj(path: &Path) -> bool {
    match std::fs::read_to_string(path) {
        Ok(text) => text.lines().filter(|l| l.starts_with("v ")).count() >= 5,
        Err(_) => false,
    }
}

/// Whether a byte prefix carries a known placeholder marker.
pub fn looks_placeholder(prefix: &[u8]) -> bool {
    PLACEHOLDER_MARKERS
        .iter()
        .any(|marker| prefix.windows(marker.len()).any(|w| w == *marker))
}

/// A GLB is usable only with the `glTF` magic and no placeholder marker.
pub fn validate_glb_prefix(prefix: &[u8]) -> bool {
    prefix.len() >= 4 && &prefix[..4] == GLB_MAGIC && !looks_placeholder(prefix)
}

/// The reconstruction stage adapter.
pub struct ReconstructTool {
    cfg: ReconstructConfig,
    logs_dir: PathBuf,
    debug_dir: PathBuf,
    outputs_dir: PathBuf,
    policy: DiscoveryPolicy,
}

impl ReconstructTool {
    pub fn new(
        cfg: ReconstructConfig,
        logs_dir: PathBuf,
        debug_dir: PathBuf,
        outputs_dir: PathBuf,
    ) -> Self {
        Self {
            cfg,
            logs_dir,
            debug_dir,
            outputs_dir,
            policy: DiscoveryPolicy::default(),
        }
    }

    /// Deterministic fallback: a textured quad referencing a PNG copy of
    /// the input image, with an accompanying MTL.
    fn install_fallback(&self, image_png: &[u8], out_path: &Path) -> GenResult<MeshArtifact> {
        let parent = out_path.parent().unwrap_or_else(|| Path::new("."));
        let stem = out_path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("asset");

        let tex_name = format!("{stem}_fallback.png");
        let mtl_name = format!("{stem}_fallback.mtl");
        let obj_name = format!("{stem}_fallback.obj");

        atomic_write(&parent.join(&tex_name), image_png)?;
        atomic_write(
            &parent.join(&mtl_name),
            format!("newmtl fallback\nmap_Kd {tex_name}\n").as_bytes(),
        )?;

        let obj = format!(
            "mtllib {mtl_name}\n\
             o fallback_quad\n\
             v -0.5 -0.5 0.0\n\
             v 0.5 -0.5 0.0\n\
             v 0.5 0.5 0.0\n\
             v -0.5 0.5 0.0\n\
             vt 0 0\n\
             vt 1 0\n\
             vt 1 1\n\
             vt 0 1\n\
             usemtl fallback\n\
             s off\n\
             f 1/1 2/2 3/3 4/4\n"
        );
        let obj_path = parent.join(&obj_name);
        atomic_write(&obj_path, obj.as_bytes())?;

        info!(path = %obj_path.display(), "installed textured-quad fallback mesh");
        Ok(MeshArtifact {
            path: obj_path,
            format: MeshFormat::Obj,
            quality: Quality::Fallback,
        })
    }

    /// Install a discovered OBJ plus its texture/MTL accompaniments.
    fn install_obj(
        &self,
        snapshot: &Path,
        discovery_root: &Path,
        out_path: &Path,
    ) -> GenResult<PathBuf> {
        let final_path = out_path.with_extension("obj");
        atomic_copy(snapshot, &final_path)?;
        let parent = final_path.parent().unwrap_or_else(|| Path::new("."));
        let stem = final_path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("asset")
            .to_string();

        // Bring the first texture along, renamed onto the asset stem.
        let mut tex_name = None;
        if let Some(tex) = walk_files(discovery_root).into_iter().find(|p| {
            p.extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| matches!(e.to_ascii_lowercase().as_str(), "png" | "jpg" | "jpeg"))
        }) {
            if let Some(ext) = tex.extension().and_then(|e| e.to_str()) {
                let name = format!("{stem}.{ext}");
                if atomic_copy(&tex, &parent.join(&name)).is_ok() {
                    tex_name = Some(name);
                }
            }
        }

        // Some tool runs export an OBJ without an MTL; generate one
        // referencing the texture so viewers get a material.
        let mtl_path = parent.join(format!("{stem}.mtl"));
        if !mtl_path.exists() {
            if let Some(tex) = &tex_name {
                let _ = atomic_write(
                    &mtl_path,
                    format!("newmtl material_0\nmap_Kd {tex}\n").as_bytes(),
                );
            }
        }

        // Ensure the OBJ references its material library.
        if mtl_path.exists() {
            if let Ok(text) = std::fs::read_to_string(&final_path) {
                let has_mtllib = text.lines().take(5).any(|l| l.starts_with("mtllib"));
                if !has_mtllib {
                    let mtl_file = format!("{stem}.mtl");
                    let _ = atomic_write(
                        &final_path,
                        format!("mtllib {mtl_file}\n{text}").as_bytes(),
                    );
                }
            }
        }

        Ok(final_path)
    }

    /// Bounded discovery over the output snapshot: a fixed number of
    /// rounds within a deadline, strategies tried in preference order,
    /// each candidate stability-checked before install.
    fn discover_and_install(
        &self,
        discovery_root: &Path,
        out_path: &Path,
        run_stamp: &str,
        log: &RunLog,
        cancel: &CancelToken,
    ) -> GenResult<Option<MeshArtifact>> {
        let snapshot_dir = self.outputs_dir.join(run_stamp);
        std::fs::create_dir_all(&snapshot_dir)?;

        let deadline = Instant::now() + self.policy.deadline;
        let mut round = 0u32;
        while round < self.policy.rounds && Instant::now() < deadline {
            round += 1;
            cancel.check()?;
            log.append(&format!("discovery round {round} starting"));

            for (strategy, candidates) in discovery_strategies(discovery_root) {
                for candidate in candidates {
                    cancel.check()?;
                    if !is_file_stable(&candidate, self.policy.stability_interval) {
                        log.append(&format!(
                            "candidate not stable yet: {}",
                            candidate.display()
                        ));
                        continue;
                    }

                    let Some(name) = candidate.file_name() else {
                        continue;
                    };
                    let snap = snapshot_dir.join(name);
                    if atomic_copy(&candidate, &snap).is_err() {
                        log.append(&format!(
                            "failed to snapshot candidate {}",
                            candidate.display()
                        ));
                        continue;
                    }

                    let ext = snap
                        .extension()
                        .and_then(|e| e.to_str())
                        .map(|e| e.to_ascii_lowercase())
                        .unwrap_or_default();
                    let installed = match ext.as_str() {
                        "glb" => {
                            let bytes = std::fs::read(&snap)?;
                            if !validate_glb_prefix(&bytes[..bytes.len().min(64)]) {
                                log.append(&format!(
                                    "rejected GLB (bad magic or placeholder): {}",
                                    snap.display()
                                ));
                                continue;
                            }
                            let final_path = out_path.with_extension("glb");
                            atomic_copy(&snap, &final_path)?;
                            Some((final_path, MeshFormat::Glb))
                        }
                        "obj" => {
                            if !validate_obj(&snap) {
                                log.append(&format!(
                                    "rejected OBJ (too few vertices): {}",
                                    snap.display()
                                ));
                                continue;
                            }
                            let final_path =
                                self.install_obj(&snap, discovery_root, out_path)?;
                            Some((final_path, MeshFormat::Obj))
                        }
                        // No in-process converter: keep the snapshot for
                        // debugging and keep looking.
                        _ => None,
                    };

                    if let Some((final_path, format)) = installed {
                        log.append(&format!(
                            "installed {} -> {} (round {round} strategy {strategy})",
                            snap.display(),
                            final_path.display()
                        ));
                        let meta = json!({
                            "source": candidate.display().to_string(),
                            "snapshot": snap.display().to_string(),
                            "final": final_path.display().to_string(),
                            "round": round,
                            "strategy": strategy,
                        });
                        let _ = atomic_write(
                            &snapshot_dir.join("meta.json"),
                            meta.to_string().as_bytes(),
                        );
                        return Ok(Some(MeshArtifact {
                            path: final_path,
                            format,
                            quality: Quality::Light,
                        }));
                    }
                }
            }

            let sleep = backoff_delay(round).min(deadline.saturating_duration_since(Instant::now()));
            if !sleep.is_zero() {
                std::thread::sleep(sleep);
            }
        }

        log.append("all discovery rounds exhausted, no valid outputs found");
        Ok(None)
    }
}

impl Reconstruct for ReconstructTool {
    fn reconstruct(
        &self,
        image_png: &[u8],
        out_path: &Path,
        cancel: &CancelToken,
    ) -> GenResult<MeshArtifact> {
        cancel.check()?;

        let Some(tool_dir) = self.cfg.dir.as_ref().filter(|d| d.exists()) else {
            warn!("reconstruction tool not configured, using fallback mesh");
            return self.install_fallback(image_png, out_path);
        };

        let scratch = tempfile::tempdir()?;
        let input = scratch.path().join("input.png");
        std::fs::write(&input, image_png)?;
        let outdir = scratch.path().join("out");
        std::fs::create_dir_all(&outdir)?;

        let python = self
            .cfg
            .python
            .clone()
            .unwrap_or_else(|| PathBuf::from("python3"));
        let entry = tool_dir.join(&self.cfg.entry);
        let mut cmd = Command::new(&python);
        cmd.arg(&entry)
            .arg(&input)
            .arg("--output-dir")
            .arg(&outdir)
            .arg("--model-save-format")
            .arg(self.cfg.output_format.as_str())
            .current_dir(tool_dir);
        if self.cfg.bake_texture {
            cmd.arg("--bake-texture");
        }
        let cmd_line = format!("{cmd:?}");

        let run_stamp = stamp();
        let log = RunLog::create(&self.logs_dir, &run_stamp);
        log.append(&format!("command: {cmd_line}"));

        let outcome = match run_with_deadline(
            &mut cmd,
            Duration::from_secs(self.cfg.timeout_secs),
            cancel,
        ) {
            Ok(outcome) => outcome,
            Err(GenError::Cancelled) => return Err(GenError::Cancelled),
            Err(e) => {
                log.append(&format!("failed to launch tool: {e}"));
                warn!(error = %e, "reconstruction tool launch failed");
                return self.install_fallback(image_png, out_path);
            }
        };

        log.append(&format!(
            "returncode: {:?} timed_out: {}",
            outcome.code, outcome.timed_out
        ));
        log.append(&outcome.output);
        log.append(&format!("outdir contents: {:?}", walk_files(&outdir)));

        // Persist a snapshot of the output dir and discover against it,
        // so transient cleanup of the scratch dir cannot race discovery.
        let discovery_root = match copy_tree(&outdir, &self.debug_dir.join(&run_stamp)) {
            Ok(snapshot) => {
                log.append(&format!("snapshot copied to {}", snapshot.display()));
                flatten_single_nested_dir(&snapshot, &log);
                snapshot
            }
            Err(e) => {
                log.append(&format!("failed to snapshot outdir: {e}"));
                outdir.clone()
            }
        };

        if !outcome.success() {
            log.append("tool failed, installing fallback mesh");
            debug!(code = ?outcome.code, "reconstruction tool failed");
            return self.install_fallback(image_png, out_path);
        }

        match self.discover_and_install(&discovery_root, out_path, &run_stamp, &log, cancel)? {
            Some(artifact) => Ok(artifact),
            None => self.install_fallback(image_png, out_path),
        }
    }
}

/// Ordered discovery strategies over a directory tree.
fn discovery_strategies(root: &Path) -> Vec<(u32, Vec<PathBuf>)> {
    let files = walk_files(root);
    let by_ext = |ext: &str| -> Vec<PathBuf> {
        files
            .iter()
            .filter(|p| {
                p.extension()
                    .and_then(|e| e.to_str())
                    .is_some_and(|e| e.eq_ignore_ascii_case(ext))
            })
            .cloned()
            .collect()
    };

    let named_mesh = files
        .iter()
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.to_ascii_lowercase().contains("mesh"))
        })
        .cloned()
        .collect();

    // Files inside a single nested subdir, in case flattening was skipped.
    let nested = {
        let dirs: Vec<_> = std::fs::read_dir(root)
            .into_iter()
            .flatten()
            .flatten()
            .map(|e| e.path())
            .filter(|p| p.is_dir())
            .collect();
        if dirs.len() == 1 {
            walk_files(&dirs[0])
        } else {
            Vec::new()
        }
    };

    vec![
        (1, by_ext("glb")),
        (2, by_ext("obj")),
        (3, by_ext("ply")),
        (4, named_mesh),
        (5, nested),
    ]
}

/// All files under a directory, recursively, in a deterministic order.
fn walk_files(root: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else if path.is_file() {
                files.push(path);
            }
        }
    }
    files.sort();
    files
}

/// Size unchanged across two samples separated by the stability interval.
fn is_file_stable(path: &Path, interval: Duration) -> bool {
    let Ok(first) = std::fs::metadata(path) else {
        return false;
    };
    std::thread::sleep(interval);
    match std::fs::metadata(path) {
        Ok(second) => second.len() == first.len(),
        Err(_) => false,
    }
}

fn copy_tree(src: &Path, dest: &Path) -> GenResult<PathBuf> {
    std::fs::create_dir_all(dest)?;
    for file in walk_files(src) {
        let rel = file.strip_prefix(src).unwrap_or(&file);
        let target = dest.join(rel);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::copy(&file, &target)?;
    }
    Ok(dest.to_path_buf())
}

/// When the tool wrote everything into one nested numeric folder (a common
/// pattern), pull those files up to the snapshot root so discovery stays
/// simple. Name collisions keep the subdir name as a prefix.
fn flatten_single_nested_dir(root: &Path, log: &RunLog) {
    let Ok(entries) = std::fs::read_dir(root) else {
        return;
    };
    let dirs: Vec<_> = entries
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.is_dir())
        .collect();
    if dirs.len() != 1 {
        return;
    }
    let nested = &dirs[0];
    let nested_name = nested
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("nested")
        .to_string();

    let mut moved = 0usize;
    for file in walk_files(nested) {
        let Some(name) = file.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let mut dest = root.join(name);
        if dest.exists() {
            dest = root.join(format!("{nested_name}_{name}"));
        }
        if std::fs::rename(&file, &dest)
            .or_else(|_| std::fs::copy(&file, &dest).map(|_| ()))
            .is_ok()
        {
            moved += 1;
        }
    }
    let _ = std::fs::remove_dir(nested);
    if moved > 0 {
        log.append(&format!("flattened snapshot: moved {moved} files"));
    }
}

/// Append-only text log for one tool invocation. Logging failures are
/// swallowed; the log must never take down the stage.
struct RunLog {
    path: Option<PathBuf>,
}

impl RunLog {
    fn create(dir: &Path, run_stamp: &str) -> Self {
        let path = (|| {
            std::fs::create_dir_all(dir).ok()?;
            let path = dir.join(format!("triposr_{run_stamp}.log"));
            std::fs::write(&path, "").ok()?;
            Some(path)
        })();
        Self { path }
    }

    fn append(&self, line: &str) {
        use std::io::Write;
        if let Some(path) = &self.path {
            if let Ok(mut file) = std::fs::OpenOptions::new().append(true).open(path) {
                let _ = writeln!(file, "{line}");
            }
        }
    }
}
