//! Image synthesis stage: prompt -> PNG bytes.
//!
//! The prompt is derived from the understanding attributes, or taken
//! verbatim from a raw-text understanding result when that text looks
//! substantive. Execution goes through a `SynthesisBackend`: either the
//! out-of-process worker (a dedicated venv speaking the
//! `--prompt/--out/--steps` CLI contract) or the built-in deterministic
//! renderer, which doubles as the post-retry fallback.

use std::io::Cursor;
use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use image::{ImageFormat, Rgba, RgbaImage};
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::SynthesizeConfig;
use crate::error::{GenError, GenResult};
use crate::stage::{backoff_delay, run_with_deadline, stamp, CancelToken, Synthesize};
use crate::understand::Attributes;

/// Tokens that mark a raw understanding text as too noisy to forward.
const NOISE_TOKENS: [&str; 6] = ["abstract", "unknown", "maybe", "not sure", "idk", "unsure"];

/// Compose the synthesis prompt from structured attributes.
pub fn compose_prompt(attrs: &Attributes) -> String {
    format!(
        "voxel-style {}, {} size, primary colors: {}, features: {}, \
         low-poly, game-friendly, 3D render, {} view, clean background, \
         high quality, detailed",
        attrs.category,
        attrs.size.as_str(),
        attrs.colors.join(", "),
        attrs.details.join(", "),
        attrs.orientation.as_str(),
    )
}

/// Whether a raw understanding text is worth sending verbatim.
///
/// Requires length >= 40, a non-JSON shape and none of the noise tokens;
/// anything else falls back to the structured prompt so free-form noise
/// never reaches the synthesis model.
pub fn substantive_raw_text(s: &str) -> bool {
    let trimmed = s.trim();
    if trimmed.len() < 40 {
        return false;
    }
    if trimmed.starts_with('{') && trimmed.ends_with('}') {
        return false;
    }
    let lower = trimmed.to_lowercase();
    !NOISE_TOKENS.iter().any(|t| lower.contains(t))
}

/// Derive the prompt for a tile: substantive raw text wins, otherwise the
/// composed structured prompt.
pub fn derive_prompt(attrs: &Attributes) -> String {
    if let Some(raw) = attrs.raw_text() {
        if substantive_raw_text(raw) {
            return raw.trim().to_string();
        }
    }
    compose_prompt(attrs)
}

/// Reject synthesized images with no usable color variation.
///
/// An image fails when no channel carries more than two distinct values,
/// which catches the solid-color outputs produced by a wedged model.
pub fn sanity_check_png(png: &[u8]) -> GenResult<()> {
    let img = image::load_from_memory(png)?.to_rgba8();
    let mut seen = [[false; 256]; 3];
    let mut counts = [0usize; 3];
    for px in img.pixels() {
        for ch in 0..3 {
            let v = px.0[ch] as usize;
            if !seen[ch][v] {
                seen[ch][v] = true;
                counts[ch] += 1;
            }
        }
    }
    if counts.iter().all(|&c| c <= 2) {
        return Err(GenError::Sanity(format!(
            "image has too few distinct colors (r={}, g={}, b={})",
            counts[0], counts[1], counts[2]
        )));
    }
    Ok(())
}

/// One synthesis execution path.
pub trait SynthesisBackend: Send + Sync {
    fn render(
        &self,
        prompt: &str,
        seed: u32,
        steps: u32,
        cancel: &CancelToken,
    ) -> GenResult<Vec<u8>>;
}

/// Out-of-process worker backend.
///
/// CLI contract: `<python> <script> --prompt <s> --out <png> --steps <n>
/// --model <id>`; exit 0 with stdout JSON `{"status":"ok","out":<path>}`
/// or `{"status":"error","error":...,"trace":...}`.
pub struct WorkerBackend {
    python: PathBuf,
    script: PathBuf,
    model_id: String,
    timeout: Duration,
    log_dir: PathBuf,
}

impl WorkerBackend {
    pub fn new(
        python: PathBuf,
        script: PathBuf,
        model_id: String,
        timeout: Duration,
        log_dir: PathBuf,
    ) -> Self {
        Self {
            python,
            script,
            model_id,
            timeout,
            log_dir,
        }
    }

    fn write_log(&self, cmd_line: &str, output: &str) {
        let write = || -> std::io::Result<()> {
            std::fs::create_dir_all(&self.log_dir)?;
            let path = self.log_dir.join(format!("sd_worker_{}.log", stamp()));
            std::fs::write(path, format!("CMD: {cmd_line}\n\n{output}\n"))
        };
        if let Err(e) = write() {
            warn!(error = %e, "failed to write synthesize worker log");
        }
    }
}

impl SynthesisBackend for WorkerBackend {
    // The worker CLI has no seed flag; variation comes from the prompt.
    fn render(
        &self,
        prompt: &str,
        _seed: u32,
        steps: u32,
        cancel: &CancelToken,
    ) -> GenResult<Vec<u8>> {
        let scratch = tempfile::tempdir()?;
        let out_path = scratch.path().join("sd_out.png");

        let mut cmd = Command::new(&self.python);
        cmd.arg(&self.script)
            .arg("--prompt")
            .arg(prompt)
            .arg("--out")
            .arg(&out_path)
            .arg("--steps")
            .arg(steps.to_string())
            .arg("--model")
            .arg(&self.model_id);
        let cmd_line = format!("{cmd:?}");

        let outcome = run_with_deadline(&mut cmd, self.timeout, cancel)?;
        self.write_log(&cmd_line, &outcome.output);

        if outcome.timed_out {
            return Err(GenError::StageTransient {
                stage: "synthesize",
                message: "worker timed out".to_string(),
            });
        }

        // The worker prints a JSON status line; surface its error if any.
        if let Some(status) = parse_worker_status(&outcome.output) {
            if status.get("status").and_then(Value::as_str) == Some("error") {
                let msg = status
                    .get("error")
                    .and_then(Value::as_str)
                    .unwrap_or("worker reported an error");
                return Err(GenError::StageTransient {
                    stage: "synthesize",
                    message: msg.to_string(),
                });
            }
            if let Some(out) = status.get("out").and_then(Value::as_str) {
                if let Ok(bytes) = std::fs::read(out) {
                    return Ok(bytes);
                }
            }
        }

        if !outcome.success() {
            return Err(GenError::StageTransient {
                stage: "synthesize",
                message: format!("worker exited with {:?}", outcome.code),
            });
        }

        std::fs::read(&out_path).map_err(|_| GenError::StageTransient {
            stage: "synthesize",
            message: "worker produced no output file".to_string(),
        })
    }
}

fn parse_worker_status(output: &str) -> Option<Value> {
    output
        .lines()
        .rev()
        .find_map(|line| serde_json::from_str::<Value>(line.trim()).ok())
        .filter(Value::is_object)
}

/// Built-in deterministic renderer: a vertical gradient with a
/// prompt-derived brightness strip so every artifact identifies the prompt
/// that produced it. Also used as the post-retry fallback image.
pub struct BuiltinBackend {
    resolution: u32,
}

impl BuiltinBackend {
    pub fn new(resolution: u32) -> Self {
        Self { resolution }
    }
}

impl SynthesisBackend for BuiltinBackend {
    fn render(
        &self,
        prompt: &str,
        seed: u32,
        _steps: u32,
        _cancel: &CancelToken,
    ) -> GenResult<Vec<u8>> {
        diagnostic_image(prompt, seed, self.resolution)
    }
}

/// Deterministic diagnostic PNG for a prompt.
pub fn diagnostic_image(prompt: &str, seed: u32, resolution: u32) -> GenResult<Vec<u8>> {
    let size = resolution.max(16);
    let mut img = RgbaImage::new(size, size);
    let span = (size - 1).max(1) as f32;
    let shift = (seed % 32) as f32;
    for y in 0..size {
        let t = y as f32 / span;
        let r = (40.0 + t * 80.0 + shift) as u8;
        let g = (80.0 + t * 140.0) as u8;
        let b = (60.0 + t * 50.0) as u8;
        for x in 0..size {
            img.put_pixel(x, y, Rgba([r, g, b, 255]));
        }
    }
    // Prompt strip: one 2px column per character, brightness = byte value.
    for (i, byte) in prompt.bytes().take((size / 2) as usize).enumerate() {
        for dx in 0..2 {
            let x = (i as u32) * 2 + dx;
            for y in 8..16.min(size) {
                img.put_pixel(x, y, Rgba([byte, byte, byte, 255]));
            }
        }
    }
    let mut buf = Cursor::new(Vec::new());
    img.write_to(&mut buf, ImageFormat::Png)?;
    Ok(buf.into_inner())
}

/// The synthesize stage adapter: retries with seed/prompt variation and a
/// sanity validator, then the deterministic fallback.
pub struct ImageSynthesizer {
    backend: Box<dyn SynthesisBackend>,
    retries: u32,
    steps: u32,
    resolution: u32,
    /// Disabled in tests to keep retry paths fast.
    retry_backoff: bool,
}

impl ImageSynthesizer {
    pub fn from_config(cfg: &SynthesizeConfig, log_dir: PathBuf) -> Self {
        let backend: Box<dyn SynthesisBackend> =
            match (&cfg.worker_python, &cfg.worker_script) {
                (Some(python), Some(script)) => Box::new(WorkerBackend::new(
                    python.clone(),
                    script.clone(),
                    cfg.model_id.clone(),
                    Duration::from_secs(cfg.timeout_secs),
                    log_dir,
                )),
                _ => {
                    debug!("no synthesize worker configured, using builtin renderer");
                    Box::new(BuiltinBackend::new(cfg.resolution))
                }
            };
        Self {
            backend,
            retries: cfg.retries,
            steps: cfg.steps_light,
            resolution: cfg.resolution,
            retry_backoff: true,
        }
    }

    pub fn with_backend(
        backend: Box<dyn SynthesisBackend>,
        retries: u32,
        steps: u32,
        resolution: u32,
    ) -> Self {
        Self {
            backend,
            retries,
            steps,
            resolution,
            retry_backoff: false,
        }
    }
}

impl Synthesize for ImageSynthesizer {
    fn generate(&self, prompt: &str, cancel: &CancelToken) -> GenResult<Vec<u8>> {
        let attempts = self.retries.max(1);
        for attempt in 1..=attempts {
            cancel.check()?;
            if attempt > 1 && self.retry_backoff {
                std::thread::sleep(backoff_delay(attempt - 1));
            }

            let seed = attempt.wrapping_mul(1009) % (1 << 31);
            let variant = if attempt == 1 {
                prompt.to_string()
            } else {
                format!("{prompt}, detailed, vivid, pass {attempt}")
            };

            match self.backend.render(&variant, seed, self.steps, cancel) {
                Ok(png) => match sanity_check_png(&png) {
                    Ok(()) => return Ok(png),
                    Err(e) => {
                        warn!(attempt, error = %e, "synthesized image failed sanity check");
                    }
                },
                Err(GenError::Cancelled) => return Err(GenError::Cancelled),
                Err(e) => {
                    warn!(attempt, error = %e, "synthesize attempt failed");
                }
            }
        }

        warn!("synthesize retries exhausted, producing diagnostic fallback");
        diagnostic_image(prompt, 0, self.resolution)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{diverse_png, solid_png};
    use crate::understand::{Orientation, SizeClass};
    use parking_lot::Mutex;

    fn attrs() -> Attributes {
        Attributes {
            category: "car".to_string(),
            colors: vec!["red".to_string(), "white".to_string()],
            size: SizeClass::Small,
            orientation: Orientation::Side,
            details: vec!["two doors".to_string()],
            fallback: false,
        }
    }

    #[test]
    fn test_compose_prompt_template() {
        assert_eq!(
            compose_prompt(&attrs()),
            "voxel-style car, small size, primary colors: red, white, \
             features: two doors, low-poly, game-friendly, 3D render, \
             side view, clean background, high quality, detailed"
        );
    }

    #[test]
    fn test_substantive_raw_text_gate() {
        assert!(!substantive_raw_text("short text"));
        assert!(!substantive_raw_text(
            "{\"category\": \"car\", \"colors\": [\"red\", \"blue\"]}"
        ));
        assert!(!substantive_raw_text(
            "maybe a blue abstract car of some kind, not sure at all"
        ));
        assert!(substantive_raw_text(
            "a small red vehicle with rounded edges parked on a plain field"
        ));
    }

    #[test]
    fn test_derive_prompt_uses_substantive_raw_text_verbatim() {
        let raw = "a weathered wooden cabin with a sloped snow covered roof, \
                   stone chimney, warm light in the windows, pine trees behind it";
        assert_eq!(raw.len() >= 40, true);
        let attrs = Attributes::from_raw_text(raw.to_string());
        assert_eq!(derive_prompt(&attrs), raw);
    }

    #[test]
    fn test_derive_prompt_falls_back_to_composed() {
        // The fallback marker "placeholder" is too short to pass the gate.
        let prompt = derive_prompt(&Attributes::fallback());
        assert!(prompt.starts_with("voxel-style object"));
    }

    #[test]
    fn test_sanity_rejects_solid_color() {
        let png = solid_png(32, 32, [120, 60, 200, 255]);
        assert!(matches!(
            sanity_check_png(&png),
            Err(GenError::Sanity(_))
        ));
    }

    #[test]
    fn test_sanity_accepts_diverse_image() {
        assert!(sanity_check_png(&diverse_png(32, 32)).is_ok());
    }

    #[test]
    fn test_diagnostic_image_is_deterministic_and_diverse() {
        let a = diagnostic_image("voxel-style car", 7, 64).unwrap();
        let b = diagnostic_image("voxel-style car", 7, 64).unwrap();
        let c = diagnostic_image("voxel-style car", 8, 64).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(sanity_check_png(&a).is_ok());
    }

    /// Scripted backend: pops one canned response per attempt and records
    /// the prompts it was given.
    struct ScriptedBackend {
        responses: Mutex<Vec<GenResult<Vec<u8>>>>,
        prompts: std::sync::Arc<Mutex<Vec<String>>>,
    }

    impl ScriptedBackend {
        fn new(responses: Vec<GenResult<Vec<u8>>>) -> Self {
            Self {
                responses: Mutex::new(responses),
                prompts: std::sync::Arc::new(Mutex::new(Vec::new())),
            }
        }
    }

    impl SynthesisBackend for ScriptedBackend {
        fn render(
            &self,
            prompt: &str,
            _seed: u32,
            _steps: u32,
            _cancel: &CancelToken,
        ) -> GenResult<Vec<u8>> {
            self.prompts.lock().push(prompt.to_string());
            let mut responses = self.responses.lock();
            if responses.is_empty() {
                Ok(diverse_png(16, 16))
            } else {
                responses.remove(0)
            }
        }
    }

    #[test]
    fn test_generate_recovers_after_sanity_failures() {
        let good = diverse_png(16, 16);
        let backend = Box::new(ScriptedBackend::new(vec![
            Ok(solid_png(16, 16, [10, 10, 10, 255])),
            Ok(solid_png(16, 16, [10, 10, 10, 255])),
            Ok(good.clone()),
        ]));
        let synth = ImageSynthesizer::with_backend(backend, 3, 20, 64);

        let out = synth.generate("voxel-style car", &CancelToken::new()).unwrap();
        assert_eq!(out, good);
    }

    #[test]
    fn test_generate_varies_prompt_on_retries() {
        let backend = ScriptedBackend::new(vec![
            Ok(solid_png(16, 16, [0, 0, 0, 255])),
            Ok(solid_png(16, 16, [0, 0, 0, 255])),
            Ok(diverse_png(16, 16)),
        ]);
        let prompts = std::sync::Arc::clone(&backend.prompts);
        let synth = ImageSynthesizer::with_backend(Box::new(backend), 3, 20, 64);

        synth.generate("base prompt", &CancelToken::new()).unwrap();
        let prompts = prompts.lock();
        assert_eq!(prompts[0], "base prompt");
        assert_eq!(prompts[1], "base prompt, detailed, vivid, pass 2");
        assert_eq!(prompts[2], "base prompt, detailed, vivid, pass 3");
    }

    #[test]
    fn test_generate_exhausted_returns_diagnostic_fallback() {
        let backend = Box::new(ScriptedBackend::new(vec![
            Ok(solid_png(16, 16, [0, 0, 0, 255])),
            Ok(solid_png(16, 16, [0, 0, 0, 255])),
            Ok(solid_png(16, 16, [0, 0, 0, 255])),
        ]));
        let synth = ImageSynthesizer::with_backend(backend, 3, 20, 64);

        let out = synth.generate("a prompt", &CancelToken::new()).unwrap();
        assert!(sanity_check_png(&out).is_ok());
        assert_eq!(out, diagnostic_image("a prompt", 0, 64).unwrap());
    }

    #[test]
    fn test_generate_cancelled() {
        let backend = Box::new(ScriptedBackend::new(vec![]));
        let synth = ImageSynthesizer::with_backend(backend, 3, 20, 64);
        let token = CancelToken::new();
        token.cancel();
        assert!(matches!(
            synth.generate("p", &token),
            Err(GenError::Cancelled)
        ));
    }

    #[test]
    fn test_parse_worker_status() {
        let out = "loading model\n{\"status\":\"ok\",\"out\":\"/tmp/x.png\"}\n";
        let status = parse_worker_status(out).unwrap();
        assert_eq!(status["status"], "ok");
        assert!(parse_worker_status("no json here").is_none());
    }
}
