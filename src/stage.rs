//! Shared plumbing for the three pipeline stage adapters.
//!
//! Every adapter follows the same contract: bounded retries with
//! exponential backoff, a per-call deadline, a sanity validator, and a
//! deterministic fallback once retries are exhausted. Cancellation is
//! cooperative and aborts without retrying.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde::Serialize;
use serde_json::Value;

use crate::error::{GenError, GenResult};
use crate::reconstruct::MeshArtifact;
use crate::understand::Attributes;

/// Cooperative cancellation flag shared between the scheduler and the
/// stage adapters. Checked between tiles and between retries.
#[derive(Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Error out with `Cancelled` if the flag is set.
    pub fn check(&self) -> GenResult<()> {
        if self.is_cancelled() {
            Err(GenError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Uniform between-retry delay: `min(2^attempt, 8)` seconds.
pub fn backoff_delay(attempt: u32) -> Duration {
    Duration::from_secs(2u64.saturating_pow(attempt).min(8))
}

static STAMP_SEQ: AtomicU64 = AtomicU64::new(0);

/// Sortable, process-unique stamp for log and snapshot names.
pub fn stamp() -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    let seq = STAMP_SEQ.fetch_add(1, Ordering::Relaxed);
    format!("{millis}_{seq:04}")
}

/// Seconds since the UNIX epoch.
pub fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Milliseconds since the UNIX epoch.
pub fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Per-invocation audit record written for every stage call.
///
/// These records are append-only and double as the corpus for the search
/// service, which reads the `prompt` field of each JSON file.
#[derive(Debug, Clone, Serialize, Default)]
pub struct StageLog {
    pub stage: &'static str,
    pub ts: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_digest: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_response: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parsed: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
}

impl StageLog {
    pub fn new(stage: &'static str) -> Self {
        Self {
            stage,
            ts: epoch_secs(),
            ..Self::default()
        }
    }

    /// Write the record as `<stamp>_<name>.json` under `dir`.
    ///
    /// Log failures are swallowed: audit records must never take down a
    /// stage call.
    pub fn write(&self, dir: &Path, name: &str) -> Option<PathBuf> {
        let write = || -> GenResult<PathBuf> {
            std::fs::create_dir_all(dir)?;
            let path = dir.join(format!("{}_{}.json", stamp(), name));
            std::fs::write(&path, serde_json::to_vec_pretty(self)?)?;
            Ok(path)
        };
        match write() {
            Ok(path) => Some(path),
            Err(e) => {
                tracing::warn!(name, error = %e, "failed to write stage log");
                None
            }
        }
    }
}

/// Outcome of a subprocess run under a deadline.
#[derive(Debug)]
pub struct ProcessOutcome {
    /// Exit code; `None` when the process was killed on deadline.
    pub code: Option<i32>,
    /// Combined stdout + stderr.
    pub output: String,
    pub timed_out: bool,
}

impl ProcessOutcome {
    pub fn success(&self) -> bool {
        self.code == Some(0) && !self.timed_out
    }
}

/// Run a command to completion under a deadline, capturing its output.
///
/// The child is polled so the deadline and the cancel token are honored
/// even when the process never exits on its own; on expiry the child is
/// killed and the partial output returned with `timed_out` set.
pub fn run_with_deadline(
    cmd: &mut Command,
    timeout: Duration,
    cancel: &CancelToken,
) -> GenResult<ProcessOutcome> {
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
    let mut child = cmd.spawn()?;

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let out_reader = std::thread::spawn(move || read_all(stdout));
    let err_reader = std::thread::spawn(move || read_all(stderr));

    let deadline = Instant::now() + timeout;
    let code = loop {
        if let Some(status) = child.try_wait()? {
            break Some(status);
        }
        if cancel.is_cancelled() {
            let _ = child.kill();
            let _ = child.wait();
            return Err(GenError::Cancelled);
        }
        if Instant::now() >= deadline {
            let _ = child.kill();
            let _ = child.wait();
            break None;
        }
        std::thread::sleep(Duration::from_millis(50));
    };

    let mut output = out_reader.join().unwrap_or_default();
    let err_out = err_reader.join().unwrap_or_default();
    if !err_out.is_empty() {
        if !output.is_empty() {
            output.push('\n');
        }
        output.push_str(&err_out);
    }

    Ok(ProcessOutcome {
        code: code.and_then(|s| s.code()),
        output,
        timed_out: code.is_none(),
    })
}

fn read_all(pipe: Option<impl Read>) -> String {
    let mut buf = String::new();
    if let Some(mut pipe) = pipe {
        let _ = pipe.read_to_string(&mut buf);
    }
    buf
}

/// Image understanding: tile raster -> structured attributes.
pub trait Understand: Send + Sync {
    fn extract(&self, image_png: &[u8], cancel: &CancelToken) -> GenResult<Attributes>;
}

/// Image synthesis: prompt -> PNG bytes.
pub trait Synthesize: Send + Sync {
    fn generate(&self, prompt: &str, cancel: &CancelToken) -> GenResult<Vec<u8>>;
}

/// Mesh reconstruction: PNG bytes -> installed mesh asset at `out_path`.
pub trait Reconstruct: Send + Sync {
    fn reconstruct(
        &self,
        image_png: &[u8],
        out_path: &Path,
        cancel: &CancelToken,
    ) -> GenResult<MeshArtifact>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_caps_at_eight_seconds() {
        assert_eq!(backoff_delay(0), Duration::from_secs(1));
        assert_eq!(backoff_delay(1), Duration::from_secs(2));
        assert_eq!(backoff_delay(2), Duration::from_secs(4));
        assert_eq!(backoff_delay(3), Duration::from_secs(8));
        assert_eq!(backoff_delay(10), Duration::from_secs(8));
    }

    #[test]
    fn test_cancel_token() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        assert!(token.check().is_ok());

        let clone = token.clone();
        clone.cancel();
        assert!(token.is_cancelled());
        assert!(matches!(token.check(), Err(GenError::Cancelled)));
    }

    #[test]
    fn test_stamps_are_unique() {
        let a = stamp();
        let b = stamp();
        assert_ne!(a, b);
    }

    #[test]
    fn test_stage_log_written_as_json() {
        let temp = tempfile::TempDir::new().unwrap();
        let mut log = StageLog::new("understand");
        log.prompt = Some("voxel-style car".to_string());
        let path = log.write(temp.path(), "response").unwrap();

        let data: Value =
            serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(data["stage"], "understand");
        assert_eq!(data["prompt"], "voxel-style car");
    }

    #[cfg(unix)]
    #[test]
    fn test_run_with_deadline_captures_output() {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("echo hello; echo oops >&2");
        let outcome =
            run_with_deadline(&mut cmd, Duration::from_secs(5), &CancelToken::new()).unwrap();
        assert!(outcome.success());
        assert!(outcome.output.contains("hello"));
        assert!(outcome.output.contains("oops"));
    }

    #[cfg(unix)]
    #[test]
    fn test_run_with_deadline_kills_on_timeout() {
        let mut cmd = Command::new("sleep");
        cmd.arg("30");
        let start = Instant::now();
        let outcome =
            run_with_deadline(&mut cmd, Duration::from_millis(200), &CancelToken::new()).unwrap();
        assert!(outcome.timed_out);
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[cfg(unix)]
    #[test]
    fn test_run_with_deadline_honors_cancel() {
        let token = CancelToken::new();
        token.cancel();
        let mut cmd = Command::new("sleep");
        cmd.arg("30");
        let result = run_with_deadline(&mut cmd, Duration::from_secs(30), &token);
        assert!(matches!(result, Err(GenError::Cancelled)));
    }
}
