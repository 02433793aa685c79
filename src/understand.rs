//! Image understanding stage: tile raster -> structured attributes.
//!
//! Wraps an external vision-language endpoint behind three transport
//! modes. Responses are parsed tolerantly: a direct JSON object, an
//! OpenAI-style chat completion, JSON inside a fenced code block, or free
//! text. Free text is never silently coerced into structured fields; it is
//! preserved verbatim in `details[0]` so the synthesis stage can decide
//! whether to use it.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::config::{TransportMode, UnderstandConfig};
use crate::error::{GenError, GenResult};
use crate::stage::{backoff_delay, CancelToken, StageLog, Understand};

/// Size class reported by the understanding stage; drives object scale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SizeClass {
    Small,
    Medium,
    Large,
}

impl SizeClass {
    /// Lenient parse; anything unrecognized is `Medium`.
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "small" => SizeClass::Small,
            "large" => SizeClass::Large,
            _ => SizeClass::Medium,
        }
    }

    /// World scale for placed objects.
    pub fn scale(self) -> f64 {
        match self {
            SizeClass::Small => 0.5,
            SizeClass::Medium => 1.0,
            SizeClass::Large => 1.5,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SizeClass::Small => "small",
            SizeClass::Medium => "medium",
            SizeClass::Large => "large",
        }
    }
}

impl Default for SizeClass {
    fn default() -> Self {
        SizeClass::Medium
    }
}

/// Viewing orientation reported by the understanding stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Orientation {
    Front,
    Side,
    Back,
    Diagonal,
    Top,
    Angled,
}

impl Orientation {
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "side" => Orientation::Side,
            "back" => Orientation::Back,
            "diagonal" => Orientation::Diagonal,
            "top" => Orientation::Top,
            "angled" => Orientation::Angled,
            _ => Orientation::Front,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Orientation::Front => "front",
            Orientation::Side => "side",
            Orientation::Back => "back",
            Orientation::Diagonal => "diagonal",
            Orientation::Top => "top",
            Orientation::Angled => "angled",
        }
    }
}

impl Default for Orientation {
    fn default() -> Self {
        Orientation::Front
    }
}

/// Structured attributes extracted from a tile image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attributes {
    pub category: String,
    pub colors: Vec<String>,
    #[serde(default)]
    pub size: SizeClass,
    #[serde(default)]
    pub orientation: Orientation,
    #[serde(default)]
    pub details: Vec<String>,
    /// Set when these are the deterministic post-retry fallback.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub fallback: bool,
}

impl Attributes {
    /// Deterministic fallback attributes used once retries are exhausted.
    pub fn fallback() -> Self {
        Self {
            category: "object".to_string(),
            colors: vec!["gray".to_string()],
            size: SizeClass::Medium,
            orientation: Orientation::Front,
            details: vec!["placeholder".to_string()],
            fallback: true,
        }
    }

    /// Attributes carrying an unparseable free-text response in
    /// `details[0]` so downstream stages can still use it.
    pub fn from_raw_text(text: String) -> Self {
        Self {
            category: "object".to_string(),
            colors: vec!["gray".to_string()],
            size: SizeClass::Medium,
            orientation: Orientation::Front,
            details: vec![text],
            fallback: false,
        }
    }

    /// The raw-text payload, when one was preserved.
    pub fn raw_text(&self) -> Option<&str> {
        self.details.first().map(String::as_str)
    }
}

/// Result of tolerant response extraction.
#[derive(Debug, PartialEq)]
enum Extracted {
    Structured(Attributes),
    Raw(String),
}

/// Client for the external understanding endpoint.
pub struct UnderstandClient {
    cfg: UnderstandConfig,
    http: reqwest::blocking::Client,
    log_dir: PathBuf,
}

impl UnderstandClient {
    pub fn new(cfg: UnderstandConfig, log_dir: PathBuf) -> GenResult<Self> {
        let http = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_secs))
            .build()?;
        Ok(Self { cfg, http, log_dir })
    }

    fn call(&self, url: &str, image_png: &[u8]) -> GenResult<Value> {
        let mut request = match self.cfg.mode {
            TransportMode::ImageB64 => {
                let b64 = base64::engine::general_purpose::STANDARD.encode(image_png);
                let data_url = format!("data:image/png;base64,{b64}");
                let payload = json!({
                    "image_b64": b64,
                    "messages": [
                        {
                            "role": "system",
                            "content": "Return a single JSON object and nothing else \
                                        following schema: {\"category\",\"colors\",\
                                        \"size\",\"orientation\",\"details\"}."
                        },
                        {
                            "role": "user",
                            "content": format!(
                                "Analyze the image and return JSON only. Image: {data_url}"
                            )
                        }
                    ]
                });
                self.log_request("request_image_b64", &payload);
                self.http.post(url).json(&payload)
            }
            TransportMode::OpenaiChat => {
                let b64 = base64::engine::general_purpose::STANDARD.encode(image_png);
                let data_url = format!("data:image/png;base64,{b64}");
                let payload = json!({
                    "messages": [
                        {
                            "role": "system",
                            "content": "You are an assistant that analyzes an input image \
                                        and returns a single JSON object and nothing else. \
                                        The JSON must match the schema: \
                                        {\"category\":string, \"colors\":[string], \
                                        \"size\":\"small|medium|large\", \
                                        \"orientation\":\"front|side|back|diagonal|top|angled\", \
                                        \"details\":[string]}."
                        },
                        {
                            "role": "user",
                            "content": format!(
                                "Analyze this image and return JSON only. Image data: {data_url}"
                            )
                        }
                    ]
                });
                self.log_request("request_openai_chat", &payload);
                self.http.post(url).json(&payload)
            }
            TransportMode::Multipart => {
                let part = reqwest::blocking::multipart::Part::bytes(image_png.to_vec())
                    .file_name("tile.png")
                    .mime_str("image/png")?;
                let form = reqwest::blocking::multipart::Form::new().part("file", part);
                self.log_request("request_multipart", &json!({"file": "tile.png"}));
                self.http.post(url).multipart(form)
            }
        };

        request = request.header("Accept", "application/json");
        if let Some(token) = &self.cfg.token {
            request = request.header("Authorization", format!("Bearer {token}"));
        }

        let response = request.send()?;
        let status = response.status();
        if !status.is_success() {
            return Err(GenError::StageTransient {
                stage: "understand",
                message: format!("endpoint returned {status}"),
            });
        }
        let text = response.text()?;
        Ok(serde_json::from_str(&text).unwrap_or(Value::String(text)))
    }

    fn log_request(&self, name: &str, payload: &Value) {
        let preview: String = payload.to_string().chars().take(1000).collect();
        let mut log = StageLog::new("understand");
        log.raw_response = Some(Value::String(preview));
        log.write(&self.log_dir, name);
    }
}

impl Understand for UnderstandClient {
    fn extract(&self, image_png: &[u8], cancel: &CancelToken) -> GenResult<Attributes> {
        let Some(url) = self.cfg.url.clone() else {
            debug!("no understand endpoint configured, using fallback attributes");
            let mut log = StageLog::new("understand");
            log.error = Some("no endpoint configured".to_string());
            log.write(&self.log_dir, "fallback");
            return Ok(Attributes::fallback());
        };

        let attempts = self.cfg.retries.max(1);
        for attempt in 0..attempts {
            cancel.check()?;
            if attempt > 0 {
                std::thread::sleep(backoff_delay(attempt));
            }

            let started = Instant::now();
            match self.call(&url, image_png) {
                Ok(body) => {
                    let mut log = StageLog::new("understand");
                    log.raw_response = Some(body.clone());
                    log.duration_ms = started.elapsed().as_millis() as u64;

                    match extract_from_response(&body) {
                        Extracted::Structured(attrs) => {
                            log.parsed = serde_json::to_value(&attrs).ok();
                            log.write(&self.log_dir, "response");
                            return Ok(attrs);
                        }
                        Extracted::Raw(text) => {
                            log.write(&self.log_dir, "response");
                            return Ok(Attributes::from_raw_text(text));
                        }
                    }
                }
                Err(GenError::Cancelled) => return Err(GenError::Cancelled),
                Err(e) => {
                    warn!(attempt, error = %e, "understand call failed");
                    let mut log = StageLog::new("understand");
                    log.error = Some(e.to_string());
                    log.duration_ms = started.elapsed().as_millis() as u64;
                    log.write(&self.log_dir, "error");
                }
            }
        }

        let mut log = StageLog::new("understand");
        log.error = Some(format!("retries exhausted after {attempts} attempts"));
        log.write(&self.log_dir, "fallback");
        Ok(Attributes::fallback())
    }
}

/// Tolerant extraction over the response shapes seen in the wild.
fn extract_from_response(body: &Value) -> Extracted {
    if let Some(obj) = body.as_object() {
        // Direct JSON object with the expected fields.
        if obj.contains_key("category") && obj.contains_key("colors") {
            return Extracted::Structured(attributes_from_map(body));
        }

        // OpenAI-style: choices[0].message.content (or .text).
        let content = obj
            .get("choices")
            .and_then(Value::as_array)
            .and_then(|c| c.first())
            .and_then(|choice| {
                choice
                    .get("message")
                    .and_then(|m| m.get("content").and_then(Value::as_str).or(m.as_str()))
                    .or_else(|| choice.get("text").and_then(Value::as_str))
            });

        if let Some(content) = content {
            if let Some(attrs) = attributes_from_text(content) {
                return Extracted::Structured(attrs);
            }
            return Extracted::Raw(content.to_string());
        }

        // Flatten likely text fields before giving up.
        for key in ["text", "content"] {
            if let Some(text) = obj.get(key).and_then(Value::as_str) {
                if let Some(attrs) = attributes_from_text(text) {
                    return Extracted::Structured(attrs);
                }
                return Extracted::Raw(text.to_string());
            }
        }
        return Extracted::Raw(body.to_string());
    }

    if let Some(text) = body.as_str() {
        if let Some(attrs) = attributes_from_text(text) {
            return Extracted::Structured(attrs);
        }
        return Extracted::Raw(text.to_string());
    }

    Extracted::Raw(body.to_string())
}

/// Try to recover a JSON attribute object from textual content, tolerating
/// fenced code blocks and surrounding prose.
fn attributes_from_text(text: &str) -> Option<Attributes> {
    let direct: Option<Value> = serde_json::from_str(text.trim()).ok();
    let value = direct.or_else(|| {
        let stripped = strip_code_fences(text);
        let sub = extract_json_object(&stripped)?;
        serde_json::from_str(sub).ok()
    })?;
    if value.get("category").is_some() {
        Some(attributes_from_map(&value))
    } else {
        None
    }
}

fn attributes_from_map(value: &Value) -> Attributes {
    let string_list = |key: &str| -> Vec<String> {
        value
            .get(key)
            .and_then(Value::as_array)
            .map(|arr| {
                arr.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    };

    let colors = {
        let c = string_list("colors");
        if c.is_empty() {
            vec!["gray".to_string()]
        } else {
            c
        }
    };

    Attributes {
        category: value
            .get("category")
            .and_then(Value::as_str)
            .unwrap_or("object")
            .to_string(),
        colors,
        size: value
            .get("size")
            .and_then(Value::as_str)
            .map(SizeClass::parse)
            .unwrap_or_default(),
        orientation: value
            .get("orientation")
            .and_then(Value::as_str)
            .map(Orientation::parse)
            .unwrap_or_default(),
        details: string_list("details"),
        fallback: false,
    }
}

/// Strip a leading/trailing markdown code fence (```json ... ```).
pub(crate) fn strip_code_fences(s: &str) -> String {
    let trimmed = s.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed.to_string();
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    let rest = rest.trim_start_matches(['\r', '\n']);
    rest.strip_suffix("```").unwrap_or(rest).trim().to_string()
}

/// Balanced `{...}` substring starting at the first opening brace.
pub(crate) fn extract_json_object(s: &str) -> Option<&str> {
    extract_balanced(s, '{', '}')
}

/// Balanced `[...]` substring starting at the first opening bracket.
pub(crate) fn extract_json_array(s: &str) -> Option<&str> {
    extract_balanced(s, '[', ']')
}

fn extract_balanced(s: &str, open: char, close: char) -> Option<&str> {
    let start = s.find(open)?;
    let mut depth = 0usize;
    for (i, ch) in s[start..].char_indices() {
        if ch == open {
            depth += 1;
        } else if ch == close {
            depth -= 1;
            if depth == 0 {
                return Some(&s[start..start + i + ch.len_utf8()]);
            }
        }
    }
    None
}
