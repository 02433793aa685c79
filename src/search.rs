//! Search over understanding logs: "find an object like X".
//!
//! Candidates come from the per-tile understanding records; scoring is a
//! deterministic keyword baseline with an optional LM rerank on top. The
//! JP/EN dictionaries and the comment suffix variants are contract data:
//! they make the attached Japanese comments deterministic and unique
//! within a result set.

use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::config::SearchConfig;
use crate::error::GenResult;
use crate::understand::{extract_json_array, strip_code_fences};

/// JP query token -> EN candidate tokens.
const JP_TO_EN: [(&str, &[&str]); 7] = [
    ("車", &["car", "vehicle", "automobile"]),
    ("家", &["house", "home", "building"]),
    ("木", &["tree"]),
    ("木々", &["trees"]),
    ("人", &["person", "people"]),
    ("川", &["river"]),
    ("海", &["sea", "ocean"]),
];

/// EN noun -> JP rendering for comment synthesis.
const EN_TO_JP: [(&str, &str); 16] = [
    ("car", "車"),
    ("vehicle", "車"),
    ("automobile", "車"),
    ("house", "家"),
    ("home", "家"),
    ("building", "建物"),
    ("tree", "木"),
    ("trees", "木々"),
    ("person", "人"),
    ("people", "人たち"),
    ("river", "川"),
    ("sea", "海"),
    ("ocean", "海"),
    ("fruit", "果物"),
    ("apple", "りんご"),
    ("banana", "バナナ"),
];

const FALLBACK_COMMENTS: [&str; 4] = [
    "これ、なんだろうね〜でも可愛いよ〜",
    "うーん、ちょっと自信ないけど……見つけたよ〜",
    "わかったかも？これっぽいね、見てみて〜",
    "お兄ちゃん、これかな〜？かわいいね〜",
];

const SUFFIX_VARIANTS: [&str; 5] = ["ね、かわいい〜", "だよ〜", "かな〜", "すごいね〜", "だね〜"];

/// Prompt-template tokens that must never be echoed as a comment subject.
const TECH_TOKENS: [&str; 22] = [
    "voxel",
    "voxel-style",
    "style",
    "low-poly",
    "lowpoly",
    "game-friendly",
    "3d",
    "primary",
    "colors",
    "color",
    "render",
    "front",
    "view",
    "detail",
    "details",
    "large",
    "small",
    "size",
    "game",
    "friendly",
    "texture",
    "textures",
];

const SISTER_SYSTEM_PROMPT: &str =
    "あなたは優しい妹のように振る舞ってください。ユーザーの質問には短く、親しみやすく、\
     少し甘えた日本語の口調で答えてください。出力は冷静にJSONで返す部分と、\
     短いコメントを含める部分の両方を提供してください。";

/// One search hit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchResult {
    pub id: String,
    pub score: f64,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub coords: Option<Value>,
    pub comment: String,
}

#[derive(Debug, Clone)]
struct Candidate {
    id: String,
    text: String,
    coords: Option<Value>,
    ts: u64,
}

/// Keyword + optional-LM lookup over understanding logs.
pub struct SearchService {
    logs_dir: PathBuf,
    lm_url: Option<String>,
    lm_token: Option<String>,
    http: reqwest::blocking::Client,
}

impl SearchService {
    pub fn new(cfg: &SearchConfig, logs_dir: PathBuf) -> GenResult<Self> {
        let http = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_secs.unwrap_or(10)))
            .build()?;
        Ok(Self {
            logs_dir,
            lm_url: cfg.lm_url.clone(),
            lm_token: cfg.lm_token.clone(),
            http,
        })
    }

    /// Top-k lookup for a free-text query.
    pub fn search(&self, query: &str, top_k: usize, target: Option<&str>) -> Vec<SearchResult> {
        let candidates = self.build_candidates();
        if candidates.is_empty() {
            return Vec::new();
        }

        let mut baseline = score_with_keywords(query, &candidates);

        let Some(url) = self.lm_url.clone() else {
            baseline.truncate(top_k);
            return baseline;
        };

        let lm_out = match self.lm_rerank(query, &candidates, &url, target) {
            Some(out) => out,
            None => {
                baseline.truncate(top_k);
                return baseline;
            }
        };

        // Drop empty-text items; an LM that produced nothing useful loses
        // to the baseline.
        let lm_out: Vec<SearchResult> = lm_out
            .into_iter()
            .filter(|r| !r.text.trim().is_empty())
            .collect();
        if lm_out.is_empty() {
            baseline.truncate(top_k);
            return baseline;
        }

        let lm_mean = mean_score(&lm_out);
        let kb_mean = mean_score(&baseline);
        if lm_mean + 0.01 < kb_mean {
            let mut merged = merge_prefer_baseline(&baseline, &lm_out);
            merged.truncate(top_k);
            return merged;
        }

        let mut out = finalize_lm_results(lm_out);
        if out.is_empty() {
            baseline.truncate(top_k);
            return baseline;
        }
        out.truncate(top_k);
        out
    }

    /// Chat payload preview for the LM rerank (debugging surface).
    pub fn format_for_lm(&self, query: &str, target: Option<&str>) -> Value {
        let candidates = self.build_candidates();
        lm_payload(query, &candidates, target)
    }

    /// Collect candidates from the understanding logs, deduplicated by
    /// normalized text keeping the most recent record.
    fn build_candidates(&self) -> Vec<Candidate> {
        let mut raw = Vec::new();
        let Ok(entries) = std::fs::read_dir(&self.logs_dir) else {
            return raw;
        };
        let mut files: Vec<PathBuf> = entries
            .flatten()
            .map(|e| e.path())
            .filter(|p| p.extension().is_some_and(|e| e == "json"))
            .collect();
        files.sort();

        for path in files {
            let Ok(content) = std::fs::read_to_string(&path) else {
                continue;
            };
            let Ok(data) = serde_json::from_str::<Value>(&content) else {
                continue;
            };
            let ts = std::fs::metadata(&path)
                .and_then(|m| m.modified())
                .ok()
                .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                .map(|d| d.as_secs())
                .unwrap_or(0);
            let stem = path
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or_default()
                .to_string();
            raw.push(candidate_from_log(&data, stem, ts));
        }

        // Keep the most recent candidate per normalized text; empty texts
        // are keyed by id so unrelated empties do not collapse.
        raw.sort_by(|a, b| b.ts.cmp(&a.ts).then_with(|| b.id.cmp(&a.id)));
        let mut seen = std::collections::HashSet::new();
        let mut out = Vec::new();
        for c in raw {
            let key = if c.text.trim().is_empty() {
                format!("{}|__empty__", c.id)
            } else {
                normalize_text(&c.text)
            };
            if seen.insert(key) {
                out.push(c);
            }
        }
        out
    }

    fn lm_rerank(
        &self,
        query: &str,
        candidates: &[Candidate],
        url: &str,
        target: Option<&str>,
    ) -> Option<Vec<SearchResult>> {
        let payload = lm_payload(query, candidates, target);
        let mut request = self.http.post(url).json(&payload);
        if let Some(token) = &self.lm_token {
            request = request.header("Authorization", format!("Bearer {token}"));
        }

        let response = match request.send().and_then(|r| r.error_for_status()) {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "LM rerank call failed, using keyword baseline");
                return None;
            }
        };
        let body: Value = response.json().ok()?;

        let assistant = body
            .get("choices")
            .and_then(Value::as_array)
            .and_then(|c| c.first())
            .and_then(|choice| {
                choice
                    .get("message")
                    .and_then(|m| m.get("content"))
                    .and_then(Value::as_str)
                    .or_else(|| choice.get("text").and_then(Value::as_str))
            })
            .map(str::to_string)
            .or_else(|| body.get("output").and_then(Value::as_str).map(str::to_string))
            .unwrap_or_else(|| body.to_string());

        let parsed = parse_lm_items(&assistant)?;
        debug!(items = parsed.len(), "LM rerank parsed");

        let mut out = Vec::new();
        for item in parsed {
            let Some(id) = item.get("id").and_then(Value::as_str) else {
                continue;
            };
            let base = candidates.iter().find(|c| c.id == id);
            let text = item
                .get("text")
                .and_then(Value::as_str)
                .map(str::to_string)
                .or_else(|| base.map(|c| c.text.clone()))
                .unwrap_or_default();
            let comment = item
                .get("comment")
                .or_else(|| item.get("comment_jp"))
                .and_then(Value::as_str)
                .map(sanitize_comment)
                .unwrap_or_default();
            out.push(SearchResult {
                id: id.to_string(),
                score: item.get("score").and_then(Value::as_f64).unwrap_or(0.0),
                text,
                coords: base.and_then(|c| c.coords.clone()),
                comment,
            });
        }
        sort_by_score(&mut out);

        // All-zero LM output is meaningless; the caller falls back.
        if out.iter().all(|r| r.score <= 0.001) {
            return None;
        }
        Some(out)
    }
}

fn candidate_from_log(data: &Value, stem: String, ts: u64) -> Candidate {
    let id = data
        .get("id")
        .or_else(|| data.get("job_id"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or(stem);

    let text = data
        .get("result")
        .and_then(|r| {
            r.get("description")
                .or_else(|| r.get("text"))
                .and_then(Value::as_str)
                .map(str::to_string)
                .or_else(|| r.is_object().then(|| r.to_string()))
        })
        .or_else(|| {
            ["text", "description", "caption", "prompt", "message"]
                .iter()
                .find_map(|k| data.get(*k).and_then(Value::as_str))
                .map(str::to_string)
        })
        .unwrap_or_default();

    let coords = data
        .get("coords")
        .or_else(|| data.get("bbox"))
        .or_else(|| {
            data.get("meta")
                .and_then(|m| m.get("coords").or_else(|| m.get("location")))
        })
        .cloned();

    Candidate {
        id,
        text,
        coords,
        ts,
    }
}

fn normalize_text(s: &str) -> String {
    s.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

fn tokenize(s: &str) -> Vec<String> {
    s.split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() > 1)
        .map(str::to_lowercase)
        .collect()
}

fn mean_score(results: &[SearchResult]) -> f64 {
    if results.is_empty() {
        return 0.0;
    }
    results.iter().map(|r| r.score).sum::<f64>() / results.len() as f64
}

fn sort_by_score(results: &mut [SearchResult]) {
    results.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.id.cmp(&b.id))
    });
}

/// Deterministic keyword baseline scoring.
fn score_with_keywords(query: &str, candidates: &[Candidate]) -> Vec<SearchResult> {
    let trimmed = query.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }
    let q = query.to_lowercase();
    let is_non_ascii = trimmed.chars().any(|c| c as u32 > 127);

    let mut q_tokens: Vec<String> = if is_non_ascii {
        Vec::new()
    } else {
        tokenize(&q)
    };

    // Short Japanese queries map through the dictionary so they match the
    // (mostly English) candidate texts.
    if let Some((_, mapped)) = JP_TO_EN.iter().find(|(jp, _)| *jp == trimmed) {
        q_tokens = mapped.iter().map(|s| s.to_string()).collect();
    }
    if is_non_ascii && q_tokens.is_empty() {
        q_tokens = EN_TO_JP
            .iter()
            .filter(|(_, jp)| *jp == trimmed || jp.contains(trimmed))
            .map(|(en, _)| en.to_string())
            .collect();
    }
    if q_tokens.is_empty() {
        q_tokens = vec![q.clone()];
    }

    let mut out = Vec::new();
    for c in candidates {
        let t_raw = c.text.as_str();
        let t = t_raw.to_lowercase();
        let c_tokens = tokenize(&t);

        let match_count = q_tokens
            .iter()
            .filter(|tok| {
                c_tokens.iter().any(|ct| ct == *tok || ct.contains(tok.as_str()))
            })
            .count();
        let mut score = match_count as f64 / q_tokens.len().max(1) as f64;

        if t.contains(&q) {
            score += 0.25;
        }
        if q_tokens.iter().any(|tok| t.contains(tok.as_str())) {
            score = score.max(0.5);
        }
        if t_raw.trim().len() < 3 {
            score *= 0.2;
        }
        score = score.min(1.0);

        let comment = if score > 0.0 {
            comment_for_text(t_raw, &c.id)
        } else {
            String::new()
        };
        out.push(SearchResult {
            id: c.id.clone(),
            score,
            text: c.text.clone(),
            coords: c.coords.clone(),
            comment,
        });
    }

    sort_by_score(&mut out);
    ensure_unique_comments(&mut out);
    out.retain(|r| r.score > 0.02);
    out
}

/// Baseline won: keep its ordering and comments, retain positive LM
/// scores for matching ids.
fn merge_prefer_baseline(
    baseline: &[SearchResult],
    lm_out: &[SearchResult],
) -> Vec<SearchResult> {
    baseline
        .iter()
        .map(|kb| {
            let mut item = kb.clone();
            if let Some(lm) = lm_out.iter().find(|x| x.id == kb.id) {
                if lm.score > 0.0 {
                    item.score = lm.score;
                }
                if item.comment.is_empty() {
                    item.comment = lm.comment.clone();
                }
            }
            item
        })
        .collect()
}

/// LM won: dedup by text, clear zero-score comments, repair comments into
/// deterministic unique Japanese ones.
fn finalize_lm_results(lm_out: Vec<SearchResult>) -> Vec<SearchResult> {
    let mut seen = std::collections::HashSet::new();
    let mut out: Vec<SearchResult> = Vec::new();
    for item in lm_out {
        let key = normalize_text(&item.text);
        if key.is_empty() || !seen.insert(key) {
            continue;
        }
        out.push(item);
    }

    for item in &mut out {
        if item.score <= 0.0 {
            item.comment.clear();
        } else if item.comment.is_empty() || is_mostly_english(&item.comment) {
            item.comment = comment_for_text(&item.text.clone(), &item.id.clone());
        }
    }
    ensure_unique_comments(&mut out);

    let filtered: Vec<SearchResult> =
        out.iter().filter(|r| r.score > 0.02).cloned().collect();
    if filtered.is_empty() {
        out
    } else {
        filtered
    }
}

fn is_mostly_english(s: &str) -> bool {
    if s.is_empty() {
        return false;
    }
    let letters = s.chars().filter(|c| c.is_ascii_alphabetic()).count();
    letters > 3.max(s.chars().count() / 3)
}

fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let head: String = s.chars().take(max.saturating_sub(3)).collect();
    format!("{head}...")
}

fn sanitize_comment(s: &str) -> String {
    let collapsed = s.split_whitespace().collect::<Vec<_>>().join(" ");
    truncate_chars(&collapsed, 60)
}

/// Deterministic comment for a candidate text. The subject is the first
/// safe non-technical token, mapped to Japanese when the dictionary knows
/// it; empty texts select a canned comment by id hash.
fn comment_for_text(text: &str, id: &str) -> String {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        let digest = Sha256::digest(id.as_bytes());
        let pick = digest[0] as usize % FALLBACK_COMMENTS.len();
        return FALLBACK_COMMENTS[pick].to_string();
    }

    let subject = tokenize(trimmed)
        .into_iter()
        .find(|tok| {
            tok.chars().all(|c| c.is_ascii_lowercase() || c == '-')
                && !TECH_TOKENS.iter().any(|tt| tok.contains(tt))
        })
        .map(|tok| {
            EN_TO_JP
                .iter()
                .find(|(en, _)| *en == tok)
                .map(|(_, jp)| jp.to_string())
                .unwrap_or(tok)
        })
        .unwrap_or_else(|| "これ".to_string());

    truncate_chars(&format!("これ、{subject}っぽいね、かわいい〜"), 40)
}

fn variant_comment(base: &str, idx: usize) -> String {
    let suffix = SUFFIX_VARIANTS[idx % SUFFIX_VARIANTS.len()];
    truncate_chars(&format!("これ、{base}{suffix}"), 40)
}

/// Comments must be unique within a result set; duplicates get an
/// index-based suffix variant. Zero-score items stay comment-free.
fn ensure_unique_comments(results: &mut [SearchResult]) {
    let mut used = std::collections::HashSet::new();
    for idx in 0..results.len() {
        if results[idx].score <= 0.0 {
            results[idx].comment.clear();
            continue;
        }
        if results[idx].comment.is_empty() {
            results[idx].comment =
                comment_for_text(&results[idx].text.clone(), &results[idx].id.clone());
        }
        if used.contains(&results[idx].comment) {
            let base = results[idx]
                .text
                .split_whitespace()
                .next()
                .unwrap_or("これ")
                .to_string();
            results[idx].comment = variant_comment(&base, idx);
        }
        used.insert(results[idx].comment.clone());
    }
}

/// Tolerant parse of the LM's JSON-array answer.
fn parse_lm_items(assistant: &str) -> Option<Vec<Value>> {
    let direct: Option<Value> = serde_json::from_str(assistant.trim()).ok();
    let value = direct.or_else(|| {
        let stripped = strip_code_fences(assistant);
        let sub = extract_json_array(&stripped)?;
        serde_json::from_str(sub).ok()
    })?;
    value.as_array().map(|arr| {
        arr.iter()
            .filter(|v| v.is_object())
            .cloned()
            .collect()
    })
}

fn lm_payload(query: &str, candidates: &[Candidate], target: Option<&str>) -> Value {
    let target_hint = match target {
        Some("paint") => "注: paint UI 用。comment は非常に短く（最大20文字）簡潔にお願いします。",
        Some("world") | Some("world_new") => {
            "注: world UI 用。comment は短め（10〜40文字）、場所の参照を含めても良いです。"
        }
        _ => "",
    };

    let candidate_lines: Vec<String> = candidates
        .iter()
        .map(|c| format!("[{}] {}", c.id, truncate_chars(&c.text, 400)))
        .collect();

    let user_msg = format!(
        "次の候補テキスト（英語で書かれていることがあります）を参照して、\
         質問 '{query}' に類似している順に並べ、各候補に0.0から1.0の範囲で\
         スコアを付けてください。出力はJSON配列のみで返してください。\
         各要素は {{id, score, text, comment}} を含めてください。\
         comment は短い日本語で書いてください。\n{target_hint}\n\
         JSON 以外の余計な文章は出力しないでください。\n\nCandidates:\n{}",
        candidate_lines.join("\n")
    );

    json!({
        "model": "gpt-4o-mini",
        "messages": [
            {"role": "system", "content": SISTER_SYSTEM_PROMPT},
            {"role": "user", "content": user_msg}
        ],
        "max_tokens": 512
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn candidate(id: &str, text: &str) -> Candidate {
        Candidate {
            id: id.to_string(),
            text: text.to_string(),
            coords: None,
            ts: 0,
        }
    }

    fn service(temp: &TempDir) -> SearchService {
        SearchService::new(&SearchConfig::default(), temp.path().to_path_buf()).unwrap()
    }

    #[test]
    fn test_keyword_scoring_matches_tokens() {
        let candidates = vec![
            candidate("a", "voxel-style car, small size, primary colors: red"),
            candidate("b", "voxel-style house, medium size"),
        ];
        let results = score_with_keywords("car", &candidates);
        assert_eq!(results[0].id, "a");
        assert!(results[0].score >= 0.5);
        assert!(results.iter().all(|r| r.score > 0.02));
    }

    #[test]
    fn test_japanese_query_maps_to_english_tokens() {
        let candidates = vec![
            candidate("a", "a red car on a road"),
            candidate("b", "a green tree in a field"),
        ];
        let results = score_with_keywords("車", &candidates);
        assert_eq!(results[0].id, "a");
        assert!(results[0].score > 0.0);
    }

    #[test]
    fn test_short_candidate_penalized_and_dropped() {
        let candidates = vec![candidate("a", "x")];
        let results = score_with_keywords("car", &candidates);
        assert!(results.is_empty());
    }

    #[test]
    fn test_substring_boost_clamped() {
        let candidates = vec![candidate("a", "supercar racing down the street")];
        let results = score_with_keywords("car", &candidates);
        assert_eq!(results.len(), 1);
        assert!(results[0].score <= 1.0);
        assert!(results[0].score >= 0.5);
    }

    #[test]
    fn test_comments_attached_and_unique() {
        let candidates = vec![
            candidate("a", "car parked outside"),
            candidate("b", "car parked outside again"),
            candidate("c", "car in a garage"),
        ];
        let results = score_with_keywords("car", &candidates);
        assert!(results.iter().all(|r| !r.comment.is_empty()));
        let mut comments: Vec<&String> = results.iter().map(|r| &r.comment).collect();
        comments.sort();
        comments.dedup();
        assert_eq!(comments.len(), results.len());
        // Known nouns render in Japanese.
        assert!(results.iter().any(|r| r.comment.contains('車')));
    }

    #[test]
    fn test_scoring_is_deterministic() {
        let candidates = vec![
            candidate("a", "a red car"),
            candidate("b", "another red car variant"),
            candidate("", ""),
        ];
        let first = score_with_keywords("car", &candidates);
        let second = score_with_keywords("car", &candidates);
        assert_eq!(first, second);
    }

    #[test]
    fn test_empty_query_returns_nothing() {
        let candidates = vec![candidate("a", "a red car")];
        assert!(score_with_keywords("  ", &candidates).is_empty());
    }

    #[test]
    fn test_comment_for_empty_text_is_deterministic() {
        let a = comment_for_text("", "id-1");
        let b = comment_for_text("", "id-1");
        assert_eq!(a, b);
        assert!(FALLBACK_COMMENTS.contains(&a.as_str()));
    }

    #[test]
    fn test_comment_skips_technical_tokens() {
        let comment = comment_for_text("voxel-style low-poly render of a house", "id");
        assert!(comment.contains('家'), "got {comment}");
    }

    #[test]
    fn test_parse_lm_items_with_fences_and_prose() {
        let text = "Sure! Here is the ranking:\n```json\n\
                    [{\"id\":\"a\",\"score\":0.9,\"text\":\"car\",\"comment\":\"コメント\"}]\n```";
        let items = parse_lm_items(text).unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0]["id"], "a");
        assert!(parse_lm_items("no array at all").is_none());
    }

    #[test]
    fn test_merge_prefer_baseline_retains_positive_lm_scores() {
        let baseline = vec![
            SearchResult {
                id: "a".into(),
                score: 0.5,
                text: "car".into(),
                coords: None,
                comment: "これ、車っぽいね、かわいい〜".into(),
            },
            SearchResult {
                id: "b".into(),
                score: 0.3,
                text: "tree".into(),
                coords: None,
                comment: "これ、木っぽいね、かわいい〜".into(),
            },
        ];
        let lm = vec![SearchResult {
            id: "a".into(),
            score: 0.8,
            text: "car".into(),
            coords: None,
            comment: String::new(),
        }];

        let merged = merge_prefer_baseline(&baseline, &lm);
        assert_eq!(merged[0].id, "a");
        assert_eq!(merged[0].score, 0.8);
        assert_eq!(merged[1].score, 0.3);
        // Baseline comments survive the merge.
        assert!(!merged[0].comment.is_empty());
    }

    #[test]
    fn test_finalize_lm_results_dedups_and_repairs_comments() {
        let lm = vec![
            SearchResult {
                id: "a".into(),
                score: 0.9,
                text: "a red car".into(),
                coords: None,
                comment: "this is clearly a car".into(), // English: replaced
            },
            SearchResult {
                id: "b".into(),
                score: 0.8,
                text: "A  red   car".into(), // same normalized text
                coords: None,
                comment: String::new(),
            },
            SearchResult {
                id: "c".into(),
                score: 0.0,
                text: "unrelated".into(),
                coords: None,
                comment: "should vanish".into(),
            },
        ];
        let out = finalize_lm_results(lm);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].id, "a");
        assert!(out[0].comment.contains('車'));
    }

    #[test]
    fn test_candidates_from_logs_dedup_most_recent() {
        let temp = TempDir::new().unwrap();
        std::fs::write(
            temp.path().join("1_attrs.json"),
            json!({"prompt": "voxel-style car, small size"}).to_string(),
        )
        .unwrap();
        std::fs::write(
            temp.path().join("2_attrs.json"),
            json!({"prompt": "voxel-style car, small size"}).to_string(),
        )
        .unwrap();
        std::fs::write(
            temp.path().join("3_attrs.json"),
            json!({"prompt": "voxel-style house, large size"}).to_string(),
        )
        .unwrap();
        std::fs::write(temp.path().join("ignored.log"), "not json").unwrap();

        let service = service(&temp);
        let candidates = service.build_candidates();
        assert_eq!(candidates.len(), 2);
    }

    #[test]
    fn test_search_without_lm_uses_baseline() {
        let temp = TempDir::new().unwrap();
        std::fs::write(
            temp.path().join("1_attrs.json"),
            json!({"prompt": "voxel-style car, small size, primary colors: red"})
                .to_string(),
        )
        .unwrap();
        std::fs::write(
            temp.path().join("2_attrs.json"),
            json!({"prompt": "voxel-style tree, large size, primary colors: green"})
                .to_string(),
        )
        .unwrap();

        let service = service(&temp);
        let results = service.search("car", 5, None);
        assert_eq!(results.len(), 1);
        assert!(results[0].text.contains("car"));
        assert!(!results[0].comment.is_empty());

        // top_k is honored.
        let results = service.search("voxel", 1, None);
        assert!(results.len() <= 1);
    }

    #[test]
    fn test_search_empty_logs_dir() {
        let temp = TempDir::new().unwrap();
        let service = SearchService::new(
            &SearchConfig::default(),
            temp.path().join("missing_dir"),
        )
        .unwrap();
        assert!(service.search("car", 5, None).is_empty());
    }

    #[test]
    fn test_lm_payload_shape() {
        let payload = lm_payload("車", &[candidate("a", "car")], Some("paint"));
        assert_eq!(payload["model"], "gpt-4o-mini");
        let user = payload["messages"][1]["content"].as_str().unwrap();
        assert!(user.contains("[a] car"));
        assert!(user.contains("paint UI"));
    }
}
