//! Response parsing and recovery
//!
//! Backend text is an unreliable channel: models wrap JSON in markdown
//! fences, prefix it with bullet markers, echo instructions around it, or
//! abandon structure entirely. `parse` runs a cascade of recovery strategies
//! and always returns a structurally valid report; when nothing structured
//! can be recovered it degrades confidence instead of failing.

use crate::report::{Confidence, Report};
use regex::Regex;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::OnceLock;
use tracing::debug;

/// Character budget for the degraded-fallback echo of raw output.
const DEGRADED_PREFIX_CHARS: usize = 480;

/// Parse raw backend text into a report. Total: never errors.
///
/// Strategies, first success wins, each validated for non-empty
/// `executive_summary` and non-empty `principal_findings`:
/// 1. strict parse of the whole text,
/// 2. strict parse of the largest balanced `{...}` span,
/// 3. bullet-prefix strip then strict parse,
/// 4. section-header extraction,
/// 5. degraded fallback (cannot fail).
pub fn parse(raw: &str) -> Report {
    if let Some(report) = strict_parse(raw) {
        return report;
    }
    if let Some(report) = largest_span_parse(raw) {
        debug!("report recovered from embedded JSON span");
        return report;
    }
    if let Some(report) = bullet_prefix_parse(raw) {
        debug!("report recovered after stripping list marker");
        return report;
    }
    if let Some(report) = section_header_parse(raw) {
        debug!("report assembled from section headers");
        return report;
    }
    debug!("all structured parse strategies failed, degrading confidence");
    degraded_fallback(raw)
}

/// Strategy 1: treat the entire text as one structured object.
fn strict_parse(text: &str) -> Option<Report> {
    let clean = strip_markdown_fences(text);
    let sanitized = fix_json_issues(clean);
    let value: Value = serde_json::from_str(&sanitized).ok()?;
    let report = value_to_report(&value)?;
    report.is_structurally_valid().then_some(report)
}

/// Strategy 2: locate the largest balanced `{...}` substring and parse that.
///
/// Largest, not first: when the backend echoes its own instructions the text
/// can contain several candidate objects, and the first is often a truncated
/// fragment of the schema description.
fn largest_span_parse(text: &str) -> Option<Report> {
    let clean = strip_markdown_fences(text);
    let span = largest_balanced_span(clean)?;
    strict_parse(span)
}

/// Strategy 3: responses wrapped in a bullet point, e.g. `• {"executive...`.
fn bullet_prefix_parse(text: &str) -> Option<Report> {
    let stripped = strip_list_marker(text)?;
    let stripped = stripped
        .trim()
        .trim_matches(|c| c == '"' || c == '\'' || c == '`')
        .trim();
    if !stripped.starts_with('{') {
        return None;
    }
    strict_parse(stripped).or_else(|| largest_span_parse(stripped))
}

/// Strategy 4: assemble a report from recognizable section headers.
fn section_header_parse(text: &str) -> Option<Report> {
    let sections = split_by_headers(text);
    if sections.is_empty() {
        return None;
    }

    let mut executive_summary = String::new();
    let mut principal_findings: Vec<String> = Vec::new();
    let mut analytic_sections: BTreeMap<String, String> = BTreeMap::new();

    for (label, body) in sections {
        let body = body.trim();
        if body.is_empty() {
            continue;
        }
        match classify_header(&label) {
            HeaderKind::Summary if executive_summary.is_empty() => {
                executive_summary = body.to_string();
            }
            HeaderKind::Findings if principal_findings.is_empty() => {
                principal_findings = split_findings(body);
            }
            HeaderKind::Analytic => {
                // Paragraph breaks inside a section body are preserved.
                analytic_sections.insert(slugify(&label), body.to_string());
            }
            _ => {}
        }
    }

    let report = Report {
        executive_summary,
        principal_findings,
        analytic_sections,
        confidence: Confidence::High,
    };
    report.is_structurally_valid().then_some(report)
}

/// Strategy 5: bounded-length echo of the raw text. Cannot fail.
fn degraded_fallback(raw: &str) -> Report {
    let trimmed = raw.trim();
    let prefix = if trimmed.is_empty() {
        "No usable content was returned by the backend.".to_string()
    } else {
        truncate_chars(trimmed, DEGRADED_PREFIX_CHARS)
    };

    Report {
        executive_summary: prefix.clone(),
        principal_findings: vec![prefix],
        analytic_sections: BTreeMap::new(),
        confidence: Confidence::Degraded,
    }
}

// JSON recovery helpers

/// Strip markdown code fences from a response.
fn strip_markdown_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let clean = if trimmed.starts_with("```json") {
        trimmed.strip_prefix("```json").unwrap_or(trimmed)
    } else if trimmed.starts_with("```") {
        trimmed.strip_prefix("```").unwrap_or(trimmed)
    } else {
        trimmed
    };
    let clean = clean.strip_suffix("```").unwrap_or(clean);
    clean.trim()
}

/// Repair common LLM JSON damage before strict parsing.
fn fix_json_issues(json: &str) -> String {
    let mut fixed = json.to_string();

    // Trailing commas before closing brackets
    fixed = fixed.replace(",]", "]");
    fixed = fixed.replace(",}", "}");

    // Smart quotes to regular quotes
    fixed = fixed.replace('\u{201C}', "\"");
    fixed = fixed.replace('\u{201D}', "\"");
    fixed = fixed.replace('\u{2018}', "'");
    fixed = fixed.replace('\u{2019}', "'");

    fixed
        .chars()
        .filter(|c| !c.is_control() || *c == '\n' || *c == '\t')
        .collect()
}

/// Find the largest balanced `{...}` span in the text.
fn largest_balanced_span(text: &str) -> Option<&str> {
    let mut best: Option<(usize, usize)> = None;
    let mut depth: i32 = 0;
    let mut start = None;

    for (i, c) in text.char_indices() {
        match c {
            '{' => {
                if depth == 0 {
                    start = Some(i);
                }
                depth += 1;
            }
            '}' => {
                if depth == 0 {
                    continue;
                }
                depth -= 1;
                if depth == 0 {
                    if let Some(s) = start.take() {
                        let len = i + 1 - s;
                        if best.map_or(true, |(bs, be)| len > be - bs) {
                            best = Some((s, i + 1));
                        }
                    }
                }
            }
            _ => {}
        }
    }

    best.map(|(s, e)| &text[s..e])
}

/// Strip a leading list marker (`•`, `-`, `*`, `1.`) from the first line.
fn strip_list_marker(text: &str) -> Option<&str> {
    static MARKER: OnceLock<Regex> = OnceLock::new();
    let re = MARKER.get_or_init(|| Regex::new(r"^\s*(?:[•\-\*]|\d{1,2}[.)])\s+").unwrap());
    let m = re.find(text.trim_start())?;
    Some(&text.trim_start()[m.end()..])
}

/// Convert a parsed JSON value into a report, tolerating shape drift.
///
/// Models rename fields, return findings as a single string, or hoist
/// analytic sections to the top level; recover all of those.
fn value_to_report(value: &Value) -> Option<Report> {
    let obj = value.as_object()?;

    let executive_summary = ["executive_summary", "summary", "overview"]
        .iter()
        .find_map(|key| obj.get(*key).and_then(Value::as_str))
        .unwrap_or_default()
        .trim()
        .to_string();

    let principal_findings = ["principal_findings", "key_findings", "findings"]
        .iter()
        .find_map(|key| obj.get(*key))
        .map(findings_from_value)
        .unwrap_or_default();

    let mut analytic_sections: BTreeMap<String, String> = BTreeMap::new();
    if let Some(sections) = obj.get("analytic_sections").and_then(Value::as_object) {
        for (name, body) in sections {
            if let Some(text) = body.as_str() {
                if !text.trim().is_empty() {
                    analytic_sections.insert(slugify(name), text.trim().to_string());
                }
            }
        }
    }
    // Hoisted sections: top-level "pca_analysis", "heatmap_analysis", ...
    for (name, body) in obj {
        if name.ends_with("_analysis") {
            if let Some(text) = body.as_str() {
                if !text.trim().is_empty() {
                    analytic_sections
                        .entry(slugify(name))
                        .or_insert_with(|| text.trim().to_string());
                }
            }
        }
    }

    Some(Report {
        executive_summary,
        principal_findings,
        analytic_sections,
        confidence: Confidence::High,
    })
}

fn findings_from_value(value: &Value) -> Vec<String> {
    match value {
        Value::Array(items) => items
            .iter()
            .filter_map(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect(),
        Value::String(text) => split_findings(text),
        _ => Vec::new(),
    }
}

// Section-header extraction

enum HeaderKind {
    Summary,
    Findings,
    Analytic,
}

fn classify_header(label: &str) -> HeaderKind {
    let lower = label.trim().to_lowercase();
    if lower.contains("executive summary") || lower == "summary" || lower == "overview" {
        HeaderKind::Summary
    } else if lower.contains("finding") {
        HeaderKind::Findings
    } else {
        HeaderKind::Analytic
    }
}

/// A header line is a whole line that is just a label: markdown `# Label`,
/// bold `**Label**`, or `Label:` with nothing after it.
fn header_regex() -> &'static Regex {
    static HEADER: OnceLock<Regex> = OnceLock::new();
    HEADER.get_or_init(|| {
        Regex::new(r"(?m)^\s*(?:#{1,6}\s+|\*\*)?([A-Za-z][A-Za-z0-9 /()_-]{2,60}?)(?:\*\*)?\s*:?\s*$")
            .unwrap()
    })
}

/// Split text into (header label, body span) pairs.
fn split_by_headers(text: &str) -> Vec<(String, String)> {
    let re = header_regex();
    let mut headers: Vec<(usize, usize, String)> = Vec::new();
    for caps in re.captures_iter(text) {
        let whole = caps.get(0).unwrap();
        let label = caps.get(1).unwrap().as_str().to_string();
        headers.push((whole.start(), whole.end(), label));
    }

    let mut sections = Vec::new();
    for (idx, (_, body_start, label)) in headers.iter().enumerate() {
        let body_end = headers
            .get(idx + 1)
            .map(|(next_start, _, _)| *next_start)
            .unwrap_or(text.len());
        sections.push((label.clone(), text[*body_start..body_end].to_string()));
    }
    sections
}

/// Split a findings span into list items: one per bullet line, or one per
/// non-empty line when no bullets are present.
fn split_findings(body: &str) -> Vec<String> {
    static BULLET: OnceLock<Regex> = OnceLock::new();
    let re = BULLET.get_or_init(|| Regex::new(r"^\s*(?:[•\-\*]|\d{1,2}[.)])\s*").unwrap());

    let has_bullets = body.lines().any(|line| re.is_match(line));
    body.lines()
        .filter(|line| !has_bullets || re.is_match(line))
        .map(|line| re.replace(line, "").trim().to_string())
        .filter(|line| !line.is_empty())
        .collect()
}

fn slugify(label: &str) -> String {
    label
        .trim()
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '_' })
        .collect::<String>()
        .split('_')
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("_")
}

/// Unicode-safe character-bounded prefix.
fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let prefix: String = s.chars().take(max.saturating_sub(3)).collect();
    format!("{}...", prefix)
}
