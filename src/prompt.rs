//! Prompt assembly
//!
//! Builds the user prompt for a report request. Deterministic for a given
//! (params, payload) pair so identical scenarios produce identical prompts,
//! and bounded so an oversized analysis payload cannot blow the request past
//! provider context limits.

use crate::report::AnalysisPayload;
use crate::scenario::ScenarioParams;
use std::fmt::Write;

/// Upper bound on the serialized payload embedded in the prompt, in
/// characters. Beyond this the payload is truncated with a marker.
const MAX_PAYLOAD_CHARS: usize = 12_000;

/// Assemble the user prompt for one report request.
pub fn build_report_prompt(params: &ScenarioParams, payload: &AnalysisPayload) -> String {
    let mut prompt = String::with_capacity(1024);

    let _ = writeln!(
        prompt,
        "Write an analytical trend report on the subject \"{}\".",
        params.subject.trim()
    );

    let mut sources: Vec<&str> = params.sources.iter().map(|s| s.trim()).collect();
    sources.sort_unstable();
    sources.dedup();
    let _ = writeln!(prompt, "Data sources analyzed: {}.", sources.join(", "));
    let _ = writeln!(prompt, "Write the report in language code: {}.", params.language.trim());

    for (name, value) in &params.options {
        let _ = writeln!(prompt, "Report option {}: {}.", name, value);
    }

    prompt.push_str(
        "\nBase every statement on the statistical summaries below. \
         Cite concrete numbers from the data. Do not invent data points.\n\n\
         Statistical summaries (JSON):\n",
    );
    prompt.push_str(&bounded_payload(payload));
    prompt.push('\n');
    prompt
}

/// Serialize the payload, truncating on a character boundary if oversized.
fn bounded_payload(payload: &AnalysisPayload) -> String {
    let serialized =
        serde_json::to_string_pretty(&payload.data).unwrap_or_else(|_| "{}".to_string());
    if serialized.chars().count() <= MAX_PAYLOAD_CHARS {
        return serialized;
    }
    let mut truncated: String = serialized.chars().take(MAX_PAYLOAD_CHARS).collect();
    truncated.push_str("\n… (payload truncated)");
    truncated
}
