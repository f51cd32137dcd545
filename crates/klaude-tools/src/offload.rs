// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::path::Path;

use tracing::warn;

use crate::tool::OffloadStrategy;

/// Post-process a tool output according to its offload strategy.
///
/// Above `threshold_bytes` the output keeps its head and tail lines with an
/// omission notice in between.  `OnThreshold` additionally writes the full
/// output into the session's artifacts directory and embeds the path in the
/// notice so the model (or the user) can retrieve the rest.
pub fn postprocess_output(
    text: &str,
    strategy: OffloadStrategy,
    threshold_bytes: usize,
    artifacts_dir: &Path,
    call_id: &str,
) -> String {
    if strategy == OffloadStrategy::ReadTool {
        return text.to_string();
    }
    if threshold_bytes == 0 || text.len() <= threshold_bytes {
        return text.to_string();
    }

    let artifact_note = if strategy == OffloadStrategy::OnThreshold {
        match spill_artifact(text, artifacts_dir, call_id) {
            Ok(path) => format!("; full output: {path}"),
            Err(e) => {
                warn!(error = %e, "failed to write offload artifact");
                String::new()
            }
        }
    } else {
        String::new()
    };

    head_tail(text, threshold_bytes, &artifact_note)
}

fn spill_artifact(text: &str, artifacts_dir: &Path, call_id: &str) -> std::io::Result<String> {
    std::fs::create_dir_all(artifacts_dir)?;
    // Call ids come from the provider; keep only filename-safe chars.
    let safe: String = call_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    let path = artifacts_dir.join(format!("{safe}.txt"));
    std::fs::write(&path, text)?;
    Ok(path.display().to_string())
}

/// Keep head and tail lines within the byte budget, splitting it roughly
/// 60/40 in favour of the head (command preamble plus final result).
///
/// Budget offsets land on arbitrary bytes; every cut is snapped to a char
/// boundary (and then to a line boundary where one exists) so multibyte
/// output can never panic the slicing.
fn head_tail(text: &str, budget: usize, artifact_note: &str) -> String {
    let head_budget = budget * 3 / 5;
    let tail_budget = budget - head_budget;

    let head_cap = floor_char_boundary(text, head_budget);
    let head_end = text[..head_cap]
        .rfind('\n')
        .map(|p| p + 1)
        .unwrap_or(head_cap);
    let tail_start = {
        // Never let the tail overlap the head.  `head_end` is itself a
        // boundary, so the snap cannot move `from` back past it.
        let from = text.len().saturating_sub(tail_budget).max(head_end);
        let from = floor_char_boundary(text, from);
        text[from..]
            .find('\n')
            .map(|p| from + p + 1)
            .unwrap_or(text.len())
    };

    let omitted = tail_start.saturating_sub(head_end);
    let omitted_lines = text[head_end..tail_start].lines().count();
    format!(
        "{}[... {omitted_lines} lines / {omitted} bytes omitted{artifact_note} ...]\n{}",
        &text[..head_end],
        &text[tail_start..],
    )
}

/// Largest char boundary ≤ `idx` (clamped to the string length).
fn floor_char_boundary(s: &str, idx: usize) -> usize {
    let mut idx = idx.min(s.len());
    while !s.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn long_output(lines: usize) -> String {
        (0..lines)
            .map(|i| format!("line number {i:05}"))
            .collect::<Vec<_>>()
            .join("\n")
    }

    #[test]
    fn short_output_passes_through() {
        let dir = tempfile::tempdir().unwrap();
        let out = postprocess_output(
            "small",
            OffloadStrategy::OnThreshold,
            1024,
            dir.path(),
            "c1",
        );
        assert_eq!(out, "small");
    }

    #[test]
    fn read_tool_strategy_never_truncates() {
        let dir = tempfile::tempdir().unwrap();
        let text = long_output(1000);
        let out = postprocess_output(&text, OffloadStrategy::ReadTool, 64, dir.path(), "c1");
        assert_eq!(out, text);
    }

    #[test]
    fn oversized_output_keeps_head_and_tail() {
        let dir = tempfile::tempdir().unwrap();
        let text = long_output(1000);
        let out = postprocess_output(&text, OffloadStrategy::TruncateOnly, 512, dir.path(), "c1");
        assert!(out.len() < text.len());
        assert!(out.contains("line number 00000"), "head must survive");
        assert!(out.contains("line number 00999"), "tail must survive");
        assert!(out.contains("omitted"));
        // TruncateOnly writes no artifact
        assert!(std::fs::read_dir(dir.path()).unwrap().next().is_none());
    }

    #[test]
    fn on_threshold_writes_artifact_and_embeds_path() {
        let dir = tempfile::tempdir().unwrap();
        let text = long_output(1000);
        let out = postprocess_output(&text, OffloadStrategy::OnThreshold, 512, dir.path(), "call-7");
        let artifact = dir.path().join("call-7.txt");
        assert!(artifact.is_file());
        assert_eq!(std::fs::read_to_string(&artifact).unwrap(), text);
        assert!(out.contains(&artifact.display().to_string()));
    }

    #[test]
    fn multibyte_output_never_splits_a_char() {
        let dir = tempfile::tempdir().unwrap();
        // One long line of two-byte chars: no newline rescue, so the cuts
        // land wherever the byte budget says — including mid-char offsets.
        let text = "é".repeat(4000);
        for budget in [511, 512, 513, 515] {
            let out = postprocess_output(
                &text,
                OffloadStrategy::TruncateOnly,
                budget,
                dir.path(),
                "c1",
            );
            assert!(out.contains("omitted"));
            assert!(out.starts_with('é'));
        }

        // Multibyte lines near the cut points behave the same.
        let lines = (0..2000)
            .map(|i| format!("zeile {i} über käse und smörgås"))
            .collect::<Vec<_>>()
            .join("\n");
        let out = postprocess_output(
            &lines,
            OffloadStrategy::TruncateOnly,
            1024,
            dir.path(),
            "c2",
        );
        assert!(out.contains("zeile 0 "));
        assert!(out.contains("zeile 1999 "));
    }

    #[test]
    fn artifact_name_is_sanitised() {
        let dir = tempfile::tempdir().unwrap();
        let text = long_output(1000);
        let _ = postprocess_output(
            &text,
            OffloadStrategy::OnThreshold,
            512,
            dir.path(),
            "call/../evil",
        );
        assert!(dir.path().join("call____evil.txt").is_file());
    }
}
