//! Evidence re-verification against current file content
//!
//! Evidence entries bind claims to (file, line range, snippet). Code
//! drifts, so every read re-anchors the citation:
//!
//! 1. Exact: the stored snippet found verbatim anywhere in the file —
//!    accept with updated line offsets.
//! 2. Fuzzy: best sliding window of current content scoring above the
//!    minor-refactor threshold — accept and recompute line bounds.
//! 3. Otherwise mark `stale = true` and retain the last-known data.
//!
//! Verification touches anchoring fields only; confidence labels pass
//! through unchanged, and entries are never deleted.

use tracing::debug;

use crate::error::Result;
use crate::paths;
use crate::schema::{fnv1a_hash, EvidenceEntry};
use crate::store::Store;

/// Minimum trigram Dice similarity for a fuzzy re-anchor.
///
/// Tunable heuristic: high enough to reject substantive rewrites, low
/// enough to tolerate a one-token edit in a typical snippet.
const FUZZY_THRESHOLD: f64 = 0.72;

/// Window heights tried around the stored snippet's line count
const WINDOW_SLACK: usize = 2;

/// Aggregated verification counts across all evidence
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VerificationSummary {
    pub total: usize,
    pub stale: usize,
    pub fresh: usize,
}

/// Re-anchors evidence rows in a store against current file content.
///
/// Reads files synchronously, off any lock's critical path; row updates
/// ride on SQLite's per-statement locking.
pub struct EvidenceVerifier<'a> {
    store: &'a Store,
}

impl<'a> EvidenceVerifier<'a> {
    pub fn new(store: &'a Store) -> Self {
        Self { store }
    }

    /// Fetch and re-verify every evidence entry for one entity.
    pub fn get_evidence_for_target(
        &self,
        entity_id: &str,
        entity_type: &str,
    ) -> Result<Vec<EvidenceEntry>> {
        let mut entries = self.store.evidence_for_entity(entity_id, entity_type)?;
        for entry in &mut entries {
            self.verify_entry(entry)?;
        }
        Ok(entries)
    }

    /// Stale/total counts across the whole store, re-verifying on the way.
    pub fn get_evidence_verification_summary(&self) -> Result<VerificationSummary> {
        let mut entries = self.store.all_evidence()?;
        let mut summary = VerificationSummary::default();
        for entry in &mut entries {
            self.verify_entry(entry)?;
            summary.total += 1;
            if entry.stale {
                summary.stale += 1;
            } else {
                summary.fresh += 1;
            }
        }
        Ok(summary)
    }

    /// Render a verification report, flagging STALE entries.
    pub fn export_evidence_markdown(&self) -> Result<String> {
        let mut entries = self.store.all_evidence()?;
        for entry in &mut entries {
            self.verify_entry(entry)?;
        }

        let stale = entries.iter().filter(|e| e.stale).count();
        let mut out = String::new();
        out.push_str("# Evidence Verification Report\n\n");
        out.push_str(&format!(
            "{} entries, {} fresh, {} stale\n\n",
            entries.len(),
            entries.len() - stale,
            stale
        ));

        for entry in &entries {
            let marker = if entry.stale { "**STALE** " } else { "" };
            out.push_str(&format!(
                "- {}`{}` ({}) — {}:{}-{} [{}]\n",
                marker,
                entry.claim,
                entry.entity_id,
                entry.file_path,
                entry.line,
                entry.end_line,
                entry.confidence
            ));
        }
        Ok(out)
    }

    /// Verify one entry in place and persist the updated anchor.
    fn verify_entry(&self, entry: &mut EvidenceEntry) -> Result<()> {
        let now = chrono::Utc::now().to_rfc3339();
        let path = paths::from_workspace_relative(&entry.file_path, self.store.workspace());

        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(_) => {
                // File gone: stale, but the citation is retained as-is
                entry.stale = true;
                entry.verified_at = Some(now);
                self.store.update_evidence_anchor(entry)?;
                return Ok(());
            }
        };

        if let Some((line, end_line)) = exact_match(&content, &entry.snippet) {
            entry.line = line;
            entry.end_line = end_line;
            entry.content_hash = format!("{:016x}", fnv1a_hash(&entry.snippet));
            entry.stale = false;
            entry.verified_at = Some(now);
            self.store.update_evidence_anchor(entry)?;
            return Ok(());
        }

        if let Some(anchor) = fuzzy_match(&content, &entry.snippet) {
            debug!(
                entity = %entry.entity_id,
                score = anchor.score,
                "fuzzy re-anchor accepted"
            );
            entry.line = anchor.line;
            entry.end_line = anchor.end_line;
            entry.content_hash = format!("{:016x}", fnv1a_hash(&anchor.text));
            entry.stale = false;
            entry.verified_at = Some(now);
            self.store.update_evidence_anchor(entry)?;
            return Ok(());
        }

        entry.stale = true;
        entry.verified_at = Some(now);
        self.store.update_evidence_anchor(entry)?;
        Ok(())
    }
}

/// Find the stored snippet verbatim; returns 1-indexed line bounds.
fn exact_match(content: &str, snippet: &str) -> Option<(usize, usize)> {
    let snippet = snippet.trim_end_matches('\n');
    if snippet.is_empty() {
        return None;
    }
    let idx = content.find(snippet)?;
    let line = content[..idx].matches('\n').count() + 1;
    let height = snippet.lines().count().max(1);
    Some((line, line + height - 1))
}

struct FuzzyAnchor {
    line: usize,
    end_line: usize,
    text: String,
    score: f64,
}

/// Slide windows of roughly the snippet's height over the file and keep
/// the best one above the threshold.
fn fuzzy_match(content: &str, snippet: &str) -> Option<FuzzyAnchor> {
    let target = normalize(snippet);
    if target.is_empty() {
        return None;
    }
    let target_grams = trigrams(&target);
    let lines: Vec<&str> = content.lines().collect();
    let height = snippet.lines().count().max(1);

    let mut best: Option<FuzzyAnchor> = None;
    let low = height.saturating_sub(WINDOW_SLACK).max(1);
    let high = height + WINDOW_SLACK;

    for window_height in low..=high {
        if window_height > lines.len() {
            continue;
        }
        for start in 0..=(lines.len() - window_height) {
            let window_text = lines[start..start + window_height].join("\n");
            let score = dice(&target_grams, &trigrams(&normalize(&window_text)));
            if score < FUZZY_THRESHOLD {
                continue;
            }
            if best.as_ref().map(|b| score > b.score).unwrap_or(true) {
                best = Some(FuzzyAnchor {
                    line: start + 1,
                    end_line: start + window_height,
                    text: window_text,
                    score,
                });
            }
        }
    }
    best
}

/// Collapse whitespace so formatting-only drift does not defeat matching
fn normalize(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn trigrams(s: &str) -> Vec<(char, char, char)> {
    let chars: Vec<char> = s.chars().collect();
    if chars.len() < 3 {
        return chars.windows(1).map(|w| (w[0], '\0', '\0')).collect();
    }
    let mut grams: Vec<(char, char, char)> = chars
        .windows(3)
        .map(|w| (w[0], w[1], w[2]))
        .collect();
    grams.sort_unstable();
    grams
}

/// Dice coefficient over sorted trigram multisets
fn dice(a: &[(char, char, char)], b: &[(char, char, char)]) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let mut overlap = 0usize;
    let (mut i, mut j) = (0usize, 0usize);
    while i < a.len() && j < b.len() {
        match a[i].cmp(&b[j]) {
            std::cmp::Ordering::Equal => {
                overlap += 1;
                i += 1;
                j += 1;
            }
            std::cmp::Ordering::Less => i += 1,
            std::cmp::Ordering::Greater => j += 1,
        }
    }
    (2.0 * overlap as f64) / (a.len() + b.len()) as f64
}
