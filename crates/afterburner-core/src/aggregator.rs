//! Finding Aggregator: dedupe, rank and gate findings within one stage.
//!
//! Two findings are duplicates when they share a category, point at the
//! same file with enough line overlap, and their normalized messages are
//! similar enough. The higher-severity instance stays canonical; the other
//! is kept with `duplicate_of` set. Aggregation is idempotent.

use std::cmp::{Ordering, Reverse};
use std::collections::{BTreeSet, HashSet};

use serde::{Deserialize, Serialize};

use crate::config::DedupeConfig;
use crate::domain::{normalize_message, Finding, FindingId, Severity, Verdict};

/// Token Jaccard similarity of two messages after normalization.
pub fn message_similarity(a: &str, b: &str) -> f64 {
    let na = normalize_message(a);
    let nb = normalize_message(b);
    let ta: HashSet<&str> = na.split(' ').filter(|t| !t.is_empty()).collect();
    let tb: HashSet<&str> = nb.split(' ').filter(|t| !t.is_empty()).collect();
    if ta.is_empty() && tb.is_empty() {
        return 1.0;
    }
    let shared = ta.intersection(&tb).count() as f64;
    let union = ta.union(&tb).count() as f64;
    shared / union
}

/// Whether `a` and `b` describe the same issue under `cfg`. Symmetric.
pub fn same_issue(a: &Finding, b: &Finding, cfg: &DedupeConfig) -> bool {
    if a.category != b.category {
        return false;
    }
    // Synthetic findings are per tool; two different tools failing are two issues.
    if a.category.is_synthetic() && a.source_tool != b.source_tool {
        return false;
    }
    let located = match (&a.location, &b.location) {
        (Some(la), Some(lb)) => {
            la.file == lb.file && la.overlap_fraction(lb) >= cfg.min_line_overlap
        }
        (None, None) => true,
        _ => false,
    };
    located && message_similarity(&a.message, &b.message) >= cfg.min_message_similarity
}

/// Merge findings from possibly-parallel tool calls.
///
/// Existing `duplicate_of` links whose target is present are preserved, so
/// feeding the output back in yields the same list.
pub fn aggregate(findings: Vec<Finding>, cfg: &DedupeConfig) -> Vec<Finding> {
    let ids: HashSet<FindingId> = findings
        .iter()
        .filter(|f| !f.is_duplicate())
        .map(|f| f.id.clone())
        .collect();

    let (mut linked, mut candidates): (Vec<Finding>, Vec<Finding>) = findings
        .into_iter()
        .map(|mut f| {
            if f.duplicate_of.as_ref().is_some_and(|t| !ids.contains(t)) {
                f.duplicate_of = None;
            }
            f
        })
        .partition(Finding::is_duplicate);

    // Most severe first; the sort is stable so earlier reports win ties.
    candidates.sort_by_key(|f| Reverse(f.severity));

    let mut canonical: Vec<Finding> = Vec::with_capacity(candidates.len());
    for mut f in candidates {
        match canonical.iter().find(|c| same_issue(c, &f, cfg)) {
            Some(c) => {
                f.duplicate_of = Some(c.id.clone());
                linked.push(f);
            }
            None => canonical.push(f),
        }
    }

    canonical.extend(linked);
    canonical.sort_by(display_order);
    canonical
}

fn display_order(a: &Finding, b: &Finding) -> Ordering {
    let line = |f: &Finding| f.location.as_ref().and_then(|l| l.lines).map(|r| r.start);
    a.is_duplicate()
        .cmp(&b.is_duplicate())
        .then_with(|| b.severity.cmp(&a.severity))
        .then_with(|| a.file().cmp(&b.file()))
        .then_with(|| line(a).cmp(&line(b)))
        .then_with(|| a.message.cmp(&b.message))
        .then_with(|| a.source_tool.cmp(&b.source_tool))
        .then_with(|| a.id.cmp(&b.id))
        .then_with(|| a.rule_id.cmp(&b.rule_id))
        .then_with(|| a.resolved.cmp(&b.resolved))
        .then_with(|| a.duplicate_of.cmp(&b.duplicate_of))
}

/// Fail iff a canonical finding at or above `threshold` is unresolved.
pub fn gate_verdict(findings: &[Finding], threshold: Severity) -> Verdict {
    if findings.iter().any(|f| f.blocks_at(threshold)) {
        Verdict::Fail
    } else {
        Verdict::Pass
    }
}

pub fn blocking_findings(findings: &[Finding], threshold: Severity) -> Vec<Finding> {
    findings
        .iter()
        .filter(|f| f.blocks_at(threshold))
        .cloned()
        .collect()
}

/// What a rescan actually looked at.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RescanScope {
    pub files: BTreeSet<String>,
    /// Tools whose call succeeded during the rescan.
    pub tools: BTreeSet<String>,
}

impl RescanScope {
    pub fn covers(&self, finding: &Finding) -> bool {
        if !self.tools.contains(&finding.source_tool) {
            return false;
        }
        match finding.file() {
            Some(file) => self.files.contains(file),
            None => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reconciliation {
    /// Previous findings (resolution updated) plus new ones, aggregated.
    pub merged: Vec<Finding>,
    /// Fresh findings that match no unresolved previous finding.
    pub new_findings: Vec<Finding>,
    /// Previous findings that flipped to resolved.
    pub resolved: Vec<FindingId>,
}

/// Fold a rescan into the previous finding list.
///
/// A previous finding flips to `resolved` only when the rescan covered it
/// (same tool ran successfully over its file) and produced nothing that
/// is the same issue.
pub fn reconcile(
    previous: &[Finding],
    fresh: Vec<Finding>,
    scope: &RescanScope,
    cfg: &DedupeConfig,
) -> Reconciliation {
    let mut resolved = Vec::new();
    let updated: Vec<Finding> = previous
        .iter()
        .cloned()
        .map(|mut prev| {
            if !prev.resolved
                && !prev.is_duplicate()
                && scope.covers(&prev)
                && !fresh.iter().any(|f| same_issue(&prev, f, cfg))
            {
                prev.resolved = true;
                resolved.push(prev.id.clone());
            }
            prev
        })
        .collect();

    let new_findings: Vec<Finding> = fresh
        .into_iter()
        .filter(|f| !updated.iter().any(|p| !p.resolved && same_issue(p, f, cfg)))
        .collect();

    let merged = aggregate(
        updated.into_iter().chain(new_findings.iter().cloned()).collect(),
        cfg,
    );
    Reconciliation {
        merged,
        new_findings,
        resolved,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{FindingCategory, LineRange, Location};

    fn cfg() -> DedupeConfig {
        DedupeConfig::default()
    }

    fn vuln(tool: &str, sev: Severity, file: &str, lines: (u32, u32), msg: &str) -> Finding {
        Finding::new(
            tool,
            FindingCategory::CodeVulnerability,
            sev,
            Some(Location::at(file, LineRange::new(lines.0, lines.1))),
            msg,
        )
    }

    #[test]
    fn similarity_is_token_jaccard() {
        assert_eq!(message_similarity("SQL injection!", "sql  injection"), 1.0);
        assert!((message_similarity("a b c d", "a b c e") - 0.6).abs() < 1e-9);
        assert_eq!(message_similarity("", ""), 1.0);
    }

    #[test]
    fn duplicates_keep_higher_severity_canonical() {
        let low = vuln("bandit", Severity::Medium, "auth.py", (10, 12), "Possible SQL injection via string query");
        let high = vuln("semgrep", Severity::Critical, "auth.py", (11, 11), "possible sql injection via string query");
        let out = aggregate(vec![low.clone(), high.clone()], &cfg());

        assert_eq!(out.len(), 2, "duplicates are kept for audit");
        assert_eq!(out[0].id, high.id);
        assert!(out[0].duplicate_of.is_none());
        assert_eq!(out[1].duplicate_of.as_ref(), Some(&high.id));
    }

    #[test]
    fn different_files_or_categories_are_distinct() {
        let a = vuln("semgrep", Severity::High, "a.py", (1, 1), "hardcoded secret");
        let b = vuln("semgrep", Severity::High, "b.py", (1, 1), "hardcoded secret");
        let mut c = vuln("semgrep", Severity::High, "a.py", (1, 1), "hardcoded secret");
        c.category = FindingCategory::Secret;
        let out = aggregate(vec![a, b, c], &cfg());
        assert!(out.iter().all(|f| !f.is_duplicate()));
    }

    #[test]
    fn disjoint_lines_are_distinct() {
        let a = vuln("semgrep", Severity::High, "a.py", (1, 2), "use of eval");
        let b = vuln("semgrep", Severity::High, "a.py", (40, 41), "use of eval");
        let out = aggregate(vec![a, b], &cfg());
        assert!(out.iter().all(|f| !f.is_duplicate()));
    }

    #[test]
    fn aggregation_is_idempotent() {
        let input = vec![
            vuln("bandit", Severity::Medium, "x.py", (5, 9), "weak hash md5 used"),
            vuln("semgrep", Severity::High, "x.py", (6, 6), "weak hash MD5 used"),
            vuln("semgrep", Severity::Low, "y.py", (1, 1), "debug enabled"),
            Finding::tool_unavailable("npm-audit", Severity::Medium, "not installed"),
            vuln("semgrep", Severity::High, "x.py", (7, 8), "weak hash md5 used here"),
        ];
        let once = aggregate(input, &cfg());
        let twice = aggregate(once.clone(), &cfg());
        assert_eq!(once, twice);
    }

    #[test]
    fn dangling_duplicate_link_is_cleared() {
        let mut orphan = vuln("semgrep", Severity::Low, "a.py", (1, 1), "x");
        orphan.duplicate_of = Some(FindingId("missing".into()));
        let out = aggregate(vec![orphan], &cfg());
        assert!(out[0].duplicate_of.is_none());
    }

    #[test]
    fn tool_failures_of_different_tools_do_not_merge() {
        let mut loose = cfg();
        loose.min_message_similarity = 0.0;
        let a = Finding::tool_unavailable("semgrep", Severity::Medium, "exit 2");
        let b = Finding::tool_unavailable("bandit", Severity::Medium, "exit 2");
        let out = aggregate(vec![a, b], &loose);
        assert!(out.iter().all(|f| !f.is_duplicate()));
    }

    #[test]
    fn gate_counts_only_unresolved_canonical_at_threshold() {
        let mut f = vuln("semgrep", Severity::High, "a.py", (1, 1), "x");
        assert_eq!(gate_verdict(&[f.clone()], Severity::High), Verdict::Fail);
        assert_eq!(gate_verdict(&[f.clone()], Severity::Critical), Verdict::Pass);
        f.resolved = true;
        assert_eq!(gate_verdict(&[f], Severity::Info), Verdict::Pass);
    }

    #[test]
    fn reconcile_resolves_only_covered_findings() {
        let fixed = vuln("semgrep", Severity::High, "a.py", (3, 3), "eval of input");
        let elsewhere = vuln("semgrep", Severity::High, "b.py", (3, 3), "eval of input");
        let scope = RescanScope {
            files: ["a.py".to_string()].into_iter().collect(),
            tools: ["semgrep".to_string()].into_iter().collect(),
        };

        let rec = reconcile(&[fixed.clone(), elsewhere.clone()], vec![], &scope, &cfg());
        assert_eq!(rec.resolved, vec![fixed.id.clone()]);
        assert!(rec.new_findings.is_empty());
        let by_id = |id: &FindingId| rec.merged.iter().find(|f| &f.id == id).unwrap().resolved;
        assert!(by_id(&fixed.id));
        assert!(!by_id(&elsewhere.id));
    }

    #[test]
    fn reconcile_keeps_reproduced_and_reports_new() {
        let old = vuln("semgrep", Severity::Medium, "a.py", (3, 3), "eval of input");
        let scope = RescanScope {
            files: ["a.py".to_string()].into_iter().collect(),
            tools: ["semgrep".to_string()].into_iter().collect(),
        };
        let reproduced = vuln("semgrep", Severity::Medium, "a.py", (3, 4), "Eval of input");
        let fresh = vuln("semgrep", Severity::Critical, "a.py", (20, 20), "shell injection");

        let rec = reconcile(&[old.clone()], vec![reproduced, fresh.clone()], &scope, &cfg());
        assert!(rec.resolved.is_empty());
        assert_eq!(rec.new_findings.len(), 1);
        assert_eq!(rec.new_findings[0].id, fresh.id);
        assert_eq!(rec.merged.len(), 2);
    }

    #[test]
    fn reconcile_needs_the_same_tool_to_succeed() {
        let old = vuln("bandit", Severity::High, "a.py", (3, 3), "assert used");
        let scope = RescanScope {
            files: ["a.py".to_string()].into_iter().collect(),
            tools: ["semgrep".to_string()].into_iter().collect(),
        };
        let rec = reconcile(&[old], vec![], &scope, &cfg());
        assert!(rec.resolved.is_empty());
    }
}
