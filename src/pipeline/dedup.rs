//! In-batch textual deduplication of findings.
//!
//! Greedy single pass: a finding is dropped when its description's token
//! set has Jaccard similarity at or above the threshold with any finding
//! already accepted. First seen wins and survivors keep their order.

use std::collections::HashSet;

use tracing::debug;

use crate::analysis::types::Finding;

/// Lowercased whitespace-delimited tokens.
pub fn token_set(text: &str) -> HashSet<String> {
    text.split_whitespace().map(str::to_lowercase).collect()
}

/// `|a ∩ b| / |a ∪ b|`, or `0.0` when either set is empty.
pub fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let intersection = a.intersection(b).count();
    let union = a.len() + b.len() - intersection;
    intersection as f64 / union as f64
}

/// Keep the first of each group of near-identical descriptions.
pub fn dedupe(findings: Vec<Finding>, threshold: f64) -> Vec<Finding> {
    let mut accepted: Vec<HashSet<String>> = Vec::with_capacity(findings.len());
    let mut survivors = Vec::with_capacity(findings.len());

    for finding in findings {
        let tokens = token_set(&finding.proposal.description);
        if let Some(similarity) = accepted
            .iter()
            .map(|seen| jaccard(&tokens, seen))
            .find(|s| *s >= threshold)
        {
            debug!(
                description = %finding.proposal.description,
                similarity,
                "Dropping duplicate finding"
            );
            continue;
        }
        accepted.push(tokens);
        survivors.push(finding);
    }
    survivors
}
