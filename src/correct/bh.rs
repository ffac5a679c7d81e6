//! Benjamini-Hochberg false discovery rate correction.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Result of BH correction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BhCorrected {
    /// Biomarker IDs in original order.
    pub feature_ids: Vec<String>,
    /// Original p-values.
    pub p_values: Vec<f64>,
    /// Adjusted p-values (q-values).
    pub q_values: Vec<f64>,
    /// Number of tests.
    pub n_tests: usize,
}

/// Apply Benjamini-Hochberg FDR correction.
///
/// P-values are ranked ascending. Each tie group takes the largest raw
/// adjustment among its members, `p * n / k` at the group's smallest rank `k`.
/// A running minimum from the largest rank down then enforces monotonicity,
/// and values are capped at 1.
///
/// All p-values passed in form one family; callers exclude untestable rows
/// beforehand.
pub fn correct_bh(p_values: &[f64], feature_ids: &[String]) -> BhCorrected {
    let n = p_values.len();
    if n == 0 {
        return BhCorrected {
            feature_ids: vec![],
            p_values: vec![],
            q_values: vec![],
            n_tests: 0,
        };
    }

    // Stable sort so equal p-values keep input order.
    let mut indices: Vec<usize> = (0..n).collect();
    indices.sort_by(|&a, &b| p_values[a].partial_cmp(&p_values[b]).unwrap_or(Ordering::Equal));

    let n_f64 = n as f64;
    let mut q_sorted = vec![0.0; n];

    let mut start = 0;
    while start < n {
        let p = p_values[indices[start]];
        let mut end = start + 1;
        while end < n && p_values[indices[end]] == p {
            end += 1;
        }
        let adjusted = p * n_f64 / (start + 1) as f64;
        for q in &mut q_sorted[start..end] {
            *q = adjusted;
        }
        start = end;
    }

    // Work backwards
    q_sorted[n - 1] = q_sorted[n - 1].min(1.0);
    for i in (0..n - 1).rev() {
        q_sorted[i] = q_sorted[i].min(q_sorted[i + 1]).min(1.0);
    }

    // Restore original order
    let mut q_values = vec![0.0; n];
    for (i, &orig_idx) in indices.iter().enumerate() {
        q_values[orig_idx] = q_sorted[i];
    }

    BhCorrected {
        feature_ids: feature_ids.to_vec(),
        p_values: p_values.to_vec(),
        q_values,
        n_tests: n,
    }
}
