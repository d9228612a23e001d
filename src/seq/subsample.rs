//! Priority-weighted subsampling.
//!
//! Selects a bounded, titer-informed subset of the corpus: records are
//! grouped by a caller-supplied category function (by default region, year,
//! month of collection), sorted within each category by descending priority
//! score, and capped. Categories below the cap keep every member. Ties are
//! broken by original input order, so the selection is deterministic for a
//! fixed corpus and fixed scores.

use std::collections::HashMap;
use std::hash::Hash;

use indexmap::IndexMap;
use log::debug;
use thiserror::Error;

use super::SequenceRecord;

#[derive(Error, Debug)]
pub enum SubsampleError {
    #[error("category function failed for strain '{strain}': {reason}")]
    Category { strain: String, reason: String },

    #[error("priority function failed for strain '{strain}': {reason}")]
    Priority { strain: String, reason: String },
}

/// Fallible subsampling: either closure may reject a record, in which case
/// the whole call fails with no partial result.
pub fn subsample_with<'a, K, C, P>(
    records: &'a [SequenceRecord],
    category: C,
    cap: usize,
    priority: P,
) -> Result<Vec<&'a SequenceRecord>, SubsampleError>
where
    K: Eq + Hash,
    C: Fn(&SequenceRecord) -> Result<K, SubsampleError>,
    P: Fn(&SequenceRecord) -> Result<f64, SubsampleError>,
{
    // Bucket by category in first-seen order, remembering input positions
    // for the tie-break.
    let mut buckets: IndexMap<K, Vec<(usize, f64)>> = IndexMap::new();
    for (idx, rec) in records.iter().enumerate() {
        let key = category(rec)?;
        let score = priority(rec)?;
        buckets.entry(key).or_default().push((idx, score));
    }

    let mut selected_indices = Vec::new();
    for members in buckets.values_mut() {
        // Descending score; equal scores keep input order (stable sort).
        members.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        selected_indices.extend(members.iter().take(cap).map(|&(idx, _)| idx));
    }
    debug!(
        "subsampled {} of {} records across {} categories (cap {})",
        selected_indices.len(),
        records.len(),
        buckets.len(),
        cap
    );

    // Report in input order regardless of category layout.
    selected_indices.sort_unstable();
    Ok(selected_indices.into_iter().map(|i| &records[i]).collect())
}

/// Infallible subsampling over plain closures.
pub fn subsample<'a, K, C, P>(
    records: &'a [SequenceRecord],
    category: C,
    cap: usize,
    priority: P,
) -> Vec<&'a SequenceRecord>
where
    K: Eq + Hash,
    C: Fn(&SequenceRecord) -> K,
    P: Fn(&SequenceRecord) -> f64,
{
    subsample_with(
        records,
        |r| Ok::<_, SubsampleError>(category(r)),
        cap,
        |r| Ok::<_, SubsampleError>(priority(r)),
    )
    .expect("infallible closures cannot fail")
}

/// Default sampling category: (region, collection year, collection month).
pub fn default_category(rec: &SequenceRecord) -> (String, i32, u32) {
    use chrono::Datelike;
    (rec.region.clone(), rec.date.year(), rec.date.month())
}

/// Default sampling priority: the strain's titer-measurement count (zero if
/// it was never assayed), a small bonus for sequence length, and a penalty
/// proportional to its ambiguous-symbol count. Assayed strains dominate;
/// length and ambiguity only break ties among unassayed ones.
pub fn titer_priority<'c>(
    titer_counts: &'c HashMap<String, usize>,
) -> impl Fn(&SequenceRecord) -> f64 + 'c {
    |rec: &SequenceRecord| {
        let coverage = titer_counts.get(&rec.strain).copied().unwrap_or(0) as f64;
        coverage + 1e-4 * rec.sequence.len() as f64 - 0.01 * rec.ambiguous_nucleotides() as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::seq::test_record;

    fn fixed_scores(scores: &[(&str, f64)]) -> HashMap<String, f64> {
        scores.iter().map(|(s, p)| (s.to_string(), *p)).collect()
    }

    #[test]
    fn cap_respected_and_ties_keep_input_order() {
        // One category, scores 5, 3, 3, 1: cap 2 must keep s1 and the
        // first-seen of the tied pair, s2.
        let records = vec![
            test_record("s1", (2020, 1, 1), "R", ""),
            test_record("s2", (2020, 1, 2), "R", ""),
            test_record("s3", (2020, 1, 3), "R", ""),
            test_record("s4", (2020, 1, 4), "R", ""),
        ];
        let scores = fixed_scores(&[("s1", 5.0), ("s2", 3.0), ("s3", 3.0), ("s4", 1.0)]);
        let picked = subsample(&records, default_category, 2, |r| scores[&r.strain]);
        let names: Vec<_> = picked.iter().map(|r| r.strain.as_str()).collect();
        assert_eq!(names, vec!["s1", "s2"]);
    }

    #[test]
    fn categories_below_cap_keep_all_members() {
        let records = vec![
            test_record("a", (2020, 1, 1), "europe", ""),
            test_record("b", (2020, 2, 1), "europe", ""),
            test_record("c", (2020, 2, 2), "europe", ""),
        ];
        let picked = subsample(&records, default_category, 5, |_| 0.0);
        assert_eq!(picked.len(), 3);
    }

    #[test]
    fn categories_are_independent() {
        let records = vec![
            test_record("e1", (2020, 1, 1), "europe", ""),
            test_record("e2", (2020, 1, 2), "europe", ""),
            test_record("o1", (2020, 1, 3), "oceania", ""),
            test_record("o2", (2020, 1, 4), "oceania", ""),
        ];
        let scores = fixed_scores(&[("e1", 1.0), ("e2", 2.0), ("o1", 2.0), ("o2", 1.0)]);
        let picked = subsample(&records, default_category, 1, |r| scores[&r.strain]);
        let names: Vec<_> = picked.iter().map(|r| r.strain.as_str()).collect();
        assert_eq!(names, vec!["e2", "o1"]);
    }

    #[test]
    fn titer_priority_prefers_assayed_strains() {
        let assayed = test_record("hit", (2020, 1, 1), "R", "ACGTNNNN");
        let clean = test_record("miss", (2020, 1, 1), "R", "ACGTACGTACGT");
        let counts: HashMap<String, usize> = [("hit".to_string(), 3)].into_iter().collect();
        let priority = titer_priority(&counts);
        // Three titer measurements outweigh any length/ambiguity difference.
        assert!(priority(&assayed) > priority(&clean));
    }

    #[test]
    fn titer_priority_penalizes_ambiguity() {
        let clean = test_record("a", (2020, 1, 1), "R", "ACGTACGT");
        let dirty = test_record("b", (2020, 1, 1), "R", "ACGTNNNN");
        let counts = HashMap::new();
        let priority = titer_priority(&counts);
        assert!(priority(&clean) > priority(&dirty));
    }

    #[test]
    fn fallible_priority_aborts_whole_call() {
        let records = vec![
            test_record("ok", (2020, 1, 1), "R", ""),
            test_record("bad", (2020, 1, 2), "R", ""),
        ];
        let result = subsample_with(
            &records,
            |r| Ok(r.region.clone()),
            10,
            |r| {
                if r.strain == "bad" {
                    Err(SubsampleError::Priority {
                        strain: r.strain.clone(),
                        reason: "unparseable".to_string(),
                    })
                } else {
                    Ok(1.0)
                }
            },
        );
        assert!(result.is_err());
    }
}
