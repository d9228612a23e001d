//! Sequence corpus handling.
//!
//! Defines the immutable per-strain sequence record (nucleotide sequence,
//! collection date, geographic attributes, per-gene translations) and the
//! corpus container the pipeline filters and subsamples before handing off
//! to the external alignment/tree-building steps.

pub mod subsample;

use chrono::NaiveDate;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// IUPAC ambiguity codes counted against a record's sampling priority.
pub const AMBIGUOUS_NUCLEOTIDES: &[u8] = b"NRWYMKSHBVD";

/// One strain's sequence plus the metadata the pipeline keys on.
///
/// Records are created once at load time and treated as read-only
/// thereafter; derived quantities (priority scores, categories) are
/// computed on demand and never written back.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequenceRecord {
    /// Strain name, e.g. `A/HongKong/4801/2014`.
    pub strain: String,
    /// Collection date.
    pub date: NaiveDate,
    pub region: String,
    pub country: String,
    pub city: String,
    /// Raw nucleotide sequence.
    pub sequence: String,
    /// Translated peptide per gene, in the lineage's gene order.
    pub translations: IndexMap<String, String>,
}

impl SequenceRecord {
    /// Count of ambiguous / non-canonical nucleotide symbols.
    pub fn ambiguous_nucleotides(&self) -> usize {
        self.sequence
            .bytes()
            .filter(|b| AMBIGUOUS_NUCLEOTIDES.contains(&b.to_ascii_uppercase()))
            .count()
    }

    /// Translation for `gene`, empty if the gene is absent.
    pub fn translation(&self, gene: &str) -> &str {
        self.translations.get(gene).map(String::as_str).unwrap_or("")
    }
}

/// The full sequence corpus, in load order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SequenceCorpus {
    records: Vec<SequenceRecord>,
}

impl SequenceCorpus {
    pub fn new(records: Vec<SequenceRecord>) -> Self {
        SequenceCorpus { records }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[SequenceRecord] {
        &self.records
    }

    pub fn iter(&self) -> std::slice::Iter<'_, SequenceRecord> {
        self.records.iter()
    }

    /// Keep only records collected in `[start, end)`.
    pub fn filter_dates(&mut self, start: NaiveDate, end: NaiveDate) {
        self.records.retain(|r| r.date >= start && r.date < end);
    }

    /// Remove records whose strain name appears in `dropped`.
    pub fn drop_strains(&mut self, dropped: &[String]) {
        self.records
            .retain(|r| !dropped.iter().any(|d| d == &r.strain));
    }

    /// Keep only the given strains (used after subsampling).
    pub fn retain_strains(&mut self, keep: &std::collections::HashSet<String>) {
        self.records.retain(|r| keep.contains(&r.strain));
    }
}

#[cfg(test)]
pub(crate) fn test_record(strain: &str, date: (i32, u32, u32), region: &str, seq: &str) -> SequenceRecord {
    SequenceRecord {
        strain: strain.to_string(),
        date: NaiveDate::from_ymd_opt(date.0, date.1, date.2).unwrap(),
        region: region.to_string(),
        country: String::new(),
        city: String::new(),
        sequence: seq.to_string(),
        translations: IndexMap::new(),
    }
}
