use crate::core::error::Result;
use crate::storage::vectors::{ScoredEntry, VectorIndex};
use std::cmp::Ordering;
use std::sync::Arc;

/// Number of chunks handed to the language model
pub const DEFAULT_K: usize = 4;

/// An index together with the collection to search in it
#[derive(Clone)]
pub struct IndexSource {
    pub index: Arc<dyn VectorIndex>,
    pub collection: String,
}

impl IndexSource {
    pub fn new(index: Arc<dyn VectorIndex>, collection: impl Into<String>) -> Self {
        Self {
            index,
            collection: collection.into(),
        }
    }
}

/// Merges results from several indexes and re-ranks them by score.
///
/// Each source is asked for `k` results. Results are concatenated in source
/// order, then stable-sorted by descending score, so equal scores keep the
/// order in which they arrived.
pub struct MultiIndexRetriever {
    sources: Vec<IndexSource>,
    k: usize,
}

impl MultiIndexRetriever {
    pub fn new(sources: Vec<IndexSource>) -> Self {
        Self { sources, k: DEFAULT_K }
    }

    pub fn with_k(mut self, k: usize) -> Self {
        self.k = k;
        self
    }

    pub fn k(&self) -> usize {
        self.k
    }

    pub fn retrieve(&self, query_embedding: &[f32]) -> Result<Vec<ScoredEntry>> {
        let mut scored = Vec::new();
        for source in &self.sources {
            let results = source
                .index
                .similarity_query(&source.collection, query_embedding, self.k)?;
            scored.extend(results);
        }
        Ok(merge_ranked(scored, self.k))
    }
}

/// Stable sort by descending score, then keep the first `k`
pub fn merge_ranked(mut scored: Vec<ScoredEntry>, k: usize) -> Vec<ScoredEntry> {
    scored.retain(|s| s.score.is_finite());
    scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));
    scored.truncate(k);
    scored
}
