use crate::core::error::{Error, Result};
use crate::core::sync::lock;
use redb::{Database, ReadableTable, TableDefinition, TableError};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, Weak};
use tracing::{debug, info};

/// Name of the collection holding indexed document chunks
pub const COLLECTION_NAME: &str = "documents";

/// File inside `index_location` holding the database
const DB_FILE_NAME: &str = "index.redb";

fn collection(name: &str) -> TableDefinition<'_, &'static str, &'static str> {
    TableDefinition::new(name)
}

/// An embedded document chunk
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorEntry {
    /// Source file path
    pub source: String,
    /// Chunk index within the file
    pub chunk_index: usize,
    /// The embedding vector
    pub embedding: Vec<f32>,
    /// Text content of the chunk
    pub text: String,
    /// Context (e.g., "Document > Section")
    pub context: String,
}

impl VectorEntry {
    pub fn new(
        source: String,
        chunk_index: usize,
        embedding: Vec<f32>,
        text: String,
        context: String,
    ) -> Self {
        Self {
            source,
            chunk_index,
            embedding,
            text,
            context,
        }
    }

    /// Unique key of this chunk within a collection
    pub fn chunk_id(&self) -> String {
        format!("{}:{}", self.source, self.chunk_index)
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self)
            .map_err(|e| Error::Database(format!("Failed to serialize vector entry: {}", e)))
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| Error::Database(format!("Failed to deserialize vector entry: {}", e)))
    }
}

/// An entry returned by a similarity query
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredEntry {
    pub entry: VectorEntry,
    /// Cosine similarity to the query vector
    pub score: f32,
}

/// Stores embedded chunks in named collections and answers similarity queries.
pub trait VectorIndex: Send + Sync {
    /// Insert or replace entries, creating the collection if needed.
    fn upsert(&self, collection: &str, entries: &[VectorEntry]) -> Result<()>;

    /// Number of entries; zero for a missing collection.
    fn count(&self, collection: &str) -> Result<usize>;

    fn has_collection(&self, collection: &str) -> Result<bool>;

    /// Returns whether the collection existed.
    fn delete_collection(&self, collection: &str) -> Result<bool>;

    /// Up to `k` entries ordered by descending similarity.
    fn similarity_query(&self, collection: &str, query: &[f32], k: usize)
        -> Result<Vec<ScoredEntry>>;
}

/// Vector index persisted in a redb database
pub struct RedbVectorIndex {
    db: Database,
    location: PathBuf,
}

impl RedbVectorIndex {
    /// Whether an index database exists at `location`
    pub fn exists(location: &Path) -> bool {
        location.join(DB_FILE_NAME).is_file()
    }

    /// Open or create the index database inside the `location` directory
    pub fn open(location: &Path) -> Result<Self> {
        std::fs::create_dir_all(location)?;
        let db_path = location.join(DB_FILE_NAME);

        let db = if db_path.exists() {
            Database::open(&db_path).map_err(|e| {
                let msg = e.to_string();
                if msg.to_lowercase().contains("lock") || msg.to_lowercase().contains("already open") {
                    Error::Database("Vector database is locked. Another alphageist process may be running. Close other instances and try again.".to_string())
                } else {
                    Error::Database(format!("Failed to open vector database: {}", e))
                }
            })?
        } else {
            Database::create(&db_path)
                .map_err(|e| Error::Database(format!("Failed to create vector database: {}", e)))?
        };

        info!("Opened vector index at {}", db_path.display());
        Ok(Self {
            db,
            location: location.to_path_buf(),
        })
    }

    pub fn location(&self) -> &Path {
        &self.location
    }
}

impl VectorIndex for RedbVectorIndex {
    fn upsert(&self, name: &str, entries: &[VectorEntry]) -> Result<()> {
        let write_txn = self.db.begin_write().map_err(|e| {
            Error::Database(format!("Failed to begin write transaction: {}", e))
        })?;

        {
            let mut table = write_txn.open_table(collection(name)).map_err(|e| {
                Error::Database(format!("Failed to open table: {}", e))
            })?;

            for entry in entries {
                let chunk_id = entry.chunk_id();
                let json_str = entry.to_json()?;
                table.insert(chunk_id.as_str(), json_str.as_str()).map_err(|e| {
                    Error::Database(format!("Failed to insert vector entry: {}", e))
                })?;
            }
        }

        write_txn.commit().map_err(|e| {
            Error::Database(format!("Failed to commit transaction: {}", e))
        })?;

        debug!("Upserted {} entries into '{}'", entries.len(), name);
        Ok(())
    }

    fn count(&self, name: &str) -> Result<usize> {
        let read_txn = self.db.begin_read().map_err(|e| {
            Error::Database(format!("Failed to begin read transaction: {}", e))
        })?;

        let table = match read_txn.open_table(collection(name)) {
            Ok(table) => table,
            Err(TableError::TableDoesNotExist(_)) => return Ok(0),
            Err(e) => return Err(Error::Database(format!("Failed to open table: {}", e))),
        };

        let len = table
            .len()
            .map_err(|e| Error::Database(format!("Failed to count entries: {}", e)))?;
        Ok(len as usize)
    }

    fn has_collection(&self, name: &str) -> Result<bool> {
        let read_txn = self.db.begin_read().map_err(|e| {
            Error::Database(format!("Failed to begin read transaction: {}", e))
        })?;

        let exists = match read_txn.open_table(collection(name)) {
            Ok(_) => true,
            Err(TableError::TableDoesNotExist(_)) => false,
            Err(e) => return Err(Error::Database(format!("Failed to open table: {}", e))),
        };
        Ok(exists)
    }

    fn delete_collection(&self, name: &str) -> Result<bool> {
        let write_txn = self.db.begin_write().map_err(|e| {
            Error::Database(format!("Failed to begin write transaction: {}", e))
        })?;

        let existed = write_txn.delete_table(collection(name)).map_err(|e| {
            Error::Database(format!("Failed to delete table: {}", e))
        })?;

        write_txn.commit().map_err(|e| {
            Error::Database(format!("Failed to commit transaction: {}", e))
        })?;

        if existed {
            info!("Deleted collection '{}' from {}", name, self.location.display());
        }
        Ok(existed)
    }

    /// Uses a min-heap to keep the top K results without storing all vectors
    fn similarity_query(&self, name: &str, query: &[f32], k: usize) -> Result<Vec<ScoredEntry>> {
        if k == 0 {
            return Ok(Vec::new());
        }

        let read_txn = self.db.begin_read().map_err(|e| {
            Error::Database(format!("Failed to begin read transaction: {}", e))
        })?;

        let table = match read_txn.open_table(collection(name)) {
            Ok(table) => table,
            Err(TableError::TableDoesNotExist(_)) => return Ok(Vec::new()),
            Err(e) => return Err(Error::Database(format!("Failed to open table: {}", e))),
        };

        // Min-heap (via reversed ordering): smallest similarity at the top
        let mut heap: BinaryHeap<SimilarityEntry> = BinaryHeap::with_capacity(k + 1);

        for item in table.iter().map_err(|e| {
            Error::Database(format!("Failed to iterate table: {}", e))
        })? {
            let (_key, value) = item.map_err(|e| {
                Error::Database(format!("Failed to read table item: {}", e))
            })?;
            let entry = VectorEntry::from_json(value.value())?;
            let similarity = cosine_similarity(query, &entry.embedding);

            heap.push(SimilarityEntry(entry, similarity));
            if heap.len() > k {
                heap.pop();
            }
        }

        let mut results: Vec<ScoredEntry> = heap
            .into_iter()
            .map(|se| ScoredEntry {
                entry: se.0,
                score: se.1,
            })
            .collect();
        results.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));

        Ok(results)
    }
}

/// Shares open index handles by location.
///
/// redb allows a single open handle per database file, so everything that
/// attaches to an index location goes through one pool. A handle stays
/// cached only while something still holds it.
#[derive(Default)]
pub struct IndexPool {
    open: Mutex<HashMap<PathBuf, Weak<RedbVectorIndex>>>,
}

impl IndexPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open(&self, location: &Path) -> Result<Arc<RedbVectorIndex>> {
        std::fs::create_dir_all(location)?;
        let key = location
            .canonicalize()
            .unwrap_or_else(|_| location.to_path_buf());

        let mut open = lock(&self.open);
        if let Some(index) = open.get(&key).and_then(Weak::upgrade) {
            return Ok(index);
        }

        let index = Arc::new(RedbVectorIndex::open(location)?);
        open.retain(|_, handle| handle.strong_count() > 0);
        open.insert(key, Arc::downgrade(&index));
        Ok(index)
    }
}

/// Helper struct for maintaining top-K search results using a min-heap
struct SimilarityEntry(VectorEntry, f32);

impl PartialEq for SimilarityEntry {
    fn eq(&self, other: &Self) -> bool {
        self.1 == other.1
    }
}

impl Eq for SimilarityEntry {}

impl PartialOrd for SimilarityEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SimilarityEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed so BinaryHeap (a max-heap) pops the lowest similarity first
        other.1.partial_cmp(&self.1).unwrap_or(Ordering::Equal)
    }
}

/// Calculate cosine similarity between two vectors
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }

    let dot_product: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot_product / (norm_a * norm_b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn entry(source: &str, chunk_index: usize, embedding: Vec<f32>) -> VectorEntry {
        VectorEntry::new(
            source.to_string(),
            chunk_index,
            embedding,
            format!("{} chunk {}", source, chunk_index),
            "Context".to_string(),
        )
    }

    #[test]
    fn test_cosine_similarity() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 0.001);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 0.001);
        assert!(cosine_similarity(&[1.0, -1.0], &[-1.0, 1.0]) < 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[0.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[1.0, 0.0, 1.0]), 0.0);
    }

    #[test]
    fn test_chunk_id() {
        assert_eq!(entry("docs/a.md", 42, vec![1.0]).chunk_id(), "docs/a.md:42");
    }

    #[test]
    fn test_missing_collection() {
        let temp_dir = TempDir::new().unwrap();
        assert!(!RedbVectorIndex::exists(temp_dir.path()));

        let index = RedbVectorIndex::open(temp_dir.path()).unwrap();
        assert!(RedbVectorIndex::exists(temp_dir.path()));
        assert!(!index.has_collection(COLLECTION_NAME).unwrap());
        assert_eq!(index.count(COLLECTION_NAME).unwrap(), 0);
        assert!(index.similarity_query(COLLECTION_NAME, &[1.0], 3).unwrap().is_empty());
        assert!(!index.delete_collection(COLLECTION_NAME).unwrap());
    }

    #[test]
    fn test_upsert_count_and_delete() {
        let temp_dir = TempDir::new().unwrap();
        let index = RedbVectorIndex::open(temp_dir.path()).unwrap();

        let entries: Vec<VectorEntry> = (0..5).map(|i| entry("a.md", i, vec![0.1, 0.2])).collect();
        index.upsert(COLLECTION_NAME, &entries).unwrap();
        // Same ids replace rather than duplicate
        index.upsert(COLLECTION_NAME, &entries[..2]).unwrap();

        assert!(index.has_collection(COLLECTION_NAME).unwrap());
        assert_eq!(index.count(COLLECTION_NAME).unwrap(), 5);
        assert_eq!(index.count("other").unwrap(), 0);

        assert!(index.delete_collection(COLLECTION_NAME).unwrap());
        assert!(!index.has_collection(COLLECTION_NAME).unwrap());
        assert_eq!(index.count(COLLECTION_NAME).unwrap(), 0);
    }

    #[test]
    fn test_similarity_query_ranks_by_score() {
        let temp_dir = TempDir::new().unwrap();
        let index = RedbVectorIndex::open(temp_dir.path()).unwrap();

        index
            .upsert(
                COLLECTION_NAME,
                &[
                    entry("different.md", 0, vec![0.0, 1.0, 0.0]),
                    entry("similar.md", 0, vec![1.0, 0.0, 0.0]),
                    entry("partial.md", 0, vec![1.0, 1.0, 0.0]),
                ],
            )
            .unwrap();

        let results = index
            .similarity_query(COLLECTION_NAME, &[1.0, 0.0, 0.0], 2)
            .unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].entry.source, "similar.md");
        assert_eq!(results[1].entry.source, "partial.md");
        assert!(results[0].score > results[1].score);
    }

    #[test]
    fn test_data_persists_across_reopen() {
        let temp_dir = TempDir::new().unwrap();
        {
            let index = RedbVectorIndex::open(temp_dir.path()).unwrap();
            index.upsert(COLLECTION_NAME, &[entry("a.md", 0, vec![1.0])]).unwrap();
        }
        let index = RedbVectorIndex::open(temp_dir.path()).unwrap();
        assert_eq!(index.count(COLLECTION_NAME).unwrap(), 1);
    }

    #[test]
    fn test_pool_shares_open_handles() {
        let temp_dir = TempDir::new().unwrap();
        let pool = IndexPool::new();

        let first = pool.open(temp_dir.path()).unwrap();
        let second = pool.open(temp_dir.path()).unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        drop(first);
        drop(second);
        // Released handles are reopened rather than reused
        let third = pool.open(temp_dir.path()).unwrap();
        assert_eq!(third.count(COLLECTION_NAME).unwrap(), 0);
    }
}
