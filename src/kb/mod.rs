pub mod embed;
pub mod ingest;
pub mod types;

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use cnidarium::{StateRead, Storage};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use embed::{cosine_similarity, Embedder};
use types::{KbStats, RetrievalResult, SearchFilters, StoredChunk};

// Key prefixes (no trailing slashes — cnidarium convention)
const CHUNK_PREFIX: &str = "kb/chunk";
const META_PREFIX: &str = "kb/meta";

fn chunk_key(id: &str) -> String {
    format!("{}/{}", CHUNK_PREFIX, id)
}
fn store_meta_key() -> String {
    format!("{}/store", META_PREFIX)
}

/// Store-level bookkeeping persisted next to the chunks.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoreMeta {
    embedding_model: String,
    dimensions: usize,
    next_seq: u64,
}

/// In-memory mirror of the persisted chunks, in ingestion order.
#[derive(Default)]
pub(crate) struct Index {
    entries: Vec<StoredChunk>,
    by_id: HashMap<String, usize>,
    next_seq: u64,
}

/// Persistent chunk store with cosine-similarity search.
///
/// Reads may run concurrently; ingestion takes the index write lock for the
/// whole call and is not expected to overlap with serving.
pub struct KnowledgeBase {
    storage: Storage,
    embedder: Arc<dyn Embedder>,
    pub(crate) index: RwLock<Index>,
}

impl KnowledgeBase {
    pub async fn open(data_dir: &Path, embedder: Arc<dyn Embedder>) -> Result<Self> {
        std::fs::create_dir_all(data_dir)
            .with_context(|| format!("creating knowledge base dir {:?}", data_dir))?;
        let prefixes = vec![CHUNK_PREFIX.to_string(), META_PREFIX.to_string()];
        let storage = Storage::load(data_dir.to_path_buf(), prefixes)
            .await
            .context("Failed to init cnidarium storage")?;

        let snapshot = storage.latest_snapshot();
        let meta: Option<StoreMeta> = match snapshot.get_raw(&store_meta_key()).await? {
            Some(bytes) => Some(serde_json::from_slice(&bytes).context("decode store meta")?),
            None => None,
        };
        if let Some(meta) = &meta {
            if meta.embedding_model != embedder.model_id() || meta.dimensions != embedder.dimensions() {
                warn!(
                    stored = %meta.embedding_model,
                    configured = %embedder.model_id(),
                    "embedding model differs from the one used at ingestion; scores may be meaningless"
                );
            }
        }

        let mut entries = Vec::new();
        let mut stream = snapshot.prefix_raw(CHUNK_PREFIX);
        while let Some(entry) = stream.next().await {
            match entry {
                Ok((key, value)) => match serde_json::from_slice::<StoredChunk>(&value) {
                    Ok(stored) => entries.push(stored),
                    Err(e) => warn!(key = %key, "skipping undecodable chunk: {}", e),
                },
                Err(e) => warn!("Error reading chunk stream: {}", e),
            }
        }
        entries.sort_by_key(|e| e.seq);

        let by_id = entries
            .iter()
            .enumerate()
            .map(|(i, e)| (e.id.clone(), i))
            .collect();
        let next_seq = meta
            .map(|m| m.next_seq)
            .unwrap_or(0)
            .max(entries.last().map(|e| e.seq + 1).unwrap_or(0));

        info!(
            dir = ?data_dir,
            chunks = entries.len(),
            model = %embedder.model_id(),
            "knowledge base opened"
        );

        Ok(Self {
            storage,
            embedder,
            index: RwLock::new(Index {
                entries,
                by_id,
                next_seq,
            }),
        })
    }

    /// Top `top_k` chunks by cosine similarity, best first. Ties keep ingestion order.
    /// An empty store (or `top_k == 0`) yields an empty list.
    pub async fn search(
        &self,
        query: &str,
        top_k: usize,
        filters: &SearchFilters,
    ) -> Result<Vec<RetrievalResult>> {
        let index = self.index.read().await;
        if index.entries.is_empty() || top_k == 0 {
            return Ok(vec![]);
        }

        let query_vec = self.embedder.embed(query);
        let mut scored: Vec<(f64, &StoredChunk)> = index
            .entries
            .iter()
            .filter(|e| filters.matches(&e.chunk))
            .map(|e| (cosine_similarity(&query_vec, &e.embedding), e))
            .collect();
        scored.sort_by(|a, b| b.0.total_cmp(&a.0).then(a.1.seq.cmp(&b.1.seq)));
        scored.truncate(top_k);

        let results: Vec<RetrievalResult> = scored
            .into_iter()
            .map(|(similarity, stored)| {
                let distance = (1.0 - similarity).clamp(0.0, 2.0);
                RetrievalResult {
                    chunk_id: stored.id.clone(),
                    citation: stored.chunk.citation(),
                    chunk: stored.chunk.clone(),
                    relevance_score: relevance_from_distance(distance),
                    distance,
                }
            })
            .collect();

        debug!(
            query_len = query.len(),
            top_k,
            returned = results.len(),
            best = results.first().map(|r| r.relevance_score).unwrap_or(0.0),
            "knowledge base search"
        );
        Ok(results)
    }

    pub async fn stats(&self) -> KbStats {
        let index = self.index.read().await;
        let mut stats = KbStats {
            total_chunks: index.entries.len(),
            ..Default::default()
        };
        for entry in &index.entries {
            *stats
                .by_kind
                .entry(entry.chunk.kind.as_str().to_string())
                .or_insert(0) += 1;
        }
        stats
    }

    /// Close the underlying store so the directory can be opened again.
    pub async fn release(self) {
        info!(chunks = self.index.read().await.entries.len(), "knowledge base released");
        self.storage.release().await;
    }

    pub async fn get(&self, id: &str) -> Option<StoredChunk> {
        let index = self.index.read().await;
        index.by_id.get(id).map(|&i| index.entries[i].clone())
    }
}

/// `(1 - distance / 2) * 100`, rounded to one decimal. Cosine distance spans [0, 2].
pub fn relevance_from_distance(distance: f64) -> f64 {
    let normalized = (distance / 2.0).clamp(0.0, 1.0);
    ((1.0 - normalized) * 1000.0).round() / 10.0
}
