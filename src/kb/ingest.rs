use anyhow::{Context, Result};
use cnidarium::{StateDelta, StateWrite};
use tracing::{debug, info, warn};

use super::types::{Chunk, IngestReport, StoredChunk};
use super::{chunk_key, store_meta_key, KnowledgeBase, StoreMeta};

/// Upsert batch size; each batch is one committed delta.
pub const INGEST_BATCH_SIZE: usize = 100;
/// Soft bound on chunk length; longer chunks are stored but reported.
pub const MAX_CHUNK_WORDS: usize = 400;

enum Planned {
    Insert(StoredChunk),
    Replace(usize, StoredChunk),
}

impl KnowledgeBase {
    /// Upsert chunks under their stable IDs. Idempotent: identical content at an
    /// existing ID is skipped, so re-ingestion never duplicates vectors.
    pub async fn ingest_chunks(&self, chunks: &[Chunk]) -> Result<IngestReport> {
        let mut report = IngestReport::default();
        if chunks.is_empty() {
            return Ok(report);
        }

        let mut index = self.index.write().await;

        for (batch_no, batch) in chunks.chunks(INGEST_BATCH_SIZE).enumerate() {
            let mut planned: Vec<Planned> = Vec::with_capacity(batch.len());
            let mut next_seq = index.next_seq;

            for chunk in batch {
                let id = chunk.id();
                let content_hash = blake3::hash(chunk.text.as_bytes()).to_hex().to_string();

                let words = chunk.text.split_whitespace().count();
                if words > MAX_CHUNK_WORDS {
                    warn!(chunk_id = %id, words, "chunk exceeds the word bound");
                }

                // Earlier entries of this same batch shadow the index.
                let pending = planned.iter().position(|p| match p {
                    Planned::Insert(s) | Planned::Replace(_, s) => s.id == id,
                });
                if let Some(pos) = pending {
                    let existing = match &planned[pos] {
                        Planned::Insert(s) | Planned::Replace(_, s) => s,
                    };
                    if existing.content_hash == content_hash {
                        report.unchanged += 1;
                        continue;
                    }
                    let seq = existing.seq;
                    let stored = self.make_stored(id, chunk, content_hash, seq);
                    match &mut planned[pos] {
                        Planned::Insert(s) | Planned::Replace(_, s) => *s = stored,
                    }
                    report.replaced += 1;
                    continue;
                }

                match index.by_id.get(&id).copied() {
                    Some(pos) if index.entries[pos].content_hash == content_hash => {
                        report.unchanged += 1;
                    }
                    Some(pos) => {
                        warn!(chunk_id = %id, "chunk content changed; replacing in place");
                        let seq = index.entries[pos].seq;
                        planned.push(Planned::Replace(
                            pos,
                            self.make_stored(id, chunk, content_hash, seq),
                        ));
                        report.replaced += 1;
                    }
                    None => {
                        planned.push(Planned::Insert(self.make_stored(
                            id,
                            chunk,
                            content_hash,
                            next_seq,
                        )));
                        next_seq += 1;
                        report.inserted += 1;
                    }
                }
            }

            if planned.is_empty() {
                debug!(batch_no, "batch unchanged, nothing to commit");
                continue;
            }

            let snapshot = self.storage.latest_snapshot();
            let mut delta = StateDelta::new(snapshot);
            for p in &planned {
                let stored = match p {
                    Planned::Insert(s) | Planned::Replace(_, s) => s,
                };
                delta.put_raw(
                    chunk_key(&stored.id),
                    serde_json::to_vec(stored).context("serialize chunk")?,
                );
            }
            let meta = StoreMeta {
                embedding_model: self.embedder.model_id().to_string(),
                dimensions: self.embedder.dimensions(),
                next_seq,
            };
            delta.put_raw(
                store_meta_key(),
                serde_json::to_vec(&meta).context("serialize store meta")?,
            );
            self.storage
                .commit(delta)
                .await
                .context("commit chunk batch")?;

            // Mirror into memory only after the batch is durable.
            for p in planned {
                match p {
                    Planned::Insert(stored) => {
                        let pos = index.entries.len();
                        index.by_id.insert(stored.id.clone(), pos);
                        index.entries.push(stored);
                    }
                    Planned::Replace(pos, stored) => index.entries[pos] = stored,
                }
            }
            index.next_seq = next_seq;
            debug!(batch_no, size = batch.len(), "chunk batch committed");
        }

        info!(
            inserted = report.inserted,
            replaced = report.replaced,
            unchanged = report.unchanged,
            total = index.entries.len(),
            "chunks ingested"
        );
        Ok(report)
    }

    fn make_stored(&self, id: String, chunk: &Chunk, content_hash: String, seq: u64) -> StoredChunk {
        StoredChunk {
            id,
            embedding: self.embedder.embed(&chunk.text),
            chunk: chunk.clone(),
            content_hash,
            seq,
        }
    }
}
