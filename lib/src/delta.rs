// Copyright 2025 The CVC Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

#![expect(missing_docs)]

//! Anchor/delta encoding over the blob store.
//!
//! At write time the engine decides between a self-contained *anchor* frame
//! and a *delta* frame dictionary-compressed against the nearest anchor's
//! decompressed bytes. Deltas reference their anchor directly, so
//! reconstruction is one dictionary decompression, never a replay of
//! intermediate deltas. Every write is verified by reconstructing and
//! re-hashing before it is considered durable.

use std::io;

use thiserror::Error;
use tracing::debug;

use crate::blob_store::BlobKind;
use crate::blob_store::BlobStore;
use crate::blob_store::BlobStoreError;
use crate::blob_store::StoredBlob;
use crate::canonical;
use crate::commit::ContentId;
use crate::config::Config;
use crate::object_id::ObjectId as _;

/// The nearest anchor reachable from a candidate commit's predecessor.
#[derive(Clone, Debug)]
pub struct AnchorRef {
    pub content_hash: ContentId,
    /// Delta commits between the predecessor and that anchor; 0 when the
    /// predecessor is the anchor itself.
    pub deltas_since: usize,
}

#[derive(Debug, Error)]
pub enum DeltaError {
    #[error(transparent)]
    Blob(#[from] BlobStoreError),
    #[error("Zstandard {op} failed for blob {hash}")]
    Zstd {
        op: &'static str,
        hash: String,
        source: io::Error,
    },
    #[error("Blob {hash} reconstructed with the wrong digest")]
    Integrity { hash: String },
    #[error("Delta {hash} chains to {anchor}, which is not an anchor")]
    ChainBroken { hash: String, anchor: String },
}

pub type DeltaResult<T> = Result<T, DeltaError>;

#[derive(Debug)]
pub struct DeltaEngine {
    store: BlobStore,
    anchor_interval: usize,
    delta_ratio: f64,
    delta_min_size: usize,
    zstd_level: i32,
}

impl DeltaEngine {
    pub fn new(store: BlobStore, config: &Config) -> Self {
        Self {
            store,
            anchor_interval: config.anchor_interval.max(1),
            delta_ratio: config.delta_ratio,
            delta_min_size: config.delta_min_size,
            zstd_level: config.zstd_level,
        }
    }

    pub fn store(&self) -> &BlobStore {
        &self.store
    }

    /// Writes the canonical `bytes` of content `id`, choosing anchor or
    /// delta against the given reachable anchor. Returns the kind actually
    /// written. Idempotent: an already-stored hash keeps its original
    /// encoding.
    pub fn write(
        &self,
        id: &ContentId,
        bytes: &[u8],
        anchor: Option<&AnchorRef>,
    ) -> DeltaResult<BlobKind> {
        if self.store.has(id) {
            return Ok(self.store.get(id)?.kind);
        }

        if let Some(anchor) = anchor
            && anchor.deltas_since + 1 < self.anchor_interval
            && bytes.len() >= self.delta_min_size
        {
            let anchor_bytes = self.reconstruct_anchor(&anchor.content_hash)?;
            let compressed = self
                .compress_with_dictionary(bytes, &anchor_bytes)
                .map_err(|source| self.zstd_err("delta compression", id, source))?;
            if compressed.len() as f64 <= self.delta_ratio * anchor_bytes.len() as f64 {
                debug!(
                    hash = %id, delta_len = compressed.len(),
                    anchor = %anchor.content_hash, "writing delta blob"
                );
                return self.put_verified(
                    id,
                    StoredBlob {
                        kind: BlobKind::Delta,
                        decompressed_size: bytes.len() as u64,
                        anchor: Some(anchor.content_hash.clone()),
                        compressed,
                    },
                );
            }
            debug!(hash = %id, "delta larger than size guard, falling back to anchor");
        }

        let compressed = zstd::bulk::compress(bytes, self.zstd_level)
            .map_err(|source| self.zstd_err("anchor compression", id, source))?;
        debug!(hash = %id, compressed_len = compressed.len(), "writing anchor blob");
        self.put_verified(
            id,
            StoredBlob {
                kind: BlobKind::Anchor,
                decompressed_size: bytes.len() as u64,
                anchor: None,
                compressed,
            },
        )
    }

    /// Returns the full decompressed canonical bytes of `id`.
    pub fn reconstruct(&self, id: &ContentId) -> DeltaResult<Vec<u8>> {
        let record = self.store.get(id)?;
        match record.kind {
            BlobKind::Anchor => self.decompress(id, &record),
            BlobKind::Delta => {
                let anchor_id = record.anchor.as_ref().expect("delta record has an anchor");
                let anchor_bytes = self.reconstruct_anchor(anchor_id).map_err(|err| {
                    match err {
                        // A missing or broken anchor is a broken chain from
                        // the delta's point of view.
                        DeltaError::Blob(BlobStoreError::NotFound { .. }) => {
                            DeltaError::ChainBroken {
                                hash: id.hex(),
                                anchor: anchor_id.hex(),
                            }
                        }
                        err => err,
                    }
                })?;
                let mut decompressor = zstd::bulk::Decompressor::with_dictionary(&anchor_bytes)
                    .map_err(|source| self.zstd_err("dictionary load", id, source))?;
                decompressor
                    .decompress(&record.compressed, record.decompressed_size as usize)
                    .map_err(|source| self.zstd_err("delta decompression", id, source))
            }
        }
    }

    fn reconstruct_anchor(&self, id: &ContentId) -> DeltaResult<Vec<u8>> {
        let record = self.store.get(id)?;
        if record.kind != BlobKind::Anchor {
            return Err(DeltaError::ChainBroken {
                hash: id.hex(),
                anchor: id.hex(),
            });
        }
        self.decompress(id, &record)
    }

    fn decompress(&self, id: &ContentId, record: &StoredBlob) -> DeltaResult<Vec<u8>> {
        zstd::bulk::decompress(&record.compressed, record.decompressed_size as usize)
            .map_err(|source| self.zstd_err("decompression", id, source))
    }

    fn compress_with_dictionary(&self, bytes: &[u8], dictionary: &[u8]) -> io::Result<Vec<u8>> {
        let mut compressor =
            zstd::bulk::Compressor::with_dictionary(self.zstd_level, dictionary)?;
        compressor.compress(bytes)
    }

    // Writes the record, then proves the store can hand the bytes back with
    // the digest the file is named by. A failed proof removes the file so no
    // future read can observe it.
    fn put_verified(&self, id: &ContentId, blob: StoredBlob) -> DeltaResult<BlobKind> {
        let kind = blob.kind;
        self.store.put(id, &blob)?;
        let round_trip = self.reconstruct(id)?;
        if canonical::sha256(&round_trip).as_slice() != id.as_bytes() {
            self.store.remove(id)?;
            return Err(DeltaError::Integrity { hash: id.hex() });
        }
        Ok(kind)
    }

    fn zstd_err(&self, op: &'static str, id: &ContentId, source: io::Error) -> DeltaError {
        DeltaError::Zstd {
            op,
            hash: id.hex(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::canonical::sha256;

    fn engine_with(temp_dir: &std::path::Path, config: &Config) -> DeltaEngine {
        let store = BlobStore::init(&temp_dir.join("objects")).unwrap();
        DeltaEngine::new(store, config)
    }

    fn content_id(bytes: &[u8]) -> ContentId {
        ContentId::new(sha256(bytes).to_vec())
    }

    // Compressible but non-trivial payload, comfortably over the delta
    // minimum size.
    fn payload(tag: &str) -> Vec<u8> {
        format!("{{\"messages\":\"{}\"}}", tag.repeat(2000)).into_bytes()
    }

    #[test]
    fn test_first_write_is_anchor() {
        let temp_dir = tempfile::tempdir().unwrap();
        let engine = engine_with(temp_dir.path(), &Config::new(temp_dir.path()));
        let bytes = payload("a");
        let id = content_id(&bytes);
        assert_eq!(engine.write(&id, &bytes, None).unwrap(), BlobKind::Anchor);
        assert_eq!(engine.reconstruct(&id).unwrap(), bytes);
    }

    #[test]
    fn test_delta_against_anchor_round_trips() {
        let temp_dir = tempfile::tempdir().unwrap();
        let engine = engine_with(temp_dir.path(), &Config::new(temp_dir.path()));

        let anchor_bytes = payload("a");
        let anchor_id = content_id(&anchor_bytes);
        engine.write(&anchor_id, &anchor_bytes, None).unwrap();

        // Similar content compresses well against the anchor dictionary.
        let mut delta_bytes = payload("a");
        delta_bytes.extend_from_slice(b"trailing new turn");
        let delta_id = content_id(&delta_bytes);
        let anchor = AnchorRef {
            content_hash: anchor_id,
            deltas_since: 0,
        };
        assert_eq!(
            engine.write(&delta_id, &delta_bytes, Some(&anchor)).unwrap(),
            BlobKind::Delta
        );
        assert_eq!(engine.reconstruct(&delta_id).unwrap(), delta_bytes);
    }

    #[test]
    fn test_small_payload_never_deltas() {
        let temp_dir = tempfile::tempdir().unwrap();
        let engine = engine_with(temp_dir.path(), &Config::new(temp_dir.path()));

        let anchor_bytes = payload("a");
        let anchor_id = content_id(&anchor_bytes);
        engine.write(&anchor_id, &anchor_bytes, None).unwrap();

        let small = b"{\"messages\":[]}".to_vec();
        let small_id = content_id(&small);
        let anchor = AnchorRef {
            content_hash: anchor_id,
            deltas_since: 0,
        };
        assert_eq!(
            engine.write(&small_id, &small, Some(&anchor)).unwrap(),
            BlobKind::Anchor
        );
    }

    #[test]
    fn test_anchor_interval_forces_anchor() {
        let temp_dir = tempfile::tempdir().unwrap();
        let mut config = Config::new(temp_dir.path());
        config.anchor_interval = 3;
        let engine = engine_with(temp_dir.path(), &config);

        let anchor_bytes = payload("a");
        let anchor_id = content_id(&anchor_bytes);
        engine.write(&anchor_id, &anchor_bytes, None).unwrap();

        let bytes = payload("ab");
        let id = content_id(&bytes);
        // Two deltas already sit between the predecessor and the anchor, so
        // the third commit in the run rolls over.
        let anchor = AnchorRef {
            content_hash: anchor_id,
            deltas_since: 2,
        };
        assert_eq!(
            engine.write(&id, &bytes, Some(&anchor)).unwrap(),
            BlobKind::Anchor
        );
    }

    #[test]
    fn test_interval_of_one_means_all_anchors() {
        let temp_dir = tempfile::tempdir().unwrap();
        let mut config = Config::new(temp_dir.path());
        config.anchor_interval = 1;
        let engine = engine_with(temp_dir.path(), &config);

        let anchor_bytes = payload("a");
        let anchor_id = content_id(&anchor_bytes);
        engine.write(&anchor_id, &anchor_bytes, None).unwrap();

        let bytes = payload("ab");
        let id = content_id(&bytes);
        let anchor = AnchorRef {
            content_hash: anchor_id,
            deltas_since: 0,
        };
        assert_eq!(
            engine.write(&id, &bytes, Some(&anchor)).unwrap(),
            BlobKind::Anchor
        );
    }

    #[test]
    fn test_broken_chain_reported() {
        let temp_dir = tempfile::tempdir().unwrap();
        let engine = engine_with(temp_dir.path(), &Config::new(temp_dir.path()));

        let bytes = payload("x");
        let id = content_id(&bytes);
        let missing_anchor = content_id(b"never stored");
        engine
            .store()
            .put(
                &id,
                &StoredBlob {
                    kind: BlobKind::Delta,
                    decompressed_size: bytes.len() as u64,
                    anchor: Some(missing_anchor),
                    compressed: b"garbage".to_vec(),
                },
            )
            .unwrap();
        assert_matches!(
            engine.reconstruct(&id),
            Err(DeltaError::ChainBroken { .. })
        );
    }
}
