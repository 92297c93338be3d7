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

//! Content-addressed on-disk store of compressed anchor and delta payloads.
//!
//! Blobs live under `objects/<first-2-hex>/<rest-62-hex>` named by the
//! *content* hash (the hash of the decompressed canonical bytes, not of the
//! file). The file format is a 1-byte kind tag, the little-endian u64
//! decompressed size, a 32-byte anchor hash (zeroed for anchors), and a
//! Zstandard frame to EOF.

use std::fs;
use std::io::Write as _;
use std::path::Path;
use std::path::PathBuf;

use tempfile::NamedTempFile;
use thiserror::Error;

use crate::commit::ContentId;
use crate::commit::ID_LENGTH;
use crate::file_util::persist_content_addressed_temp_file;
use crate::object_id::ObjectId as _;

const KIND_ANCHOR: u8 = 0x01;
const KIND_DELTA: u8 = 0x02;
const HEADER_LEN: usize = 1 + 8 + ID_LENGTH;

/// How a stored payload is compressed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlobKind {
    /// A self-contained Zstandard frame.
    Anchor,
    /// A Zstandard frame whose dictionary is its anchor's decompressed bytes.
    Delta,
}

/// One record in the blob store.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoredBlob {
    pub kind: BlobKind,
    pub decompressed_size: u64,
    /// The anchor this delta chains to. Always `None` for anchors.
    pub anchor: Option<ContentId>,
    pub compressed: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum BlobStoreError {
    #[error("Blob {hash} not found")]
    NotFound { hash: String },
    #[error("Blob {hash} is malformed: {reason}")]
    Malformed { hash: String, reason: String },
    #[error("Blob store I/O error at {path}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

pub type BlobStoreResult<T> = Result<T, BlobStoreError>;

#[derive(Debug)]
pub struct BlobStore {
    objects_dir: PathBuf,
}

impl BlobStore {
    /// Creates the objects directory if needed and opens the store.
    pub fn init(objects_dir: &Path) -> BlobStoreResult<Self> {
        fs::create_dir_all(objects_dir).map_err(|err| BlobStoreError::Io {
            path: objects_dir.to_path_buf(),
            source: err,
        })?;
        Ok(Self::load(objects_dir))
    }

    pub fn load(objects_dir: &Path) -> Self {
        Self {
            objects_dir: objects_dir.to_path_buf(),
        }
    }

    fn blob_path(&self, id: &ContentId) -> PathBuf {
        let hex = id.hex();
        self.objects_dir.join(&hex[..2]).join(&hex[2..])
    }

    fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> BlobStoreError + '_ {
        move |err| BlobStoreError::Io {
            path: path.to_path_buf(),
            source: err,
        }
    }

    /// Writes a blob under its content hash. Idempotent: writing the same
    /// hash twice is a no-op (the bytes are identical by construction), and
    /// concurrent writers of one hash are safe because the final rename is
    /// atomic.
    pub fn put(&self, id: &ContentId, blob: &StoredBlob) -> BlobStoreResult<()> {
        let path = self.blob_path(id);
        if path.exists() {
            return Ok(());
        }
        let shard = path.parent().unwrap();
        fs::create_dir_all(shard).map_err(Self::io_err(shard))?;

        let mut temp_file = NamedTempFile::new_in(shard).map_err(Self::io_err(shard))?;
        temp_file
            .write_all(&encode_header(blob))
            .and_then(|()| temp_file.write_all(&blob.compressed))
            .map_err(Self::io_err(&path))?;
        persist_content_addressed_temp_file(temp_file, &path).map_err(Self::io_err(&path))?;
        Ok(())
    }

    pub fn get(&self, id: &ContentId) -> BlobStoreResult<StoredBlob> {
        let path = self.blob_path(id);
        let data = match fs::read(&path) {
            Ok(data) => data,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(BlobStoreError::NotFound { hash: id.hex() });
            }
            Err(err) => return Err(Self::io_err(&path)(err)),
        };
        decode_record(id, &data)
    }

    pub fn has(&self, id: &ContentId) -> bool {
        self.blob_path(id).exists()
    }

    /// Removes a blob file. Used to abort failed writes and to sweep
    /// orphans. A missing file is fine.
    pub fn remove(&self, id: &ContentId) -> BlobStoreResult<()> {
        let path = self.blob_path(id);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(Self::io_err(&path)(err)),
        }
    }

    /// Walks every stored blob. The walk is lazy; blobs written or removed
    /// mid-iteration may or may not be observed.
    pub fn iter(&self) -> impl Iterator<Item = BlobStoreResult<(ContentId, StoredBlob)>> + '_ {
        let shards = fs::read_dir(&self.objects_dir)
            .map(|entries| entries.collect::<Vec<_>>())
            .unwrap_or_default();
        shards.into_iter().flat_map(move |shard| {
            let shard = match shard {
                Ok(shard) => shard,
                Err(err) => {
                    return vec![Err(Self::io_err(&self.objects_dir)(err))];
                }
            };
            let shard_name = shard.file_name().to_string_lossy().into_owned();
            let entries = match fs::read_dir(shard.path()) {
                Ok(entries) => entries,
                Err(err) => return vec![Err(Self::io_err(&shard.path())(err))],
            };
            entries
                .filter_map(|entry| {
                    let entry = entry.ok()?;
                    let name = entry.file_name().to_string_lossy().into_owned();
                    let id = ContentId::try_from_hex(format!("{shard_name}{name}"))?;
                    Some(self.get(&id).map(|blob| (id, blob)))
                })
                .collect::<Vec<_>>()
        })
    }
}

fn encode_header(blob: &StoredBlob) -> Vec<u8> {
    let mut header = Vec::with_capacity(HEADER_LEN);
    header.push(match blob.kind {
        BlobKind::Anchor => KIND_ANCHOR,
        BlobKind::Delta => KIND_DELTA,
    });
    header.extend_from_slice(&blob.decompressed_size.to_le_bytes());
    match &blob.anchor {
        Some(anchor) => header.extend_from_slice(anchor.as_bytes()),
        None => header.extend_from_slice(&[0; ID_LENGTH]),
    }
    header
}

fn decode_record(id: &ContentId, data: &[u8]) -> BlobStoreResult<StoredBlob> {
    let malformed = |reason: &str| BlobStoreError::Malformed {
        hash: id.hex(),
        reason: reason.to_string(),
    };
    if data.len() < HEADER_LEN {
        return Err(malformed("file shorter than the blob header"));
    }
    let kind = match data[0] {
        KIND_ANCHOR => BlobKind::Anchor,
        KIND_DELTA => BlobKind::Delta,
        _ => return Err(malformed("unknown kind tag")),
    };
    let decompressed_size = u64::from_le_bytes(data[1..9].try_into().unwrap());
    let anchor_bytes = &data[9..HEADER_LEN];
    let anchor = match kind {
        BlobKind::Anchor => {
            if anchor_bytes.iter().any(|&b| b != 0) {
                return Err(malformed("anchor blob carries a non-zero anchor hash"));
            }
            None
        }
        BlobKind::Delta => Some(ContentId::from_bytes(anchor_bytes)),
    };
    Ok(StoredBlob {
        kind,
        decompressed_size,
        anchor,
        compressed: data[HEADER_LEN..].to_vec(),
    })
}
