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

//! The facade over the three storage tiers.
//!
//! Higher layers never touch the blob store, index, or delta engine
//! directly: every cross-tier invariant (parent existence, blob-before-row
//! ordering, head validity) is enforced here. The blob write always precedes
//! the single index transaction that records the commit row and advances the
//! branch head, so a failure anywhere leaves at worst an orphan blob and
//! never a visible inconsistency.

use std::collections::HashSet;

use thiserror::Error;
use tracing::info;
use tracing::warn;

use crate::blob_store::BlobKind;
use crate::blob_store::BlobStore;
use crate::blob_store::BlobStoreError;
use crate::canonical;
use crate::canonical::EncodingError;
use crate::commit::CognitiveCommit;
use crate::commit::CommitId;
use crate::commit::CommitMetadata;
use crate::commit::CommitType;
use crate::commit::ContentBlob;
use crate::commit::ContentId;
use crate::config::Config;
use crate::delta::AnchorRef;
use crate::delta::DeltaEngine;
use crate::delta::DeltaError;
use crate::file_util::create_or_reuse_dir;
use crate::index_db::BranchPointer;
use crate::index_db::IndexDb;
use crate::index_db::IndexError;
use crate::object_id::HexPrefix;
use crate::object_id::ObjectId as _;
use crate::object_id::PrefixResolution;
use crate::semantic::SemanticStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{kind} {name} not found")]
    NotFound { kind: &'static str, name: String },
    #[error("Branch {name} already exists")]
    BranchExists { name: String },
    #[error("Branch {branch} advanced concurrently, head is now {found}")]
    Conflict { branch: String, found: String },
    #[error("Invariant violation: {reason}")]
    InvariantViolation { reason: String },
    #[error("Blob {hash} failed integrity verification")]
    Integrity { hash: String },
    #[error("Storage I/O error")]
    Io(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Index schema version {found} is newer than supported version {supported}")]
    Schema { found: String, supported: u32 },
    #[error(transparent)]
    Encoding(#[from] EncodingError),
}

pub type StoreResult<T> = Result<T, StoreError>;

impl From<IndexError> for StoreError {
    fn from(err: IndexError) -> Self {
        match err {
            IndexError::NotFound { kind, name } => Self::NotFound { kind, name },
            IndexError::BranchExists { name } => Self::BranchExists { name },
            IndexError::HeadConflict { branch, found, .. } => Self::Conflict { branch, found },
            IndexError::SchemaVersion { found, supported } => Self::Schema { found, supported },
            IndexError::CorruptRow { context, source } => Self::InvariantViolation {
                reason: format!("unreadable index row for {context}: {source}"),
            },
            IndexError::Storage(source) => Self::Io(Box::new(source)),
        }
    }
}

impl From<BlobStoreError> for StoreError {
    fn from(err: BlobStoreError) -> Self {
        match err {
            BlobStoreError::NotFound { hash } => Self::NotFound {
                kind: "blob",
                name: hash,
            },
            BlobStoreError::Malformed { hash, .. } => Self::Integrity { hash },
            BlobStoreError::Io { source, .. } => Self::Io(Box::new(source)),
        }
    }
}

impl From<DeltaError> for StoreError {
    fn from(err: DeltaError) -> Self {
        match err {
            DeltaError::Blob(err) => err.into(),
            DeltaError::Zstd { source, .. } => Self::Io(Box::new(source)),
            DeltaError::Integrity { hash } => Self::Integrity { hash },
            DeltaError::ChainBroken { hash, anchor } => Self::InvariantViolation {
                reason: format!("delta {hash} chains to missing or non-anchor blob {anchor}"),
            },
        }
    }
}

#[derive(Debug)]
pub struct ContextDatabase {
    index: IndexDb,
    delta: DeltaEngine,
    semantic: Option<SemanticStore>,
}

impl ContextDatabase {
    /// Opens (creating on first use) all storage tiers under
    /// `<repo_root>/.cvc`.
    pub fn open(config: &Config) -> StoreResult<Self> {
        let cvc_dir = config.cvc_dir();
        std::fs::create_dir_all(&cvc_dir).map_err(|err| StoreError::Io(Box::new(err)))?;
        create_or_reuse_dir(&config.objects_dir())
            .map_err(|err| StoreError::Io(Box::new(err)))?;

        let blob_store = BlobStore::load(&config.objects_dir());
        let index = IndexDb::open(&config.db_path())?;
        let delta = DeltaEngine::new(blob_store, config);
        let semantic = if config.vector_enabled {
            match SemanticStore::init(&config.semantic_dir()) {
                Ok(store) => Some(store),
                Err(err) => {
                    // Advisory tier: a broken semantic store must not block
                    // the engine.
                    warn!(%err, "semantic store unavailable, continuing without it");
                    None
                }
            }
        } else {
            None
        };
        Ok(Self {
            index,
            delta,
            semantic,
        })
    }

    /// The advisory semantic tier, when enabled and healthy.
    pub fn semantic(&self) -> Option<&SemanticStore> {
        self.semantic.as_ref()
    }

    /// Canonicalizes and stores `blob`, records the commit, and optionally
    /// advances a branch head — the row and the head move in one index
    /// transaction. The final `is_delta` flag and the commit hash are
    /// decided here, after the storage tier has chosen an encoding.
    pub fn store_commit(
        &mut self,
        parents: &[CommitId],
        blob: &ContentBlob,
        mut metadata: CommitMetadata,
        advance_branch: Option<&str>,
    ) -> StoreResult<CognitiveCommit> {
        self.check_parents(parents, metadata.commit_type)?;

        let blob_bytes = blob.canonical_bytes()?;
        let content_hash = ContentId::new(canonical::sha256(&blob_bytes).to_vec());

        let anchor = match parents.first() {
            Some(parent) => self.nearest_anchor(parent)?,
            None => None,
        };
        let kind = self.delta.write(&content_hash, &blob_bytes, anchor.as_ref())?;
        metadata.is_delta = kind == BlobKind::Delta;

        let metadata_bytes = metadata.canonical_bytes()?;
        let commit_hash = CognitiveCommit::compute_hash(parents, &blob_bytes, &metadata_bytes);
        let commit = CognitiveCommit {
            commit_hash,
            parent_hashes: parents.to_vec(),
            content_hash,
            metadata,
        };
        self.index.record_commit(&commit, advance_branch)?;
        Ok(commit)
    }

    fn check_parents(&self, parents: &[CommitId], commit_type: CommitType) -> StoreResult<()> {
        match (commit_type, parents.len()) {
            (CommitType::Genesis, 0) => {}
            (CommitType::Genesis, n) => {
                return Err(StoreError::InvariantViolation {
                    reason: format!("genesis commit cannot have parents (got {n})"),
                });
            }
            (_, 1 | 2) => {}
            (_, n) => {
                return Err(StoreError::InvariantViolation {
                    reason: format!("commit must have one or two parents (got {n})"),
                });
            }
        }
        let mut seen = HashSet::new();
        for parent in parents {
            if !seen.insert(parent) {
                return Err(StoreError::InvariantViolation {
                    reason: format!("duplicate parent {parent}"),
                });
            }
            if !self.index.has_commit(parent)? {
                return Err(StoreError::InvariantViolation {
                    reason: format!("parent {parent} does not exist"),
                });
            }
        }
        Ok(())
    }

    // Walks first parents from `predecessor` to the closest anchor commit.
    // The anchor-chain bound keeps this walk within the anchor interval.
    fn nearest_anchor(&self, predecessor: &CommitId) -> StoreResult<Option<AnchorRef>> {
        let mut current = self.index.get_commit(predecessor)?;
        let mut deltas_since = 0;
        loop {
            if !current.metadata.is_delta {
                return Ok(Some(AnchorRef {
                    content_hash: current.content_hash,
                    deltas_since,
                }));
            }
            deltas_since += 1;
            match current.first_parent() {
                Some(parent) => current = self.index.get_commit(parent)?,
                None => return Ok(None),
            }
        }
    }

    /// Reconstructs and verifies the content blob stored under
    /// `content_hash`.
    pub fn retrieve_blob(&self, content_hash: &ContentId) -> StoreResult<ContentBlob> {
        let bytes = self.delta.reconstruct(content_hash)?;
        if canonical::sha256(&bytes).as_slice() != content_hash.as_bytes() {
            return Err(StoreError::Integrity {
                hash: content_hash.hex(),
            });
        }
        serde_json::from_slice(&bytes).map_err(|err| StoreError::InvariantViolation {
            reason: format!("blob {content_hash} does not parse as a content blob: {err}"),
        })
    }

    pub fn get_commit(&self, id: &CommitId) -> StoreResult<CognitiveCommit> {
        Ok(self.index.get_commit(id)?)
    }

    pub fn has_commit(&self, id: &CommitId) -> StoreResult<bool> {
        Ok(self.index.has_commit(id)?)
    }

    pub fn commit_count(&self) -> StoreResult<u64> {
        Ok(self.index.commit_count()?)
    }

    pub fn resolve_commit_id_prefix(
        &self,
        prefix: &HexPrefix,
    ) -> StoreResult<PrefixResolution<CommitId>> {
        Ok(self.index.resolve_commit_id_prefix(prefix)?)
    }

    /// Returns the branch, verifying its head still resolves to a committed
    /// row.
    pub fn get_branch(&self, name: &str) -> StoreResult<BranchPointer> {
        let branch = self.index.get_branch(name)?;
        if !self.index.has_commit(&branch.head_hash)? {
            return Err(StoreError::InvariantViolation {
                reason: format!(
                    "branch {name} points to missing commit {}",
                    branch.head_hash
                ),
            });
        }
        Ok(branch)
    }

    pub fn create_branch(
        &mut self,
        name: &str,
        head: &CommitId,
        description: &str,
    ) -> StoreResult<BranchPointer> {
        if !self.index.has_commit(head)? {
            return Err(StoreError::InvariantViolation {
                reason: format!("cannot create branch {name} at missing commit {head}"),
            });
        }
        Ok(self.index.create_branch(name, head, description)?)
    }

    pub fn set_branch_head(&mut self, name: &str, head: &CommitId) -> StoreResult<()> {
        if !self.index.has_commit(head)? {
            return Err(StoreError::InvariantViolation {
                reason: format!("cannot point branch {name} at missing commit {head}"),
            });
        }
        Ok(self.index.set_branch_head(name, head)?)
    }

    /// Conditional head advance for cross-process writers; see the engine's
    /// concurrency notes.
    pub fn set_branch_head_if(
        &mut self,
        name: &str,
        head: &CommitId,
        expected: &CommitId,
    ) -> StoreResult<()> {
        if !self.index.has_commit(head)? {
            return Err(StoreError::InvariantViolation {
                reason: format!("cannot point branch {name} at missing commit {head}"),
            });
        }
        Ok(self.index.set_branch_head_if(name, head, expected)?)
    }

    pub fn list_branches(&self) -> StoreResult<Vec<BranchPointer>> {
        Ok(self.index.list_branches()?)
    }

    pub fn branch_count(&self) -> StoreResult<u64> {
        Ok(self.index.branch_count()?)
    }

    pub fn parents_of(&self, id: &CommitId) -> StoreResult<Vec<CommitId>> {
        Ok(self.index.parents_of(id)?)
    }

    /// Lazy ancestor closure of `id`, starting with `id` itself.
    pub fn ancestors<'a>(
        &'a self,
        id: &CommitId,
    ) -> impl Iterator<Item = StoreResult<CommitId>> + 'a {
        self.index.ancestors(id).map(|item| item.map_err(StoreError::from))
    }

    /// Lowest common ancestor of `a` and `b` by simultaneous breadth-first
    /// search over the parent edges; `None` when the histories are disjoint.
    pub fn lca(&self, a: &CommitId, b: &CommitId) -> StoreResult<Option<CommitId>> {
        if a == b {
            return Ok(Some(a.clone()));
        }
        let mut seen_a = HashSet::from([a.clone()]);
        let mut seen_b = HashSet::from([b.clone()]);
        let mut frontier_a = vec![a.clone()];
        let mut frontier_b = vec![b.clone()];

        while !frontier_a.is_empty() || !frontier_b.is_empty() {
            if let Some(found) =
                self.advance_frontier(&mut frontier_a, &mut seen_a, &seen_b)?
            {
                return Ok(Some(found));
            }
            if let Some(found) =
                self.advance_frontier(&mut frontier_b, &mut seen_b, &seen_a)?
            {
                return Ok(Some(found));
            }
        }
        Ok(None)
    }

    // Expands one BFS level; returns the first node also seen from the other
    // side.
    fn advance_frontier(
        &self,
        frontier: &mut Vec<CommitId>,
        seen: &mut HashSet<CommitId>,
        other_seen: &HashSet<CommitId>,
    ) -> StoreResult<Option<CommitId>> {
        let mut next = vec![];
        for id in frontier.drain(..) {
            for parent in self.index.parents_of(&id)? {
                if other_seen.contains(&parent) {
                    return Ok(Some(parent));
                }
                if seen.insert(parent.clone()) {
                    next.push(parent);
                }
            }
        }
        *frontier = next;
        Ok(None)
    }

    pub fn set_git_link(&mut self, git_sha: &str, commit: &CommitId) -> StoreResult<()> {
        if !self.index.has_commit(commit)? {
            return Err(StoreError::InvariantViolation {
                reason: format!("cannot link git commit {git_sha} to missing commit {commit}"),
            });
        }
        Ok(self.index.set_git_link(git_sha, commit)?)
    }

    pub fn git_link(&self, git_sha: &str) -> StoreResult<Option<CommitId>> {
        Ok(self.index.git_link(git_sha)?)
    }

    /// Deletes blob files no commit references. Failed writes leave such
    /// orphans behind by design of the write ordering; this reclaims them.
    pub fn sweep_orphans(&mut self) -> StoreResult<usize> {
        let referenced = self.index.referenced_content_hashes()?;
        let mut orphans = vec![];
        for record in self.delta.store().iter() {
            let (id, _) = record?;
            if !referenced.contains(&id) {
                orphans.push(id);
            }
        }
        for id in &orphans {
            self.delta.store().remove(id)?;
        }
        if !orphans.is_empty() {
            info!(count = orphans.len(), "swept orphan blobs");
        }
        Ok(orphans.len())
    }
}
