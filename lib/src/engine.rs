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

//! The engine: the sole mutator of on-disk state and the only surface
//! front-ends consume.
//!
//! An engine session owns the in-memory context window, the active branch
//! name, the auto-commit counter, and the persistent cache. The engine is
//! not thread-safe; a front-end that wants multi-threaded mutation must put
//! it behind an exclusive lock.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::fmt::Debug;

use thiserror::Error;
use tracing::info;
use tracing::instrument;
use tracing::warn;

use crate::cache::CachedContext;
use crate::cache::PersistentCache;
use crate::commit::CognitiveCommit;
use crate::commit::CommitId;
use crate::commit::CommitMetadata;
use crate::commit::CommitType;
use crate::commit::ContentBlob;
use crate::commit::MergeInfo;
use crate::commit::Message;
use crate::commit::MessageRole;
use crate::commit::timestamp_now;
use crate::config::Config;
use crate::context_db::ContextDatabase;
use crate::context_db::StoreError;
use crate::context_db::StoreResult;
use crate::file_util::PathError;
use crate::index_db::BranchPointer;
use crate::index_db::is_valid_branch_name;
use crate::merge::Synthesizer;
use crate::merge::merge_blobs;
use crate::object_id::HexPrefix;
use crate::object_id::PrefixResolution;
use crate::semantic::SemanticStore;

/// Shortest accepted commit id prefix, in hex digits.
pub const MIN_PREFIX_LEN: usize = 8;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Branch {name} not found")]
    BranchNotFound { name: String },
    #[error("Commit {hash} not found")]
    CommitNotFound { hash: String },
    #[error("Commit id prefix {prefix} is ambiguous")]
    AmbiguousPrefix { prefix: String },
    #[error("Commit id prefix {prefix} is shorter than {MIN_PREFIX_LEN} hex digits")]
    PrefixTooShort { prefix: String },
    #[error("Invalid branch name {name:?}")]
    InvalidBranchName { name: String },
    #[error("Cannot merge branch {name} into itself")]
    MergeSourceIsTarget { name: String },
    #[error("Branches {branch_source} and {target} already point at the same commit")]
    NothingToMerge {
        branch_source: String,
        target: String,
    },
    #[error("Branches {branch_source} and {target} share no common ancestor")]
    NoCommonAncestor {
        branch_source: String,
        target: String,
    },
    #[error("Invalid Git commit sha {sha:?}")]
    InvalidGitSha { sha: String },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Cache(#[from] PathError),
}

pub type EngineResult<T> = Result<T, EngineError>;

/// Snapshot of the engine's externally visible state.
#[derive(Clone, Debug, PartialEq)]
pub struct Status {
    pub active_branch: String,
    pub head_hash: CommitId,
    pub window_size: usize,
    pub token_count: Option<u64>,
}

pub struct Engine {
    config: Config,
    db: ContextDatabase,
    cache: PersistentCache,
    active_branch: String,
    window: Vec<Message>,
    /// Total assistant turns this session, for checkpoint messages.
    assistant_turns: u64,
    turns_since_commit: usize,
    last_token_count: Option<u64>,
    current_git_sha: Option<String>,
    pending_reasoning: Option<String>,
    pending_tool_outputs: BTreeMap<String, String>,
    pending_source_files: BTreeMap<String, String>,
    synthesizer: Option<Box<dyn Synthesizer>>,
}

impl Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("repo_root", &self.config.repo_root)
            .field("active_branch", &self.active_branch)
            .field("window_size", &self.window.len())
            .finish()
    }
}

impl Engine {
    /// Opens the repository under `config.repo_root`, bootstrapping a
    /// genesis commit on the default branch for a brand-new store, and
    /// restores the context window (head first, then the crash cache).
    pub fn init(config: Config) -> EngineResult<Self> {
        let db = ContextDatabase::open(&config)?;
        let cache = PersistentCache::new(config.cache_path());
        let active_branch = config.default_branch.clone();
        let mut engine = Self {
            config,
            db,
            cache,
            active_branch,
            window: vec![],
            assistant_turns: 0,
            turns_since_commit: 0,
            last_token_count: None,
            current_git_sha: None,
            pending_reasoning: None,
            pending_tool_outputs: BTreeMap::new(),
            pending_source_files: BTreeMap::new(),
            synthesizer: None,
        };
        if engine.db.commit_count()? == 0 {
            let metadata = engine.base_metadata("Genesis", CommitType::Genesis, BTreeSet::new());
            let branch = engine.active_branch.clone();
            engine
                .db
                .store_commit(&[], &ContentBlob::empty(), metadata, Some(&branch))?;
            info!(branch = %branch, "initialized repository with genesis commit");
        }
        engine.auto_restore()?;
        Ok(engine)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn active_branch(&self) -> &str {
        &self.active_branch
    }

    /// Installs the semantic-merge callback used by [`Self::merge`].
    pub fn set_synthesizer(&mut self, synthesizer: Box<dyn Synthesizer>) {
        self.synthesizer = Some(synthesizer);
    }

    /// The advisory semantic tier, when enabled.
    pub fn semantic(&self) -> Option<&SemanticStore> {
        self.db.semantic()
    }

    pub fn status(&self) -> EngineResult<Status> {
        let branch = self.get_branch(&self.active_branch)?;
        Ok(Status {
            active_branch: self.active_branch.clone(),
            head_hash: branch.head_hash,
            window_size: self.window.len(),
            token_count: self.last_token_count,
        })
    }

    // ---- Context window lifecycle ----

    /// Appends a message to the window and mirrors the window to the crash
    /// cache before returning. An assistant message advances the auto-commit
    /// counter and may trigger an automatic checkpoint.
    pub fn push_message(&mut self, message: Message) -> EngineResult<()> {
        let is_assistant = message.role == MessageRole::Assistant;
        self.window.push(message);
        self.write_cache()?;
        if is_assistant {
            self.assistant_turns += 1;
            self.turns_since_commit += 1;
            if let Some(interval) = self.config.auto_commit_interval
                && self.turns_since_commit >= interval
            {
                let message = format!("Auto-checkpoint at turn {}", self.assistant_turns);
                self.commit(&message, CommitType::Checkpoint, BTreeSet::new())?;
            }
        }
        Ok(())
    }

    pub fn current_window(&self) -> &[Message] {
        &self.window
    }

    pub fn reset_window(&mut self) -> EngineResult<()> {
        self.window.clear();
        self.write_cache()?;
        Ok(())
    }

    /// Attaches an opaque reasoning trace to the next commit.
    pub fn attach_reasoning(&mut self, trace: impl Into<String>) {
        self.pending_reasoning = Some(trace.into());
    }

    /// Attaches a tool invocation result to the next commit.
    pub fn attach_tool_output(&mut self, tool_call_id: impl Into<String>, output: impl Into<String>) {
        self.pending_tool_outputs.insert(tool_call_id.into(), output.into());
    }

    /// Records a file-content hash reference for the next commit.
    pub fn attach_source_file(&mut self, path: impl Into<String>, content_hash: impl Into<String>) {
        self.pending_source_files.insert(path.into(), content_hash.into());
    }

    /// Records the token count the producing model reported for the current
    /// window.
    pub fn set_token_count(&mut self, token_count: u64) {
        self.last_token_count = Some(token_count);
    }

    // ---- Commit ----

    pub fn commit(
        &mut self,
        message: &str,
        commit_type: CommitType,
        tags: BTreeSet<String>,
    ) -> EngineResult<CognitiveCommit> {
        self.commit_with(message, commit_type, tags, None)
    }

    /// Freezes the window into a content blob and commits it, advancing the
    /// active branch. `parents_override` substitutes the parent list for
    /// importer-style callers; everyone else gets the branch head (or no
    /// parent for the bootstrap genesis).
    #[instrument(skip_all, fields(branch = %self.active_branch, commit_type = ?commit_type))]
    pub fn commit_with(
        &mut self,
        message: &str,
        commit_type: CommitType,
        tags: BTreeSet<String>,
        parents_override: Option<Vec<CommitId>>,
    ) -> EngineResult<CognitiveCommit> {
        if commit_type == CommitType::Genesis && self.db.commit_count()? > 0 {
            return Err(StoreError::InvariantViolation {
                reason: "repository already has a genesis commit".to_string(),
            }
            .into());
        }
        let parents = match parents_override {
            Some(parents) => parents,
            None => match self.db.get_branch(&self.active_branch) {
                Ok(branch) => vec![branch.head_hash],
                Err(StoreError::NotFound { .. }) if commit_type == CommitType::Genesis => vec![],
                Err(err) => return Err(err.into()),
            },
        };
        let blob = self.snapshot_blob();
        let metadata = self.base_metadata(message, commit_type, tags);
        let branch = self.active_branch.clone();
        let commit = self.db.store_commit(&parents, &blob, metadata, Some(&branch))?;

        self.turns_since_commit = 0;
        self.pending_reasoning = None;
        self.pending_tool_outputs.clear();
        self.pending_source_files.clear();
        // The cache is now redundant with the committed state. Failing to
        // drop it is harmless: the stale copy is discarded on the next
        // commit or superseded by the next push.
        if let Err(err) = self.cache.clear() {
            warn!(%err, "could not clear the context cache after commit");
        }
        Ok(commit)
    }

    // ---- Branches ----

    /// Creates a branch at the active head and switches to it. The window
    /// and cache are untouched: branching only duplicates the head pointer.
    pub fn branch(&mut self, name: &str, description: &str) -> EngineResult<BranchPointer> {
        if !is_valid_branch_name(name) {
            return Err(EngineError::InvalidBranchName {
                name: name.to_string(),
            });
        }
        let head = self.get_branch(&self.active_branch)?.head_hash;
        let pointer = self.db.create_branch(name, &head, description)?;
        self.active_branch = name.to_string();
        Ok(pointer)
    }

    /// Replaces the window with the target branch's head state and makes it
    /// the active branch.
    #[instrument(skip(self))]
    pub fn switch(&mut self, name: &str) -> EngineResult<()> {
        let branch = self.get_branch(name)?;
        let commit = self.db.get_commit(&branch.head_hash)?;
        let blob = self.db.retrieve_blob(&commit.content_hash)?;

        self.window = blob.messages;
        self.last_token_count = blob.token_count;
        self.active_branch = name.to_string();
        self.turns_since_commit = 0;
        self.pending_reasoning = None;
        self.pending_tool_outputs.clear();
        self.pending_source_files.clear();
        self.write_cache()?;
        Ok(())
    }

    pub fn list_branches(&self) -> EngineResult<Vec<BranchPointer>> {
        Ok(self.db.list_branches()?)
    }

    // ---- Time travel ----

    /// Restores the window to the state of `hash_or_prefix` and records a
    /// rollback commit on top of the current head, so history stays linear
    /// and the rollback is visible in the log. Returns the *target* commit.
    #[instrument(skip(self))]
    pub fn restore(&mut self, hash_or_prefix: &str) -> EngineResult<CognitiveCommit> {
        let target_id = self.resolve_commit_prefix(hash_or_prefix)?;
        let target = self.db.get_commit(&target_id)?;
        let blob = self.db.retrieve_blob(&target.content_hash)?;

        self.window = blob.messages.clone();
        self.last_token_count = blob.token_count;
        self.write_cache()?;

        let head = self.get_branch(&self.active_branch)?.head_hash;
        let mut metadata = self.base_metadata(
            &format!("Rollback to {target_id:.12}"),
            CommitType::Rollback,
            BTreeSet::new(),
        );
        metadata.restored_from = Some(target_id);
        let branch = self.active_branch.clone();
        self.db.store_commit(&[head], &blob, metadata, Some(&branch))?;

        self.turns_since_commit = 0;
        self.pending_reasoning = None;
        self.pending_tool_outputs.clear();
        self.pending_source_files.clear();
        if let Err(err) = self.cache.clear() {
            warn!(%err, "could not clear the context cache after restore");
        }
        Ok(target)
    }

    // ---- Log ----

    /// Walks commits from the branch head toward genesis, following first
    /// parents through merge nodes. The walk is lazy and restartable.
    pub fn log(&self, branch: Option<&str>, limit: Option<usize>) -> EngineResult<LogIter<'_>> {
        let name = branch.unwrap_or(&self.active_branch);
        let head = self.get_branch(name)?.head_hash;
        Ok(LogIter {
            db: &self.db,
            next: Some(head),
            remaining: limit,
        })
    }

    // ---- Merge ----

    /// Three-way merges `source` into `target` (the active branch by
    /// default). The source branch is never mutated.
    #[instrument(skip(self))]
    pub fn merge(&mut self, source: &str, target: Option<&str>) -> EngineResult<CognitiveCommit> {
        let target = target.unwrap_or(&self.active_branch).to_string();
        if source == target {
            return Err(EngineError::MergeSourceIsTarget { name: target });
        }
        let source_head = self.get_branch(source)?.head_hash;
        let target_head = self.get_branch(&target)?.head_hash;
        if source_head == target_head {
            return Err(EngineError::NothingToMerge {
                branch_source: source.to_string(),
                target,
            });
        }

        let lca = self
            .db
            .lca(&target_head, &source_head)?
            .ok_or_else(|| EngineError::NoCommonAncestor {
                branch_source: source.to_string(),
                target: target.clone(),
            })?;
        let base = self.retrieve_commit_blob(&lca)?;
        let ours = self.retrieve_commit_blob(&target_head)?;
        let theirs = self.retrieve_commit_blob(&source_head)?;

        let mut merged = merge_blobs(&base, &ours, &theirs).map_err(StoreError::from)?;
        merged.reasoning_trace = self
            .synthesizer
            .as_ref()
            .and_then(|synthesizer| {
                synthesizer.synthesize(&base.messages, &ours.messages, &theirs.messages)
            });

        let mut metadata = self.base_metadata(
            &format!("Merge {source} into {target}"),
            CommitType::Merge,
            BTreeSet::new(),
        );
        metadata.merge = Some(MergeInfo {
            source_branch: source.to_string(),
            target_branch: target.clone(),
            lca,
        });
        let parents = vec![target_head, source_head];
        let commit = self.db.store_commit(&parents, &merged, metadata, Some(&target))?;
        Ok(commit)
    }

    // ---- Lookups ----

    /// Resolves a full 64-hex id or a prefix of at least
    /// [`MIN_PREFIX_LEN`] digits.
    pub fn resolve_commit_prefix(&self, hash_or_prefix: &str) -> EngineResult<CommitId> {
        if hash_or_prefix.len() < MIN_PREFIX_LEN {
            return Err(EngineError::PrefixTooShort {
                prefix: hash_or_prefix.to_string(),
            });
        }
        let Some(prefix) = HexPrefix::try_from_hex(hash_or_prefix) else {
            return Err(EngineError::CommitNotFound {
                hash: hash_or_prefix.to_string(),
            });
        };
        match self.db.resolve_commit_id_prefix(&prefix)? {
            PrefixResolution::SingleMatch(id) => Ok(id),
            PrefixResolution::NoMatch => Err(EngineError::CommitNotFound {
                hash: hash_or_prefix.to_string(),
            }),
            PrefixResolution::AmbiguousMatch => Err(EngineError::AmbiguousPrefix {
                prefix: hash_or_prefix.to_string(),
            }),
        }
    }

    pub fn get_commit(&self, hash_or_prefix: &str) -> EngineResult<CognitiveCommit> {
        let id = self.resolve_commit_prefix(hash_or_prefix)?;
        Ok(self.db.get_commit(&id)?)
    }

    /// The content blob of a commit, by id or prefix.
    pub fn get_blob(&self, hash_or_prefix: &str) -> EngineResult<ContentBlob> {
        let commit = self.get_commit(hash_or_prefix)?;
        Ok(self.db.retrieve_blob(&commit.content_hash)?)
    }

    // ---- Git links ----

    /// Links a source-level Git commit to a cognitive commit and stamps
    /// subsequent commit metadata with the sha.
    pub fn set_git_link(&mut self, git_sha: &str, commit: &CommitId) -> EngineResult<()> {
        let valid = git_sha.len() == 40 && git_sha.bytes().all(|b| b.is_ascii_hexdigit());
        if !valid {
            return Err(EngineError::InvalidGitSha {
                sha: git_sha.to_string(),
            });
        }
        self.db.set_git_link(git_sha, commit)?;
        self.current_git_sha = Some(git_sha.to_ascii_lowercase());
        Ok(())
    }

    pub fn git_link(&self, git_sha: &str) -> EngineResult<Option<CommitId>> {
        Ok(self.db.git_link(git_sha)?)
    }

    /// Deletes orphaned blobs left behind by aborted writes.
    pub fn sweep_orphans(&mut self) -> EngineResult<usize> {
        Ok(self.db.sweep_orphans()?)
    }

    // ---- Internals ----

    fn get_branch(&self, name: &str) -> EngineResult<BranchPointer> {
        match self.db.get_branch(name) {
            Ok(branch) => Ok(branch),
            Err(StoreError::NotFound { kind: "branch", .. }) => {
                Err(EngineError::BranchNotFound {
                    name: name.to_string(),
                })
            }
            Err(err) => Err(err.into()),
        }
    }

    fn retrieve_commit_blob(&self, id: &CommitId) -> StoreResult<ContentBlob> {
        let commit = self.db.get_commit(id)?;
        self.db.retrieve_blob(&commit.content_hash)
    }

    fn snapshot_blob(&self) -> ContentBlob {
        ContentBlob {
            messages: self.window.clone(),
            reasoning_trace: self.pending_reasoning.clone(),
            tool_outputs: (!self.pending_tool_outputs.is_empty())
                .then(|| self.pending_tool_outputs.clone()),
            source_files: (!self.pending_source_files.is_empty())
                .then(|| self.pending_source_files.clone()),
            token_count: self.last_token_count,
        }
    }

    fn base_metadata(
        &self,
        message: &str,
        commit_type: CommitType,
        tags: BTreeSet<String>,
    ) -> CommitMetadata {
        CommitMetadata {
            timestamp_seconds: timestamp_now(),
            agent_id: self.config.agent_id.clone(),
            mode: self.config.mode,
            provider: self.config.provider.clone(),
            model: self.config.model.clone(),
            git_commit_sha: self.current_git_sha.clone(),
            tags,
            message: message.to_string(),
            commit_type,
            // Overwritten by the storage tier once an encoding is chosen.
            is_delta: false,
            restored_from: None,
            merge: None,
        }
    }

    fn write_cache(&self) -> Result<(), PathError> {
        self.cache.save(&CachedContext {
            messages: self.window.clone(),
            timestamp: timestamp_now(),
            mode: self.config.mode,
            branch: self.active_branch.clone(),
        })
    }

    /// Startup window recovery. Priority: a head with messages, then a
    /// crash cache newer than the head commit, then an empty window.
    fn auto_restore(&mut self) -> EngineResult<()> {
        let head = match self.db.get_branch(&self.active_branch) {
            Ok(branch) => {
                let commit = self.db.get_commit(&branch.head_hash)?;
                let blob = self.db.retrieve_blob(&commit.content_hash)?;
                Some((blob, commit.metadata.timestamp_seconds))
            }
            Err(StoreError::NotFound { .. }) => None,
            Err(err) => return Err(err.into()),
        };

        let cached = self.cache.load();
        if let Some(cached) = &cached
            && cached.mode != self.config.mode
        {
            info!(
                cache_mode = %cached.mode,
                session_mode = %self.config.mode,
                "context cache was written by a different front-end mode"
            );
        }

        match head {
            Some((blob, _)) if !blob.messages.is_empty() => {
                self.window = blob.messages;
                self.last_token_count = blob.token_count;
            }
            head => {
                let head_timestamp = head.map(|(_, ts)| ts);
                if let Some(cached) = cached
                    && head_timestamp.is_none_or(|ts| cached.timestamp > ts)
                {
                    info!(
                        messages = cached.messages.len(),
                        "recovered uncommitted context from the crash cache"
                    );
                    self.window = cached.messages;
                }
            }
        }
        Ok(())
    }
}

/// Lazy first-parent walk from a branch head toward genesis.
pub struct LogIter<'a> {
    db: &'a ContextDatabase,
    next: Option<CommitId>,
    remaining: Option<usize>,
}

impl Iterator for LogIter<'_> {
    type Item = EngineResult<CognitiveCommit>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == Some(0) {
            return None;
        }
        let id = self.next.take()?;
        match self.db.get_commit(&id) {
            Ok(commit) => {
                self.next = commit.first_parent().cloned();
                if let Some(remaining) = &mut self.remaining {
                    *remaining -= 1;
                }
                Some(Ok(commit))
            }
            Err(err) => Some(Err(err.into())),
        }
    }
}
