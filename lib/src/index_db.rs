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

//! The transactional relational index over commits, branches, parent edges,
//! and Git links. SQLite provides the single-writer/many-reader discipline
//! across processes; within a process all writes go through `&mut self`.

use std::collections::HashSet;
use std::collections::VecDeque;
use std::path::Path;

use rusqlite::Connection;
use rusqlite::OptionalExtension as _;
use rusqlite::params;
use thiserror::Error;

use crate::commit::CognitiveCommit;
use crate::commit::CommitId;
use crate::commit::CommitMetadata;
use crate::commit::ContentId;
use crate::commit::timestamp_now;
use crate::object_id::HexPrefix;
use crate::object_id::ObjectId as _;
use crate::object_id::PrefixResolution;

/// Schema version written to the meta table. Migrations are forward-only:
/// an index written by a newer build refuses to open here.
const SCHEMA_VERSION: u32 = 1;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS commits (
    commit_hash TEXT PRIMARY KEY,
    content_hash TEXT NOT NULL,
    parent_hashes TEXT NOT NULL,
    metadata TEXT NOT NULL,
    created_at REAL NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_commits_content_hash ON commits(content_hash);
CREATE TABLE IF NOT EXISTS branches (
    name TEXT PRIMARY KEY,
    head_hash TEXT NOT NULL,
    created_at REAL NOT NULL,
    description TEXT NOT NULL DEFAULT ''
);
CREATE TABLE IF NOT EXISTS parent_edges (
    child_hash TEXT NOT NULL,
    parent_hash TEXT NOT NULL,
    PRIMARY KEY (child_hash, parent_hash)
);
CREATE INDEX IF NOT EXISTS idx_parent_edges_parent ON parent_edges(parent_hash);
CREATE TABLE IF NOT EXISTS git_links (
    git_sha TEXT PRIMARY KEY,
    commit_hash TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS refs (
    name TEXT PRIMARY KEY,
    commit_hash TEXT NOT NULL
);
";

/// A named mutable pointer to a head commit.
#[derive(Clone, Debug, PartialEq)]
pub struct BranchPointer {
    pub name: String,
    pub head_hash: CommitId,
    pub created_at: f64,
    pub description: String,
}

/// Branch names are non-empty and restricted to `[A-Za-z0-9_./-]`.
pub fn is_valid_branch_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'.' | b'/' | b'-'))
}

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("{kind} {name} not found")]
    NotFound { kind: &'static str, name: String },
    #[error("Branch {name} already exists")]
    BranchExists { name: String },
    #[error("Branch {branch} head moved: expected {expected}, found {found}")]
    HeadConflict {
        branch: String,
        expected: String,
        found: String,
    },
    #[error("Index schema version {found} is newer than supported version {supported}")]
    SchemaVersion { found: String, supported: u32 },
    #[error("Corrupt index row for {context}")]
    CorruptRow {
        context: String,
        source: serde_json::Error,
    },
    #[error("Index database error")]
    Storage(#[from] rusqlite::Error),
}

pub type IndexResult<T> = Result<T, IndexError>;

#[derive(Debug)]
pub struct IndexDb {
    conn: Connection,
}

impl IndexDb {
    /// Opens (creating if needed) the index at `path` and migrates it to the
    /// current schema.
    pub fn open(path: &Path) -> IndexResult<Self> {
        let conn = Connection::open(path)?;
        // journal_mode is a pragma that returns its new value as a row.
        let _mode: String =
            conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        conn.execute_batch(SCHEMA)?;

        let version: Option<String> = conn
            .query_row(
                "SELECT value FROM meta WHERE key = 'schema_version'",
                [],
                |row| row.get(0),
            )
            .optional()?;
        match version {
            None => {
                conn.execute(
                    "INSERT INTO meta (key, value) VALUES ('schema_version', ?1)",
                    params![SCHEMA_VERSION.to_string()],
                )?;
            }
            Some(found) => {
                let known = found.parse::<u32>().is_ok_and(|v| v <= SCHEMA_VERSION);
                if !known {
                    return Err(IndexError::SchemaVersion {
                        found,
                        supported: SCHEMA_VERSION,
                    });
                }
            }
        }
        Ok(Self { conn })
    }

    /// Records a commit and optionally advances (creating if absent) a
    /// branch head, all in one transaction. Re-recording an existing commit
    /// hash is a no-op upsert.
    pub fn record_commit(
        &mut self,
        commit: &CognitiveCommit,
        advance_branch: Option<&str>,
    ) -> IndexResult<()> {
        let parent_hashes = serde_json::to_string(&commit.parent_hashes)
            .map_err(|source| corrupt_row("parent_hashes", source))?;
        let metadata = serde_json::to_string(&commit.metadata)
            .map_err(|source| corrupt_row("metadata", source))?;

        let tx = self.conn.transaction()?;
        tx.execute(
            "INSERT OR IGNORE INTO commits
                 (commit_hash, content_hash, parent_hashes, metadata, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                commit.commit_hash.hex(),
                commit.content_hash.hex(),
                parent_hashes,
                metadata,
                commit.metadata.timestamp_seconds,
            ],
        )?;
        for parent in &commit.parent_hashes {
            tx.execute(
                "INSERT OR IGNORE INTO parent_edges (child_hash, parent_hash) VALUES (?1, ?2)",
                params![commit.commit_hash.hex(), parent.hex()],
            )?;
        }
        if let Some(name) = advance_branch {
            tx.execute(
                "INSERT INTO branches (name, head_hash, created_at, description)
                 VALUES (?1, ?2, ?3, '')
                 ON CONFLICT(name) DO UPDATE SET head_hash = excluded.head_hash",
                params![name, commit.commit_hash.hex(), timestamp_now()],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn get_commit(&self, id: &CommitId) -> IndexResult<CognitiveCommit> {
        self.conn
            .query_row(
                "SELECT content_hash, parent_hashes, metadata FROM commits
                 WHERE commit_hash = ?1",
                params![id.hex()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )
            .optional()?
            .ok_or_else(|| IndexError::NotFound {
                kind: "commit",
                name: id.hex(),
            })
            .and_then(|(content_hash, parent_hashes, metadata)| {
                commit_from_row(id.clone(), &content_hash, &parent_hashes, &metadata)
            })
    }

    pub fn has_commit(&self, id: &CommitId) -> IndexResult<bool> {
        let count: u64 = self.conn.query_row(
            "SELECT COUNT(*) FROM commits WHERE commit_hash = ?1",
            params![id.hex()],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    pub fn commit_count(&self) -> IndexResult<u64> {
        Ok(self
            .conn
            .query_row("SELECT COUNT(*) FROM commits", [], |row| row.get(0))?)
    }

    /// Resolves an unambiguous commit id prefix.
    pub fn resolve_commit_id_prefix(
        &self,
        prefix: &HexPrefix,
    ) -> IndexResult<PrefixResolution<CommitId>> {
        // Hex prefixes only contain [0-9a-f], so no LIKE escaping is needed.
        let pattern = format!("{}%", prefix.hex());
        let mut stmt = self
            .conn
            .prepare("SELECT commit_hash FROM commits WHERE commit_hash LIKE ?1 LIMIT 2")?;
        let mut rows = stmt.query_map(params![pattern], |row| row.get::<_, String>(0))?;
        let Some(first) = rows.next().transpose()? else {
            return Ok(PrefixResolution::NoMatch);
        };
        if rows.next().transpose()?.is_some() {
            return Ok(PrefixResolution::AmbiguousMatch);
        }
        let id = CommitId::try_from_hex(&first).ok_or_else(|| IndexError::NotFound {
            kind: "commit",
            name: first,
        })?;
        Ok(PrefixResolution::SingleMatch(id))
    }

    pub fn create_branch(
        &mut self,
        name: &str,
        head: &CommitId,
        description: &str,
    ) -> IndexResult<BranchPointer> {
        let created_at = timestamp_now();
        let inserted = self.conn.execute(
            "INSERT OR IGNORE INTO branches (name, head_hash, created_at, description)
             VALUES (?1, ?2, ?3, ?4)",
            params![name, head.hex(), created_at, description],
        )?;
        if inserted == 0 {
            return Err(IndexError::BranchExists {
                name: name.to_string(),
            });
        }
        Ok(BranchPointer {
            name: name.to_string(),
            head_hash: head.clone(),
            created_at,
            description: description.to_string(),
        })
    }

    pub fn get_branch(&self, name: &str) -> IndexResult<BranchPointer> {
        self.conn
            .query_row(
                "SELECT head_hash, created_at, description FROM branches WHERE name = ?1",
                params![name],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, f64>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )
            .optional()?
            .ok_or_else(|| IndexError::NotFound {
                kind: "branch",
                name: name.to_string(),
            })
            .and_then(|(head_hash, created_at, description)| {
                let head_hash =
                    CommitId::try_from_hex(&head_hash).ok_or_else(|| IndexError::NotFound {
                        kind: "commit",
                        name: head_hash,
                    })?;
                Ok(BranchPointer {
                    name: name.to_string(),
                    head_hash,
                    created_at,
                    description,
                })
            })
    }

    pub fn list_branches(&self) -> IndexResult<Vec<BranchPointer>> {
        let mut stmt = self.conn.prepare(
            "SELECT name, head_hash, created_at, description FROM branches ORDER BY name",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, f64>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?;
        let mut branches = vec![];
        for row in rows {
            let (name, head_hash, created_at, description) = row?;
            let head_hash =
                CommitId::try_from_hex(&head_hash).ok_or_else(|| IndexError::NotFound {
                    kind: "commit",
                    name: head_hash,
                })?;
            branches.push(BranchPointer {
                name,
                head_hash,
                created_at,
                description,
            });
        }
        Ok(branches)
    }

    pub fn branch_count(&self) -> IndexResult<u64> {
        Ok(self
            .conn
            .query_row("SELECT COUNT(*) FROM branches", [], |row| row.get(0))?)
    }

    pub fn set_branch_head(&mut self, name: &str, head: &CommitId) -> IndexResult<()> {
        let updated = self.conn.execute(
            "UPDATE branches SET head_hash = ?2 WHERE name = ?1",
            params![name, head.hex()],
        )?;
        if updated == 0 {
            return Err(IndexError::NotFound {
                kind: "branch",
                name: name.to_string(),
            });
        }
        Ok(())
    }

    /// Advances a branch head only if it still points where the caller last
    /// saw it. Losing the race returns `HeadConflict` carrying the head that
    /// won.
    pub fn set_branch_head_if(
        &mut self,
        name: &str,
        head: &CommitId,
        expected: &CommitId,
    ) -> IndexResult<()> {
        let tx = self.conn.transaction()?;
        let found: Option<String> = tx
            .query_row(
                "SELECT head_hash FROM branches WHERE name = ?1",
                params![name],
                |row| row.get(0),
            )
            .optional()?;
        let Some(found) = found else {
            return Err(IndexError::NotFound {
                kind: "branch",
                name: name.to_string(),
            });
        };
        if found != expected.hex() {
            return Err(IndexError::HeadConflict {
                branch: name.to_string(),
                expected: expected.hex(),
                found,
            });
        }
        tx.execute(
            "UPDATE branches SET head_hash = ?2 WHERE name = ?1",
            params![name, head.hex()],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Ordered parents of a commit (edge rows lose order, the commit row
    /// keeps it).
    pub fn parents_of(&self, id: &CommitId) -> IndexResult<Vec<CommitId>> {
        let parent_hashes: Option<String> = self
            .conn
            .query_row(
                "SELECT parent_hashes FROM commits WHERE commit_hash = ?1",
                params![id.hex()],
                |row| row.get(0),
            )
            .optional()?;
        let parent_hashes = parent_hashes.ok_or_else(|| IndexError::NotFound {
            kind: "commit",
            name: id.hex(),
        })?;
        serde_json::from_str(&parent_hashes)
            .map_err(|source| corrupt_row(&format!("commit {id}"), source))
    }

    pub fn children_of(&self, id: &CommitId) -> IndexResult<Vec<CommitId>> {
        let mut stmt = self
            .conn
            .prepare("SELECT child_hash FROM parent_edges WHERE parent_hash = ?1")?;
        let rows = stmt.query_map(params![id.hex()], |row| row.get::<_, String>(0))?;
        let mut children = vec![];
        for row in rows {
            let hex = row?;
            children.push(CommitId::try_from_hex(&hex).ok_or_else(|| IndexError::NotFound {
                kind: "commit",
                name: hex,
            })?);
        }
        Ok(children)
    }

    /// Walks the ancestor closure of `id` breadth-first, starting with `id`
    /// itself. The walk is lazy and finite.
    pub fn ancestors<'a>(&'a self, id: &CommitId) -> GraphWalk<'a> {
        GraphWalk::new(self, id.clone(), WalkDirection::Parents)
    }

    /// Walks the descendant closure of `id` breadth-first, starting with
    /// `id` itself.
    pub fn descendants<'a>(&'a self, id: &CommitId) -> GraphWalk<'a> {
        GraphWalk::new(self, id.clone(), WalkDirection::Children)
    }

    pub fn set_git_link(&mut self, git_sha: &str, commit: &CommitId) -> IndexResult<()> {
        self.conn.execute(
            "INSERT INTO git_links (git_sha, commit_hash) VALUES (?1, ?2)
             ON CONFLICT(git_sha) DO UPDATE SET commit_hash = excluded.commit_hash",
            params![git_sha, commit.hex()],
        )?;
        Ok(())
    }

    pub fn git_link(&self, git_sha: &str) -> IndexResult<Option<CommitId>> {
        let hex: Option<String> = self
            .conn
            .query_row(
                "SELECT commit_hash FROM git_links WHERE git_sha = ?1",
                params![git_sha],
                |row| row.get(0),
            )
            .optional()?;
        Ok(hex.and_then(|hex| CommitId::try_from_hex(hex)))
    }

    /// Every content hash referenced by some commit row. Used by the orphan
    /// sweep.
    pub fn referenced_content_hashes(&self) -> IndexResult<HashSet<ContentId>> {
        let mut stmt = self.conn.prepare("SELECT DISTINCT content_hash FROM commits")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut hashes = HashSet::new();
        for row in rows {
            if let Some(id) = ContentId::try_from_hex(row?) {
                hashes.insert(id);
            }
        }
        Ok(hashes)
    }
}

fn corrupt_row(context: &str, source: serde_json::Error) -> IndexError {
    IndexError::CorruptRow {
        context: context.to_string(),
        source,
    }
}

fn commit_from_row(
    commit_hash: CommitId,
    content_hash: &str,
    parent_hashes: &str,
    metadata: &str,
) -> IndexResult<CognitiveCommit> {
    let content_hash = ContentId::try_from_hex(content_hash).ok_or_else(|| IndexError::NotFound {
        kind: "content",
        name: content_hash.to_string(),
    })?;
    let parent_hashes: Vec<CommitId> = serde_json::from_str(parent_hashes)
        .map_err(|source| corrupt_row(&format!("commit {commit_hash}"), source))?;
    let metadata: CommitMetadata = serde_json::from_str(metadata)
        .map_err(|source| corrupt_row(&format!("commit {commit_hash}"), source))?;
    Ok(CognitiveCommit {
        commit_hash,
        parent_hashes,
        content_hash,
        metadata,
    })
}

enum WalkDirection {
    Parents,
    Children,
}

/// Lazy breadth-first walk over the commit graph in one direction.
pub struct GraphWalk<'a> {
    db: &'a IndexDb,
    direction: WalkDirection,
    queue: VecDeque<CommitId>,
    visited: HashSet<CommitId>,
}

impl<'a> GraphWalk<'a> {
    fn new(db: &'a IndexDb, start: CommitId, direction: WalkDirection) -> Self {
        Self {
            db,
            direction,
            queue: VecDeque::from([start.clone()]),
            visited: HashSet::from([start]),
        }
    }
}

impl Iterator for GraphWalk<'_> {
    type Item = IndexResult<CommitId>;

    fn next(&mut self) -> Option<Self::Item> {
        let id = self.queue.pop_front()?;
        let next = match self.direction {
            WalkDirection::Parents => self.db.parents_of(&id),
            WalkDirection::Children => self.db.children_of(&id),
        };
        match next {
            Ok(neighbors) => {
                for neighbor in neighbors {
                    if self.visited.insert(neighbor.clone()) {
                        self.queue.push_back(neighbor);
                    }
                }
                Some(Ok(id))
            }
            Err(err) => {
                self.queue.clear();
                Some(Err(err))
            }
        }
    }
}
