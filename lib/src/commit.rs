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

use std::collections::BTreeMap;
use std::collections::BTreeSet;

use serde::Deserialize;
use serde::Serialize;
use sha2::Digest as _;
use sha2::Sha256;

use crate::canonical;
use crate::canonical::EncodingError;
use crate::object_id::ObjectId as _;
use crate::object_id::id_type;

/// Length in bytes of commit and content ids (SHA-256).
pub const ID_LENGTH: usize = 32;

id_type!(
    /// Identifier for a [`CognitiveCommit`]: the SHA-256 over its sorted
    /// parent ids, canonical content blob, and canonical metadata.
    pub CommitId
);
id_type!(
    /// Identifier for a [`ContentBlob`]: the SHA-256 of its canonical bytes.
    pub ContentId
);

/// Wall-clock seconds since the Unix epoch, at microsecond precision.
pub fn timestamp_now() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
    Tool,
}

/// One typed message in a conversation window. Messages are append-only
/// within a window.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: MessageRole,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// Content-hash references to binary attachments. The engine never
    /// stores attachment bytes, only references.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachments: Option<Vec<String>>,
}

impl Message {
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            name: None,
            tool_call_id: None,
            attachments: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(MessageRole::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(MessageRole::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(MessageRole::Assistant, content)
    }

    pub fn tool(content: impl Into<String>, tool_call_id: impl Into<String>) -> Self {
        Self {
            tool_call_id: Some(tool_call_id.into()),
            ..Self::new(MessageRole::Tool, content)
        }
    }
}

/// The payload of one commit: the full conversation state at that point.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ContentBlob {
    pub messages: Vec<Message>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_trace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_outputs: Option<BTreeMap<String, String>>,
    /// Relative path to file-content hash. References only, never file bytes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_files: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_count: Option<u64>,
}

impl ContentBlob {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
            && self.reasoning_trace.is_none()
            && self.tool_outputs.is_none()
            && self.source_files.is_none()
            && self.token_count.is_none()
    }

    /// The canonical byte form this blob is addressed by.
    pub fn canonical_bytes(&self) -> Result<Vec<u8>, EncodingError> {
        canonical::to_canonical_bytes(self)
    }

    pub fn content_id(&self) -> Result<ContentId, EncodingError> {
        let bytes = self.canonical_bytes()?;
        Ok(ContentId::new(canonical::sha256(&bytes).to_vec()))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommitType {
    Genesis,
    Checkpoint,
    Anchor,
    Rollback,
    Merge,
    Analysis,
    Generation,
}

/// Which front-end originated a commit. Informational only.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Cli,
    Proxy,
    Mcp,
    #[default]
    Unknown,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cli => "cli",
            Self::Proxy => "proxy",
            Self::Mcp => "mcp",
            Self::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Provenance of a merge commit.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MergeInfo {
    pub source_branch: String,
    pub target_branch: String,
    pub lca: CommitId,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CommitMetadata {
    pub timestamp_seconds: f64,
    pub agent_id: String,
    pub mode: Mode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Linked source-level Git commit, when a front-end reported one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_commit_sha: Option<String>,
    pub tags: BTreeSet<String>,
    pub message: String,
    pub commit_type: CommitType,
    pub is_delta: bool,
    /// Set on rollback commits: the commit the window was restored from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restored_from: Option<CommitId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merge: Option<MergeInfo>,
}

impl CommitMetadata {
    pub fn canonical_bytes(&self) -> Result<Vec<u8>, EncodingError> {
        canonical::to_canonical_bytes(self)
    }
}

/// An immutable snapshot of a conversation state, bound into the commit DAG
/// by its hash.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CognitiveCommit {
    pub commit_hash: CommitId,
    pub parent_hashes: Vec<CommitId>,
    pub content_hash: ContentId,
    pub metadata: CommitMetadata,
}

impl CognitiveCommit {
    /// The commit hash rule:
    /// `SHA256(sort_lex(parent_hashes) ‖ canonical(blob) ‖ canonical(metadata))`
    /// where parents are fed as sorted lowercase hex.
    pub fn compute_hash(
        parent_hashes: &[CommitId],
        blob_bytes: &[u8],
        metadata_bytes: &[u8],
    ) -> CommitId {
        let mut parents: Vec<&CommitId> = parent_hashes.iter().collect();
        parents.sort();
        let mut hasher = Sha256::new();
        for parent in parents {
            hasher.update(parent.hex().as_bytes());
        }
        hasher.update(blob_bytes);
        hasher.update(metadata_bytes);
        CommitId::new(hasher.finalize().to_vec())
    }

    pub fn is_genesis(&self) -> bool {
        self.metadata.commit_type == CommitType::Genesis
    }

    pub fn is_merge(&self) -> bool {
        self.parent_hashes.len() > 1
    }

    /// First parent, the one `log` follows through merge nodes.
    pub fn first_parent(&self) -> Option<&CommitId> {
        self.parent_hashes.first()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_blob() -> ContentBlob {
        ContentBlob {
            messages: vec![Message::user("hi"), Message::assistant("hello")],
            ..ContentBlob::empty()
        }
    }

    #[test]
    fn test_content_id_is_stable() {
        let a = small_blob().content_id().unwrap();
        let b = small_blob().content_id().unwrap();
        assert_eq!(a, b);
        assert_eq!(a.as_bytes().len(), ID_LENGTH);
    }

    #[test]
    fn test_content_id_ignores_absent_fields() {
        // `None` fields must be omitted, not serialized as null, so a blob
        // with explicit None options equals the default-constructed one.
        let blob = ContentBlob {
            messages: vec![],
            reasoning_trace: None,
            tool_outputs: None,
            source_files: None,
            token_count: None,
        };
        assert_eq!(
            blob.content_id().unwrap(),
            ContentBlob::empty().content_id().unwrap()
        );
    }

    #[test]
    fn test_commit_hash_parent_order_independent() {
        let p1 = CommitId::from_hex("11");
        let p2 = CommitId::from_hex("22");
        let blob = small_blob().canonical_bytes().unwrap();
        let meta = b"{}";
        let a = CognitiveCommit::compute_hash(&[p1.clone(), p2.clone()], &blob, meta);
        let b = CognitiveCommit::compute_hash(&[p2, p1], &blob, meta);
        assert_eq!(a, b);
    }

    #[test]
    fn test_commit_hash_depends_on_all_inputs() {
        let parent = CommitId::from_hex("11");
        let blob = small_blob().canonical_bytes().unwrap();
        let base = CognitiveCommit::compute_hash(std::slice::from_ref(&parent), &blob, b"{}");
        assert_ne!(
            base,
            CognitiveCommit::compute_hash(&[], &blob, b"{}"),
            "parents must affect the hash"
        );
        assert_ne!(
            base,
            CognitiveCommit::compute_hash(std::slice::from_ref(&parent), b"{}", b"{}"),
            "content must affect the hash"
        );
        assert_ne!(
            base,
            CognitiveCommit::compute_hash(std::slice::from_ref(&parent), &blob, b"{...}"),
            "metadata must affect the hash"
        );
    }
}
