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

use std::collections::BTreeSet;

use assert_matches::assert_matches;
use cvc_lib::commit::CognitiveCommit;
use cvc_lib::commit::CommitId;
use cvc_lib::commit::CommitMetadata;
use cvc_lib::commit::CommitType;
use cvc_lib::commit::ContentBlob;
use cvc_lib::commit::ID_LENGTH;
use cvc_lib::commit::Mode;
use cvc_lib::commit::timestamp_now;
use cvc_lib::index_db::IndexDb;
use cvc_lib::index_db::IndexError;
use cvc_lib::index_db::is_valid_branch_name;
use cvc_lib::object_id::HexPrefix;
use cvc_lib::object_id::ObjectId as _;
use cvc_lib::object_id::PrefixResolution;
use pretty_assertions::assert_eq;
use testutils::new_temp_dir;

fn commit_id(fill: u8) -> CommitId {
    CommitId::from_bytes(&[fill; ID_LENGTH])
}

fn fake_commit(id: &CommitId, parents: Vec<CommitId>) -> CognitiveCommit {
    CognitiveCommit {
        commit_hash: id.clone(),
        parent_hashes: parents,
        content_hash: ContentBlob::empty().content_id().unwrap(),
        metadata: CommitMetadata {
            timestamp_seconds: timestamp_now(),
            agent_id: "test-agent".to_string(),
            mode: Mode::Cli,
            provider: None,
            model: None,
            git_commit_sha: None,
            tags: BTreeSet::new(),
            message: format!("commit {id:.8}"),
            commit_type: CommitType::Checkpoint,
            is_delta: false,
            restored_from: None,
            merge: None,
        },
    }
}

fn open_db() -> (tempfile::TempDir, IndexDb) {
    let temp_dir = new_temp_dir();
    let db = IndexDb::open(&temp_dir.path().join("cvc.db")).unwrap();
    (temp_dir, db)
}

#[test]
fn test_commit_round_trip() {
    let (_temp_dir, mut db) = open_db();
    let root = fake_commit(&commit_id(1), vec![]);
    db.record_commit(&root, None).unwrap();

    let read = db.get_commit(&commit_id(1)).unwrap();
    assert_eq!(read, root);
    assert!(db.has_commit(&commit_id(1)).unwrap());
    assert!(!db.has_commit(&commit_id(9)).unwrap());
    assert_eq!(db.commit_count().unwrap(), 1);

    assert_matches!(
        db.get_commit(&commit_id(9)),
        Err(IndexError::NotFound { kind: "commit", .. })
    );
}

#[test]
fn test_duplicate_insert_is_noop() {
    let (_temp_dir, mut db) = open_db();
    let root = fake_commit(&commit_id(1), vec![]);
    db.record_commit(&root, None).unwrap();
    db.record_commit(&root, None).unwrap();
    assert_eq!(db.commit_count().unwrap(), 1);
}

#[test]
fn test_parent_edges_and_walks() {
    let (_temp_dir, mut db) = open_db();
    // 1 <- 2 <- 4 (merge of 2 and 3), 1 <- 3
    db.record_commit(&fake_commit(&commit_id(1), vec![]), None).unwrap();
    db.record_commit(&fake_commit(&commit_id(2), vec![commit_id(1)]), None).unwrap();
    db.record_commit(&fake_commit(&commit_id(3), vec![commit_id(1)]), None).unwrap();
    db.record_commit(&fake_commit(&commit_id(4), vec![commit_id(2), commit_id(3)]), None)
        .unwrap();

    assert_eq!(db.parents_of(&commit_id(4)).unwrap(), vec![commit_id(2), commit_id(3)]);

    let mut ancestors: Vec<CommitId> =
        db.ancestors(&commit_id(4)).map(|id| id.unwrap()).collect();
    ancestors.sort();
    assert_eq!(
        ancestors,
        vec![commit_id(1), commit_id(2), commit_id(3), commit_id(4)]
    );

    let mut descendants: Vec<CommitId> =
        db.descendants(&commit_id(1)).map(|id| id.unwrap()).collect();
    descendants.sort();
    assert_eq!(
        descendants,
        vec![commit_id(1), commit_id(2), commit_id(3), commit_id(4)]
    );
    let mut children = db.children_of(&commit_id(1)).unwrap();
    children.sort();
    assert_eq!(children, vec![commit_id(2), commit_id(3)]);
}

#[test]
fn test_branch_lifecycle() {
    let (_temp_dir, mut db) = open_db();
    db.record_commit(&fake_commit(&commit_id(1), vec![]), None).unwrap();
    db.record_commit(&fake_commit(&commit_id(2), vec![commit_id(1)]), None).unwrap();

    let branch = db.create_branch("main", &commit_id(1), "the trunk").unwrap();
    assert_eq!(branch.head_hash, commit_id(1));
    assert_matches!(
        db.create_branch("main", &commit_id(2), ""),
        Err(IndexError::BranchExists { .. })
    );

    db.set_branch_head("main", &commit_id(2)).unwrap();
    assert_eq!(db.get_branch("main").unwrap().head_hash, commit_id(2));
    assert_eq!(db.get_branch("main").unwrap().description, "the trunk");

    assert_matches!(
        db.set_branch_head("ghost", &commit_id(1)),
        Err(IndexError::NotFound { kind: "branch", .. })
    );
    assert_eq!(db.branch_count().unwrap(), 1);
}

// The optimistic head update loses gracefully: the caller learns the head
// that won.
#[test]
fn test_conditional_head_update() {
    let (_temp_dir, mut db) = open_db();
    db.record_commit(&fake_commit(&commit_id(1), vec![]), None).unwrap();
    db.record_commit(&fake_commit(&commit_id(2), vec![commit_id(1)]), None).unwrap();
    db.record_commit(&fake_commit(&commit_id(3), vec![commit_id(1)]), None).unwrap();
    db.create_branch("main", &commit_id(1), "").unwrap();

    db.set_branch_head_if("main", &commit_id(2), &commit_id(1)).unwrap();

    // A second writer still expecting commit 1 loses.
    let err = db
        .set_branch_head_if("main", &commit_id(3), &commit_id(1))
        .unwrap_err();
    assert_matches!(
        err,
        IndexError::HeadConflict { ref found, .. } if *found == commit_id(2).hex()
    );
    assert_eq!(db.get_branch("main").unwrap().head_hash, commit_id(2));
}

#[test]
fn test_record_commit_advances_branch_atomically() {
    let (_temp_dir, mut db) = open_db();
    db.record_commit(&fake_commit(&commit_id(1), vec![]), Some("main")).unwrap();
    assert_eq!(db.get_branch("main").unwrap().head_hash, commit_id(1));

    db.record_commit(&fake_commit(&commit_id(2), vec![commit_id(1)]), Some("main"))
        .unwrap();
    assert_eq!(db.get_branch("main").unwrap().head_hash, commit_id(2));
}

#[test]
fn test_prefix_resolution() {
    let (_temp_dir, mut db) = open_db();
    let a = CommitId::from_hex(
        "aaaa000000000000000000000000000000000000000000000000000000000001",
    );
    let b = CommitId::from_hex(
        "aaab000000000000000000000000000000000000000000000000000000000002",
    );
    db.record_commit(&fake_commit(&a, vec![]), None).unwrap();
    db.record_commit(&fake_commit(&b, vec![a.clone()]), None).unwrap();

    let resolve = |db: &IndexDb, prefix: &str| {
        db.resolve_commit_id_prefix(&HexPrefix::try_from_hex(prefix).unwrap())
            .unwrap()
    };
    // The index has no minimum prefix length; that policy lives in the
    // engine.
    assert_eq!(resolve(&db, "aaa"), PrefixResolution::AmbiguousMatch);
    assert_eq!(
        resolve(&db, "aaaa"),
        PrefixResolution::SingleMatch(a.clone())
    );
    assert_eq!(resolve(&db, &a.hex()), PrefixResolution::SingleMatch(a));
    assert_eq!(resolve(&db, "bbbb0000"), PrefixResolution::NoMatch);
}

#[test]
fn test_git_links() {
    let (_temp_dir, mut db) = open_db();
    db.record_commit(&fake_commit(&commit_id(1), vec![]), None).unwrap();
    db.record_commit(&fake_commit(&commit_id(2), vec![commit_id(1)]), None).unwrap();

    let sha = "0123456789abcdef0123456789abcdef01234567";
    db.set_git_link(sha, &commit_id(1)).unwrap();
    assert_eq!(db.git_link(sha).unwrap(), Some(commit_id(1)));
    assert_eq!(db.git_link("unknown").unwrap(), None);

    // Re-linking a sha moves it.
    db.set_git_link(sha, &commit_id(2)).unwrap();
    assert_eq!(db.git_link(sha).unwrap(), Some(commit_id(2)));
}

#[test]
fn test_reopen_keeps_data() {
    let temp_dir = new_temp_dir();
    let path = temp_dir.path().join("cvc.db");
    {
        let mut db = IndexDb::open(&path).unwrap();
        db.record_commit(&fake_commit(&commit_id(1), vec![]), Some("main")).unwrap();
    }
    let db = IndexDb::open(&path).unwrap();
    assert_eq!(db.commit_count().unwrap(), 1);
    assert_eq!(db.get_branch("main").unwrap().head_hash, commit_id(1));
}

#[test]
fn test_branch_name_charset() {
    assert!(is_valid_branch_name("main"));
    assert!(is_valid_branch_name("feat/topic-1.x_y"));
    assert!(!is_valid_branch_name(""));
    assert!(!is_valid_branch_name("no spaces"));
    assert!(!is_valid_branch_name("émoji"));
}
