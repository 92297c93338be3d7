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

use cvc_lib::commit::CognitiveCommit;
use cvc_lib::commit::CommitType;
use cvc_lib::object_id::ObjectId as _;
use pretty_assertions::assert_eq;
use testutils::TestRepo;
use testutils::large_exchange;

fn checkpoint(repo: &mut TestRepo, tag: &str) -> CognitiveCommit {
    for message in large_exchange(tag) {
        repo.engine.push_message(message).unwrap();
    }
    repo.engine
        .commit(tag, CommitType::Checkpoint, BTreeSet::new())
        .unwrap()
}

// Anchor rollover at interval 3: anchors at c1 (the first real payload,
// since the empty genesis anchor is useless as a delta dictionary), then
// every third commit after it.
#[test]
fn test_anchor_rollover() {
    let mut repo = TestRepo::init_with(|config| {
        config.anchor_interval = 3;
    });

    let commits: Vec<CognitiveCommit> =
        (1..=7).map(|i| checkpoint(&mut repo, &format!("c{i}"))).collect();

    let is_delta: Vec<bool> = commits.iter().map(|c| c.metadata.is_delta).collect();
    assert_eq!(
        is_delta,
        vec![false, true, true, false, true, true, false],
        "anchors at c1, c4, c7"
    );

    // Every blob, anchor or delta, reconstructs to the window state at its
    // commit.
    let mut expected = vec![];
    for (i, commit) in commits.iter().enumerate() {
        expected.extend(large_exchange(&format!("c{}", i + 1)));
        let blob = repo.engine.get_blob(&commit.commit_hash.hex()).unwrap();
        assert_eq!(blob.messages, expected);
    }
}

#[test]
fn test_anchor_interval_one_forces_anchors() {
    let mut repo = TestRepo::init_with(|config| {
        config.anchor_interval = 1;
    });
    for i in 1..=3 {
        let commit = checkpoint(&mut repo, &format!("c{i}"));
        assert!(!commit.metadata.is_delta);
    }
}

#[test]
fn test_small_windows_stay_anchors() {
    let mut repo = TestRepo::init();
    // Tiny payloads are below the delta minimum size and must not delta.
    for i in 1..=3 {
        repo.engine
            .push_message(cvc_lib::commit::Message::user(format!("small {i}")))
            .unwrap();
        let commit = repo
            .engine
            .commit(&format!("c{i}"), CommitType::Checkpoint, BTreeSet::new())
            .unwrap();
        assert!(!commit.metadata.is_delta);
    }
}

#[test]
fn test_identical_content_reuses_blob() {
    let mut repo = TestRepo::init();
    for message in large_exchange("same") {
        repo.engine.push_message(message).unwrap();
    }
    let c1 = repo
        .engine
        .commit("c1", CommitType::Checkpoint, BTreeSet::new())
        .unwrap();
    // A second commit of the identical window maps to the same content
    // hash and keeps the stored encoding.
    let c2 = repo
        .engine
        .commit("c2", CommitType::Checkpoint, BTreeSet::new())
        .unwrap();
    assert_eq!(c1.content_hash, c2.content_hash);
    assert_ne!(c1.commit_hash, c2.commit_hash);
    assert_eq!(c1.metadata.is_delta, c2.metadata.is_delta);
}

#[test]
fn test_deltas_survive_reopen() {
    let mut repo = TestRepo::init_with(|config| {
        config.anchor_interval = 5;
    });
    let commits: Vec<CognitiveCommit> =
        (1..=4).map(|i| checkpoint(&mut repo, &format!("c{i}"))).collect();
    assert!(commits[1].metadata.is_delta);

    repo.reopen();
    for (i, commit) in commits.iter().enumerate() {
        let blob = repo.engine.get_blob(&commit.commit_hash.hex()).unwrap();
        assert_eq!(blob.messages.len(), (i + 1) * 2);
    }
}

#[test]
fn test_sweep_keeps_referenced_blobs() {
    let mut repo = TestRepo::init();
    let c1 = checkpoint(&mut repo, "kept");
    // Nothing is orphaned by a clean history.
    assert_eq!(repo.engine.sweep_orphans().unwrap(), 0);
    let blob = repo.engine.get_blob(&c1.commit_hash.hex()).unwrap();
    assert_eq!(blob.messages.len(), 2);
}
