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

//! Three-way synthesis of conversation states.
//!
//! Messages are treated as an ordered multiset keyed by canonical content
//! hash. The merged sequence is `base ∪ (ours \ base) ∪ (theirs \ base)`
//! with original ordering preserved and target-side additions ahead of
//! source-side ones. Semantic synthesis is a pluggable callback so the
//! engine stays testable without a model behind it; a failing or absent
//! synthesizer never fails a merge.

use std::collections::BTreeMap;
use std::collections::HashSet;

use itertools::Itertools as _;

use crate::canonical;
use crate::canonical::EncodingError;
use crate::commit::ContentBlob;
use crate::commit::Message;

/// Front-end-provided semantic merge callback. Returning `None` leaves the
/// merge without a synthesis note; it never aborts the merge.
pub trait Synthesizer {
    fn synthesize(
        &self,
        base: &[Message],
        ours: &[Message],
        theirs: &[Message],
    ) -> Option<String>;
}

impl<F> Synthesizer for F
where
    F: Fn(&[Message], &[Message], &[Message]) -> Option<String>,
{
    fn synthesize(
        &self,
        base: &[Message],
        ours: &[Message],
        theirs: &[Message],
    ) -> Option<String> {
        self(base, ours, theirs)
    }
}

fn message_key(message: &Message) -> Result<Vec<u8>, EncodingError> {
    Ok(canonical::sha256(&canonical::to_canonical_bytes(message)?).to_vec())
}

fn keyed(messages: &[Message]) -> Result<Vec<(Vec<u8>, &Message)>, EncodingError> {
    messages
        .iter()
        .map(|message| Ok((message_key(message)?, message)))
        .collect()
}

/// The message-set three-way merge. Duplicates collapse by canonical hash;
/// ordering is base first, then target-only, then source-only messages.
pub fn merge_messages(
    base: &[Message],
    ours: &[Message],
    theirs: &[Message],
) -> Result<Vec<Message>, EncodingError> {
    let base_keyed = keyed(base)?;
    let ours_keyed = keyed(ours)?;
    let theirs_keyed = keyed(theirs)?;

    let mut seen: HashSet<Vec<u8>> = base_keyed.iter().map(|(key, _)| key.clone()).collect();
    let ours_only = ours_keyed
        .into_iter()
        .filter(|(key, _)| seen.insert(key.clone()))
        .map(|(_, message)| message.clone())
        .collect_vec();
    let theirs_only = theirs_keyed
        .into_iter()
        .filter(|(key, _)| seen.insert(key.clone()))
        .map(|(_, message)| message.clone())
        .collect_vec();

    Ok(base
        .iter()
        .cloned()
        .chain(ours_only)
        .chain(theirs_only)
        .collect_vec())
}

/// Builds the merged content blob, leaving `reasoning_trace` for the caller
/// to fill with the synthesis result. Auxiliary maps take the union with the
/// target side winning key collisions; token counts are model-reported and
/// not meaningful across a merge, so none is carried.
pub fn merge_blobs(
    base: &ContentBlob,
    ours: &ContentBlob,
    theirs: &ContentBlob,
) -> Result<ContentBlob, EncodingError> {
    let messages = merge_messages(&base.messages, &ours.messages, &theirs.messages)?;
    Ok(ContentBlob {
        messages,
        reasoning_trace: None,
        tool_outputs: union_maps(ours.tool_outputs.as_ref(), theirs.tool_outputs.as_ref()),
        source_files: union_maps(ours.source_files.as_ref(), theirs.source_files.as_ref()),
        token_count: None,
    })
}

fn union_maps(
    ours: Option<&BTreeMap<String, String>>,
    theirs: Option<&BTreeMap<String, String>>,
) -> Option<BTreeMap<String, String>> {
    match (ours, theirs) {
        (None, None) => None,
        (ours, theirs) => {
            let mut merged = theirs.cloned().unwrap_or_default();
            if let Some(ours) = ours {
                merged.extend(ours.iter().map(|(k, v)| (k.clone(), v.clone())));
            }
            Some(merged)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msgs(texts: &[&str]) -> Vec<Message> {
        texts.iter().map(|text| Message::user(*text)).collect()
    }

    #[test]
    fn test_merge_disjoint_additions() {
        let base = msgs(&["shared"]);
        let ours = msgs(&["shared", "ours"]);
        let theirs = msgs(&["shared", "theirs"]);
        let merged = merge_messages(&base, &ours, &theirs).unwrap();
        assert_eq!(merged, msgs(&["shared", "ours", "theirs"]));
    }

    #[test]
    fn test_merge_collapses_duplicates() {
        let base = msgs(&["shared"]);
        let ours = msgs(&["shared", "both"]);
        let theirs = msgs(&["shared", "both", "theirs"]);
        let merged = merge_messages(&base, &ours, &theirs).unwrap();
        assert_eq!(merged, msgs(&["shared", "both", "theirs"]));
    }

    #[test]
    fn test_merge_identical_sides_is_base() {
        let base = msgs(&["a", "b"]);
        let merged = merge_messages(&base, &base, &base).unwrap();
        assert_eq!(merged, base);
    }

    #[test]
    fn test_duplicate_detection_uses_content_not_position() {
        let base = msgs(&[]);
        let ours = msgs(&["x"]);
        // The same message at a different position is still the same
        // message.
        let theirs = msgs(&["y", "x"]);
        let merged = merge_messages(&base, &ours, &theirs).unwrap();
        assert_eq!(merged, msgs(&["x", "y"]));
    }

    #[test]
    fn test_role_distinguishes_messages() {
        let base = msgs(&[]);
        let ours = vec![Message::user("same")];
        let theirs = vec![Message::assistant("same")];
        let merged = merge_messages(&base, &ours, &theirs).unwrap();
        assert_eq!(merged.len(), 2);
    }

    #[test]
    fn test_union_maps_target_wins() {
        let ours = BTreeMap::from([("k".to_string(), "ours".to_string())]);
        let theirs = BTreeMap::from([
            ("k".to_string(), "theirs".to_string()),
            ("only".to_string(), "theirs".to_string()),
        ]);
        let merged = union_maps(Some(&ours), Some(&theirs)).unwrap();
        assert_eq!(merged["k"], "ours");
        assert_eq!(merged["only"], "theirs");
        assert_eq!(union_maps(None, None), None);
    }

    #[test]
    fn test_closure_synthesizer() {
        let synth = |_: &[Message], _: &[Message], _: &[Message]| Some("note".to_string());
        assert_eq!(synth.synthesize(&[], &[], &[]), Some("note".to_string()));
    }
}
