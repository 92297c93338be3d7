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

//! The uncommitted-context crash-recovery file.
//!
//! Every context-window mutation is mirrored here synchronously, so a crash
//! between commits loses nothing. The file is advisory: a corrupt or
//! truncated cache is treated as absent, never as an error.

use std::fs;
use std::io::Write as _;
use std::path::Path;
use std::path::PathBuf;

use serde::Deserialize;
use serde::Serialize;
use tempfile::NamedTempFile;
use tracing::warn;

use crate::commit::Message;
use crate::commit::Mode;
use crate::file_util::IoResultExt as _;
use crate::file_util::PathError;
use crate::file_util::persist_content_addressed_temp_file;

/// Schema of `context_cache.json`. Readers tolerate unknown fields.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CachedContext {
    pub messages: Vec<Message>,
    /// Seconds since the Unix epoch at the time of the last mirror.
    pub timestamp: f64,
    pub mode: Mode,
    pub branch: String,
}

#[derive(Debug)]
pub struct PersistentCache {
    path: PathBuf,
}

impl PersistentCache {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Atomically replaces the cache file with `context`. The temp file is
    /// created in the cache's directory so the rename never crosses a
    /// filesystem boundary.
    pub fn save(&self, context: &CachedContext) -> Result<(), PathError> {
        let dir = self.path.parent().expect("cache path has a parent");
        let mut temp_file = NamedTempFile::new_in(dir).context(dir)?;
        let json = serde_json::to_vec(context)
            .map_err(std::io::Error::other)
            .context(&self.path)?;
        temp_file.write_all(&json).context(&self.path)?;
        persist_content_addressed_temp_file(temp_file, &self.path).context(&self.path)?;
        Ok(())
    }

    /// Reads the cached context back, if a readable one exists. A missing
    /// file yields `None`; an unreadable or unparsable file is logged and
    /// also yields `None`.
    pub fn load(&self) -> Option<CachedContext> {
        let data = match fs::read(&self.path) {
            Ok(data) => data,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return None,
            Err(err) => {
                warn!(path = %self.path.display(), %err, "failed to read context cache");
                return None;
            }
        };
        match serde_json::from_slice(&data) {
            Ok(context) => Some(context),
            Err(err) => {
                warn!(path = %self.path.display(), %err, "context cache is corrupt, ignoring");
                None
            }
        }
    }

    /// Removes the cache file. Called after a successful commit made its
    /// content redundant. A missing file is fine.
    pub fn clear(&self) -> Result<(), PathError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err).context(&self.path),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commit::timestamp_now;

    fn cache_in(dir: &Path) -> PersistentCache {
        PersistentCache::new(dir.join("context_cache.json"))
    }

    fn context(messages: Vec<Message>) -> CachedContext {
        CachedContext {
            messages,
            timestamp: timestamp_now(),
            mode: Mode::Cli,
            branch: "main".to_string(),
        }
    }

    #[test]
    fn test_round_trip() {
        let temp_dir = tempfile::tempdir().unwrap();
        let cache = cache_in(temp_dir.path());
        assert_eq!(cache.load(), None);

        let saved = context(vec![Message::user("hi"), Message::assistant("hello")]);
        cache.save(&saved).unwrap();
        assert_eq!(cache.load(), Some(saved));

        cache.clear().unwrap();
        assert_eq!(cache.load(), None);
        cache.clear().unwrap();
    }

    #[test]
    fn test_truncated_file_is_ignored() {
        let temp_dir = tempfile::tempdir().unwrap();
        let cache = cache_in(temp_dir.path());
        cache.save(&context(vec![Message::user("hi")])).unwrap();

        let data = fs::read(cache.path()).unwrap();
        fs::write(cache.path(), &data[..data.len() / 2]).unwrap();
        assert_eq!(cache.load(), None);
    }

    #[test]
    fn test_unknown_fields_are_tolerated() {
        let temp_dir = tempfile::tempdir().unwrap();
        let cache = cache_in(temp_dir.path());
        fs::write(
            cache.path(),
            br#"{"messages":[],"timestamp":1.0,"mode":"cli","branch":"main","future":42}"#,
        )
        .unwrap();
        let loaded = cache.load().unwrap();
        assert_eq!(loaded.branch, "main");
    }
}
