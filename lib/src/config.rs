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

//! Typed engine configuration, the on-disk layout under `.cvc/`, and the
//! workspace-discovery contract front-ends use to produce a repo root.

use std::env;
use std::path::Path;
use std::path::PathBuf;

use tracing::warn;

use crate::commit::Mode;

/// Max commits between anchors on a linear history.
pub const DEFAULT_ANCHOR_INTERVAL: usize = 10;
/// A delta is abandoned if it grows past this ratio of its anchor's size.
pub const DEFAULT_DELTA_RATIO: f64 = 0.5;
/// Below this raw canonical size, never delta.
pub const DEFAULT_DELTA_MIN_SIZE: usize = 4096;
/// Zstandard compression level for anchors and deltas.
pub const DEFAULT_ZSTD_LEVEL: i32 = 3;

/// Environment variable consulted by [`find_workspace_root`].
pub const WORKSPACE_ENV_VAR: &str = "CVC_WORKSPACE";

/// Per-session engine configuration. There is no global state: every store
/// and engine instance is constructed from one of these.
#[derive(Clone, Debug)]
pub struct Config {
    /// Absolute root of the workspace this repository versions.
    pub repo_root: PathBuf,
    pub agent_id: String,
    pub default_branch: String,
    /// Label stamped into every commit's metadata. Informational only.
    pub mode: Mode,
    pub anchor_interval: usize,
    /// Assistant turns between automatic checkpoints. `None` disables
    /// auto-commit.
    pub auto_commit_interval: Option<usize>,
    pub delta_ratio: f64,
    pub delta_min_size: usize,
    pub zstd_level: i32,
    pub vector_enabled: bool,
    pub provider: Option<String>,
    pub model: Option<String>,
}

impl Config {
    /// A configuration with default settings for the given workspace root.
    pub fn new(repo_root: impl Into<PathBuf>) -> Self {
        let mode = Mode::Unknown;
        Self {
            repo_root: repo_root.into(),
            agent_id: "cvc".to_string(),
            default_branch: "main".to_string(),
            mode,
            anchor_interval: DEFAULT_ANCHOR_INTERVAL,
            auto_commit_interval: default_auto_commit_interval(mode),
            delta_ratio: DEFAULT_DELTA_RATIO,
            delta_min_size: DEFAULT_DELTA_MIN_SIZE,
            zstd_level: DEFAULT_ZSTD_LEVEL,
            vector_enabled: false,
            provider: None,
            model: None,
        }
    }

    /// Sets the mode and, unless overridden later, its auto-commit default.
    pub fn with_mode(mut self, mode: Mode) -> Self {
        self.mode = mode;
        self.auto_commit_interval = default_auto_commit_interval(mode);
        self
    }

    /// `<repo_root>/.cvc`, the directory everything persistent lives under.
    pub fn cvc_dir(&self) -> PathBuf {
        self.repo_root.join(".cvc")
    }

    /// The index database file.
    pub fn db_path(&self) -> PathBuf {
        self.cvc_dir().join("cvc.db")
    }

    /// The content-addressed blob shards.
    pub fn objects_dir(&self) -> PathBuf {
        self.cvc_dir().join("objects")
    }

    /// The uncommitted-context crash-recovery file.
    pub fn cache_path(&self) -> PathBuf {
        self.cvc_dir().join("context_cache.json")
    }

    /// The optional semantic store directory.
    pub fn semantic_dir(&self) -> PathBuf {
        self.cvc_dir().join("chroma")
    }
}

/// Assistant turns per auto-commit, by front-end mode.
pub fn default_auto_commit_interval(mode: Mode) -> Option<usize> {
    match mode {
        Mode::Proxy => Some(3),
        Mode::Cli | Mode::Mcp | Mode::Unknown => Some(2),
    }
}

/// Produces the workspace root a front-end should construct its engine with.
/// First match wins: the explicit `overridden` parameter, the
/// `CVC_WORKSPACE` environment variable, the closest ancestor of the current
/// working directory that looks like a project root, and finally the current
/// working directory itself (with a warning).
pub fn find_workspace_root(overridden: Option<&Path>) -> std::io::Result<PathBuf> {
    if let Some(path) = overridden {
        return absolutize(path);
    }
    if let Some(path) = env::var_os(WORKSPACE_ENV_VAR) {
        return absolutize(Path::new(&path));
    }
    let cwd = env::current_dir()?;
    for dir in cwd.ancestors() {
        if is_project_root(dir) {
            return Ok(dir.to_path_buf());
        }
    }
    warn!(
        cwd = %cwd.display(),
        "no workspace marker found in any ancestor, using the working directory"
    );
    Ok(cwd)
}

fn is_project_root(dir: &Path) -> bool {
    const MARKERS: &[&str] = &[".cvc", ".git", "Cargo.toml", "pyproject.toml", "package.json"];
    MARKERS.iter().any(|name| dir.join(name).exists())
}

fn absolutize(path: &Path) -> std::io::Result<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(env::current_dir()?.join(path))
    }
}
