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

use std::path::Path;

use cvc_lib::commit::Message;
use cvc_lib::commit::Mode;
use cvc_lib::config::Config;
use cvc_lib::engine::Engine;
use cvc_lib::merge::Synthesizer;
use tempfile::TempDir;

pub fn new_temp_dir() -> TempDir {
    tempfile::Builder::new()
        .prefix("cvc-test-")
        .tempdir()
        .unwrap()
}

/// A configuration suitable for tests: CLI mode, auto-commit disabled so
/// tests control commit boundaries explicitly.
pub fn test_config(repo_root: &Path) -> Config {
    let mut config = Config::new(repo_root).with_mode(Mode::Cli);
    config.agent_id = "test-agent".to_string();
    config.auto_commit_interval = None;
    config
}

/// A repository in a temp directory with an initialized engine. Dropping
/// the struct removes the directory.
pub struct TestRepo {
    pub engine: Engine,
    pub config: Config,
    _temp_dir: TempDir,
}

impl TestRepo {
    pub fn init() -> Self {
        Self::init_with(|_| {})
    }

    /// Initializes a repo after letting the caller tweak the config.
    pub fn init_with(tweak: impl FnOnce(&mut Config)) -> Self {
        let temp_dir = new_temp_dir();
        let mut config = test_config(temp_dir.path());
        tweak(&mut config);
        let engine = Engine::init(config.clone()).unwrap();
        Self {
            engine,
            config,
            _temp_dir: temp_dir,
        }
    }

    /// Drops and reopens the engine, as a process restart would.
    pub fn reopen(&mut self) {
        let engine = Engine::init(self.config.clone()).unwrap();
        self.engine = engine;
    }
}

/// A user/assistant exchange large enough to exercise delta compression
/// (well past the delta minimum size), with `tag` controlling the content.
pub fn large_exchange(tag: &str) -> Vec<Message> {
    let body = format!("{tag} lorem ipsum context payload ").repeat(400);
    vec![Message::user(format!("request {tag}")), Message::assistant(body)]
}

/// A deterministic synthesizer stub for merge tests.
pub struct FixedSynthesizer(pub String);

impl Synthesizer for FixedSynthesizer {
    fn synthesize(
        &self,
        _base: &[Message],
        _ours: &[Message],
        _theirs: &[Message],
    ) -> Option<String> {
        Some(self.0.clone())
    }
}

/// A synthesizer stub that always fails, for the failure-is-not-fatal path.
pub struct FailingSynthesizer;

impl Synthesizer for FailingSynthesizer {
    fn synthesize(
        &self,
        _base: &[Message],
        _ours: &[Message],
        _theirs: &[Message],
    ) -> Option<String> {
        None
    }
}
