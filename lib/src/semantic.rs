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

//! Advisory embedding-based recall over commit summaries.
//!
//! The store is strictly advisory: absence, failure, or staleness never
//! blocks a commit or a restore. Callers log failures and move on. Records
//! are one JSON object per line under `chroma/records.jsonl`; lookups are a
//! brute-force cosine scan, which is plenty for per-repository commit
//! counts.

use std::fs;
use std::io::BufRead as _;
use std::io::BufReader;
use std::io::Write as _;
use std::path::Path;
use std::path::PathBuf;

use serde::Deserialize;
use serde::Serialize;
use tempfile::NamedTempFile;
use thiserror::Error;

use crate::commit::CommitId;
use crate::file_util::persist_content_addressed_temp_file;

const RECORDS_FILE: &str = "records.jsonl";

#[derive(Clone, Debug, Serialize, Deserialize)]
struct SemanticRecord {
    commit: CommitId,
    summary: String,
    vector: Vec<f32>,
}

#[derive(Debug, Error)]
pub enum SemanticError {
    /// Any I/O or serialization fault. Callers treat the whole store as
    /// best-effort, so one variant is enough.
    #[error("Semantic store unavailable at {path}")]
    Unavailable {
        path: PathBuf,
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

pub type SemanticResult<T> = Result<T, SemanticError>;

#[derive(Debug)]
pub struct SemanticStore {
    dir: PathBuf,
}

impl SemanticStore {
    pub fn init(dir: &Path) -> SemanticResult<Self> {
        fs::create_dir_all(dir).map_err(|err| unavailable(dir, err))?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    fn records_path(&self) -> PathBuf {
        self.dir.join(RECORDS_FILE)
    }

    /// Inserts or replaces the record for `commit`.
    pub fn upsert(
        &self,
        commit: &CommitId,
        summary: &str,
        vector: Vec<f32>,
    ) -> SemanticResult<()> {
        let mut records = self.read_records()?;
        records.retain(|record| record.commit != *commit);
        records.push(SemanticRecord {
            commit: commit.clone(),
            summary: summary.to_string(),
            vector,
        });
        self.write_records(&records)
    }

    /// The `k` nearest stored commits by cosine distance, closest first.
    pub fn nearest(&self, query: &[f32], k: usize) -> SemanticResult<Vec<(CommitId, f32)>> {
        let mut scored: Vec<(CommitId, f32)> = self
            .read_records()?
            .into_iter()
            .map(|record| {
                let distance = cosine_distance(query, &record.vector);
                (record.commit, distance)
            })
            .collect();
        scored.sort_by(|(_, a), (_, b)| a.total_cmp(b));
        scored.truncate(k);
        Ok(scored)
    }

    fn read_records(&self) -> SemanticResult<Vec<SemanticRecord>> {
        let path = self.records_path();
        let file = match fs::File::open(&path) {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(vec![]),
            Err(err) => return Err(unavailable(&path, err)),
        };
        let mut records = vec![];
        for line in BufReader::new(file).lines() {
            let line = line.map_err(|err| unavailable(&path, err))?;
            if line.trim().is_empty() {
                continue;
            }
            let record =
                serde_json::from_str(&line).map_err(|err| unavailable(&path, err))?;
            records.push(record);
        }
        Ok(records)
    }

    fn write_records(&self, records: &[SemanticRecord]) -> SemanticResult<()> {
        let path = self.records_path();
        let mut temp_file =
            NamedTempFile::new_in(&self.dir).map_err(|err| unavailable(&self.dir, err))?;
        for record in records {
            let line = serde_json::to_string(record).map_err(|err| unavailable(&path, err))?;
            writeln!(temp_file, "{line}").map_err(|err| unavailable(&path, err))?;
        }
        persist_content_addressed_temp_file(temp_file, &path)
            .map_err(|err| unavailable(&path, err))?;
        Ok(())
    }
}

fn unavailable(
    path: &Path,
    err: impl Into<Box<dyn std::error::Error + Send + Sync>>,
) -> SemanticError {
    SemanticError::Unavailable {
        path: path.to_path_buf(),
        source: err.into(),
    }
}

/// 1 - cosine similarity. Mismatched lengths and zero vectors score as
/// maximally distant rather than erroring.
fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 2.0;
    }
    let dot: f32 = std::iter::zip(a, b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 2.0;
    }
    1.0 - dot / (norm_a * norm_b)
}
