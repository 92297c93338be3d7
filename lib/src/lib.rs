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

//! Library for the CVC cognitive version control engine.
//!
//! CVC versions the conversation states of an AI coding agent the way Git
//! versions files: commits form a content-addressed Merkle DAG, payloads
//! live in an anchor/delta compressed blob store, and a SQLite index keeps
//! branches, parent edges, and metadata queryable. The [`engine::Engine`]
//! type is the operation surface front-ends consume.

#![warn(missing_docs)]
#![deny(unused_must_use)]

pub mod blob_store;
pub mod cache;
pub mod canonical;
pub mod commit;
pub mod config;
pub mod context_db;
pub mod delta;
pub mod engine;
pub mod file_util;
pub mod hex_util;
pub mod index_db;
pub mod merge;
pub mod object_id;
pub mod semantic;
