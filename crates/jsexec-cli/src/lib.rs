// Copyright 2025 jsexec Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! # jsexec CLI
//!
//! Command-line entry point for the jsexec script worker.
//!
//! - [`settings`] resolves a [`WorkerConfig`](jsexec_server::WorkerConfig)
//!   from flags, `JSEXEC_*` environment variables and an optional JSON file
//! - [`worker`] runs the worker until a signal or a fatal broker error

pub mod settings;
pub mod worker;
