// Copyright 2025 Tributary Contributors
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
//
// SPDX-License-Identifier: Apache-2.0

//! Tributary Core - change-data-capture bridge from MongoDB to a
//! downstream sync cache.
//!
//! The bridge tails a MongoDB change stream, reshapes each change through
//! declarative table mappings into logical table rows, mints ordered
//! watermarks for resume tokens, and streams versioned wire messages to
//! replication clients.
//!
//! # Key Components
//!
//! - **Events**: [`event`] normalizes driver change stream events
//! - **Expressions**: [`expr`] parses and evaluates filters and projections
//! - **Pipeline**: [`pipeline`] composes reshaping stages
//! - **Mappings**: [`mapping`] projects logical tables out of collections
//! - **Watermarks**: [`watermark`] orders resume tokens for replay
//! - **Source**: [`source`] pulls from the upstream cursor with reconnection
//! - **Translator**: [`translator`] wraps rows in watermarked transactions
//! - **Sessions**: [`session`] serves replication clients with backpressure
//! - **Protocol**: [`protocol`] defines the downstream wire shapes
//! - **Config**: [`config`] loads the whole bridge from one JSON document
//!
//! # Example
//!
//! ```rust
//! use bson::doc;
//! use tributary_core::mapping::{MappingRegistry, TableMapping};
//!
//! # fn example() -> Result<(), tributary_core::mapping::MappingError> {
//! let mut registry = MappingRegistry::new();
//! registry.register(
//!     TableMapping::builder("channels", "rooms")
//!         .filter(doc! { "t": "c" })
//!         .projection(doc! { "_id": 1, "name": 1 })
//!         .build()?,
//! )?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod config;
pub mod event;
pub mod expr;
pub mod mapping;
pub mod pipeline;
pub mod protocol;
pub mod session;
pub mod source;
pub mod translator;
pub mod watermark;
