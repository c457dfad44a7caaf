//! Testing utilities for dataset trees.
//!
//! This module helps users of the crate test their capabilities against local
//! and remote trees without boilerplate. It includes:
//!
//! - **Assertions**: progress accounting, collection comparison, leaf inspection
//! - **Fixtures**: tree builders, ready-made capabilities, an in-process worker
//!
//! # Quick Start
//!
//! ```
//! use sketchflow::testing::*;
//! use sketchflow::Engine;
//! use std::sync::Arc;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> anyhow::Result<()> {
//! let engine = Engine::inline();
//! let data = composite_of(vec![1i64, 2, 3], &engine);
//!
//! let results = sketchflow::collect_results(data.sketch::<i64, _>(Arc::new(Total))).await?;
//! assert_progress_complete(&results);
//!
//! let mapped = data.reduce_map::<i64, _>(Arc::new(Increment)).await?;
//! assert_collections_equal(&leaf_values(&mapped), &[2, 3, 4]);
//! # Ok(())
//! # }
//! ```
//!
//! # Remote trees
//!
//! [`spawn_worker`] serves a tree on an ephemeral local port and shuts it down
//! when the returned [`TestWorker`] is dropped:
//!
//! ```no_run
//! use sketchflow::testing::*;
//! use sketchflow::{Engine, EngineConfig, RemoteClient};
//! use std::sync::Arc;
//!
//! # #[tokio::main]
//! # async fn main() -> anyhow::Result<()> {
//! let engine = Engine::inline();
//! let worker = spawn_worker(composite_of(vec![1i64, 2, 3], &engine), test_registry()).await?;
//! let client = RemoteClient::on_current_runtime(&EngineConfig::default())?;
//! let remote = client.root::<i64>(worker.endpoint());
//! let total: i64 = remote.reduce_sketch(Arc::new(Total)).await?;
//! assert_eq!(total, 6);
//! # Ok(())
//! # }
//! ```

pub mod assertions;
pub mod fixtures;

// Re-export commonly used items
pub use assertions::*;
pub use fixtures::*;
