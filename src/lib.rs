//! # Sketchflow
//!
//! A **distributed sketch engine** for Rust. Data lives in partitions spread
//! over a tree of local leaves, in-process composites, and proxies to worker
//! processes. Callers run maps that build new trees and sketches that
//! summarize a tree, and receive a stream of incremental, progress-annotated
//! partial results while the work fans out and the answers fan back in.
//!
//! ## Key Features
//!
//! - **Incremental results** - every operation returns a cold stream of
//!   [`PartialResult`]s whose progress fractions add up to one
//! - **Mergeable sketches** - results combine with a commutative [`Monoid`],
//!   so arrival order never matters
//! - **Remote trees** - a [`ProxyDataset`] forwards operations to a [`Worker`]
//!   that keeps produced datasets behind handles
//! - **Cancellation** - dropping a result stream stops the work it started,
//!   including on remote workers
//! - **Bundling** - composites coalesce bursts of results into one emission
//! - **Memoization and control** - workers replay repeated commands and accept
//!   administrative [`ControlMessage`]s
//!
//! ## Quick Start
//!
//! ```
//! use sketchflow::sketches::Sum;
//! use sketchflow::{Dataset, Engine};
//! use std::sync::Arc;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> anyhow::Result<()> {
//! let engine = Engine::inline();
//! let data = Dataset::parallel(
//!     vec![
//!         Dataset::local(vec![1i64, 2], &engine),
//!         Dataset::local(vec![3i64], &engine),
//!     ],
//!     engine.bundler(),
//! );
//!
//! let total: i64 = data.reduce_sketch(Arc::new(Sum)).await?;
//! assert_eq!(total, 6);
//! # Ok(())
//! # }
//! ```
//!
//! ## Core Concepts
//!
//! ### Datasets
//!
//! A [`Dataset<T>`] is one of three shapes:
//! - [`LeafDataset`] - a single partition, computed on the [`Engine`]'s
//!   compute executor
//! - [`CompositeDataset`] - an ordered list of children, operated on in parallel
//! - [`ProxyDataset`] - a handle to a dataset hosted by a remote [`Worker`]
//!
//! ### Operations
//!
//! - [`map`](Dataset::map) and [`flat_map`](Dataset::flat_map) build a tree of
//!   the same shape over new partitions
//! - [`sketch`](Dataset::sketch) summarizes every partition and merges the
//!   summaries
//! - [`zip`](Dataset::zip) combines two equally shaped trees position by position
//! - [`prune`](Dataset::prune) drops the leaves a predicate selects
//! - [`manage`](Dataset::manage) sends a [`ControlMessage`] through the tree
//!
//! Each has a `reduce_*` counterpart that drains the stream and returns the
//! final value.
//!
//! ### Capabilities
//!
//! User code is supplied as serializable capabilities implementing [`Map`],
//! [`Sketch`], or [`Zipper`]. Their [`Descriptor::KIND`] names them on the wire;
//! a worker's [`OperationRegistry`] maps names back to types.
//!
//! ## Remote Execution
//!
//! ```no_run
//! use sketchflow::sketches::Sum;
//! use sketchflow::{Dataset, Engine, EngineConfig, OperationRegistry, RemoteClient, Worker, WorkerConfig};
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! # #[tokio::main]
//! # async fn main() -> anyhow::Result<()> {
//! // On the worker
//! let engine = Engine::inline();
//! let registry = OperationRegistry::new().with_sketch::<Vec<i64>, i64, Sum>();
//! let worker = Worker::new(Dataset::local(vec![1i64, 2, 3], &engine), registry, WorkerConfig::default());
//! tokio::spawn({
//!     let worker = worker.clone();
//!     async move { worker.run(CancellationToken::new()).await }
//! });
//!
//! // On the client
//! let client = RemoteClient::on_current_runtime(&EngineConfig::default())?;
//! let remote = client.root::<Vec<i64>>("127.0.0.1:3569");
//! let total: i64 = remote.reduce_sketch(Arc::new(Sum)).await?;
//! assert_eq!(total, 6);
//! # Ok(())
//! # }
//! ```
//!
//! ## Module Overview
//!
//! - [`dataset`] - the dataset tree and its operations
//! - [`local`], [`parallel`] - leaf and composite nodes
//! - [`remote`] - proxies, workers, the wire protocol, and the registry
//! - [`partial`], [`monoid`] - partial results and how they merge
//! - [`bundle`] - time-window coalescing of result streams
//! - [`executor`] - compute and network executors
//! - [`control`] - administrative messages and status reports
//! - [`sketches`] - ready-made sketches
//! - [`config`] - engine and worker configuration
//! - [`testing`] - assertions and fixtures for tests

pub mod bundle;
pub mod capability;
pub mod config;
pub mod control;
pub mod dataset;
pub mod error;
pub mod executor;
pub mod local;
pub mod monoid;
pub mod parallel;
pub mod partial;
pub mod remote;
pub mod sketches;
pub mod testing;

// General re-exports
pub use bundle::Bundler;
pub use capability::{Descriptor, Element, Encode, Map, Pair, ResultBound, Sketch, Zipper};
pub use config::{EngineConfig, WorkerConfig};
pub use control::{
    ControlMessage, DeleteAllDatasets, PurgeMemoized, Status, StatusList, ToggleMemoization,
};
pub use dataset::Dataset;
pub use error::{Error, ErrorKind, Result};
pub use executor::{
    ComputeExecutor, Engine, InlineExecutor, NetworkExecutor, PoolExecutor, SharedCompute,
};
pub use local::LeafDataset;
pub use monoid::{DatasetResultMonoid, Monoid, PartialResultMonoid};
pub use parallel::CompositeDataset;
pub use partial::{PartialResult, ResultStream, collect_results, reduce_results, total_done};
pub use remote::{OperationRegistry, ProxyDataset, RemoteClient, Worker};
