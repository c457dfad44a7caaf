//! Datasets spread across processes.
//!
//! A [`ProxyDataset`] forwards every operation to a [`Worker`] over TCP. The
//! worker keeps the datasets it produces in a handle table and answers with
//! handles, so a chain of remote maps never moves partition data across the
//! network; only sketch results and status reports travel back.
//!
//! Cancellation crosses the process boundary explicitly: dropping a proxy's
//! result stream midway sends an unsubscribe carrying the call's operation id,
//! and the worker cancels the matching call.

pub mod client;
pub mod protocol;
pub mod proxy;
pub mod registry;
pub mod worker;

pub use client::RemoteClient;
pub use protocol::{NO_DATASET, OperationId, ROOT_HANDLE};
pub use proxy::ProxyDataset;
pub use registry::{Hosted, HostedDataset, OperationRegistry};
pub use worker::Worker;
