//! Out-of-band administrative messages.
//!
//! A [`ControlMessage`] traverses the dataset tree like any other operation but
//! does not transform data. Each layer that has something to do appends a
//! [`Status`]; the statuses are concatenated on the way back to the caller.
//! Actions run after the layer's children were asked, so in a remote tree the
//! leaves report first.

use crate::capability::{Descriptor, Encode};
use crate::monoid::Monoid;
use serde::{Deserialize, Serialize};
use std::any::Any;

/// Report about one control action.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    /// Host where the action executed.
    pub host: String,
    /// Free-form report.
    pub result: String,
    /// Error text if the action failed.
    pub error: Option<String>,
}

impl Status {
    pub fn new(result: impl Into<String>) -> Self {
        Self {
            host: host_name(),
            result: result.into(),
            error: None,
        }
    }

    pub fn failed(result: impl Into<String>, error: &anyhow::Error) -> Self {
        Self {
            host: host_name(),
            result: result.into(),
            error: Some(format!("{error:#}")),
        }
    }
}

fn host_name() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string())
}

/// Concatenation of statuses produced across the tree.
pub type StatusList = Vec<Status>;

/// List concatenation; commutative up to ordering, which callers must not rely on.
#[derive(Clone, Copy, Debug, Default)]
pub struct StatusListMonoid;

impl Monoid<StatusList> for StatusListMonoid {
    fn zero(&self) -> StatusList {
        Vec::new()
    }

    fn add(&self, mut left: StatusList, right: StatusList) -> StatusList {
        left.extend(right);
        left
    }
}

/// What a control message sees at a leaf.
pub struct LeafContext<'a> {
    pub partition: &'a dyn Any,
    pub type_name: &'static str,
}

/// What a control message sees at a composite.
#[derive(Clone, Copy, Debug)]
pub struct CompositeContext {
    pub children: usize,
}

/// What a control message sees at a proxy, on the calling side.
#[derive(Clone, Copy, Debug)]
pub struct ProxyContext<'a> {
    pub endpoint: &'a str,
    pub handle: i64,
}

/// Administrative hooks a worker process exposes to control messages.
pub trait ServerControl: Send + Sync {
    fn endpoint(&self) -> String;

    /// Forget every memoized reply; returns how many were dropped.
    fn purge_memoized(&self) -> usize;

    /// Drop every dataset except the root; returns how many were dropped.
    fn delete_all_datasets(&self) -> usize;

    /// Flip memoization; returns the new state.
    fn toggle_memoization(&self) -> bool;
}

/// A message interpreted by each layer of the dataset tree.
///
/// Every hook defaults to doing nothing. Errors are reported as a failed
/// [`Status`] instead of failing the stream.
pub trait ControlMessage: Encode {
    fn local_action(&self, _leaf: &LeafContext<'_>) -> anyhow::Result<Option<Status>> {
        Ok(None)
    }

    fn parallel_action(&self, _composite: &CompositeContext) -> anyhow::Result<Option<Status>> {
        Ok(None)
    }

    fn remote_action(&self, _proxy: &ProxyContext<'_>) -> anyhow::Result<Option<Status>> {
        Ok(None)
    }

    fn server_action(&self, _server: &dyn ServerControl) -> anyhow::Result<Option<Status>> {
        Ok(None)
    }
}

/// Turn the outcome of a control hook into a status list.
pub(crate) fn statuses(kind: &str, outcome: anyhow::Result<Option<Status>>) -> StatusList {
    match outcome {
        Ok(Some(status)) => vec![status],
        Ok(None) => Vec::new(),
        Err(e) => {
            tracing::warn!(control = kind, error = %e, "control action failed");
            vec![Status::failed("Exception", &e)]
        }
    }
}

/// Drops all memoized worker replies.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct PurgeMemoized;

impl Descriptor for PurgeMemoized {
    const KIND: &'static str = "sketchflow.purge-memoized";
}

impl ControlMessage for PurgeMemoized {
    fn server_action(&self, server: &dyn ServerControl) -> anyhow::Result<Option<Status>> {
        let purged = server.purge_memoized();
        Ok(Some(Status::new(format!("purged {purged} memoized results"))))
    }
}

/// Drops every dataset a worker holds except its root.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct DeleteAllDatasets;

impl Descriptor for DeleteAllDatasets {
    const KIND: &'static str = "sketchflow.delete-all-datasets";
}

impl ControlMessage for DeleteAllDatasets {
    fn server_action(&self, server: &dyn ServerControl) -> anyhow::Result<Option<Status>> {
        let deleted = server.delete_all_datasets();
        Ok(Some(Status::new(format!("deleted {deleted} datasets"))))
    }
}

/// Turns worker memoization on or off.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct ToggleMemoization;

impl Descriptor for ToggleMemoization {
    const KIND: &'static str = "sketchflow.toggle-memoization";
}

impl ControlMessage for ToggleMemoization {
    fn server_action(&self, server: &dyn ServerControl) -> anyhow::Result<Option<Status>> {
        let on = server.toggle_memoization();
        Ok(Some(Status::new(format!("memoization is {}", if on { "on" } else { "off" }))))
    }
}
