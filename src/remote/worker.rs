//! Worker process: hosts datasets and executes commands against them.
//!
//! The worker owns a table of datasets keyed by handle. It is started with a
//! root dataset at [`ROOT_HANDLE`]; every dataset an operation produces is
//! stored under a freshly minted handle, which is what travels back to the
//! proxy. Each call is registered under its operation id with a
//! [`CancellationToken`] so that an unsubscribe can stop it. An unsubscribe
//! that arrives before its call leaves a tombstone for [`TOMBSTONE_TTL`], and
//! a call finding its tombstone is never started.
//!
//! Completed replies of data operations are memoized by
//! `(method, handle, sha256(payload))` and replayed for an identical command.

use crate::capability::Element;
use crate::config::WorkerConfig;
use crate::control::{ControlMessage, ServerControl, StatusList, statuses};
use crate::dataset::Dataset;
use crate::error::{Error, Result};
use crate::partial::{PartialResult, ResultStream};
use crate::remote::protocol::{
    self, Command, Connection, Method, NO_DATASET, Operation, OperationId, PartialResponse,
    ROOT_HANDLE, Reply, Request, ResponseBody,
};
use crate::remote::registry::{Hosted, HostedDataset, OperationRegistry};
use futures::stream;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How long an unsubscribe for an unknown operation is remembered.
pub const TOMBSTONE_TTL: Duration = Duration::from_secs(60);

/// Running calls, and operations cancelled before their call arrived.
#[derive(Default)]
struct Calls {
    running: HashMap<OperationId, CancellationToken>,
    tombstones: HashMap<OperationId, Instant>,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct MemoKey {
    method: Method,
    handle: i64,
    digest: Vec<u8>,
}

/// Replies of one completed call, with the handles they refer to.
#[derive(Clone, Debug)]
struct MemoEntry {
    replies: Vec<ResponseBody>,
    handles: Vec<i64>,
}

struct WorkerState {
    config: WorkerConfig,
    registry: OperationRegistry,
    datasets: Mutex<HashMap<i64, Hosted>>,
    next_handle: AtomicI64,
    operations: Mutex<Calls>,
    memo: Mutex<HashMap<MemoKey, MemoEntry>>,
    memoize: AtomicBool,
    endpoint: Mutex<String>,
}

/// A process-local server for one dataset tree.
#[derive(Clone)]
pub struct Worker {
    inner: Arc<WorkerState>,
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("endpoint", &*self.inner.endpoint.lock())
            .field("datasets", &self.dataset_count())
            .field("operations", &self.active_operations())
            .finish()
    }
}

impl Worker {
    pub fn new<T: Element>(root: Dataset<T>, registry: OperationRegistry, config: WorkerConfig) -> Self {
        let mut datasets: HashMap<i64, Hosted> = HashMap::new();
        datasets.insert(ROOT_HANDLE, Arc::new(root));
        let memoize = AtomicBool::new(config.memoize);
        let endpoint = Mutex::new(config.listen_address.clone());
        Self {
            inner: Arc::new(WorkerState {
                config,
                registry,
                datasets: Mutex::new(datasets),
                next_handle: AtomicI64::new(ROOT_HANDLE + 1),
                operations: Mutex::new(Calls::default()),
                memo: Mutex::new(HashMap::new()),
                memoize,
                endpoint,
            }),
        }
    }

    /// Address the worker is reachable at once serving.
    pub fn endpoint(&self) -> String {
        self.inner.endpoint()
    }

    pub fn dataset_count(&self) -> usize {
        self.inner.datasets.lock().len()
    }

    pub fn contains(&self, handle: i64) -> bool {
        self.inner.datasets.lock().contains_key(&handle)
    }

    /// Calls currently running.
    pub fn active_operations(&self) -> usize {
        self.inner.operations.lock().running.len()
    }

    pub fn memoized(&self) -> usize {
        self.inner.memo.lock().len()
    }

    pub fn is_memoizing(&self) -> bool {
        self.inner.memoize.load(Ordering::Acquire)
    }

    /// Bind the configured address and serve until `shutdown` fires.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        self.inner.config.validate()?;
        let address = self.inner.config.listen_address.clone();
        let listener = TcpListener::bind(&address)
            .await
            .map_err(|source| Error::Transport {
                endpoint: address,
                source,
            })?;
        self.serve(listener, shutdown).await
    }

    /// Accept connections on `listener` until `shutdown` fires.
    ///
    /// Each connection carries one request and is served on its own task.
    /// Shutting down cancels every running call.
    pub async fn serve(&self, listener: TcpListener, shutdown: CancellationToken) -> Result<()> {
        let local = listener
            .local_addr()
            .map_err(|source| Error::Transport {
                endpoint: self.inner.config.listen_address.clone(),
                source,
            })?
            .to_string();
        *self.inner.endpoint.lock() = local.clone();
        info!(endpoint = %local, memoize = self.is_memoizing(), "worker listening");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let state = Arc::clone(&self.inner);
                        tokio::spawn(async move {
                            if let Err(e) = state.handle_connection(stream, peer.to_string()).await {
                                warn!(%peer, error = %e, "connection ended with an error");
                            }
                        });
                    }
                    Err(e) => warn!(error = %e, "accept failed"),
                },
            }
        }
        let running: Vec<CancellationToken> = self.inner.operations.lock().running.values().cloned().collect();
        for token in running {
            token.cancel();
        }
        info!(endpoint = %local, "worker stopped");
        Ok(())
    }
}

impl WorkerState {
    async fn handle_connection(self: Arc<Self>, stream: TcpStream, peer: String) -> Result<()> {
        let transport = |source| Error::Transport {
            endpoint: peer.clone(),
            source,
        };
        stream.set_nodelay(true).map_err(transport)?;
        let mut connection = protocol::framed(stream, self.config.engine.max_frame_length);
        let frame = match connection.next().await {
            Some(frame) => frame.map_err(transport)?,
            None => return Ok(()),
        };
        match protocol::decode::<Request>(&frame)? {
            Request::Unsubscribe(command) => {
                self.unsubscribe(command.operation_id());
                send(&mut connection, &Reply::Ack).await.map_err(transport)
            }
            Request::Call { method, command } => {
                self.call(method, command, &mut connection, &peer).await
            }
        }
    }

    fn unsubscribe(&self, operation: OperationId) {
        let mut calls = self.operations.lock();
        match calls.running.remove(&operation) {
            Some(token) => {
                token.cancel();
                info!(%operation, "unsubscribed");
            }
            None => {
                let now = Instant::now();
                calls.tombstones.retain(|_, at| now.duration_since(*at) < TOMBSTONE_TTL);
                calls.tombstones.insert(operation, now);
                debug!(%operation, "unsubscribe for an operation not running");
            }
        }
    }

    /// Register a call as running, unless it was already unsubscribed.
    fn admit(self: &Arc<Self>, operation: OperationId) -> Option<(CancellationToken, Registered)> {
        let mut calls = self.operations.lock();
        if calls
            .tombstones
            .remove(&operation)
            .is_some_and(|at| at.elapsed() < TOMBSTONE_TTL)
        {
            return None;
        }
        let token = CancellationToken::new();
        calls.running.insert(operation, token.clone());
        Some((
            token,
            Registered {
                state: Arc::clone(self),
                operation,
            },
        ))
    }

    async fn call(
        self: &Arc<Self>,
        method: Method,
        command: Command,
        connection: &mut Connection,
        peer: &str,
    ) -> Result<()> {
        let io = |source| Error::Transport {
            endpoint: peer.to_string(),
            source,
        };
        let operation = command.operation_id();
        let Some((token, _registered)) = self.admit(operation) else {
            info!(%operation, %method, "call was unsubscribed before it arrived");
            return Ok(());
        };
        info!(
            %operation,
            %method,
            handle = command.dataset_handle,
            "command received"
        );

        let memo_key = self.memo_key(method, &command);
        if let Some(entry) = memo_key.as_ref().and_then(|key| self.recall(key)) {
            info!(%operation, %method, handle = command.dataset_handle, "replaying memoized result");
            for body in &entry.replies {
                send(connection, &partial(body)?).await.map_err(io)?;
            }
            return send(connection, &Reply::Completed).await.map_err(io);
        }

        let mut results = match self.start(method, &command) {
            Ok(results) => results,
            Err(e) => return fail(connection, operation, e).await.map_err(io),
        };
        let mut recorded = Vec::new();
        loop {
            let next = tokio::select! {
                biased;
                _ = token.cancelled() => {
                    info!(%operation, "call cancelled");
                    return Ok(());
                }
                next = results.next() => next,
            };
            match next {
                Some(Ok(pr)) => {
                    let body = ResponseBody {
                        done: pr.done,
                        delta: pr.delta,
                    };
                    send(connection, &partial(&body)?).await.map_err(io)?;
                    recorded.push(body);
                }
                Some(Err(e)) => return fail(connection, operation, e).await.map_err(io),
                None => break,
            }
        }
        send(connection, &Reply::Completed).await.map_err(io)?;
        if let Some(key) = memo_key {
            self.remember(key, recorded);
        }
        debug!(%operation, "call completed");
        Ok(())
    }

    /// Decode the command and start the operation it names.
    fn start(self: &Arc<Self>, method: Method, command: &Command) -> Result<ResultStream<Vec<u8>>> {
        let operation: Operation = protocol::decode(&command.payload)?;
        if operation.method() != method {
            return Err(Error::Protocol(format!(
                "{method} call carries a {} payload",
                operation.method()
            )));
        }
        if let (NO_DATASET, Operation::Manage(d)) = (command.dataset_handle, &operation) {
            let message = self.registry.control(d)?;
            return Ok(self.manage(None, message));
        }
        let target = self.dataset(command.dataset_handle)?;
        match &operation {
            Operation::Map(d) | Operation::FlatMap(d) | Operation::Prune(d) => {
                let results = self.registry.transform(method, d, &*target)?;
                Ok(self.host_results(results))
            }
            Operation::Zip {
                other_handle,
                combiner,
            } => {
                let other = self.dataset(*other_handle)?;
                let results = self.registry.zip(combiner, &*target, &*other)?;
                Ok(self.host_results(results))
            }
            Operation::Sketch(d) => self.registry.sketch(d, &*target),
            Operation::Manage(d) => {
                let message = self.registry.control(d)?;
                Ok(self.manage(Some(&*target), message))
            }
        }
    }

    /// Store every produced dataset and reply with its handle.
    fn host_results(self: &Arc<Self>, results: ResultStream<Hosted>) -> ResultStream<Vec<u8>> {
        let state = Arc::clone(self);
        results
            .map(move |item| -> Result<_> {
                let pr = item?;
                let delta = match pr.delta {
                    Some(dataset) => Some(protocol::encode(&state.host(dataset))?.to_vec()),
                    None => None,
                };
                Ok(PartialResult::new(pr.done, delta))
            })
            .boxed()
    }

    /// The hosted dataset reports first, then the worker itself. Without a
    /// target only the worker reports.
    fn manage(
        self: &Arc<Self>,
        target: Option<&dyn HostedDataset>,
        message: Arc<dyn ControlMessage>,
    ) -> ResultStream<Vec<u8>> {
        let state = Arc::clone(self);
        let kind = message.kind();
        let done = if target.is_some() { 0.0 } else { 1.0 };
        let own = {
            let message = Arc::clone(&message);
            stream::once(async move {
                let list: StatusList = statuses(kind, message.server_action(&*state));
                Ok(PartialResult::new(done, Some(list)))
            })
        };
        let reports = match target {
            Some(target) => target.manage(message).chain(own).boxed(),
            None => own.boxed(),
        };
        reports
            .map(|item| -> Result<_> {
                let pr = item?;
                let delta = match &pr.delta {
                    Some(list) => Some(protocol::encode(list)?.to_vec()),
                    None => None,
                };
                Ok(PartialResult::new(pr.done, delta))
            })
            .boxed()
    }

    fn dataset(&self, handle: i64) -> Result<Hosted> {
        self.datasets
            .lock()
            .get(&handle)
            .cloned()
            .ok_or(Error::UnknownHandle { handle })
    }

    fn host(&self, dataset: Hosted) -> i64 {
        let handle = self.next_handle.fetch_add(1, Ordering::AcqRel);
        self.datasets.lock().insert(handle, dataset);
        debug!(handle, "dataset hosted");
        handle
    }

    fn endpoint(&self) -> String {
        self.endpoint.lock().clone()
    }

    fn memo_key(&self, method: Method, command: &Command) -> Option<MemoKey> {
        if method == Method::Manage || !self.memoize.load(Ordering::Acquire) {
            return None;
        }
        Some(MemoKey {
            method,
            handle: command.dataset_handle,
            digest: Sha256::digest(&command.payload).to_vec(),
        })
    }

    /// A memoized reply, unless it names a dataset that is gone.
    fn recall(&self, key: &MemoKey) -> Option<MemoEntry> {
        let entry = self.memo.lock().get(key).cloned()?;
        let datasets = self.datasets.lock();
        let live = datasets.contains_key(&key.handle) && entry.handles.iter().all(|h| datasets.contains_key(h));
        drop(datasets);
        if live {
            Some(entry)
        } else {
            self.memo.lock().remove(key);
            debug!(handle = key.handle, method = %key.method, "dropped stale memoized result");
            None
        }
    }

    fn remember(&self, key: MemoKey, replies: Vec<ResponseBody>) {
        let handles = if key.method.produces_dataset() {
            replies
                .iter()
                .filter_map(|body| body.delta.as_deref())
                .filter_map(|bytes| protocol::decode::<i64>(bytes).ok())
                .collect()
        } else {
            Vec::new()
        };
        self.memo.lock().insert(key, MemoEntry { replies, handles });
    }
}

impl ServerControl for WorkerState {
    fn endpoint(&self) -> String {
        WorkerState::endpoint(self)
    }

    fn purge_memoized(&self) -> usize {
        let mut memo = self.memo.lock();
        let purged = memo.len();
        memo.clear();
        info!(purged, "memoized results purged");
        purged
    }

    fn delete_all_datasets(&self) -> usize {
        let mut datasets = self.datasets.lock();
        let before = datasets.len();
        datasets.retain(|handle, _| *handle == ROOT_HANDLE);
        let deleted = before - datasets.len();
        info!(deleted, "datasets deleted");
        deleted
    }

    fn toggle_memoization(&self) -> bool {
        let on = !self.memoize.fetch_xor(true, Ordering::AcqRel);
        info!(memoize = on, "memoization toggled");
        on
    }
}

/// Removes a call from the running set however it ends.
struct Registered {
    state: Arc<WorkerState>,
    operation: OperationId,
}

impl Drop for Registered {
    fn drop(&mut self) {
        self.state.operations.lock().running.remove(&self.operation);
    }
}

async fn send(connection: &mut Connection, reply: &Reply) -> std::io::Result<()> {
    let frame = protocol::encode(reply)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    connection.send(frame).await
}

fn partial(body: &ResponseBody) -> Result<Reply> {
    Ok(Reply::Partial(PartialResponse {
        payload: protocol::encode(body)?.to_vec(),
    }))
}

async fn fail(connection: &mut Connection, operation: OperationId, error: Error) -> std::io::Result<()> {
    warn!(%operation, error = %error, "call failed");
    let reply = Reply::Failed {
        kind: error.kind(),
        message: error.to_string(),
    };
    send(connection, &reply).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::Engine;

    fn worker() -> Worker {
        let root = Dataset::local(1i64, &Engine::inline());
        Worker::new(root, OperationRegistry::new(), WorkerConfig::default())
    }

    #[tokio::test]
    async fn early_unsubscribe_keeps_the_call_from_starting() {
        let worker = worker();
        let state = &worker.inner;
        let early = OperationId::new();

        state.unsubscribe(early);
        assert!(state.admit(early).is_none());
        assert_eq!(worker.active_operations(), 0);

        // The tombstone is consumed by the call it stopped.
        let retried = state.admit(early);
        assert!(retried.is_some());
        assert_eq!(worker.active_operations(), 1);
        drop(retried);
        assert_eq!(worker.active_operations(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn tombstones_expire() {
        let worker = worker();
        let state = &worker.inner;
        let stale = OperationId::new();

        state.unsubscribe(stale);
        tokio::time::advance(TOMBSTONE_TTL + Duration::from_secs(1)).await;
        state.unsubscribe(OperationId::new());
        assert_eq!(state.operations.lock().tombstones.len(), 1);

        let admitted = state.admit(stale);
        assert!(admitted.is_some());
        assert_eq!(worker.active_operations(), 1);
    }

    #[tokio::test]
    async fn unsubscribe_cancels_only_its_own_call() {
        let worker = worker();
        let state = &worker.inner;
        let running = OperationId::new();
        let Some((token, _registered)) = state.admit(running) else {
            panic!("a fresh operation was refused");
        };

        state.unsubscribe(OperationId::new());
        state.unsubscribe(OperationId::new());
        assert!(!token.is_cancelled());

        state.unsubscribe(running);
        assert!(token.is_cancelled());
        assert_eq!(worker.active_operations(), 0);
    }
}
