//! Calling side of the worker protocol.

use crate::config::EngineConfig;
use crate::control::{ControlMessage, StatusList};
use crate::dataset::{Dataset, failed};
use crate::error::{Error, Result};
use crate::executor::NetworkExecutor;
use crate::partial::{PartialResult, ResultStream};
use crate::remote::protocol::{
    self, Command, Connection, EncodedDescriptor, Method, NO_DATASET, Operation, OperationId,
    ROOT_HANDLE, Reply, Request, ResponseBody,
};
use crate::remote::proxy::ProxyDataset;
use futures::stream;
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::{Instant, timeout, timeout_at};
use tracing::{debug, warn};

/// Connection settings and runtime shared by all proxies of a process.
#[derive(Debug)]
pub struct RemoteClient {
    rpc_timeout: Duration,
    max_frame_length: usize,
    network: NetworkExecutor,
}

impl RemoteClient {
    pub fn new(config: &EngineConfig, network: NetworkExecutor) -> Arc<Self> {
        Arc::new(Self {
            rpc_timeout: config.rpc_timeout,
            max_frame_length: config.max_frame_length,
            network,
        })
    }

    /// A client running its I/O on the caller's runtime.
    pub fn on_current_runtime(config: &EngineConfig) -> Result<Arc<Self>> {
        config.validate()?;
        Ok(Self::new(config, NetworkExecutor::current()?))
    }

    pub fn rpc_timeout(&self) -> Duration {
        self.rpc_timeout
    }

    pub fn network(&self) -> &NetworkExecutor {
        &self.network
    }

    /// Proxy for the dataset a worker at `endpoint` was started with.
    pub fn root<T>(self: &Arc<Self>, endpoint: impl Into<String>) -> Dataset<T> {
        Dataset::Proxy(ProxyDataset::new(Arc::clone(self), endpoint.into(), ROOT_HANDLE))
    }

    /// Deliver `message` to the worker process itself, bypassing its datasets.
    pub fn manage_worker(
        self: &Arc<Self>,
        endpoint: impl Into<String>,
        message: Arc<dyn ControlMessage>,
    ) -> ResultStream<StatusList> {
        let operation = match message.encode() {
            Ok(body) => Operation::Manage(EncodedDescriptor {
                kind: message.kind().to_string(),
                body,
            }),
            Err(e) => return failed(e),
        };
        let payload = match protocol::encode(&operation) {
            Ok(bytes) => bytes.to_vec(),
            Err(e) => return failed(e),
        };
        let command = Command::new(NO_DATASET, OperationId::new(), payload);
        self.call(endpoint.into(), Method::Manage, command, |bytes| {
            protocol::decode::<StatusList>(bytes)
        })
    }

    /// Open a connection and send `request` on it.
    pub(crate) async fn open(&self, endpoint: &str, request: &Request) -> Result<Connection> {
        let transport = |source| Error::Transport {
            endpoint: endpoint.to_string(),
            source,
        };
        let stream = TcpStream::connect(endpoint).await.map_err(transport)?;
        stream.set_nodelay(true).map_err(transport)?;
        let mut connection = protocol::framed(stream, self.max_frame_length);
        connection
            .send(protocol::encode(request)?)
            .await
            .map_err(transport)?;
        Ok(connection)
    }

    /// Ask the worker to cancel the call `command` belongs to.
    pub async fn unsubscribe(&self, endpoint: &str, command: Command) -> Result<()> {
        let operation = command.operation_id();
        let exchange = async {
            let mut connection = self.open(endpoint, &Request::Unsubscribe(command)).await?;
            match read_reply(endpoint, &mut connection).await? {
                Reply::Ack => Ok(()),
                other => Err(Error::Protocol(format!("expected ack, got {other:?}"))),
            }
        };
        timeout(self.rpc_timeout, exchange)
            .await
            .map_err(|_| Error::Timeout {
                endpoint: endpoint.to_string(),
                timeout: self.rpc_timeout,
            })??;
        debug!(%operation, endpoint, "unsubscribed");
        Ok(())
    }

    /// Stream the replies of one call, decoding each delta with `decode`.
    ///
    /// The whole call must finish within the RPC timeout. If the stream is
    /// dropped after the request went out but before the worker completed,
    /// an unsubscribe for the same operation is sent in the background.
    pub(crate) fn call<R, D>(
        self: &Arc<Self>,
        endpoint: String,
        method: Method,
        command: Command,
        decode: D,
    ) -> ResultStream<R>
    where
        R: Send + 'static,
        D: Fn(&[u8]) -> Result<R> + Send + 'static,
    {
        let state = Call {
            guard: UnsubscribeOnDrop {
                client: Arc::clone(self),
                endpoint: endpoint.clone(),
                command: command.clone(),
                armed: false,
            },
            client: Arc::clone(self),
            endpoint,
            method,
            command,
            decode,
            connection: None,
            deadline: None,
            finished: false,
        };
        stream::unfold(state, |mut call| async move {
            if call.finished {
                return None;
            }
            match call.next().await {
                Ok(Some(pr)) => Some((Ok(pr), call)),
                Ok(None) => {
                    call.finished = true;
                    call.guard.armed = false;
                    None
                }
                Err(e) => {
                    call.finished = true;
                    // A failed reply means the worker already finished the call.
                    if matches!(e, Error::Remote { .. }) {
                        call.guard.armed = false;
                    }
                    Some((Err(e), call))
                }
            }
        })
        .boxed()
    }
}

struct Call<D> {
    client: Arc<RemoteClient>,
    endpoint: String,
    method: Method,
    command: Command,
    decode: D,
    connection: Option<Connection>,
    deadline: Option<Instant>,
    guard: UnsubscribeOnDrop,
    finished: bool,
}

impl<D> Call<D> {
    /// Next partial result; `None` once the worker completed the call.
    async fn next<R>(&mut self) -> Result<Option<PartialResult<R>>>
    where
        D: Fn(&[u8]) -> Result<R>,
    {
        let deadline = *self
            .deadline
            .get_or_insert_with(|| Instant::now() + self.client.rpc_timeout);
        let timed_out = || Error::Timeout {
            endpoint: self.endpoint.clone(),
            timeout: self.client.rpc_timeout,
        };
        if self.connection.is_none() {
            let request = Request::Call {
                method: self.method,
                command: self.command.clone(),
            };
            debug!(
                endpoint = %self.endpoint,
                handle = self.command.dataset_handle,
                operation = %self.command.operation_id(),
                method = %self.method,
                "remote call"
            );
            let connection = timeout_at(deadline, self.client.open(&self.endpoint, &request))
                .await
                .map_err(|_| timed_out())??;
            self.connection = Some(connection);
            self.guard.armed = true;
        }
        let Some(connection) = self.connection.as_mut() else {
            return Err(Error::Protocol("call has no connection".into()));
        };
        let reply = timeout_at(deadline, read_reply(&self.endpoint, connection))
            .await
            .map_err(|_| timed_out())??;
        match reply {
            Reply::Partial(response) => {
                let body: ResponseBody = protocol::decode(&response.payload)?;
                let delta = match body.delta {
                    Some(bytes) => Some((self.decode)(&bytes)?),
                    None => None,
                };
                Ok(Some(PartialResult::new(body.done, delta)))
            }
            Reply::Completed => Ok(None),
            Reply::Failed { kind, message } => Err(Error::Remote {
                endpoint: self.endpoint.clone(),
                kind,
                message,
            }),
            Reply::Ack => Err(Error::Protocol("unexpected ack in a call".into())),
        }
    }
}

async fn read_reply(endpoint: &str, connection: &mut Connection) -> Result<Reply> {
    match connection.next().await {
        Some(Ok(frame)) => protocol::decode(&frame),
        Some(Err(source)) => Err(Error::Transport {
            endpoint: endpoint.to_string(),
            source,
        }),
        None => Err(Error::Protocol(format!(
            "{endpoint} closed the connection before the call completed"
        ))),
    }
}

/// Sends a best-effort unsubscribe when a call is abandoned midway.
struct UnsubscribeOnDrop {
    client: Arc<RemoteClient>,
    endpoint: String,
    command: Command,
    armed: bool,
}

impl Drop for UnsubscribeOnDrop {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let client = Arc::clone(&self.client);
        let endpoint = std::mem::take(&mut self.endpoint);
        let command = self.command.clone();
        self.client.network.spawn(async move {
            if let Err(e) = client.unsubscribe(&endpoint, command).await {
                warn!(endpoint = %endpoint, error = %e, "unsubscribe failed");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn closed_connection_is_a_protocol_error() -> anyhow::Result<()> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let endpoint = listener.local_addr()?.to_string();
        tokio::spawn(async move {
            // Accept and hang up without answering.
            let _ = listener.accept().await;
        });
        let client = RemoteClient::on_current_runtime(&EngineConfig::default())?;
        let command = Command::new(ROOT_HANDLE, OperationId::new(), Vec::new());
        let mut out = client.call(endpoint, Method::Sketch, command, |b| protocol::decode::<u64>(b));
        match out.next().await {
            Some(Err(Error::Protocol(_))) | Some(Err(Error::Transport { .. })) => {}
            other => panic!("unexpected {:?}", other.map(|r| r.map(|p| p.done))),
        }
        assert!(out.next().await.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn unreachable_worker_is_a_transport_error() -> anyhow::Result<()> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let endpoint = listener.local_addr()?.to_string();
        drop(listener);
        let client = RemoteClient::on_current_runtime(&EngineConfig::default())?;
        let command = Command::new(ROOT_HANDLE, OperationId::new(), Vec::new());
        let err = client.unsubscribe(&endpoint, command).await.unwrap_err();
        assert!(matches!(err, Error::Transport { .. }), "{err}");
        Ok(())
    }
}
