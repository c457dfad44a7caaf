//! Datasets held by a worker process.

use crate::capability::{Descriptor, Element, Encode, Map, ResultBound, Sketch, Zipper};
use crate::control::{ControlMessage, ProxyContext, StatusList, statuses};
use crate::dataset::{Dataset, failed};
use crate::error::{Error, Result};
use crate::partial::{PartialResult, ResultStream};
use crate::remote::client::RemoteClient;
use crate::remote::protocol::{self, Command, EncodedDescriptor, Method, Operation, OperationId};
use futures::StreamExt;
use futures::stream;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

/// Stand-in for a dataset living on the worker at `endpoint`.
///
/// Operations are forwarded as commands against the remote handle. Datasets
/// produced remotely come back as new proxies for the handles the worker
/// minted; sketch results are decoded locally.
pub struct ProxyDataset<T> {
    client: Arc<RemoteClient>,
    endpoint: String,
    handle: i64,
    _t: PhantomData<fn() -> T>,
}

impl<T> Clone for ProxyDataset<T> {
    fn clone(&self) -> Self {
        Self {
            client: Arc::clone(&self.client),
            endpoint: self.endpoint.clone(),
            handle: self.handle,
            _t: PhantomData,
        }
    }
}

impl<T> fmt::Debug for ProxyDataset<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyDataset")
            .field("endpoint", &self.endpoint)
            .field("handle", &self.handle)
            .finish()
    }
}

impl<T> ProxyDataset<T> {
    pub fn new(client: Arc<RemoteClient>, endpoint: String, handle: i64) -> Self {
        Self {
            client,
            endpoint,
            handle,
            _t: PhantomData,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn handle(&self) -> i64 {
        self.handle
    }
}

impl<T: Element> ProxyDataset<T> {
    pub fn map<S, M>(&self, mapper: Arc<M>) -> ResultStream<Dataset<S>>
    where
        S: Element,
        M: Map<T, S>,
    {
        self.dataset_call(Method::Map, Operation::Map, &*mapper)
    }

    pub fn flat_map<S, M>(&self, mapper: Arc<M>) -> ResultStream<Dataset<S>>
    where
        S: Element,
        M: Map<T, Vec<S>>,
    {
        self.dataset_call(Method::FlatMap, Operation::FlatMap, &*mapper)
    }

    pub fn prune<M>(&self, predicate: Arc<M>) -> ResultStream<Dataset<T>>
    where
        M: Map<T, bool>,
    {
        self.dataset_call(Method::Prune, Operation::Prune, &*predicate)
    }

    /// Both operands must live on the same worker.
    pub fn zip<S, R, Z>(&self, other: &ProxyDataset<S>, zipper: Arc<Z>) -> ResultStream<Dataset<R>>
    where
        S: Element,
        R: Element,
        Z: Zipper<T, S, R>,
    {
        if self.endpoint != other.endpoint {
            return failed(Error::ZipEndpointMismatch {
                left: self.endpoint.clone(),
                right: other.endpoint.clone(),
            });
        }
        let other_handle = other.handle;
        self.dataset_call(
            Method::Zip,
            move |combiner| Operation::Zip {
                other_handle,
                combiner,
            },
            &*zipper,
        )
    }

    pub fn sketch<R, K>(&self, sketch: Arc<K>) -> ResultStream<R>
    where
        R: ResultBound,
        K: Sketch<T, R>,
    {
        let operation = match describe(&*sketch) {
            Ok(d) => Operation::Sketch(d),
            Err(e) => return failed(e),
        };
        self.call(Method::Sketch, operation, |bytes| protocol::decode::<R>(bytes))
    }

    /// The worker reports first, then this proxy's own action.
    pub fn manage(&self, message: Arc<dyn ControlMessage>) -> ResultStream<StatusList> {
        let kind = message.kind();
        let operation = match message.encode() {
            Ok(body) => Operation::Manage(EncodedDescriptor {
                kind: kind.to_string(),
                body,
            }),
            Err(e) => return failed(e),
        };
        let remote = self.call(Method::Manage, operation, |bytes| {
            protocol::decode::<StatusList>(bytes)
        });
        let endpoint = self.endpoint.clone();
        let handle = self.handle;
        let own = stream::once(async move {
            let ctx = ProxyContext {
                endpoint: &endpoint,
                handle,
            };
            Ok(PartialResult::new(0.0, Some(statuses(kind, message.remote_action(&ctx)))))
        });
        remote.chain(own).boxed()
    }

    fn dataset_call<S, D>(
        &self,
        method: Method,
        wrap: impl FnOnce(EncodedDescriptor) -> Operation,
        descriptor: &D,
    ) -> ResultStream<Dataset<S>>
    where
        S: Element,
        D: Descriptor,
    {
        let operation = match describe(descriptor) {
            Ok(d) => wrap(d),
            Err(e) => return failed(e),
        };
        let client = Arc::clone(&self.client);
        let endpoint = self.endpoint.clone();
        self.call(method, operation, move |bytes| {
            let handle: i64 = protocol::decode(bytes)?;
            Ok(Dataset::Proxy(ProxyDataset::new(
                Arc::clone(&client),
                endpoint.clone(),
                handle,
            )))
        })
    }

    fn call<R, F>(&self, method: Method, operation: Operation, decode: F) -> ResultStream<R>
    where
        R: Send + 'static,
        F: Fn(&[u8]) -> Result<R> + Send + 'static,
    {
        let payload = match protocol::encode(&operation) {
            Ok(bytes) => bytes.to_vec(),
            Err(e) => return failed(e),
        };
        let command = Command::new(self.handle, OperationId::new(), payload);
        self.client
            .call(self.endpoint.clone(), method, command, decode)
    }
}

fn describe<D: Descriptor>(descriptor: &D) -> Result<EncodedDescriptor> {
    Ok(EncodedDescriptor {
        kind: D::KIND.to_string(),
        body: descriptor.encode()?,
    })
}
