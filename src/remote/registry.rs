//! Decoding table for the capabilities a worker accepts.
//!
//! A command names its capability by [`Descriptor::KIND`]. The worker looks the
//! name up here, together with the method and the partition type of the target
//! dataset, to find a decoder that knows the concrete partition and result
//! types. A generic capability such as [`Sum`](crate::sketches::Sum) may be
//! registered once per partition type; registering the same method, kind and
//! partition type twice panics.
//!
//! ```
//! # use serde::{Deserialize, Serialize};
//! # use sketchflow::{Descriptor, Map};
//! use sketchflow::remote::OperationRegistry;
//! use sketchflow::sketches::Sum;
//!
//! # #[derive(Serialize, Deserialize)]
//! # struct Square;
//! # impl Descriptor for Square { const KIND: &'static str = "square"; }
//! # impl Map<i64, i64> for Square {
//! #     fn apply(&self, v: &i64) -> anyhow::Result<i64> { Ok(v * v) }
//! # }
//! let registry = OperationRegistry::new()
//!     .with_map::<i64, i64, Square>()
//!     .with_sketch::<Vec<i64>, i64, Sum>()
//!     .with_sketch::<Vec<f64>, f64, Sum>();
//! assert!(registry.len() >= 3);
//! ```

use crate::capability::{Descriptor, Element, Map, ResultBound, Sketch, Zipper};
use crate::control::{ControlMessage, DeleteAllDatasets, PurgeMemoized, StatusList, ToggleMemoization};
use crate::dataset::Dataset;
use crate::error::{Error, Result};
use crate::partial::{PartialResult, ResultStream};
use crate::remote::protocol::{self, EncodedDescriptor, Method};
use futures::StreamExt;
use std::any::{Any, TypeId, type_name};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// A dataset stored in a worker's handle table, with its element type erased.
pub trait HostedDataset: Send + Sync {
    fn as_any(&self) -> &dyn Any;

    /// Name of the partition type, for diagnostics.
    fn element_type(&self) -> &'static str;

    /// Identity of the partition type, used to pick a decoder.
    fn element_type_id(&self) -> TypeId;

    /// Control messages need no type information.
    fn manage(&self, message: Arc<dyn ControlMessage>) -> ResultStream<StatusList>;
}

impl<T: Element> HostedDataset for Dataset<T> {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn element_type(&self) -> &'static str {
        type_name::<T>()
    }

    fn element_type_id(&self) -> TypeId {
        TypeId::of::<T>()
    }

    fn manage(&self, message: Arc<dyn ControlMessage>) -> ResultStream<StatusList> {
        Dataset::manage(self, message)
    }
}

/// Shared reference to a hosted dataset.
pub type Hosted = Arc<dyn HostedDataset>;

type Transform = Arc<dyn Fn(&dyn HostedDataset, &[u8]) -> Result<ResultStream<Hosted>> + Send + Sync>;
type Combine =
    Arc<dyn Fn(&dyn HostedDataset, &dyn HostedDataset, &[u8]) -> Result<ResultStream<Hosted>> + Send + Sync>;
type Summarize = Arc<dyn Fn(&dyn HostedDataset, &[u8]) -> Result<ResultStream<Vec<u8>>> + Send + Sync>;
type Control = Arc<dyn Fn(&[u8]) -> Result<Arc<dyn ControlMessage>> + Send + Sync>;

/// Decoders for one `(method, kind)`, one per partition type.
struct Overloads<H> {
    by_type: HashMap<TypeId, (&'static str, H)>,
}

impl<H> Default for Overloads<H> {
    fn default() -> Self {
        Self { by_type: HashMap::new() }
    }
}

impl<H: Clone> Clone for Overloads<H> {
    fn clone(&self) -> Self {
        Self {
            by_type: self.by_type.clone(),
        }
    }
}

impl<H> Overloads<H> {
    fn resolve(&self, found: TypeId, found_name: &'static str) -> Result<&H> {
        if let Some((_, handler)) = self.by_type.get(&found) {
            return Ok(handler);
        }
        let mut expected: Vec<&str> = self.by_type.values().map(|(name, _)| *name).collect();
        expected.sort_unstable();
        Err(Error::TypeMismatch {
            expected: expected.join(" or "),
            found: found_name,
        })
    }
}

/// Capabilities a worker can decode, keyed by method, kind and partition type.
#[derive(Clone)]
pub struct OperationRegistry {
    transforms: HashMap<(Method, String), Overloads<Transform>>,
    zips: HashMap<String, Overloads<Combine>>,
    sketches: HashMap<String, Overloads<Summarize>>,
    controls: HashMap<String, Control>,
}

impl fmt::Debug for OperationRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn listing<'a, H>(entries: impl Iterator<Item = (String, &'a Overloads<H>)>) -> Vec<String>
        where
            H: 'a,
        {
            let mut out: Vec<String> = entries
                .flat_map(|(key, overloads)| {
                    overloads
                        .by_type
                        .values()
                        .map(move |(name, _)| format!("{key}<{name}>"))
                })
                .collect();
            out.sort();
            out
        }
        let mut controls: Vec<&String> = self.controls.keys().collect();
        controls.sort();
        f.debug_struct("OperationRegistry")
            .field(
                "transforms",
                &listing(self.transforms.iter().map(|((m, k), o)| (format!("{m}:{k}"), o))),
            )
            .field("zips", &listing(self.zips.iter().map(|(k, o)| (k.clone(), o))))
            .field("sketches", &listing(self.sketches.iter().map(|(k, o)| (k.clone(), o))))
            .field("controls", &controls)
            .finish()
    }
}

impl Default for OperationRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl OperationRegistry {
    /// A registry knowing only the built-in control messages.
    pub fn new() -> Self {
        Self::empty()
            .with_control::<PurgeMemoized>()
            .with_control::<DeleteAllDatasets>()
            .with_control::<ToggleMemoization>()
    }

    pub fn empty() -> Self {
        Self {
            transforms: HashMap::new(),
            zips: HashMap::new(),
            sketches: HashMap::new(),
            controls: HashMap::new(),
        }
    }

    /// Number of registered capabilities, counting each partition type once.
    pub fn len(&self) -> usize {
        let transforms: usize = self.transforms.values().map(|o| o.by_type.len()).sum();
        let zips: usize = self.zips.values().map(|o| o.by_type.len()).sum();
        let sketches: usize = self.sketches.values().map(|o| o.by_type.len()).sum();
        transforms + zips + sketches + self.controls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// # Panics
    ///
    /// If a map of the same kind is already registered for partitions of type `T`.
    pub fn with_map<T, S, M>(self) -> Self
    where
        T: Element,
        S: Element,
        M: Map<T, S>,
    {
        self.with_transform::<T>(
            Method::Map,
            M::KIND,
            transform(|target, body| {
                let dataset = downcast::<T>(target)?;
                let mapper: M = protocol::decode(body)?;
                Ok(hosted(dataset.map::<S, M>(Arc::new(mapper))))
            }),
        )
    }

    /// # Panics
    ///
    /// If a flat map of the same kind is already registered for partitions of type `T`.
    pub fn with_flat_map<T, S, M>(self) -> Self
    where
        T: Element,
        S: Element,
        M: Map<T, Vec<S>>,
    {
        self.with_transform::<T>(
            Method::FlatMap,
            M::KIND,
            transform(|target, body| {
                let dataset = downcast::<T>(target)?;
                let mapper: M = protocol::decode(body)?;
                Ok(hosted(dataset.flat_map::<S, M>(Arc::new(mapper))))
            }),
        )
    }

    /// # Panics
    ///
    /// If a predicate of the same kind is already registered for partitions of type `T`.
    pub fn with_prune<T, M>(self) -> Self
    where
        T: Element,
        M: Map<T, bool>,
    {
        self.with_transform::<T>(
            Method::Prune,
            M::KIND,
            transform(|target, body| {
                let dataset = downcast::<T>(target)?;
                let predicate: M = protocol::decode(body)?;
                Ok(hosted(dataset.prune(Arc::new(predicate))))
            }),
        )
    }

    /// Zips are chosen by the partition type of the left operand.
    ///
    /// # Panics
    ///
    /// If a zipper of the same kind is already registered for left partitions of type `T`.
    pub fn with_zip<T, S, R, Z>(mut self) -> Self
    where
        T: Element,
        S: Element,
        R: Element,
        Z: Zipper<T, S, R>,
    {
        let overloads = self.zips.entry(Z::KIND.to_string()).or_default();
        add_overload::<T, _>(
            overloads,
            Method::Zip,
            Z::KIND,
            combine(|left, right, body| {
                let left = downcast::<T>(left)?;
                let right = downcast::<S>(right)?;
                let zipper: Z = protocol::decode(body)?;
                Ok(hosted(left.zip::<S, R, Z>(right, Arc::new(zipper))))
            }),
        );
        self
    }

    /// # Panics
    ///
    /// If a sketch of the same kind is already registered for partitions of type `T`.
    pub fn with_sketch<T, R, K>(mut self) -> Self
    where
        T: Element,
        R: ResultBound,
        K: Sketch<T, R>,
    {
        let overloads = self.sketches.entry(K::KIND.to_string()).or_default();
        add_overload::<T, _>(
            overloads,
            Method::Sketch,
            K::KIND,
            summarize(|target, body| {
                let dataset = downcast::<T>(target)?;
                let sketch: K = protocol::decode(body)?;
                let results = dataset.sketch::<R, K>(Arc::new(sketch)).map(|item| -> Result<_> {
                    let pr = item?;
                    let delta = match &pr.delta {
                        Some(value) => Some(protocol::encode(value)?.to_vec()),
                        None => None,
                    };
                    Ok(PartialResult::new(pr.done, delta))
                });
                Ok(results.boxed())
            }),
        );
        self
    }

    /// # Panics
    ///
    /// If a control message of the same kind is already registered.
    pub fn with_control<C>(mut self) -> Self
    where
        C: ControlMessage + Descriptor,
    {
        if self.controls.contains_key(C::KIND) {
            panic!("control message `{}` is registered twice", C::KIND);
        }
        self.controls.insert(
            C::KIND.to_string(),
            control(|body| {
                let message: C = protocol::decode(body)?;
                Ok(Arc::new(message) as Arc<dyn ControlMessage>)
            }),
        );
        self
    }

    fn with_transform<T: Element>(mut self, method: Method, kind: &'static str, handler: Transform) -> Self {
        let overloads = self.transforms.entry((method, kind.to_string())).or_default();
        add_overload::<T, _>(overloads, method, kind, handler);
        self
    }

    pub(crate) fn transform(
        &self,
        method: Method,
        descriptor: &EncodedDescriptor,
        target: &dyn HostedDataset,
    ) -> Result<ResultStream<Hosted>> {
        let handler = self
            .transforms
            .get(&(method, descriptor.kind.clone()))
            .ok_or_else(|| unknown(method, descriptor))?
            .resolve(target.element_type_id(), target.element_type())?;
        handler(target, &descriptor.body)
    }

    pub(crate) fn zip(
        &self,
        descriptor: &EncodedDescriptor,
        left: &dyn HostedDataset,
        right: &dyn HostedDataset,
    ) -> Result<ResultStream<Hosted>> {
        let handler = self
            .zips
            .get(descriptor.kind.as_str())
            .ok_or_else(|| unknown(Method::Zip, descriptor))?
            .resolve(left.element_type_id(), left.element_type())?;
        handler(left, right, &descriptor.body)
    }

    pub(crate) fn sketch(
        &self,
        descriptor: &EncodedDescriptor,
        target: &dyn HostedDataset,
    ) -> Result<ResultStream<Vec<u8>>> {
        let handler = self
            .sketches
            .get(descriptor.kind.as_str())
            .ok_or_else(|| unknown(Method::Sketch, descriptor))?
            .resolve(target.element_type_id(), target.element_type())?;
        handler(target, &descriptor.body)
    }

    pub(crate) fn control(&self, descriptor: &EncodedDescriptor) -> Result<Arc<dyn ControlMessage>> {
        let decoder = self
            .controls
            .get(descriptor.kind.as_str())
            .ok_or_else(|| unknown(Method::Manage, descriptor))?;
        decoder(&descriptor.body)
    }
}

fn add_overload<T: Element, H>(overloads: &mut Overloads<H>, method: Method, kind: &str, handler: H) {
    let previous = overloads
        .by_type
        .insert(TypeId::of::<T>(), (type_name::<T>(), handler));
    if previous.is_some() {
        panic!(
            "{method} `{kind}` is registered twice for {}",
            type_name::<T>()
        );
    }
}

fn transform<F>(f: F) -> Transform
where
    F: Fn(&dyn HostedDataset, &[u8]) -> Result<ResultStream<Hosted>> + Send + Sync + 'static,
{
    Arc::new(f)
}

fn combine<F>(f: F) -> Combine
where
    F: Fn(&dyn HostedDataset, &dyn HostedDataset, &[u8]) -> Result<ResultStream<Hosted>>
        + Send
        + Sync
        + 'static,
{
    Arc::new(f)
}

fn summarize<F>(f: F) -> Summarize
where
    F: Fn(&dyn HostedDataset, &[u8]) -> Result<ResultStream<Vec<u8>>> + Send + Sync + 'static,
{
    Arc::new(f)
}

fn control<F>(f: F) -> Control
where
    F: Fn(&[u8]) -> Result<Arc<dyn ControlMessage>> + Send + Sync + 'static,
{
    Arc::new(f)
}

fn downcast<T: Element>(target: &dyn HostedDataset) -> Result<&Dataset<T>> {
    target
        .as_any()
        .downcast_ref::<Dataset<T>>()
        .ok_or_else(|| Error::TypeMismatch {
            expected: type_name::<T>().to_string(),
            found: target.element_type(),
        })
}

fn hosted<S: Element>(results: ResultStream<Dataset<S>>) -> ResultStream<Hosted> {
    results
        .map(|item| item.map(|pr| pr.map_delta(|d| Arc::new(d) as Hosted)))
        .boxed()
}

fn unknown(method: Method, descriptor: &EncodedDescriptor) -> Error {
    Error::UnknownOperation {
        method: method.to_string(),
        kind: descriptor.kind.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::Encode;
    use crate::executor::Engine;
    use crate::partial::collect_results;
    use crate::sketches::Sum;
    use serde::{Deserialize, Serialize};

    #[derive(Serialize, Deserialize)]
    struct Negate;

    impl Descriptor for Negate {
        const KIND: &'static str = "negate";
    }

    impl Map<i64, i64> for Negate {
        fn apply(&self, data: &i64) -> anyhow::Result<i64> {
            Ok(-data)
        }
    }

    fn encoded<D: Descriptor>(d: &D) -> EncodedDescriptor {
        EncodedDescriptor {
            kind: D::KIND.to_string(),
            body: d.encode().unwrap(),
        }
    }

    #[tokio::test]
    async fn sketch_deltas_are_encoded() -> anyhow::Result<()> {
        let registry = OperationRegistry::new().with_sketch::<Vec<i64>, i64, Sum>();
        let target = Dataset::local(vec![2i64, 3], &Engine::inline());
        let out = collect_results(registry.sketch(&encoded(&Sum), &target)?).await?;
        let bytes = out[0].delta.clone().unwrap_or_default();
        assert_eq!(protocol::decode::<i64>(&bytes)?, 5);
        Ok(())
    }

    #[test]
    fn wrong_partition_type_is_reported() {
        let registry = OperationRegistry::new().with_map::<i64, i64, Negate>();
        let target = Dataset::local("text".to_string(), &Engine::inline());
        let err = registry
            .transform(Method::Map, &encoded(&Negate), &target)
            .err()
            .map(|e| e.to_string())
            .unwrap_or_default();
        assert!(err.contains("type mismatch"), "{err}");
    }

    #[test]
    fn method_is_part_of_the_key() {
        let registry = OperationRegistry::new().with_map::<i64, i64, Negate>();
        let target = Dataset::local(1i64, &Engine::inline());
        let result = registry.transform(Method::FlatMap, &encoded(&Negate), &target);
        assert!(matches!(result, Err(Error::UnknownOperation { .. })));
    }

    #[tokio::test]
    async fn generic_sketch_resolves_by_partition_type() -> anyhow::Result<()> {
        let registry = OperationRegistry::new()
            .with_sketch::<Vec<i64>, i64, Sum>()
            .with_sketch::<Vec<f64>, f64, Sum>();
        let engine = Engine::inline();

        let ints = Dataset::local(vec![1i64, 2], &engine);
        let out = collect_results(registry.sketch(&encoded(&Sum), &ints)?).await?;
        assert_eq!(protocol::decode::<i64>(&out[0].delta.clone().unwrap_or_default())?, 3);

        let floats = Dataset::local(vec![0.5f64, 0.25], &engine);
        let out = collect_results(registry.sketch(&encoded(&Sum), &floats)?).await?;
        assert_eq!(protocol::decode::<f64>(&out[0].delta.clone().unwrap_or_default())?, 0.75);
        Ok(())
    }

    #[test]
    fn unregistered_partition_type_names_the_known_ones() {
        let registry = OperationRegistry::new()
            .with_sketch::<Vec<i64>, i64, Sum>()
            .with_sketch::<Vec<f64>, f64, Sum>();
        let target = Dataset::local(vec![1u8], &Engine::inline());
        let err = registry
            .sketch(&encoded(&Sum), &target)
            .err()
            .map(|e| e.to_string())
            .unwrap_or_default();
        assert!(err.contains("Vec<f64> or alloc::vec::Vec<i64>"), "{err}");
        assert!(err.contains("found alloc::vec::Vec<u8>"), "{err}");
    }

    #[test]
    #[should_panic(expected = "registered twice")]
    fn duplicate_registration_panics() {
        let _ = OperationRegistry::new()
            .with_map::<i64, i64, Negate>()
            .with_map::<i64, i64, Negate>();
    }

    #[test]
    #[should_panic(expected = "registered twice")]
    fn duplicate_control_panics() {
        let _ = OperationRegistry::new().with_control::<PurgeMemoized>();
    }

    #[test]
    fn builtin_controls_are_known() -> anyhow::Result<()> {
        let registry = OperationRegistry::new();
        let message = registry.control(&encoded(&PurgeMemoized))?;
        assert_eq!(message.kind(), PurgeMemoized::KIND);
        Ok(())
    }
}
