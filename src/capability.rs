//! User capabilities consumed by the engine: maps, sketches, and zip combiners.
//!
//! A capability is a plain serializable value. Its [`Descriptor::KIND`] names it
//! on the wire, and the worker's
//! [`OperationRegistry`](crate::remote::OperationRegistry) maps that name back
//! to the concrete type, so dispatch never depends on runtime type inspection.
//!
//! ```
//! use serde::{Deserialize, Serialize};
//! use sketchflow::{Descriptor, Map};
//!
//! #[derive(Serialize, Deserialize)]
//! struct Scale(i64);
//!
//! impl Descriptor for Scale {
//!     const KIND: &'static str = "scale";
//! }
//!
//! impl Map<i64, i64> for Scale {
//!     fn apply(&self, data: &i64) -> anyhow::Result<i64> {
//!         Ok(data * self.0)
//!     }
//! }
//! ```

use crate::error::Result;
use crate::monoid::Monoid;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Bound for the partition type held by a leaf.
pub trait Element: 'static + Send + Sync {}
impl<T> Element for T where T: 'static + Send + Sync {}

/// Bound for values that flow back to the caller and cross the wire.
pub trait ResultBound: 'static + Send + Serialize + DeserializeOwned {}
impl<T> ResultBound for T where T: 'static + Send + Serialize + DeserializeOwned {}

/// A serializable capability with a stable wire name.
pub trait Descriptor: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Name under which the worker registry knows this capability.
    const KIND: &'static str;
}

/// Object-safe view of a [`Descriptor`]: its name and its encoding.
pub trait Encode: Send + Sync + 'static {
    fn kind(&self) -> &'static str;
    fn encode(&self) -> Result<Vec<u8>>;
}

impl<D: Descriptor> Encode for D {
    fn kind(&self) -> &'static str {
        D::KIND
    }

    fn encode(&self) -> Result<Vec<u8>> {
        Ok(postcard::to_allocvec(self)?)
    }
}

/// Pure function from one partition to another.
pub trait Map<T, S>: Descriptor {
    fn apply(&self, data: &T) -> anyhow::Result<S>;
}

/// Summary computation over a partition whose results form a commutative monoid.
pub trait Sketch<T, R>: Monoid<R> + Descriptor {
    /// Summarize one partition. Never called for the identity; use `zero`.
    fn create(&self, data: &T) -> anyhow::Result<R>;
}

/// Combines the partitions of two equally shaped datasets position by position.
pub trait Zipper<T, S, R>: Descriptor {
    fn combine(&self, left: &T, right: &S) -> anyhow::Result<R>;
}

/// Zip combiner that pairs both partitions.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct Pair;

impl Descriptor for Pair {
    const KIND: &'static str = "sketchflow.pair";
}

impl<T: Clone, S: Clone> Zipper<T, S, (T, S)> for Pair {
    fn combine(&self, left: &T, right: &S) -> anyhow::Result<(T, S)> {
        Ok((left.clone(), right.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Serialize, Deserialize)]
    struct Offset(i32);

    impl Descriptor for Offset {
        const KIND: &'static str = "offset";
    }

    #[test]
    fn encode_uses_kind_and_postcard() -> anyhow::Result<()> {
        let d = Offset(-3);
        assert_eq!(d.kind(), "offset");
        let bytes = d.encode()?;
        let back: Offset = postcard::from_bytes(&bytes)?;
        assert_eq!(back.0, -3);
        Ok(())
    }

    #[test]
    fn pair_clones_both_sides() -> anyhow::Result<()> {
        let out = Pair.combine(&1u8, &"x".to_string())?;
        assert_eq!(out, (1u8, "x".to_string()));
        Ok(())
    }
}
