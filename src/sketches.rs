//! Built-in sketches over `Vec<T>` partitions: Sum, Count, Min, Max.
//!
//! Each is a unit struct, so it encodes to nothing on the wire; register it on
//! a worker once for every partition type it is used at, e.g.
//! `registry.with_sketch::<Vec<i64>, i64, Sum>().with_sketch::<Vec<f64>, f64, Sum>()`.

use crate::capability::{Descriptor, Sketch};
use crate::monoid::Monoid;
use serde::{Deserialize, Serialize};
use std::ops::Add;

/* ===================== Sum ===================== */

/// Sum of all values.
///
/// Requires `T: Add<Output = T> + Default`; the default is the identity.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct Sum;

impl Descriptor for Sum {
    const KIND: &'static str = "sketchflow.sum";
}

impl<T> Monoid<T> for Sum
where
    T: Add<Output = T> + Default,
{
    fn zero(&self) -> T {
        T::default()
    }

    fn add(&self, left: T, right: T) -> T {
        left + right
    }
}

impl<T> Sketch<Vec<T>, T> for Sum
where
    T: Add<Output = T> + Default + Clone,
{
    fn create(&self, data: &Vec<T>) -> anyhow::Result<T> {
        Ok(data.iter().cloned().fold(T::default(), |a, v| a + v))
    }
}

/* ===================== Count ===================== */

/// Number of values.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct Count;

impl Descriptor for Count {
    const KIND: &'static str = "sketchflow.count";
}

impl Monoid<u64> for Count {
    fn zero(&self) -> u64 {
        0
    }

    fn add(&self, left: u64, right: u64) -> u64 {
        left + right
    }
}

impl<T> Sketch<Vec<T>, u64> for Count {
    fn create(&self, data: &Vec<T>) -> anyhow::Result<u64> {
        Ok(data.len() as u64)
    }
}

/* ===================== Min / Max ===================== */

/// Smallest value, `None` for no values at all.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct Min;

impl Descriptor for Min {
    const KIND: &'static str = "sketchflow.min";
}

impl<T: Ord> Monoid<Option<T>> for Min {
    fn zero(&self) -> Option<T> {
        None
    }

    fn add(&self, left: Option<T>, right: Option<T>) -> Option<T> {
        match (left, right) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }
}

impl<T: Ord + Clone> Sketch<Vec<T>, Option<T>> for Min {
    fn create(&self, data: &Vec<T>) -> anyhow::Result<Option<T>> {
        Ok(data.iter().min().cloned())
    }
}

/// Largest value, `None` for no values at all.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct Max;

impl Descriptor for Max {
    const KIND: &'static str = "sketchflow.max";
}

impl<T: Ord> Monoid<Option<T>> for Max {
    fn zero(&self) -> Option<T> {
        None
    }

    fn add(&self, left: Option<T>, right: Option<T>) -> Option<T> {
        match (left, right) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        }
    }
}

impl<T: Ord + Clone> Sketch<Vec<T>, Option<T>> for Max {
    fn create(&self, data: &Vec<T>) -> anyhow::Result<Option<T>> {
        Ok(data.iter().max().cloned())
    }
}
