//! Folding per-shard results into one result for the whole dataset.

use indexmap::IndexMap;
use log::warn;
use serde_json::{Map, Number, Value};
use thiserror::Error;

use super::DispatchError;

/// The shape of one shard's result.
#[derive(Debug, Clone, PartialEq)]
pub enum ShardReturn {
    /// A success flag.
    Bool(bool),
    /// Counters, possibly nested, to be summed across shards.
    Count(Map<String, Value>),
    /// Nothing.
    Empty,
    /// Anything else.
    Named(Value),
}

impl From<Value> for ShardReturn {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => Self::Empty,
            Value::Bool(b) => Self::Bool(b),
            Value::Object(map) => Self::Count(map),
            other => Self::Named(other),
        }
    }
}

/// A shard whose job did not complete.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("shard {shard} failed: {cause}")]
pub struct ShardFailure {
    /// The sub-dataset.
    pub shard: String,
    /// What went wrong.
    pub cause: String,
}

/// The result for a whole sharded dataset.
#[derive(Debug, Clone, PartialEq)]
pub enum Consolidated {
    /// Every shard returned a flag, or failed. `success` is the AND over all shards, with
    /// failed shards counted as `false`.
    Bool {
        /// AND of every shard
        success: bool,
        /// shards which failed or returned `false`
        failures: Vec<ShardFailure>,
    },
    /// Every shard returned counters; these are their sums.
    Counts(Map<String, Value>),
    /// Every shard returned nothing.
    Empty,
    /// Mixed shapes, or failures alongside non-flag returns. Keyed by shard.
    Named(IndexMap<String, Result<ShardReturn, ShardFailure>>),
}

impl Consolidated {
    /// Every shard failure recorded in the result.
    pub fn failures(&self) -> Vec<&ShardFailure> {
        match self {
            Self::Bool { failures, .. } => failures.iter().collect(),
            Self::Named(map) => map.values().filter_map(|r| r.as_ref().err()).collect(),
            Self::Counts(_) | Self::Empty => vec![],
        }
    }

    /// Whether every shard succeeded.
    pub fn is_success(&self) -> bool {
        match self {
            Self::Bool { success, .. } => *success,
            other => other.failures().is_empty(),
        }
    }
}

/// Fold `results`, given in shard order, into one result.
///
/// # Errors
///
/// Returns [`DispatchError::ShardCountMismatch`] if `results` and `shards` differ in length, or
/// [`DispatchError::UnsupportedShape`] if counters can't be summed.
pub fn consolidate(
    results: Vec<Result<ShardReturn, ShardFailure>>,
    shards: &[String],
) -> Result<Consolidated, DispatchError> {
    if results.len() != shards.len() {
        return Err(DispatchError::ShardCountMismatch {
            results: results.len(),
            shards: shards.len(),
        });
    }
    if results.is_empty() {
        return Ok(Consolidated::Empty);
    }

    let any_failed = results.iter().any(Result::is_err);

    if results
        .iter()
        .all(|r| matches!(r, Ok(ShardReturn::Bool(_)) | Err(_)))
    {
        let failures: Vec<ShardFailure> = results
            .into_iter()
            .zip(shards)
            .filter_map(|(result, shard)| match result {
                Ok(ShardReturn::Bool(true)) => None,
                Ok(_) => Some(ShardFailure {
                    shard: shard.clone(),
                    cause: "returned false".into(),
                }),
                Err(failure) => Some(failure),
            })
            .collect();
        for failure in &failures {
            warn!("{}", failure);
        }
        return Ok(Consolidated::Bool {
            success: failures.is_empty(),
            failures,
        });
    }

    if !any_failed
        && results
            .iter()
            .all(|r| matches!(r, Ok(ShardReturn::Count(_))))
    {
        let mut total = Map::new();
        for result in results {
            if let Ok(ShardReturn::Count(counts)) = result {
                sum_into(&mut total, counts, "")?;
            }
        }
        return Ok(Consolidated::Counts(total));
    }

    if !any_failed && results.iter().all(|r| matches!(r, Ok(ShardReturn::Empty))) {
        return Ok(Consolidated::Empty);
    }

    Ok(Consolidated::Named(
        shards.iter().cloned().zip(results).collect(),
    ))
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "a mapping",
    }
}

fn add_numbers(a: &Number, b: &Number) -> Option<Number> {
    if let (Some(x), Some(y)) = (a.as_i64(), b.as_i64()) {
        if let Some(sum) = x.checked_add(y) {
            return Some(sum.into());
        }
    }
    if let (Some(x), Some(y)) = (a.as_u64(), b.as_u64()) {
        if let Some(sum) = x.checked_add(y) {
            return Some(sum.into());
        }
    }
    Number::from_f64(a.as_f64()? + b.as_f64()?)
}

/// Add `from` into `into` key by key. Numbers are summed, mappings recursed into, and strings
/// take the latest value.
fn sum_into(
    into: &mut Map<String, Value>,
    from: Map<String, Value>,
    prefix: &str,
) -> Result<(), DispatchError> {
    for (key, value) in from {
        let path = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{prefix}.{key}")
        };
        let unsupported = |found: String| DispatchError::UnsupportedShape {
            key: path.clone(),
            found,
        };
        match value {
            Value::Object(inner) => match into.get_mut(&key) {
                Some(Value::Object(existing)) => sum_into(existing, inner, &path)?,
                Some(existing) => {
                    return Err(unsupported(format!(
                        "a mapping where {} was expected",
                        kind_of(existing)
                    )))
                }
                None => {
                    let mut fresh = Map::new();
                    sum_into(&mut fresh, inner, &path)?;
                    into.insert(key, Value::Object(fresh));
                }
            },
            Value::Number(n) => match into.get_mut(&key) {
                Some(Value::Number(existing)) => {
                    *existing = add_numbers(existing, &n)
                        .ok_or_else(|| unsupported("a sum which is not finite".into()))?;
                }
                Some(existing) => {
                    return Err(unsupported(format!(
                        "a number where {} was expected",
                        kind_of(existing)
                    )))
                }
                None => {
                    into.insert(key, Value::Number(n));
                }
            },
            Value::String(s) => match into.get_mut(&key) {
                Some(existing) if existing.is_string() => *existing = Value::String(s),
                Some(existing) => {
                    return Err(unsupported(format!(
                        "a string where {} was expected",
                        kind_of(existing)
                    )))
                }
                None => {
                    into.insert(key, Value::String(s));
                }
            },
            other => return Err(unsupported(kind_of(&other).to_string())),
        }
    }
    Ok(())
}
