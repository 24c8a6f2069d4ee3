//! Conversion between host values and script runtime values.
//!
//! Both directions are total over their input enums: anything that cannot be
//! represented fails with a [`MarshalError`] instead of being dropped.

use std::any::TypeId;
use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, SecondsFormat};

use crate::error::MarshalError;
use crate::schema::TypeHint;
use crate::value::{DataTree, ForeignObject, HostValue, RuntimeValue, TreePath};

/// Largest integer a runtime number holds exactly (2^53 - 1).
pub const MAX_SAFE_INTEGER: i64 = 9_007_199_254_740_991;

/// Maximum nesting of lists, records and trees.
pub const MAX_DEPTH: usize = 64;

/// Marker property identifying a serialized tree object.
pub const TREE_MARKER: &str = "$tree";
pub const TREE_BRANCHES: &str = "branches";

/// Maps opaque host objects to handles the runtime can hold.
pub trait ForeignBridge {
    /// Register the object's type if needed and hand out a handle for it.
    fn wrap(&mut self, object: &ForeignObject) -> (u64, String);

    /// Resolve a handle previously returned by [`wrap`](Self::wrap).
    fn unwrap(&self, id: u64) -> Option<ForeignObject>;
}

/// Handle table scoped to one execution.
///
/// Type registration is memoized by [`TypeId`]; later objects of a known type
/// only append to the handle list. Handles carry the fully qualified type
/// name so same-named types from different modules stay apart in script.
#[derive(Debug, Default)]
pub struct HandleTable {
    types: HashMap<TypeId, &'static str>,
    objects: Vec<ForeignObject>,
}

impl HandleTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of distinct host types seen so far.
    pub fn registered_types(&self) -> usize {
        self.types.len()
    }

    pub fn handle_count(&self) -> usize {
        self.objects.len()
    }
}

impl ForeignBridge for HandleTable {
    fn wrap(&mut self, object: &ForeignObject) -> (u64, String) {
        let type_name = *self.types.entry(object.type_id()).or_insert_with(|| {
            tracing::debug!(type_name = object.type_name(), "Registering foreign type");
            object.type_name()
        });
        let id = self.objects.len() as u64;
        self.objects.push(object.clone());
        (id, type_name.to_string())
    }

    fn unwrap(&self, id: u64) -> Option<ForeignObject> {
        usize::try_from(id)
            .ok()
            .and_then(|idx| self.objects.get(idx))
            .cloned()
    }
}

/// Convert a host value for the runtime, coercing scalars by `hint`.
pub fn to_runtime_value(
    host: &HostValue,
    hint: &TypeHint,
    bridge: &mut dyn ForeignBridge,
) -> Result<RuntimeValue, MarshalError> {
    to_runtime_at(host, hint, bridge, 0)
}

fn to_runtime_at(
    host: &HostValue,
    hint: &TypeHint,
    bridge: &mut dyn ForeignBridge,
    depth: usize,
) -> Result<RuntimeValue, MarshalError> {
    if depth > MAX_DEPTH {
        return Err(MarshalError::TooDeep(MAX_DEPTH));
    }
    if matches!(hint, TypeHint::Date)
        && let Some(millis) = date_millis(host)?
    {
        return Ok(RuntimeValue::Date(millis));
    }
    let coerced = coerce(host, hint)?;
    let host = coerced.as_ref().unwrap_or(host);

    Ok(match host {
        HostValue::Null => RuntimeValue::Null,
        HostValue::Bool(b) => RuntimeValue::Bool(*b),
        HostValue::Int(i) => int_to_runtime(*i),
        HostValue::UInt(u) => {
            if let Ok(i) = i64::try_from(*u) {
                int_to_runtime(i)
            } else {
                return Err(MarshalError::UnsupportedType(format!(
                    "unsigned integer {u} exceeds the 64-bit signed range"
                )));
            }
        }
        HostValue::Float(f) => RuntimeValue::Number(*f),
        HostValue::Char(c) => RuntimeValue::String(c.to_string()),
        HostValue::Text(s) => RuntimeValue::String(s.clone()),
        HostValue::List(items) => RuntimeValue::Array(
            items
                .iter()
                .map(|item| to_runtime_at(item, hint, bridge, depth + 1))
                .collect::<Result<_, _>>()?,
        ),
        HostValue::Tree(tree) => tree_to_runtime(tree, hint, bridge, depth)?,
        HostValue::Record(fields) => RuntimeValue::Object(
            fields
                .iter()
                .map(|(k, v)| Ok((k.clone(), to_runtime_at(v, &TypeHint::Any, bridge, depth + 1)?)))
                .collect::<Result<_, MarshalError>>()?,
        ),
        HostValue::Object(object) => {
            let (id, type_name) = bridge.wrap(object);
            RuntimeValue::ForeignHandle { id, type_name }
        }
    })
}

fn int_to_runtime(i: i64) -> RuntimeValue {
    if (-MAX_SAFE_INTEGER..=MAX_SAFE_INTEGER).contains(&i) {
        RuntimeValue::Number(i as f64)
    } else {
        RuntimeValue::BigInt(i)
    }
}

fn tree_to_runtime(
    tree: &DataTree,
    hint: &TypeHint,
    bridge: &mut dyn ForeignBridge,
    depth: usize,
) -> Result<RuntimeValue, MarshalError> {
    let mut branches = Vec::with_capacity(tree.branch_count());
    for (path, items) in tree.branches() {
        let path = path
            .indices()
            .iter()
            .map(|i| RuntimeValue::Number(f64::from(*i)))
            .collect();
        let items = items
            .iter()
            .map(|item| to_runtime_at(item, hint, bridge, depth + 2))
            .collect::<Result<_, _>>()?;
        let mut branch = BTreeMap::new();
        branch.insert("path".to_string(), RuntimeValue::Array(path));
        branch.insert("items".to_string(), RuntimeValue::Array(items));
        branches.push(RuntimeValue::Object(branch));
    }
    let mut object = BTreeMap::new();
    object.insert(TREE_MARKER.to_string(), RuntimeValue::Bool(true));
    object.insert(TREE_BRANCHES.to_string(), RuntimeValue::Array(branches));
    Ok(RuntimeValue::Object(object))
}

/// Apply a slot's type hint to a scalar. `None` means "use as is".
fn coerce(host: &HostValue, hint: &TypeHint) -> Result<Option<HostValue>, MarshalError> {
    let coerced = match (hint, host) {
        (TypeHint::Number, HostValue::Text(s)) => {
            let trimmed = s.trim();
            let value = trimmed.parse::<i64>().map(HostValue::Int).or_else(|_| {
                trimmed.parse::<f64>().map(HostValue::Float).map_err(|_| {
                    MarshalError::UnsupportedType(format!("text `{s}` is not a number"))
                })
            })?;
            Some(value)
        }
        (TypeHint::Number, HostValue::Bool(b)) => Some(HostValue::Int(i64::from(*b))),
        (TypeHint::String, HostValue::Bool(b)) => Some(HostValue::Text(b.to_string())),
        (TypeHint::String, HostValue::Int(i)) => Some(HostValue::Text(i.to_string())),
        (TypeHint::String, HostValue::UInt(u)) => Some(HostValue::Text(u.to_string())),
        (TypeHint::String, HostValue::Float(f)) => Some(HostValue::Text(f.to_string())),
        (TypeHint::String, HostValue::Char(c)) => Some(HostValue::Text(c.to_string())),
        (TypeHint::Boolean, HostValue::Int(i)) => Some(HostValue::Bool(*i != 0)),
        (TypeHint::Boolean, HostValue::UInt(u)) => Some(HostValue::Bool(*u != 0)),
        (TypeHint::Boolean, HostValue::Float(f)) => Some(HostValue::Bool(*f != 0.0)),
        (TypeHint::Boolean, HostValue::Text(s)) => match s.trim().to_ascii_lowercase().as_str() {
            "true" => Some(HostValue::Bool(true)),
            "false" => Some(HostValue::Bool(false)),
            _ => {
                return Err(MarshalError::UnsupportedType(format!(
                    "text `{s}` is not a boolean"
                )));
            }
        },
        _ => None,
    };
    Ok(coerced)
}

/// Epoch milliseconds for a `Date`-hinted scalar. Numbers are taken as
/// milliseconds already; text must be an ISO-8601 date or date-time.
fn date_millis(host: &HostValue) -> Result<Option<f64>, MarshalError> {
    Ok(match host {
        HostValue::Int(i) => Some(*i as f64),
        HostValue::UInt(u) => Some(*u as f64),
        HostValue::Float(f) => Some(*f),
        HostValue::Text(s) => Some(parse_date(s)?),
        _ => None,
    })
}

/// Date-times without an offset, and bare dates, are taken as UTC.
fn parse_date(text: &str) -> Result<f64, MarshalError> {
    let s = text.trim();
    let millis = DateTime::parse_from_rfc3339(s)
        .map(|d| d.timestamp_millis())
        .or_else(|_| {
            NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
                .map(|d| d.and_utc().timestamp_millis())
        })
        .or_else(|_| {
            NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .map(|d| d.and_time(NaiveTime::MIN).and_utc().timestamp_millis())
        })
        .map_err(|_| MarshalError::UnsupportedType(format!("text `{text}` is not a date")))?;
    Ok(millis as f64)
}

/// ISO-8601 text for epoch milliseconds, in the form `Date.toISOString` uses.
fn date_text(millis: f64) -> Result<String, MarshalError> {
    millis
        .is_finite()
        .then(|| DateTime::from_timestamp_millis(millis as i64))
        .flatten()
        .map(|d| d.to_rfc3339_opts(SecondsFormat::Millis, true))
        .ok_or_else(|| MarshalError::UnsupportedType(format!("invalid date ({millis} ms)")))
}

/// Convert a runtime value back for the host.
///
/// `Ok(None)` means the script produced no value (`undefined`), which is
/// distinct from an explicit null.
pub fn from_runtime_value(
    value: &RuntimeValue,
    bridge: &dyn ForeignBridge,
) -> Result<Option<HostValue>, MarshalError> {
    match value {
        RuntimeValue::Undefined => Ok(None),
        other => from_runtime_at(other, bridge, 0).map(Some),
    }
}

fn from_runtime_at(
    value: &RuntimeValue,
    bridge: &dyn ForeignBridge,
    depth: usize,
) -> Result<HostValue, MarshalError> {
    if depth > MAX_DEPTH {
        return Err(MarshalError::TooDeep(MAX_DEPTH));
    }
    Ok(match value {
        RuntimeValue::Null | RuntimeValue::Undefined => HostValue::Null,
        RuntimeValue::Bool(b) => HostValue::Bool(*b),
        RuntimeValue::Number(n) => number_to_host(*n),
        RuntimeValue::BigInt(i) => HostValue::Int(*i),
        RuntimeValue::String(s) => HostValue::Text(s.clone()),
        RuntimeValue::Date(millis) => HostValue::Text(date_text(*millis)?),
        RuntimeValue::Array(items) => HostValue::List(
            items
                .iter()
                .map(|item| from_runtime_at(item, bridge, depth + 1))
                .collect::<Result<_, _>>()?,
        ),
        RuntimeValue::ForeignHandle { id, .. } => HostValue::Object(
            bridge
                .unwrap(*id)
                .ok_or(MarshalError::UnknownHandle(*id))?,
        ),
        RuntimeValue::Object(fields) if is_tree(fields) => {
            HostValue::Tree(tree_from_runtime(fields, bridge, depth)?)
        }
        RuntimeValue::Object(fields) => {
            let mut record = BTreeMap::new();
            for (key, field) in fields {
                if matches!(field, RuntimeValue::Undefined) {
                    continue;
                }
                record.insert(key.clone(), from_runtime_at(field, bridge, depth + 1)?);
            }
            HostValue::Record(record)
        }
        RuntimeValue::Unclassified(type_name) => {
            return Err(MarshalError::Unclassified(type_name.clone()));
        }
    })
}

fn number_to_host(n: f64) -> HostValue {
    if n.is_finite() && n.fract() == 0.0 && n.abs() <= MAX_SAFE_INTEGER as f64 {
        HostValue::Int(n as i64)
    } else {
        HostValue::Float(n)
    }
}

/// True for objects carrying the tree marker.
pub fn is_tree(fields: &BTreeMap<String, RuntimeValue>) -> bool {
    matches!(fields.get(TREE_MARKER), Some(RuntimeValue::Bool(true)))
}

fn tree_from_runtime(
    fields: &BTreeMap<String, RuntimeValue>,
    bridge: &dyn ForeignBridge,
    depth: usize,
) -> Result<DataTree, MarshalError> {
    let branches = match fields.get(TREE_BRANCHES) {
        Some(RuntimeValue::Array(branches)) => branches,
        None | Some(RuntimeValue::Undefined) => return Ok(DataTree::new()),
        Some(other) => {
            return Err(MarshalError::MalformedTree(format!(
                "`branches` is a {}, expected an array",
                other.type_name()
            )));
        }
    };

    let mut tree = DataTree::new();
    for branch in branches {
        let Some(branch) = branch.as_object() else {
            return Err(MarshalError::MalformedTree(format!(
                "branch is a {}, expected an object",
                branch.type_name()
            )));
        };
        let path = match branch.get("path") {
            Some(RuntimeValue::Array(indices)) => tree_path(indices)?,
            _ => return Err(MarshalError::MalformedTree("branch without a `path` array".into())),
        };
        let items = match branch.get("items") {
            Some(RuntimeValue::Array(items)) => items
                .iter()
                .map(|item| from_runtime_at(item, bridge, depth + 2))
                .collect::<Result<Vec<_>, _>>()?,
            None | Some(RuntimeValue::Undefined) => Vec::new(),
            Some(_) => return Err(MarshalError::MalformedTree("`items` must be an array".into())),
        };
        let mut merged = tree.branch(&path).map(<[_]>::to_vec).unwrap_or_default();
        merged.extend(items);
        tree.insert_branch(path, merged);
    }
    Ok(tree)
}

fn tree_path(indices: &[RuntimeValue]) -> Result<TreePath, MarshalError> {
    indices
        .iter()
        .map(|idx| match idx {
            RuntimeValue::Number(n) if n.fract() == 0.0 && *n >= 0.0 && *n <= f64::from(u32::MAX) => {
                Ok(*n as u32)
            }
            other => Err(MarshalError::MalformedTree(format!(
                "path index must be a non-negative integer, got {other:?}"
            ))),
        })
        .collect::<Result<Vec<_>, _>>()
        .map(TreePath)
}
