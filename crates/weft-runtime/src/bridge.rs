//! [`RuntimeValue`] <-> QuickJS value conversion.

use std::collections::BTreeMap;

use rquickjs::{Array, BigInt, CaughtError, Ctx, Function, Object, Type, Value};
use weft_core::MarshalError;
use weft_core::marshal::{MAX_DEPTH, TREE_BRANCHES, TREE_MARKER, is_tree};
use weft_core::value::{RuntimeValue, display_type_name};

use crate::error::RuntimeError;

const HANDLE_ID: &str = "$handle";
const HANDLE_TYPE: &str = "$type";

/// Helpers installed by the prelude under `globalThis.__weft`.
pub(crate) fn helpers<'js>(ctx: &Ctx<'js>) -> rquickjs::Result<Object<'js>> {
    ctx.globals().get("__weft")
}

pub(crate) fn to_js<'js>(
    ctx: &Ctx<'js>,
    value: &RuntimeValue,
) -> Result<Value<'js>, RuntimeError> {
    let helpers = helpers(ctx).or_fault(ctx)?;
    to_js_at(ctx, &helpers, value, 0)
}

fn to_js_at<'js>(
    ctx: &Ctx<'js>,
    helpers: &Object<'js>,
    value: &RuntimeValue,
    depth: usize,
) -> Result<Value<'js>, RuntimeError> {
    if depth > MAX_DEPTH {
        return Err(MarshalError::TooDeep(MAX_DEPTH).into());
    }
    let js = match value {
        RuntimeValue::Null => Value::new_null(ctx.clone()),
        RuntimeValue::Undefined => Value::new_undefined(ctx.clone()),
        RuntimeValue::Bool(b) => Value::new_bool(ctx.clone(), *b),
        RuntimeValue::Number(n) => Value::new_number(ctx.clone(), *n),
        RuntimeValue::BigInt(i) => BigInt::from_i64(ctx.clone(), *i)
            .or_fault(ctx)?
            .into_value(),
        RuntimeValue::String(s) => rquickjs::String::from_str(ctx.clone(), s)
            .or_fault(ctx)?
            .into_value(),
        RuntimeValue::Date(millis) => {
            let make_date: Function = helpers.get("makeDate").or_fault(ctx)?;
            make_date.call((*millis,)).or_fault(ctx)?
        }
        RuntimeValue::Array(items) => {
            let array = Array::new(ctx.clone()).or_fault(ctx)?;
            for (i, item) in items.iter().enumerate() {
                let item = to_js_at(ctx, helpers, item, depth + 1)?;
                array.set(i, item).or_fault(ctx)?;
            }
            array.into_value()
        }
        RuntimeValue::Object(fields) => {
            let object = Object::new(ctx.clone()).or_fault(ctx)?;
            for (key, field) in fields {
                let field = to_js_at(ctx, helpers, field, depth + 1)?;
                object.set(key.as_str(), field).or_fault(ctx)?;
            }
            if is_tree(fields) {
                let make_tree: Function = helpers.get("makeTree").or_fault(ctx)?;
                let branches: Value = object.get(TREE_BRANCHES).or_fault(ctx)?;
                make_tree.call((branches,)).or_fault(ctx)?
            } else {
                object.into_value()
            }
        }
        RuntimeValue::ForeignHandle { id, type_name } => {
            let wrap: Function = helpers.get("wrapHandle").or_fault(ctx)?;
            wrap.call((*id as f64, type_name.as_str(), display_type_name(type_name)))
                .or_fault(ctx)?
        }
        RuntimeValue::Unclassified(type_name) => {
            return Err(MarshalError::Unclassified(type_name.clone()).into());
        }
    };
    Ok(js)
}

pub(crate) fn from_js<'js>(ctx: &Ctx<'js>, value: Value<'js>) -> Result<RuntimeValue, RuntimeError> {
    let date: Option<Object> = ctx.globals().get("Date").ok();
    from_js_at(ctx, &value, date.as_ref(), 0)
}

fn from_js_at<'js>(
    ctx: &Ctx<'js>,
    value: &Value<'js>,
    date: Option<&Object<'js>>,
    depth: usize,
) -> Result<RuntimeValue, RuntimeError> {
    if depth > MAX_DEPTH {
        return Err(MarshalError::TooDeep(MAX_DEPTH).into());
    }
    let converted = match value.type_of() {
        Type::Uninitialized | Type::Undefined => RuntimeValue::Undefined,
        Type::Null => RuntimeValue::Null,
        Type::Bool => RuntimeValue::Bool(value.as_bool().unwrap_or_default()),
        Type::Int | Type::Float => RuntimeValue::Number(value.as_number().unwrap_or(f64::NAN)),
        Type::BigInt => {
            let big = value
                .as_big_int()
                .cloned()
                .ok_or_else(|| MarshalError::Unclassified("bigint".into()))?;
            let i = big.to_i64().map_err(|_| {
                MarshalError::UnsupportedType("bigint outside the 64-bit signed range".into())
            })?;
            RuntimeValue::BigInt(i)
        }
        Type::String => {
            let s = value
                .as_string()
                .map(|s| s.to_string())
                .transpose()
                .or_fault(ctx)?
                .unwrap_or_default();
            RuntimeValue::String(s)
        }
        Type::Array => {
            let array = value
                .as_array()
                .ok_or_else(|| MarshalError::Unclassified("array".into()))?;
            let mut items = Vec::with_capacity(array.len());
            for item in array.iter::<Value>() {
                let item = item.or_fault(ctx)?;
                items.push(from_js_at(ctx, &item, date, depth + 1)?);
            }
            RuntimeValue::Array(items)
        }
        Type::Object | Type::Exception => {
            let object = value
                .as_object()
                .ok_or_else(|| MarshalError::Unclassified("object".into()))?;
            object_from_js(ctx, object, date, depth)?
        }
        other => RuntimeValue::Unclassified(other.as_str().to_string()),
    };
    Ok(converted)
}

fn object_from_js<'js>(
    ctx: &Ctx<'js>,
    object: &Object<'js>,
    date: Option<&Object<'js>>,
    depth: usize,
) -> Result<RuntimeValue, RuntimeError> {
    let handle: Option<f64> = object.get(HANDLE_ID).or_fault(ctx)?;
    if let Some(id) = handle {
        let type_name: Option<String> = object.get(HANDLE_TYPE).or_fault(ctx)?;
        return Ok(RuntimeValue::ForeignHandle {
            id: id as u64,
            type_name: type_name.unwrap_or_default(),
        });
    }

    if let Some(date) = date
        && object.is_instance_of(date)
    {
        let get_time: Function = object.get("getTime").or_fault(ctx)?;
        let millis: f64 = get_time
            .call((rquickjs::function::This(object.clone()),))
            .or_fault(ctx)?;
        return Ok(RuntimeValue::Date(millis));
    }

    let marker: Option<bool> = object.get(TREE_MARKER).or_fault(ctx)?;
    if marker == Some(true) {
        let branches: Value = object.get(TREE_BRANCHES).or_fault(ctx)?;
        let mut fields = BTreeMap::new();
        fields.insert(TREE_MARKER.to_string(), RuntimeValue::Bool(true));
        fields.insert(
            TREE_BRANCHES.to_string(),
            from_js_at(ctx, &branches, date, depth + 1)?,
        );
        return Ok(RuntimeValue::Object(fields));
    }

    let mut fields = BTreeMap::new();
    for prop in object.props::<String, Value>() {
        let (key, field) = prop.or_fault(ctx)?;
        fields.insert(key, from_js_at(ctx, &field, date, depth + 1)?);
    }
    Ok(RuntimeValue::Object(fields))
}

/// Converts engine results, pulling the pending exception out of the context.
pub(crate) trait ScriptResultExt<T> {
    fn or_fault(self, ctx: &Ctx<'_>) -> Result<T, RuntimeError>;
}

impl<T> ScriptResultExt<T> for rquickjs::Result<T> {
    fn or_fault(self, ctx: &Ctx<'_>) -> Result<T, RuntimeError> {
        self.map_err(|err| script_error(ctx, err))
    }
}

/// Out-of-memory leaves the engine unusable and is reported as a fault;
/// everything else is an error raised by the script.
pub(crate) fn script_error(ctx: &Ctx<'_>, err: rquickjs::Error) -> RuntimeError {
    if matches!(err, rquickjs::Error::Allocation) {
        return RuntimeError::Fault("script engine out of memory".into());
    }
    let message = CaughtError::from_error(ctx, err).to_string();
    if message.contains("out of memory") {
        RuntimeError::Fault(message.trim_end().to_string())
    } else {
        RuntimeError::Script(message.trim_end().to_string())
    }
}
