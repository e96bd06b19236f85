//! Conversion between Lua values and JSON.
//!
//! Arguments arrive as JSON and are turned into Lua values; return values go
//! the other way. Tables with a contiguous `1..n` array part become JSON
//! arrays, every other table becomes an object keyed by the stringified key.

use mlua::{Lua, MultiValue, Result as LuaResult, Table, Value};
use serde_json::{Map, Number};

/// Deeper nesting is reported instead of recursing further (also stops
/// self-referencing tables).
const MAX_DEPTH: usize = 64;

pub fn lua_to_json(value: &Value) -> LuaResult<serde_json::Value> {
    to_json(value, 0)
}

fn to_json(value: &Value, depth: usize) -> LuaResult<serde_json::Value> {
    if depth > MAX_DEPTH {
        return Err(mlua::Error::runtime(format!(
            "value nested deeper than {MAX_DEPTH} levels (cyclic table?)"
        )));
    }

    match value {
        Value::Nil => Ok(serde_json::Value::Null),
        Value::Boolean(b) => Ok(serde_json::Value::Bool(*b)),
        Value::Integer(i) => Ok(serde_json::Value::Number((*i).into())),
        Value::Number(n) => Ok(Number::from_f64(*n)
            .map(serde_json::Value::Number)
            .unwrap_or_else(|| serde_json::Value::String(n.to_string()))),
        Value::String(s) => Ok(serde_json::Value::String(s.to_string_lossy().to_string())),
        Value::Table(table) => table_to_json(table, depth),
        other => Ok(serde_json::Value::String(format!("<{}>", other.type_name()))),
    }
}

fn table_to_json(table: &Table, depth: usize) -> LuaResult<serde_json::Value> {
    let len = table.raw_len();
    let mut entries = 0usize;
    for pair in table.clone().pairs::<Value, Value>() {
        pair?;
        entries += 1;
    }

    if len > 0 && entries == len {
        let mut arr = Vec::with_capacity(len);
        for i in 1..=len {
            let v: Value = table.raw_get(i)?;
            arr.push(to_json(&v, depth + 1)?);
        }
        return Ok(serde_json::Value::Array(arr));
    }

    let mut map = Map::new();
    for pair in table.clone().pairs::<Value, Value>() {
        let (k, v) = pair?;
        let key = match &k {
            Value::String(s) => s.to_string_lossy().to_string(),
            Value::Integer(i) => i.to_string(),
            Value::Number(n) => n.to_string(),
            Value::Boolean(b) => b.to_string(),
            other => format!("<{}>", other.type_name()),
        };
        map.insert(key, to_json(&v, depth + 1)?);
    }
    Ok(serde_json::Value::Object(map))
}

pub fn json_to_lua(lua: &Lua, value: &serde_json::Value) -> LuaResult<Value> {
    match value {
        serde_json::Value::Null => Ok(Value::Nil),
        serde_json::Value::Bool(b) => Ok(Value::Boolean(*b)),
        serde_json::Value::Number(n) => Ok(match n.as_i64() {
            Some(i) => Value::Integer(i),
            None => Value::Number(n.as_f64().unwrap_or(f64::NAN)),
        }),
        serde_json::Value::String(s) => Ok(Value::String(lua.create_string(s)?)),
        serde_json::Value::Array(items) => {
            let table = lua.create_table_with_capacity(items.len(), 0)?;
            for (i, item) in items.iter().enumerate() {
                table.raw_set(i + 1, json_to_lua(lua, item)?)?;
            }
            Ok(Value::Table(table))
        }
        serde_json::Value::Object(map) => {
            let table = lua.create_table_with_capacity(0, map.len())?;
            for (k, v) in map {
                table.raw_set(k.as_str(), json_to_lua(lua, v)?)?;
            }
            Ok(Value::Table(table))
        }
    }
}

pub fn json_args_to_lua(lua: &Lua, args: &[serde_json::Value]) -> LuaResult<MultiValue> {
    let values = args
        .iter()
        .map(|arg| json_to_lua(lua, arg))
        .collect::<LuaResult<Vec<_>>>()?;
    Ok(MultiValue::from_vec(values))
}
