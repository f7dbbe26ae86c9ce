use crate::value::Value;
use indexmap::IndexMap;
use mlua::{FromLua, IntoLua, Lua};
use std::ffi::c_void;

impl IntoLua for Value {
    fn into_lua(self, lua: &Lua) -> mlua::Result<mlua::Value> {
        match self {
            Value::Nil => Ok(mlua::Value::Nil),
            Value::Bool(b) => Ok(mlua::Value::Boolean(b)),
            Value::Int(i) => Ok(mlua::Value::Integer(i)),
            Value::Float(n) => Ok(mlua::Value::Number(n)),
            Value::Str(s) => lua.create_string(&s).map(mlua::Value::String),
            Value::List(items) => {
                let table = lua.create_table_with_capacity(items.len(), 0)?;
                for (i, item) in items.into_iter().enumerate() {
                    table.raw_set(i + 1, item)?;
                }
                Ok(mlua::Value::Table(table))
            }
            Value::Map(entries) => {
                let table = lua.create_table_with_capacity(0, entries.len())?;
                for (key, item) in entries {
                    table.raw_set(key, item)?;
                }
                Ok(mlua::Value::Table(table))
            }
        }
    }
}

/// 表嵌套的最大深度
const MAX_DEPTH: usize = 128;

impl FromLua for Value {
    fn from_lua(value: mlua::Value, lua: &Lua) -> mlua::Result<Self> {
        let mut ancestors = Vec::new();
        from_lua_value(value, lua, &mut ancestors)
    }
}

/// `ancestors` 为当前递归路径上的表；再次遇到即为循环引用
fn from_lua_value(
    value: mlua::Value,
    lua: &Lua,
    ancestors: &mut Vec<*const c_void>,
) -> mlua::Result<Value> {
    match value {
        mlua::Value::Nil => Ok(Value::Nil),
        mlua::Value::Boolean(b) => Ok(Value::Bool(b)),
        mlua::Value::Integer(i) => Ok(Value::Int(i)),
        mlua::Value::Number(n) => Ok(Value::Float(n)),
        mlua::Value::String(s) => Ok(Value::Str(s.to_string_lossy())),
        mlua::Value::Table(table) => {
            let pointer = table.to_pointer();
            if ancestors.contains(&pointer) {
                return Err(mlua::Error::external("表中存在循环引用"));
            }
            if ancestors.len() >= MAX_DEPTH {
                return Err(mlua::Error::external(format!("表嵌套超过 {MAX_DEPTH} 层")));
            }
            ancestors.push(pointer);
            let converted = table_to_value(&table, lua, ancestors);
            ancestors.pop();
            converted
        }
        other => Ok(Value::Str(stringify(lua, other)?)),
    }
}

fn table_to_value(
    table: &mlua::Table,
    lua: &Lua,
    ancestors: &mut Vec<*const c_void>,
) -> mlua::Result<Value> {
    let len = table.raw_len();
    let mut pairs = Vec::new();
    for pair in table.pairs::<mlua::Value, mlua::Value>() {
        pairs.push(pair?);
    }
    // 1..=n 连续整数键视为序列
    if len > 0 && pairs.len() == len {
        let mut items = Vec::with_capacity(len);
        for i in 1..=len {
            items.push(from_lua_value(table.raw_get(i)?, lua, ancestors)?);
        }
        return Ok(Value::List(items));
    }
    let mut entries = IndexMap::with_capacity(pairs.len());
    for (key, item) in pairs {
        entries.insert(stringify(lua, key)?, from_lua_value(item, lua, ancestors)?);
    }
    Ok(Value::Map(entries))
}

/// 输出用字符串形式：nil 为空串，字符串原样，其余经 `tostring`
pub fn stringify(lua: &Lua, value: mlua::Value) -> mlua::Result<String> {
    match value {
        mlua::Value::Nil => Ok(String::new()),
        mlua::Value::String(s) => Ok(s.to_string_lossy()),
        other => {
            let tostring: mlua::Function = lua.globals().get("tostring")?;
            tostring.call::<String>(other)
        }
    }
}
