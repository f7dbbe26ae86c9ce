use crate::template::path;
use mlua::Lua;
use std::path::{Path, PathBuf};

/// 移除可执行外部命令或逃出根目录的库函数；`io` 中接受文件名的函数限制在 `rootdir` 之内
pub fn apply(lua: &Lua, rootdir: &Path) -> mlua::Result<()> {
    let globals = lua.globals();
    for name in ["dofile", "loadfile", "require"] {
        globals.set(name, mlua::Value::Nil)?;
    }

    let os: mlua::Table = globals.get("os")?;
    for name in ["execute", "exit", "remove", "rename", "tmpname"] {
        os.set(name, mlua::Value::Nil)?;
    }

    let io: mlua::Table = globals.get("io")?;
    io.set("popen", mlua::Value::Nil)?;

    let original_open: mlua::Function = io.get("open")?;
    let root = rootdir.to_path_buf();
    let safe_open = lua.create_function(move |_, (file, mode): (String, Option<String>)| {
        let full = resolve_path(&root, &file)?;
        let mode = mode.unwrap_or_else(|| "r".to_string());
        original_open.call::<mlua::MultiValue>((full.to_string_lossy().to_string(), mode))
    })?;
    io.set("open", safe_open)?;

    // 首个参数为文件名时才需检查，文件句柄与无参调用照常转发
    for name in ["lines", "input", "output"] {
        let original: mlua::Function = io.get(name)?;
        let root = rootdir.to_path_buf();
        let confined = lua.create_function(move |lua, mut args: mlua::MultiValue| {
            if let Some(mlua::Value::String(file)) = args.front() {
                let full = resolve_path(&root, &file.to_string_lossy())?;
                let full = lua.create_string(full.to_string_lossy().as_bytes())?;
                args[0] = mlua::Value::String(full);
            }
            original.call::<mlua::MultiValue>(args)
        })?;
        io.set(name, confined)?;
    }

    Ok(())
}

/// 相对路径基于 `rootdir`；结果必须仍在 `rootdir` 之内
pub fn resolve_path(rootdir: &Path, file: &str) -> mlua::Result<PathBuf> {
    let requested = Path::new(file);
    let full = if requested.is_absolute() {
        requested.to_path_buf()
    } else {
        rootdir.join(requested)
    };
    path::check_segments(requested)
        .and_then(|()| path::ensure_within(&full, rootdir))
        .map_err(mlua::Error::external)?;
    Ok(full)
}
