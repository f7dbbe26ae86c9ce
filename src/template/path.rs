use crate::error::{Result, TemplateError};
use std::path::{Component, Path, PathBuf};

/// 拒绝含 `..` 段或以 `~` 开头的路径
pub fn check_segments(path: &Path) -> Result<()> {
    if path.to_string_lossy().starts_with('~') {
        return Err(TemplateError::security(path, "不允许以 '~' 开头"));
    }
    if path.components().any(|c| matches!(c, Component::ParentDir)) {
        return Err(TemplateError::security(path, "路径包含 '..'"));
    }
    Ok(())
}

/// 校验后转换为绝对路径（不访问文件系统）
pub fn absolutize(path: &Path) -> Result<PathBuf> {
    check_segments(path)?;
    std::path::absolute(path).map_err(|e| TemplateError::io(path, e))
}

/// `path` 必须等于 `root` 或位于其下
pub fn ensure_within(path: &Path, root: &Path) -> Result<()> {
    if !path.starts_with(root) {
        return Err(TemplateError::security(
            path,
            format!("不在 {} 之内", root.display()),
        ));
    }
    Ok(())
}

/// 解析包含名：以 `/` 开头相对 `rootdir`，否则相对当前 `workdir`
pub fn resolve_include(name: &str, workdir: &Path, rootdir: &Path) -> Result<PathBuf> {
    check_segments(Path::new(name))?;
    let full = match name.strip_prefix('/') {
        Some(rooted) => rootdir.join(rooted.trim_start_matches('/')),
        None => workdir.join(name),
    };
    ensure_within(&full, rootdir)?;
    Ok(full)
}
