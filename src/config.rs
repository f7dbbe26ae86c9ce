use crate::cache::ReloadPolicy;
use crate::env::Environment;
use crate::template::escape;
use anyhow::Result;
use serde::Deserialize;
use std::path::{Path, PathBuf};

pub const CONFIG_FILE: &str = "kuohao.toml";

#[derive(Debug, Default, Deserialize)]
pub struct KuohaoConfig {
    #[serde(default)]
    pub templates: TemplatesConfig,
    #[serde(default)]
    pub render: RenderConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Deserialize)]
pub struct TemplatesConfig {
    #[serde(default = "default_template_root")]
    pub root: PathBuf,
    /// 缺省不检查；负数每次重编译；0 立即；正数为防抖秒数
    #[serde(default)]
    pub reload_time: Option<f64>,
}

impl Default for TemplatesConfig {
    fn default() -> Self {
        Self {
            root: default_template_root(),
            reload_time: None,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EscapeMode {
    #[default]
    Html,
    None,
}

#[derive(Debug, Default, Deserialize)]
pub struct RenderConfig {
    #[serde(default)]
    pub escape: EscapeMode,
}

#[derive(Debug, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl KuohaoConfig {
    /// 读取项目根目录下的 kuohao.toml；文件不存在时使用默认值
    pub fn load(project_root: &Path) -> Result<Self> {
        let config_path = project_root.join(CONFIG_FILE);
        if !config_path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(&config_path)
            .map_err(|e| anyhow::anyhow!("读取 {CONFIG_FILE} 失败：{}", e))?;
        let config: KuohaoConfig = toml::from_str(&content)
            .map_err(|e| anyhow::anyhow!("解析 {CONFIG_FILE} 失败：{}", e))?;
        Ok(config)
    }

    pub fn template_root(&self, project_root: &Path) -> PathBuf {
        project_root.join(&self.templates.root)
    }

    pub fn reload_policy(&self) -> ReloadPolicy {
        ReloadPolicy::from_reload_time(self.templates.reload_time)
    }

    /// 按 `[render] escape` 创建求值上下文
    pub fn environment(&self) -> Environment {
        match self.render.escape {
            EscapeMode::Html => Environment::new(),
            EscapeMode::None => Environment::new().with_escape(escape::identity),
        }
    }
}

fn default_template_root() -> PathBuf { "templates".into() }
fn default_log_level() -> String { "info".into() }

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = TempDir::new().unwrap();
        let config = KuohaoConfig::load(dir.path()).unwrap();
        assert_eq!(config.templates.root, PathBuf::from("templates"));
        assert_eq!(config.reload_policy(), ReloadPolicy::Never);
        assert_eq!(config.render.escape, EscapeMode::Html);
        assert_eq!(config.log.level, "info");
    }

    #[test]
    fn test_parse_sections() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join(CONFIG_FILE),
            "[templates]\nroot = \"views\"\nreload_time = 0\n\n[render]\nescape = \"none\"\n\n[log]\nlevel = \"debug\"\n",
        )
        .unwrap();
        let config = KuohaoConfig::load(dir.path()).unwrap();
        assert_eq!(config.template_root(dir.path()), dir.path().join("views"));
        assert_eq!(config.reload_policy(), ReloadPolicy::Immediate);
        assert_eq!(config.render.escape, EscapeMode::None);
        assert_eq!(config.log.level, "debug");

        let mut env = config.environment();
        env.write_escaped("<b>");
        assert_eq!(env.output(), "<b>");
    }

    #[test]
    fn test_malformed_file_is_error() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE), "[render]\nescape = \"xml\"\n").unwrap();
        assert!(KuohaoConfig::load(dir.path()).is_err());
    }
}
