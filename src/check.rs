use crate::cache::{Cache, ReloadPolicy};
use crate::config::{KuohaoConfig, CONFIG_FILE};
use anyhow::Result;
use std::path::Path;

pub struct CheckResult {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

/// 检查项目：配置可解析、模板根目录存在、每个页面都能编译
pub fn run(project_root: &Path) -> Result<CheckResult> {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();

    let config = match KuohaoConfig::load(project_root) {
        Ok(config) => {
            if !project_root.join(CONFIG_FILE).exists() {
                warnings.push(format!("缺少 {CONFIG_FILE}，使用默认配置"));
            }
            config
        }
        Err(e) => {
            errors.push(e.to_string());
            return Ok(CheckResult { errors, warnings });
        }
    };

    check_pages(&config.template_root(project_root), &mut errors, &mut warnings)?;

    Ok(CheckResult { errors, warnings })
}

fn check_pages(template_root: &Path, errors: &mut Vec<String>, warnings: &mut Vec<String>) -> Result<()> {
    if !template_root.is_dir() {
        errors.push(format!("模板目录 {} 不存在", template_root.display()));
        return Ok(());
    }

    let mut cache = Cache::new(template_root, ReloadPolicy::Never)?;
    let pages = cache.pages()?;
    if pages.is_empty() {
        warnings.push(format!("模板目录 {} 下没有页面", template_root.display()));
    }
    for page in pages {
        if let Err(e) = cache.get(&page) {
            errors.push(format!("{page}: {e}"));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_reports_broken_pages() {
        let dir = TempDir::new().unwrap();
        let templates = dir.path().join("templates");
        fs::create_dir_all(&templates).unwrap();
        fs::write(templates.join("good"), "Hello [= 1 + 1]").unwrap();
        fs::write(templates.join("bad"), "Hello [= 1 +").unwrap();

        let result = run(dir.path()).unwrap();
        assert_eq!(result.errors.len(), 1);
        assert!(result.errors[0].starts_with("bad: "));
        assert_eq!(result.warnings.len(), 1);
    }

    #[test]
    fn test_missing_template_root_is_error() {
        let dir = TempDir::new().unwrap();
        let result = run(dir.path()).unwrap();
        assert_eq!(result.errors.len(), 1);
    }
}
