use crate::env::Environment;
use crate::error::{Result, TemplateError};
use crate::evaluator::Evaluator;
use crate::lua::LuaEvaluator;
use crate::template::{path, Parser, Template};
use std::cell::RefCell;
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::{Duration, Instant, SystemTime};

/// 可挂到 `Environment` 上供动态包含使用的缓存句柄
pub type SharedCache = Rc<RefCell<Cache>>;

/// 重新加载策略
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadPolicy {
    /// 编译一次后不再检查
    Never,
    /// 每次都重新编译
    Always,
    /// mtime 变化即重新编译
    Immediate,
    /// 文件最近一次修改距今不足该时长时不检查
    Debounced(Duration),
}

impl ReloadPolicy {
    /// 未配置为 `Never`，负数 `Always`，零 `Immediate`，正数为防抖秒数
    pub fn from_reload_time(reload_time: Option<f64>) -> Self {
        match reload_time {
            None => Self::Never,
            Some(t) if t.is_nan() => Self::Never,
            Some(t) if t < 0.0 => Self::Always,
            Some(t) if t == 0.0 => Self::Immediate,
            Some(t) => Self::Debounced(Duration::try_from_secs_f64(t).unwrap_or(Duration::MAX)),
        }
    }
}

/// 一个已编译页面
struct Page {
    path: PathBuf,
    template: Rc<Template>,
    last_mtime: Option<SystemTime>,
    last_checked_at: Instant,
}

impl Page {
    fn compile(path: PathBuf, rootdir: &Path, evaluator: &Rc<dyn Evaluator>) -> Result<Self> {
        let template = Parser::from_filename(&path, Some(rootdir))?
            .with_evaluator(Rc::clone(evaluator))
            .compile()?;
        let last_mtime = template.mtime().map_err(|e| TemplateError::io(&path, e))?;
        Ok(Self {
            path,
            template: Rc::new(template),
            last_mtime,
            last_checked_at: Instant::now(),
        })
    }

    fn current_mtime(&mut self) -> Result<Option<SystemTime>> {
        self.last_checked_at = Instant::now();
        self.template
            .mtime()
            .map_err(|e| TemplateError::io(&self.path, e))
    }

    fn changed(&mut self, policy: ReloadPolicy) -> Result<bool> {
        match policy {
            ReloadPolicy::Never => Ok(false),
            ReloadPolicy::Always => Ok(true),
            ReloadPolicy::Immediate => Ok(self.current_mtime()? != self.last_mtime),
            ReloadPolicy::Debounced(window) => {
                let mtime = self.current_mtime()?;
                if let Some(modified) = mtime {
                    // 文件时间在未来也视为刚修改
                    let recent = SystemTime::now()
                        .duration_since(modified)
                        .map_or(true, |age| age < window);
                    if recent {
                        return Ok(false);
                    }
                }
                Ok(mtime != self.last_mtime)
            }
        }
    }
}

/// 以页面名为键缓存编译结果，按 `ReloadPolicy` 检查文件修改时间。不做淘汰
pub struct Cache {
    rootdir: PathBuf,
    policy: ReloadPolicy,
    pages: HashMap<String, Page>,
    evaluator: Rc<dyn Evaluator>,
}

impl Cache {
    pub fn new(rootdir: impl AsRef<Path>, policy: ReloadPolicy) -> Result<Self> {
        Ok(Self {
            rootdir: path::absolutize(rootdir.as_ref())?,
            policy,
            pages: HashMap::new(),
            evaluator: Rc::new(LuaEvaluator::new()),
        })
    }

    pub fn with_evaluator(mut self, evaluator: Rc<dyn Evaluator>) -> Self {
        self.evaluator = evaluator;
        self
    }

    pub fn into_shared(self) -> SharedCache {
        Rc::new(RefCell::new(self))
    }

    pub fn rootdir(&self) -> &Path {
        &self.rootdir
    }

    pub fn policy(&self) -> ReloadPolicy {
        self.policy
    }

    pub fn set_policy(&mut self, policy: ReloadPolicy) {
        self.policy = policy;
    }

    /// 最近一次检查页面 mtime 的时刻
    pub fn last_checked_at(&self, name: &str) -> Option<Instant> {
        self.pages.get(name).map(|page| page.last_checked_at)
    }

    /// 取得页面模板。文件不存在或是目录时返回 `Ok(None)`，编译错误照常返回
    pub fn get(&mut self, name: &str) -> Result<Option<Rc<Template>>> {
        match self.lookup(name) {
            Ok(template) => Ok(Some(template)),
            Err(TemplateError::Io { source, .. }) if is_missing(&source) => {
                tracing::debug!(page = name, "页面不存在：{source}");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    fn lookup(&mut self, name: &str) -> Result<Rc<Template>> {
        let policy = self.policy;
        if let Some(page) = self.pages.get_mut(name) {
            if page.changed(policy)? {
                tracing::debug!(page = name, ?policy, "页面已变更，重新编译");
                *page = Page::compile(page.path.clone(), &self.rootdir, &self.evaluator)?;
            } else {
                tracing::debug!(page = name, "缓存命中");
            }
            return Ok(Rc::clone(&page.template));
        }

        let path = self.resolve(name)?;
        let page = Page::compile(path, &self.rootdir, &self.evaluator)?;
        let template = Rc::clone(&page.template);
        tracing::debug!(page = name, "页面首次编译");
        self.pages.insert(name.to_string(), page);
        Ok(template)
    }

    /// 取得页面并在 `env` 中求值；页面不存在时返回 `Ok(false)`，
    /// 求值失败时撤销本次写入的输出
    pub fn evaluate(&mut self, name: &str, env: &mut Environment) -> Result<bool> {
        let Some(template) = self.get(name)? else {
            return Ok(false);
        };
        run_isolated(&template, env)
    }

    /// 同 `evaluate`，但求值期间不占用缓存，模板内的动态包含可以再次经由缓存
    pub fn evaluate_shared(cache: &SharedCache, name: &str, env: &mut Environment) -> Result<bool> {
        let template = cache.borrow_mut().get(name)?;
        match template {
            Some(template) => run_isolated(&template, env),
            None => Ok(false),
        }
    }

    /// rootdir 下所有可缓存的页面名（跳过以 `.` 开头的文件和目录）
    pub fn pages(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        collect_pages(&self.rootdir, &self.rootdir, &mut names)?;
        names.sort();
        Ok(names)
    }

    fn resolve(&self, name: &str) -> Result<PathBuf> {
        path::check_segments(Path::new(name))?;
        Ok(self.rootdir.join(name.trim_start_matches('/')))
    }
}

fn run_isolated(template: &Template, env: &mut Environment) -> Result<bool> {
    let start = env.output().len();
    if let Err(e) = template.evaluate(env) {
        env.truncate_output(start);
        return Err(e);
    }
    Ok(true)
}

fn is_missing(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        ErrorKind::NotFound | ErrorKind::IsADirectory | ErrorKind::NotADirectory
    )
}

fn collect_pages(base_dir: &Path, current_dir: &Path, names: &mut Vec<String>) -> Result<()> {
    let entries = std::fs::read_dir(current_dir).map_err(|e| TemplateError::io(current_dir, e))?;
    for entry in entries {
        let entry = entry.map_err(|e| TemplateError::io(current_dir, e))?;
        if entry.file_name().to_string_lossy().starts_with('.') {
            continue;
        }
        let path = entry.path();
        if path.is_dir() {
            collect_pages(base_dir, &path, names)?;
        } else if path.is_file()
            && let Ok(relative) = path.strip_prefix(base_dir)
        {
            names.push(relative.to_string_lossy().replace('\\', "/"));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::{self, File};
    use tempfile::TempDir;

    fn set_mtime(path: &Path, time: SystemTime) {
        File::options().write(true).open(path).unwrap().set_modified(time).unwrap();
    }

    fn ago(secs: u64) -> SystemTime {
        SystemTime::now() - Duration::from_secs(secs)
    }

    fn site() -> TempDir {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("page"), "Hello [=name]!").unwrap();
        set_mtime(&dir.path().join("page"), ago(100));
        dir
    }

    #[test]
    fn test_reload_policy_from_reload_time() {
        assert_eq!(ReloadPolicy::from_reload_time(None), ReloadPolicy::Never);
        assert_eq!(ReloadPolicy::from_reload_time(Some(-1.0)), ReloadPolicy::Always);
        assert_eq!(ReloadPolicy::from_reload_time(Some(0.0)), ReloadPolicy::Immediate);
        assert_eq!(
            ReloadPolicy::from_reload_time(Some(2.5)),
            ReloadPolicy::Debounced(Duration::from_millis(2500))
        );
    }

    #[test]
    fn test_never_returns_cached_even_if_changed() {
        let dir = site();
        let mut cache = Cache::new(dir.path(), ReloadPolicy::Never).unwrap();
        let first = cache.get("page").unwrap().unwrap();
        set_mtime(&dir.path().join("page"), ago(10));
        let second = cache.get("page").unwrap().unwrap();
        assert!(Rc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_always_recompiles_every_call() {
        let dir = site();
        let mut cache = Cache::new(dir.path(), ReloadPolicy::Always).unwrap();
        let first = cache.get("page").unwrap().unwrap();
        let second = cache.get("page").unwrap().unwrap();
        assert_ne!(*first, *second);
    }

    #[test]
    fn test_immediate_recompiles_only_on_mtime_change() {
        let dir = site();
        let mut cache = Cache::new(dir.path(), ReloadPolicy::Immediate).unwrap();
        let first = cache.get("page").unwrap().unwrap();
        let again = cache.get("page").unwrap().unwrap();
        assert!(Rc::ptr_eq(&first, &again));

        set_mtime(&dir.path().join("page"), ago(50));
        let changed = cache.get("page").unwrap().unwrap();
        assert_ne!(*first, *changed);
    }

    #[test]
    fn test_debounce_skips_recent_modification() {
        let dir = site();
        let window = Duration::from_secs(4);
        let mut cache = Cache::new(dir.path(), ReloadPolicy::Debounced(window)).unwrap();
        let first = cache.get("page").unwrap().unwrap();

        // 修改发生在窗口一半处：仍返回旧模板
        set_mtime(&dir.path().join("page"), SystemTime::now());
        let during = cache.get("page").unwrap().unwrap();
        assert!(Rc::ptr_eq(&first, &during));

        // 再次修改且已超过两倍窗口
        set_mtime(&dir.path().join("page"), ago(8));
        let after = cache.get("page").unwrap().unwrap();
        assert_ne!(*first, *after);
    }

    #[test]
    fn test_included_file_change_invalidates_page() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("header"), "H").unwrap();
        fs::write(dir.path().join("page"), "[<header]body").unwrap();
        set_mtime(&dir.path().join("header"), ago(100));
        set_mtime(&dir.path().join("page"), ago(100));

        let mut cache = Cache::new(dir.path(), ReloadPolicy::Immediate).unwrap();
        let first = cache.get("page").unwrap().unwrap();
        set_mtime(&dir.path().join("header"), ago(20));
        let second = cache.get("page").unwrap().unwrap();
        assert_ne!(*first, *second);
    }

    #[test]
    fn test_missing_page_and_directory_yield_none() {
        let dir = site();
        fs::create_dir(dir.path().join("folder")).unwrap();
        let mut cache = Cache::new(dir.path(), ReloadPolicy::Immediate).unwrap();
        assert!(cache.get("nope").unwrap().is_none());
        assert!(cache.get("folder").unwrap().is_none());
    }

    #[test]
    fn test_deleted_page_yields_none_when_checked() {
        let dir = site();
        let mut cache = Cache::new(dir.path(), ReloadPolicy::Immediate).unwrap();
        assert!(cache.get("page").unwrap().is_some());
        fs::remove_file(dir.path().join("page")).unwrap();
        assert!(cache.get("page").unwrap().is_none());
    }

    #[test]
    fn test_compile_error_propagates() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("broken"), "[= 1 + 1").unwrap();
        let mut cache = Cache::new(dir.path(), ReloadPolicy::Never).unwrap();
        assert!(cache.get("broken").unwrap_err().is_compile());
    }

    #[test]
    fn test_failed_evaluate_discards_partial_output() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("broken"), "partial[= nosuch()]").unwrap();
        let mut cache = Cache::new(dir.path(), ReloadPolicy::Never).unwrap();
        let mut env = Environment::new();
        env.write_raw("kept");

        let err = cache.evaluate("broken", &mut env).unwrap_err();
        assert!(matches!(err, TemplateError::Call { .. }), "{err}");
        assert_eq!(env.output(), "kept");

        let shared = cache.into_shared();
        assert!(Cache::evaluate_shared(&shared, "broken", &mut env).is_err());
        assert_eq!(env.output(), "kept");
    }

    #[test]
    fn test_evaluate_renders_into_env() {
        let dir = site();
        let mut cache = Cache::new(dir.path(), ReloadPolicy::Never).unwrap();
        let mut env = Environment::new();
        env.set("name", "<you>").unwrap();
        assert!(cache.evaluate("page", &mut env).unwrap());
        assert_eq!(env.output(), "Hello &lt;you&gt;!");
        assert!(!cache.evaluate("missing", &mut env).unwrap());
    }

    #[test]
    fn test_pages_skips_dotfiles() {
        let dir = site();
        fs::create_dir_all(dir.path().join("sub")).unwrap();
        fs::create_dir_all(dir.path().join(".git")).unwrap();
        fs::write(dir.path().join("sub/inner"), "x").unwrap();
        fs::write(dir.path().join(".hidden"), "x").unwrap();
        fs::write(dir.path().join(".git/HEAD"), "x").unwrap();
        let cache = Cache::new(dir.path(), ReloadPolicy::Never).unwrap();
        assert_eq!(cache.pages().unwrap(), vec!["page".to_string(), "sub/inner".to_string()]);
    }
}
