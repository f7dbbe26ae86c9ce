use crate::cache::SharedCache;
use crate::error::{Result, TemplateError};
use crate::evaluator::Evaluator;
use crate::template::{escape, path, Parser};
use crate::value::Value;
use indexmap::IndexMap;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use ulid::Ulid;

pub type EscapeFn = Rc<dyn Fn(&str) -> String>;
pub type FunctionBody = Rc<dyn Fn(&[Value]) -> anyhow::Result<Value>>;

const LUA_KEYWORDS: &[&str] = &[
    "and", "break", "do", "else", "elseif", "end", "false", "for", "function", "goto", "if", "in",
    "local", "nil", "not", "or", "repeat", "return", "then", "true", "until", "while",
];

#[derive(Clone)]
struct Function {
    body: FunctionBody,
    memoize: bool,
}

/// 正在执行的模板
pub struct Running {
    id: Ulid,
    evaluator: Rc<dyn Evaluator>,
}

/// 求值上下文：输出、转义函数、变量绑定、注册函数与动态包含
pub struct Environment {
    output: String,
    escape: EscapeFn,
    bindings: IndexMap<String, Value>,
    functions: IndexMap<String, Function>,
    /// (函数名, 参数 JSON) -> 结果；不设上限
    memo: HashMap<(String, String), Value>,
    rootdir: Option<PathBuf>,
    workdir: Option<PathBuf>,
    cache: Option<SharedCache>,
    running: Option<Running>,
    /// 正在动态包含的文件链
    including: Vec<PathBuf>,
}

impl Default for Environment {
    fn default() -> Self {
        Self::new()
    }
}

impl Environment {
    /// 默认使用 HTML 实体转义
    pub fn new() -> Self {
        Self {
            output: String::new(),
            escape: Rc::new(escape::html),
            bindings: IndexMap::new(),
            functions: IndexMap::new(),
            memo: HashMap::new(),
            rootdir: None,
            workdir: None,
            cache: None,
            running: None,
            including: Vec::new(),
        }
    }

    pub fn with_escape(mut self, escape: impl Fn(&str) -> String + 'static) -> Self {
        self.escape = Rc::new(escape);
        self
    }

    /// 动态包含改为经由缓存解析
    pub fn with_cache(mut self, cache: SharedCache) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn cache(&self) -> Option<&SharedCache> {
        self.cache.as_ref()
    }

    pub fn output(&self) -> &str {
        &self.output
    }

    pub fn take_output(&mut self) -> String {
        std::mem::take(&mut self.output)
    }

    pub(crate) fn truncate_output(&mut self, len: usize) {
        self.output.truncate(len);
    }

    pub fn escape(&self, value: &str) -> String {
        (self.escape)(value)
    }

    pub fn write_raw(&mut self, text: &str) {
        self.output.push_str(text);
    }

    pub fn write_escaped(&mut self, text: &str) {
        let escaped = (self.escape)(text);
        self.output.push_str(&escaped);
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.bindings.get(binding_name(name))
    }

    pub fn set(&mut self, name: &str, value: impl Into<Value>) -> Result<()> {
        let name = binding_name(name);
        validate_identifier(name)?;
        self.bindings.insert(name.to_string(), value.into());
        Ok(())
    }

    /// 按迭代顺序逐个写入；遇到非法名称即停止，之前的写入保留
    pub fn update<K, V>(&mut self, batch: impl IntoIterator<Item = (K, V)>) -> Result<()>
    where
        K: AsRef<str>,
        V: Into<Value>,
    {
        for (name, value) in batch {
            self.set(name.as_ref(), value)?;
        }
        Ok(())
    }

    pub fn bindings(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.bindings.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// 注册可在代码区调用的函数；`memoize` 时按参数元组缓存结果
    pub fn register_function(
        &mut self,
        name: &str,
        body: impl Fn(&[Value]) -> anyhow::Result<Value> + 'static,
        memoize: bool,
    ) -> Result<()> {
        validate_identifier(name)?;
        self.memo.retain(|(function, _), _| function != name);
        self.functions.insert(
            name.to_string(),
            Function {
                body: Rc::new(body),
                memoize,
            },
        );
        Ok(())
    }

    pub fn function_names(&self) -> Vec<String> {
        self.functions.keys().cloned().collect()
    }

    pub fn call_function(&mut self, name: &str, args: &[Value]) -> anyhow::Result<Value> {
        let function = self
            .functions
            .get(name)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("未注册的函数 {name}"))?;
        if !function.memoize {
            return (function.body)(args);
        }
        let key = (name.to_string(), serde_json::to_string(args)?);
        if let Some(hit) = self.memo.get(&key) {
            return Ok(hit.clone());
        }
        let value = (function.body)(args)?;
        self.memo.insert(key, value.clone());
        Ok(value)
    }

    pub fn memo_len(&self) -> usize {
        self.memo.len()
    }

    pub fn rootdir(&self) -> Option<&Path> {
        self.rootdir.as_deref()
    }

    pub fn workdir(&self) -> Option<&Path> {
        self.workdir.as_deref().or(self.rootdir.as_deref())
    }

    pub fn set_rootdir(&mut self, dir: impl Into<PathBuf>) {
        self.rootdir = Some(dir.into());
    }

    pub fn set_workdir(&mut self, dir: impl Into<PathBuf>) {
        self.workdir = Some(dir.into());
    }

    /// 当前正在执行的模板标识
    pub fn current_template(&self) -> Option<Ulid> {
        self.running.as_ref().map(|r| r.id)
    }

    pub(crate) fn enter_template(&mut self, id: Ulid, evaluator: Rc<dyn Evaluator>) -> Option<Running> {
        self.running.replace(Running { id, evaluator })
    }

    pub(crate) fn leave_template(&mut self, previous: Option<Running>) {
        self.running = previous;
    }

    /// 派生副本：共享绑定、函数、转义与缓存，输出为空
    pub fn derive(&self) -> Self {
        Self {
            output: String::new(),
            escape: Rc::clone(&self.escape),
            bindings: self.bindings.clone(),
            functions: self.functions.clone(),
            memo: self.memo.clone(),
            rootdir: self.rootdir.clone(),
            workdir: self.workdir.clone(),
            cache: self.cache.clone(),
            running: None,
            including: self.including.clone(),
        }
    }

    /// 运行期包含 `name`。任何失败都只在输出中留下提示，不向外传播
    pub fn include_dynamic(&mut self, name: &str) {
        match self.try_include(name) {
            Ok(output) => self.output.push_str(&output),
            Err(e) => {
                tracing::warn!("动态包含 {name} 失败：{e}");
                self.write_escaped(&format!("[dynamic include of '{name}' failed]"));
            }
        }
    }

    fn try_include(&self, name: &str) -> Result<String> {
        let mut derived = self.derive();
        if let Some(cache) = &self.cache {
            let template = cache
                .try_borrow_mut()
                .map_err(|_| TemplateError::Call {
                    message: "模板缓存正被占用".to_string(),
                })?
                .get(name)?
                .ok_or_else(|| TemplateError::Call {
                    message: format!("缓存中找不到页面 {name}"),
                })?;
            if let Some(file) = template.paths().first() {
                derived.enter_include(file)?;
            }
            template.evaluate(&mut derived)?;
            return Ok(derived.output);
        }

        let rootdir = match &self.rootdir {
            Some(dir) => dir.clone(),
            None => std::env::current_dir().map_err(|e| TemplateError::io(".", e))?,
        };
        let workdir = self.workdir.clone().unwrap_or_else(|| rootdir.clone());
        let target = path::resolve_include(name, &workdir, &rootdir)?;
        derived.enter_include(&target)?;
        let mut parser = Parser::from_filename(&target, Some(&rootdir))?;
        if let Some(running) = &self.running {
            parser = parser.with_evaluator(Rc::clone(&running.evaluator));
        }
        parser.compile()?.evaluate(&mut derived)?;
        Ok(derived.output)
    }

    /// 文件已在动态包含链上时拒绝再次进入
    fn enter_include(&mut self, file: &Path) -> Result<()> {
        if self.including.iter().any(|f| f == file) {
            return Err(TemplateError::Call {
                message: format!("循环动态包含 {}", file.display()),
            });
        }
        self.including.push(file.to_path_buf());
        Ok(())
    }
}

/// 允许以 `@` 开头的写法
fn binding_name(name: &str) -> &str {
    name.strip_prefix('@').unwrap_or(name)
}

fn validate_identifier(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid_start = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    let valid_rest = chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if !valid_start || !valid_rest || LUA_KEYWORDS.contains(&name) {
        return Err(TemplateError::Binding {
            name: name.to_string(),
        });
    }
    Ok(())
}
