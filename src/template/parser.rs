use crate::env::Environment;
use crate::error::{Result, TemplateError};
use crate::evaluator::Evaluator;
use crate::lua::LuaEvaluator;
use crate::template::lexer::{Mode, Step};
use crate::template::path;
use crate::template::scanner::Scanner;
use crate::template::state::CompileState;
use crate::template::{Instruction, Template};
use std::path::{Path, PathBuf};
use std::rc::Rc;

/// 模板解析器：一个编译单元。静态包含时派生子解析器，共享根编译的 `CompileState`
pub struct Parser<'p> {
    source: String,
    workdir: PathBuf,
    rootdir: PathBuf,
    filename: Option<PathBuf>,
    parent: Option<&'p Parser<'p>>,
    evaluator: Rc<dyn Evaluator>,
}

impl std::fmt::Debug for Parser<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Parser")
            .field("workdir", &self.workdir)
            .field("rootdir", &self.rootdir)
            .field("filename", &self.filename)
            .finish_non_exhaustive()
    }
}

impl Parser<'static> {
    /// 以当前目录为 workdir 和 rootdir
    pub fn new(source: impl Into<String>) -> Result<Self> {
        Self::from_source(source, None, None, None)
    }

    /// 校验路径后创建解析器；任何路径违规都在扫描前以 `Security` 返回
    ///
    /// `workdir` 缺省为当前目录，`rootdir` 缺省为 `workdir`。
    pub fn from_source(
        source: impl Into<String>,
        workdir: Option<&Path>,
        rootdir: Option<&Path>,
        filename: Option<&Path>,
    ) -> Result<Self> {
        let workdir = match workdir {
            Some(dir) => path::absolutize(dir)?,
            None => std::env::current_dir().map_err(|e| TemplateError::io(".", e))?,
        };
        let rootdir = match rootdir {
            Some(dir) => path::absolutize(dir)?,
            None => workdir.clone(),
        };
        path::ensure_within(&workdir, &rootdir)?;

        let filename = match filename {
            Some(file) => {
                path::check_segments(file)?;
                let file = if file.is_relative() {
                    workdir.join(file)
                } else {
                    file.to_path_buf()
                };
                path::ensure_within(&file, &workdir)?;
                Some(file)
            }
            None => None,
        };

        Ok(Self {
            source: source.into(),
            workdir,
            rootdir,
            filename,
            parent: None,
            evaluator: Rc::new(LuaEvaluator::new()),
        })
    }

    /// 读取模板文件；workdir 为文件所在目录，`rootdir` 缺省同 workdir
    pub fn from_filename(filename: impl AsRef<Path>, rootdir: Option<&Path>) -> Result<Self> {
        let filename = path::absolutize(filename.as_ref())?;
        let workdir = filename
            .parent()
            .map(Path::to_path_buf)
            .ok_or_else(|| TemplateError::security(&filename, "没有所在目录"))?;
        let source =
            std::fs::read_to_string(&filename).map_err(|e| TemplateError::io(&filename, e))?;
        Self::from_source(
            source,
            Some(&workdir),
            Some(rootdir.unwrap_or(&workdir)),
            Some(&filename),
        )
    }
}

impl<'p> Parser<'p> {
    pub fn with_evaluator(mut self, evaluator: Rc<dyn Evaluator>) -> Self {
        self.evaluator = evaluator;
        self
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    pub fn rootdir(&self) -> &Path {
        &self.rootdir
    }

    pub fn filename(&self) -> Option<&Path> {
        self.filename.as_deref()
    }

    /// 诊断用名称
    pub fn name(&self) -> String {
        match &self.filename {
            Some(file) => file.display().to_string(),
            None => "(source)".to_string(),
        }
    }

    /// 编译为 `Template`；求值器拒绝生成的程序时返回 `Eval`
    pub fn compile(&self) -> Result<Template> {
        let name = self.name();
        let mut state = CompileState::new();
        state.emit(Instruction::Rootdir(self.rootdir.clone()));
        if let Some(file) = &self.filename {
            state.touch(file);
        }
        state.with_workdir(&self.workdir, &name, |state| self.compile_inner(state))?;

        let (program, paths) = state.finish();
        self.evaluator.check(&name, &program)?;
        tracing::debug!(template = %name, instructions = program.len(), files = paths.len(), "模板编译完成");
        Ok(Template::new(name, program, paths, Rc::clone(&self.evaluator)))
    }

    /// 试编译，任何错误都视为不合法
    pub fn wellformed(&self) -> bool {
        match self.compile() {
            Ok(_) => true,
            Err(e) => {
                tracing::debug!("模板不合法：{e}");
                false
            }
        }
    }

    /// 编译后立即在 `env` 中求值
    pub fn evaluate(&self, env: &mut Environment) -> Result<()> {
        self.compile()?.evaluate(env)
    }

    fn compile_inner(&self, state: &mut CompileState) -> Result<()> {
        let mut scanner = Scanner::new(&self.source);
        let mut mode = Mode::Text;
        let mut opened_at = (1, 1);

        while !scanner.eos() {
            let at = scanner.line_col();
            match mode.scan(&mut scanner, state) {
                Step::Continue => {}
                Step::Switch(next) => {
                    if next == Mode::Code {
                        opened_at = at;
                    }
                    mode = next;
                }
                Step::Include { name, trim_right } => {
                    self.include_template(&name, at, state)?;
                    state.skip_newline = trim_right;
                }
                Step::Unrecognized => {
                    return Err(self.error_at(
                        at,
                        format!("无法识别的输入 '{}'", scanner.peek(40)),
                    ));
                }
            }
        }

        if mode == Mode::Code || state.opened != 0 {
            return Err(self.error_at(opened_at, "代码区未闭合，缺少 ']'"));
        }
        state.flush_text();
        Ok(())
    }

    /// 静态包含：解析路径、读取文件，以子解析器编译进同一个 `CompileState`
    fn include_template(&self, name: &str, at: (usize, usize), state: &mut CompileState) -> Result<()> {
        let target = path::resolve_include(name, &self.workdir, &self.rootdir)?;
        if self.on_chain(&target) {
            return Err(self.error_at(at, format!("循环包含 {}", target.display())));
        }
        let source = std::fs::read_to_string(&target).map_err(|e| {
            self.error_at(at, format!("无法打开 {} 进行包含：{e}", target.display()))
        })?;
        let workdir = target
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.rootdir.clone());

        state.flush_text();
        state.touch(&target);

        let child = Parser {
            source,
            workdir,
            rootdir: self.rootdir.clone(),
            filename: Some(target),
            parent: Some(self),
            evaluator: Rc::clone(&self.evaluator),
        };
        let child_name = child.name();
        state.with_workdir(&child.workdir, &child_name, |state| child.compile_inner(state))
    }

    /// `path` 是否已在当前包含链上
    fn on_chain(&self, path: &Path) -> bool {
        let mut node = Some(self);
        while let Some(parser) = node {
            if parser.filename.as_deref() == Some(path) {
                return true;
            }
            node = parser.parent;
        }
        false
    }

    fn error_at(&self, (line, col): (usize, usize), message: impl Into<String>) -> TemplateError {
        TemplateError::compile(&self.name(), line, col, message, &self.source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_unclosed_region_is_compile_error() {
        let parser = Parser::new("AAA[=1+1").unwrap();
        let err = parser.compile().unwrap_err();
        assert!(err.is_compile());
        assert!(!parser.wellformed());
    }

    #[test]
    fn test_unclosed_nested_bracket_is_compile_error() {
        let parser = Parser::new("<bla>[= [^/bla>").unwrap();
        assert!(parser.compile().unwrap_err().is_compile());
    }

    #[test]
    fn test_stray_close_is_wellformed() {
        assert!(Parser::new("a]b]]").unwrap().wellformed());
    }

    #[test]
    fn test_parent_segment_in_workdir_is_security_violation() {
        let err = Parser::from_source("x", Some(Path::new("/tmp/a/../b")), None, None)
            .err()
            .unwrap();
        assert!(err.is_security());
    }

    #[test]
    fn test_tilde_workdir_is_security_violation() {
        let err = Parser::from_source("x", Some(Path::new("~/pages")), None, None)
            .err()
            .unwrap();
        assert!(err.is_security());
    }

    #[test]
    fn test_workdir_outside_rootdir_is_security_violation() {
        let err = Parser::from_source("x", Some(Path::new("/srv/a")), Some(Path::new("/srv/b")), None)
            .err()
            .unwrap();
        assert!(err.is_security());
    }

    #[test]
    fn test_filename_outside_workdir_is_security_violation() {
        let err = Parser::from_source(
            "x",
            Some(Path::new("/srv/a")),
            Some(Path::new("/srv")),
            Some(Path::new("/srv/b/page")),
        )
        .err()
        .unwrap();
        assert!(err.is_security());
    }

    #[test]
    fn test_missing_static_include_is_compile_error() {
        let dir = TempDir::new().unwrap();
        let parser = Parser::from_source("<bla>[^does_not_exist]</bla>", Some(dir.path()), None, None).unwrap();
        assert!(parser.compile().unwrap_err().is_compile());
    }

    #[test]
    fn test_paths_follow_inclusion_order() {
        let dir = TempDir::new().unwrap();
        fs::create_dir(dir.path().join("parts")).unwrap();
        fs::write(dir.path().join("page"), "[<parts/a]-[</b]").unwrap();
        fs::write(dir.path().join("parts/a"), "A[<c]").unwrap();
        fs::write(dir.path().join("parts/c"), "C").unwrap();
        fs::write(dir.path().join("b"), "B").unwrap();

        let template = Parser::from_filename(dir.path().join("page"), None).unwrap().compile().unwrap();
        let names: Vec<_> = template
            .paths()
            .iter()
            .map(|p| p.strip_prefix(dir.path()).unwrap().to_path_buf())
            .collect();
        assert_eq!(
            names,
            vec![
                PathBuf::from("page"),
                PathBuf::from("parts/a"),
                PathBuf::from("parts/c"),
                PathBuf::from("b"),
            ]
        );
    }

    #[test]
    fn test_include_escaping_rootdir_is_security_violation() {
        let dir = TempDir::new().unwrap();
        let parser = Parser::from_source("[<../../etc/passwd]", Some(dir.path()), None, None).unwrap();
        assert!(parser.compile().unwrap_err().is_security());
    }

    #[test]
    fn test_self_include_is_compile_error() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("loop"), "x[<loop]").unwrap();
        let parser = Parser::from_filename(dir.path().join("loop"), None).unwrap();
        assert!(parser.compile().unwrap_err().is_compile());
    }

    #[test]
    fn test_lua_syntax_error_is_eval_error() {
        let parser = Parser::new("[= 1 + ]").unwrap();
        let err = parser.compile().unwrap_err();
        assert!(matches!(err, TemplateError::Eval { .. }), "{err}");
    }
}
