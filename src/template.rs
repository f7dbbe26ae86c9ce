pub mod escape;
pub mod lexer;
pub mod parser;
pub mod path;
pub mod scanner;
pub mod state;

use crate::env::Environment;
use crate::error::Result;
use crate::evaluator::Evaluator;
use std::fmt;
use std::path::PathBuf;
use std::rc::Rc;
use std::time::SystemTime;
use ulid::Ulid;

pub use parser::Parser;

/// 编译产物中的一条指令；代码区内容是交给求值器的不透明字符串
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Instruction {
    /// 原样输出文本
    Emit(String),
    /// 求值、转义后输出
    EvalEscaped(String),
    /// 求值后原样输出
    EvalRaw(String),
    /// 执行语句，不产生输出
    RunStatement(String),
    /// 绑定求值上下文的根目录
    Rootdir(PathBuf),
    /// 切换求值上下文的当前目录
    Workdir(PathBuf),
}

/// 有序指令序列
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Program {
    instructions: Vec<Instruction>,
}

impl Program {
    pub fn new(instructions: Vec<Instruction>) -> Self {
        Self { instructions }
    }

    pub fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }

    pub fn get(&self, index: usize) -> Option<&Instruction> {
        self.instructions.get(index)
    }

    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }
}

/// 编译后的模板，不可变。每次成功编译得到新的标识，只有同一次编译的结果才相等
pub struct Template {
    id: Ulid,
    name: String,
    program: Program,
    paths: Vec<PathBuf>,
    evaluator: Rc<dyn Evaluator>,
}

impl Template {
    pub(crate) fn new(
        name: String,
        program: Program,
        paths: Vec<PathBuf>,
        evaluator: Rc<dyn Evaluator>,
    ) -> Self {
        Self {
            id: Ulid::new(),
            name,
            program,
            paths,
            evaluator,
        }
    }

    pub fn id(&self) -> Ulid {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn program(&self) -> &Program {
        &self.program
    }

    /// 模板自身（如来自文件）及所有静态包含文件的路径，按包含顺序
    pub fn paths(&self) -> &[PathBuf] {
        &self.paths
    }

    /// 所有相关文件中最新的修改时间；纯源码模板返回 `None`
    pub fn mtime(&self) -> std::io::Result<Option<SystemTime>> {
        let mut newest = None;
        for path in &self.paths {
            let modified = std::fs::metadata(path)?.modified()?;
            newest = newest.max(Some(modified));
        }
        Ok(newest)
    }

    /// 在 `env` 中执行；运行期失败返回 `Call`
    pub fn evaluate(&self, env: &mut Environment) -> Result<()> {
        let previous = env.enter_template(self.id, Rc::clone(&self.evaluator));
        let result = self.evaluator.execute(self, env);
        env.leave_template(previous);
        result
    }

    /// 执行并返回本次产生的输出
    pub fn render(&self, env: &mut Environment) -> Result<String> {
        let start = env.output().len();
        self.evaluate(env)?;
        Ok(env.output()[start..].to_string())
    }
}

impl PartialEq for Template {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Template {}

impl fmt::Debug for Template {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Template")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("paths", &self.paths)
            .field("instructions", &self.program.len())
            .finish_non_exhaustive()
    }
}
