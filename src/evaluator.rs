use crate::env::Environment;
use crate::error::Result;
use crate::template::{Program, Template};

/// 代码区求值器：编译器只产出指令序列，具体宿主语言由实现决定
pub trait Evaluator {
    /// 编译期检查生成的程序，不可接受时返回 `TemplateError::Eval`
    fn check(&self, name: &str, program: &Program) -> Result<()>;

    /// 在 `env` 中运行模板，失败时返回 `TemplateError::Call`
    fn execute(&self, template: &Template, env: &mut Environment) -> Result<()>;
}
