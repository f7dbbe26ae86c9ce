//! 方括号模板编译器
//!
//! 模板由文本和方括号包围的代码区交替组成，代码区以 Lua 求值：
//!
//! | 定界符 | 含义 |
//! |---|---|
//! | `[ ... ]` | 执行语句 |
//! | `[= ... ]` | 求值、转义后输出 |
//! | `[! ... ]` | 求值后原样输出 |
//! | `[# ... ]` | 注释 |
//! | `[< name]` / `[^ name]` | 编译期包含 |
//!
//! 左定界符写作 `[-` 时删除其前方同行空白，右定界符写作 `-]` 时删除其后的空白与换行。

pub mod cache;
pub mod check;
pub mod config;
pub mod env;
pub mod error;
pub mod evaluator;
pub mod lua;
pub mod template;
pub mod value;

pub use cache::{Cache, ReloadPolicy, SharedCache};
pub use env::Environment;
pub use error::{Result, TemplateError};
pub use evaluator::Evaluator;
pub use lua::LuaEvaluator;
pub use template::{Instruction, Parser, Program, Template};
pub use value::Value;
