use std::path::{Path, PathBuf};
use thiserror::Error;

pub type Result<T, E = TemplateError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum TemplateError {
    /// 定界符/括号不匹配、静态包含目标不可读、目录栈下溢
    #[error("{}", format_error("编译错误", file, *line, *col, context, message))]
    Compile {
        file: String,
        line: usize,
        col: usize,
        message: String,
        context: String,
    },

    /// 生成的程序无法被求值器接受（例如代码区语法错误）
    #[error("求值错误\n  → {file}\n\n  错误：{message}")]
    Eval { file: String, message: String },

    /// 执行已编译模板时失败
    #[error("调用错误：{message}")]
    Call { message: String },

    #[error("路径不安全：{path}（{reason}）")]
    Security { path: String, reason: String },

    #[error("非法绑定名：{name}")]
    Binding { name: String },

    #[error("读取 {} 失败：{source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

fn format_error(kind: &str, file: &str, line: usize, col: usize, context: &str, message: &str) -> String {
    let mut out = format!("模板{kind}\n  → {file}:{line}:{col}\n\n");
    if !context.is_empty() {
        out.push_str(context);
    }
    out.push_str(&format!("  错误：{message}"));
    out
}

impl TemplateError {
    /// 在有源码的位置创建编译错误，附带上下文行
    pub fn compile(file: &str, line: usize, col: usize, message: impl Into<String>, source: &str) -> Self {
        Self::Compile {
            file: file.to_string(),
            line,
            col,
            message: message.into(),
            context: build_error_context(source, line),
        }
    }

    /// 与源码位置无关的编译错误（如目录栈下溢）
    pub fn compile_bare(file: &str, message: impl Into<String>) -> Self {
        Self::Compile {
            file: file.to_string(),
            line: 0,
            col: 0,
            message: message.into(),
            context: String::new(),
        }
    }

    pub fn security(path: impl AsRef<Path>, reason: impl Into<String>) -> Self {
        Self::Security {
            path: path.as_ref().display().to_string(),
            reason: reason.into(),
        }
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn is_compile(&self) -> bool {
        matches!(self, Self::Compile { .. })
    }

    pub fn is_security(&self) -> bool {
        matches!(self, Self::Security { .. })
    }
}

fn build_error_context(source: &str, error_line: usize) -> String {
    let lines: Vec<&str> = source.lines().collect();
    let start = error_line.saturating_sub(3);
    let end = (error_line + 2).min(lines.len());

    let mut ctx = String::new();
    let width = format!("{}", end).len();
    for i in start..end {
        let marker = if i + 1 == error_line { ">" } else { " " };
        ctx.push_str(&format!(
            "  {} {:>width$} | {}\n",
            marker,
            i + 1,
            lines.get(i).unwrap_or(&""),
            width = width,
        ));
    }
    ctx
}
