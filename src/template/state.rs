use crate::error::{Result, TemplateError};
use crate::template::{Instruction, Program};
use indexmap::IndexSet;
use std::path::{Path, PathBuf};

/// 代码区种类，由开定界符决定
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Region {
    /// `[ ... ]`
    Statement,
    /// `[= ... ]`
    EscapedPrint,
    /// `[! ... ]`
    RawPrint,
    /// `[# ... ]`
    Comment,
    /// `[< name ]` / `[^ name ]`
    StaticInclude,
}

/// 识别出的定界符；`trim` 对开定界符表示左侧裁剪，对闭定界符表示右侧裁剪
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delimiter {
    Open { region: Region, trim: bool },
    Close { trim: bool },
}

/// 一次根编译内所有解析器共享的状态
#[derive(Debug, Default)]
pub struct CompileState {
    /// 代码区内尚未闭合的 `[` 数量
    pub opened: usize,
    /// 最近一次打开的代码区种类
    pub last_open: Option<Region>,
    /// 下一次文本扫描需要吞掉一段行尾空白和换行
    pub skip_newline: bool,
    text: Vec<String>,
    code: String,
    program: Vec<Instruction>,
    touched: IndexSet<PathBuf>,
    directories: Vec<PathBuf>,
}

impl CompileState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_text(&mut self, text: impl Into<String>) {
        self.text.push(text.into());
    }

    /// 去掉待输出文本末尾的空格和制表符（不跨越换行）
    pub fn trim_text_end(&mut self) {
        while let Some(last) = self.text.last_mut() {
            let kept = last.trim_end_matches([' ', '\t']).len();
            last.truncate(kept);
            if !last.is_empty() {
                break;
            }
            self.text.pop();
        }
    }

    /// 待输出文本转为一条 `Emit` 指令
    pub fn flush_text(&mut self) {
        if self.text.is_empty() {
            return;
        }
        let text = self.text.concat();
        self.text.clear();
        if !text.is_empty() {
            self.program.push(Instruction::Emit(text));
        }
    }

    pub fn emit(&mut self, instruction: Instruction) {
        self.program.push(instruction);
    }

    pub fn open_region(&mut self, region: Region) {
        self.flush_text();
        self.last_open = Some(region);
        self.code.clear();
    }

    /// 注释区的内容直接丢弃
    pub fn push_code(&mut self, code: &str) {
        if self.last_open != Some(Region::Comment) {
            self.code.push_str(code);
        }
    }

    pub fn push_code_char(&mut self, c: char) {
        if self.last_open != Some(Region::Comment) {
            self.code.push(c);
        }
    }

    pub fn close_region(&mut self) {
        let code = std::mem::take(&mut self.code);
        match self.last_open.take() {
            Some(Region::EscapedPrint) => self.program.push(Instruction::EvalEscaped(code)),
            Some(Region::RawPrint) => self.program.push(Instruction::EvalRaw(code)),
            Some(Region::Comment) | Some(Region::StaticInclude) => {}
            Some(Region::Statement) | None => self.program.push(Instruction::RunStatement(code)),
        }
    }

    /// 记录参与编译的文件；已存在时返回 false
    pub fn touch(&mut self, path: &Path) -> bool {
        self.touched.insert(path.to_path_buf())
    }

    pub fn top_workdir(&self) -> Option<&Path> {
        self.directories.last().map(PathBuf::as_path)
    }

    pub fn push_workdir(&mut self, dir: &Path) {
        self.directories.push(dir.to_path_buf());
        self.program.push(Instruction::Workdir(dir.to_path_buf()));
    }

    pub fn pop_workdir(&mut self, file: &str) -> Result<()> {
        if self.directories.pop().is_none() {
            return Err(TemplateError::compile_bare(file, "目录栈为空，无法弹出"));
        }
        if let Some(top) = self.directories.last() {
            self.program.push(Instruction::Workdir(top.clone()));
        }
        Ok(())
    }

    /// 在 `dir` 作为当前目录期间执行 `f`，无论成败都会恢复目录栈
    pub fn with_workdir<R>(
        &mut self,
        dir: &Path,
        file: &str,
        f: impl FnOnce(&mut Self) -> Result<R>,
    ) -> Result<R> {
        let depth = self.directories.len();
        self.push_workdir(dir);
        let result = f(self);
        // 出错路径上子解析器可能留下更深的目录，先回到进入前的深度
        self.directories.truncate(depth + 1);
        let popped = self.pop_workdir(file);
        let value = result?;
        popped?;
        Ok(value)
    }

    pub fn finish(mut self) -> (Program, Vec<PathBuf>) {
        self.flush_text();
        (Program::new(self.program), self.touched.into_iter().collect())
    }
}
