use crate::template::scanner::Scanner;
use crate::template::state::{CompileState, Delimiter, Region};
use regex::Regex;
use std::sync::LazyLock;

/// `[<name]`、`[^name]`，可带 `-` 裁剪标记
static INCLUDE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\[(-?)[<^]\s*([^\]]+?)\s*(-?)\]").unwrap());

/// `[=`、`[!`、`[#`，连同其后的空白
static MARKED_OPEN_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\[(-?)([=!#])\s*").unwrap());

static OPEN_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\[(-?)").unwrap());

static TEXT_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[^\\\[\]]+").unwrap());

static CODE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[^\\\[\]-]+").unwrap());

static TRAILING_NEWLINE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[ \t]*\r?\n").unwrap());

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Text,
    Code,
}

/// 单步扫描的结果
#[derive(Debug, PartialEq, Eq)]
pub enum Step {
    Continue,
    Switch(Mode),
    /// 静态包含，由解析器处理
    Include { name: String, trim_right: bool },
    /// 无法识别的输入
    Unrecognized,
}

impl Mode {
    pub fn scan(self, scanner: &mut Scanner<'_>, state: &mut CompileState) -> Step {
        match self {
            Mode::Text => scan_text(scanner, state),
            Mode::Code => scan_code(scanner, state),
        }
    }
}

fn scan_text(scanner: &mut Scanner<'_>, state: &mut CompileState) -> Step {
    if state.skip_newline {
        state.skip_newline = false;
        scanner.scan_re(&TRAILING_NEWLINE_RE);
        if scanner.eos() {
            return Step::Continue;
        }
    }

    if scanner.scan_str("\\[") {
        state.push_text("[");
    } else if scanner.scan_str("\\]") {
        state.push_text("]");
    } else if let Some(caps) = scanner.scan_re(&INCLUDE_RE) {
        if !caps[1].is_empty() {
            state.trim_text_end();
        }
        return Step::Include {
            name: caps[2].to_string(),
            trim_right: !caps[3].is_empty(),
        };
    } else if let Some(caps) = scanner.scan_re(&MARKED_OPEN_RE) {
        let region = match &caps[2] {
            "=" => Region::EscapedPrint,
            "!" => Region::RawPrint,
            _ => Region::Comment,
        };
        open(state, Delimiter::Open { region, trim: !caps[1].is_empty() });
        return Step::Switch(Mode::Code);
    } else if let Some(caps) = scanner.scan_re(&OPEN_RE) {
        let trim = !caps[1].is_empty();
        open(state, Delimiter::Open { region: Region::Statement, trim });
        return Step::Switch(Mode::Code);
    } else if scanner.scan_str("]") {
        // 文本模式中落单的 `]` 按字面输出
        state.push_text("]");
    } else if let Some(caps) = scanner.scan_re(&TEXT_RE) {
        state.push_text(&caps[0]);
    } else if scanner.scan_str("\\") {
        state.push_text("\\");
    } else {
        return Step::Unrecognized;
    }
    Step::Continue
}

fn open(state: &mut CompileState, delimiter: Delimiter) {
    if let Delimiter::Open { region, trim } = delimiter {
        if trim {
            state.trim_text_end();
        }
        tracing::trace!(?region, trim, "进入代码模式");
        state.open_region(region);
    }
}

fn scan_code(scanner: &mut Scanner<'_>, state: &mut CompileState) -> Step {
    if state.opened == 0 {
        let close = if scanner.scan_str("-]") {
            Some(Delimiter::Close { trim: true })
        } else if scanner.scan_str("]") {
            Some(Delimiter::Close { trim: false })
        } else {
            None
        };
        if let Some(Delimiter::Close { trim }) = close {
            tracing::trace!(last_open = ?state.last_open, trim, "回到文本模式");
            state.close_region();
            state.skip_newline = trim;
            return Step::Switch(Mode::Text);
        }
    }

    if scanner.starts_with("\\") {
        scan_backslashes(scanner, state);
    } else if scanner.scan_str("[") {
        state.opened += 1;
        state.push_code("[");
    } else if scanner.scan_str("]") {
        state.opened -= 1;
        state.push_code("]");
    } else if let Some(caps) = scanner.scan_re(&CODE_RE) {
        state.push_code(&caps[0]);
    } else if scanner.scan_str("-") {
        state.push_code("-");
    } else {
        return Step::Unrecognized;
    }
    Step::Continue
}

/// 偶数个反斜杠折半输出；奇数个时额外吞掉下一个字符并保留其转义，
/// 被转义的方括号输出为裸括号且不计入嵌套深度
fn scan_backslashes(scanner: &mut Scanner<'_>, state: &mut CompileState) {
    let run = scanner.scan_while(|c| c == '\\').len();
    state.push_code(&"\\".repeat(run / 2));
    if run % 2 == 0 {
        return;
    }
    match scanner.next_char() {
        Some(c @ ('[' | ']')) => state.push_code_char(c),
        Some(c) => {
            state.push_code_char('\\');
            state.push_code_char(c);
        }
        None => state.push_code_char('\\'),
    }
}
