use crate::template::{Instruction, Program};

/// 将指令序列降为单个 Lua 代码块
///
/// 文本和路径只以指令下标出现，运行时由宿主按下标取回。
pub fn generate(program: &Program) -> String {
    let mut output = String::new();
    for (index, instruction) in program.instructions().iter().enumerate() {
        match instruction {
            Instruction::Emit(_) => {
                output.push_str(&format!("__text({index})\n"));
            }
            Instruction::EvalEscaped(code) => {
                output.push_str(&format!("__print_escaped({})\n", expression(code)));
            }
            Instruction::EvalRaw(code) => {
                output.push_str(&format!("__print_raw({})\n", expression(code)));
            }
            Instruction::RunStatement(code) => {
                output.push_str(code);
                output.push('\n');
            }
            Instruction::Rootdir(_) => {
                output.push_str(&format!("__rootdir({index})\n"));
            }
            Instruction::Workdir(_) => {
                output.push_str(&format!("__workdir({index})\n"));
            }
        }
    }
    output
}

/// 空的输出区按 nil 处理
fn expression(code: &str) -> String {
    if code.trim().is_empty() {
        "nil".to_string()
    } else {
        format!("(\n{code}\n)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_generate() {
        let program = Program::new(vec![
            Instruction::Rootdir(PathBuf::from("/site")),
            Instruction::Emit("<ul>".into()),
            Instruction::RunStatement(" for i = 1, 3 do ".into()),
            Instruction::EvalEscaped(" i ".into()),
            Instruction::RunStatement(" end ".into()),
            Instruction::EvalRaw("'<b>' -- 注释".into()),
        ]);
        let lua = generate(&program);
        assert_eq!(
            lua,
            "__rootdir(0)\n__text(1)\n for i = 1, 3 do \n__print_escaped((\n i \n))\n end \n__print_raw((\n'<b>' -- 注释\n))\n"
        );
    }

    #[test]
    fn test_empty_print_region_lowers_to_nil() {
        let program = Program::new(vec![
            Instruction::EvalEscaped(" ".into()),
            Instruction::EvalRaw(String::new()),
        ]);
        assert_eq!(generate(&program), "__print_escaped(nil)\n__print_raw(nil)\n");
    }

    #[test]
    fn test_text_never_enters_source() {
        let program = Program::new(vec![Instruction::Emit("]] end error('x') --".into())]);
        assert_eq!(generate(&program), "__text(0)\n");
    }
}
