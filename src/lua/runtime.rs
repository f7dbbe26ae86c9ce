use crate::env::Environment;
use crate::error::{Result, TemplateError};
use crate::evaluator::Evaluator;
use crate::lua::codegen;
use crate::lua::convert::stringify;
use crate::lua::sandbox;
use crate::template::{Instruction, Program, Template};
use crate::value::Value;
use mlua::{FromLua, Lua, LuaOptions, StdLib, Variadic};
use std::cell::RefCell;
use std::path::PathBuf;

/// 以 Lua 5.4 执行代码区。每次执行使用全新的沙箱 VM
#[derive(Debug, Default, Clone, Copy)]
pub struct LuaEvaluator;

impl LuaEvaluator {
    pub fn new() -> Self {
        Self
    }
}

impl Evaluator for LuaEvaluator {
    fn check(&self, name: &str, program: &Program) -> Result<()> {
        let source = codegen::generate(program);
        let lua = Lua::new();
        lua.load(source.as_str())
            .set_name(format!("={name}"))
            .into_function()
            .map_err(|e| TemplateError::Eval {
                file: name.to_string(),
                message: e.to_string(),
            })?;
        Ok(())
    }

    fn execute(&self, template: &Template, env: &mut Environment) -> Result<()> {
        let program = template.program();
        let source = codegen::generate(program);
        let lua = Lua::new_with(StdLib::ALL_SAFE, LuaOptions::default()).map_err(call_error)?;
        sandbox::apply(&lua, &sandbox_root(program, env)?).map_err(call_error)?;
        let chunk = lua
            .load(&source)
            .set_name(format!("={}", template.name()))
            .into_function()
            .map_err(call_error)?;

        tracing::trace!(template = %template.name(), "执行模板");
        let cell = RefCell::new(env);
        let env = &cell;
        lua.scope(|scope| {
            let globals = lua.globals();

            // 指令下标回调
            globals.set(
                "__text",
                scope.create_function(move |_, index: usize| match program.get(index) {
                    Some(Instruction::Emit(text)) => with_env(env, |e| e.write_raw(text)),
                    _ => Err(bad_index(index)),
                })?,
            )?;
            globals.set(
                "__rootdir",
                scope.create_function(move |_, index: usize| match program.get(index) {
                    Some(Instruction::Rootdir(dir)) => with_env(env, |e| e.set_rootdir(dir)),
                    _ => Err(bad_index(index)),
                })?,
            )?;
            globals.set(
                "__workdir",
                scope.create_function(move |_, index: usize| match program.get(index) {
                    Some(Instruction::Workdir(dir)) => with_env(env, |e| e.set_workdir(dir)),
                    _ => Err(bad_index(index)),
                })?,
            )?;
            globals.set(
                "__print_escaped",
                scope.create_function(move |lua, value: mlua::Value| {
                    let text = stringify(lua, value)?;
                    with_env(env, |e| e.write_escaped(&text))
                })?,
            )?;
            globals.set(
                "__print_raw",
                scope.create_function(move |lua, value: mlua::Value| {
                    let text = stringify(lua, value)?;
                    with_env(env, |e| e.write_raw(&text))
                })?,
            )?;

            // 输出原语：转义形式 / 原样形式
            for raw in [false, true] {
                let suffix = if raw { "_raw" } else { "" };
                let emit = move |env: &mut Environment, text: &str| {
                    if raw {
                        env.write_raw(text)
                    } else {
                        env.write_escaped(text)
                    }
                };

                globals.set(
                    format!("print{suffix}"),
                    scope.create_function(move |lua, args: Variadic<mlua::Value>| {
                        let mut text = String::new();
                        for arg in args {
                            text.push_str(&stringify(lua, arg)?);
                        }
                        with_env(env, |e| emit(e, &text))
                    })?,
                )?;
                globals.set(
                    format!("puts{suffix}"),
                    scope.create_function(move |lua, args: Variadic<mlua::Value>| {
                        let mut text = String::new();
                        for arg in args.iter() {
                            let line = stringify(lua, arg.clone())?;
                            text.push_str(&line);
                            if !line.ends_with('\n') {
                                text.push('\n');
                            }
                        }
                        if args.is_empty() {
                            text.push('\n');
                        }
                        with_env(env, |e| emit(e, &text))
                    })?,
                )?;
                globals.set(
                    format!("putc{suffix}"),
                    scope.create_function(move |lua, value: mlua::Value| {
                        let text = match value {
                            mlua::Value::Integer(code) => char_from_code(code)?.to_string(),
                            mlua::Value::Number(code) => char_from_number(code)?.to_string(),
                            other => stringify(lua, other)?.chars().take(1).collect(),
                        };
                        with_env(env, |e| emit(e, &text))
                    })?,
                )?;
                globals.set(
                    format!("printf{suffix}"),
                    scope.create_function(move |lua, args: Variadic<mlua::Value>| {
                        let string: mlua::Table = lua.globals().get("string")?;
                        let format_fn: mlua::Function = string.get("format")?;
                        let text = format_fn.call::<String>(args)?;
                        with_env(env, |e| emit(e, &text))
                    })?,
                )?;
                globals.set(
                    format!("write{suffix}"),
                    scope.create_function(move |lua, value: mlua::Value| {
                        let text = stringify(lua, value)?;
                        with_env(env, |e| emit(e, &text))?;
                        Ok(text.chars().count())
                    })?,
                )?;
                for (name, pretty) in [("p", false), ("pp", true)] {
                    globals.set(
                        format!("{name}{suffix}"),
                        scope.create_function(move |lua, args: Variadic<mlua::Value>| {
                            let mut text = String::new();
                            for arg in args {
                                let value = Value::from_lua(arg, lua)?;
                                let json = if pretty {
                                    serde_json::to_string_pretty(&value)
                                } else {
                                    serde_json::to_string(&value)
                                };
                                text.push_str(&json.map_err(mlua::Error::external)?);
                                text.push('\n');
                            }
                            with_env(env, |e| emit(e, &text))
                        })?,
                    )?;
                }
            }

            globals.set(
                "include",
                scope.create_function(move |_, name: String| with_env(env, |e| e.include_dynamic(&name)))?,
            )?;
            globals.set(
                "rootdir",
                scope.create_function(move |_, ()| {
                    with_env(env, |e| e.rootdir().map(|dir| dir.display().to_string()))
                })?,
            )?;
            globals.set(
                "workdir",
                scope.create_function(move |_, ()| {
                    with_env(env, |e| e.workdir().map(|dir| dir.display().to_string()))
                })?,
            )?;
            globals.set(
                "get",
                scope.create_function(move |_, name: String| {
                    with_env(env, |e| e.get(&name).cloned().unwrap_or_default())
                })?,
            )?;
            globals.set(
                "set",
                scope.create_function(move |lua, (name, value): (String, mlua::Value)| {
                    let value = Value::from_lua(value, lua)?;
                    with_env(env, |e| e.set(&name, value))?.map_err(mlua::Error::external)?;
                    // 同步到全局变量，使后续代码区可直接引用
                    lua.globals().set(name.trim_start_matches('@'), value_of(env, &name)?)
                })?,
            )?;

            // 绑定与注册函数在内置函数之后安装，同名时覆盖内置
            let (bindings, functions) = with_env(env, |e| {
                let bindings: Vec<(String, Value)> = e
                    .bindings()
                    .map(|(name, value)| (name.to_string(), value.clone()))
                    .collect();
                (bindings, e.function_names())
            })?;
            for (name, value) in bindings {
                globals.set(name, value)?;
            }
            for name in functions {
                let function = scope.create_function({
                    let name = name.clone();
                    move |_, args: Variadic<Value>| {
                        let args: Vec<Value> = args.into_iter().collect();
                        with_env(env, |e| e.call_function(&name, &args))?
                            .map_err(|e| mlua::Error::external(format!("{name}: {e:#}")))
                    }
                })?;
                globals.set(name, function)?;
            }

            chunk.call::<()>(())
        })
        .map_err(call_error)
    }
}

/// 在回调中取得求值上下文；重入时返回错误而非 panic
fn with_env<R>(
    env: &RefCell<&mut Environment>,
    f: impl FnOnce(&mut Environment) -> R,
) -> mlua::Result<R> {
    let mut guard = env
        .try_borrow_mut()
        .map_err(|_| mlua::Error::external("求值上下文正被占用"))?;
    Ok(f(&mut guard))
}

fn value_of(env: &RefCell<&mut Environment>, name: &str) -> mlua::Result<Value> {
    with_env(env, |e| e.get(name).cloned().unwrap_or_default())
}

fn char_from_code(code: i64) -> mlua::Result<char> {
    u32::try_from(code)
        .ok()
        .and_then(char::from_u32)
        .ok_or_else(|| mlua::Error::external(format!("无效的字符编码 {code}")))
}

/// 只接受可精确表示为整数的浮点编码
fn char_from_number(code: f64) -> mlua::Result<char> {
    if code.fract() != 0.0 || !(0.0..=f64::from(u32::MAX)).contains(&code) {
        return Err(mlua::Error::external(format!("无效的字符编码 {code}")));
    }
    char_from_code(code as i64)
}

fn bad_index(index: usize) -> mlua::Error {
    mlua::Error::external(format!("指令 {index} 类型不符"))
}

/// `io.open` 的根目录：程序声明的 rootdir，其次为上下文的 rootdir
fn sandbox_root(program: &Program, env: &Environment) -> Result<PathBuf> {
    let declared = program.instructions().iter().find_map(|instruction| match instruction {
        Instruction::Rootdir(dir) => Some(dir.clone()),
        _ => None,
    });
    match declared.or_else(|| env.rootdir().map(PathBuf::from)) {
        Some(dir) => Ok(dir),
        None => std::env::current_dir().map_err(|e| TemplateError::io(".", e)),
    }
}

fn call_error(e: mlua::Error) -> TemplateError {
    TemplateError::Call {
        message: e.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::Parser;

    fn render(source: &str, env: &mut Environment) -> Result<String> {
        Parser::new(source)?.compile()?.render(env)
    }

    #[test]
    fn test_print_forms() {
        let mut env = Environment::new();
        let out = render("[print('<', 1, nil, true)][print_raw('<')]", &mut env).unwrap();
        assert_eq!(out, "&lt;1true<");
    }

    #[test]
    fn test_puts_adds_missing_newlines() {
        let mut env = Environment::new();
        let out = render("[puts('a', 'b\\n')][puts()]", &mut env).unwrap();
        assert_eq!(out, "a\nb\n\n");
    }

    #[test]
    fn test_putc_takes_first_char_or_code() {
        let mut env = Environment::new();
        let out = render("[putc('<x')][putc_raw(60)][putc(65)]", &mut env).unwrap();
        assert_eq!(out, "&lt;<A");
        assert_eq!(render("[putc(66.0)]", &mut env).unwrap(), "B");
    }

    #[test]
    fn test_putc_rejects_out_of_range_codes() {
        for source in ["[putc(-1)]", "[putc(4294967361)]", "[putc(0xD800)]", "[putc(65.5)]", "[putc(-1.0)]"] {
            let err = render(source, &mut Environment::new()).unwrap_err();
            assert!(matches!(err, TemplateError::Call { .. }), "{source}: {err}");
        }
    }

    #[test]
    fn test_cyclic_value_is_call_error() {
        let err = render("[local t = {} t.self = t p(t)]", &mut Environment::new()).unwrap_err();
        assert!(matches!(err, TemplateError::Call { .. }), "{err}");
        let err = render("[pp_raw(_G)]", &mut Environment::new()).unwrap_err();
        assert!(matches!(err, TemplateError::Call { .. }), "{err}");
    }

    #[test]
    fn test_printf_formats() {
        let mut env = Environment::new();
        let out = render("[printf('%d<%s', 3, 'x')][printf_raw('%05.1f', 2.5)]", &mut env).unwrap();
        assert_eq!(out, "3&lt;x002.5");
    }

    #[test]
    fn test_write_returns_length() {
        let mut env = Environment::new();
        let out = render("[local n = write('abc')][= n]", &mut env).unwrap();
        assert_eq!(out, "abc3");
    }

    #[test]
    fn test_p_dumps_json() {
        let mut env = Environment::new();
        let out = render("[p_raw({1, 2}, {a = 'x'})][p('<')]", &mut env).unwrap();
        assert_eq!(out, "[1,2]\n{\"a\":\"x\"}\n&quot;&lt;&quot;\n");
    }

    #[test]
    fn test_bindings_visible_as_globals() {
        let mut env = Environment::new();
        env.set("@name", "Flor<i>an").unwrap();
        env.set("items", vec![1, 2, 3]).unwrap();
        let out = render("[= name] [= #items] [= get('name')]", &mut env).unwrap();
        assert_eq!(out, "Flor&lt;i&gt;an 3 Flor&lt;i&gt;an");
    }

    #[test]
    fn test_set_from_code_updates_env() {
        let mut env = Environment::new();
        let out = render("[set('count', 41)][= count + 1]", &mut env).unwrap();
        assert_eq!(out, "42");
        assert_eq!(env.get("count"), Some(&Value::Int(41)));
    }

    #[test]
    fn test_registered_function_shadows_builtin() {
        let mut env = Environment::new();
        env.register_function("puts", |_| Ok(Value::from("mine")), false)
            .unwrap();
        let out = render("[= puts()]", &mut env).unwrap();
        assert_eq!(out, "mine");
    }

    #[test]
    fn test_registered_function_error_is_call_error() {
        let mut env = Environment::new();
        env.register_function("boom", |_| anyhow::bail!("炸了"), false)
            .unwrap();
        let err = render("[boom()]", &mut env).unwrap_err();
        assert!(matches!(err, TemplateError::Call { .. }), "{err}");
    }

    #[test]
    fn test_runtime_error_is_call_error() {
        let mut env = Environment::new();
        let err = render("[= nosuch()]", &mut env).unwrap_err();
        assert!(matches!(err, TemplateError::Call { .. }), "{err}");
    }

    #[test]
    fn test_sandbox_applies_during_execution() {
        let mut env = Environment::new();
        let out = render("[= os.execute == nil]", &mut env).unwrap();
        assert_eq!(out, "true");
    }
}
