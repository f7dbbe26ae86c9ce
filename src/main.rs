use clap::{Parser as ClapParser, Subcommand};
use kuohao::config::KuohaoConfig;
use kuohao::{Cache, Parser, Value};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

#[derive(ClapParser)]
#[command(name = "kuohao", about = "方括号模板编译器", version = long_version())]
struct Cli {
    /// 项目根目录（默认当前目录）
    #[arg(short, long, global = true, default_value = ".")]
    root: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// 试编译模板，向 stderr 输出 ok / not ok
    Check {
        /// 模板文件（缺省读标准输入）
        file: Option<PathBuf>,
    },

    /// 编译并求值，结果写到 stdout
    Render {
        /// 模板文件（缺省读标准输入）
        file: Option<PathBuf>,

        /// 变量绑定，值能按 JSON 解析则取解析结果
        #[arg(long, value_name = "NAME=VALUE")]
        var: Vec<String>,

        /// 从 JSON 文件读取一组变量绑定
        #[arg(long, value_name = "JSON_FILE")]
        vars: Option<PathBuf>,
    },

    /// 列出模板目录下的全部页面
    Pages,

    /// 编译模板目录下的全部页面并报告错误
    Lint,
}

fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    // 配置中的日志级别作为默认值，RUST_LOG 优先
    let config = KuohaoConfig::load(&cli.root);
    let default_level = config
        .as_ref()
        .map(|c| c.log.level.clone())
        .unwrap_or_else(|_| "info".to_string());

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&default_level)),
        )
        .init();

    let config = config?;

    match cli.command {
        Commands::Check { file } => {
            let wellformed = match load_parser(file.as_deref()) {
                Ok(parser) => parser.wellformed(),
                Err(e) => {
                    tracing::debug!("{e:#}");
                    false
                }
            };
            if wellformed {
                eprintln!("ok");
                Ok(ExitCode::SUCCESS)
            } else {
                eprintln!("not ok");
                Ok(ExitCode::FAILURE)
            }
        }
        Commands::Render { file, var, vars } => {
            let mut env = config.environment();
            if let Some(vars) = vars {
                let content = std::fs::read_to_string(&vars)
                    .map_err(|e| anyhow::anyhow!("读取 {} 失败：{}", vars.display(), e))?;
                let Value::Map(entries) = serde_json::from_str(&content)? else {
                    anyhow::bail!("{} 必须是 JSON 对象", vars.display());
                };
                env.update(entries)?;
            }
            for binding in &var {
                let (name, raw) = binding
                    .split_once('=')
                    .ok_or_else(|| anyhow::anyhow!("变量格式应为 NAME=VALUE：{binding}"))?;
                env.set(name, Value::parse_lenient(raw))?;
            }

            let template_root = std::path::absolute(config.template_root(&cli.root))?;
            let page = match &file {
                Some(file) => std::path::absolute(file)?
                    .strip_prefix(&template_root)
                    .ok()
                    .map(|rel| rel.to_string_lossy().replace('\\', "/")),
                None => None,
            };

            match page {
                Some(page) => {
                    let cache = Cache::new(&template_root, config.reload_policy())?.into_shared();
                    env = env.with_cache(cache.clone());
                    if !Cache::evaluate_shared(&cache, &page, &mut env)? {
                        anyhow::bail!("页面 {page} 不存在");
                    }
                }
                None => load_parser(file.as_deref())?.evaluate(&mut env)?,
            }
            print!("{}", env.output());
            Ok(ExitCode::SUCCESS)
        }
        Commands::Pages => {
            let cache = Cache::new(config.template_root(&cli.root), config.reload_policy())?;
            for page in cache.pages()? {
                println!("{page}");
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Lint => {
            let result = kuohao::check::run(&cli.root)?;

            for w in &result.warnings {
                tracing::warn!("{w}");
            }
            for e in &result.errors {
                tracing::error!("{e}");
            }

            if result.errors.is_empty() {
                tracing::info!("检查通过（{} 个警告）", result.warnings.len());
                Ok(ExitCode::SUCCESS)
            } else {
                anyhow::bail!(
                    "检查未通过：{} 个错误，{} 个警告",
                    result.errors.len(),
                    result.warnings.len()
                );
            }
        }
    }
}

/// 文件或标准输入
fn load_parser(file: Option<&Path>) -> anyhow::Result<Parser<'static>> {
    match file {
        Some(file) => Ok(Parser::from_filename(file, None)?),
        None => {
            let mut source = String::new();
            std::io::stdin().read_to_string(&mut source)?;
            Ok(Parser::new(source)?)
        }
    }
}

const fn long_version() -> &'static str {
    concat!(
        env!("CARGO_PKG_VERSION"),
        "\ncommit:  ",
        env!("KUOHAO_GIT_COMMIT"),
        "\nprofile: ",
        env!("KUOHAO_BUILD_PROFILE"),
    )
}
