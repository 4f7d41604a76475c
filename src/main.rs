//! modhost 命令行入口
//!
//! 启动模块宿主，或者离线查看注册表与配置。
//!
//! # 命令概览
//!
//! - `start` - 启动宿主并进入交互控制台
//! - `list` - 列出注册表中的模块记录
//! - `check-config` - 验证配置文件
//! - `version` - 显示版本信息
//!
//! # 使用示例
//!
//! ```bash
//! # 使用默认配置文件 modhost.yaml 启动
//! modhost start
//!
//! # 指定配置文件与日志级别
//! modhost -c host.yaml -l debug start
//!
//! # 只看系统模块
//! modhost list --system
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use modhost::{
    entrypoint_fn, handler_fn, CommandReply, CommandRequest, FileModuleRegistry, HostConfig,
    LifecycleManager, LoadOutcome, Logger, LoggerConfig, ModuleAdmin, ModuleDescriptor,
    ModuleRegistry, NativeRuntime, Origin, RecordFilter,
};

/// modhost - 热插拔模块宿主
#[derive(Parser)]
#[command(name = "modhost")]
#[command(version, about = "热插拔模块宿主", long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// 配置文件路径
    #[arg(short, long, default_value = "modhost.yaml", global = true)]
    config: PathBuf,

    /// 日志级别，覆盖配置文件 (trace, debug, info, warn, error)
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    /// 子命令
    #[command(subcommand)]
    command: Option<Commands>,
}

/// 可用的子命令
#[derive(Subcommand)]
enum Commands {
    /// 启动宿主
    ///
    /// 加载模块目录与注册表中的模块，然后从标准输入读取控制命令。
    /// 按 Ctrl+C 卸载全部模块后退出。
    Start,

    /// 列出注册表中的模块
    List {
        /// 只显示系统模块
        #[arg(long, conflicts_with = "user")]
        system: bool,

        /// 只显示用户模块
        #[arg(long)]
        user: bool,
    },

    /// 验证配置文件
    CheckConfig {
        /// 配置文件路径（不指定则使用全局 -c 选项）
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// 查看版本信息
    Version,
}

/// 加载配置，文件不存在时使用默认配置
async fn load_config(
    path: &Path,
    log_level: Option<String>,
) -> Result<HostConfig, Box<dyn std::error::Error>> {
    let mut config = if path.exists() {
        HostConfig::from_file(path).await?
    } else {
        eprintln!("配置文件 {} 不存在，使用默认配置", path.display());
        HostConfig::default()
    };
    if let Some(level) = log_level {
        config.logging.level = level;
    }
    Ok(config)
}

/// 内置原生模块：原样回显参数
fn builtin_natives() -> NativeRuntime {
    NativeRuntime::new().with_entrypoint(
        "echo",
        entrypoint_fn(|host| async move {
            host.commands().register(
                "echo",
                handler_fn(|req: CommandRequest| async move {
                    Ok(CommandReply::text(req.args.join(" ")))
                }),
            );
            Ok(ModuleDescriptor::new(host.name())
                .with_description("回显")
                .with_command("echo", "原样返回参数"))
        }),
    )
}

/// 启动宿主
async fn run_start(config: HostConfig) -> Result<(), Box<dyn std::error::Error>> {
    config.validate()?;
    let _guard = Logger::init(LoggerConfig::from_log_config(&config.logging))?;

    let actor = config.principal.clone();
    let manager = Arc::new(
        LifecycleManager::builder(config)
            .native(builtin_natives())
            .build()
            .await?,
    );
    let admin = ModuleAdmin::open(manager.clone()).await?;

    let cancel = CancellationToken::new();
    let report = manager.boot(&cancel).await;
    for (location, reason) in &report.failed {
        warn!(source = %location, reason = %reason, "启动时加载失败");
    }

    println!();
    println!("modhost {} 已启动", modhost::VERSION);
    println!(
        "  已加载: {}  跳过: {}  失败: {}",
        report.loaded.len(),
        report.skipped.len(),
        report.failed.len()
    );
    println!("  输入 help 查看控制命令，Ctrl+C 退出");
    println!();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                println!();
                info!("收到关闭信号");
                break;
            }
            line = lines.next_line() => {
                match line? {
                    Some(line) => {
                        if !run_console_line(&admin, &actor, line.trim(), &cancel).await {
                            break;
                        }
                    }
                    None => break,
                }
            }
        }
    }

    cancel.cancel();
    manager.shutdown().await;
    info!("modhost 已关闭");
    Ok(())
}

/// 执行一行控制台输入，返回 false 表示退出
async fn run_console_line(
    admin: &ModuleAdmin,
    actor: &str,
    line: &str,
    cancel: &CancellationToken,
) -> bool {
    let mut parts = line.split_whitespace();
    let Some(head) = parts.next() else {
        return true;
    };
    let arg = parts.next().unwrap_or_default();

    let output = match head {
        "quit" | "exit" => return false,
        "help" => Ok(console_help(admin).await),
        "list" => Ok(list_loaded(admin).await),
        "load" => admin.load(actor, arg, cancel).await.map(|outcome| match outcome {
            LoadOutcome::Loaded(d) => {
                format!("已加载模块 {}（{} 个命令）", d.name, d.commands.len())
            }
            LoadOutcome::ConflictPending(token) => {
                format!("模块已在运行，输入 confirm {} 覆盖，或 cancel {} 放弃", token, token)
            }
        }),
        "confirm" => admin.confirm(actor, arg, cancel).await.map(|d| match d {
            Some(d) => format!("已覆盖模块 {}", d.name),
            None => "提案不存在或已处理".to_string(),
        }),
        "cancel" => admin.cancel(actor, arg).map(|ok| yes_no(ok, "已取消提案", "提案不存在")),
        "unload" => admin
            .unload(actor, arg)
            .await
            .map(|ok| yes_no(ok, "已卸载", "模块未加载")),
        "reload" => admin
            .reload(actor, arg, cancel)
            .await
            .map(|ok| yes_no(ok, "已重载", "注册表中没有该模块")),
        "delete" => admin
            .delete(actor, arg)
            .await
            .map(|ok| yes_no(ok, "已删除", "模块不存在或为系统模块")),
        "admin" => {
            let target = parts.next().unwrap_or_default();
            match arg {
                "add" => admin
                    .add_admin(actor, target)
                    .await
                    .map(|ok| yes_no(ok, "已添加管理员", "已经是管理员")),
                "remove" => admin
                    .remove_admin(actor, target)
                    .await
                    .map(|ok| yes_no(ok, "已移除管理员", "不是可移除的管理员")),
                _ => Ok(format!("管理员: {}", admin.authorizer().admins().join(", "))),
            }
        }
        command if command.starts_with('/') => {
            let request = CommandRequest::new(&command[1..], actor)
                .with_args(std::iter::once(arg).filter(|a| !a.is_empty()).chain(parts));
            admin.dispatch(request).await.map(|reply| reply.text)
        }
        other => Ok(format!("未知命令: {}，输入 help 查看帮助", other)),
    };

    match output {
        Ok(text) => println!("{}", text),
        Err(e) => println!("错误 [{}]: {}", e.error_code(), e),
    }
    true
}

fn yes_no(ok: bool, yes: &str, no: &str) -> String {
    let text = if ok { yes } else { no };
    text.to_string()
}

async fn console_help(admin: &ModuleAdmin) -> String {
    format!(
        "控制命令:\n\
         \x20 load <路径或URL>  confirm <令牌>  cancel <令牌>\n\
         \x20 unload <名称>  reload <名称>  delete <名称>\n\
         \x20 admin [add|remove <ID>]  list  help  quit\n\
         \x20 /<命令> [参数...]  调用模块命令\n\n{}",
        admin.help().await
    )
}

async fn list_loaded(admin: &ModuleAdmin) -> String {
    let modules = admin.manager().modules(None).await;
    if modules.is_empty() {
        return "当前没有已加载的模块".to_string();
    }
    modules
        .iter()
        .map(|m| format!("{:<24} {:<8} {} 个命令", m.name, m.origin, m.commands.len()))
        .collect::<Vec<_>>()
        .join("\n")
}

/// 列出注册表记录
async fn list_records(
    config: &HostConfig,
    filter: RecordFilter,
) -> Result<(), Box<dyn std::error::Error>> {
    let registry = FileModuleRegistry::open(config.paths.registry_file()).await?;
    let records = registry.list(filter).await?;

    println!();
    println!("注册表: {}", config.paths.registry_file().display());
    println!("═══════════════════════════════════════");
    if records.is_empty() {
        println!("  （空）");
    }
    for record in records {
        println!(
            "  {:<24} {:<8} {}  {}",
            record.name,
            record.origin,
            if record.is_active { "激活" } else { "停用" },
            record.source_location
        );
        println!(
            "  {:<24} 添加于 {}  更新于 {}",
            "",
            record.created_at.format("%Y-%m-%d %H:%M:%S"),
            record.updated_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
    println!("═══════════════════════════════════════");
    Ok(())
}

/// 检查配置文件
async fn check_config(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    println!("检查配置文件: {}", path.display());
    println!();

    let config = match HostConfig::from_file(path).await {
        Ok(config) => config,
        Err(e) => {
            println!("❌ 配置文件无法读取: {}", e);
            return Err(Box::new(e));
        }
    };
    if let Err(e) = config.validate() {
        println!("❌ 配置文件无效: {}", e);
        return Err(Box::new(e));
    }

    println!("✅ 配置文件有效！");
    println!();
    println!("────────────────────────────────────────");
    println!("  所有者:           {}", config.principal);
    println!("  管理员:           {:?}", config.admins);
    println!("  用户模块公开:     {}", if config.public_user_modules { "是" } else { "否" });
    println!("  系统模块目录:     {}", config.paths.system_modules.display());
    println!("  用户模块目录:     {}", config.paths.user_modules.display());
    println!("  注册表文件:       {}", config.paths.registry_file().display());
    println!("  错误日志:         {}", config.paths.error_log_file().display());
    println!("  安装器:           {}", config.provisioning.installer.join(" "));
    println!("  安装超时:         {} 秒", config.provisioning.timeout_secs);
    println!("  注册超时:         {} ms", config.runtime.register_timeout_ms);
    println!("  日志级别:         {}", config.logging.level);
    println!("────────────────────────────────────────");
    Ok(())
}

fn print_version() {
    println!();
    println!("modhost - 热插拔模块宿主");
    println!("═══════════════════════════════════════");
    println!("  版本:             {}", modhost::VERSION);
    println!("  目标平台:         {}", std::env::consts::ARCH);
    println!("  操作系统:         {}", std::env::consts::OS);
    println!("═══════════════════════════════════════");
    println!();
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Start) | None => {
            let config = load_config(&cli.config, cli.log_level).await?;
            run_start(config).await?;
        }

        Some(Commands::List { system, user }) => {
            let config = load_config(&cli.config, cli.log_level).await?;
            let filter = if system {
                RecordFilter::origin(Origin::System)
            } else if user {
                RecordFilter::origin(Origin::User)
            } else {
                RecordFilter::all()
            };
            list_records(&config, filter).await?;
        }

        Some(Commands::CheckConfig { config }) => {
            let path = config.unwrap_or(cli.config);
            check_config(&path).await?;
        }

        Some(Commands::Version) => {
            print_version();
        }
    }

    Ok(())
}
