use anyhow::{Context, Result};
use clap::{Arg, Command};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use qfarm_core::AppConfig;
use qfarm::demo;

#[tokio::main]
async fn main() -> Result<()> {
    // 解析命令行参数
    let matches = Command::new("qfarm")
        .version("0.3.0")
        .about("轮询式作业队列的 future 桥接与子进程执行框架")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("配置文件路径"),
        )
        .arg(
            Arg::new("mode")
                .short('m')
                .long("mode")
                .value_name("MODE")
                .help("运行模式")
                .value_parser(["child", "demo"])
                .default_value("demo"),
        )
        .arg(
            Arg::new("log-level")
                .short('l')
                .long("log-level")
                .value_name("LEVEL")
                .help("日志级别")
                .value_parser(["trace", "debug", "info", "warn", "error"])
                .default_value("info"),
        )
        .arg(
            Arg::new("log-format")
                .long("log-format")
                .value_name("FORMAT")
                .help("日志格式")
                .value_parser(["json", "pretty"])
                .default_value("pretty"),
        )
        .get_matches();

    let config_path = matches.get_one::<String>("config");
    let mode = matches.get_one::<String>("mode").map(String::as_str);
    let log_level = matches.get_one::<String>("log-level").map(String::as_str);
    let log_format = matches.get_one::<String>("log-format").map(String::as_str);

    init_logging(
        log_level.unwrap_or("info"),
        log_format.unwrap_or("pretty"),
    )?;

    // 加载配置
    let app_config = AppConfig::load(config_path.map(String::as_str))
        .with_context(|| "加载配置失败".to_string())?;

    match mode {
        Some("child") => {
            // 子执行器: stdin/stdout是与worker循环之间的管道
            let registry = demo::build_registry();
            qfarm_worker::child_main(&registry).await?;
        }
        _ => {
            info!("启动qfarm演示");
            tokio::select! {
                result = demo::run_demo(app_config) => result?,
                _ = tokio::signal::ctrl_c() => {
                    warn!("收到中断信号, 退出");
                }
            }
        }
    }

    Ok(())
}

/// 初始化日志。stdout是子进程的响应管道, 日志一律写stderr。
fn init_logging(level: &str, format: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    match format {
        "json" => {
            tracing_subscriber::registry()
                .with(filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_writer(std::io::stderr),
                )
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }
    Ok(())
}
