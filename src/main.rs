use anyhow::{Context, Result};
use clap::Parser;
use crontask::cli::{run_operator_command, Cli, Commands};
use crontask::telemetry::{init_logging, init_metrics, parse_log_format};
use crontask::{AppMode, Application};
use crontask_config::AppConfig;
use tokio::signal;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = AppConfig::load(cli.config.as_deref()).with_context(|| match &cli.config {
        Some(path) => format!("加载配置文件失败: {path}"),
        None => "加载配置失败".to_string(),
    })?;

    let log_level = cli
        .log_level
        .clone()
        .unwrap_or_else(|| config.observability.log_level.clone());
    let log_format = match cli.log_format.as_deref() {
        Some(format) => parse_log_format(format)?,
        None => config.observability.log_format,
    };
    init_logging(&log_level, &log_format)?;

    match cli.command {
        Commands::Start { worker_count } => {
            info!("启动延迟任务调度系统");
            init_metrics(&config.observability)?;

            let app = Application::new(config, AppMode::Worker).await?;
            let result = app.run_until(worker_count, wait_for_shutdown_signal()).await;
            app.close().await;
            if let Err(e) = &result {
                error!("执行器池运行失败: {e:#}");
            }
            info!("延迟任务调度系统已退出");
            result
        }
        command => {
            let app = Application::new(config, AppMode::Operator).await?;
            let result = run_operator_command(app.service(), command).await;
            app.close().await;
            result
        }
    }
}

/// 等待 Ctrl+C 或 SIGTERM
async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("安装Ctrl+C信号处理器失败: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("安装SIGTERM信号处理器失败: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("收到Ctrl+C信号");
        },
        _ = terminate => {
            info!("收到SIGTERM信号");
        },
    }
}
