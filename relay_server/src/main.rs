use anyhow::{Context, Result};
use log::{error, info, LevelFilter};
use relay_server::config::{config_file_path, load_or_create_config};
use relay_server::ws_server::service::RelayServer;

#[tokio::main]
async fn main() -> Result<()> {
    // 初始化日志记录器，默认级别 Info，可由 RUST_LOG 覆盖
    env_logger::Builder::new()
        .filter_level(LevelFilter::Info)
        .format_timestamp_millis()
        .parse_default_env()
        .init();
    info!("[主程序] 日志系统已成功初始化 (env_logger)，默认级别: Info。");

    let config_path = config_file_path();
    let app_config = load_or_create_config(&config_path);
    app_config
        .validate()
        .with_context(|| format!("配置文件 {:?} 无效", config_path))?;
    info!(
        "[主程序] 应用配置已加载。HTTP/WebSocket: {}:{}，RPC ping: {}:{}",
        app_config.server.host,
        app_config.server.port,
        app_config.rpc_ping.host,
        app_config.rpc_ping.port
    );

    let server = RelayServer::bind(&app_config)
        .await
        .context("启动中继服务失败")?;

    let shutdown = server.shutdown_token();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("[主程序] 收到 Ctrl-C，正在关闭服务..."),
            Err(e) => {
                error!("[主程序] 无法监听 Ctrl-C 信号: {}。服务将持续运行。", e);
                return;
            }
        }
        shutdown.cancel();
    });

    server.run().await.context("中继服务异常退出")?;
    info!("[主程序] 服务已退出。");
    Ok(())
}
