//! 独立端口上的 RPC ping 服务及其客户端。
//!
//! 协议是按行分隔的 JSON：请求 `{"method":"Ping","message":"ping"}`，
//! 响应 `{"message":"pong"}`；未知方法或无法解析的请求得到 `{"error": "..."}`。
//! 每个连接可以连续发送多个请求。

use std::net::SocketAddr;
use std::time::Duration;

use common_models::{RpcPingRequest, RpcPingResponse};
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;

/// 单行请求/响应的最大长度。
const MAX_LINE_LENGTH: usize = 4096;

#[derive(Error, Debug)]
pub enum RpcPingError {
    #[error("连接 RPC ping 服务失败: {0}")]
    Connect(#[source] std::io::Error),
    #[error("RPC 帧编解码失败: {0}")]
    Codec(#[from] LinesCodecError),
    #[error("RPC 响应无法解析: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("RPC 服务端返回错误: {0}")]
    Remote(String),
    #[error("RPC 连接在响应前被关闭")]
    ConnectionClosed,
    #[error("RPC 调用超时")]
    Timeout,
}

/// 处理一条请求行。
fn respond(line: &str) -> RpcPingResponse {
    match serde_json::from_str::<RpcPingRequest>(line) {
        Ok(request) if request.method == "Ping" => RpcPingResponse {
            message: Some("pong".to_string()),
            error: None,
        },
        Ok(request) => RpcPingResponse {
            message: None,
            error: Some(format!("unknown method: {}", request.method)),
        },
        Err(e) => RpcPingResponse {
            message: None,
            error: Some(format!("invalid request: {}", e)),
        },
    }
}

async fn handle_connection(stream: TcpStream, peer: SocketAddr) -> Result<(), RpcPingError> {
    let mut framed = Framed::new(stream, LinesCodec::new_with_max_length(MAX_LINE_LENGTH));
    while let Some(line) = framed.next().await {
        let line = line?;
        let response = respond(&line);
        debug!("[RPC ping] {} 请求: {} -> {:?}", peer, line, response);
        framed.send(serde_json::to_string(&response)?).await?;
    }
    Ok(())
}

/// 在给定监听器上提供 RPC ping 服务，直到 `shutdown` 被取消。
pub async fn serve(listener: TcpListener, shutdown: CancellationToken) {
    match listener.local_addr() {
        Ok(addr) => info!("[RPC ping] 服务正在监听 {}", addr),
        Err(e) => warn!("[RPC ping] 无法获取监听地址: {}", e),
    }
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let conn_shutdown = shutdown.clone();
                    tokio::spawn(async move {
                        tokio::select! {
                            _ = conn_shutdown.cancelled() => {}
                            result = handle_connection(stream, peer) => {
                                if let Err(e) = result {
                                    debug!("[RPC ping] 与 {} 的连接异常结束: {}", peer, e);
                                }
                            }
                        }
                    });
                }
                Err(e) => {
                    error!("[RPC ping] 接受连接失败: {}。服务将继续运行。", e);
                }
            }
        }
    }
    info!("[RPC ping] 服务已停止。");
}

/// 发起一次 RPC ping，返回服务端的应答文本。
pub async fn ping(addr: &str, timeout: Duration) -> Result<String, RpcPingError> {
    tokio::time::timeout(timeout, ping_once(addr))
        .await
        .map_err(|_| RpcPingError::Timeout)?
}

async fn ping_once(addr: &str) -> Result<String, RpcPingError> {
    let stream = TcpStream::connect(addr).await.map_err(RpcPingError::Connect)?;
    let mut framed = Framed::new(stream, LinesCodec::new_with_max_length(MAX_LINE_LENGTH));
    let request = RpcPingRequest {
        method: "Ping".to_string(),
        message: "ping".to_string(),
    };
    framed.send(serde_json::to_string(&request)?).await?;
    let line = framed.next().await.ok_or(RpcPingError::ConnectionClosed)??;
    let response: RpcPingResponse = serde_json::from_str(&line)?;
    match (response.message, response.error) {
        (_, Some(error)) => Err(RpcPingError::Remote(error)),
        (Some(message), None) => Ok(message),
        (None, None) => Err(RpcPingError::Remote("empty response".to_string())),
    }
}
