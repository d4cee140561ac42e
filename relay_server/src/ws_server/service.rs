// relay_server/src/ws_server/service.rs

//! WebSocket 服务端核心服务：会话生命周期控制与全局关闭。
//!
//! 每个连接由一个任务驱动，依次经历
//! `Connecting -> Authenticating -> Admitted -> Closing -> Closed` 五个阶段。
//! 认证或接纳失败时直接从 `Authenticating` 进入 `Closed`，不创建任何注册表或定时器状态。
//!
//! 被接纳的连接会拆分为两半：
//! - 写端交给独立的发送任务，它是唯一向底层连接写入的地方；
//! - 读端留在生命周期任务中，把文本消息交给消息路由，把 Pong 记为存活。
//!
//! 无论会话因何结束（对端关闭、读写失败、心跳超时、服务端关闭），
//! 拆除都只在生命周期任务的末尾执行一次。

use std::borrow::Cow;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use common_models::ServerEvent;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;

use super::auth::{CredentialValidator, Credentials};
use super::broadcast::AnnouncementPublisher;
use super::client_session::{ClientSession, CloseReason, OutboundFrame};
use super::connection_manager::ConnectionManager;
use super::heartbeat_monitor::HeartbeatMonitor;
use super::message_router;
use crate::api::compare::{self, CompareService, COMPARE_PROBE_TIMEOUT};
use crate::api::rpc_ping;
use crate::config::{AppConfig, WebSocketConfig};
use crate::error::{AdmissionError, AppError, RejectReason, CLOSE_CODE_GOING_AWAY};
use crate::state::AppState;

/// 服务端关闭时关闭帧中携带的原因。
pub const SHUTDOWN_CLOSE_REASON: &str = "Server shutting down";

/// 单个连接所处的阶段。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Connecting,
    Authenticating,
    Admitted,
    Closing,
    Closed,
}

impl SessionPhase {
    /// 是否允许从当前阶段进入 `next`。
    pub fn can_transition_to(self, next: SessionPhase) -> bool {
        use SessionPhase::*;
        matches!(
            (self, next),
            (Connecting, Authenticating)
                | (Authenticating, Admitted)
                | (Authenticating, Closed)
                | (Admitted, Closing)
                | (Closing, Closed)
        )
    }
}

/// 单个连接的阶段记录。非法的阶段转换被忽略并记录日志。
#[derive(Debug)]
struct Lifecycle {
    peer: SocketAddr,
    phase: SessionPhase,
}

impl Lifecycle {
    fn new(peer: SocketAddr) -> Self {
        Self {
            peer,
            phase: SessionPhase::Connecting,
        }
    }

    fn advance(&mut self, next: SessionPhase) -> bool {
        if !self.phase.can_transition_to(next) {
            warn!(
                "[WsService] 连接 {}: 忽略非法的阶段转换 {:?} -> {:?}",
                self.peer, self.phase, next
            );
            return false;
        }
        debug!(
            "[WsService] 连接 {}: {:?} -> {:?}",
            self.peer, self.phase, next
        );
        self.phase = next;
        true
    }
}

/// `/ws` 升级请求携带的查询参数。缺失的参数按空字符串处理。
#[derive(Debug, Default, Clone, Deserialize)]
#[serde(default)]
pub struct ConnectParams {
    pub username: String,
    pub password: String,
    pub token: String,
}

impl ConnectParams {
    fn credentials(&self) -> Credentials<'_> {
        Credentials {
            identity: &self.username,
            secret: &self.password,
            token: &self.token,
        }
    }
}

/// 构建 HTTP 路由：`/ws`、`/ping`、`/compare`，其余路径由静态文件目录提供。
pub fn build_router(state: Arc<AppState>, static_dir: &Path) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/ping", get(compare::ping_handler))
        .route("/compare", get(compare::compare_handler))
        .fallback_service(ServeDir::new(static_dir))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<ConnectParams>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    State(state): State<Arc<AppState>>,
) -> Response {
    if state.shutdown.is_cancelled() {
        return (StatusCode::SERVICE_UNAVAILABLE, SHUTDOWN_CLOSE_REASON).into_response();
    }
    debug!("[WsService] 收到来自 {} 的升级请求，用户: '{}'", peer, params.username);
    ws.on_upgrade(move |socket| handle_socket(socket, peer, params, state))
}

/// 驱动单个连接从建立到拆除的全过程。
async fn handle_socket(
    mut socket: WebSocket,
    peer: SocketAddr,
    params: ConnectParams,
    state: Arc<AppState>,
) {
    let mut lifecycle = Lifecycle::new(peer);
    lifecycle.advance(SessionPhase::Authenticating);

    let ws_config = &state.ws_config;
    let (tx, rx) = mpsc::channel(ws_config.outbound_queue_capacity);
    let admission = state
        .validator
        .validate(params.credentials())
        .map_err(RejectReason::from)
        .and_then(|()| {
            // 升级期间可能已开始全局关闭
            if state.shutdown.is_cancelled() {
                return Err(RejectReason::from(AdmissionError::ShuttingDown));
            }
            state
                .connection_manager
                .try_admit(&params.username, peer, tx)
                .map_err(RejectReason::from)
        });

    let session = match admission {
        Ok(session) => session,
        Err(reason) => {
            info!(
                "[WsService] 拒绝来自 {} 的连接 (用户: '{}'): {}",
                peer, params.username, reason
            );
            reject(&mut socket, &reason, ws_config.send_timeout()).await;
            lifecycle.advance(SessionPhase::Closed);
            return;
        }
    };
    lifecycle.advance(SessionPhase::Admitted);

    let (sink, mut stream) = socket.split();
    let mut writer = tokio::spawn(run_writer(
        sink,
        rx,
        Arc::clone(&session),
        ws_config.send_timeout(),
    ));
    let mut heartbeat =
        HeartbeatMonitor::new(Arc::clone(&session), ws_config.heartbeat_interval()).spawn();

    read_loop(&session, &mut stream, &state.connection_manager).await;

    // 拆除
    lifecycle.advance(SessionPhase::Closing);
    heartbeat.stop();
    session.terminate(CloseReason::ClientClosed);
    match timeout(ws_config.send_timeout(), &mut writer).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("[WsService] 会话 {}: 发送任务异常退出: {}", session.identity, e),
        Err(_) => {
            warn!("[WsService] 会话 {}: 发送任务未能及时退出，强制中止。", session.identity);
            writer.abort();
        }
    }
    let removed = state.connection_manager.remove_session(&session);
    lifecycle.advance(SessionPhase::Closed);
    info!(
        "[WsService] 会话已结束: user={}, id={}, 原因={:?}, 已从注册表移除={}",
        session.identity,
        session.connection_id,
        session.close_reason(),
        removed
    );
}

/// 尽力发送错误通知和关闭帧。连接此时尚未被接纳，失败只记录日志。
async fn reject(socket: &mut WebSocket, reason: &RejectReason, send_timeout: Duration) {
    match serde_json::to_string(&ServerEvent::error(reason.to_string())) {
        Ok(text) => {
            if let Err(e) = send_with_timeout(socket, Message::Text(text), send_timeout).await {
                debug!("[WsService] 发送拒绝通知失败: {}", e);
                return;
            }
        }
        Err(e) => warn!("[WsService] 序列化拒绝通知失败: {}", e),
    }
    let close = Message::Close(Some(CloseFrame {
        code: reason.close_code(),
        reason: Cow::Borrowed(reason.close_reason()),
    }));
    if let Err(e) = send_with_timeout(socket, close, send_timeout).await {
        debug!("[WsService] 发送关闭帧失败: {}", e);
    }
}

async fn send_with_timeout<S>(sink: &mut S, message: Message, send_timeout: Duration) -> Result<(), String>
where
    S: futures_util::Sink<Message, Error = axum::Error> + Unpin,
{
    match timeout(send_timeout, sink.send(message)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(e.to_string()),
        Err(_) => Err(format!("write timed out after {:?}", send_timeout)),
    }
}

/// 读取客户端消息，直到连接关闭、出错或会话被终止。
async fn read_loop(
    session: &Arc<ClientSession>,
    stream: &mut SplitStream<WebSocket>,
    connection_manager: &ConnectionManager,
) {
    loop {
        tokio::select! {
            biased;
            _ = session.terminated() => break,
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    if let Err(e) = message_router::handle_message(session, &text, connection_manager) {
                        debug!("[WsService] 会话 {}: {}", session.identity, e);
                    }
                }
                Some(Ok(Message::Binary(_))) => {
                    let e = message_router::handle_binary(session);
                    debug!("[WsService] 会话 {}: 收到二进制帧: {}", session.identity, e);
                }
                Some(Ok(Message::Pong(_))) | Some(Ok(Message::Ping(_))) => session.mark_alive(),
                Some(Ok(Message::Close(frame))) => {
                    debug!("[WsService] 会话 {}: 对端关闭连接 {:?}", session.identity, frame);
                    session.terminate(CloseReason::ClientClosed);
                    break;
                }
                None => {
                    session.terminate(CloseReason::ClientClosed);
                    break;
                }
                Some(Err(e)) => {
                    warn!("[WsService] 会话 {}: 读取失败: {}", session.identity, e);
                    session.terminate(CloseReason::TransportFault(e.to_string()));
                    break;
                }
            }
        }
    }
}

/// 发送任务：独占连接写端，按入队顺序写出帧。
///
/// 会话被终止后仍会先写完队列中已有的帧（例如关闭通知），然后关闭写端。
async fn run_writer(
    mut sink: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<OutboundFrame>,
    session: Arc<ClientSession>,
    send_timeout: Duration,
) {
    let mut close_sent = false;
    loop {
        let frame = tokio::select! {
            biased;
            frame = rx.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
            _ = session.terminated() => break,
        };
        let message = match frame {
            OutboundFrame::Text(text) => Message::Text(text.to_string()),
            OutboundFrame::Ping => Message::Ping(Vec::new()),
            OutboundFrame::Close { code, reason } => {
                close_sent = true;
                Message::Close(Some(CloseFrame {
                    code,
                    reason: Cow::Owned(reason),
                }))
            }
        };
        if let Err(e) = send_with_timeout(&mut sink, message, send_timeout).await {
            warn!("[SenderTask {}] 写入失败，判定连接已断开: {}", session.connection_id, e);
            session.terminate(CloseReason::TransportFault(e));
            return;
        }
        if close_sent {
            break;
        }
    }
    if !close_sent {
        // 关闭写端会向对端发送关闭帧；对端已先行关闭时这里的错误可以忽略
        let _ = timeout(send_timeout, sink.close()).await;
    }
    debug!("[SenderTask {}] 发送任务已结束。", session.connection_id);
}

/// 全局关闭：停止接纳新会话，向所有在线会话发送关闭通知并终止它们，然后等待注册表清空。
///
/// 返回注册表是否在 `drain_timeout` 内清空。超时后不再等待。
pub async fn shutdown_sessions(connection_manager: &ConnectionManager, drain_timeout: Duration) -> bool {
    connection_manager.close_admissions();
    let sessions = connection_manager.snapshot();
    info!("[WsService] 正在关闭 {} 个在线会话...", sessions.len());
    for session in &sessions {
        let _ = session.deliver(OutboundFrame::Close {
            code: CLOSE_CODE_GOING_AWAY,
            reason: SHUTDOWN_CLOSE_REASON.to_string(),
        });
        session.terminate(CloseReason::ServerShutdown);
    }
    let drained = connection_manager.wait_for_drain(drain_timeout).await;
    if drained {
        info!("[WsService] 所有会话已清理完毕。");
    } else {
        warn!("[WsService] 等待会话清理超时，继续关闭。");
    }
    drained
}

/// 已绑定监听端口、尚未开始服务的中继服务端。
pub struct RelayServer {
    state: Arc<AppState>,
    listener: TcpListener,
    rpc_listener: TcpListener,
    static_dir: PathBuf,
}

impl RelayServer {
    /// 绑定 HTTP 与 RPC ping 监听端口并构建共享状态。任一端口绑定失败都是致命错误。
    pub async fn bind(config: &AppConfig) -> Result<Self, AppError> {
        let listener = bind_listener(&config.server.host, config.server.port).await?;
        let rpc_listener = bind_listener(&config.rpc_ping.host, config.rpc_ping.port).await?;
        let http_addr = listener.local_addr()?;
        let rpc_addr = rpc_listener.local_addr()?;
        info!("[WsService] HTTP/WebSocket 服务已绑定 {}", http_addr);

        let compare = CompareService::new(
            format!("http://{}/ping", probe_addr(http_addr)),
            probe_addr(rpc_addr).to_string(),
            COMPARE_PROBE_TIMEOUT,
        )?;
        let state = Arc::new(AppState {
            connection_manager: Arc::new(ConnectionManager::new(config.websocket.max_connections)),
            validator: CredentialValidator::from_config(&config.auth),
            ws_config: config.websocket.clone(),
            compare,
            shutdown: CancellationToken::new(),
        });
        Ok(Self {
            state,
            listener,
            rpc_listener,
            static_dir: config.server.static_dir.clone(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, AppError> {
        Ok(self.listener.local_addr()?)
    }

    pub fn rpc_local_addr(&self) -> Result<SocketAddr, AppError> {
        Ok(self.rpc_listener.local_addr()?)
    }

    pub fn connection_manager(&self) -> Arc<ConnectionManager> {
        Arc::clone(&self.state.connection_manager)
    }

    /// 取消该令牌即触发全局关闭。
    pub fn shutdown_token(&self) -> CancellationToken {
        self.state.shutdown.clone()
    }

    /// 运行服务直到关闭令牌被取消，并完成全局关闭流程。
    pub async fn run(self) -> Result<(), AppError> {
        let shutdown = self.state.shutdown.clone();
        let ws_config: WebSocketConfig = self.state.ws_config.clone();

        let rpc_task = tokio::spawn(rpc_ping::serve(self.rpc_listener, shutdown.child_token()));
        let announcer: JoinHandle<()> = AnnouncementPublisher::new(
            Arc::clone(&self.state.connection_manager),
            ws_config.announcement_interval(),
        )
        .spawn(shutdown.child_token());

        let router = build_router(Arc::clone(&self.state), &self.static_dir);
        let graceful_state = Arc::clone(&self.state);
        let drain_timeout = ws_config.shutdown_drain_timeout();
        let result = axum::serve(
            self.listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            graceful_state.shutdown.cancelled().await;
            info!("[WsService] 收到关闭信号，开始全局关闭...");
            if let Err(e) = announcer.await {
                error!("[WsService] 公告任务异常退出: {}", e);
            }
            shutdown_sessions(&graceful_state.connection_manager, drain_timeout).await;
        })
        .await;

        shutdown.cancel();
        if let Err(e) = rpc_task.await {
            error!("[WsService] RPC ping 任务异常退出: {}", e);
        }
        info!("[WsService] 服务已停止。");
        result.map_err(|e| AppError::WebSocketService(e.to_string()))
    }
}

async fn bind_listener(host: &str, port: u16) -> Result<TcpListener, AppError> {
    let addr = format!("{}:{}", host, port);
    TcpListener::bind(&addr)
        .await
        .map_err(|source| AppError::Bind { addr, source })
}

/// 监听通配地址时，自检请求改走回环地址。
fn probe_addr(addr: SocketAddr) -> SocketAddr {
    if addr.ip().is_unspecified() {
        SocketAddr::new(Ipv4Addr::LOCALHOST.into(), addr.port())
    } else {
        addr
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn admit(
        manager: &ConnectionManager,
        identity: &str,
    ) -> (Arc<ClientSession>, mpsc::Receiver<OutboundFrame>) {
        let (tx, rx) = mpsc::channel(8);
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        (manager.try_admit(identity, addr, tx).unwrap(), rx)
    }

    #[test]
    fn test_phase_transitions() {
        use SessionPhase::*;
        assert!(Connecting.can_transition_to(Authenticating));
        assert!(Authenticating.can_transition_to(Admitted));
        assert!(Authenticating.can_transition_to(Closed));
        assert!(Admitted.can_transition_to(Closing));
        assert!(Closing.can_transition_to(Closed));

        assert!(!Connecting.can_transition_to(Admitted));
        assert!(!Admitted.can_transition_to(Closed));
        assert!(!Closed.can_transition_to(Closing));
        assert!(!Closing.can_transition_to(Admitted));
    }

    #[test]
    fn test_lifecycle_ignores_illegal_transition() {
        let mut lifecycle = Lifecycle::new("127.0.0.1:1".parse().unwrap());
        assert!(!lifecycle.advance(SessionPhase::Closing));
        assert_eq!(lifecycle.phase, SessionPhase::Connecting);
        assert!(lifecycle.advance(SessionPhase::Authenticating));
        assert!(lifecycle.advance(SessionPhase::Closed));
        assert!(!lifecycle.advance(SessionPhase::Closed));
    }

    #[test]
    fn test_connect_params_default_to_empty() {
        let params: ConnectParams = serde_json::from_str(r#"{"username":"user1"}"#).unwrap();
        let credentials = params.credentials();
        assert_eq!(credentials.identity, "user1");
        assert_eq!(credentials.secret, "");
        assert_eq!(credentials.token, "");
    }

    #[test]
    fn test_probe_addr() {
        let wildcard: SocketAddr = "0.0.0.0:8443".parse().unwrap();
        assert_eq!(probe_addr(wildcard), "127.0.0.1:8443".parse::<SocketAddr>().unwrap());
        let concrete: SocketAddr = "10.0.0.2:8443".parse().unwrap();
        assert_eq!(probe_addr(concrete), concrete);
    }

    #[tokio::test]
    async fn test_shutdown_sessions_closes_and_drains() {
        let manager = Arc::new(ConnectionManager::new(5));
        let (alice, mut alice_rx) = admit(&manager, "alice");
        let (bob, mut bob_rx) = admit(&manager, "bob");
        // alice: 欢迎消息与 bob 的 joined 通知；bob: 欢迎消息
        assert!(matches!(alice_rx.recv().await, Some(OutboundFrame::Text(_))));
        assert!(matches!(alice_rx.recv().await, Some(OutboundFrame::Text(_))));
        assert!(matches!(bob_rx.recv().await, Some(OutboundFrame::Text(_))));

        // 模拟每个连接任务在会话终止后自行拆除
        for session in [Arc::clone(&alice), Arc::clone(&bob)] {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move {
                session.terminated().await;
                manager.remove_session(&session);
            });
        }

        assert!(shutdown_sessions(&manager, Duration::from_secs(5)).await);
        assert!(manager.is_empty());
        assert_eq!(alice.close_reason(), Some(&CloseReason::ServerShutdown));
        assert_eq!(bob.close_reason(), Some(&CloseReason::ServerShutdown));
        assert_eq!(
            bob_rx.recv().await,
            Some(OutboundFrame::Close {
                code: CLOSE_CODE_GOING_AWAY,
                reason: SHUTDOWN_CLOSE_REASON.to_string(),
            })
        );
        assert!(matches!(
            alice_rx.recv().await,
            Some(OutboundFrame::Close { code: CLOSE_CODE_GOING_AWAY, .. })
        ));

        // 关闭开始后不再接纳新会话
        let (tx, _rx) = mpsc::channel(8);
        assert_eq!(
            manager
                .try_admit("carol", "127.0.0.1:0".parse().unwrap(), tx)
                .err(),
            Some(AdmissionError::ShuttingDown)
        );
    }

    fn test_state(shutdown: CancellationToken) -> Arc<AppState> {
        let mut auth = crate::config::AuthConfig::default();
        auth.tokens = vec!["token123".to_string()];
        Arc::new(AppState {
            connection_manager: Arc::new(ConnectionManager::new(5)),
            validator: CredentialValidator::from_config(&auth),
            ws_config: WebSocketConfig::default(),
            compare: CompareService::new(
                "http://127.0.0.1:9/ping",
                "127.0.0.1:9",
                Duration::from_millis(100),
            )
            .unwrap(),
            shutdown,
        })
    }

    #[tokio::test]
    async fn test_router_serves_ping() {
        use axum::body::{to_bytes, Body};
        use axum::http::Request;
        use tower::ServiceExt;

        let router = build_router(test_state(CancellationToken::new()), &std::env::temp_dir());
        let response = router
            .oneshot(Request::builder().uri("/ping").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), 1024).await.unwrap();
        assert_eq!(&body[..], b"pong");
    }

    #[tokio::test]
    async fn test_router_unknown_path_falls_back_to_static_dir() {
        use axum::body::Body;
        use axum::http::Request;
        use tower::ServiceExt;

        let router = build_router(test_state(CancellationToken::new()), &std::env::temp_dir());
        let response = router
            .oneshot(
                Request::builder()
                    .uri("/definitely-not-a-file-3f9a.html")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_sessions_gives_up_after_timeout() {
        let manager = ConnectionManager::new(5);
        let (stuck, _rx) = admit(&manager, "stuck");

        assert!(!shutdown_sessions(&manager, Duration::from_secs(5)).await);
        assert!(stuck.is_terminated());
        assert_eq!(manager.active_count(), 1);
    }
}
