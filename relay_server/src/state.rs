//! HTTP 路由共享的应用状态。

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::api::compare::CompareService;
use crate::config::WebSocketConfig;
use crate::ws_server::auth::CredentialValidator;
use crate::ws_server::connection_manager::ConnectionManager;

/// 由 axum 以 `State<Arc<AppState>>` 的形式注入各个处理函数。
#[derive(Debug)]
pub struct AppState {
    pub connection_manager: Arc<ConnectionManager>,
    pub validator: CredentialValidator,
    pub ws_config: WebSocketConfig,
    pub compare: CompareService,
    /// 全局关闭令牌。被取消后不再接受新的 WebSocket 升级。
    pub shutdown: CancellationToken,
}
