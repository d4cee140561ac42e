// relay_server/src/ws_server/mod.rs

//! WebSocket 服务端逻辑模块：凭据校验、会话注册表、心跳、消息路由、广播与生命周期控制。

pub mod auth;
pub mod broadcast;
pub mod client_session;
pub mod connection_manager;
pub mod heartbeat_monitor;
pub mod message_router;
pub mod service;
