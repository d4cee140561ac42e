//! `relay_server` 服务端核心库。
//!
//! 已认证的客户端通过 WebSocket 建立持久连接，向其他在线用户发送定向消息，
//! 并接收服务端公告与用户上下线通知。
//!
//! 主要模块包括：
//! - `api`: `/ping`、`/compare` 端点与 RPC ping 服务。
//! - `config`: 配置文件的加载与默认值。
//! - `error`: 应用特定的错误类型与关闭码。
//! - `state`: HTTP 路由共享的应用状态。
//! - `ws_server`: WebSocket 会话管理，包括注册表、心跳、消息路由、广播与生命周期控制。

pub mod api;
pub mod config;
pub mod error;
pub mod state;
pub mod ws_server;
