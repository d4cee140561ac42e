//! HTTP 侧的辅助端点：`/ping`、`/compare`，以及 `/compare` 使用的 RPC ping 服务。
//!
//! 这些端点与会话管理核心相互独立。

pub mod compare;
pub mod rpc_ping;
