//! `common_models` 公共模型库 crate。
//!
//! 本 crate 集中定义了中继服务端（`relay_server`）与其客户端之间共享的线路数据结构。
//!
//! - **WebSocket 消息负载 (`ws_payloads`)**: 服务端事件 `ServerEvent`、客户端定向消息
//!   `DirectedMessage`，以及 `/compare` 端点和 RPC ping 使用的负载。
//! - **通用枚举 (`enums`)**: 例如用户活动类型 `ActivityKind`。
//!
//! 所有模型都派生 `serde::Serialize` / `serde::Deserialize`、`Debug` 与 `Clone`。

pub mod enums;
pub mod ws_payloads;

pub use enums::ActivityKind;
pub use ws_payloads::{
    now_timestamp, CompareReport, DirectedMessage, RpcPingRequest, RpcPingResponse, ServerEvent,
};
