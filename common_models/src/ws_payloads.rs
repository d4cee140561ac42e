// common_models/src/ws_payloads.rs

//! 包含 WebSocket 通信中使用的各种 Payload 结构体定义。
//!
//! 服务端发往客户端的所有消息统一由 [`ServerEvent`] 表示，序列化后是一个带有
//! `type` 判别字段的扁平 JSON 对象；客户端发往服务端的只有 [`DirectedMessage`]。

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::enums::ActivityKind;

/// 客户端发来的定向消息：`{"to": "<identity>", "text": "<string>"}`。
///
/// 两个字段都必须存在；是否为空由服务端路由器再做校验。
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct DirectedMessage {
    /// 接收方的用户标识。
    pub to: String,
    /// 消息正文。
    pub text: String,
}

impl DirectedMessage {
    /// 接收方与正文均为非空字符串时返回 `true`。纯空白的正文也是合法消息。
    pub fn is_well_formed(&self) -> bool {
        !self.to.is_empty() && !self.text.is_empty()
    }
}

/// 服务端发往客户端的事件。
///
/// 线路格式示例：
///
/// ```json
/// {"type":"chat","from":"user1","id":"…","to":"user2","text":"hi","timestamp":"…"}
/// ```
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    /// 接纳成功后的欢迎消息，携带分配给该连接的令牌。
    Info {
        message: String,
        #[serde(rename = "connectionId")]
        connection_id: String,
    },
    /// 定向聊天消息；接收方与发送方收到完全相同的副本。
    Chat {
        from: String,
        /// 发送方会话的连接令牌，客户端据此识别自己发出的消息。
        id: String,
        to: String,
        text: String,
        timestamp: String,
    },
    /// 全局定时公告。
    ServerAnnouncement { message: String, timestamp: String },
    /// 用户加入/离开通知。
    UserActivityNotification {
        user: String,
        activity: ActivityKind,
        message: String,
        timestamp: String,
    },
    /// 错误通知。
    Error { message: String },
}

impl ServerEvent {
    /// 构造欢迎消息。
    pub fn welcome(identity: &str, connection_id: impl Into<String>) -> Self {
        ServerEvent::Info {
            message: format!("Hello {}, you are connected.", identity),
            connection_id: connection_id.into(),
        }
    }

    /// 构造一条带当前时间戳的公告。
    pub fn announcement(message: impl Into<String>) -> Self {
        ServerEvent::ServerAnnouncement {
            message: message.into(),
            timestamp: now_timestamp(),
        }
    }

    /// 构造一条用户活动通知。
    pub fn activity(user: &str, activity: ActivityKind) -> Self {
        let message = match activity {
            ActivityKind::Joined => format!("{} has joined the chat.", user),
            ActivityKind::Left => format!("{} has left the chat.", user),
        };
        ServerEvent::UserActivityNotification {
            user: user.to_string(),
            activity,
            message,
            timestamp: now_timestamp(),
        }
    }

    /// 构造错误通知。
    pub fn error(message: impl Into<String>) -> Self {
        ServerEvent::Error {
            message: message.into(),
        }
    }

    /// 返回线路上的 `type` 字段值，主要用于日志。
    pub fn type_name(&self) -> &'static str {
        match self {
            ServerEvent::Info { .. } => "info",
            ServerEvent::Chat { .. } => "chat",
            ServerEvent::ServerAnnouncement { .. } => "server_announcement",
            ServerEvent::UserActivityNotification { .. } => "user_activity_notification",
            ServerEvent::Error { .. } => "error",
        }
    }
}

/// `/compare` 端点的响应体。
///
/// `rest` 与 `grpc` 为 `"<毫秒>ms"` 或 `"Error: <原因>"`；
/// `websocket` 的耗时只能在客户端测量，因此恒为占位字符串。
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct CompareReport {
    pub rest: String,
    pub grpc: String,
    pub websocket: String,
}

/// RPC ping 请求：`{"method":"Ping","message":"ping"}`。
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct RpcPingRequest {
    pub method: String,
    #[serde(default)]
    pub message: String,
}

/// RPC ping 响应。成功时只有 `message`，失败时只有 `error`。
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct RpcPingResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// 当前 UTC 时间的 RFC 3339 字符串（毫秒精度）。
pub fn now_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    #[test]
    fn test_info_event_uses_camel_case_connection_id() {
        let event = ServerEvent::welcome("user1", "abc-123");
        let value: Value = serde_json::to_value(&event).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "info",
                "message": "Hello user1, you are connected.",
                "connectionId": "abc-123"
            })
        );
    }

    #[test]
    fn test_activity_event_shape() {
        let event = ServerEvent::activity("user2", ActivityKind::Left);
        let value: Value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "user_activity_notification");
        assert_eq!(value["user"], "user2");
        assert_eq!(value["activity"], "left");
        assert_eq!(value["message"], "user2 has left the chat.");
        assert!(value["timestamp"].as_str().is_some());
        assert_eq!(event.type_name(), "user_activity_notification");
    }

    #[test]
    fn test_chat_event_parses_back() {
        let raw = r#"{"type":"chat","from":"a","id":"x","to":"b","text":"hi","timestamp":"t"}"#;
        let event: ServerEvent = serde_json::from_str(raw).unwrap();
        assert_eq!(
            event,
            ServerEvent::Chat {
                from: "a".into(),
                id: "x".into(),
                to: "b".into(),
                text: "hi".into(),
                timestamp: "t".into(),
            }
        );
    }

    #[test]
    fn test_directed_message_validation() {
        let ok: DirectedMessage = serde_json::from_str(r#"{"to":"user2","text":"hello"}"#).unwrap();
        assert!(ok.is_well_formed());

        let empty_to: DirectedMessage = serde_json::from_str(r#"{"to":"","text":"hello"}"#).unwrap();
        assert!(!empty_to.is_well_formed());
        let empty_text: DirectedMessage = serde_json::from_str(r#"{"to":"user2","text":""}"#).unwrap();
        assert!(!empty_text.is_well_formed());

        // 只校验非空，不去除空白
        let spaces: DirectedMessage = serde_json::from_str(r#"{"to":"user2","text":"   "}"#).unwrap();
        assert!(spaces.is_well_formed());

        // 缺少字段时直接反序列化失败
        assert!(serde_json::from_str::<DirectedMessage>(r#"{"to":"user2"}"#).is_err());
        assert!(serde_json::from_str::<DirectedMessage>(r#"{"to":1,"text":"x"}"#).is_err());
    }

    #[test]
    fn test_rpc_ping_response_omits_empty_fields() {
        let ok = RpcPingResponse {
            message: Some("pong".into()),
            error: None,
        };
        assert_eq!(serde_json::to_string(&ok).unwrap(), r#"{"message":"pong"}"#);

        let req: RpcPingRequest = serde_json::from_str(r#"{"method":"Ping"}"#).unwrap();
        assert_eq!(req.message, "");
    }
}
