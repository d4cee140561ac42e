// relay_server/src/ws_server/message_router.rs

//! 负责处理从客户端接收到的定向消息，并把它投递给接收方。
//!
//! 处理顺序：
//! 1. 解析 `{"to", "text"}`，两个字段都必须是非空字符串，否则向发送方回复格式错误；
//! 2. 查找接收方会话，不在线则向发送方回复“未连接”；
//! 3. 向接收方投递 `chat` 事件，并向发送方投递一份完全相同的回显。
//!
//! 发送方身份总是取自会话本身，而不是消息内容。投递只是非阻塞入队，
//! 入队失败由目标会话自行按传输故障处理，这里不重试。

use std::sync::Arc;

use common_models::{now_timestamp, DirectedMessage, ServerEvent};
use log::{debug, warn};

use super::broadcast::fan_out;
use super::client_session::ClientSession;
use super::connection_manager::ConnectionManager;
use crate::error::RouteError;

/// 处理发送方会话收到的一条文本消息。
///
/// 返回 `Err` 时，错误通知已经回复给发送方，会话保持打开。
pub fn handle_message(
    sender: &Arc<ClientSession>,
    raw: &str,
    connection_manager: &ConnectionManager,
) -> Result<(), RouteError> {
    sender.mark_alive();
    debug!("[消息路由] 会话 {}: 收到原始消息: '{}'", sender.identity, raw);

    let message = match serde_json::from_str::<DirectedMessage>(raw) {
        Ok(message) if message.is_well_formed() => message,
        Ok(_) => return Err(reply_error(sender, RouteError::MalformedPayload)),
        Err(e) => {
            warn!("[消息路由] 会话 {}: 解析定向消息失败: {}", sender.identity, e);
            return Err(reply_error(sender, RouteError::MalformedPayload));
        }
    };

    let recipient = match connection_manager.lookup(&message.to) {
        Some(recipient) => recipient,
        None => {
            return Err(reply_error(
                sender,
                RouteError::RecipientUnavailable(message.to),
            ))
        }
    };

    let chat = ServerEvent::Chat {
        from: sender.identity.clone(),
        id: sender.connection_id.to_string(),
        to: message.to,
        text: message.text,
        timestamp: now_timestamp(),
    };

    // 发给自己的消息只投递一次
    let targets: Vec<Arc<ClientSession>> = if Arc::ptr_eq(&recipient, sender) {
        vec![recipient]
    } else {
        vec![recipient, Arc::clone(sender)]
    };
    let report = fan_out(&targets, &chat);
    debug!(
        "[消息路由] 会话 {}: chat 事件投递 {}/{}",
        sender.identity, report.delivered, report.attempted
    );
    Ok(())
}

/// 二进制帧不属于本协议，按格式错误处理。
pub fn handle_binary(sender: &Arc<ClientSession>) -> RouteError {
    sender.mark_alive();
    reply_error(sender, RouteError::MalformedPayload)
}

fn reply_error(sender: &ClientSession, error: RouteError) -> RouteError {
    if let Err(e) = sender.send_event(&ServerEvent::error(error.to_string())) {
        warn!(
            "[消息路由] 会话 {}: 发送错误通知失败: {}",
            sender.identity, e
        );
    }
    error
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ws_server::client_session::OutboundFrame;
    use std::net::SocketAddr;
    use tokio::sync::mpsc;

    struct Fixture {
        manager: ConnectionManager,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                manager: ConnectionManager::new(5),
            }
        }

        fn admit(&self, identity: &str) -> (Arc<ClientSession>, mpsc::Receiver<OutboundFrame>) {
            let (tx, rx) = mpsc::channel(16);
            let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
            let session = self.manager.try_admit(identity, addr, tx).unwrap();
            let mut rx = rx;
            assert!(matches!(
                events(&mut rx).as_slice(),
                [ServerEvent::Info { .. }]
            ));
            (session, rx)
        }
    }

    fn events(rx: &mut mpsc::Receiver<OutboundFrame>) -> Vec<ServerEvent> {
        let mut out = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            if let OutboundFrame::Text(text) = frame {
                out.push(serde_json::from_str(&text).unwrap());
            }
        }
        out
    }

    #[test]
    fn test_chat_delivered_to_recipient_and_echoed() {
        let fx = Fixture::new();
        let (a, mut rx_a) = fx.admit("A");
        let (_b, mut rx_b) = fx.admit("B");
        let (_c, mut rx_c) = fx.admit("C");
        events(&mut rx_a);
        events(&mut rx_b);
        events(&mut rx_c);

        handle_message(&a, r#"{"to":"B","text":"hi"}"#, &fx.manager).unwrap();

        let to_b = events(&mut rx_b);
        let to_a = events(&mut rx_a);
        assert_eq!(to_b.len(), 1);
        assert_eq!(to_b, to_a, "回显必须与投递给接收方的事件完全相同");
        match &to_b[0] {
            ServerEvent::Chat { from, id, to, text, .. } => {
                assert_eq!(from, "A");
                assert_eq!(id, &a.connection_id.to_string());
                assert_eq!(to, "B");
                assert_eq!(text, "hi");
            }
            other => panic!("期望 chat 事件，实际收到 {:?}", other),
        }
        assert!(events(&mut rx_c).is_empty(), "第三方不应收到定向消息");
    }

    #[test]
    fn test_unknown_recipient_gets_single_error() {
        let fx = Fixture::new();
        let (a, mut rx_a) = fx.admit("A");

        let result = handle_message(&a, r#"{"to":"ghost","text":"hi"}"#, &fx.manager);
        assert_eq!(result, Err(RouteError::RecipientUnavailable("ghost".into())));

        let replies = events(&mut rx_a);
        assert_eq!(
            replies,
            vec![ServerEvent::error("User ghost not connected.")]
        );
        assert!(!a.is_terminated());
    }

    #[test]
    fn test_malformed_payloads_are_reported() {
        let fx = Fixture::new();
        let (a, mut rx_a) = fx.admit("A");
        let (_b, mut rx_b) = fx.admit("B");
        events(&mut rx_a);
        events(&mut rx_b);

        for raw in [
            "not json",
            r#"{"to":"B"}"#,
            r#"{"to":"","text":"hi"}"#,
            r#"{"to":"B","text":""}"#,
            r#"{"to":"B","text":42}"#,
            r#"["B","hi"]"#,
        ] {
            assert_eq!(
                handle_message(&a, raw, &fx.manager),
                Err(RouteError::MalformedPayload),
                "payload: {}",
                raw
            );
            match events(&mut rx_a).as_slice() {
                [ServerEvent::Error { message }] => {
                    assert!(message.starts_with("Invalid message format"));
                }
                other => panic!("payload {} 期望一条错误通知，实际 {:?}", raw, other),
            }
        }
        assert!(events(&mut rx_b).is_empty());
        assert!(!a.is_terminated());
    }

    #[test]
    fn test_whitespace_text_is_delivered() {
        let fx = Fixture::new();
        let (a, mut rx_a) = fx.admit("A");
        let (_b, mut rx_b) = fx.admit("B");
        events(&mut rx_a);

        handle_message(&a, r#"{"to":"B","text":"   "}"#, &fx.manager).unwrap();
        match events(&mut rx_b).as_slice() {
            [ServerEvent::Chat { text, .. }] => assert_eq!(text, "   "),
            other => panic!("期望一条 chat 事件，实际 {:?}", other),
        }
        assert_eq!(events(&mut rx_a).len(), 1);
    }

    #[test]
    fn test_message_marks_sender_alive() {
        let fx = Fixture::new();
        let (a, _rx_a) = fx.admit("A");
        a.take_alive();
        let _ = handle_message(&a, "garbage", &fx.manager);
        assert!(a.is_alive());
    }

    #[test]
    fn test_message_to_self_delivered_once() {
        let fx = Fixture::new();
        let (a, mut rx_a) = fx.admit("A");
        handle_message(&a, r#"{"to":"A","text":"ping"}"#, &fx.manager).unwrap();
        let got = events(&mut rx_a);
        assert_eq!(got.len(), 1);
        assert!(matches!(&got[0], ServerEvent::Chat { from, to, .. } if from == "A" && to == "A"));
    }

    #[test]
    fn test_binary_frame_is_malformed() {
        let fx = Fixture::new();
        let (a, mut rx_a) = fx.admit("A");
        assert_eq!(handle_binary(&a), RouteError::MalformedPayload);
        assert_eq!(events(&mut rx_a).len(), 1);
    }
}
