use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use chrono::{DateTime, Utc};
use common_models::ServerEvent;
use log::{debug, warn};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use uuid::Uuid;

use crate::error::DeliveryError;

/// 发往某个客户端的出站帧。由该连接独占的发送任务写入底层 WebSocket。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundFrame {
    /// 已序列化好的 JSON 文本。广播时同一份文本在多个会话间共享。
    Text(Arc<str>),
    /// 心跳探测（WebSocket Ping 帧）。
    Ping,
    /// 关闭通知（WebSocket Close 帧）。
    Close { code: u16, reason: String },
}

/// 会话被终止的原因。只记录第一次终止请求的原因。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// 客户端主动关闭连接。
    ClientClosed,
    /// 读写失败、写超时或出站队列已满。
    TransportFault(String),
    /// 上一次心跳探测未被应答。
    HeartbeatTimeout,
    /// 服务端全局关闭。
    ServerShutdown,
}

/// 代表一个已通过认证并被接纳的 WebSocket 客户端会话。
///
/// 会话本身不持有底层连接：连接的读端由生命周期控制任务持有，写端由发送任务持有。
/// 其他组件只能通过 [`ClientSession::deliver`] 把出站帧放入队列，
/// 或通过 [`ClientSession::terminate`] 请求终止连接。
#[derive(Debug)]
pub struct ClientSession {
    /// 客户端认证时使用的用户标识，也是注册表的键。
    pub identity: String,

    /// 接纳时分配的连接令牌 (UUID v4)，会在欢迎消息中告知客户端，
    /// 客户端据此识别聊天回显中自己发出的消息。
    pub connection_id: Uuid,

    /// 客户端的 IP 地址和端口
    pub addr: SocketAddr,

    /// 会话创建的时间戳
    pub creation_time: DateTime<Utc>,

    /// 出站队列的发送端。队列有界，投递时从不等待。
    sender: mpsc::Sender<OutboundFrame>,

    /// 心跳存活标志：每次探测前被清零，收到任何消息或 Pong 时置位。
    alive: AtomicBool,

    /// 会话级取消令牌。被取消即表示连接应被拆除。
    cancel: CancellationToken,

    close_reason: OnceLock<CloseReason>,
}

impl ClientSession {
    /// 创建一个新的 `ClientSession` 实例，并分配新的连接令牌。
    pub fn new(identity: String, addr: SocketAddr, sender: mpsc::Sender<OutboundFrame>) -> Self {
        Self {
            identity,
            connection_id: Uuid::new_v4(),
            addr,
            creation_time: Utc::now(),
            sender,
            alive: AtomicBool::new(true),
            cancel: CancellationToken::new(),
            close_reason: OnceLock::new(),
        }
    }

    /// 收到客户端任何消息或 Pong 时调用。
    pub fn mark_alive(&self) {
        self.alive.store(true, Ordering::SeqCst);
    }

    /// 清除存活标志并返回清除前的值。
    pub fn take_alive(&self) -> bool {
        self.alive.swap(false, Ordering::SeqCst)
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// 将出站帧放入队列，从不等待。
    ///
    /// 队列已满说明对端读取过慢或已失联，按传输故障处理并终止该会话。
    pub fn deliver(&self, frame: OutboundFrame) -> Result<(), DeliveryError> {
        if self.is_terminated() {
            return Err(DeliveryError::SessionClosed);
        }
        match self.sender.try_send(frame) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                warn!(
                    "[ClientSession] 会话 {} ({}) 出站队列已满，终止该会话。",
                    self.identity, self.connection_id
                );
                self.terminate(CloseReason::TransportFault("outbound queue full".into()));
                Err(DeliveryError::QueueFull)
            }
            Err(TrySendError::Closed(_)) => {
                self.terminate(CloseReason::TransportFault("outbound queue closed".into()));
                Err(DeliveryError::SessionClosed)
            }
        }
    }

    /// 序列化并投递一个事件。
    pub fn send_event(&self, event: &ServerEvent) -> Result<(), DeliveryError> {
        let text = serde_json::to_string(event).map_err(|e| {
            warn!("[ClientSession] 序列化 {} 事件失败: {}", event.type_name(), e);
            DeliveryError::Serialization
        })?;
        debug!(
            "[ClientSession] 向 {} 投递 {} 事件",
            self.identity,
            event.type_name()
        );
        self.deliver(OutboundFrame::Text(Arc::from(text)))
    }

    /// 请求终止会话。可重复调用，只有第一次的原因会被记录。
    pub fn terminate(&self, reason: CloseReason) {
        if self.close_reason.set(reason.clone()).is_ok() {
            debug!(
                "[ClientSession] 会话 {} ({}) 请求终止，原因: {:?}",
                self.identity, self.connection_id, reason
            );
        }
        self.cancel.cancel();
    }

    pub fn is_terminated(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// 会话被终止时完成。
    pub fn terminated(&self) -> WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }

    /// 派生一个随会话终止而取消的子令牌，供心跳监视器等附属任务使用。
    pub fn child_token(&self) -> CancellationToken {
        self.cancel.child_token()
    }

    pub fn close_reason(&self) -> Option<&CloseReason> {
        self.close_reason.get()
    }
}
