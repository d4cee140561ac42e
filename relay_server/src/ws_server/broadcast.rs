// relay_server/src/ws_server/broadcast.rs

//! 广播发布器。
//!
//! 两路相互独立的广播：
//! - 全局公告：整个进程只有一个定时器，每个周期向注册表快照中的所有会话发送公告；
//! - 用户活动通知：由 [`ConnectionManager`] 在接纳/移除会话的临界区内触发。
//!
//! 所有广播都基于触发时刻的不可变快照，采用尽力而为的投递语义：
//! 单个会话投递失败不影响其他会话，也不会重试或排队。

use std::sync::Arc;
use std::time::Duration;

use common_models::ServerEvent;
use log::{debug, info, warn};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::client_session::{ClientSession, OutboundFrame};
use super::connection_manager::ConnectionManager;

/// 全局公告的固定文本。
pub const ANNOUNCEMENT_MESSAGE: &str = "Server initiated message: Hello client!";

/// 一次扇出的投递统计。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FanOutReport {
    /// 尝试投递的会话数
    pub attempted: usize,
    /// 成功放入出站队列的会话数
    pub delivered: usize,
}

impl FanOutReport {
    pub fn failed(&self) -> usize {
        self.attempted - self.delivered
    }
}

/// 把同一个事件投递给给定的会话集合。事件只序列化一次。
pub fn fan_out<'a, I>(sessions: I, event: &ServerEvent) -> FanOutReport
where
    I: IntoIterator<Item = &'a Arc<ClientSession>>,
{
    let text: Arc<str> = match serde_json::to_string(event) {
        Ok(json) => Arc::from(json),
        Err(e) => {
            warn!("[广播] 序列化 {} 事件失败: {}", event.type_name(), e);
            return FanOutReport::default();
        }
    };

    let mut report = FanOutReport::default();
    for session in sessions {
        report.attempted += 1;
        match session.deliver(OutboundFrame::Text(Arc::clone(&text))) {
            Ok(()) => report.delivered += 1,
            Err(e) => {
                debug!(
                    "[广播] 向 {} 投递 {} 事件失败: {}",
                    session.identity,
                    event.type_name(),
                    e
                );
            }
        }
    }
    report
}

/// 全局公告发布器。
pub struct AnnouncementPublisher {
    connection_manager: Arc<ConnectionManager>,
    interval: Duration,
}

impl AnnouncementPublisher {
    pub fn new(connection_manager: Arc<ConnectionManager>, interval: Duration) -> Self {
        Self {
            connection_manager,
            interval,
        }
    }

    /// 向当前所有已接纳会话发送一次公告。
    pub fn announce_once(&self) -> FanOutReport {
        let snapshot = self.connection_manager.snapshot();
        let report = fan_out(&snapshot, &ServerEvent::announcement(ANNOUNCEMENT_MESSAGE));
        debug!(
            "[广播] 全局公告已发出: 尝试 {} 个会话，成功 {} 个。",
            report.attempted, report.delivered
        );
        report
    }

    /// 在后台启动公告定时器，直到 `shutdown` 被取消。
    ///
    /// 第一次公告在一个完整周期之后发出。
    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!("[广播] 全局公告定时器已启动，周期: {:?}", self.interval);
            let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        self.announce_once();
                    }
                }
            }
            info!("[广播] 全局公告定时器已停止。");
        })
    }
}
