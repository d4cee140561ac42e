// relay_server/src/ws_server/heartbeat_monitor.rs

//! 心跳监视器模块。
//!
//! 每个已接纳的会话绑定一个独立的心跳监视器。每个周期：
//! 1. 如果存活标志仍为 `false`（上一次探测未被应答），判定连接失效，终止会话并退出；
//! 2. 否则清除存活标志并发送一个 Ping 探测。
//!
//! 收到任何业务消息或 Pong 都会重新置位存活标志。一次未应答即视为失效，没有退避。
//!
//! 监视器以 [`HeartbeatHandle`] 的形式交给生命周期控制器持有：
//! `stop()` 幂等，丢弃句柄时也会自动停止，因此无论从哪条路径拆除会话，
//! 定时器都只会被取消一次且不会泄漏。

use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::client_session::{ClientSession, CloseReason, OutboundFrame};

/// 单个会话的心跳监视器。
pub struct HeartbeatMonitor {
    session: Arc<ClientSession>,
    interval: Duration,
}

impl HeartbeatMonitor {
    pub fn new(session: Arc<ClientSession>, interval: Duration) -> Self {
        Self { session, interval }
    }

    /// 执行一次心跳检查。返回 `false` 表示会话已被判定失效。
    pub fn check(&self) -> bool {
        if !self.session.take_alive() {
            warn!(
                "[心跳监视器] 会话 {} ({}) 未应答上一次探测，判定连接失效。",
                self.session.identity, self.session.connection_id
            );
            self.session.terminate(CloseReason::HeartbeatTimeout);
            return false;
        }
        if self.session.deliver(OutboundFrame::Ping).is_err() {
            // deliver 失败时会话已被终止
            return false;
        }
        debug!("[心跳监视器] 已向 {} 发送探测。", self.session.identity);
        true
    }

    /// 在后台启动监视器并返回其句柄。第一次检查在一个完整周期之后进行。
    pub fn spawn(self) -> HeartbeatHandle {
        let cancel = self.session.child_token();
        let task_cancel = cancel.clone();
        let join = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    _ = task_cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if !self.check() {
                            break;
                        }
                    }
                }
            }
            debug!("[心跳监视器] 会话 {} 的监视器已退出。", self.session.identity);
        });
        HeartbeatHandle {
            cancel,
            join: Some(join),
        }
    }
}

/// 心跳监视器的作用域句柄。
#[derive(Debug)]
pub struct HeartbeatHandle {
    cancel: CancellationToken,
    join: Option<JoinHandle<()>>,
}

impl HeartbeatHandle {
    /// 停止监视器。只有第一次调用返回 `true`，之后的调用是空操作。
    pub fn stop(&mut self) -> bool {
        match self.join.take() {
            Some(_join) => {
                self.cancel.cancel();
                info!("[心跳监视器] 监视器已停止。");
                true
            }
            None => false,
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.join.is_none()
    }

    /// 后台任务是否已经退出（例如因超时自行结束）。
    pub fn is_finished(&self) -> bool {
        self.join.as_ref().map_or(true, JoinHandle::is_finished)
    }
}

impl Drop for HeartbeatHandle {
    fn drop(&mut self) {
        self.stop();
    }
}
