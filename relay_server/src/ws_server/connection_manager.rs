// relay_server/src/ws_server/connection_manager.rs

//! WebSocket 会话注册表。
//!
//! 注册表是整个服务端唯一的共享可变结构：用户标识 -> 会话。
//! 所有写操作（接纳、移除）都经过同一把接纳锁串行化，
//! 因此“重复登录检查 + 容量检查 + 插入”是一个原子步骤；
//! 读操作（查找、快照）直接读取 `DashMap`，不需要持有接纳锁。
//!
//! 用户加入/离开通知在临界区内发出，与接纳顺序保持一致。
//! 新会话的欢迎消息在插入注册表之前入队，因此它总是该会话收到的第一帧。

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use common_models::{ActivityKind, ServerEvent};
use dashmap::DashMap;
use log::{debug, info, warn};
use tokio::sync::{mpsc, watch};

use super::broadcast::fan_out;
use super::client_session::{ClientSession, OutboundFrame};
use crate::error::AdmissionError;

/// 管理所有已接纳的 WebSocket 客户端会话
#[derive(Debug)]
pub struct ConnectionManager {
    /// 用户标识 -> 会话
    clients: DashMap<String, Arc<ClientSession>>,
    /// 串行化所有写操作
    admission_lock: Mutex<()>,
    /// 在线会话数，只在持有接纳锁时修改，且始终与 `clients.len()` 一致
    active_count: AtomicUsize,
    /// 在线会话数的广播，用于关闭时等待注册表清空
    count_tx: watch::Sender<usize>,
    /// 全局关闭开始后置为 `false`，之后的接纳请求一律拒绝
    accepting: AtomicBool,
    max_connections: usize,
}

impl ConnectionManager {
    pub fn new(max_connections: usize) -> Self {
        let (count_tx, _) = watch::channel(0);
        Self {
            clients: DashMap::new(),
            admission_lock: Mutex::new(()),
            active_count: AtomicUsize::new(0),
            count_tx,
            accepting: AtomicBool::new(true),
            max_connections,
        }
    }

    fn lock(&self) -> MutexGuard<'_, ()> {
        // 临界区内没有会 panic 的操作，锁中毒时直接继续使用
        self.admission_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// 尝试接纳一个新会话。
    ///
    /// 成功时返回新建的会话：欢迎消息已在其出站队列中排在第一位，
    /// 并已向其他所有会话广播 `joined` 通知（不包括新会话自己）。
    pub fn try_admit(
        &self,
        identity: &str,
        addr: SocketAddr,
        sender: mpsc::Sender<OutboundFrame>,
    ) -> Result<Arc<ClientSession>, AdmissionError> {
        let _guard = self.lock();

        if !self.accepting.load(Ordering::SeqCst) {
            info!("[连接管理器] 拒绝接纳 {} ({}): 服务端正在关闭。", identity, addr);
            return Err(AdmissionError::ShuttingDown);
        }
        if self.clients.contains_key(identity) {
            warn!("[连接管理器] 拒绝接纳 {} ({}): 该用户已在线。", identity, addr);
            return Err(AdmissionError::AlreadyConnected);
        }
        if self.active_count.load(Ordering::SeqCst) >= self.max_connections {
            warn!(
                "[连接管理器] 拒绝接纳 {} ({}): 在线会话数已达上限 {}。",
                identity, addr, self.max_connections
            );
            return Err(AdmissionError::CapacityExceeded);
        }

        let session = Arc::new(ClientSession::new(identity.to_string(), addr, sender));
        let welcome = ServerEvent::welcome(identity, session.connection_id.to_string());
        if let Err(e) = session.send_event(&welcome) {
            warn!("[连接管理器] 向 {} 发送欢迎消息失败: {}", identity, e);
        }
        let others: Vec<Arc<ClientSession>> = self
            .clients
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        self.clients.insert(identity.to_string(), Arc::clone(&session));
        let count = self.active_count.fetch_add(1, Ordering::SeqCst) + 1;
        self.count_tx.send_replace(count);

        info!(
            "[连接管理器] 新会话已接纳: user={}, id={}, addr={}",
            session.identity, session.connection_id, session.addr
        );
        debug!("[连接管理器] 当前在线会话数: {}", count);

        let report = fan_out(&others, &ServerEvent::activity(identity, ActivityKind::Joined));
        debug!(
            "[连接管理器] {} 的 joined 通知: 尝试 {} 个，成功 {} 个。",
            identity, report.attempted, report.delivered
        );

        Ok(session)
    }

    /// 停止接纳新会话。之后的 `try_admit` 都返回 [`AdmissionError::ShuttingDown`]。
    ///
    /// 与接纳共用同一把锁：此方法返回后取得的快照包含所有曾被接纳、尚未移除的会话。
    pub fn close_admissions(&self) {
        let _guard = self.lock();
        self.accepting.store(false, Ordering::SeqCst);
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    /// 根据用户标识查找在线会话。
    pub fn lookup(&self, identity: &str) -> Option<Arc<ClientSession>> {
        self.clients.get(identity).map(|entry| Arc::clone(entry.value()))
    }

    /// 按用户标识移除会话。移除不存在的用户是空操作。
    ///
    /// 只有真正移除了会话的那一次调用会广播 `left` 通知并减少计数。
    pub fn remove(&self, identity: &str) -> Option<Arc<ClientSession>> {
        let _guard = self.lock();
        let (_, session) = self.clients.remove(identity)?;
        self.finish_removal(&session);
        Some(session)
    }

    /// 仅当注册表中的条目正是这个会话时才移除它。
    ///
    /// 会话拆除时使用此方法，避免迟到的拆除把同一用户新建立的会话误删。
    pub fn remove_session(&self, session: &ClientSession) -> bool {
        let _guard = self.lock();
        let removed = self
            .clients
            .remove_if(&session.identity, |_, current| {
                current.connection_id == session.connection_id
            });
        match removed {
            Some((_, removed)) => {
                self.finish_removal(&removed);
                true
            }
            None => false,
        }
    }

    /// 必须在持有接纳锁时调用。
    fn finish_removal(&self, session: &Arc<ClientSession>) {
        let count = self.active_count.fetch_sub(1, Ordering::SeqCst) - 1;
        self.count_tx.send_replace(count);
        info!(
            "[连接管理器] 会话已移除: user={}, id={}, addr={}",
            session.identity, session.connection_id, session.addr
        );
        debug!("[连接管理器] 移除后在线会话数: {}", count);

        let remaining = self.snapshot();
        fan_out(
            &remaining,
            &ServerEvent::activity(&session.identity, ActivityKind::Left),
        );
    }

    /// 返回当前所有在线会话的快照。
    pub fn snapshot(&self) -> Vec<Arc<ClientSession>> {
        self.clients
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    pub fn active_count(&self) -> usize {
        self.active_count.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections
    }

    /// 等待注册表清空，最多等待 `timeout`。返回是否已清空。
    pub async fn wait_for_drain(&self, timeout: Duration) -> bool {
        let mut count_rx = self.count_tx.subscribe();
        let drained = match tokio::time::timeout(timeout, count_rx.wait_for(|count| *count == 0)).await {
            Ok(Ok(_)) => true,
            Ok(Err(_)) => self.is_empty(),
            Err(_) => {
                warn!(
                    "[连接管理器] 等待会话清空超时 ({:?})，仍有 {} 个会话在线。",
                    timeout,
                    self.active_count()
                );
                false
            }
        };
        drained
    }
}
