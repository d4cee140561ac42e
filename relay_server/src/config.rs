//! 服务端配置信息。
//!
//! 配置以 JSON 文件形式保存（默认为当前目录下的 `app_settings.json`，
//! 可通过环境变量 `RELAY_CONFIG` 指定其他路径）。文件不存在时写出默认配置；
//! 文件损坏时记录警告、使用默认配置并覆盖原文件。

use crate::error::AppError;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// 指定配置文件路径的环境变量名。
pub const CONFIG_PATH_ENV: &str = "RELAY_CONFIG";
/// 默认配置文件名。
pub const DEFAULT_CONFIG_FILE: &str = "app_settings.json";

/// HTTP / WebSocket 服务的默认主机地址
pub const DEFAULT_HOST: &str = "0.0.0.0";
/// HTTP / WebSocket 服务的默认端口号
pub const DEFAULT_PORT: u16 = 8443;
/// RPC ping 服务的默认端口号
pub const DEFAULT_RPC_PING_PORT: u16 = 50051;

/// HTTP 服务配置（静态文件、`/ping`、`/compare` 与 `/ws` 共用同一个监听端口）。
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct ServerConfig {
    /// 绑定的主机地址
    pub host: String,
    /// 监听的端口号
    pub port: u16,
    /// 静态文件根目录
    pub static_dir: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            static_dir: PathBuf::from("public"),
        }
    }
}

/// WebSocket 会话相关的配置。
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct WebSocketConfig {
    /// 同时在线会话数上限
    pub max_connections: usize,
    /// 心跳探测间隔（毫秒）。一次探测未被应答即判定连接失效。
    pub heartbeat_interval_ms: u64,
    /// 全局公告间隔（毫秒）
    pub announcement_interval_ms: u64,
    /// 全局关闭时等待所有会话清理完毕的最长时间（毫秒）
    pub shutdown_drain_timeout_ms: u64,
    /// 单帧写入的超时时间（毫秒），超时视为传输故障
    pub send_timeout_ms: u64,
    /// 每个会话出站队列的容量，队列满视为传输故障
    pub outbound_queue_capacity: usize,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            max_connections: 5,
            heartbeat_interval_ms: 10_000,
            announcement_interval_ms: 30_000,
            shutdown_drain_timeout_ms: 5_000,
            send_timeout_ms: 5_000,
            outbound_queue_capacity: 64,
        }
    }
}

impl WebSocketConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn announcement_interval(&self) -> Duration {
        Duration::from_millis(self.announcement_interval_ms)
    }

    pub fn shutdown_drain_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_drain_timeout_ms)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }
}

/// 静态凭据目录与能力令牌集合。运行期只读。
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct AuthConfig {
    /// 用户标识 -> 密码
    pub users: BTreeMap<String, String>,
    /// 有效的能力令牌
    pub tokens: Vec<String>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        let mut users = BTreeMap::new();
        users.insert("user1".to_string(), "pass1".to_string());
        users.insert("user2".to_string(), "pass2".to_string());
        Self {
            users,
            tokens: vec!["token123".to_string(), "token456".to_string()],
        }
    }
}

/// RPC ping 服务配置。
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct RpcPingConfig {
    pub host: String,
    pub port: u16,
}

impl Default for RpcPingConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_RPC_PING_PORT,
        }
    }
}

/// 应用的主配置结构体
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub websocket: WebSocketConfig,
    pub auth: AuthConfig,
    pub rpc_ping: RpcPingConfig,
}

impl AppConfig {
    /// 校验无法在运行期纠正的配置项。
    pub fn validate(&self) -> Result<(), AppError> {
        if self.websocket.max_connections == 0 {
            return Err(AppError::ConfigError("websocket.max_connections 必须大于 0".into()));
        }
        if self.websocket.heartbeat_interval_ms == 0 || self.websocket.announcement_interval_ms == 0 {
            return Err(AppError::ConfigError("心跳与公告间隔必须大于 0".into()));
        }
        if self.websocket.outbound_queue_capacity == 0 {
            return Err(AppError::ConfigError(
                "websocket.outbound_queue_capacity 必须大于 0".into(),
            ));
        }
        if self.auth.tokens.is_empty() {
            warn!("[配置模块] 未配置任何能力令牌，所有连接都将被拒绝。");
        }
        Ok(())
    }
}

/// 解析配置文件路径：优先使用 `RELAY_CONFIG`，否则使用当前目录下的默认文件名。
pub fn config_file_path() -> PathBuf {
    match env::var(CONFIG_PATH_ENV) {
        Ok(path) if !path.trim().is_empty() => PathBuf::from(path),
        _ => {
            let current_dir = env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
            current_dir.join(DEFAULT_CONFIG_FILE)
        }
    }
}

/// 加载或创建应用配置文件
pub fn load_or_create_config(config_file_path: &Path) -> AppConfig {
    match fs::read_to_string(config_file_path) {
        Ok(content) => match serde_json::from_str::<AppConfig>(&content) {
            Ok(config) => {
                info!("[配置模块] 已成功从配置文件 {:?} 加载应用配置。", config_file_path);
                config
            }
            Err(e) => {
                warn!(
                    "[配置模块] 警告：从 {:?} 反序列化配置失败: {}. 文件可能已损坏。将使用默认配置并尝试覆盖。",
                    config_file_path, e
                );
                let default_config = AppConfig::default();
                save_config(&default_config, config_file_path);
                default_config
            }
        },
        Err(e) => {
            info!(
                "[配置模块] 未在 {:?} 找到配置文件或读取时发生错误 (错误: {}). 将使用默认配置并尝试创建新文件。",
                config_file_path, e
            );
            let default_config = AppConfig::default();
            save_config(&default_config, config_file_path);
            default_config
        }
    }
}

/// 保存配置到文件。写入失败只记录警告，不影响启动。
fn save_config(config: &AppConfig, path: &Path) {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            if let Err(e) = fs::create_dir_all(parent) {
                warn!("[配置模块] 错误：创建配置目录 {:?} 失败: {}", parent, e);
                return;
            }
        }
    }

    match serde_json::to_string_pretty(config) {
        Ok(content) => {
            if let Err(e) = fs::write(path, content) {
                warn!("[配置模块] 错误：将配置写入文件 {:?} 时失败: {}", path, e);
            } else {
                info!("[配置模块] 已成功将当前配置（可能是默认配置）保存到 {:?}.", path);
            }
        }
        Err(e) => {
            warn!("[配置模块] 错误：序列化配置信息以便保存时失败: {}", e);
        }
    }
}
