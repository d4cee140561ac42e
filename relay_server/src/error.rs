use thiserror::Error;

/// WebSocket 关闭码：凭据或令牌无效。
pub const CLOSE_CODE_UNAUTHORIZED: u16 = 1008;
/// WebSocket 关闭码：重复登录或连接数已满，稍后重试。
pub const CLOSE_CODE_TRY_AGAIN_LATER: u16 = 1013;
/// WebSocket 关闭码：服务端正在关闭。
pub const CLOSE_CODE_GOING_AWAY: u16 = 1001;

/// 应用的进程级错误类型
///
/// 只在启动阶段出现（例如无法绑定监听端口），对整个进程是致命的。
#[derive(Error, Debug)]
pub enum AppError {
    #[error("WebSocket 服务错误: {0}")]
    WebSocketService(String),

    #[error("配置错误: {0}")]
    ConfigError(String),

    #[error("无法绑定监听地址 {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("HTTP 客户端初始化失败: {0}")]
    HttpClient(#[from] reqwest::Error),

    #[error("I/O 错误: {0}")]
    Io(#[from] std::io::Error),
}

/// 凭据校验失败的原因。
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthError {
    #[error("unknown identity")]
    UnknownIdentity,
    #[error("bad secret")]
    BadSecret,
    #[error("invalid token")]
    BadToken,
}

/// 会话接纳失败的原因。
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionError {
    #[error("User already connected")]
    AlreadyConnected,
    #[error("Too many connections")]
    CapacityExceeded,
    #[error("Server shutting down")]
    ShuttingDown,
}

/// 连接在认证阶段被拒绝。携带发给客户端的错误信息与关闭码。
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    #[error("Unauthorized: {0}")]
    Authentication(#[from] AuthError),
    #[error("{0}")]
    Admission(#[from] AdmissionError),
}

impl RejectReason {
    /// 对应的 WebSocket 关闭码。
    pub fn close_code(&self) -> u16 {
        match self {
            RejectReason::Authentication(_) => CLOSE_CODE_UNAUTHORIZED,
            RejectReason::Admission(AdmissionError::ShuttingDown) => CLOSE_CODE_GOING_AWAY,
            RejectReason::Admission(_) => CLOSE_CODE_TRY_AGAIN_LATER,
        }
    }

    /// 关闭帧中携带的简短原因。
    pub fn close_reason(&self) -> &'static str {
        match self {
            RejectReason::Authentication(_) => "Unauthorized",
            RejectReason::Admission(AdmissionError::AlreadyConnected) => "User already connected",
            RejectReason::Admission(AdmissionError::CapacityExceeded) => "Too many connections",
            RejectReason::Admission(AdmissionError::ShuttingDown) => "Server shutting down",
        }
    }
}

/// 路由定向消息时报告给发送方的错误。会话保持打开。
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RouteError {
    #[error("Invalid message format. Use JSON: {{\"to\":\"user2\", \"text\":\"hello\"}}")]
    MalformedPayload,
    #[error("User {0} not connected.")]
    RecipientUnavailable(String),
}

/// 向某个会话投递出站帧失败。对该会话而言是致命的传输故障。
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("出站队列已满")]
    QueueFull,
    #[error("会话已关闭")]
    SessionClosed,
    #[error("消息序列化失败")]
    Serialization,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reject_reason_close_codes() {
        let auth = RejectReason::from(AuthError::BadSecret);
        assert_eq!(auth.close_code(), 1008);
        assert_eq!(auth.close_reason(), "Unauthorized");
        assert_eq!(auth.to_string(), "Unauthorized: bad secret");

        let dup = RejectReason::from(AdmissionError::AlreadyConnected);
        assert_eq!(dup.close_code(), 1013);
        assert_eq!(dup.close_reason(), "User already connected");

        let full = RejectReason::from(AdmissionError::CapacityExceeded);
        assert_eq!(full.close_code(), 1013);
        assert_eq!(full.to_string(), "Too many connections");

        let closing = RejectReason::from(AdmissionError::ShuttingDown);
        assert_eq!(closing.close_code(), 1001);
        assert_eq!(closing.close_reason(), "Server shutting down");
    }

    #[test]
    fn test_route_error_messages() {
        assert_eq!(
            RouteError::MalformedPayload.to_string(),
            r#"Invalid message format. Use JSON: {"to":"user2", "text":"hello"}"#
        );
        assert_eq!(
            RouteError::RecipientUnavailable("user9".into()).to_string(),
            "User user9 not connected."
        );
    }
}
