// relay_server/src/ws_server/auth.rs

//! 凭据校验器。
//!
//! 根据静态凭据目录（用户标识 -> 密码）与能力令牌集合校验连接请求。
//! 校验是纯函数：不保留任何状态，也不产生副作用。

use std::collections::{HashMap, HashSet};

use crate::config::AuthConfig;
use crate::error::AuthError;

/// 连接请求中携带的凭据。
#[derive(Debug, Clone, Copy)]
pub struct Credentials<'a> {
    pub identity: &'a str,
    pub secret: &'a str,
    pub token: &'a str,
}

/// 只读的凭据校验器，启动时由配置构建。
#[derive(Debug, Clone, Default)]
pub struct CredentialValidator {
    directory: HashMap<String, String>,
    tokens: HashSet<String>,
}

impl CredentialValidator {
    pub fn new(
        directory: impl IntoIterator<Item = (String, String)>,
        tokens: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            directory: directory.into_iter().collect(),
            tokens: tokens.into_iter().collect(),
        }
    }

    pub fn from_config(config: &AuthConfig) -> Self {
        Self::new(config.users.clone(), config.tokens.iter().cloned())
    }

    /// 依次检查用户标识、密码与能力令牌。
    pub fn validate(&self, credentials: Credentials<'_>) -> Result<(), AuthError> {
        let expected_secret = self
            .directory
            .get(credentials.identity)
            .ok_or(AuthError::UnknownIdentity)?;
        if expected_secret != credentials.secret {
            return Err(AuthError::BadSecret);
        }
        if !self.tokens.contains(credentials.token) {
            return Err(AuthError::BadToken);
        }
        Ok(())
    }
}
