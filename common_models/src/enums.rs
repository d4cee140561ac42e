//! 通用枚举模块。
//!
//! 本模块定义了服务端与客户端之间共享的枚举类型。所有枚举都派生
//! `Serialize`, `Deserialize`, `Debug`, `Clone`, `PartialEq`, `Eq`，以支持数据交换与比较。

use serde::{Deserialize, Serialize};
use std::fmt;

/// 用户活动通知中的活动类型。
///
/// 在线路上以小写字符串表示（`"joined"` / `"left"`），
/// 浏览器端直接把它作为 CSS 类名使用。
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ActivityKind {
    /// 用户加入（会话已被接纳）。
    Joined,
    /// 用户离开（会话已被拆除）。
    Left,
}

impl ActivityKind {
    /// 返回线路上使用的小写名称。
    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityKind::Joined => "joined",
            ActivityKind::Left => "left",
        }
    }
}

impl fmt::Display for ActivityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_activity_kind_wire_names() {
        assert_eq!(serde_json::to_string(&ActivityKind::Joined).unwrap(), "\"joined\"");
        assert_eq!(serde_json::to_string(&ActivityKind::Left).unwrap(), "\"left\"");
        let parsed: ActivityKind = serde_json::from_str("\"left\"").unwrap();
        assert_eq!(parsed, ActivityKind::Left);
        assert_eq!(ActivityKind::Joined.to_string(), "joined");
    }
}
