//! Internationalization of user-facing agent messages.

use serde::{Deserialize, Serialize};

/// Language for prompts and user-visible messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    #[default]
    Cn,
    En,
}

impl Language {
    /// Parse a language code. Unrecognized codes fall back to Chinese,
    /// matching the default of the model this agent drives.
    pub fn from_code(code: &str) -> Self {
        match code.to_ascii_lowercase().as_str() {
            "en" => Language::En,
            _ => Language::Cn,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Language::Cn => "cn",
            Language::En => "en",
        }
    }
}

/// User-visible message table.
#[derive(Debug, Clone)]
pub struct Messages {
    pub thinking: &'static str,
    pub action: &'static str,
    pub task_completed: &'static str,
    pub task_stopped: &'static str,
    pub done: &'static str,
    pub step_budget_exhausted: &'static str,
    pub user_denied: &'static str,
    pub app_not_supported: &'static str,
    pub takeover_requested: &'static str,
    pub connection_successful: &'static str,
    pub connection_failed: &'static str,
    pub disconnected: &'static str,
    pub no_device: &'static str,
    pub adb_missing: &'static str,
    pub tcpip_requires_usb: &'static str,
}

pub static MESSAGES_ZH: Messages = Messages {
    thinking: "思考过程",
    action: "执行动作",
    task_completed: "任务完成",
    task_stopped: "任务已停止",
    done: "完成",
    step_budget_exhausted: "已达到最大步数限制，任务终止",
    user_denied: "用户拒绝了敏感操作",
    app_not_supported: "不支持该应用",
    takeover_requested: "需要人工接管",
    connection_successful: "连接成功",
    connection_failed: "连接失败",
    disconnected: "已断开连接",
    no_device: "未找到已连接的设备",
    adb_missing: "未找到 adb，请安装 Android SDK platform-tools 并加入 PATH",
    tcpip_requires_usb: "启用 TCP/IP 模式需要已连接的 USB 设备",
};

pub static MESSAGES_EN: Messages = Messages {
    thinking: "Thinking",
    action: "Action",
    task_completed: "Task completed",
    task_stopped: "Task stopped",
    done: "Done",
    step_budget_exhausted: "step budget exhausted",
    user_denied: "user denied",
    app_not_supported: "app not supported",
    takeover_requested: "Manual takeover required",
    connection_successful: "Connected",
    connection_failed: "Connection failed",
    disconnected: "Disconnected",
    no_device: "no connected device found",
    adb_missing: "adb not found; install Android SDK platform-tools and add it to PATH",
    tcpip_requires_usb: "enabling TCP/IP mode requires a connected USB device",
};

/// Get the message table for a language.
pub fn get_messages(lang: Language) -> &'static Messages {
    match lang {
        Language::En => &MESSAGES_EN,
        Language::Cn => &MESSAGES_ZH,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_code() {
        assert_eq!(Language::from_code("en"), Language::En);
        assert_eq!(Language::from_code("EN"), Language::En);
        assert_eq!(Language::from_code("cn"), Language::Cn);
        assert_eq!(Language::from_code("zz"), Language::Cn);
    }

    #[test]
    fn test_tables_differ() {
        assert_ne!(
            get_messages(Language::Cn).task_completed,
            get_messages(Language::En).task_completed
        );
    }

    #[test]
    fn test_serde_codes() {
        let s = serde_json::to_string(&Language::En).unwrap();
        assert_eq!(s, "\"en\"");
        let l: Language = serde_json::from_str("\"cn\"").unwrap();
        assert_eq!(l, Language::Cn);
    }
}
