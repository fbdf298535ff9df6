//! Configuration module: app registry, i18n, and system prompts.

pub mod apps;
mod i18n;
mod prompts;

pub use apps::{display_name, list_supported, resolve, APP_PACKAGES};
pub use i18n::{get_messages, Language, Messages, MESSAGES_EN, MESSAGES_ZH};
pub use prompts::{
    system_prompt_with_resolution, SYSTEM_PROMPT_EN, SYSTEM_PROMPT_ZH,
};
