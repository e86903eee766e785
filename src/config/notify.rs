use crate::config::read_env_or_file;
use anyhow::{Context, Result};
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramConfig {
    pub bot_token: String,
    pub chat_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ProviderConfig {
    Feishu {
        webhook_url: String,
        secret: Option<String>,
    },
    DingTalk {
        webhook_url: String,
        secret: Option<String>,
    },
    WeChatWork {
        webhook_url: String,
    },
    PushPlus {
        token: String,
        url: String,
    },
    Bark {
        device_token: String,
        server_url: String,
    },
    Telegram {
        bot_token: String,
        chat_id: String,
    },
}

impl ProviderConfig {
    pub fn name(&self) -> &'static str {
        match self {
            ProviderConfig::Feishu { .. } => "feishu",
            ProviderConfig::DingTalk { .. } => "dingtalk",
            ProviderConfig::WeChatWork { .. } => "wechat_work",
            ProviderConfig::PushPlus { .. } => "pushplus",
            ProviderConfig::Bark { .. } => "bark",
            ProviderConfig::Telegram { .. } => "telegram",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatchMode {
    /// Try providers in order, stop at the first success.
    Fallback,
    /// Deliver through every provider.
    Broadcast,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifyConfig {
    pub mode: DispatchMode,
    pub providers: Vec<ProviderConfig>,
}

impl NotifyConfig {
    pub fn is_enabled(&self) -> bool {
        !self.providers.is_empty()
    }
}

/// Builds the provider list from `NOTIFICATION_PROVIDERS` (comma separated, in
/// priority order). Providers missing their credentials are skipped.
pub fn load_notify_config() -> Result<NotifyConfig> {
    let mode = match env::var("NOTIFICATION_MODE").as_deref() {
        Ok("broadcast") => DispatchMode::Broadcast,
        Ok("fallback") | Err(_) => DispatchMode::Fallback,
        Ok(other) => {
            return Err(anyhow::anyhow!(
                "NOTIFICATION_MODE must be 'fallback' or 'broadcast', got '{}'",
                other
            ))
        }
    };

    let names = env::var("NOTIFICATION_PROVIDERS").unwrap_or_default();
    let mut providers = Vec::new();

    for name in names.split(',').map(str::trim).filter(|n| !n.is_empty()) {
        match load_provider(name)? {
            Some(p) => {
                info!("Notification provider {} configured and enabled", name);
                providers.push(p);
            }
            None => {}
        }
    }

    if providers.is_empty() {
        warn!("No notification providers available, push notifications disabled");
    }

    Ok(NotifyConfig { mode, providers })
}

fn load_provider(name: &str) -> Result<Option<ProviderConfig>> {
    let provider = match name {
        "feishu" => read_env_or_file("FEISHU_WEBHOOK_URL")
            .ok()
            .map(|webhook_url| ProviderConfig::Feishu {
                webhook_url,
                secret: read_env_or_file("FEISHU_SECRET").ok(),
            }),
        "dingtalk" => read_env_or_file("DINGTALK_WEBHOOK_URL")
            .ok()
            .map(|webhook_url| ProviderConfig::DingTalk {
                webhook_url,
                secret: read_env_or_file("DINGTALK_SECRET").ok(),
            }),
        "wechat_work" => read_env_or_file("WECHAT_WORK_WEBHOOK_URL")
            .ok()
            .map(|webhook_url| ProviderConfig::WeChatWork { webhook_url }),
        "pushplus" => read_env_or_file("PUSHPLUS_TOKEN")
            .ok()
            .map(|token| ProviderConfig::PushPlus {
                token,
                url: env::var("PUSHPLUS_URL")
                    .unwrap_or_else(|_| "https://www.pushplus.plus/send".to_string()),
            }),
        "bark" => read_env_or_file("BARK_DEVICE_TOKEN")
            .ok()
            .map(|device_token| ProviderConfig::Bark {
                device_token,
                server_url: env::var("BARK_SERVER_URL")
                    .unwrap_or_else(|_| "https://api.day.app".to_string()),
            }),
        "telegram" => load_telegram_config()?.map(|c| ProviderConfig::Telegram {
            bot_token: c.bot_token,
            chat_id: c.chat_id,
        }),
        other => {
            error!("Unknown notification provider: {}", other);
            return Ok(None);
        }
    };

    if provider.is_none() {
        warn!(
            "Notification provider {} is not configured correctly, skipped",
            name
        );
    }
    Ok(provider)
}

fn load_telegram_config() -> Result<Option<TelegramConfig>> {
    if let Ok(raw_path) = env::var("TELEGRAM_CONFIG_FILE") {
        // Expand tilde if present
        let path = if raw_path.starts_with("~/") {
            if let Ok(home) = env::var("HOME") {
                raw_path.replacen("~", &home, 1)
            } else {
                raw_path
            }
        } else {
            raw_path
        };

        let content = fs::read_to_string(&path)
            .context(format!("Failed to read TELEGRAM_CONFIG_FILE at {}", path))?;
        return Ok(Some(
            serde_json::from_str(&content)
                .context("Failed to parse TELEGRAM_CONFIG_FILE as JSON")?,
        ));
    }

    let tg_token = read_env_or_file("TELEGRAM_BOT_TOKEN").ok();
    let tg_chat = read_env_or_file("TELEGRAM_CHAT_ID").ok();

    Ok(match (tg_token, tg_chat) {
        (Some(bot_token), Some(chat_id)) => Some(TelegramConfig { bot_token, chat_id }),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_provider_is_skipped() {
        assert!(load_provider("carrier_pigeon").unwrap().is_none());
    }

    #[test]
    fn test_provider_names() {
        let p = ProviderConfig::Feishu {
            webhook_url: "https://open.feishu.cn/hook".to_string(),
            secret: None,
        };
        assert_eq!(p.name(), "feishu");
        let p = ProviderConfig::WeChatWork {
            webhook_url: "https://qyapi.weixin.qq.com/hook".to_string(),
        };
        assert_eq!(p.name(), "wechat_work");
    }
}
