//! Push providers: signed webhooks plus Telegram.

use crate::config::notify::ProviderConfig;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use hmac::{Hmac, Mac};
use serde_json::{json, Value};
use sha2::Sha256;
use teloxide::prelude::*;

type HmacSha256 = Hmac<Sha256>;

/// Bark GET URLs get unwieldy past this.
const BARK_GET_MAX_CONTENT: usize = 100;

#[async_trait]
pub trait NotificationProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Delivers one message. `Ok` only when the provider acknowledged it.
    async fn send(&self, title: &str, content: &str) -> Result<()>;
}

/// base64(HMAC-SHA256(key = secret, message = "{timestamp}\n{secret}"))
pub fn hmac_sign(secret: &str, timestamp: &str) -> Result<String> {
    let string_to_sign = format!("{}\n{}", timestamp, secret);
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| anyhow!("HMAC initialization failed: {}", e))?;
    mac.update(string_to_sign.as_bytes());
    Ok(BASE64.encode(mac.finalize().into_bytes()))
}

fn json_field_eq(body: &Value, field: &str, expected: i64) -> bool {
    body.get(field).and_then(Value::as_i64) == Some(expected)
}

async fn post_json(client: &reqwest::Client, url: &str, body: &Value) -> Result<(u16, Value)> {
    let response = client
        .post(url)
        .json(body)
        .send()
        .await
        .context("request failed")?;
    let status = response.status().as_u16();
    let body: Value = response.json().await.context("response is not JSON")?;
    Ok((status, body))
}

pub struct FeishuProvider {
    client: reqwest::Client,
    webhook_url: String,
    secret: Option<String>,
}

impl FeishuProvider {
    pub fn body(&self, title: &str, content: &str, timestamp_s: i64) -> Result<Value> {
        let mut data = json!({
            "msg_type": "text",
            "content": { "text": format!("{}\n\n{}", title, content) },
        });
        if let Some(secret) = &self.secret {
            let timestamp = timestamp_s.to_string();
            data["sign"] = json!(hmac_sign(secret, &timestamp)?);
            data["timestamp"] = json!(timestamp);
        }
        Ok(data)
    }
}

#[async_trait]
impl NotificationProvider for FeishuProvider {
    fn name(&self) -> &str {
        "feishu"
    }

    async fn send(&self, title: &str, content: &str) -> Result<()> {
        let data = self.body(title, content, chrono::Utc::now().timestamp())?;
        let (status, body) = post_json(&self.client, &self.webhook_url, &data).await?;
        if status == 200 && json_field_eq(&body, "code", 0) {
            Ok(())
        } else {
            Err(anyhow!("status={}, response={}", status, body))
        }
    }
}

pub struct DingTalkProvider {
    client: reqwest::Client,
    webhook_url: String,
    secret: Option<String>,
}

impl DingTalkProvider {
    /// Webhook URL with `timestamp` and `sign` appended when a secret is set.
    pub fn signed_url(&self, timestamp_ms: i64) -> Result<String> {
        let Some(secret) = &self.secret else {
            return Ok(self.webhook_url.clone());
        };
        let timestamp = timestamp_ms.to_string();
        let sign = hmac_sign(secret, &timestamp)?;
        let sep = if self.webhook_url.contains('?') { '&' } else { '?' };
        Ok(format!(
            "{}{}timestamp={}&sign={}",
            self.webhook_url,
            sep,
            timestamp,
            urlencoding::encode(&sign)
        ))
    }
}

#[async_trait]
impl NotificationProvider for DingTalkProvider {
    fn name(&self) -> &str {
        "dingtalk"
    }

    async fn send(&self, title: &str, content: &str) -> Result<()> {
        let url = self.signed_url(chrono::Utc::now().timestamp_millis())?;
        let data = json!({
            "msgtype": "text",
            "text": { "content": format!("{}\n\n{}", title, content) },
        });
        let (status, body) = post_json(&self.client, &url, &data).await?;
        if status == 200 && json_field_eq(&body, "errcode", 0) {
            Ok(())
        } else {
            Err(anyhow!("status={}, response={}", status, body))
        }
    }
}

pub struct WeChatWorkProvider {
    client: reqwest::Client,
    webhook_url: String,
}

#[async_trait]
impl NotificationProvider for WeChatWorkProvider {
    fn name(&self) -> &str {
        "wechat_work"
    }

    async fn send(&self, title: &str, content: &str) -> Result<()> {
        let data = json!({
            "msgtype": "text",
            "text": { "content": format!("{}\n\n{}", title, content) },
        });
        let (status, body) = post_json(&self.client, &self.webhook_url, &data).await?;
        if status == 200 && json_field_eq(&body, "errcode", 0) {
            Ok(())
        } else {
            Err(anyhow!("status={}, response={}", status, body))
        }
    }
}

pub struct PushPlusProvider {
    client: reqwest::Client,
    token: String,
    url: String,
}

#[async_trait]
impl NotificationProvider for PushPlusProvider {
    fn name(&self) -> &str {
        "pushplus"
    }

    async fn send(&self, title: &str, content: &str) -> Result<()> {
        let form = [
            ("token", self.token.as_str()),
            ("title", title),
            ("content", content),
            ("template", "txt"),
        ];
        let response = self
            .client
            .post(&self.url)
            .form(&form)
            .send()
            .await
            .context("request failed")?;
        let status = response.status().as_u16();
        let body: Value = response.json().await.context("response is not JSON")?;
        if status == 200 && json_field_eq(&body, "code", 200) {
            Ok(())
        } else {
            Err(anyhow!("status={}, response={}", status, body))
        }
    }
}

pub struct BarkProvider {
    client: reqwest::Client,
    device_token: String,
    server_url: String,
}

impl BarkProvider {
    fn base(&self) -> String {
        format!(
            "{}/{}",
            self.server_url.trim_end_matches('/'),
            self.device_token
        )
    }

    pub fn get_url(&self, title: &str, content: &str) -> String {
        let content: String = if content.chars().count() > BARK_GET_MAX_CONTENT {
            let mut short: String = content.chars().take(BARK_GET_MAX_CONTENT).collect();
            short.push_str("...");
            short
        } else {
            content.to_string()
        };
        format!(
            "{}/{}/{}",
            self.base(),
            urlencoding::encode(title),
            urlencoding::encode(&content)
        )
    }

    async fn send_post(&self, title: &str, content: &str) -> Result<()> {
        let data = json!({ "title": title, "body": content });
        let (status, body) = post_json(&self.client, &self.base(), &data).await?;
        if status == 200 && json_field_eq(&body, "code", 200) {
            Ok(())
        } else {
            Err(anyhow!("status={}, response={}", status, body))
        }
    }

    async fn send_get(&self, title: &str, content: &str) -> Result<()> {
        let response = self
            .client
            .get(self.get_url(title, content))
            .send()
            .await
            .context("request failed")?;
        let status = response.status().as_u16();
        let body: Value = response.json().await.context("response is not JSON")?;
        if status == 200 && json_field_eq(&body, "code", 200) {
            Ok(())
        } else {
            Err(anyhow!("status={}, response={}", status, body))
        }
    }
}

#[async_trait]
impl NotificationProvider for BarkProvider {
    fn name(&self) -> &str {
        "bark"
    }

    async fn send(&self, title: &str, content: &str) -> Result<()> {
        match self.send_post(title, content).await {
            Ok(()) => Ok(()),
            Err(e) => {
                log::info!("Bark POST failed ({}), trying GET...", e);
                self.send_get(title, content).await
            }
        }
    }
}

pub struct TelegramProvider {
    bot: Bot,
    chat_id: ChatId,
}

#[async_trait]
impl NotificationProvider for TelegramProvider {
    fn name(&self) -> &str {
        "telegram"
    }

    async fn send(&self, title: &str, content: &str) -> Result<()> {
        self.bot
            .send_message(self.chat_id, format!("{}\n\n{}", title, content))
            .await
            .map_err(|e| anyhow!("telegram send failed: {}", e))?;
        Ok(())
    }
}

/// Instantiates the provider for one configured entry.
pub fn build_provider(
    config: &ProviderConfig,
    client: reqwest::Client,
) -> Result<Box<dyn NotificationProvider>> {
    Ok(match config {
        ProviderConfig::Feishu {
            webhook_url,
            secret,
        } => Box::new(FeishuProvider {
            client,
            webhook_url: webhook_url.clone(),
            secret: secret.clone(),
        }),
        ProviderConfig::DingTalk {
            webhook_url,
            secret,
        } => Box::new(DingTalkProvider {
            client,
            webhook_url: webhook_url.clone(),
            secret: secret.clone(),
        }),
        ProviderConfig::WeChatWork { webhook_url } => Box::new(WeChatWorkProvider {
            client,
            webhook_url: webhook_url.clone(),
        }),
        ProviderConfig::PushPlus { token, url } => Box::new(PushPlusProvider {
            client,
            token: token.clone(),
            url: url.clone(),
        }),
        ProviderConfig::Bark {
            device_token,
            server_url,
        } => Box::new(BarkProvider {
            client,
            device_token: device_token.clone(),
            server_url: server_url.clone(),
        }),
        ProviderConfig::Telegram { bot_token, chat_id } => Box::new(TelegramProvider {
            bot: Bot::new(bot_token),
            chat_id: ChatId(
                chat_id
                    .parse::<i64>()
                    .with_context(|| format!("invalid TELEGRAM_CHAT_ID {}", chat_id))?,
            ),
        }),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hmac_sign_is_deterministic_base64() {
        let a = hmac_sign("SEC123", "1700000000").unwrap();
        let b = hmac_sign("SEC123", "1700000000").unwrap();
        assert_eq!(a, b);
        // 32-byte digest → 44 base64 chars
        assert_eq!(a.len(), 44);
        assert_ne!(a, hmac_sign("SEC123", "1700000001").unwrap());
    }

    #[test]
    fn test_feishu_body_carries_signature() {
        let provider = FeishuProvider {
            client: reqwest::Client::new(),
            webhook_url: "https://open.feishu.cn/hook/x".to_string(),
            secret: Some("s3cret".to_string()),
        };
        let body = provider.body("Title", "Body", 1_700_000_000).unwrap();
        assert_eq!(body["msg_type"], "text");
        assert_eq!(body["content"]["text"], "Title\n\nBody");
        assert_eq!(body["timestamp"], "1700000000");
        assert_eq!(
            body["sign"],
            json!(hmac_sign("s3cret", "1700000000").unwrap())
        );

        let unsigned = FeishuProvider {
            secret: None,
            ..provider
        };
        assert!(unsigned.body("T", "B", 1).unwrap().get("sign").is_none());
    }

    #[test]
    fn test_dingtalk_signed_url() {
        let provider = DingTalkProvider {
            client: reqwest::Client::new(),
            webhook_url: "https://oapi.dingtalk.com/robot/send?access_token=abc".to_string(),
            secret: Some("SECabc".to_string()),
        };
        let url = provider.signed_url(1_700_000_000_000).unwrap();
        assert!(url.starts_with(
            "https://oapi.dingtalk.com/robot/send?access_token=abc&timestamp=1700000000000&sign="
        ));
        let sign = url.rsplit("sign=").next().unwrap();
        let expected = hmac_sign("SECabc", "1700000000000").unwrap();
        assert_eq!(sign, urlencoding::encode(&expected));
    }

    #[test]
    fn test_bark_get_url_truncates_and_encodes() {
        let provider = BarkProvider {
            client: reqwest::Client::new(),
            device_token: "dev".to_string(),
            server_url: "https://api.day.app/".to_string(),
        };
        let url = provider.get_url("Grid Shift", &"x".repeat(150));
        assert!(url.starts_with("https://api.day.app/dev/Grid%20Shift/"));
        assert!(url.ends_with("x..."));
    }

    #[test]
    fn test_build_provider_rejects_bad_chat_id() {
        let res = build_provider(
            &ProviderConfig::Telegram {
                bot_token: "123:abc".to_string(),
                chat_id: "not-a-number".to_string(),
            },
            reqwest::Client::new(),
        );
        assert!(res.is_err());
    }
}
