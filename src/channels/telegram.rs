//! Telegram client: delivers copies through the Bot API.
//!
//! Text is sent Markdown-first with a plain-text fallback, so attribution
//! links render where possible and malformed markup never loses a message.

use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde_json::{Value, json};

use crate::channels::client::{MessagingClient, Outgoing};
use crate::error::ChannelError;
use crate::types::{ChatId, Media, MediaKind, MessageId};

const TELEGRAM_API_BASE: &str = "https://api.telegram.org";

/// Maximum message length for Telegram's sendMessage API.
const TELEGRAM_MAX_MESSAGE_LENGTH: usize = 4096;

/// Maximum caption length for media messages.
const TELEGRAM_MAX_CAPTION_LENGTH: usize = 1024;

const NAME: &str = "telegram";

/// Telegram Bot API client.
pub struct TelegramClient {
    token: SecretString,
    api_base: String,
    client: reqwest::Client,
}

impl TelegramClient {
    pub fn new(token: SecretString) -> Self {
        Self {
            token,
            api_base: TELEGRAM_API_BASE.to_string(),
            client: reqwest::Client::new(),
        }
    }

    /// Point the client at another Bot API server (local server, tests).
    pub fn with_api_base(mut self, base: impl Into<String>) -> Self {
        self.api_base = base.into().trim_end_matches('/').to_string();
        self
    }

    fn api_url(&self, method: &str) -> String {
        format!(
            "{}/bot{}/{method}",
            self.api_base,
            self.token.expose_secret()
        )
    }

    /// Call a Bot API method and return its `result` field.
    pub async fn call(&self, method: &str, body: &Value) -> Result<Value, ChannelError> {
        let resp = self
            .client
            .post(self.api_url(method))
            .json(body)
            .send()
            .await
            .map_err(|e| ChannelError::Transport {
                name: NAME.into(),
                reason: format!("{method}: {}", e.without_url()),
            })?;

        let status = resp.status().as_u16();
        let data: Value = match resp.json().await {
            Ok(data) => data,
            Err(e) => {
                return Err(ChannelError::Transport {
                    name: NAME.into(),
                    reason: format!("{method}: unreadable response ({status}): {}", e.without_url()),
                });
            }
        };

        if data.get("ok").and_then(Value::as_bool) == Some(true) {
            return Ok(data.get("result").cloned().unwrap_or(Value::Null));
        }

        let code = data
            .get("error_code")
            .and_then(Value::as_u64)
            .map_or(status, |c| c as u16);
        let description = data
            .get("description")
            .and_then(Value::as_str)
            .unwrap_or("no description");
        let retry_after = data
            .get("parameters")
            .and_then(|p| p.get("retry_after"))
            .and_then(Value::as_u64);
        Err(classify(method, code, description, retry_after))
    }

    /// Call with Markdown parsing first, then retry as plain text if the
    /// markup was rejected.
    async fn call_markdown(
        &self,
        method: &str,
        markdown_body: &Value,
        plain_body: &Value,
    ) -> Result<Value, ChannelError> {
        match self.call(method, markdown_body).await {
            Err(ChannelError::Rejected { reason, .. }) if is_markup_error(&reason) => {
                tracing::warn!(
                    method,
                    reason = %reason,
                    "Telegram rejected Markdown; retrying without parse_mode"
                );
                self.call(method, plain_body).await
            }
            other => other,
        }
    }

    /// Check that the token is valid.
    pub async fn health_check(&self) -> Result<(), ChannelError> {
        let me = self.call("getMe", &json!({})).await?;
        let username = me
            .get("username")
            .and_then(|name| name.as_str())
            .unwrap_or("unknown");
        tracing::info!(username, "Telegram bot authenticated");
        Ok(())
    }
}

#[async_trait]
impl MessagingClient for TelegramClient {
    fn name(&self) -> &str {
        NAME
    }

    async fn send(&self, chat: ChatId, message: &Outgoing) -> Result<MessageId, ChannelError> {
        let result = match message {
            Outgoing::Forward {
                from_chat,
                message_id,
            } => {
                let body = json!({
                    "chat_id": chat,
                    "from_chat_id": from_chat,
                    "message_id": message_id,
                });
                self.call("forwardMessage", &body).await?
            }
            Outgoing::Copy { text, media } => {
                let (method, plain) = copy_body(chat, text, media.as_ref());
                self.call_markdown(method, &with_markdown(&plain), &plain)
                    .await?
            }
        };
        message_id_of(&result)
    }

    async fn send_album(
        &self,
        chat: ChatId,
        items: &[Outgoing],
    ) -> Result<Vec<MessageId>, ChannelError> {
        let result = match album_request(chat, items)? {
            AlbumRequest::Forward(body) => self.call("forwardMessages", &body).await?,
            AlbumRequest::Copy(plain) => {
                let mut markdown = plain.clone();
                if let Some(media) = markdown.get_mut("media").and_then(Value::as_array_mut) {
                    for item in media.iter_mut().filter(|i| i.get("caption").is_some()) {
                        item["parse_mode"] = json!("Markdown");
                    }
                }
                self.call_markdown("sendMediaGroup", &markdown, &plain)
                    .await?
            }
        };

        let ids = result
            .as_array()
            .ok_or_else(|| ChannelError::InvalidMessage("album result is not an array".into()))?
            .iter()
            .map(message_id_of)
            .collect::<Result<Vec<_>, _>>()?;
        tracing::debug!(chat, count = ids.len(), "Telegram album sent");
        Ok(ids)
    }

    async fn edit(
        &self,
        chat: ChatId,
        copy: MessageId,
        message: &Outgoing,
    ) -> Result<(), ChannelError> {
        let Outgoing::Copy { text, media } = message else {
            return Err(ChannelError::InvalidMessage(
                "forwarded messages cannot be edited".into(),
            ));
        };

        let (method, plain) = if media.is_some() {
            (
                "editMessageCaption",
                json!({
                    "chat_id": chat,
                    "message_id": copy,
                    "caption": truncate(text, TELEGRAM_MAX_CAPTION_LENGTH),
                }),
            )
        } else {
            (
                "editMessageText",
                json!({
                    "chat_id": chat,
                    "message_id": copy,
                    "text": truncate(text, TELEGRAM_MAX_MESSAGE_LENGTH),
                }),
            )
        };

        match self.call_markdown(method, &with_markdown(&plain), &plain).await {
            Ok(_) => Ok(()),
            Err(ChannelError::Rejected { reason, .. }) if reason.contains("message is not modified") => {
                tracing::debug!(chat, copy, "Telegram copy already up to date");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn delete(&self, chat: ChatId, copy: MessageId) -> Result<(), ChannelError> {
        self.call(
            "deleteMessage",
            &json!({
                "chat_id": chat,
                "message_id": copy,
            }),
        )
        .await?;
        Ok(())
    }
}

// ── Helpers ─────────────────────────────────────────────────────────

/// Map a failed Bot API call onto a transient or permanent error.
fn classify(method: &str, code: u16, description: &str, retry_after: Option<u64>) -> ChannelError {
    let reason = format!("{method}: {description}");
    match code {
        429 => ChannelError::RateLimited {
            name: NAME.into(),
            retry_after: retry_after.map(Duration::from_secs),
        },
        403 => ChannelError::Forbidden {
            name: NAME.into(),
            reason,
        },
        500.. => ChannelError::Transport {
            name: NAME.into(),
            reason,
        },
        _ if description.contains("not found") => ChannelError::NotFound {
            name: NAME.into(),
            reason,
        },
        _ => ChannelError::Rejected {
            name: NAME.into(),
            reason,
        },
    }
}

fn is_markup_error(reason: &str) -> bool {
    reason.contains("can't parse entities") || reason.contains("can't find end of")
}

/// Bot API method that sends a given media kind by file id.
fn send_method(kind: MediaKind) -> &'static str {
    match kind {
        MediaKind::Photo => "sendPhoto",
        MediaKind::Video => "sendVideo",
        MediaKind::Document => "sendDocument",
        MediaKind::Audio => "sendAudio",
        MediaKind::Animation => "sendAnimation",
    }
}

/// Method and plain-text body for a copy.
fn copy_body(chat: ChatId, text: &str, media: Option<&Media>) -> (&'static str, Value) {
    match media {
        None => (
            "sendMessage",
            json!({
                "chat_id": chat,
                "text": truncate(text, TELEGRAM_MAX_MESSAGE_LENGTH),
            }),
        ),
        Some(media) => {
            let mut body = json!({ "chat_id": chat });
            body[media.kind.as_str()] = json!(media.file_id);
            if !text.is_empty() {
                body["caption"] = json!(truncate(text, TELEGRAM_MAX_CAPTION_LENGTH));
            }
            (send_method(media.kind), body)
        }
    }
}

fn with_markdown(plain: &Value) -> Value {
    let mut body = plain.clone();
    body["parse_mode"] = json!("Markdown");
    body
}

enum AlbumRequest {
    Forward(Value),
    Copy(Value),
}

/// Build a forwardMessages or sendMediaGroup request for an album.
fn album_request(chat: ChatId, items: &[Outgoing]) -> Result<AlbumRequest, ChannelError> {
    let Some(first) = items.first() else {
        return Err(ChannelError::InvalidMessage("empty album".into()));
    };

    if let Outgoing::Forward { from_chat, .. } = first {
        let ids = items
            .iter()
            .map(|item| match item {
                Outgoing::Forward {
                    from_chat: c,
                    message_id,
                } if c == from_chat => Ok(*message_id),
                _ => Err(ChannelError::InvalidMessage(
                    "album mixes forwards from different sources".into(),
                )),
            })
            .collect::<Result<Vec<_>, _>>()?;
        return Ok(AlbumRequest::Forward(json!({
            "chat_id": chat,
            "from_chat_id": from_chat,
            "message_ids": ids,
        })));
    }

    let mut media = Vec::with_capacity(items.len());
    for item in items {
        let Outgoing::Copy {
            text,
            media: Some(m),
        } = item
        else {
            return Err(ChannelError::InvalidMessage(
                "album items must all be media copies".into(),
            ));
        };
        let mut entry = json!({
            "type": m.kind.as_str(),
            "media": m.file_id,
        });
        if !text.is_empty() {
            entry["caption"] = json!(truncate(text, TELEGRAM_MAX_CAPTION_LENGTH));
        }
        media.push(entry);
    }
    Ok(AlbumRequest::Copy(json!({
        "chat_id": chat,
        "media": media,
    })))
}

fn message_id_of(result: &Value) -> Result<MessageId, ChannelError> {
    result
        .get("message_id")
        .and_then(Value::as_i64)
        .ok_or_else(|| ChannelError::InvalidMessage("response has no message_id".into()))
}

/// Cut `text` to at most `max` characters on a char boundary.
fn truncate(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

// ── Tests ───────────────────────────────────────────────────────────
