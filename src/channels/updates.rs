//! Telegram update poller: long-polls `getUpdates` for source posts.

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::Stream;
use serde_json::{Value, json};

use crate::channels::telegram::TelegramClient;
use crate::types::{Media, MediaKind, SourceMessage};

/// A change observed in a source chat.
#[derive(Debug, Clone, PartialEq)]
pub enum SourceUpdate {
    New(SourceMessage),
    Edited(SourceMessage),
}

pub type UpdateStream = Pin<Box<dyn Stream<Item = SourceUpdate> + Send>>;

/// Long-polls the Bot API and yields source updates in arrival order.
pub struct TelegramUpdates {
    client: Arc<TelegramClient>,
    poll_timeout: Duration,
}

impl TelegramUpdates {
    pub fn new(client: Arc<TelegramClient>, poll_timeout: Duration) -> Self {
        Self {
            client,
            poll_timeout,
        }
    }

    /// Spawn the polling loop. The stream ends when the consumer drops it.
    pub fn start(self) -> UpdateStream {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();

        tokio::spawn(async move {
            let mut offset: i64 = 0;
            tracing::info!("Telegram poller listening for channel posts...");

            loop {
                let body = json!({
                    "offset": offset,
                    "timeout": self.poll_timeout.as_secs(),
                    "allowed_updates": [
                        "channel_post",
                        "edited_channel_post",
                        "message",
                        "edited_message"
                    ]
                });

                let results = match self.client.call("getUpdates", &body).await {
                    Ok(r) => r,
                    Err(e) => {
                        tracing::warn!(error = %e, "Telegram poll error");
                        let delay = e.retry_after().unwrap_or(Duration::from_secs(5));
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                };

                for update in results.as_array().into_iter().flatten() {
                    if let Some(uid) = update.get("update_id").and_then(Value::as_i64) {
                        offset = uid + 1;
                    }

                    let Some(parsed) = parse_update(update) else {
                        continue;
                    };
                    if tx.send(parsed).is_err() {
                        tracing::info!("Telegram update consumer closed");
                        return;
                    }
                }
            }
        });

        let stream = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|update| (update, rx))
        });
        Box::pin(stream)
    }
}

/// Convert one raw update. Updates without a usable message are skipped.
pub fn parse_update(update: &Value) -> Option<SourceUpdate> {
    if let Some(msg) = update.get("channel_post").or_else(|| update.get("message")) {
        return parse_message(msg).map(SourceUpdate::New);
    }
    if let Some(msg) = update
        .get("edited_channel_post")
        .or_else(|| update.get("edited_message"))
    {
        return parse_message(msg).map(SourceUpdate::Edited);
    }
    None
}

fn parse_message(msg: &Value) -> Option<SourceMessage> {
    let chat = msg.get("chat")?.get("id")?.as_i64()?;
    let id = msg.get("message_id")?.as_i64()?;

    let text = msg
        .get("text")
        .or_else(|| msg.get("caption"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let media = parse_media(msg);
    if text.is_empty() && media.is_none() {
        return None;
    }

    let date = msg
        .get("date")
        .and_then(Value::as_i64)
        .and_then(|ts| DateTime::<Utc>::from_timestamp(ts, 0))
        .unwrap_or_else(Utc::now);

    Some(SourceMessage {
        chat,
        id,
        text,
        media,
        media_group: msg
            .get("media_group_id")
            .and_then(Value::as_str)
            .map(String::from),
        date,
    })
}

fn parse_media(msg: &Value) -> Option<Media> {
    // Photos arrive as a size ladder; the last entry is the largest.
    if let Some(sizes) = msg.get("photo").and_then(Value::as_array) {
        let file_id = sizes.last()?.get("file_id")?.as_str()?;
        return Some(Media {
            kind: MediaKind::Photo,
            file_id: file_id.to_string(),
        });
    }

    // Animations also carry a `document` field, so check them first.
    [
        MediaKind::Animation,
        MediaKind::Video,
        MediaKind::Audio,
        MediaKind::Document,
    ]
    .into_iter()
    .find_map(|kind| {
        let file_id = msg.get(kind.as_str())?.get("file_id")?.as_str()?;
        Some(Media {
            kind,
            file_id: file_id.to_string(),
        })
    })
}
