//! MTProto adapter for [`ChannelSource`].
//!
//! Requires a pre-authorized session file (the same operational model as the
//! rest of the deployment: sessions are provisioned out of band, never
//! interactively from the pipeline).

use async_trait::async_trait;
use dashmap::DashMap;
use grammers_client::types::{Chat, Message};
use grammers_client::{Client, Config, InitParams, InvocationError, Update};
use grammers_client::session::Session;
use tracing::{debug, info};

use tutorpipe_core::config::TelegramConfig;

use crate::types::{normalize_channel_ref, SourceChannel, SourceError, SourceEvent, SourceMessage};
use crate::ChannelSource;

pub struct TelegramSource {
    client: Client,
    /// channel_link -> resolved chat, so history paging can reuse the
    /// resolution the tail subscription already did.
    chats: DashMap<String, Chat>,
}

fn map_invocation(e: InvocationError) -> SourceError {
    if let InvocationError::Rpc(rpc) = &e {
        if rpc.name.starts_with("FLOOD_WAIT") {
            return SourceError::FloodWait {
                seconds: rpc.value.unwrap_or(1) as u64,
            };
        }
        if rpc.name.starts_with("SLOWMODE_WAIT") {
            return SourceError::SlowMode {
                seconds: rpc.value.unwrap_or(1) as u64,
            };
        }
        if rpc.name.starts_with("FLOOD") {
            return SourceError::Flood;
        }
        if rpc.code == 401 {
            return SourceError::Unauthorized(rpc.name.clone());
        }
    }
    SourceError::Transient(e.to_string())
}

fn convert_message(msg: &Message) -> SourceMessage {
    SourceMessage {
        id: msg.id() as i64,
        date: msg.date(),
        edit_date: msg.edit_date(),
        text: msg.text().to_string(),
        sender_id: msg.sender().map(|s| s.id()),
        is_forward: msg.forward_header().is_some(),
        reply_to_msg_id: msg.reply_to_message_id().map(|id| id as i64),
        views: msg.view_count().map(|v| v as i64),
        forwards: msg.forward_count().map(|v| v as i64),
        reply_count: msg.reply_count().map(|v| v as i64),
    }
}

fn convert_chat(chat: &Chat, fallback_ref: &str) -> SourceChannel {
    let username = chat.username().map(str::to_string);
    let channel_link = username
        .as_deref()
        .map(|u| format!("t.me/{u}"))
        .unwrap_or_else(|| normalize_channel_ref(fallback_ref));
    SourceChannel {
        channel_link,
        id: chat.id(),
        title: Some(chat.name().to_string()),
        username,
    }
}

impl TelegramSource {
    /// Connect with the configured session file. Fails fast when the session
    /// is missing or unauthorized; that is a `config` class error.
    pub async fn connect(cfg: &TelegramConfig) -> Result<Self, SourceError> {
        let session = Session::load_file_or_create(&cfg.session_file)
            .map_err(|e| SourceError::Unauthorized(format!("session file: {e}")))?;
        let client = Client::connect(Config {
            session,
            api_id: cfg.api_id,
            api_hash: cfg.api_hash.clone(),
            params: InitParams::default(),
        })
        .await
        .map_err(|e| SourceError::Transient(e.to_string()))?;

        if !client
            .is_authorized()
            .await
            .map_err(map_invocation)?
        {
            return Err(SourceError::Unauthorized(
                "session is not authorized; provision it before starting the collector".to_string(),
            ));
        }
        info!(session = %cfg.session_file, "telegram source connected");
        Ok(Self {
            client,
            chats: DashMap::new(),
        })
    }

    fn cached_chat(&self, channel_link: &str) -> Option<Chat> {
        self.chats.get(channel_link).map(|c| c.clone())
    }
}

#[async_trait]
impl ChannelSource for TelegramSource {
    async fn resolve(&self, channel_ref: &str) -> Result<SourceChannel, SourceError> {
        let link = normalize_channel_ref(channel_ref);
        let username = link.trim_start_matches("t.me/");
        let chat = self
            .client
            .resolve_username(username)
            .await
            .map_err(map_invocation)?
            .ok_or_else(|| SourceError::UnknownChannel(link.clone()))?;
        let channel = convert_chat(&chat, &link);
        self.chats.insert(channel.channel_link.clone(), chat);
        debug!(channel = %channel.channel_link, id = channel.id, "channel resolved");
        Ok(channel)
    }

    async fn history_page(
        &self,
        channel: &SourceChannel,
        before_id: Option<i64>,
        limit: usize,
    ) -> Result<Vec<SourceMessage>, SourceError> {
        let chat = match self.cached_chat(&channel.channel_link) {
            Some(chat) => chat,
            None => {
                self.resolve(&channel.channel_link).await?;
                self.cached_chat(&channel.channel_link)
                    .ok_or_else(|| SourceError::UnknownChannel(channel.channel_link.clone()))?
            }
        };

        let mut iter = self.client.iter_messages(&chat).limit(limit);
        if let Some(id) = before_id {
            iter = iter.offset_id(id as i32);
        }

        let mut out = Vec::with_capacity(limit);
        while let Some(msg) = iter.next().await.map_err(map_invocation)? {
            out.push(convert_message(&msg));
            if out.len() >= limit {
                break;
            }
        }
        Ok(out)
    }

    async fn next_event(&self) -> Result<SourceEvent, SourceError> {
        let update = self.client.next_update().await.map_err(|e| SourceError::Transient(e.to_string()))?;
        let event = match update {
            Update::NewMessage(msg) if !msg.outgoing() => {
                let chat = msg.chat();
                SourceEvent::New {
                    channel: convert_chat(&chat, "tg:unknown"),
                    message: convert_message(&msg),
                }
            }
            Update::MessageEdited(msg) => {
                let chat = msg.chat();
                SourceEvent::Edited {
                    channel: convert_chat(&chat, "tg:unknown"),
                    message: convert_message(&msg),
                }
            }
            Update::MessageDeleted(del) => SourceEvent::Deleted {
                channel_id: del.channel_id(),
                message_ids: del.messages().iter().map(|id| *id as i64).collect(),
            },
            _ => SourceEvent::Ignored,
        };
        Ok(event)
    }
}
