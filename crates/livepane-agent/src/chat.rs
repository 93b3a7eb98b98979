//! Project chat over a WebSocket.
//!
//! Assistant replies may carry a `fileTree`; those replace the
//! controller's tree. Everything else is kept as chat history.

use std::{collections::VecDeque, sync::Arc, time::Duration};

use futures_util::{SinkExt, StreamExt};
use livepane_process::FileTree;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, mpsc};
use tokio_tungstenite::tungstenite::{Message as WsMessage, client::IntoClientRequest};
use tracing::{Instrument, info_span};

use crate::controller::{Controller, NoticeLevel};

const AI_SENDER_ID: &str = "ai";
const PROJECT_MESSAGE: &str = "project-message";
const MAX_MESSAGES: usize = 500;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sender {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ProjectMessage {
    sender: Sender,
    message: String,
}

#[derive(Deserialize)]
struct InboundFrame {
    event: String,
    #[serde(default)]
    data: serde_json::Value,
}

#[derive(Serialize)]
struct OutboundFrame<'a> {
    event: &'a str,
    data: &'a ProjectMessage,
}

#[derive(Deserialize)]
struct AssistantReply {
    #[serde(default)]
    text: Option<String>,
    #[serde(rename = "fileTree", default)]
    file_tree: Option<FileTree>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Assistant,
    Plain,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatMessage {
    pub id: u64,
    pub sender: Sender,
    pub kind: MessageKind,
    pub text: String,
    pub at: String,
}

#[derive(Default)]
struct MessageLog {
    next_id: u64,
    messages: VecDeque<ChatMessage>,
}

impl MessageLog {
    fn push(&mut self, sender: Sender, kind: MessageKind, text: String) -> ChatMessage {
        self.next_id += 1;
        let msg = ChatMessage {
            id: self.next_id,
            sender,
            kind,
            text,
            at: chrono::Utc::now().to_rfc3339(),
        };
        self.messages.push_back(msg.clone());
        while self.messages.len() > MAX_MESSAGES {
            self.messages.pop_front();
        }
        msg
    }
}

pub struct ChatService {
    controller: Arc<Controller>,
    log: Mutex<MessageLog>,
    outbound: Option<mpsc::UnboundedSender<String>>,
}

impl ChatService {
    pub fn new(
        controller: Arc<Controller>,
        outbound: Option<mpsc::UnboundedSender<String>>,
    ) -> Self {
        Self {
            controller,
            log: Mutex::new(MessageLog::default()),
            outbound,
        }
    }

    pub async fn messages(&self, after: u64) -> Vec<ChatMessage> {
        let log = self.log.lock().await;
        log.messages
            .iter()
            .filter(|m| m.id > after)
            .cloned()
            .collect()
    }

    /// Handles one text frame from the chat server.
    pub async fn handle_frame(&self, text: &str) {
        let frame = match serde_json::from_str::<InboundFrame>(text) {
            Ok(f) => f,
            Err(e) => {
                tracing::debug!(error = %e, "ignoring malformed chat frame");
                return;
            }
        };
        if frame.event != PROJECT_MESSAGE {
            tracing::trace!(event = %frame.event, "ignoring chat event");
            return;
        }
        match serde_json::from_value::<ProjectMessage>(frame.data) {
            Ok(msg) => self.handle_project_message(msg).await,
            Err(e) => {
                tracing::debug!(error = %e, "ignoring project-message without sender/message")
            }
        }
    }

    async fn handle_project_message(&self, msg: ProjectMessage) {
        if msg.sender.id != AI_SENDER_ID {
            self.log
                .lock()
                .await
                .push(msg.sender, MessageKind::Plain, msg.message);
            return;
        }

        let reply = match serde_json::from_str::<AssistantReply>(&msg.message) {
            Ok(reply) => reply,
            Err(e) => {
                tracing::debug!(error = %e, "assistant message is not structured, showing as text");
                self.log
                    .lock()
                    .await
                    .push(msg.sender, MessageKind::Plain, msg.message);
                return;
            }
        };

        if let Some(tree) = reply.file_tree
            && let Err(e) = self.controller.replace_tree(tree).await
        {
            tracing::warn!(error = %e, "assistant file tree rejected");
            self.controller
                .notify(
                    NoticeLevel::Warning,
                    format!("The assistant sent a file tree that could not be used: {e}"),
                )
                .await;
        }

        let text = reply.text.unwrap_or_default();
        self.log
            .lock()
            .await
            .push(msg.sender, MessageKind::Assistant, text);
    }

    /// Records a user message and forwards it to the chat server.
    ///
    /// Returns whether it was handed to a live tunnel.
    pub async fn send(&self, sender: Sender, text: String) -> anyhow::Result<bool> {
        let frame = serde_json::to_string(&OutboundFrame {
            event: PROJECT_MESSAGE,
            data: &ProjectMessage {
                sender: sender.clone(),
                message: text.clone(),
            },
        })?;
        self.log.lock().await.push(sender, MessageKind::Plain, text);
        Ok(match &self.outbound {
            Some(tx) => tx.send(frame).is_ok(),
            None => false,
        })
    }
}

pub fn parse_ws_url(raw: &str, project_id: Option<&str>) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }

    let ws = if let Some(rest) = trimmed.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = trimmed.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        trimmed.to_string()
    };

    let mut url = Url::parse(&ws).ok()?;
    if let Some(id) = project_id {
        url.query_pairs_mut().append_pair("projectId", id);
    }
    Some(url.to_string())
}

/// Connects to the chat server and keeps reconnecting with backoff.
pub fn spawn_tunnel(
    chat: Arc<ChatService>,
    url: String,
    token: Option<String>,
    mut outbound: mpsc::UnboundedReceiver<String>,
) {
    tokio::spawn(async move {
        let span = info_span!("chat_tunnel", url = %url);
        async move {
            let mut backoff = Duration::from_millis(500);
            loop {
                match run_once(&url, token.as_deref(), &chat, &mut outbound).await {
                    Ok(()) => {
                        tracing::info!("chat tunnel closed");
                        backoff = Duration::from_millis(500);
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "chat tunnel disconnected");
                        backoff = (backoff * 2).min(Duration::from_secs(30));
                    }
                }
                tokio::time::sleep(backoff).await;
            }
        }
        .instrument(span)
        .await;
    });
}

async fn run_once(
    url: &str,
    token: Option<&str>,
    chat: &ChatService,
    outbound: &mut mpsc::UnboundedReceiver<String>,
) -> anyhow::Result<()> {
    let mut req = url.into_client_request()?;
    if let Some(tok) = token {
        let value = format!("Bearer {tok}");
        req.headers_mut().insert("Authorization", value.parse()?);
    }

    let (ws, _) = tokio_tungstenite::connect_async(req).await?;
    tracing::info!("chat tunnel connected");
    let (mut sink, mut stream) = ws.split();

    loop {
        tokio::select! {
            msg = stream.next() => {
                let Some(msg) = msg else { break };
                match msg? {
                    WsMessage::Text(text) => chat.handle_frame(&text).await,
                    WsMessage::Close(_) => break,
                    _ => {}
                }
            }
            frame = outbound.recv() => {
                let Some(frame) = frame else { break };
                sink.send(WsMessage::Text(frame.into())).await?;
            }
        }
    }

    Ok(())
}
