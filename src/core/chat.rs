// src/core/chat.rs — Chat orchestration: load/create, append, call, price, persist

use futures::StreamExt;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::core::credentials::Credentials;
use crate::core::{pricing, tokens};
use crate::infra::errors::ChatHubError;
use crate::provider::{ChatRequest, Message, ModelProvider, Provider, ProviderTable, TokenUsage};
use crate::store::{ChatStore, Conversation, ConversationUpdate, NewMessage};

pub const DEFAULT_PROVIDER: &str = "openai";
pub const DEFAULT_MODEL: &str = "gpt-4o";
pub const NEW_CHAT_TITLE: &str = "New Chat";
const TITLE_MAX_CHARS: usize = 50;

/// First 50 characters of the opening message, with `...` when cut.
pub fn derive_title(message: &str) -> String {
    let mut chars = message.chars();
    let head: String = chars.by_ref().take(TITLE_MAX_CHARS).collect();
    if chars.next().is_some() {
        format!("{head}...")
    } else {
        head
    }
}

/// A chat turn as received from the client.
#[derive(Debug, Clone)]
pub struct ChatInput {
    pub message: String,
    pub provider: String,
    pub model: String,
    pub conversation_id: Option<String>,
    pub api_key: Option<String>,
}

/// Everything needed to call the vendor once the user turn is stored.
pub struct PreparedChat {
    pub user_id: String,
    pub conversation_id: String,
    pub provider: Provider,
    pub model: String,
    api_key: String,
    adapter: Arc<dyn ModelProvider>,
    request: ChatRequest,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct UsageReport {
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub total_tokens: u32,
    pub cost: f64,
}

impl UsageReport {
    fn new(usage: TokenUsage, cost: f64) -> Self {
        Self {
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
            total_tokens: usage.total(),
            cost: pricing::round_cost(cost),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChatReply {
    pub content: String,
    pub usage: UsageReport,
}

/// Events of a streamed reply, in wire order: one `Start`, any number of
/// `Content`, then exactly one of `Done` or `Error`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StreamEvent {
    Start { conversation_id: String },
    Content { content: String },
    Done { usage: UsageReport },
    Error { error: String },
}

#[derive(Clone)]
pub struct ChatService {
    store: Arc<dyn ChatStore>,
    credentials: Credentials,
    providers: ProviderTable,
}

impl ChatService {
    pub fn new(store: Arc<dyn ChatStore>, credentials: Credentials, providers: ProviderTable) -> Self {
        Self {
            store,
            credentials,
            providers,
        }
    }

    pub fn providers(&self) -> &ProviderTable {
        &self.providers
    }

    /// Validate, resolve the key, load or create the conversation, store the
    /// user turn and assemble the full history.
    pub async fn prepare(&self, user_id: &str, input: ChatInput) -> Result<PreparedChat, ChatHubError> {
        if input.message.trim().is_empty() {
            return Err(ChatHubError::Validation("Message is required".into()));
        }
        let provider: Provider = input.provider.parse()?;
        let adapter = self.providers.get(provider)?;

        let api_key = self
            .credentials
            .resolve(user_id, provider, input.api_key.as_deref())
            .await?
            .ok_or_else(|| ChatHubError::MissingApiKey {
                provider_name: provider.display_name().to_string(),
            })?;

        let conversation = self
            .load_or_create(user_id, &input, provider)
            .await?;

        self.store
            .append_message(&conversation.id, NewMessage::user(&input.message))
            .await?;

        let history = self.store.get_messages(&conversation.id).await?;
        let messages = history
            .into_iter()
            .filter(|m| !m.is_error)
            .map(|m| Message {
                role: m.role,
                content: m.content,
            })
            .collect();

        Ok(PreparedChat {
            user_id: user_id.to_string(),
            conversation_id: conversation.id,
            provider,
            model: input.model.clone(),
            api_key,
            adapter,
            request: ChatRequest {
                model: input.model,
                messages,
                max_tokens: None,
            },
        })
    }

    async fn load_or_create(
        &self,
        user_id: &str,
        input: &ChatInput,
        provider: Provider,
    ) -> Result<Conversation, ChatHubError> {
        let Some(id) = input.conversation_id.as_deref().filter(|id| !id.is_empty()) else {
            let title = derive_title(&input.message);
            let conv = self
                .store
                .create_conversation(user_id, &title, provider.as_str(), &input.model)
                .await?;
            tracing::info!("Created conversation {} for user {}", conv.id, user_id);
            return Ok(conv);
        };

        let conv = self
            .store
            .get_conversation(id)
            .await?
            .filter(|c| c.user_id == user_id)
            .ok_or_else(|| ChatHubError::NotFound("Conversation".into()))?;

        let mut update = ConversationUpdate::default();
        if conv.provider != provider.as_str() {
            update.provider = Some(provider.as_str().to_string());
        }
        if conv.model != input.model {
            update.model = Some(input.model.clone());
        }
        if conv.total_messages == 0 {
            update.title = Some(derive_title(&input.message));
        }
        if update == ConversationUpdate::default() {
            return Ok(conv);
        }

        self.store
            .update_conversation(&conv.id, update)
            .await?
            .ok_or_else(|| ChatHubError::NotFound("Conversation".into()))
    }

    /// Buffered turn. On vendor failure the error is persisted as an
    /// error-flagged assistant message and returned.
    pub async fn complete(&self, chat: PreparedChat) -> Result<ChatReply, ChatHubError> {
        let provider = chat.provider.as_str();
        match chat.adapter.chat(&chat.api_key, chat.request).await {
            Ok(response) => {
                let cost = pricing::cost(
                    chat.provider,
                    &chat.model,
                    response.usage.input_tokens,
                    response.usage.output_tokens,
                );
                self.store
                    .append_message(
                        &chat.conversation_id,
                        NewMessage::assistant(&response.content, provider, &chat.model, response.usage, cost),
                    )
                    .await?;
                self.credentials.touch(&chat.user_id, chat.provider).await;

                Ok(ChatReply {
                    content: response.content,
                    usage: UsageReport::new(response.usage, cost),
                })
            }
            Err(e) => {
                let text = e.client_message();
                tracing::error!("{} call failed for conversation {}: {}", provider, chat.conversation_id, text);
                self.store
                    .append_message(
                        &chat.conversation_id,
                        NewMessage::error(format!("Error: {text}"), provider, &chat.model, &text),
                    )
                    .await?;
                Err(e)
            }
        }
    }

    /// Streamed turn. A spawned producer drives the vendor stream, forwards
    /// events, and persists what it forwarded even if the receiver is gone.
    pub fn stream(&self, chat: PreparedChat) -> mpsc::Receiver<StreamEvent> {
        let (tx, rx) = mpsc::channel(64);
        let service = self.clone();
        tokio::spawn(async move {
            service.produce(chat, tx).await;
        });
        rx
    }

    async fn produce(&self, chat: PreparedChat, tx: mpsc::Sender<StreamEvent>) {
        // Send failures mean the client left; keep going so the reply is stored.
        let _ = tx
            .send(StreamEvent::Start {
                conversation_id: chat.conversation_id.clone(),
            })
            .await;

        let mut text = String::new();
        let mut reported = TokenUsage::default();
        let mut failure: Option<ChatHubError> = None;

        match chat.adapter.chat_stream(&chat.api_key, chat.request.clone()).await {
            Ok(mut stream) => {
                while let Some(item) = stream.next().await {
                    match item {
                        Ok(chunk) => {
                            if let Some(u) = &chunk.usage {
                                reported.merge(u);
                            }
                            if !chunk.delta.is_empty() {
                                text.push_str(&chunk.delta);
                                let _ = tx.send(StreamEvent::Content { content: chunk.delta }).await;
                            }
                        }
                        Err(e) => {
                            failure = Some(e);
                            break;
                        }
                    }
                }
            }
            Err(e) => failure = Some(e),
        }

        let provider = chat.provider.as_str();
        let event = match failure {
            None => {
                let usage = TokenUsage {
                    input_tokens: match reported.input_tokens {
                        0 => tokens::estimate_input(&chat.request.messages),
                        n => n,
                    },
                    output_tokens: match reported.output_tokens {
                        0 => tokens::estimate_tokens(&text),
                        n => n,
                    },
                };
                let cost = pricing::cost(chat.provider, &chat.model, usage.input_tokens, usage.output_tokens);
                let msg = NewMessage::assistant(&text, provider, &chat.model, usage, cost);
                match self.store.append_message(&chat.conversation_id, msg).await {
                    Ok(_) => {
                        self.credentials.touch(&chat.user_id, chat.provider).await;
                        StreamEvent::Done {
                            usage: UsageReport::new(usage, cost),
                        }
                    }
                    Err(e) => {
                        tracing::error!("Failed to store streamed reply for {}: {}", chat.conversation_id, e);
                        StreamEvent::Error {
                            error: "Failed to save response".into(),
                        }
                    }
                }
            }
            Some(e) => {
                let error = e.client_message();
                tracing::error!("{} stream failed for conversation {}: {}", provider, chat.conversation_id, error);
                let content = if text.is_empty() {
                    format!("Error: {error}")
                } else {
                    text
                };
                let msg = NewMessage::error(content, provider, &chat.model, &error);
                if let Err(e) = self.store.append_message(&chat.conversation_id, msg).await {
                    tracing::error!("Failed to store stream error for {}: {}", chat.conversation_id, e);
                }
                StreamEvent::Error { error }
            }
        };

        let _ = tx.send(event).await;
    }
}
