//! # Storage Interfaces
//!
//! The core does not own durable state. Conversations, users, and artifact
//! extraction are external collaborators expressed as traits; the in-memory
//! implementations here back tests and single-node development deployments.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::error::GatewayError;

/// One persisted conversation turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredMessage {
    pub message_id: String,
    pub role: String,
    pub content: String,
    pub token_count: u64,
    pub model_used: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// New message to persist.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub conversation_id: String,
    pub message_id: String,
    pub user_id: String,
    pub role: String,
    pub content: String,
    pub token_count: u64,
    pub model_used: Option<String>,
    pub generation_time_seconds: Option<f64>,
}

/// Stored user preferences; `None` fields mean "system default".
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserPreferences {
    pub preferred_model: Option<String>,
    pub temperature: Option<f32>,
    /// None = auto, Some(true/false) = forced on/off.
    pub thinking_enabled: Option<bool>,
    pub base_prompt: Option<String>,
}

/// Token accounting for one user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserTokens {
    pub tokens_remaining: i64,
    pub tokens_used: i64,
}

#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Conversation context in chronological order.
    async fn context(
        &self,
        conversation_id: &str,
        user_id: &str,
    ) -> Result<Vec<StoredMessage>, GatewayError>;

    async fn add_message(&self, message: NewMessage) -> Result<(), GatewayError>;

    /// Delete every message of a conversation; returns the deleted count.
    async fn delete_conversation(&self, conversation_id: &str) -> Result<usize, GatewayError>;
}

#[async_trait]
pub trait UserStore: Send + Sync {
    async fn preferences(&self, user_id: &str) -> Result<Option<UserPreferences>, GatewayError>;

    async fn tokens(&self, user_id: &str) -> Result<Option<UserTokens>, GatewayError>;

    /// Create the user when missing; existing users are untouched.
    async fn ensure_user(&self, user_id: &str, token_budget: i64) -> Result<(), GatewayError>;

    async fn set_preferred_model(
        &self,
        user_id: &str,
        model: Option<String>,
    ) -> Result<(), GatewayError>;

    async fn set_temperature(
        &self,
        user_id: &str,
        temperature: Option<f32>,
    ) -> Result<(), GatewayError>;

    async fn set_thinking(
        &self,
        user_id: &str,
        thinking: Option<bool>,
    ) -> Result<(), GatewayError>;

    async fn reset_preferences(&self, user_id: &str) -> Result<(), GatewayError>;

    async fn record_usage(&self, user_id: &str, tokens: u64) -> Result<(), GatewayError>;
}

/// A file-like output extracted from a response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    pub filename: String,
    pub content_type: Option<String>,
    pub content: String,
}

/// Secondary-model artifact extraction is glue outside the core; the trait
/// is the seam the orchestrator calls through.
#[async_trait]
pub trait ArtifactExtractor: Send + Sync {
    async fn extract(
        &self,
        user_message: &str,
        response: &str,
        extraction_model: Option<&str>,
    ) -> Result<Vec<Artifact>, GatewayError>;
}

/// Extractor that never produces artifacts.
#[derive(Debug, Default)]
pub struct NoopArtifactExtractor;

#[async_trait]
impl ArtifactExtractor for NoopArtifactExtractor {
    async fn extract(
        &self,
        _user_message: &str,
        _response: &str,
        _extraction_model: Option<&str>,
    ) -> Result<Vec<Artifact>, GatewayError> {
        Ok(Vec::new())
    }
}

/// In-memory conversation store keyed by conversation id.
#[derive(Debug, Default)]
pub struct MemoryConversationStore {
    conversations: DashMap<String, Vec<StoredMessage>>,
}

impl MemoryConversationStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ConversationStore for MemoryConversationStore {
    async fn context(
        &self,
        conversation_id: &str,
        _user_id: &str,
    ) -> Result<Vec<StoredMessage>, GatewayError> {
        Ok(self
            .conversations
            .get(conversation_id)
            .map(|messages| messages.clone())
            .unwrap_or_default())
    }

    async fn add_message(&self, message: NewMessage) -> Result<(), GatewayError> {
        self.conversations
            .entry(message.conversation_id.clone())
            .or_default()
            .push(StoredMessage {
                message_id: message.message_id,
                role: message.role,
                content: message.content,
                token_count: message.token_count,
                model_used: message.model_used,
                created_at: Utc::now(),
            });
        Ok(())
    }

    async fn delete_conversation(&self, conversation_id: &str) -> Result<usize, GatewayError> {
        Ok(self
            .conversations
            .remove(conversation_id)
            .map(|(_, messages)| messages.len())
            .unwrap_or(0))
    }
}

#[derive(Debug, Clone)]
struct MemoryUser {
    preferences: UserPreferences,
    tokens: UserTokens,
}

/// In-memory user store.
#[derive(Debug, Default)]
pub struct MemoryUserStore {
    users: DashMap<String, MemoryUser>,
}

impl MemoryUserStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_user<T>(
        &self,
        user_id: &str,
        apply: impl FnOnce(&mut MemoryUser) -> T,
    ) -> Result<T, GatewayError> {
        let mut user = self
            .users
            .get_mut(user_id)
            .ok_or_else(|| GatewayError::Internal(format!("unknown user {}", user_id)))?;
        Ok(apply(&mut user))
    }
}

#[async_trait]
impl UserStore for MemoryUserStore {
    async fn preferences(&self, user_id: &str) -> Result<Option<UserPreferences>, GatewayError> {
        Ok(self.users.get(user_id).map(|u| u.preferences.clone()))
    }

    async fn tokens(&self, user_id: &str) -> Result<Option<UserTokens>, GatewayError> {
        Ok(self.users.get(user_id).map(|u| u.tokens.clone()))
    }

    async fn ensure_user(&self, user_id: &str, token_budget: i64) -> Result<(), GatewayError> {
        self.users.entry(user_id.to_string()).or_insert(MemoryUser {
            preferences: UserPreferences::default(),
            tokens: UserTokens {
                tokens_remaining: token_budget,
                tokens_used: 0,
            },
        });
        Ok(())
    }

    async fn set_preferred_model(
        &self,
        user_id: &str,
        model: Option<String>,
    ) -> Result<(), GatewayError> {
        self.with_user(user_id, |u| u.preferences.preferred_model = model)
    }

    async fn set_temperature(
        &self,
        user_id: &str,
        temperature: Option<f32>,
    ) -> Result<(), GatewayError> {
        self.with_user(user_id, |u| u.preferences.temperature = temperature)
    }

    async fn set_thinking(
        &self,
        user_id: &str,
        thinking: Option<bool>,
    ) -> Result<(), GatewayError> {
        self.with_user(user_id, |u| u.preferences.thinking_enabled = thinking)
    }

    async fn reset_preferences(&self, user_id: &str) -> Result<(), GatewayError> {
        self.with_user(user_id, |u| u.preferences = UserPreferences::default())
    }

    async fn record_usage(&self, user_id: &str, tokens: u64) -> Result<(), GatewayError> {
        self.with_user(user_id, |u| {
            u.tokens.tokens_used += tokens as i64;
            u.tokens.tokens_remaining -= tokens as i64;
        })
    }
}

/// Character-based token estimation, matching the original's fallback
/// heuristic of roughly four characters per token.
pub fn estimate_tokens(text: &str) -> u64 {
    (text.chars().count() as u64).div_ceil(4)
}
