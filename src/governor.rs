//! The exchange: one inbound message to one reply
//!
//! Persists the user turn, trims history to the model window, paces the
//! remote call through the limiter, reconciles actual token usage and
//! records the reply and the ledger. Callers get either the reply text or
//! [`FAILURE_MESSAGE`]; committed side effects are kept on failure, so an
//! unanswered user turn stays in history.

use crate::config::Config;
use crate::context::{ContextTrimmer, EncoderRegistry};
use crate::conversation::{
    ConversationId, ConversationManager, ConversationStore, RequestId, Role, UserId,
};
use crate::error::{GovernorError, Result};
use crate::limiter::{Limiter, Volume, IMAGES, REQUESTS, TOKENS};
use crate::metrics::Metrics;
use crate::remote::{
    ChatMessage, CompletionRequest, CompletionResponse, ImageResponse, OpenAiClient,
    RemoteCompletionApi, RemoteError,
};
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Text returned to the caller whenever an exchange fails
pub const FAILURE_MESSAGE: &str = "Error making request";

/// Model parameters for exchanges
#[derive(Debug, Clone)]
pub struct GovernorSettings {
    pub model: String,
    pub temperature: f32,
    /// Input ceiling; the model's known context size when unset
    pub max_context_tokens: Option<usize>,
    /// Tokens added to the prompt estimate for the expected reply
    pub completion_reserve_tokens: u64,
}

impl GovernorSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            model: config.remote.model.clone(),
            temperature: config.remote.temperature,
            max_context_tokens: config.context.max_context_tokens,
            completion_reserve_tokens: config.context.completion_reserve_tokens,
        }
    }
}

/// Result of an image request as shown to the user
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageOutcome {
    pub text: String,
    pub url: Option<String>,
}

/// Governs exchanges between users and the remote API
pub struct RequestGovernor {
    conversations: ConversationManager,
    store: Arc<dyn ConversationStore>,
    limiter: Arc<Limiter>,
    remote: Arc<dyn RemoteCompletionApi>,
    encoders: Arc<EncoderRegistry>,
    metrics: Arc<Metrics>,
    trimmer: ContextTrimmer,
    settings: GovernorSettings,
}

impl RequestGovernor {
    pub fn new(
        conversations: ConversationManager,
        limiter: Arc<Limiter>,
        remote: Arc<dyn RemoteCompletionApi>,
        encoders: Arc<EncoderRegistry>,
        metrics: Arc<Metrics>,
        settings: GovernorSettings,
    ) -> Self {
        let trimmer = ContextTrimmer::for_model(&settings.model, settings.max_context_tokens);
        info!(
            "Governor ready for model {} with context budget {}",
            settings.model,
            trimmer.budget()
        );
        Self {
            store: conversations.store().clone(),
            conversations,
            limiter,
            remote,
            encoders,
            metrics,
            trimmer,
            settings,
        }
    }

    /// Build every collaborator up front from configuration
    pub fn from_config(config: &Config, store: Arc<dyn ConversationStore>) -> Result<Self> {
        for resource in [REQUESTS, TOKENS, IMAGES] {
            if !config.limiter.limits.contains_key(resource) {
                return Err(GovernorError::Configuration(format!(
                    "limiter has no limit for {}",
                    resource
                )));
            }
        }

        let metrics = Arc::new(
            Metrics::new().map_err(|e| GovernorError::Configuration(e.to_string()))?,
        );
        let limiter = Limiter::from_config(&config.limiter)?.with_metrics(metrics.clone());
        let remote = OpenAiClient::new(&config.remote)
            .map_err(|e| GovernorError::Configuration(e.to_string()))?;
        let encoders =
            EncoderRegistry::tiktoken().map_err(|e| GovernorError::Configuration(e.to_string()))?;
        let conversations =
            ConversationManager::new(store).with_list_limit(config.conversations.list_limit);

        Ok(Self::new(
            conversations,
            Arc::new(limiter),
            Arc::new(remote),
            Arc::new(encoders),
            metrics,
            GovernorSettings::from_config(config),
        ))
    }

    pub fn conversations(&self) -> &ConversationManager {
        &self.conversations
    }

    pub fn limiter(&self) -> &Arc<Limiter> {
        &self.limiter
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Run one exchange; failures are logged and become [`FAILURE_MESSAGE`]
    pub async fn exchange(&self, user_id: UserId, text: &str) -> String {
        match self.try_exchange(user_id, text).await {
            Ok(reply) => {
                self.metrics.record_exchange("chat", None);
                reply
            }
            Err(e) => {
                self.report_failure("chat", user_id, &e);
                FAILURE_MESSAGE.to_string()
            }
        }
    }

    /// Run one exchange, returning the typed error on failure
    pub async fn try_exchange(&self, user_id: UserId, text: &str) -> Result<String> {
        let conversation_id = self
            .conversations
            .send_message(user_id, Role::User, text)
            .await?;

        let (messages, prompt_estimate) = self.prepare_history(conversation_id).await?;
        let estimated_tokens =
            (prompt_estimate as u64).saturating_add(self.settings.completion_reserve_tokens);
        let volume = Volume::completion(estimated_tokens);

        let request = CompletionRequest {
            model: self.settings.model.clone(),
            messages,
            temperature: self.settings.temperature,
        };
        debug!(
            "Conversation {}: sending {} messages, volume {}",
            conversation_id,
            request.messages.len(),
            volume
        );

        let (request_id, response) = self
            .limiter
            .run(&volume, || self.dispatch_completion(user_id, &volume, &request))
            .await?;

        let actual_tokens = response.total_tokens();
        if actual_tokens > estimated_tokens {
            let excess = actual_tokens - estimated_tokens;
            match self.limiter.alloc(&Volume::new().with(TOKENS, excess)) {
                Ok(_) => {
                    self.metrics.record_reconciliation(excess);
                    debug!(
                        "Charged {} tokens above the estimate of {}",
                        excess, estimated_tokens
                    );
                }
                // The reply is still good; only the usage report is unusable.
                Err(e) => warn!(
                    "Could not charge {} reported tokens to the limiter: {}",
                    excess, e
                ),
            }
        }

        self.store
            .store_response(
                request_id,
                Utc::now(),
                response.prompt_tokens,
                response.completion_tokens,
            )
            .await?;
        self.metrics
            .record_usage(response.prompt_tokens, response.completion_tokens);

        self.store
            .append_message(conversation_id, Role::Assistant, &response.content)
            .await?;

        Ok(response.content)
    }

    /// Generate an image; failures become [`FAILURE_MESSAGE`]
    pub async fn generate_image(&self, user_id: UserId, prompt: &str) -> ImageOutcome {
        match self.try_generate_image(user_id, prompt).await {
            Ok(image) => {
                self.metrics.record_exchange("image", None);
                ImageOutcome {
                    text: image.revised_prompt,
                    url: image.url,
                }
            }
            Err(e) => {
                self.report_failure("image", user_id, &e);
                ImageOutcome {
                    text: FAILURE_MESSAGE.to_string(),
                    url: None,
                }
            }
        }
    }

    pub async fn try_generate_image(&self, user_id: UserId, prompt: &str) -> Result<ImageResponse> {
        let volume = Volume::new().with(IMAGES, 1);
        let (request_id, image) = self
            .limiter
            .run(&volume, || self.dispatch_image(user_id, &volume, prompt))
            .await?;

        self.store
            .store_response(request_id, Utc::now(), 0, 0)
            .await?;
        Ok(image)
    }

    /// Load history, evict the overflowing prefix from the store and return
    /// the rest with its estimated prompt cost
    async fn prepare_history(
        &self,
        conversation_id: ConversationId,
    ) -> Result<(Vec<ChatMessage>, usize)> {
        let history = self.conversations.history(conversation_id).await?;
        let encoder = self.encoders.for_model(&self.settings.model);
        let plan = self.trimmer.plan(&history, encoder.as_ref());

        if !plan.is_noop() {
            self.store.delete_messages(&plan.evict).await?;
            info!(
                "Conversation {}: evicted {} oldest messages",
                conversation_id,
                plan.evict.len()
            );
        }
        self.metrics.record_trim(plan.evict.len(), plan.kept_tokens);

        let messages = history
            .into_iter()
            .skip(plan.evict.len())
            .map(|m| ChatMessage {
                role: m.role,
                content: m.content,
            })
            .collect();

        Ok((messages, plan.kept_tokens))
    }

    // One call attempt: ledger entry first, then the remote call.
    async fn dispatch_completion(
        &self,
        user_id: UserId,
        volume: &Volume,
        request: &CompletionRequest,
    ) -> Result<(RequestId, CompletionResponse)> {
        let request_id = self.store.store_request(user_id, Utc::now(), volume).await?;
        let response = self.remote.complete(request).await?;
        Ok((request_id, response))
    }

    async fn dispatch_image(
        &self,
        user_id: UserId,
        volume: &Volume,
        prompt: &str,
    ) -> Result<(RequestId, ImageResponse)> {
        let request_id = self.store.store_request(user_id, Utc::now(), volume).await?;
        let image = self.remote.generate_image(prompt).await?;
        Ok((request_id, image))
    }

    fn report_failure(&self, operation: &str, user_id: UserId, e: &GovernorError) {
        match e {
            GovernorError::Remote(RemoteError::BadInput(detail)) => {
                warn!("{} for user {} rejected by remote API: {}", operation, user_id, detail)
            }
            GovernorError::Remote(remote) => {
                error!("{} for user {} failed remotely: {}", operation, user_id, remote)
            }
            GovernorError::Store(store) => {
                error!("{} for user {} failed in storage: {}", operation, user_id, store)
            }
            GovernorError::Limiter(limiter) => {
                error!("{} for user {} could not be admitted: {}", operation, user_id, limiter)
            }
            GovernorError::Configuration(detail) => {
                error!("{} for user {} misconfigured: {}", operation, user_id, detail)
            }
        }
        self.metrics.record_exchange(operation, Some(e.kind()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::WordEncoder;
    use crate::conversation::{InMemoryConversationStore, StoredMessage};
    use async_trait::async_trait;
    use std::collections::{HashMap, VecDeque};
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct ScriptedRemote {
        replies: Mutex<VecDeque<std::result::Result<CompletionResponse, RemoteError>>>,
        images: Mutex<VecDeque<std::result::Result<ImageResponse, RemoteError>>>,
        requests: Mutex<Vec<CompletionRequest>>,
    }

    impl ScriptedRemote {
        fn reply(self, result: std::result::Result<CompletionResponse, RemoteError>) -> Self {
            self.replies.lock().unwrap().push_back(result);
            self
        }

        fn image(self, result: std::result::Result<ImageResponse, RemoteError>) -> Self {
            self.images.lock().unwrap().push_back(result);
            self
        }

        fn seen(&self) -> Vec<CompletionRequest> {
            self.requests.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl RemoteCompletionApi for ScriptedRemote {
        async fn complete(
            &self,
            request: &CompletionRequest,
        ) -> std::result::Result<CompletionResponse, RemoteError> {
            self.requests.lock().unwrap().push(request.clone());
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(RemoteError::Other("script exhausted".to_string())))
        }

        async fn generate_image(
            &self,
            _prompt: &str,
        ) -> std::result::Result<ImageResponse, RemoteError> {
            self.images
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(RemoteError::Other("script exhausted".to_string())))
        }
    }

    fn answer(content: &str, prompt_tokens: u64, completion_tokens: u64) -> CompletionResponse {
        CompletionResponse {
            content: content.to_string(),
            prompt_tokens,
            completion_tokens,
        }
    }

    struct Harness {
        governor: RequestGovernor,
        store: Arc<InMemoryConversationStore>,
        remote: Arc<ScriptedRemote>,
        user: UserId,
    }

    async fn harness(
        remote: ScriptedRemote,
        limits: &[(&str, u64)],
        max_context_tokens: usize,
    ) -> Harness {
        let store = Arc::new(InMemoryConversationStore::new());
        let user = store.add_user(1).await.unwrap();
        let remote = Arc::new(remote);
        let limits: HashMap<String, u64> = limits.iter().map(|(k, v)| (k.to_string(), *v)).collect();
        let limiter = Limiter::new(&limits, Duration::from_secs(60)).unwrap();

        let governor = RequestGovernor::new(
            ConversationManager::new(store.clone()),
            Arc::new(limiter),
            remote.clone(),
            Arc::new(EncoderRegistry::uniform(Arc::new(WordEncoder))),
            Arc::new(Metrics::new().unwrap()),
            GovernorSettings {
                model: "test-model".to_string(),
                temperature: 0.3,
                max_context_tokens: Some(max_context_tokens),
                completion_reserve_tokens: 0,
            },
        );

        Harness {
            governor,
            store,
            remote,
            user,
        }
    }

    const GENEROUS: &[(&str, u64)] = &[(REQUESTS, 600), (TOKENS, 1_000_000), (IMAGES, 60)];

    fn contents(messages: &[StoredMessage]) -> Vec<(Role, &str)> {
        messages.iter().map(|m| (m.role, m.content.as_str())).collect()
    }

    #[tokio::test]
    async fn test_first_exchange_creates_conversation() {
        let h = harness(ScriptedRemote::default().reply(Ok(answer("Hi!", 9, 3))), GENEROUS, 1000).await;

        let reply = h.governor.exchange(h.user, "Hello").await;
        assert_eq!(reply, "Hi!");

        let listing = h.governor.conversations().list(h.user).await.unwrap();
        assert_eq!(listing.len(), 1);
        assert_eq!(listing[0].title, "Hello");

        let history = h.store.get_messages(listing[0].id).await.unwrap();
        assert_eq!(
            contents(&history),
            vec![(Role::User, "Hello"), (Role::Assistant, "Hi!")]
        );

        let seen = h.remote.seen();
        assert_eq!(seen.len(), 1);
        assert_eq!(
            seen[0].messages,
            vec![ChatMessage {
                role: Role::User,
                content: "Hello".to_string()
            }]
        );

        let ledger = h.store.ledger().unwrap();
        assert_eq!(ledger.len(), 1);
        // 2 priming + 4 envelope + 1 role + 1 word
        assert_eq!(ledger[0].estimated, Volume::completion(8));
        assert_eq!(ledger[0].prompt_tokens, Some(9));
        assert_eq!(ledger[0].completion_tokens, Some(3));
    }

    #[tokio::test]
    async fn test_failure_keeps_user_turn() {
        let h = harness(
            ScriptedRemote::default().reply(Err(RemoteError::BadInput("nope".to_string()))),
            GENEROUS,
            1000,
        )
        .await;

        let reply = h.governor.exchange(h.user, "Hello").await;
        assert_eq!(reply, FAILURE_MESSAGE);

        let conversation = h.governor.conversations().list(h.user).await.unwrap()[0].id;
        let history = h.store.get_messages(conversation).await.unwrap();
        assert_eq!(contents(&history), vec![(Role::User, "Hello")]);

        let ledger = h.store.ledger().unwrap();
        assert_eq!(ledger.len(), 1);
        assert!(ledger[0].responded_at.is_none());
        assert_eq!(h.remote.seen().len(), 1);

        let metrics = h.governor.metrics();
        assert_eq!(metrics.errors.with_label_values(&["bad_input"]).get(), 1.0);
    }

    #[tokio::test]
    async fn test_try_exchange_exposes_error_kind() {
        let h = harness(
            ScriptedRemote::default().reply(Err(RemoteError::Other("boom".to_string()))),
            GENEROUS,
            1000,
        )
        .await;

        let err = h.governor.try_exchange(h.user, "Hello").await.unwrap_err();
        assert!(matches!(err, GovernorError::Remote(RemoteError::Other(_))));
    }

    #[tokio::test]
    async fn test_unknown_user_fails_opaquely() {
        let h = harness(ScriptedRemote::default(), GENEROUS, 1000).await;
        let reply = h.governor.exchange(UserId(404), "Hello").await;
        assert_eq!(reply, FAILURE_MESSAGE);
        assert!(h.remote.seen().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_is_retried() {
        let h = harness(
            ScriptedRemote::default()
                .reply(Err(RemoteError::Transient("429".to_string())))
                .reply(Ok(answer("Second time lucky", 10, 4))),
            GENEROUS,
            1000,
        )
        .await;

        let reply = h.governor.exchange(h.user, "Hello").await;
        assert_eq!(reply, "Second time lucky");
        assert_eq!(h.remote.seen().len(), 2);

        let ledger = h.store.ledger().unwrap();
        assert_eq!(ledger.len(), 2);
        assert!(ledger[0].responded_at.is_none());
        assert!(ledger[1].responded_at.is_some());
    }

    #[tokio::test]
    async fn test_history_is_trimmed_before_sending() {
        // usable budget 45 - 2 priming = 43
        let h = harness(ScriptedRemote::default().reply(Ok(answer("ok", 1, 1))), GENEROUS, 50).await;
        let long = vec!["w"; 30].join(" ");

        let conversation = h
            .governor
            .conversations()
            .send_message(h.user, Role::User, &long)
            .await
            .unwrap();
        h.store
            .append_message(conversation, Role::Assistant, &long)
            .await
            .unwrap();

        // "hi" costs 6, the long reply 35, the long question would overflow
        let reply = h.governor.exchange(h.user, "hi").await;
        assert_eq!(reply, "ok");

        let sent = &h.remote.seen()[0].messages;
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].role, Role::Assistant);
        assert_eq!(sent[1].content, "hi");

        let history = h.store.get_messages(conversation).await.unwrap();
        assert_eq!(
            contents(&history),
            vec![(Role::Assistant, long.as_str()), (Role::User, "hi"), (Role::Assistant, "ok")]
        );
    }

    #[tokio::test]
    async fn test_oversized_message_sends_empty_history() {
        let h = harness(ScriptedRemote::default().reply(Ok(answer("?", 1, 1))), GENEROUS, 20).await;
        let huge = vec!["w"; 50].join(" ");

        let reply = h.governor.exchange(h.user, &huge).await;
        assert_eq!(reply, "?");
        assert!(h.remote.seen()[0].messages.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_excess_usage_is_charged_to_limiter() {
        // 0.1 s per token, 1 s per request
        let h = harness(
            ScriptedRemote::default().reply(Ok(answer("long answer", 100, 100))),
            &[(REQUESTS, 60), (TOKENS, 600)],
            1000,
        )
        .await;
        let start = tokio::time::Instant::now();

        h.governor.exchange(h.user, "Hello").await;

        // reservation of 1 s, then 200 - 8 = 192 excess tokens = 19.2 s
        let next = h.governor.limiter().next_available().duration_since(start);
        assert!(next >= Duration::from_secs(20));
        assert_eq!(h.governor.metrics().reconciled_tokens.get(), 192.0);
    }

    #[tokio::test]
    async fn test_absurd_usage_report_keeps_reply() {
        let h = harness(
            ScriptedRemote::default().reply(Ok(answer("fine", u64::MAX, u64::MAX))),
            &[(REQUESTS, 600), (TOKENS, 1), (IMAGES, 60)],
            1000,
        )
        .await;
        let before = h.governor.limiter().next_available();

        assert_eq!(h.governor.try_exchange(h.user, "Hello").await.unwrap(), "fine");
        assert_eq!(h.governor.metrics().reconciled_tokens.get(), 0.0);
        // only the admission reservation moved the clock
        assert!(h.governor.limiter().next_available() > before);

        let ledger = h.store.ledger().unwrap();
        assert_eq!(ledger[0].prompt_tokens, Some(u64::MAX));
    }

    #[tokio::test]
    async fn test_generate_image() {
        let h = harness(
            ScriptedRemote::default().image(Ok(ImageResponse {
                revised_prompt: "A tabby cat".to_string(),
                url: Some("https://img.example/cat.png".to_string()),
            })),
            GENEROUS,
            1000,
        )
        .await;

        let outcome = h.governor.generate_image(h.user, "a cat").await;
        assert_eq!(outcome.text, "A tabby cat");
        assert_eq!(outcome.url.as_deref(), Some("https://img.example/cat.png"));

        let ledger = h.store.ledger().unwrap();
        assert_eq!(ledger[0].estimated, Volume::new().with(IMAGES, 1));
        assert!(ledger[0].responded_at.is_some());
    }

    #[tokio::test]
    async fn test_generate_image_failure() {
        let h = harness(ScriptedRemote::default(), GENEROUS, 1000).await;
        let outcome = h.governor.generate_image(h.user, "a cat").await;
        assert_eq!(outcome.text, FAILURE_MESSAGE);
        assert!(outcome.url.is_none());
    }

    #[tokio::test]
    async fn test_from_config_rejects_missing_limit() {
        let mut config = Config::default();
        config.limiter.limits.remove(IMAGES);
        let store: Arc<dyn ConversationStore> = Arc::new(InMemoryConversationStore::new());

        let result = RequestGovernor::from_config(&config, store);
        assert!(matches!(result, Err(GovernorError::Configuration(_))));
    }

    #[tokio::test]
    async fn test_partial_limit_override_still_exchanges() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/chat/completions")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"choices": [{"message": {"content": "Hi!"}}],
                    "usage": {"prompt_tokens": 8, "completion_tokens": 2}}"#,
            )
            .create_async()
            .await;

        let config = Config::from_toml_str(&format!(
            "[remote]\napi_url = \"{}\"\n[limiter]\nlimits = {{ requests = 5 }}",
            server.url()
        ))
        .unwrap();
        let store = Arc::new(InMemoryConversationStore::new());
        let user = store.add_user(1).await.unwrap();
        let governor = RequestGovernor::from_config(&config, store).unwrap();

        assert_eq!(governor.try_exchange(user, "Hello").await.unwrap(), "Hi!");
    }

    #[tokio::test]
    async fn test_from_config() {
        let store: Arc<dyn ConversationStore> = Arc::new(InMemoryConversationStore::new());
        let governor = RequestGovernor::from_config(&Config::default(), store);
        assert!(governor.is_ok());
    }
}
