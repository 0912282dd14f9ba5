//! # RAG orchestrator
//!
//! [`RagService`] composes retrieval, prompt assembly, generation and conversation
//! memory behind two operations:
//!
//! - [`RagService::generate_response`] answers a question and never fails: every
//!   outcome is a [`GenerationResult`] carrying either a model answer or a canned,
//!   user-safe message.
//! - [`RagService::index_document`] strips front matter, chunks the body and writes
//!   the chunks as one batch, returning whether the batch fully succeeded.
//!
//! The service owns the vector-store handle. When the store can't be reached it
//! runs in *degraded mode*: retrieval is skipped and generation takes the
//! no-context path. Connection-shaped failures trigger a re-bootstrap through the
//! [`IndexConnector`]; while degraded, a request re-attempts the bootstrap at most
//! once per cooldown window.
//!
//! Each stage reports an explicit variant rather than an error, and the
//! orchestrator switches on it:
//!
//! ```text
//! retrieve  -> Hits | Empty | Failed
//! assemble  -> Prompt | NoRoom
//! generate  -> Answer | Fallback(NoContext | OverBudget | BackendError)
//! ```

use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::*;

use crate::api::{ChatMessage, LanguageModel};
use crate::chunker::Chunker;
use crate::config::{ConfigError, NoContextMode, RagConfig};
use crate::conversation::{ConversationMemory, Turn};
use crate::metadata::{self, DocumentMetadata};
use crate::prompt::{Assembly, PromptAssembler};
use crate::retry::RetryPolicy;
use crate::template::PromptTemplate;
use crate::tokens::TokenCounter;
use crate::vector_store::{ChunkRecord, ContextResult, IndexConnector, IndexError, VectorIndex};

pub const EMPTY_QUERY_MESSAGE: &str = "I cannot answer an empty question. Please provide a question.";

pub const NO_CONTEXT_MESSAGE: &str = "I apologize, but I couldn't find any relevant information \
in the knowledge base to answer your question. Could you please rephrase your question or ask \
about a different Lean Six Sigma topic?";

pub const OVER_BUDGET_MESSAGE: &str = "I apologize, but your question is too long for me to \
process together with the reference material. Please try a shorter or more specific question.";

pub const BACKEND_ERROR_MESSAGE: &str = "I apologize, but I encountered an error while \
generating a response. Please try again later.";

/// Per-message framing tokens added by chat formats.
const MESSAGE_OVERHEAD_TOKENS: usize = 4;

/// Errors that prevent the service from being built.
#[derive(Debug, Error)]
pub enum RagError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// The vector store is reachable but its collection could not be prepared.
    #[error("vector store initialisation failed: {0}")]
    Bootstrap(#[source] IndexError),
}

/// How a call to [`RagService::generate_response`] ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The model produced the response.
    Answered,
    EmptyQuery,
    /// Nothing retrieved and the service is set to apologise.
    NoContext,
    /// The prompt didn't fit the token budget even without context.
    OverBudget,
    /// The language model failed after retries.
    BackendError,
}

impl Outcome {
    /// Canned text for fallback outcomes.
    pub fn canned_message(self) -> Option<&'static str> {
        match self {
            Outcome::Answered => None,
            Outcome::EmptyQuery => Some(EMPTY_QUERY_MESSAGE),
            Outcome::NoContext => Some(NO_CONTEXT_MESSAGE),
            Outcome::OverBudget => Some(OVER_BUDGET_MESSAGE),
            Outcome::BackendError => Some(BACKEND_ERROR_MESSAGE),
        }
    }
}

/// Answer plus the contexts it was grounded on and the updated conversation.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationResult {
    pub response: String,
    /// Empty whenever the answer was not grounded on retrieved context.
    pub sources: Vec<ContextResult>,
    /// Conversation window to pass into the next call.
    pub history: Vec<Turn>,
    pub outcome: Outcome,
}

enum IndexState {
    Ready(Arc<dyn VectorIndex>),
    Degraded,
}

enum Retrieval {
    Hits(Vec<ContextResult>),
    Empty,
    Failed,
}

enum Generation {
    Answer {
        response: String,
        sources: Vec<ContextResult>,
    },
    Fallback(Outcome),
}

/// The retrieval-augmented generation pipeline.
///
/// Build one at startup and share it (`Arc<RagService>`) between request handlers.
pub struct RagService {
    connector: Arc<dyn IndexConnector>,
    llm: Arc<dyn LanguageModel>,
    state: RwLock<IndexState>,
    last_reconnect: Mutex<Option<Instant>>,
    reconnect_lock: tokio::sync::Mutex<()>,
    chunker: Chunker,
    assembler: PromptAssembler,
    template: PromptTemplate,
    policy: RetryPolicy,
    top_k: usize,
    memory_turns: usize,
    no_context: NoContextMode,
    reconnect_cooldown: Duration,
}

impl RagService {
    /// Validate `config`, connect to the vector store and bootstrap its collection.
    ///
    /// An unreachable store is not an error: the service starts degraded. A store
    /// that is reachable but can't be bootstrapped is [`RagError::Bootstrap`].
    pub async fn new(
        connector: Arc<dyn IndexConnector>,
        llm: Arc<dyn LanguageModel>,
        config: &RagConfig,
        template: PromptTemplate,
    ) -> Result<Self, RagError> {
        config.validate()?;
        let chunker = Chunker::new(config.chunking.chunk_size, config.chunking.chunk_overlap)
            .map_err(ConfigError::from)?;
        let assembler = PromptAssembler::new(
            TokenCounter::for_model(&config.llm.model),
            config.generation.max_prompt_tokens,
            template.instructions.clone(),
        );

        let (state, last_reconnect) = match connector.connect().await {
            Ok(index) => {
                info!("Vector store ready ({})", index.name());
                (IndexState::Ready(index), None)
            }
            Err(e @ IndexError::Bootstrap(_)) => return Err(RagError::Bootstrap(e)),
            Err(e) => {
                warn!("Vector store unavailable ({}); starting in degraded mode", e);
                (IndexState::Degraded, Some(Instant::now()))
            }
        };

        Ok(Self {
            connector,
            llm,
            state: RwLock::new(state),
            last_reconnect: Mutex::new(last_reconnect),
            reconnect_lock: tokio::sync::Mutex::new(()),
            chunker,
            assembler,
            template,
            policy: config.retry.policy(),
            top_k: config.generation.top_k,
            memory_turns: config.generation.memory_turns,
            no_context: config.generation.no_context,
            reconnect_cooldown: config.vector_index.reconnect_cooldown(),
        })
    }

    pub fn is_degraded(&self) -> bool {
        self.active_index().is_none()
    }

    /// Re-run connection and bootstrap now, ignoring the cooldown. Returns whether
    /// the store is usable afterwards; a no-op when already connected.
    pub async fn reconnect(&self) -> bool {
        self.try_reconnect().await.is_some()
    }

    /// Answer `query`, continuing the conversation in `history`.
    pub async fn generate_response(&self, query: &str, history: &[Turn]) -> GenerationResult {
        let mut memory = ConversationMemory::from_history(history, self.memory_turns);
        let query = query.trim();
        if query.is_empty() {
            warn!("Rejected empty query");
            return fallback(Outcome::EmptyQuery, memory);
        }

        let generation = match self.retrieve(query).await {
            Retrieval::Hits(contexts) => self.generate_grounded(query, contexts, &memory).await,
            Retrieval::Empty | Retrieval::Failed => {
                self.generate_without_context(query, &memory).await
            }
        };

        match generation {
            Generation::Answer { response, sources } => {
                info!("Generated response for query: {}", query);
                memory.record(query, &response);
                GenerationResult {
                    response,
                    sources,
                    history: memory.into_turns(),
                    outcome: Outcome::Answered,
                }
            }
            Generation::Fallback(outcome) => fallback(outcome, memory),
        }
    }

    /// Chunk `content` and store it. `metadata` overrides front-matter values.
    ///
    /// Returns `false` for empty content, a body with no chunks, an unavailable
    /// store, or a batch that did not fully succeed.
    pub async fn index_document(&self, content: &str, metadata: DocumentMetadata) -> bool {
        if content.trim().is_empty() {
            info!("Received empty content for indexing");
            return false;
        }

        let (front_matter, body) = metadata::extract(content);
        let metadata = metadata.or(front_matter);
        let source = metadata.source_or_empty().to_string();

        let chunks = self.chunker.chunk(&body);
        if chunks.is_empty() {
            info!("No chunks produced for document '{}'", source);
            return false;
        }
        let records: Vec<ChunkRecord> = chunks
            .into_iter()
            .enumerate()
            .map(|(i, chunk)| ChunkRecord::new(chunk, &metadata, i))
            .collect();

        let Some(index) = self.index_or_reconnect().await else {
            warn!("Vector store unavailable; skipping indexing of '{}'", source);
            return false;
        };

        match self
            .policy
            .run("Batch insert", |_| index.insert_batch(&records))
            .await
        {
            Ok(written) => {
                info!("Indexed {} chunks from '{}'", written, source);
                true
            }
            Err(e) => {
                if e.is_connection() {
                    self.mark_degraded();
                }
                error!("Error indexing document '{}': {}", source, e);
                false
            }
        }
    }

    async fn retrieve(&self, query: &str) -> Retrieval {
        let Some(index) = self.index_or_reconnect().await else {
            warn!("Vector store unavailable; skipping retrieval for query: {}", query);
            return Retrieval::Failed;
        };

        let result = match self.query_index(&index, query).await {
            Err(e) if e.is_connection() => {
                warn!("Retrieval lost the vector store ({}); re-bootstrapping", e);
                self.mark_degraded();
                match self.try_reconnect().await {
                    Some(index) => self.query_index(&index, query).await,
                    None => Err(e),
                }
            }
            other => other,
        };

        match result {
            Ok(hits) if hits.is_empty() => Retrieval::Empty,
            Ok(hits) => {
                info!("Retrieved {} contexts for query: {}", hits.len(), query);
                Retrieval::Hits(hits)
            }
            Err(e) => {
                if e.is_connection() {
                    self.mark_degraded();
                }
                error!("Error retrieving context for query '{}': {}", query, e);
                Retrieval::Failed
            }
        }
    }

    async fn query_index(
        &self,
        index: &Arc<dyn VectorIndex>,
        query: &str,
    ) -> Result<Vec<ContextResult>, IndexError> {
        self.policy
            .run("Context retrieval", |_| index.query(query, self.top_k))
            .await
    }

    async fn generate_grounded(
        &self,
        query: &str,
        contexts: Vec<ContextResult>,
        memory: &ConversationMemory,
    ) -> Generation {
        let system = ChatMessage::System(self.template.system_prompt.clone());
        let reserved = self.reserved_tokens(&system, memory);
        match self.assembler.assemble(query, contexts, reserved) {
            Assembly::NoRoom => {
                warn!("Prompt exceeds token limit even without context for query: {}", query);
                Generation::Fallback(Outcome::OverBudget)
            }
            Assembly::Prompt {
                prompt, contexts, ..
            } => match self.complete(system, memory, prompt).await {
                Some(response) => Generation::Answer {
                    response,
                    sources: contexts,
                },
                None => Generation::Fallback(Outcome::BackendError),
            },
        }
    }

    async fn generate_without_context(
        &self,
        query: &str,
        memory: &ConversationMemory,
    ) -> Generation {
        match self.no_context {
            NoContextMode::Apologize => {
                info!("No context found for query, returning fallback response");
                Generation::Fallback(Outcome::NoContext)
            }
            NoContextMode::Direct => {
                info!("No context found for query, answering without retrieval");
                let system = ChatMessage::System(self.template.fallback_system_prompt.clone());
                let reserved = self.reserved_tokens(&system, memory);
                match self.assembler.assemble(query, Vec::new(), reserved) {
                    Assembly::NoRoom => {
                        warn!("Prompt exceeds token limit for query: {}", query);
                        Generation::Fallback(Outcome::OverBudget)
                    }
                    Assembly::Prompt { prompt, .. } => {
                        match self.complete(system, memory, prompt).await {
                            Some(response) => Generation::Answer {
                                response,
                                sources: Vec::new(),
                            },
                            None => Generation::Fallback(Outcome::BackendError),
                        }
                    }
                }
            }
        }
    }

    async fn complete(
        &self,
        system: ChatMessage,
        memory: &ConversationMemory,
        prompt: String,
    ) -> Option<String> {
        let mut messages = Vec::with_capacity(memory.len() + 2);
        messages.push(system);
        messages.extend(memory.turns().map(ChatMessage::from));
        messages.push(ChatMessage::User(prompt));

        match self
            .policy
            .run("Completion", |_| self.llm.complete(&messages))
            .await
        {
            Ok(response) => Some(response),
            Err(e) => {
                error!("Error generating response: {}", e);
                None
            }
        }
    }

    /// Tokens used by everything in the request except the user prompt.
    fn reserved_tokens(&self, system: &ChatMessage, memory: &ConversationMemory) -> usize {
        let counter = self.assembler.counter();
        let history: usize = memory
            .turns()
            .map(|t| counter.count(&t.content) + MESSAGE_OVERHEAD_TOKENS)
            .sum();
        counter.count(system.content()) + 2 * MESSAGE_OVERHEAD_TOKENS + history
    }

    fn active_index(&self) -> Option<Arc<dyn VectorIndex>> {
        match &*self.state.read().unwrap_or_else(PoisonError::into_inner) {
            IndexState::Ready(index) => Some(index.clone()),
            IndexState::Degraded => None,
        }
    }

    fn mark_degraded(&self) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if matches!(*state, IndexState::Ready(_)) {
            warn!("Vector store marked unavailable; entering degraded mode");
        }
        *state = IndexState::Degraded;
    }

    fn cooldown_elapsed(&self) -> bool {
        match *self
            .last_reconnect
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
        {
            Some(at) => at.elapsed() >= self.reconnect_cooldown,
            None => true,
        }
    }

    async fn index_or_reconnect(&self) -> Option<Arc<dyn VectorIndex>> {
        if let Some(index) = self.active_index() {
            return Some(index);
        }
        if !self.cooldown_elapsed() {
            debug!("Vector store degraded; reconnect cooldown still running");
            return None;
        }
        self.try_reconnect().await
    }

    async fn try_reconnect(&self) -> Option<Arc<dyn VectorIndex>> {
        let _guard = self.reconnect_lock.lock().await;
        if let Some(index) = self.active_index() {
            return Some(index);
        }
        *self
            .last_reconnect
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Instant::now());

        match self.connector.connect().await {
            Ok(index) => {
                info!("Reconnected to vector store ({})", index.name());
                *self.state.write().unwrap_or_else(PoisonError::into_inner) =
                    IndexState::Ready(index.clone());
                Some(index)
            }
            Err(e) => {
                warn!("Vector store reconnect failed: {}", e);
                None
            }
        }
    }
}

fn fallback(outcome: Outcome, memory: ConversationMemory) -> GenerationResult {
    GenerationResult {
        response: outcome.canned_message().unwrap_or_default().to_string(),
        sources: Vec::new(),
        history: memory.into_turns(),
        outcome,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{LlmError, OpenAiChat};
    use crate::embedding::HashingEmbedder;
    use crate::vector_store::{ContextMetadata, FixedConnector, MemoryVectorStore};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct ScriptedIndex {
        replies: Mutex<VecDeque<Result<Vec<ContextResult>, IndexError>>>,
        otherwise: Vec<ContextResult>,
        queries: AtomicUsize,
        fail_inserts: bool,
        inserted: Mutex<Vec<ChunkRecord>>,
    }

    impl ScriptedIndex {
        fn answering(hits: Vec<ContextResult>) -> Self {
            Self {
                otherwise: hits,
                ..Self::default()
            }
        }

        fn then(self, reply: Result<Vec<ContextResult>, IndexError>) -> Self {
            self.replies.lock().unwrap().push_back(reply);
            self
        }

        fn queries(&self) -> usize {
            self.queries.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl VectorIndex for ScriptedIndex {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn insert_batch(&self, records: &[ChunkRecord]) -> Result<usize, IndexError> {
            if self.fail_inserts {
                return Err(IndexError::Batch {
                    written: 0,
                    total: records.len(),
                    message: "vectorizer rejected the batch".into(),
                });
            }
            self.inserted.lock().unwrap().extend_from_slice(records);
            Ok(records.len())
        }

        async fn query(&self, _: &str, limit: usize) -> Result<Vec<ContextResult>, IndexError> {
            self.queries.fetch_add(1, Ordering::SeqCst);
            match self.replies.lock().unwrap().pop_front() {
                Some(reply) => reply,
                None => Ok(self.otherwise.iter().take(limit).cloned().collect()),
            }
        }
    }

    #[derive(Default)]
    struct ScriptedConnector {
        results: Mutex<VecDeque<Result<Arc<dyn VectorIndex>, IndexError>>>,
        calls: AtomicUsize,
    }

    impl ScriptedConnector {
        fn with(results: Vec<Result<Arc<dyn VectorIndex>, IndexError>>) -> Arc<Self> {
            Arc::new(Self {
                results: Mutex::new(results.into()),
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl IndexConnector for ScriptedConnector {
        async fn connect(&self) -> Result<Arc<dyn VectorIndex>, IndexError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.results
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Err(IndexError::Unavailable))
        }
    }

    #[derive(Default)]
    struct ScriptedModel {
        replies: Mutex<VecDeque<Result<String, LlmError>>>,
        seen: Mutex<Vec<Vec<ChatMessage>>>,
    }

    impl ScriptedModel {
        fn with(replies: Vec<Result<String, LlmError>>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into()),
                seen: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> usize {
            self.seen.lock().unwrap().len()
        }

        fn last_request(&self) -> Vec<ChatMessage> {
            self.seen.lock().unwrap().last().cloned().unwrap_or_default()
        }
    }

    #[async_trait]
    impl LanguageModel for ScriptedModel {
        async fn complete(&self, messages: &[ChatMessage]) -> Result<String, LlmError> {
            self.seen.lock().unwrap().push(messages.to_vec());
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok("scripted answer".to_string()))
        }
    }

    fn test_config() -> RagConfig {
        let mut config = RagConfig::default();
        config.retry.delay_ms = 1;
        config.vector_index.reconnect_cooldown_secs = 0;
        config
    }

    fn hit(content: &str, source: &str) -> ContextResult {
        ContextResult {
            content: content.to_string(),
            metadata: ContextMetadata {
                title: String::new(),
                category: "Methodology".into(),
                source: source.into(),
            },
            distance: Some(0.1),
        }
    }

    async fn service_over(
        index: Arc<ScriptedIndex>,
        llm: Arc<ScriptedModel>,
        config: RagConfig,
    ) -> RagService {
        let connector = ScriptedConnector::with(vec![Ok(index as Arc<dyn VectorIndex>)]);
        RagService::new(connector, llm, &config, PromptTemplate::default())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_empty_query_has_no_side_effects() {
        let index = Arc::new(ScriptedIndex::answering(vec![hit("x", "a.md")]));
        let llm = ScriptedModel::with(vec![]);
        let rag = service_over(index.clone(), llm.clone(), test_config()).await;

        let result = rag.generate_response("   ", &[]).await;

        assert_eq!(result.outcome, Outcome::EmptyQuery);
        assert_eq!(result.response, EMPTY_QUERY_MESSAGE);
        assert!(result.sources.is_empty());
        assert_eq!(index.queries(), 0);
        assert_eq!(llm.calls(), 0);
    }

    #[tokio::test]
    async fn test_answers_with_sources() {
        let index = Arc::new(ScriptedIndex::answering(vec![
            hit("DMAIC is a five-phase cycle.", "dmaic.md"),
            hit("Control charts track variation.", "spc.md"),
        ]));
        let llm = ScriptedModel::with(vec![Ok("DMAIC has five phases.".into())]);
        let rag = service_over(index, llm.clone(), test_config()).await;

        let result = rag.generate_response("What is DMAIC?", &[]).await;

        assert_eq!(result.outcome, Outcome::Answered);
        assert_eq!(result.response, "DMAIC has five phases.");
        assert_eq!(result.sources.len(), 2);
        let request = llm.last_request();
        assert!(matches!(&request[0], ChatMessage::System(s) if s.contains("Lean Six Sigma")));
        assert!(request.last().unwrap().content().contains("What is DMAIC?"));
        assert!(request.last().unwrap().content().contains("dmaic.md"));
    }

    #[tokio::test]
    async fn test_no_context_skips_the_model() {
        let index = Arc::new(ScriptedIndex::default());
        let llm = ScriptedModel::with(vec![]);
        let rag = service_over(index, llm.clone(), test_config()).await;

        let result = rag.generate_response("What is takt time?", &[]).await;

        assert_eq!(result.outcome, Outcome::NoContext);
        assert_eq!(result.response, NO_CONTEXT_MESSAGE);
        assert!(result.sources.is_empty());
        assert_eq!(llm.calls(), 0);
    }

    #[tokio::test]
    async fn test_direct_mode_answers_without_sources() {
        let mut config = test_config();
        config.generation.no_context = NoContextMode::Direct;
        let llm = ScriptedModel::with(vec![Ok("Takt time is demand-paced.".into())]);
        let rag = service_over(Arc::new(ScriptedIndex::default()), llm.clone(), config).await;

        let result = rag.generate_response("What is takt time?", &[]).await;

        assert_eq!(result.outcome, Outcome::Answered);
        assert!(result.sources.is_empty());
        let request = llm.last_request();
        assert_eq!(
            request[0],
            ChatMessage::System(PromptTemplate::default().fallback_system_prompt)
        );
        assert!(!request.last().unwrap().content().contains("Context:"));
    }

    #[tokio::test]
    async fn test_transient_retrieval_failures_are_retried() {
        let index = Arc::new(
            ScriptedIndex::answering(vec![hit("DMAIC is ...", "dmaic.md")])
                .then(Err(IndexError::Status { status: 503, body: String::new() }))
                .then(Err(IndexError::Status { status: 500, body: String::new() })),
        );
        let llm = ScriptedModel::with(vec![]);
        let rag = service_over(index.clone(), llm, test_config()).await;

        let result = rag.generate_response("What is DMAIC?", &[]).await;

        assert_eq!(index.queries(), 3);
        assert_eq!(result.outcome, Outcome::Answered);
        assert_eq!(result.sources.len(), 1);
    }

    #[tokio::test]
    async fn test_exhausted_retrieval_falls_back() {
        let index = Arc::new(
            ScriptedIndex::answering(vec![hit("unreachable", "x.md")])
                .then(Err(IndexError::Connection("reset".into())))
                .then(Err(IndexError::Connection("reset".into())))
                .then(Err(IndexError::Connection("reset".into()))),
        );
        let connector = ScriptedConnector::with(vec![Ok(index.clone() as Arc<dyn VectorIndex>)]);
        let llm = ScriptedModel::with(vec![]);
        let rag = RagService::new(connector.clone(), llm.clone(), &test_config(), PromptTemplate::default())
            .await
            .unwrap();

        let result = rag.generate_response("What is DMAIC?", &[]).await;

        assert_eq!(index.queries(), 3);
        assert_eq!(result.outcome, Outcome::NoContext);
        assert!(result.sources.is_empty());
        assert_eq!(llm.calls(), 0);
        // one bootstrap at construction, one re-bootstrap after the failure
        assert_eq!(connector.calls(), 2);
        assert!(rag.is_degraded());
    }

    #[tokio::test]
    async fn test_connection_failure_reconnects_and_retries() {
        let broken = Arc::new(
            ScriptedIndex::default()
                .then(Err(IndexError::Connection("reset".into())))
                .then(Err(IndexError::Connection("reset".into())))
                .then(Err(IndexError::Connection("reset".into()))),
        );
        let healthy = Arc::new(ScriptedIndex::answering(vec![hit("DMAIC is ...", "dmaic.md")]));
        let connector = ScriptedConnector::with(vec![
            Ok(broken as Arc<dyn VectorIndex>),
            Ok(healthy.clone() as Arc<dyn VectorIndex>),
        ]);
        let rag = RagService::new(
            connector,
            ScriptedModel::with(vec![]),
            &test_config(),
            PromptTemplate::default(),
        )
        .await
        .unwrap();

        let result = rag.generate_response("What is DMAIC?", &[]).await;

        assert_eq!(result.outcome, Outcome::Answered);
        assert_eq!(healthy.queries(), 1);
        assert!(!rag.is_degraded());
    }

    #[tokio::test]
    async fn test_model_failure_returns_error_message() {
        let index = Arc::new(ScriptedIndex::answering(vec![hit("DMAIC is ...", "dmaic.md")]));
        let llm = ScriptedModel::with(vec![Err(LlmError::Api("invalid model".into()))]);
        let rag = service_over(index, llm.clone(), test_config()).await;

        let result = rag.generate_response("What is DMAIC?", &[]).await;

        assert_eq!(result.outcome, Outcome::BackendError);
        assert_eq!(result.response, BACKEND_ERROR_MESSAGE);
        assert!(result.sources.is_empty());
        assert!(result.history.is_empty());
        assert_eq!(llm.calls(), 1);
    }

    #[tokio::test]
    async fn test_transient_model_failures_are_retried() {
        let index = Arc::new(ScriptedIndex::answering(vec![hit("DMAIC is ...", "dmaic.md")]));
        let llm = ScriptedModel::with(vec![
            Err(LlmError::Transport("timeout".into())),
            Err(LlmError::Transport("timeout".into())),
            Err(LlmError::Transport("timeout".into())),
        ]);
        let rag = service_over(index, llm.clone(), test_config()).await;

        let result = rag.generate_response("What is DMAIC?", &[]).await;

        assert_eq!(result.outcome, Outcome::BackendError);
        assert_eq!(llm.calls(), 3);
    }

    #[tokio::test]
    async fn test_server_errors_use_exactly_the_retry_budget() {
        let server = httpmock::MockServer::start_async().await;
        let completions = server
            .mock_async(|when, then| {
                when.method(httpmock::Method::POST).path("/v1/chat/completions");
                then.status(500).body("internal error");
            })
            .await;

        let mut config = test_config();
        config.llm.api_key = "sk-test".into();
        config.llm.api_base = server.url("/v1");
        config.llm.timeout_secs = 5;
        let index = Arc::new(ScriptedIndex::answering(vec![hit("DMAIC is ...", "dmaic.md")]));
        let connector = ScriptedConnector::with(vec![Ok(index as Arc<dyn VectorIndex>)]);
        let llm = Arc::new(OpenAiChat::new(&config.llm).unwrap());
        let rag = RagService::new(connector, llm, &config, PromptTemplate::default())
            .await
            .unwrap();

        let result = tokio::time::timeout(
            std::time::Duration::from_secs(10),
            rag.generate_response("What is DMAIC?", &[]),
        )
        .await
        .expect("retry budget should bound the request");

        assert_eq!(result.outcome, Outcome::BackendError);
        assert_eq!(result.response, BACKEND_ERROR_MESSAGE);
        completions
            .assert_hits_async(config.retry.max_attempts as usize)
            .await;
    }

    #[tokio::test]
    async fn test_over_budget_skips_the_model() {
        let mut config = test_config();
        config.generation.max_prompt_tokens = 40;
        let index = Arc::new(ScriptedIndex::answering(vec![
            hit(&"variation ".repeat(200), "a.md"),
            hit(&"variation ".repeat(200), "b.md"),
        ]));
        let llm = ScriptedModel::with(vec![]);
        let rag = service_over(index, llm.clone(), config).await;

        let result = rag.generate_response("What is variation?", &[]).await;

        assert_eq!(result.outcome, Outcome::OverBudget);
        assert_eq!(result.response, OVER_BUDGET_MESSAGE);
        assert_eq!(llm.calls(), 0);
    }

    #[tokio::test]
    async fn test_history_window_counts_messages() {
        let index = Arc::new(ScriptedIndex::answering(vec![hit("5S is ...", "5s.md")]));
        let llm = ScriptedModel::with(vec![Ok("Sort, Set, Shine, Standardize, Sustain.".into())]);
        let rag = service_over(index, llm.clone(), test_config()).await;
        let history: Vec<Turn> = (0..4)
            .flat_map(|i| [Turn::user(format!("q{i}")), Turn::assistant(format!("a{i}"))])
            .collect();

        let result = rag.generate_response("What is 5S?", &history).await;

        let request = llm.last_request();
        assert_eq!(request.len(), 1 + 5 + 1);
        assert_eq!(request[1], ChatMessage::Assistant("a1".into()));
        assert_eq!(result.history.len(), 5);
        assert_eq!(result.history[0], Turn::assistant("a2"));
        assert_eq!(result.history[4], Turn::assistant("Sort, Set, Shine, Standardize, Sustain."));
    }

    #[tokio::test]
    async fn test_history_is_injected_and_extended() {
        let index = Arc::new(ScriptedIndex::answering(vec![hit("DMADV is ...", "dmadv.md")]));
        let llm = ScriptedModel::with(vec![Ok("DMADV designs new processes.".into())]);
        let rag = service_over(index, llm.clone(), test_config()).await;
        let history = vec![
            Turn::user("What is DMAIC?"),
            Turn::assistant("An improvement cycle."),
        ];

        let result = rag.generate_response("And DMADV?", &history).await;

        let request = llm.last_request();
        assert_eq!(request.len(), 4);
        assert_eq!(request[1], ChatMessage::User("What is DMAIC?".into()));
        assert_eq!(request[2], ChatMessage::Assistant("An improvement cycle.".into()));
        assert_eq!(result.history.len(), 4);
        assert_eq!(result.history[2], Turn::user("And DMADV?"));
        assert_eq!(result.history[3], Turn::assistant("DMADV designs new processes."));
    }

    #[tokio::test]
    async fn test_bootstrap_failure_is_fatal() {
        let connector = ScriptedConnector::with(vec![Err(IndexError::Bootstrap("422".into()))]);
        let result = RagService::new(
            connector,
            ScriptedModel::with(vec![]),
            &test_config(),
            PromptTemplate::default(),
        )
        .await;
        assert!(matches!(result, Err(RagError::Bootstrap(_))));
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let mut config = test_config();
        config.chunking.chunk_overlap = config.chunking.chunk_size;
        let result = RagService::new(
            ScriptedConnector::with(vec![]),
            ScriptedModel::with(vec![]),
            &config,
            PromptTemplate::default(),
        )
        .await;
        assert!(matches!(result, Err(RagError::Config(_))));
    }

    #[tokio::test]
    async fn test_degraded_start_and_explicit_reconnect() {
        let mut config = test_config();
        config.vector_index.reconnect_cooldown_secs = 3600;
        let healthy = Arc::new(ScriptedIndex::answering(vec![hit("DMAIC is ...", "dmaic.md")]));
        let connector = ScriptedConnector::with(vec![
            Err(IndexError::Unavailable),
            Ok(healthy.clone() as Arc<dyn VectorIndex>),
        ]);
        let llm = ScriptedModel::with(vec![]);
        let rag = RagService::new(connector.clone(), llm.clone(), &config, PromptTemplate::default())
            .await
            .unwrap();
        assert!(rag.is_degraded());

        let result = rag.generate_response("What is DMAIC?", &[]).await;
        assert_eq!(result.outcome, Outcome::NoContext);
        assert!(!rag.index_document("Some text", DocumentMetadata::default()).await);
        // cooldown holds off automatic re-bootstrap
        assert_eq!(connector.calls(), 1);

        assert!(rag.reconnect().await);
        assert!(!rag.is_degraded());
        let result = rag.generate_response("What is DMAIC?", &[]).await;
        assert_eq!(result.outcome, Outcome::Answered);
        assert_eq!(healthy.queries(), 1);
    }

    #[tokio::test]
    async fn test_degraded_request_retries_bootstrap_after_cooldown() {
        let healthy = Arc::new(ScriptedIndex::answering(vec![hit("DMAIC is ...", "dmaic.md")]));
        let connector = ScriptedConnector::with(vec![
            Err(IndexError::Unavailable),
            Ok(healthy.clone() as Arc<dyn VectorIndex>),
        ]);
        let rag = RagService::new(
            connector.clone(),
            ScriptedModel::with(vec![]),
            &test_config(),
            PromptTemplate::default(),
        )
        .await
        .unwrap();

        let result = rag.generate_response("What is DMAIC?", &[]).await;

        assert_eq!(result.outcome, Outcome::Answered);
        assert_eq!(connector.calls(), 2);
    }

    #[tokio::test]
    async fn test_index_document_chunks_and_tags() {
        let index = Arc::new(ScriptedIndex::default());
        let mut config = test_config();
        config.chunking.chunk_size = 40;
        config.chunking.chunk_overlap = 10;
        let rag = service_over(index.clone(), ScriptedModel::with(vec![]), config).await;

        let doc = "---\ntitle: Control Charts\ncategory: Tools\n---\n\
                   Control charts plot a process metric over time against limits.";
        let ok = rag
            .index_document(doc, DocumentMetadata::default().with_source("tools/spc.md"))
            .await;

        assert!(ok);
        let inserted = index.inserted.lock().unwrap();
        assert!(inserted.len() > 1);
        assert!(inserted.iter().all(|r| r.category == "Tools"
            && r.title == "Control Charts"
            && r.source == "tools/spc.md"
            && !r.content.is_empty()));
    }

    #[tokio::test]
    async fn test_index_document_rejects_empty_input() {
        let index = Arc::new(ScriptedIndex::default());
        let rag = service_over(index.clone(), ScriptedModel::with(vec![]), test_config()).await;

        assert!(!rag.index_document("", DocumentMetadata::default()).await);
        assert!(!rag.index_document("---\ntitle: X\n---\n   \n", DocumentMetadata::default()).await);
        assert!(index.inserted.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_index_document_reports_batch_failure() {
        let index = Arc::new(ScriptedIndex {
            fail_inserts: true,
            ..ScriptedIndex::default()
        });
        let rag = service_over(index, ScriptedModel::with(vec![]), test_config()).await;
        assert!(!rag.index_document("Kaizen means continuous improvement.", DocumentMetadata::default()).await);
    }

    #[tokio::test]
    async fn test_index_then_answer_end_to_end() {
        let store = Arc::new(MemoryVectorStore::new(HashingEmbedder::default()));
        let connector = Arc::new(FixedConnector::new(store.clone()));
        let llm = ScriptedModel::with(vec![Ok("DMAIC is a five-phase cycle.".into())]);
        let rag = RagService::new(connector, llm.clone(), &test_config(), PromptTemplate::default())
            .await
            .unwrap();

        assert!(
            rag.index_document(
                "---\ntitle: X\ncategory: Methodology\n---\n\
                 DMAIC is a data-driven improvement cycle: Define, Measure, Analyze, Improve, Control.",
                DocumentMetadata::default().with_source("methodology/dmaic.md"),
            )
            .await
        );
        assert!(
            rag.index_document(
                "Kanban boards visualise work in progress.",
                DocumentMetadata::default()
                    .with_source("tools/kanban.md")
                    .with_category("Tools"),
            )
            .await
        );
        assert_eq!(store.len(), 2);

        let result = rag.generate_response("What is DMAIC?", &[]).await;

        assert_eq!(result.outcome, Outcome::Answered);
        let top = &result.sources[0];
        assert_eq!(top.metadata.source, "methodology/dmaic.md");
        assert_eq!(top.metadata.category, "Methodology");
        assert!(llm.last_request().last().unwrap().content().contains("What is DMAIC?"));
    }
}
