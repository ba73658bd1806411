//! Adapter contracts over STT, LLM, TTS and moderation
//!
//! Narrow, provider-agnostic traits. Implementations are shared across
//! sessions (`Arc<dyn _>`) and must be safe for concurrent use. Streaming
//! outputs are bounded mpsc channels so a dropped receiver or a cancelled
//! token stops the underlying request promptly.

pub mod moderation;
pub mod openai;

use async_trait::async_trait;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::warn;

pub use moderation::{BlocklistModeration, GuardrailDisabled, OpenAiModeration, Verdict};
pub use openai::{OpenAiLlm, OpenAiStt, OpenAiTts, ProviderClient};

/// Retry schedule for transient provider errors
const RETRY_BASE: Duration = Duration::from_secs(1);
const RETRY_CAP: Duration = Duration::from_secs(8);
const RETRY_ATTEMPTS: u32 = 3;

/// Circuit breaker tuning
const BREAKER_THRESHOLD: u32 = 3;
const BREAKER_COOLDOWN: Duration = Duration::from_secs(30);

/// Adapter failure taxonomy
#[derive(Debug, Clone, thiserror::Error)]
pub enum AdapterError {
    /// Network trouble, 5xx, rate limits. Retried inside the adapter wrapper.
    #[error("transient provider error: {0}")]
    Transient(String),
    /// The input itself is unusable (bad audio, empty payload). Not retried.
    #[error("invalid input: {0}")]
    PermanentInput(String),
    /// The provider rejected the request and a retry will not help.
    #[error("provider error: {0}")]
    Permanent(String),
    /// The caller cancelled the in-flight operation.
    #[error("cancelled")]
    Cancelled,
}

impl AdapterError {
    pub fn is_transient(&self) -> bool {
        matches!(self, AdapterError::Transient(_))
    }

    /// Permanent failures count against the session circuit breaker.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            AdapterError::Permanent(_) | AdapterError::PermanentInput(_)
        )
    }
}

/// Chat roles understood by the LLM contract
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

/// One message in an LLM prompt
#[derive(Debug, Clone, Serialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

/// Input audio container formats accepted by STT
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioFormat {
    /// Raw PCM16LE, 16 kHz, mono
    Pcm16Mono16k,
    /// WAV container (PCM payload)
    Wav,
}

/// Lazy token sequence from the LLM. Finite, non-restartable; the sender
/// stops within 100 ms of cancellation.
pub type TokenStream = mpsc::Receiver<Result<String, AdapterError>>;

/// Lazy encoded-audio chunk sequence from TTS. One container format per
/// stream, announced by the adapter configuration.
pub type AudioStream = mpsc::Receiver<Result<Vec<u8>, AdapterError>>;

#[async_trait]
pub trait SpeechToText: Send + Sync {
    /// Transcribe a complete utterance. `partials` receives intermediate
    /// transcripts when the provider streams them; providers that do not
    /// stream simply never send on it.
    async fn transcribe(
        &self,
        audio: &[u8],
        format: AudioFormat,
        language: Option<&str>,
        partials: Option<mpsc::Sender<String>>,
    ) -> Result<String, AdapterError>;
}

#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn stream(
        &self,
        messages: &[ChatMessage],
        model: &str,
        max_tokens: Option<u32>,
        cancel: CancellationToken,
    ) -> Result<TokenStream, AdapterError>;
}

#[async_trait]
pub trait TextToSpeech: Send + Sync {
    async fn synthesize(
        &self,
        text: &str,
        voice: &str,
        cancel: CancellationToken,
    ) -> Result<AudioStream, AdapterError>;
}

#[async_trait]
pub trait Moderation: Send + Sync {
    async fn check(&self, text: &str) -> Verdict;
}

/// The full adapter set a session works against
#[derive(Clone)]
pub struct AdapterSet {
    pub stt: Arc<dyn SpeechToText>,
    pub llm: Arc<dyn LanguageModel>,
    pub tts: Arc<dyn TextToSpeech>,
    pub moderation: Arc<dyn Moderation>,
}

/// Run an adapter operation, retrying transient failures with exponential
/// backoff (1 s base, 8 s cap, 3 attempts).
pub async fn with_retry<T, F, Fut>(op: &str, mut call: F) -> Result<T, AdapterError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, AdapterError>>,
{
    let mut delay = RETRY_BASE;
    let mut attempt = 1;
    loop {
        match call().await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_transient() && attempt < RETRY_ATTEMPTS => {
                warn!(
                    "{} transient failure (attempt {}/{}), retrying in {:?}: {}",
                    op, attempt, RETRY_ATTEMPTS, delay, e
                );
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(RETRY_CAP);
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Per-session fail-fast guard. Opens after `BREAKER_THRESHOLD` consecutive
/// permanent adapter failures and rejects turns until the cooldown passes.
#[derive(Debug)]
pub struct CircuitBreaker {
    consecutive_failures: u32,
    open_until: Option<Instant>,
}

impl CircuitBreaker {
    pub fn new() -> Self {
        Self {
            consecutive_failures: 0,
            open_until: None,
        }
    }

    /// Whether the breaker currently rejects work. Closes itself once the
    /// cooldown has elapsed.
    pub fn is_open(&mut self) -> bool {
        match self.open_until {
            Some(until) if Instant::now() < until => true,
            Some(_) => {
                self.open_until = None;
                self.consecutive_failures = 0;
                false
            }
            None => false,
        }
    }

    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
    }

    /// Record an adapter failure. Returns true if this failure opened the
    /// breaker.
    pub fn record_failure(&mut self, err: &AdapterError) -> bool {
        if !err.is_permanent() {
            return false;
        }
        self.consecutive_failures += 1;
        if self.consecutive_failures >= BREAKER_THRESHOLD && self.open_until.is_none() {
            self.open_until = Some(Instant::now() + BREAKER_COOLDOWN);
            return true;
        }
        false
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_retry_recovers_from_transient() {
        let calls = AtomicU32::new(0);
        let result = with_retry("op", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(AdapterError::Transient("flaky".into()))
                } else {
                    Ok(42)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_gives_up_after_three_attempts() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_retry("op", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(AdapterError::Transient("down".into())) }
        })
        .await;
        assert!(result.unwrap_err().is_transient());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_does_not_retry_permanent() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_retry("op", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(AdapterError::PermanentInput("bad audio".into())) }
        })
        .await;
        assert!(result.unwrap_err().is_permanent());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_breaker_opens_and_recovers() {
        let mut breaker = CircuitBreaker::new();
        let err = AdapterError::Permanent("500".into());
        assert!(!breaker.record_failure(&err));
        assert!(!breaker.record_failure(&err));
        assert!(breaker.record_failure(&err));
        assert!(breaker.is_open());

        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(!breaker.is_open());
        assert!(!breaker.record_failure(&err));
    }

    #[tokio::test(start_paused = true)]
    async fn test_breaker_ignores_transient_and_resets_on_success() {
        let mut breaker = CircuitBreaker::new();
        let transient = AdapterError::Transient("429".into());
        let permanent = AdapterError::Permanent("403".into());
        assert!(!breaker.record_failure(&transient));
        assert!(!breaker.record_failure(&permanent));
        assert!(!breaker.record_failure(&permanent));
        breaker.record_success();
        assert!(!breaker.record_failure(&permanent));
        assert!(!breaker.is_open());
    }
}
