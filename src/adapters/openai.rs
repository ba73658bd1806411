//! OpenAI-compatible HTTP adapters for STT, LLM and TTS
//!
//! STT: multipart upload to `/audio/transcriptions` (single final transcript,
//! no partials). LLM: `/chat/completions` with `stream: true`, SSE parsed by
//! hand. TTS: `/audio/speech` with a chunked response body.

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{
    AdapterError, AudioFormat, AudioStream, ChatMessage, LanguageModel, SpeechToText,
    TextToSpeech, TokenStream,
};

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Channel depth for token/chunk streams. Bounded so a stalled consumer
/// applies backpressure to the provider read loop.
const STREAM_DEPTH: usize = 64;

/// Shared HTTP plumbing for the three adapters
#[derive(Clone)]
pub struct ProviderClient {
    client: Arc<Client>,
    base_url: String,
    api_key: String,
}

impl ProviderClient {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            client: Arc::new(Client::new()),
            base_url: base_url.into(),
            api_key: api_key.into(),
        }
    }

    pub(crate) fn post(&self, path: &str) -> reqwest::RequestBuilder {
        self.client
            .post(format!("{}{}", self.base_url, path))
            .header("Authorization", format!("Bearer {}", self.api_key))
    }
}

/// Map an HTTP failure status onto the adapter error taxonomy.
fn status_error(op: &str, status: StatusCode, body: &str) -> AdapterError {
    let msg = format!("{} failed ({}): {}", op, status, body.trim());
    if status.as_u16() == 429 || status.is_server_error() {
        AdapterError::Transient(msg)
    } else {
        AdapterError::Permanent(msg)
    }
}

fn request_error(op: &str, e: reqwest::Error) -> AdapterError {
    AdapterError::Transient(format!("{} request error: {}", op, e))
}

/// Wrap raw PCM16LE mono samples in a minimal WAV container so the
/// transcription endpoint accepts them.
fn wav_from_pcm16(pcm: &[u8], sample_rate: u32) -> Vec<u8> {
    let data_len = pcm.len() as u32;
    let byte_rate = sample_rate * 2;
    let mut wav = Vec::with_capacity(44 + pcm.len());
    wav.extend_from_slice(b"RIFF");
    wav.extend_from_slice(&(36 + data_len).to_le_bytes());
    wav.extend_from_slice(b"WAVEfmt ");
    wav.extend_from_slice(&16u32.to_le_bytes());
    wav.extend_from_slice(&1u16.to_le_bytes()); // PCM
    wav.extend_from_slice(&1u16.to_le_bytes()); // mono
    wav.extend_from_slice(&sample_rate.to_le_bytes());
    wav.extend_from_slice(&byte_rate.to_le_bytes());
    wav.extend_from_slice(&2u16.to_le_bytes()); // block align
    wav.extend_from_slice(&16u16.to_le_bytes()); // bits per sample
    wav.extend_from_slice(b"data");
    wav.extend_from_slice(&data_len.to_le_bytes());
    wav.extend_from_slice(pcm);
    wav
}

// ─── STT ─────────────────────────────────────────────────────

pub struct OpenAiStt {
    provider: ProviderClient,
    model: String,
}

impl OpenAiStt {
    pub fn new(provider: ProviderClient, model: impl Into<String>) -> Self {
        Self {
            provider,
            model: model.into(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct TranscriptionResponse {
    #[serde(default)]
    text: String,
}

#[async_trait]
impl SpeechToText for OpenAiStt {
    async fn transcribe(
        &self,
        audio: &[u8],
        format: AudioFormat,
        language: Option<&str>,
        _partials: Option<mpsc::Sender<String>>,
    ) -> Result<String, AdapterError> {
        if audio.is_empty() {
            return Err(AdapterError::PermanentInput("empty audio buffer".into()));
        }

        let body = match format {
            AudioFormat::Pcm16Mono16k => wav_from_pcm16(audio, 16_000),
            AudioFormat::Wav => audio.to_vec(),
        };

        let mut form = reqwest::multipart::Form::new()
            .part(
                "file",
                reqwest::multipart::Part::bytes(body)
                    .file_name("audio.wav")
                    .mime_str("audio/wav")
                    .map_err(|e| AdapterError::PermanentInput(e.to_string()))?,
            )
            .text("model", self.model.clone());
        if let Some(lang) = language {
            form = form.text("language", lang.to_string());
        }

        let response = self
            .provider
            .post("/audio/transcriptions")
            .multipart(form)
            .send()
            .await
            .map_err(|e| request_error("stt", e))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(status_error("stt", status, &body));
        }

        let parsed: TranscriptionResponse = response
            .json()
            .await
            .map_err(|e| AdapterError::Permanent(format!("stt response parse: {}", e)))?;
        Ok(parsed.text.trim().to_string())
    }
}

// ─── LLM ─────────────────────────────────────────────────────

pub struct OpenAiLlm {
    provider: ProviderClient,
}

impl OpenAiLlm {
    pub fn new(provider: ProviderClient) -> Self {
        Self { provider }
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct StreamResponse {
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    delta: Delta,
}

#[derive(Debug, Deserialize)]
struct Delta {
    #[serde(default)]
    content: Option<String>,
}

#[async_trait]
impl LanguageModel for OpenAiLlm {
    async fn stream(
        &self,
        messages: &[ChatMessage],
        model: &str,
        max_tokens: Option<u32>,
        cancel: CancellationToken,
    ) -> Result<TokenStream, AdapterError> {
        let request = ChatRequest {
            model,
            messages,
            max_tokens,
            stream: true,
        };

        let response = self
            .provider
            .post("/chat/completions")
            .json(&request)
            .send()
            .await
            .map_err(|e| request_error("llm", e))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(status_error("llm", status, &body));
        }

        let (tx, rx) = mpsc::channel(STREAM_DEPTH);
        tokio::spawn(async move {
            let mut stream = response.bytes_stream();
            let mut buffer = String::new();
            loop {
                let chunk = tokio::select! {
                    _ = cancel.cancelled() => break,
                    chunk = stream.next() => match chunk {
                        Some(Ok(c)) => c,
                        Some(Err(e)) => {
                            let _ = tx
                                .send(Err(AdapterError::Transient(format!(
                                    "llm stream read: {}",
                                    e
                                ))))
                                .await;
                            break;
                        }
                        None => break,
                    },
                };
                buffer.push_str(&String::from_utf8_lossy(&chunk));

                // SSE events are separated by a blank line
                while let Some(pos) = buffer.find("\n\n") {
                    let event = buffer[..pos].to_string();
                    buffer = buffer[pos + 2..].to_string();
                    for line in event.lines() {
                        let Some(data) = line.strip_prefix("data: ") else {
                            continue;
                        };
                        if data == "[DONE]" {
                            return;
                        }
                        if let Ok(parsed) = serde_json::from_str::<StreamResponse>(data) {
                            if let Some(content) = parsed
                                .choices
                                .first()
                                .and_then(|c| c.delta.content.as_deref())
                            {
                                if !content.is_empty()
                                    && tx.send(Ok(content.to_string())).await.is_err()
                                {
                                    // Consumer dropped the stream
                                    return;
                                }
                            }
                        }
                    }
                }
            }
            debug!("llm stream closed");
        });

        Ok(rx)
    }
}

// ─── TTS ─────────────────────────────────────────────────────

pub struct OpenAiTts {
    provider: ProviderClient,
    model: String,
}

impl OpenAiTts {
    pub fn new(provider: ProviderClient, model: impl Into<String>) -> Self {
        Self {
            provider,
            model: model.into(),
        }
    }
}

#[derive(Debug, Serialize)]
struct SpeechRequest<'a> {
    model: &'a str,
    voice: &'a str,
    input: &'a str,
    response_format: &'a str,
}

#[async_trait]
impl TextToSpeech for OpenAiTts {
    async fn synthesize(
        &self,
        text: &str,
        voice: &str,
        cancel: CancellationToken,
    ) -> Result<AudioStream, AdapterError> {
        if text.len() > 4000 {
            return Err(AdapterError::PermanentInput(format!(
                "tts input too long ({} chars)",
                text.len()
            )));
        }

        let request = SpeechRequest {
            model: &self.model,
            voice,
            input: text,
            response_format: "mp3",
        };

        let response = self
            .provider
            .post("/audio/speech")
            .json(&request)
            .send()
            .await
            .map_err(|e| request_error("tts", e))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(status_error("tts", status, &body));
        }

        let (tx, rx) = mpsc::channel(STREAM_DEPTH);
        tokio::spawn(async move {
            let mut stream = response.bytes_stream();
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    chunk = stream.next() => match chunk {
                        Some(Ok(c)) => {
                            if tx.send(Ok(c.to_vec())).await.is_err() {
                                break;
                            }
                        }
                        Some(Err(e)) => {
                            let _ = tx
                                .send(Err(AdapterError::Transient(format!(
                                    "tts stream read: {}",
                                    e
                                ))))
                                .await;
                            break;
                        }
                        None => break,
                    },
                }
            }
        });

        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wav_header() {
        let pcm = vec![0u8; 320];
        let wav = wav_from_pcm16(&pcm, 16_000);
        assert_eq!(&wav[..4], b"RIFF");
        assert_eq!(&wav[8..12], b"WAVE");
        assert_eq!(wav.len(), 44 + 320);
        // data chunk length
        assert_eq!(u32::from_le_bytes([wav[40], wav[41], wav[42], wav[43]]), 320);
    }

    #[test]
    fn test_status_mapping() {
        assert!(status_error("x", StatusCode::TOO_MANY_REQUESTS, "").is_transient());
        assert!(status_error("x", StatusCode::BAD_GATEWAY, "").is_transient());
        assert!(status_error("x", StatusCode::UNAUTHORIZED, "").is_permanent());
        assert!(status_error("x", StatusCode::BAD_REQUEST, "").is_permanent());
    }

    #[test]
    fn test_chat_request_shape() {
        let messages = vec![ChatMessage::system("s"), ChatMessage::user("u")];
        let req = ChatRequest {
            model: "gpt-4o-mini",
            messages: &messages,
            max_tokens: None,
            stream: true,
        };
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["stream"], true);
        assert_eq!(json["messages"][1]["role"], "user");
        assert!(json.get("max_tokens").is_none());
    }
}
