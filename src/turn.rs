//! Per-turn pipeline: audio bytes to synthesized reply
//!
//! One utterance drives the machine Idle → Transcribing → Routing →
//! ModeratingIn → Generating → Speaking → Done, with terminal branches
//! Cancelled, Blocked and Failed. LLM token streaming and TTS synthesis
//! overlap: tokens are forwarded as they arrive and buffered into sentence
//! units that a worker task synthesizes strictly in order.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::adapters::{
    with_retry, AdapterError, AdapterSet, AudioFormat, TextToSpeech, Verdict,
};
use crate::agents::AgentManager;
use crate::protocol::ServerEvent;
use crate::router;
use crate::session::{Outbound, SharedCore};
use crate::state::Speaker;

/// Minimum nonsilent audio before STT is worth calling
pub const MIN_SPEECH_MS: u64 = 250;

/// Default echo guard applied after TTS ends or a barge-in fires
pub const DEFAULT_DEAF_WINDOW_MS: u64 = 700;

/// Sentence soft limit: flush the TTS buffer at the next word break past this
const SENTENCE_SOFT_LIMIT: usize = 120;

/// Samples per VAD window (20 ms at 16 kHz)
const VAD_WINDOW: usize = 320;

/// Turn phases
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnPhase {
    Idle,
    Transcribing,
    Routing,
    ModeratingIn,
    Generating,
    Speaking,
    Done,
    Cancelled,
    Blocked,
    Failed,
}

impl TurnPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TurnPhase::Done | TurnPhase::Cancelled | TurnPhase::Blocked | TurnPhase::Failed
        )
    }
}

/// What started the turn
#[derive(Debug)]
pub enum TurnInput {
    /// Buffered PCM16LE 16 kHz mono from `audio_chunk` frames
    Audio(Vec<u8>),
    /// Synthetic user turn from `text_input`
    Text(String),
}

/// Tuning for one turn, derived from the session config
#[derive(Debug, Clone)]
pub struct TurnConfig {
    pub llm_model: String,
    pub max_tokens: Option<u32>,
    pub speech_rms_threshold: f32,
    pub min_speech_ms: u64,
    pub deaf_window: Duration,
}

/// Everything a spawned turn task needs. Holds an `Arc` to the session
/// interior and a sender clone, never the session itself.
pub struct TurnContext {
    pub turn_id: u64,
    pub adapters: AdapterSet,
    pub core: Arc<Mutex<SharedCore>>,
    pub outbound: Outbound,
    pub config: TurnConfig,
    pub cancel: CancellationToken,
    pub playback_done: mpsc::Receiver<()>,
}

/// Compute RMS energy of PCM samples
fn rms_energy(samples: &[i16]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    (samples.iter().map(|&s| (s as f32).powi(2)).sum::<f32>() / samples.len() as f32).sqrt()
}

/// Windowed energy gate: total nonsilent audio must reach `min_speech_ms`.
fn has_speech(pcm: &[u8], rms_threshold: f32, min_speech_ms: u64) -> bool {
    let samples: Vec<i16> = pcm
        .chunks_exact(2)
        .map(|c| i16::from_le_bytes([c[0], c[1]]))
        .collect();
    let mut nonsilent_ms = 0u64;
    for window in samples.chunks(VAD_WINDOW) {
        if rms_energy(window) > rms_threshold {
            nonsilent_ms += (window.len() as u64) / 16;
        }
    }
    nonsilent_ms >= min_speech_ms
}

/// Accumulates streamed tokens and cuts them into sentence units at
/// terminators (`.` `?` `!`, newline) or the soft length limit.
pub struct SentenceBuffer {
    buf: String,
}

impl SentenceBuffer {
    pub fn new() -> Self {
        Self { buf: String::new() }
    }

    /// Feed one token; returns any completed sentence units.
    pub fn push(&mut self, token: &str) -> Vec<String> {
        let mut out = Vec::new();
        for ch in token.chars() {
            if ch == '\n' {
                if let Some(s) = self.take() {
                    out.push(s);
                }
                continue;
            }
            self.buf.push(ch);
            let terminator = matches!(ch, '.' | '?' | '!');
            let soft_break = ch.is_whitespace() && self.buf.len() >= SENTENCE_SOFT_LIMIT;
            if (terminator || soft_break) && self.buf.trim().len() > 1 {
                if let Some(s) = self.take() {
                    out.push(s);
                }
            }
        }
        out
    }

    /// Drain whatever is left at end-of-stream.
    pub fn flush(&mut self) -> Option<String> {
        self.take()
    }

    fn take(&mut self) -> Option<String> {
        let trimmed = self.buf.trim().to_string();
        self.buf.clear();
        if trimmed.len() > 1 {
            Some(trimmed)
        } else {
            None
        }
    }
}

impl Default for SentenceBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// Synthesize `text` and forward every chunk as a `tts_chunk` event.
/// Used for transfer acknowledgements, greetings and nudges; the reply path
/// goes through the sentence worker instead.
pub async fn stream_tts(
    tts: &Arc<dyn TextToSpeech>,
    text: &str,
    voice: &str,
    outbound: &Outbound,
    turn_id: u64,
    cancel: &CancellationToken,
) -> Result<(), AdapterError> {
    let mut audio = tokio::select! {
        _ = cancel.cancelled() => return Err(AdapterError::Cancelled),
        r = with_retry("tts", || tts.synthesize(text, voice, cancel.clone())) => r?,
    };
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Err(AdapterError::Cancelled),
            chunk = audio.recv() => match chunk {
                Some(Ok(bytes)) => outbound.send(ServerEvent::TtsChunk {
                    turn_id,
                    audio: BASE64.encode(&bytes),
                }),
                Some(Err(e)) => return Err(e),
                None => return Ok(()),
            },
        }
    }
}

/// Ordered TTS worker: synthesizes queued sentence units one at a time and
/// forwards their chunks, so audio order matches generation order.
async fn tts_worker(
    tts: Arc<dyn TextToSpeech>,
    voice: String,
    mut sentences: mpsc::Receiver<String>,
    outbound: Outbound,
    turn_id: u64,
    cancel: CancellationToken,
) -> Result<(), AdapterError> {
    let mut first_error = None;
    loop {
        let sentence = tokio::select! {
            _ = cancel.cancelled() => break,
            s = sentences.recv() => match s {
                Some(s) => s,
                None => break,
            },
        };
        match stream_tts(&tts, &sentence, &voice, &outbound, turn_id, &cancel).await {
            Ok(()) => {}
            Err(AdapterError::Cancelled) => break,
            Err(e) => {
                // A failed sentence drops its audio; the reply text already
                // reached the client as tokens
                warn!("tts synthesis failed for sentence: {}", e);
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }
    }
    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Drive one turn to a terminal phase. Every outbound event for the turn is
/// emitted from this task (the TTS worker included, joined before any
/// terminal event), which is what makes the per-turn ordering guarantees
/// hold.
pub async fn run_turn(mut ctx: TurnContext, input: TurnInput) -> TurnPhase {
    let turn_id = ctx.turn_id;
    let started = Instant::now();
    let mut phase = TurnPhase::Idle;
    let mut advance = move |next: TurnPhase| {
        debug!("turn {}: {:?} -> {:?}", turn_id, phase, next);
        phase = next;
    };

    // Fail fast while the breaker cooldown is running
    {
        let mut core = ctx.core.lock().await;
        if core.breaker.is_open() {
            ctx.outbound.send(ServerEvent::Error {
                message: "temporary difficulty reaching the voice service, please try again in a moment"
                    .to_string(),
            });
            return TurnPhase::Failed;
        }
    }

    // ── Transcribing ─────────────────────────────────────────
    let user_text = match input {
        TurnInput::Text(text) => {
            ctx.outbound.send(ServerEvent::FinalTranscript {
                turn_id,
                text: text.clone(),
                latency_ms: 0,
            });
            text
        }
        TurnInput::Audio(pcm) => {
            advance(TurnPhase::Transcribing);
            ctx.outbound.send(ServerEvent::SttProcessing { turn_id });
            if !has_speech(&pcm, ctx.config.speech_rms_threshold, ctx.config.min_speech_ms) {
                debug!("turn {}: below speech threshold, dropping", turn_id);
                return TurnPhase::Done;
            }

            let (partial_tx, mut partial_rx) = mpsc::channel::<String>(8);
            let partial_forwarder = {
                let outbound = ctx.outbound.clone();
                tokio::spawn(async move {
                    while let Some(text) = partial_rx.recv().await {
                        outbound.send(ServerEvent::PartialTranscript { turn_id, text });
                    }
                })
            };

            let stt = ctx.adapters.stt.clone();
            let result = tokio::select! {
                _ = ctx.cancel.cancelled() => {
                    partial_forwarder.abort();
                    return cancelled_exit(&ctx, None, "").await;
                }
                r = with_retry("stt", || {
                    stt.transcribe(
                        &pcm,
                        AudioFormat::Pcm16Mono16k,
                        None,
                        Some(partial_tx.clone()),
                    )
                }) => r,
            };
            drop(partial_tx);
            let _ = partial_forwarder.await;

            match result {
                Ok(text) if text.trim().is_empty() => {
                    debug!("turn {}: empty transcript", turn_id);
                    return TurnPhase::Done;
                }
                Ok(text) => {
                    let text = text.trim().to_string();
                    ctx.outbound.send(ServerEvent::FinalTranscript {
                        turn_id,
                        text: text.clone(),
                        latency_ms: started.elapsed().as_millis() as u64,
                    });
                    text
                }
                Err(AdapterError::PermanentInput(e)) => {
                    debug!("turn {}: unusable audio: {}", turn_id, e);
                    return TurnPhase::Done;
                }
                Err(e) => return failed_exit(&ctx, "stt", e).await,
            }
        }
    };

    // ── Routing ──────────────────────────────────────────────
    advance(TurnPhase::Routing);
    let transfer = {
        let core = ctx.core.lock().await;
        router::route(&user_text, core.agents.current())
    };

    if let Some(target) = transfer {
        info!("turn {}: transfer to {}", turn_id, target);
        ctx.outbound.send(ServerEvent::AgentChange {
            agent: target.as_str().to_string(),
        });

        // The outgoing persona speaks the acknowledgement before the new
        // persona says anything
        let outgoing_voice = {
            let core = ctx.core.lock().await;
            core.agents.current_persona().voice_id.clone()
        };
        let ack = AgentManager::transfer_ack(target);
        match stream_tts(
            &ctx.adapters.tts,
            ack,
            &outgoing_voice,
            &ctx.outbound,
            turn_id,
            &ctx.cancel,
        )
        .await
        {
            Ok(()) => {}
            Err(AdapterError::Cancelled) => {
                return cancelled_exit(&ctx, Some(user_text.as_str()), "").await;
            }
            Err(e) => warn!("turn {}: transfer ack synthesis failed: {}", turn_id, e),
        }

        let mut core = ctx.core.lock().await;
        let snapshot = core.state.render_context();
        let note = AgentManager::handoff_note(&snapshot, &user_text, target);
        core.agents.switch(target);
        core.pending_handoff = Some(note);
    } else {
        // ── ModeratingIn ─────────────────────────────────────
        advance(TurnPhase::ModeratingIn);
        let verdict = ctx.adapters.moderation.check(&user_text).await;
        if let Verdict::Blocked { reason } = verdict {
            info!("turn {}: input blocked: {}", turn_id, reason);
            ctx.outbound.send(ServerEvent::GuardrailBlocked { reason });
            return TurnPhase::Blocked;
        }
    }

    if ctx.cancel.is_cancelled() {
        return cancelled_exit(&ctx, Some(user_text.as_str()), "").await;
    }

    // ── Generating ───────────────────────────────────────────
    advance(TurnPhase::Generating);
    let (messages, voice, agent) = {
        let mut core = ctx.core.lock().await;
        let snapshot = core.state.render_context();
        let handoff = core.pending_handoff.take();
        let messages = core
            .agents
            .build_messages(&snapshot, &user_text, handoff.as_ref());
        (
            messages,
            core.agents.current_persona().voice_id.clone(),
            core.agents.current(),
        )
    };

    let llm = ctx.adapters.llm.clone();
    let model = ctx.config.llm_model.clone();
    let max_tokens = ctx.config.max_tokens;
    let stream_result = tokio::select! {
        _ = ctx.cancel.cancelled() => {
            return cancelled_exit(&ctx, Some(user_text.as_str()), "").await;
        }
        r = with_retry("llm", || {
            llm.stream(&messages, &model, max_tokens, ctx.cancel.clone())
        }) => r,
    };
    let mut tokens = match stream_result {
        Ok(s) => s,
        Err(e) => return failed_exit(&ctx, "llm", e).await,
    };

    let tts_cancel = ctx.cancel.child_token();
    let (sentence_tx, sentence_rx) = mpsc::channel::<String>(16);
    let worker = tokio::spawn(tts_worker(
        ctx.adapters.tts.clone(),
        voice,
        sentence_rx,
        ctx.outbound.clone(),
        turn_id,
        tts_cancel.clone(),
    ));

    let mut reply = String::new();
    let mut sentences = SentenceBuffer::new();
    let mut stream_error = None;
    loop {
        let token = tokio::select! {
            _ = ctx.cancel.cancelled() => {
                drop(sentence_tx);
                let _ = worker.await;
                return cancelled_exit(&ctx, Some(user_text.as_str()), &reply).await;
            }
            t = tokens.recv() => t,
        };
        match token {
            Some(Ok(token)) => {
                ctx.outbound.send(ServerEvent::LlmToken {
                    turn_id,
                    token: token.clone(),
                });
                reply.push_str(&token);
                for sentence in sentences.push(&token) {
                    if sentence_tx.send(sentence).await.is_err() {
                        break;
                    }
                }
            }
            Some(Err(e)) => {
                stream_error = Some(e);
                break;
            }
            None => break,
        }
    }

    if let Some(e) = stream_error {
        tts_cancel.cancel();
        drop(sentence_tx);
        let _ = worker.await;
        return failed_exit(&ctx, "llm", e).await;
    }

    // ── Output moderation of the completed reply ─────────────
    let verdict = ctx.adapters.moderation.check(&reply).await;
    if let Verdict::Blocked { reason } = verdict {
        info!("turn {}: output blocked: {}", turn_id, reason);
        // Drop remaining synthesis; audio already sent is not recalled
        tts_cancel.cancel();
        drop(sentence_tx);
        let _ = worker.await;
        ctx.outbound.send(ServerEvent::GuardrailBlocked { reason });
        let mut core = ctx.core.lock().await;
        core.state.append_turn(Speaker::User, &user_text);
        core.state.update_from_user(&user_text);
        core.state.refresh_summary();
        return TurnPhase::Blocked;
    }

    // Finalize the pending sentence, then let the worker drain
    if let Some(rest) = sentences.flush() {
        let _ = sentence_tx.send(rest).await;
    }
    drop(sentence_tx);
    let worker_result = worker.await;
    if let Ok(Err(e)) = worker_result {
        let mut core = ctx.core.lock().await;
        core.breaker.record_failure(&e);
    }

    if ctx.cancel.is_cancelled() {
        return cancelled_exit(&ctx, Some(user_text.as_str()), &reply).await;
    }

    ctx.outbound.send(ServerEvent::TtsDone { turn_id });

    // ── Speaking ─────────────────────────────────────────────
    advance(TurnPhase::Speaking);
    {
        let mut core = ctx.core.lock().await;
        core.deaf_until = Some(Instant::now() + ctx.config.deaf_window);
    }
    tokio::select! {
        _ = ctx.cancel.cancelled() => {
            return cancelled_exit(&ctx, Some(user_text.as_str()), &reply).await;
        }
        _ = ctx.playback_done.recv() => {}
    }

    // ── Done: commit ─────────────────────────────────────────
    let mut core = ctx.core.lock().await;
    core.state.append_turn(Speaker::User, &user_text);
    core.state.update_from_user(&user_text);
    if !reply.is_empty() {
        core.state.append_turn(Speaker::from(agent), &reply);
        core.state.update_from_agent(&reply);
        core.state.mark_agent_seen(agent);
    }
    core.state.refresh_summary();
    core.breaker.record_success();
    ctx.outbound.send(ServerEvent::StateUpdate {
        state: core.state.to_public_json(),
    });
    info!("turn {}: done in {:?}", turn_id, started.elapsed());
    TurnPhase::Done
}

/// Barge-in (or supersession) exit: ack, checkpoint the partial reply so the
/// next turn's context shows what was already said, extend the deaf window.
async fn cancelled_exit(
    ctx: &TurnContext,
    user_text: Option<&str>,
    partial_reply: &str,
) -> TurnPhase {
    ctx.outbound.send(ServerEvent::BargeInAck {
        turn_id: ctx.turn_id,
    });
    ctx.outbound.send(ServerEvent::CheckpointSaved {
        partial: partial_reply.to_string(),
    });

    let mut core = ctx.core.lock().await;
    if let Some(text) = user_text {
        core.state.append_turn(Speaker::User, text);
        core.state.update_from_user(text);
        if !partial_reply.is_empty() {
            let agent = core.agents.current();
            core.state.append_turn(Speaker::from(agent), partial_reply);
        }
        core.state.refresh_summary();
    }
    core.deaf_until = Some(Instant::now() + ctx.config.deaf_window);
    info!("turn {}: cancelled", ctx.turn_id);
    TurnPhase::Cancelled
}

/// Unrecoverable adapter failure: surface a typed error event, feed the
/// breaker, return to idle.
async fn failed_exit(ctx: &TurnContext, op: &str, err: AdapterError) -> TurnPhase {
    warn!("turn {}: {} failed: {}", ctx.turn_id, op, err);
    let opened = {
        let mut core = ctx.core.lock().await;
        core.breaker.record_failure(&err)
    };
    if opened {
        warn!("turn {}: circuit breaker opened", ctx.turn_id);
    }
    ctx.outbound.send(ServerEvent::Error {
        message: format!("{} is having temporary difficulty, please try again", op),
    });
    TurnPhase::Failed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sentence_buffer_terminators() {
        let mut buf = SentenceBuffer::new();
        let mut out = Vec::new();
        for token in ["Hel", "lo the", "re. How", " are you? Fi", "ne"] {
            out.extend(buf.push(token));
        }
        assert_eq!(out, vec!["Hello there.", "How are you?"]);
        assert_eq!(buf.flush().as_deref(), Some("Fine"));
        // buffer drained after flush
        assert_eq!(buf.flush(), None);
    }

    #[test]
    fn test_sentence_buffer_newline() {
        let mut buf = SentenceBuffer::new();
        let out = buf.push("first line\nsecond");
        assert_eq!(out, vec!["first line"]);
        assert_eq!(buf.flush().as_deref(), Some("second"));
    }

    #[test]
    fn test_sentence_buffer_soft_limit() {
        let mut buf = SentenceBuffer::new();
        let long = "word ".repeat(40);
        let out = buf.push(&long);
        assert!(!out.is_empty());
        for sentence in &out {
            assert!(sentence.len() <= SENTENCE_SOFT_LIMIT + 8);
        }
    }

    #[test]
    fn test_rms_energy() {
        assert_eq!(rms_energy(&[]), 0.0);
        assert!(rms_energy(&[1000, -1000, 1000, -1000]) > 900.0);
        assert!(rms_energy(&[0, 0, 0, 0]) < 1.0);
    }

    #[test]
    fn test_has_speech_rejects_silence() {
        // 500 ms of silence
        let silent = vec![0u8; 16_000];
        assert!(!has_speech(&silent, 200.0, MIN_SPEECH_MS));
    }

    #[test]
    fn test_has_speech_rejects_too_short() {
        // 100 ms of loud audio is below MIN_SPEECH_MS
        let mut pcm = Vec::new();
        for _ in 0..1600 {
            pcm.extend_from_slice(&8000i16.to_le_bytes());
        }
        assert!(!has_speech(&pcm, 200.0, MIN_SPEECH_MS));
    }

    #[test]
    fn test_has_speech_accepts_voice() {
        // 400 ms of loud audio
        let mut pcm = Vec::new();
        for _ in 0..6400 {
            pcm.extend_from_slice(&8000i16.to_le_bytes());
        }
        assert!(has_speech(&pcm, 200.0, MIN_SPEECH_MS));
    }

    #[test]
    fn test_phase_terminality() {
        assert!(TurnPhase::Done.is_terminal());
        assert!(TurnPhase::Cancelled.is_terminal());
        assert!(TurnPhase::Blocked.is_terminal());
        assert!(TurnPhase::Failed.is_terminal());
        assert!(!TurnPhase::Generating.is_terminal());
        assert!(!TurnPhase::Speaking.is_terminal());
    }
}
