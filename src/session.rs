//! Per-connection session: event demux and turn lifecycle
//!
//! One session owns one client connection. The demux loop never blocks on an
//! in-flight turn: turns run as child tasks and are superseded (cancelled)
//! by `barge_in` or by the next utterance. All outbound traffic goes through
//! a bounded queue; a full queue means a stalled client and closes the
//! session.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::adapters::{AdapterSet, CircuitBreaker};
use crate::agents::{AgentManager, HandoffNote};
use crate::config::Config;
use crate::protocol::{ClientEvent, ServerEvent};
use crate::state::{ConversationState, Speaker};
use crate::turn::{self, TurnConfig, TurnContext, TurnInput, TurnPhase};

/// Outbound queue capacity; overflowing it closes the session
pub const OUTBOUND_CAPACITY: usize = 256;

/// Idle window before the current persona nudges the user
const INACTIVITY_TIMEOUT: Duration = Duration::from_secs(30);

/// Turn id used for connection-scoped audio (greeting, nudges)
const SESSION_TURN_ID: u64 = 0;

/// Session-scoped mutable interior shared with turn tasks. Never shared
/// across sessions.
pub struct SharedCore {
    pub state: ConversationState,
    pub agents: AgentManager,
    pub pending_handoff: Option<HandoffNote>,
    pub breaker: CircuitBreaker,
    pub deaf_until: Option<Instant>,
}

/// Non-blocking outbound event sender. `try_send` keeps the demux and turn
/// tasks from ever waiting on a stalled client; overflow cancels the session
/// token instead.
#[derive(Clone)]
pub struct Outbound {
    tx: mpsc::Sender<ServerEvent>,
    close: CancellationToken,
}

impl Outbound {
    pub fn new(tx: mpsc::Sender<ServerEvent>, close: CancellationToken) -> Self {
        Self { tx, close }
    }

    pub fn send(&self, event: ServerEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                error!(
                    "outbound queue full (capacity {}), closing stalled session; dropped {:?}",
                    OUTBOUND_CAPACITY,
                    event.turn_id()
                );
                self.close.cancel();
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }
}

/// SDP/ICE messages relayed to an external WebRTC subsystem
#[derive(Debug, Clone)]
pub enum SignalingEvent {
    Offer { sdp: String },
    Candidate { candidate: serde_json::Value },
}

struct ActiveTurn {
    id: u64,
    cancel: CancellationToken,
    playback_tx: mpsc::Sender<()>,
    handle: JoinHandle<TurnPhase>,
}

pub struct Session {
    id: String,
    adapters: AdapterSet,
    core: Arc<Mutex<SharedCore>>,
    outbound: Outbound,
    close: CancellationToken,
    turn_config: TurnConfig,
    turn_counter: u64,
    active: Option<ActiveTurn>,
    audio_buf: Vec<u8>,
    last_activity: Instant,
    done_tx: mpsc::Sender<(u64, TurnPhase)>,
    done_rx: mpsc::Receiver<(u64, TurnPhase)>,
    signaling: Option<mpsc::Sender<SignalingEvent>>,
}

impl Session {
    /// Build a session and hand back the receiving end of its outbound
    /// queue. The caller (WS glue or a test harness) drains it.
    pub fn new(adapters: AdapterSet, config: &Config) -> (Self, mpsc::Receiver<ServerEvent>) {
        let id = uuid::Uuid::new_v4().to_string();
        let close = CancellationToken::new();
        let (out_tx, out_rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let (done_tx, done_rx) = mpsc::channel(8);

        let core = SharedCore {
            state: ConversationState::new(),
            agents: AgentManager::new(
                config.tts.voice_bob.as_str(),
                config.tts.voice_alice.as_str(),
            ),
            pending_handoff: None,
            breaker: CircuitBreaker::new(),
            deaf_until: None,
        };

        let session = Self {
            id,
            adapters,
            core: Arc::new(Mutex::new(core)),
            outbound: Outbound::new(out_tx, close.clone()),
            close,
            turn_config: TurnConfig {
                llm_model: config.llm.model.clone(),
                max_tokens: config.llm.max_tokens,
                speech_rms_threshold: config.vad.speech_threshold,
                min_speech_ms: turn::MIN_SPEECH_MS,
                deaf_window: Duration::from_millis(config.vad.silence_ms),
            },
            turn_counter: 0,
            active: None,
            audio_buf: Vec::new(),
            last_activity: Instant::now(),
            done_tx,
            done_rx,
            signaling: None,
        };
        (session, out_rx)
    }

    /// Attach an external WebRTC signaling sink for SDP/ICE relay.
    pub fn with_signaling_sink(mut self, sink: mpsc::Sender<SignalingEvent>) -> Self {
        self.signaling = Some(sink);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Sender half of the outbound queue, for callers that need to emit
    /// events from outside a turn (the WS glue's protocol errors).
    pub fn outbound(&self) -> Outbound {
        self.outbound.clone()
    }

    /// Token that ends this session when cancelled (queue overflow, server
    /// shutdown).
    pub fn close_token(&self) -> CancellationToken {
        self.close.clone()
    }

    /// Demux loop: runs until the inbound channel closes or the session is
    /// cancelled.
    pub async fn run(mut self, mut inbound: mpsc::Receiver<ClientEvent>) {
        info!("session {} connected", self.id);
        self.greet().await;

        loop {
            let idle_deadline = self.last_activity + INACTIVITY_TIMEOUT;
            tokio::select! {
                _ = self.close.cancelled() => {
                    debug!("session {} close requested", self.id);
                    break;
                }
                event = inbound.recv() => match event {
                    Some(event) => self.handle_event(event).await,
                    None => break,
                },
                finished = self.done_rx.recv() => {
                    if let Some((id, phase)) = finished {
                        self.on_turn_finished(id, phase);
                    }
                }
                _ = tokio::time::sleep_until(idle_deadline), if self.active.is_none() => {
                    self.nudge().await;
                }
            }
        }

        if let Some(active) = self.active.take() {
            active.cancel.cancel();
            let _ = active.handle.await;
        }
        info!("session {} disconnected", self.id);
    }

    /// Emit `connected`, speak the canned greeting in Bob's voice, and seed
    /// the transcript tail.
    async fn greet(&mut self) {
        let (agent, voice) = {
            let core = self.core.lock().await;
            (
                core.agents.current(),
                core.agents.current_persona().voice_id.clone(),
            )
        };
        self.outbound.send(ServerEvent::Connected {
            agent: agent.as_str().to_string(),
        });

        let greeting = AgentManager::greeting(agent);
        if let Err(e) = turn::stream_tts(
            &self.adapters.tts,
            greeting,
            &voice,
            &self.outbound,
            SESSION_TURN_ID,
            &self.close,
        )
        .await
        {
            warn!("session {}: greeting synthesis failed: {}", self.id, e);
        }
        self.outbound.send(ServerEvent::TtsDone {
            turn_id: SESSION_TURN_ID,
        });

        let mut core = self.core.lock().await;
        core.state.append_turn(Speaker::System, greeting);
        core.state.mark_agent_seen(agent);
        core.deaf_until = Some(Instant::now() + self.turn_config.deaf_window);
    }

    /// Canned re-engagement line from the current persona. No LLM call.
    async fn nudge(&mut self) {
        let (agent, voice) = {
            let core = self.core.lock().await;
            (
                core.agents.current(),
                core.agents.current_persona().voice_id.clone(),
            )
        };
        debug!("session {}: idle nudge from {}", self.id, agent);
        if let Err(e) = turn::stream_tts(
            &self.adapters.tts,
            AgentManager::nudge(agent),
            &voice,
            &self.outbound,
            SESSION_TURN_ID,
            &self.close,
        )
        .await
        {
            warn!("session {}: nudge synthesis failed: {}", self.id, e);
        }
        self.outbound.send(ServerEvent::TtsDone {
            turn_id: SESSION_TURN_ID,
        });
        {
            let mut core = self.core.lock().await;
            core.deaf_until = Some(Instant::now() + self.turn_config.deaf_window);
        }
        // Restart the idle window so the nudge does not re-fire immediately
        self.last_activity = Instant::now();
    }

    async fn handle_event(&mut self, event: ClientEvent) {
        self.last_activity = Instant::now();
        match event {
            ClientEvent::Ping => {
                self.outbound.send(ServerEvent::Pong);
            }
            ClientEvent::AudioChunk { data, .. } => {
                let deaf = {
                    let core = self.core.lock().await;
                    core.deaf_until
                        .map(|until| Instant::now() < until)
                        .unwrap_or(false)
                };
                if deaf {
                    // Server-side echo guard mirroring the client's
                    debug!("session {}: discarding audio inside deaf window", self.id);
                    return;
                }
                match BASE64.decode(&data) {
                    Ok(bytes) => self.audio_buf.extend_from_slice(&bytes),
                    Err(e) => warn!("session {}: bad audio chunk: {}", self.id, e),
                }
            }
            ClientEvent::EndOfAudio { .. } => {
                let pcm = std::mem::take(&mut self.audio_buf);
                self.start_turn(TurnInput::Audio(pcm)).await;
            }
            ClientEvent::TextInput { text, .. } => {
                self.start_turn(TurnInput::Text(text)).await;
            }
            ClientEvent::BargeIn { .. } => {
                info!("session {}: barge-in", self.id);
                if let Some(active) = &self.active {
                    active.cancel.cancel();
                }
                let mut core = self.core.lock().await;
                core.deaf_until = Some(Instant::now() + self.turn_config.deaf_window);
            }
            ClientEvent::TtsPlaybackDone => {
                if let Some(active) = &self.active {
                    let _ = active.playback_tx.try_send(());
                }
            }
            ClientEvent::WebrtcOffer { sdp } => match &self.signaling {
                Some(sink) => {
                    let _ = sink.try_send(SignalingEvent::Offer { sdp });
                }
                None => debug!("session {}: webrtc offer with no signaling sink", self.id),
            },
            ClientEvent::IceCandidate { candidate } => match &self.signaling {
                Some(sink) => {
                    let _ = sink.try_send(SignalingEvent::Candidate { candidate });
                }
                None => debug!("session {}: ice candidate with no signaling sink", self.id),
            },
        }
    }

    /// Spawn the next turn, superseding any active one. The superseded turn
    /// is joined first so its terminal events and state commit land before
    /// anything from the new turn (commits stay in turn-id order).
    async fn start_turn(&mut self, input: TurnInput) {
        if let Some(prev) = self.active.take() {
            debug!(
                "session {}: turn {} superseded by new input",
                self.id, prev.id
            );
            prev.cancel.cancel();
            let _ = prev.handle.await;
        }

        self.turn_counter += 1;
        let turn_id = self.turn_counter;
        let cancel = self.close.child_token();
        let (playback_tx, playback_rx) = mpsc::channel(1);

        let ctx = TurnContext {
            turn_id,
            adapters: self.adapters.clone(),
            core: self.core.clone(),
            outbound: self.outbound.clone(),
            config: self.turn_config.clone(),
            cancel: cancel.clone(),
            playback_done: playback_rx,
        };
        let done_tx = self.done_tx.clone();
        let handle = tokio::spawn(async move {
            let phase = turn::run_turn(ctx, input).await;
            let _ = done_tx.send((turn_id, phase)).await;
            phase
        });

        self.active = Some(ActiveTurn {
            id: turn_id,
            cancel,
            playback_tx,
            handle,
        });
    }

    fn on_turn_finished(&mut self, turn_id: u64, phase: TurnPhase) {
        debug!(
            "session {}: turn {} finished in {:?}",
            self.id, turn_id, phase
        );
        if self
            .active
            .as_ref()
            .map(|a| a.id == turn_id)
            .unwrap_or(false)
        {
            self.active = None;
            // Idle window starts when the session returns to idle
            self.last_activity = Instant::now();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_outbound_overflow_closes_session() {
        let close = CancellationToken::new();
        let (tx, _rx) = mpsc::channel(2);
        let outbound = Outbound::new(tx, close.clone());
        outbound.send(ServerEvent::Pong);
        outbound.send(ServerEvent::Pong);
        assert!(!close.is_cancelled());
        outbound.send(ServerEvent::Pong);
        assert!(close.is_cancelled());
    }

    #[tokio::test]
    async fn test_outbound_tolerates_closed_receiver() {
        let close = CancellationToken::new();
        let (tx, rx) = mpsc::channel(2);
        drop(rx);
        let outbound = Outbound::new(tx, close.clone());
        outbound.send(ServerEvent::Pong);
        assert!(!close.is_cancelled());
    }
}
