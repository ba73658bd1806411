//! Client/server event envelope
//!
//! One JSON object per WebSocket text frame, tagged by `type`. Inbound events
//! may carry optional `turn_id` and `ts` fields; outbound events carry the
//! `turn_id` of the turn they belong to so the client can discard stale ones.

use serde::{Deserialize, Serialize};

/// Inbound message from the client
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum ClientEvent {
    #[serde(rename = "ping")]
    Ping,
    #[serde(rename = "audio_chunk")]
    AudioChunk {
        /// Base64 encoded PCM16LE 16 kHz mono
        data: String,
        #[serde(default)]
        turn_id: Option<u64>,
    },
    #[serde(rename = "end_of_audio")]
    EndOfAudio {
        #[serde(default)]
        turn_id: Option<u64>,
    },
    #[serde(rename = "text_input")]
    TextInput {
        text: String,
        #[serde(default)]
        turn_id: Option<u64>,
    },
    #[serde(rename = "barge_in")]
    BargeIn {
        #[serde(default)]
        turn_id: Option<u64>,
    },
    #[serde(rename = "tts_playback_done")]
    TtsPlaybackDone,
    #[serde(rename = "webrtc_offer")]
    WebrtcOffer { sdp: String },
    #[serde(rename = "ice_candidate")]
    IceCandidate { candidate: serde_json::Value },
}

/// Outbound message to the client
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum ServerEvent {
    #[serde(rename = "connected")]
    Connected { agent: String },
    #[serde(rename = "pong")]
    Pong,
    #[serde(rename = "stt_processing")]
    SttProcessing { turn_id: u64 },
    #[serde(rename = "partial_transcript")]
    PartialTranscript { turn_id: u64, text: String },
    #[serde(rename = "final_transcript")]
    FinalTranscript {
        turn_id: u64,
        text: String,
        latency_ms: u64,
    },
    #[serde(rename = "llm_token")]
    LlmToken { turn_id: u64, token: String },
    #[serde(rename = "tts_chunk")]
    TtsChunk {
        turn_id: u64,
        /// Base64 encoded audio chunk
        audio: String,
    },
    #[serde(rename = "tts_done")]
    TtsDone { turn_id: u64 },
    #[serde(rename = "agent_change")]
    AgentChange { agent: String },
    #[serde(rename = "barge_in_ack")]
    BargeInAck { turn_id: u64 },
    #[serde(rename = "checkpoint_saved")]
    CheckpointSaved { partial: String },
    #[serde(rename = "guardrail_blocked")]
    GuardrailBlocked { reason: String },
    #[serde(rename = "state_update")]
    StateUpdate { state: serde_json::Value },
    #[serde(rename = "error")]
    Error { message: String },
}

/// Result of parsing one inbound frame.
///
/// Unknown or malformed-but-tagged messages are reported for logging and
/// otherwise ignored; only an unparseable envelope is an error that should
/// close the session.
#[derive(Debug)]
pub enum Inbound {
    Event(ClientEvent),
    /// The frame was valid JSON but not a usable event. Carries the `type`
    /// tag (or "<untagged>") and the deserialization error text.
    Ignored { kind: String, detail: String },
}

/// Parse one inbound text frame.
pub fn parse_client_frame(raw: &str) -> Result<Inbound, serde_json::Error> {
    let value: serde_json::Value = serde_json::from_str(raw)?;
    match ClientEvent::deserialize(&value) {
        Ok(ev) => Ok(Inbound::Event(ev)),
        Err(e) => {
            let kind = value
                .get("type")
                .and_then(|t| t.as_str())
                .unwrap_or("<untagged>")
                .to_string();
            Ok(Inbound::Ignored {
                kind,
                detail: e.to_string(),
            })
        }
    }
}

impl ServerEvent {
    /// The turn this event belongs to, if any.
    pub fn turn_id(&self) -> Option<u64> {
        match self {
            ServerEvent::SttProcessing { turn_id }
            | ServerEvent::PartialTranscript { turn_id, .. }
            | ServerEvent::FinalTranscript { turn_id, .. }
            | ServerEvent::LlmToken { turn_id, .. }
            | ServerEvent::TtsChunk { turn_id, .. }
            | ServerEvent::TtsDone { turn_id }
            | ServerEvent::BargeInAck { turn_id } => Some(*turn_id),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_text_input() {
        let frame = r#"{"type":"text_input","text":"hello","turn_id":3}"#;
        match parse_client_frame(frame).unwrap() {
            Inbound::Event(ClientEvent::TextInput { text, turn_id }) => {
                assert_eq!(text, "hello");
                assert_eq!(turn_id, Some(3));
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_parse_ignores_unknown_type() {
        let frame = r#"{"type":"telemetry","fps":60}"#;
        match parse_client_frame(frame).unwrap() {
            Inbound::Ignored { kind, .. } => assert_eq!(kind, "telemetry"),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_parse_ignores_missing_field() {
        // Known tag but missing required field: logged and dropped, not fatal
        let frame = r#"{"type":"text_input"}"#;
        assert!(matches!(
            parse_client_frame(frame).unwrap(),
            Inbound::Ignored { .. }
        ));
    }

    #[test]
    fn test_parse_rejects_bad_envelope() {
        assert!(parse_client_frame("not json").is_err());
    }

    #[test]
    fn test_extra_fields_tolerated() {
        let frame = r#"{"type":"barge_in","turn_id":7,"ts":1722500000}"#;
        assert!(matches!(
            parse_client_frame(frame).unwrap(),
            Inbound::Event(ClientEvent::BargeIn { turn_id: Some(7) })
        ));
    }

    #[test]
    fn test_server_event_serialization() {
        let ev = ServerEvent::LlmToken {
            turn_id: 2,
            token: "hi".into(),
        };
        let json = serde_json::to_string(&ev).unwrap();
        assert!(json.contains(r#""type":"llm_token""#));
        assert!(json.contains(r#""turn_id":2"#));
    }

    #[test]
    fn test_turn_id_accessor() {
        assert_eq!(ServerEvent::TtsDone { turn_id: 5 }.turn_id(), Some(5));
        assert_eq!(ServerEvent::Pong.turn_id(), None);
        assert_eq!(
            ServerEvent::CheckpointSaved { partial: "x".into() }.turn_id(),
            None
        );
    }
}
