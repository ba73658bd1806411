//! Personas, prompt assembly and the handoff protocol
//!
//! Two fixed personas: Bob runs intake and planning, Alice handles the
//! technical side. The manager assembles LLM prompts from a frozen state
//! snapshot and renders the one-turn handoff note on transfer.

use serde::Serialize;
use std::fmt;

use crate::adapters::ChatMessage;
use crate::state::StateSnapshot;

/// Persona identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentId {
    Bob,
    Alice,
}

impl AgentId {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentId::Bob => "bob",
            AgentId::Alice => "alice",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            AgentId::Bob => "Bob",
            AgentId::Alice => "Alice",
        }
    }

    /// The other persona.
    pub fn other(&self) -> AgentId {
        match self {
            AgentId::Bob => AgentId::Alice,
            AgentId::Alice => AgentId::Bob,
        }
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

const BOB_SYSTEM_PROMPT: &str = r#"You are Bob, a friendly home-renovation intake and planning assistant in a real-time voice conversation. Your job is to understand the project: which room, the budget, the timeline, what the homeowner wants, and whether they plan to do the work themselves or hire out. Keep replies concise and actionable, one to three sentences, and always move the plan forward.

Never give advice that requires a licensed professional. Do not make structural judgements, electrical code rulings, plumbing code rulings, or permit determinations; recommend a licensed contractor, engineer or the local building department for those.

Do not use markdown, bullet points, or code blocks. Your replies are spoken aloud, so use natural speech."#;

const ALICE_SYSTEM_PROMPT: &str = r#"You are Alice, a technical renovation specialist in a real-time voice conversation. You cover construction sequencing, permits and inspections at a general level, material trade-offs, and project risks. Keep replies concise and actionable, one to three sentences, and flag risks early.

Never give advice that requires a licensed professional. Do not make structural judgements, electrical code rulings, plumbing code rulings, or permit determinations; recommend a licensed contractor, engineer or the local building department for those.

Do not use markdown, bullet points, or code blocks. Your replies are spoken aloud, so use natural speech."#;

/// One persona record
#[derive(Debug, Clone)]
pub struct Persona {
    pub id: AgentId,
    pub display_name: &'static str,
    pub voice_id: String,
    pub system_prompt: &'static str,
}

/// Transient transfer context, rendered into one system message for the
/// incoming agent and then discarded.
#[derive(Debug, Clone)]
pub struct HandoffNote {
    pub what_we_know: String,
    pub open_questions: Vec<String>,
    pub known_risks: Vec<String>,
    pub last_user_message: String,
    pub recommended_focus: String,
}

impl HandoffNote {
    pub fn render(&self) -> String {
        let open = if self.open_questions.is_empty() {
            "none".to_string()
        } else {
            self.open_questions.join("; ")
        };
        let risks = if self.known_risks.is_empty() {
            "none".to_string()
        } else {
            self.known_risks.join("; ")
        };
        format!(
            "Handoff from the previous agent.\n\
             What we know: {}\n\
             Open questions: {}\n\
             Known risks: {}\n\
             Last user message: \"{}\"\n\
             Recommended focus: {}\n\
             Continue immediately. Do not reintroduce yourself.",
            self.what_we_know, open, risks, self.last_user_message, self.recommended_focus
        )
    }
}

/// Holds the two persona records and the session's current agent.
#[derive(Debug)]
pub struct AgentManager {
    bob: Persona,
    alice: Persona,
    current: AgentId,
}

impl AgentManager {
    pub fn new(voice_bob: impl Into<String>, voice_alice: impl Into<String>) -> Self {
        Self {
            bob: Persona {
                id: AgentId::Bob,
                display_name: "Bob",
                voice_id: voice_bob.into(),
                system_prompt: BOB_SYSTEM_PROMPT,
            },
            alice: Persona {
                id: AgentId::Alice,
                display_name: "Alice",
                voice_id: voice_alice.into(),
                system_prompt: ALICE_SYSTEM_PROMPT,
            },
            current: AgentId::Bob,
        }
    }

    pub fn current(&self) -> AgentId {
        self.current
    }

    pub fn persona(&self, id: AgentId) -> &Persona {
        match id {
            AgentId::Bob => &self.bob,
            AgentId::Alice => &self.alice,
        }
    }

    pub fn current_persona(&self) -> &Persona {
        self.persona(self.current)
    }

    /// Flip the active persona. `agent_seen` is untouched; greeting
    /// suppression is driven by the state snapshot.
    pub fn switch(&mut self, target: AgentId) {
        self.current = target;
    }

    /// Assemble the LLM prompt: persona prompt, context message, optional
    /// handoff note, then the user message.
    pub fn build_messages(
        &self,
        snapshot: &StateSnapshot,
        user_text: &str,
        handoff: Option<&HandoffNote>,
    ) -> Vec<ChatMessage> {
        let persona = self.current_persona();
        let mut messages = Vec::with_capacity(4);
        messages.push(ChatMessage::system(persona.system_prompt));

        let seen_directive = if snapshot.has_seen(persona.id) {
            "\nYou have already spoken in this session. Do not greet the user again or reintroduce yourself."
        } else {
            ""
        };
        let context = format!(
            "Project state (JSON):\n{}\n\nRolling summary: {}\n\nRecent conversation:\n{}{}",
            snapshot.project_json(),
            if snapshot.summary.is_empty() {
                "(none yet)"
            } else {
                snapshot.summary.as_str()
            },
            if snapshot.recent_transcript.is_empty() {
                "(none yet)"
            } else {
                snapshot.recent_transcript.as_str()
            },
            seen_directive
        );
        messages.push(ChatMessage::system(context));

        if let Some(note) = handoff {
            messages.push(ChatMessage::system(note.render()));
        }

        messages.push(ChatMessage::user(user_text));
        messages
    }

    /// Pure handoff-note generation for a transfer to `target`.
    pub fn handoff_note(
        snapshot: &StateSnapshot,
        last_user_text: &str,
        target: AgentId,
    ) -> HandoffNote {
        let p = &snapshot.project;
        let mut facts = Vec::new();
        if let Some(room) = &p.room {
            facts.push(format!("room={}", room));
        }
        if let Some(budget) = &p.budget {
            facts.push(format!("budget={}", budget));
        }
        if let Some(timeline) = &p.timeline {
            facts.push(format!("timeline={}", timeline));
        }
        if let Some(mode) = &p.diy_or_contractor {
            facts.push(format!("approach={}", mode));
        }
        if !p.goals.is_empty() {
            facts.push(format!("goals: {}", p.goals.join(", ")));
        }
        let what_we_know = if facts.is_empty() {
            "nothing confirmed yet".to_string()
        } else {
            facts.join("; ")
        };

        let recommended_focus = match target {
            AgentId::Alice => {
                "address technical risks, permits, sequencing and material trade-offs".to_string()
            }
            AgentId::Bob => {
                "produce a homeowner-friendly checklist and next steps".to_string()
            }
        };

        HandoffNote {
            what_we_know,
            open_questions: snapshot.open_questions.clone(),
            known_risks: snapshot.risks.clone(),
            last_user_message: last_user_text.to_string(),
            recommended_focus,
        }
    }

    /// Acknowledgement sentence spoken by the outgoing persona's voice.
    pub fn transfer_ack(target: AgentId) -> &'static str {
        match target {
            AgentId::Alice => "Bringing Alice in. She can help with the technical details.",
            AgentId::Bob => "Taking you back to Bob. He can pull the plan together from here.",
        }
    }

    /// Canned connect greeting, spoken without an LLM call.
    pub fn greeting(id: AgentId) -> &'static str {
        match id {
            AgentId::Bob => "Hi, I'm Bob. Tell me about the renovation you have in mind.",
            AgentId::Alice => "Alice here. What technical questions can I look at?",
        }
    }

    /// Canned re-engagement line for the inactivity timer.
    pub fn nudge(id: AgentId) -> &'static str {
        match id {
            AgentId::Bob => "Still there? Happy to keep planning whenever you are ready.",
            AgentId::Alice => {
                "Still with me? I can walk through the technical side whenever you are ready."
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::ConversationState;

    fn snapshot_with_intake() -> StateSnapshot {
        let mut state = ConversationState::new();
        state.update_from_user("I want new cabinets for my kitchen. Budget is $25k.");
        state.update_from_agent("Opening a wall can hit a load-bearing member.");
        state.refresh_summary();
        state.render_context()
    }

    #[test]
    fn test_message_order_without_handoff() {
        let manager = AgentManager::new("alloy", "shimmer");
        let messages = manager.build_messages(&snapshot_with_intake(), "hello", None);
        assert_eq!(messages.len(), 3);
        assert!(messages[0].content.contains("You are Bob"));
        assert!(messages[1].content.contains("Project state (JSON)"));
        assert_eq!(messages[2].content, "hello");
    }

    #[test]
    fn test_handoff_note_in_messages() {
        let mut manager = AgentManager::new("alloy", "shimmer");
        let snapshot = snapshot_with_intake();
        let note =
            AgentManager::handoff_note(&snapshot, "Transfer me to Alice", AgentId::Alice);
        manager.switch(AgentId::Alice);
        let messages = manager.build_messages(&snapshot, "Transfer me to Alice", Some(&note));
        assert_eq!(messages.len(), 4);
        assert!(messages[0].content.contains("You are Alice"));
        assert!(messages[2].content.contains("Handoff from the previous agent"));
        assert!(messages[2].content.contains("Do not reintroduce yourself"));
    }

    #[test]
    fn test_handoff_note_carries_project_facts() {
        let snapshot = snapshot_with_intake();
        let note = AgentManager::handoff_note(&snapshot, "bring in alice", AgentId::Alice);
        assert!(note.what_we_know.contains("room=kitchen"));
        assert!(note.what_we_know.contains("budget=$25k"));
        assert_eq!(note.known_risks, vec!["load-bearing"]);
        assert!(note.recommended_focus.contains("permits"));

        let back = AgentManager::handoff_note(&snapshot, "back to bob", AgentId::Bob);
        assert!(back.recommended_focus.contains("checklist"));
    }

    #[test]
    fn test_seen_directive_suppresses_reintroduction() {
        let manager = AgentManager::new("alloy", "shimmer");
        let mut state = ConversationState::new();
        let before = manager.build_messages(&state.render_context(), "hi", None);
        assert!(!before[1].content.contains("Do not greet the user again"));

        state.mark_agent_seen(AgentId::Bob);
        let after = manager.build_messages(&state.render_context(), "hi", None);
        assert!(after[1].content.contains("Do not greet the user again"));
    }

    #[test]
    fn test_switch_keeps_voices() {
        let mut manager = AgentManager::new("alloy", "shimmer");
        assert_eq!(manager.current_persona().voice_id, "alloy");
        manager.switch(AgentId::Alice);
        assert_eq!(manager.current(), AgentId::Alice);
        assert_eq!(manager.current_persona().voice_id, "shimmer");
    }

    #[test]
    fn test_other() {
        assert_eq!(AgentId::Bob.other(), AgentId::Alice);
        assert_eq!(AgentId::Alice.other(), AgentId::Bob);
    }
}
