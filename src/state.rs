//! Per-session conversation memory
//!
//! Structured project state, a rolling summary and a recent transcript tail,
//! carried across turns and agent transfers. Extraction is deterministic
//! regex/keyword matching; no model call is ever made from here.

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use std::collections::VecDeque;

use crate::agents::AgentId;

/// Number of verbatim transcript entries retained for prompt context
pub const N_TAIL: usize = 12;

/// Cap on the rolling summary length
const SUMMARY_MAX_CHARS: usize = 240;

/// Caps on extracted lists
const MAX_GOALS: usize = 8;
const MAX_OPEN_QUESTIONS: usize = 8;

static ROOM_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(living room|laundry room|kitchen|bathroom|bedroom|basement|garage|attic|closet|deck)\b",
    )
    .expect("room regex")
});

static BUDGET_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\$\d+(?:k|K|,\d{3})?|\b\d+\s?(?:k\b|thousand|dollars)").expect("budget regex")
});

static TIMELINE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b\d+\s?(?:days?|weeks?|months?)\b").expect("timeline regex"));

static DIY_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(myself|diy|contractor|hiring|hire)\b").expect("diy regex"));

static WANT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(?:i want|i'd like|we want|we'd like|i'm looking|looking to|hoping to|i plan to|we plan to)\s+([^.!?\n]+)",
    )
    .expect("want regex")
});

static DECISION_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(?:let's go with|we'll go with|let's do|we'll do|i've decided on|i decided on|we've decided on)\s+([^.!?,\n]+)",
    )
    .expect("decision regex")
});

/// Phrases in agent replies that flag a project risk
const RISK_KEYWORDS: &[&str] = &[
    "load-bearing",
    "electrical panel",
    "lead paint",
    "asbestos",
    "permit",
    "inspection",
    "structural",
    "mold",
];

/// Material vocabulary, longer phrases first so a phrase match suppresses
/// its substring
const MATERIAL_KEYWORDS: &[&str] = &[
    "butcher block",
    "subway tile",
    "granite",
    "quartz",
    "hardwood",
    "laminate",
    "marble",
    "drywall",
    "plywood",
    "tile",
];

/// Who spoke a transcript entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Speaker {
    User,
    Bob,
    Alice,
    System,
}

impl Speaker {
    pub fn as_str(&self) -> &'static str {
        match self {
            Speaker::User => "user",
            Speaker::Bob => "bob",
            Speaker::Alice => "alice",
            Speaker::System => "system",
        }
    }
}

impl From<AgentId> for Speaker {
    fn from(agent: AgentId) -> Self {
        match agent {
            AgentId::Bob => Speaker::Bob,
            AgentId::Alice => Speaker::Alice,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TranscriptEntry {
    pub speaker: Speaker,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

/// Recognized project facts
#[derive(Debug, Clone, Default, Serialize)]
pub struct ProjectState {
    pub room: Option<String>,
    pub budget: Option<String>,
    pub timeline: Option<String>,
    pub diy_or_contractor: Option<String>,
    pub goals: Vec<String>,
    pub constraints: Vec<String>,
}

/// Frozen view of the state used to build prompts. Cheap to clone; mutations
/// to the live state after the snapshot do not leak into an in-flight turn.
#[derive(Debug, Clone)]
pub struct StateSnapshot {
    pub project: ProjectState,
    pub open_questions: Vec<String>,
    pub risks: Vec<String>,
    pub summary: String,
    pub recent_transcript: String,
    pub agent_seen: Vec<AgentId>,
}

impl StateSnapshot {
    pub fn project_json(&self) -> serde_json::Value {
        serde_json::to_value(&self.project).unwrap_or_default()
    }

    pub fn has_seen(&self, agent: AgentId) -> bool {
        self.agent_seen.contains(&agent)
    }
}

/// Per-session conversation state. Owned exclusively by the session; never
/// shared across sessions.
#[derive(Debug, Default)]
pub struct ConversationState {
    project: ProjectState,
    open_questions: Vec<String>,
    risks: Vec<String>,
    decisions: Vec<String>,
    materials_discussed: Vec<String>,
    summary: String,
    transcript_tail: VecDeque<TranscriptEntry>,
    agent_seen: Vec<AgentId>,
}

/// Append `value` unless an entry already matches case-insensitively.
/// Insertion order is preserved.
fn push_unique(list: &mut Vec<String>, value: &str) -> bool {
    let v = value.trim();
    if v.is_empty() {
        return false;
    }
    if list.iter().any(|x| x.eq_ignore_ascii_case(v)) {
        return false;
    }
    list.push(v.to_string());
    true
}

fn truncate_chars(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        text.to_string()
    } else {
        text.chars().take(max).collect()
    }
}

impl ConversationState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one completed turn to the tail, evicting the oldest entry when
    /// the tail exceeds `N_TAIL`.
    pub fn append_turn(&mut self, speaker: Speaker, text: &str) {
        self.transcript_tail.push_back(TranscriptEntry {
            speaker,
            text: text.to_string(),
            timestamp: Utc::now(),
        });
        while self.transcript_tail.len() > N_TAIL {
            self.transcript_tail.pop_front();
        }
    }

    pub fn mark_agent_seen(&mut self, agent: AgentId) {
        if !self.agent_seen.contains(&agent) {
            self.agent_seen.push(agent);
        }
    }

    pub fn has_seen(&self, agent: AgentId) -> bool {
        self.agent_seen.contains(&agent)
    }

    /// Best-effort extraction from a user utterance.
    pub fn update_from_user(&mut self, text: &str) {
        if self.project.room.is_none() {
            if let Some(m) = ROOM_RE.find(text) {
                self.project.room = Some(m.as_str().to_lowercase());
            }
        }
        if self.project.budget.is_none() {
            if let Some(m) = BUDGET_RE.find(text) {
                self.project.budget = Some(m.as_str().to_string());
            }
        }
        if self.project.timeline.is_none() {
            if let Some(m) = TIMELINE_RE.find(text) {
                self.project.timeline = Some(m.as_str().to_string());
            }
        }
        if self.project.diy_or_contractor.is_none() {
            if let Some(m) = DIY_RE.find(text) {
                let normalized = match m.as_str().to_lowercase().as_str() {
                    "myself" | "diy" => "diy",
                    _ => "contractor",
                };
                self.project.diy_or_contractor = Some(normalized.to_string());
            }
        }

        for caps in WANT_RE.captures_iter(text) {
            for snippet in split_goal_clause(&caps[1]) {
                if self.project.goals.len() >= MAX_GOALS {
                    break;
                }
                push_unique(&mut self.project.goals, &snippet);
            }
        }

        for caps in DECISION_RE.captures_iter(text) {
            push_unique(&mut self.decisions, caps[1].trim());
        }

        self.extract_materials(text);
    }

    /// Best-effort extraction from an agent reply.
    pub fn update_from_agent(&mut self, text: &str) {
        let lower = text.to_lowercase();
        for keyword in RISK_KEYWORDS {
            if lower.contains(keyword) {
                push_unique(&mut self.risks, keyword);
            }
        }

        // Questions the agent asked stay open until the conversation moves on
        for sentence in split_sentences(text) {
            if sentence.ends_with('?')
                && sentence.len() <= 80
                && self.open_questions.len() < MAX_OPEN_QUESTIONS
            {
                push_unique(&mut self.open_questions, &sentence);
            }
        }

        self.extract_materials(text);
    }

    fn extract_materials(&mut self, text: &str) {
        let lower = text.to_lowercase();
        let mut matched: Vec<&str> = Vec::new();
        for keyword in MATERIAL_KEYWORDS {
            if lower.contains(keyword) && !matched.iter().any(|m| m.contains(keyword)) {
                matched.push(keyword);
            }
        }
        for keyword in matched {
            push_unique(&mut self.materials_discussed, keyword);
        }
    }

    /// Regenerate the rolling summary from project facts and risks.
    pub fn refresh_summary(&mut self) {
        let room = self.project.room.as_deref().unwrap_or("home");
        let budget = self.project.budget.as_deref().unwrap_or("unset");
        let goals = if self.project.goals.is_empty() {
            "tbd".to_string()
        } else {
            self.project.goals.join(", ")
        };
        let risks = if self.risks.is_empty() {
            "none".to_string()
        } else {
            self.risks.join(", ")
        };
        let summary = format!(
            "Renovating {}, budget {}, wants: {}. risks: {}.",
            room, budget, goals, risks
        );
        self.summary = truncate_chars(&summary, SUMMARY_MAX_CHARS);
    }

    /// Frozen snapshot for prompt assembly.
    pub fn render_context(&self) -> StateSnapshot {
        let recent_transcript = self
            .transcript_tail
            .iter()
            .map(|e| format!("{}: {}", e.speaker.as_str(), e.text))
            .collect::<Vec<_>>()
            .join("\n");
        StateSnapshot {
            project: self.project.clone(),
            open_questions: self.open_questions.clone(),
            risks: self.risks.clone(),
            summary: self.summary.clone(),
            recent_transcript,
            agent_seen: self.agent_seen.clone(),
        }
    }

    /// Payload for the `state_update` event.
    pub fn to_public_json(&self) -> serde_json::Value {
        serde_json::json!({
            "project": self.project,
            "open_questions": self.open_questions,
            "risks": self.risks,
            "decisions": self.decisions,
            "materials_discussed": self.materials_discussed,
            "summary": self.summary,
            "agent_seen": self.agent_seen,
        })
    }

    pub fn tail(&self) -> impl Iterator<Item = &TranscriptEntry> {
        self.transcript_tail.iter()
    }

    pub fn tail_len(&self) -> usize {
        self.transcript_tail.len()
    }
}

/// Split the tail of a want-clause into candidate goal snippets.
fn split_goal_clause(clause: &str) -> Vec<String> {
    clause
        .split(',')
        .flat_map(|part| part.split(" and "))
        .map(strip_goal_fillers)
        .filter(|s| (3..=48).contains(&s.len()))
        // Budget fragments are captured by the budget extractor, not goals
        .filter(|s| !BUDGET_RE.is_match(s))
        .collect()
}

fn strip_goal_fillers(part: &str) -> String {
    let mut s = part.trim();
    loop {
        let before = s;
        for filler in ["maybe ", "also ", "probably ", "to ", "a ", "an ", "some "] {
            if let Some(rest) = s.strip_prefix(filler) {
                s = rest.trim_start();
            }
        }
        if s == before {
            break;
        }
    }
    s.trim_end_matches(['.', '!', '?']).trim().to_string()
}

fn split_sentences(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    for ch in text.chars() {
        current.push(ch);
        if matches!(ch, '.' | '!' | '?') {
            let trimmed = current.trim().to_string();
            if trimmed.len() > 1 {
                out.push(trimmed);
            }
            current.clear();
        }
    }
    let trimmed = current.trim().to_string();
    if trimmed.len() > 1 {
        out.push(trimmed);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intake_extraction() {
        let mut state = ConversationState::new();
        state.update_from_user(
            "Hi Bob, I want to remodel my kitchen. Budget is around $25k. \
             I want new cabinets and countertops, and maybe open up a wall.",
        );
        assert_eq!(state.project.room.as_deref(), Some("kitchen"));
        assert_eq!(state.project.budget.as_deref(), Some("$25k"));
        let cabinets = state
            .project
            .goals
            .iter()
            .position(|g| g == "new cabinets")
            .expect("new cabinets goal");
        let counters = state
            .project
            .goals
            .iter()
            .position(|g| g == "countertops")
            .expect("countertops goal");
        assert!(cabinets < counters, "insertion order preserved");
        assert!(state.project.goals.iter().any(|g| g == "open up a wall"));
    }

    #[test]
    fn test_first_room_wins() {
        let mut state = ConversationState::new();
        state.update_from_user("The kitchen needs work");
        state.update_from_user("Actually the bathroom too");
        assert_eq!(state.project.room.as_deref(), Some("kitchen"));
    }

    #[test]
    fn test_budget_variants() {
        for (text, expected) in [
            ("budget is $25k", "$25k"),
            ("around $3,000 total", "$3,000"),
            ("we have 30 thousand", "30 thousand"),
            ("maybe 12k for this", "12k"),
        ] {
            let mut state = ConversationState::new();
            state.update_from_user(text);
            assert_eq!(state.project.budget.as_deref(), Some(expected), "{}", text);
        }
    }

    #[test]
    fn test_timeline_and_diy() {
        let mut state = ConversationState::new();
        state.update_from_user("Hoping to finish in 6 weeks, doing it myself");
        assert_eq!(state.project.timeline.as_deref(), Some("6 weeks"));
        assert_eq!(state.project.diy_or_contractor.as_deref(), Some("diy"));
    }

    #[test]
    fn test_risk_extraction_from_agent() {
        let mut state = ConversationState::new();
        state.update_from_agent(
            "Opening that wall may hit a load-bearing member, and you will need a permit.",
        );
        assert_eq!(state.risks, vec!["load-bearing", "permit"]);
    }

    #[test]
    fn test_case_insensitive_dedup() {
        let mut state = ConversationState::new();
        state.update_from_agent("You need a PERMIT for that.");
        state.update_from_agent("Yes, a permit.");
        assert_eq!(state.risks.len(), 1);
    }

    #[test]
    fn test_open_questions_from_agent() {
        let mut state = ConversationState::new();
        state.update_from_agent("Sounds good. Do you know if the wall is load-bearing?");
        assert_eq!(
            state.open_questions,
            vec!["Do you know if the wall is load-bearing?"]
        );
    }

    #[test]
    fn test_materials_phrase_suppresses_substring() {
        let mut state = ConversationState::new();
        state.update_from_user("Thinking subway tile for the backsplash");
        assert_eq!(state.materials_discussed, vec!["subway tile"]);
    }

    #[test]
    fn test_tail_eviction() {
        let mut state = ConversationState::new();
        for i in 0..15 {
            state.append_turn(Speaker::User, &format!("message {}", i));
        }
        assert_eq!(state.tail_len(), N_TAIL);
        assert_eq!(state.tail().next().unwrap().text, "message 3");
    }

    #[test]
    fn test_summary_template() {
        let mut state = ConversationState::new();
        state.update_from_user("I want new cabinets for my kitchen, budget $25k");
        state.update_from_agent("Watch out for the electrical panel relocation.");
        state.refresh_summary();
        assert_eq!(
            state.summary,
            "Renovating kitchen, budget $25k, wants: new cabinets for my kitchen. risks: electrical panel."
        );
    }

    #[test]
    fn test_summary_clamped() {
        let mut state = ConversationState::new();
        for i in 0..8 {
            state
                .project
                .goals
                .push(format!("a rather long renovation goal number {}", i));
        }
        state.refresh_summary();
        assert!(state.summary.chars().count() <= SUMMARY_MAX_CHARS);
    }

    #[test]
    fn test_agent_seen_monotonic() {
        let mut state = ConversationState::new();
        state.mark_agent_seen(AgentId::Bob);
        state.mark_agent_seen(AgentId::Alice);
        state.mark_agent_seen(AgentId::Bob);
        assert_eq!(state.render_context().agent_seen, vec![AgentId::Bob, AgentId::Alice]);
    }

    #[test]
    fn test_snapshot_is_frozen() {
        let mut state = ConversationState::new();
        state.update_from_user("kitchen remodel, $10k");
        let snapshot = state.render_context();
        state.update_from_user("budget actually 20 thousand");
        assert_eq!(snapshot.project.budget.as_deref(), Some("$10k"));
    }

    #[test]
    fn test_decision_extraction() {
        let mut state = ConversationState::new();
        state.update_from_user("Let's go with quartz for the counters");
        assert_eq!(state.decisions, vec!["quartz for the counters"]);
        assert_eq!(state.materials_discussed, vec!["quartz"]);
    }
}
