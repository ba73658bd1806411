//! Transfer-intent detection
//!
//! Pure rule-based routing over the raw user utterance, evaluated before any
//! model call. Matching both directions, or the direction already active,
//! routes nowhere.

use once_cell::sync::Lazy;
use regex::RegexSet;

use crate::agents::AgentId;

static TO_ALICE: Lazy<RegexSet> = Lazy::new(|| {
    RegexSet::new([
        r"(?i)transfer.*alice",
        r"(?i)(let me |can i )?talk to alice",
        r"(?i)bring (in )?alice",
        r"(?i)switch.*alice",
        r"(?i)(go )?(back )?to alice",
    ])
    .expect("alice routes")
});

static TO_BOB: Lazy<RegexSet> = Lazy::new(|| {
    RegexSet::new([
        r"(?i)(go )?back.*bob",
        r"(?i)switch.*bob",
        r"(?i)(let me |can i )?talk to bob",
        r"(?i)transfer.*bob",
        r"(?i)bring (in )?bob",
    ])
    .expect("bob routes")
});

/// Detect an explicit transfer request in `text`. Returns the target agent,
/// or `None` when there is no transfer, the target is already active, or the
/// utterance is ambiguous.
pub fn route(text: &str, current: AgentId) -> Option<AgentId> {
    let wants_alice = TO_ALICE.is_match(text);
    let wants_bob = TO_BOB.is_match(text);

    let target = match (wants_alice, wants_bob) {
        (true, false) => AgentId::Alice,
        (false, true) => AgentId::Bob,
        // No signal, or both directions at once
        _ => return None,
    };

    if target == current {
        None
    } else {
        Some(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_routes_to_alice() {
        for text in [
            "Transfer me to Alice",
            "can I talk to Alice?",
            "bring in alice please",
            "switch over to Alice",
            "back to Alice",
        ] {
            assert_eq!(route(text, AgentId::Bob), Some(AgentId::Alice), "{}", text);
        }
    }

    #[test]
    fn test_routes_to_bob() {
        for text in [
            "Go back to Bob",
            "switch me to bob",
            "let me talk to Bob",
            "transfer to bob",
        ] {
            assert_eq!(route(text, AgentId::Alice), Some(AgentId::Bob), "{}", text);
        }
    }

    #[test]
    fn test_no_transfer_in_plain_talk() {
        assert_eq!(route("the kitchen budget is $25k", AgentId::Bob), None);
        assert_eq!(route("what about permits?", AgentId::Alice), None);
    }

    #[test]
    fn test_same_target_is_noop() {
        assert_eq!(route("talk to bob", AgentId::Bob), None);
        assert_eq!(route("bring in alice", AgentId::Alice), None);
    }

    #[test]
    fn test_ambiguous_matches_nothing() {
        assert_eq!(route("switch to alice or back to bob", AgentId::Bob), None);
    }

    #[test]
    fn test_idempotent() {
        let text = "Transfer me to Alice";
        let first = route(text, AgentId::Bob);
        assert_eq!(first, Some(AgentId::Alice));
        // Routing the same text as the new agent is a no-op
        assert_eq!(route(text, AgentId::Alice), None);
    }
}
