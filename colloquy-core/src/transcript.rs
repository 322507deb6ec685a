//! Running text state of the conversation, driven by protocol events.
//!
//! ## Semantics
//!
//! - The person's utterance has *replace* semantics: every input
//!   transcription event overwrites the previous value, and the grounding
//!   citations derived from the previous turn are cleared with it.
//! - The agent's utterance has *append* semantics: output transcription
//!   deltas concatenate. The engine never auto-clears it — when a "turn"
//!   begins or ends on screen is the host's call.
//! - The searching indicator turns on when the agent invokes its retrieval
//!   tool and off at the first of: grounding results, turn complete,
//!   interruption.

use crate::events::GroundingCitation;
use crate::protocol::ServerEvent;

/// Accumulated transcription and grounding state for one session.
#[derive(Debug, Clone, Default)]
pub struct TranscriptState {
    user_utterance: String,
    agent_utterance: String,
    citations: Vec<GroundingCitation>,
    searching: bool,
}

impl TranscriptState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one protocol event. Returns `true` when the observable state
    /// changed and the host should be notified.
    pub fn apply(&mut self, event: &ServerEvent) -> bool {
        match event {
            ServerEvent::InputTranscription(text) => {
                self.user_utterance = text.clone();
                self.citations.clear();
                true
            }
            ServerEvent::OutputTranscription(delta) => {
                self.agent_utterance.push_str(delta);
                true
            }
            ServerEvent::GroundingCitations(citations) => {
                // Arrival order, duplicates allowed.
                self.citations.extend(citations.iter().cloned());
                self.searching = false;
                true
            }
            ServerEvent::ToolInvocation { .. } => {
                let changed = !self.searching;
                self.searching = true;
                changed
            }
            ServerEvent::TurnComplete | ServerEvent::Interrupted => {
                let changed = self.searching;
                self.searching = false;
                changed
            }
            ServerEvent::SetupComplete
            | ServerEvent::Audio(_)
            | ServerEvent::ServerError { .. } => false,
        }
    }

    pub fn user_utterance(&self) -> &str {
        &self.user_utterance
    }

    pub fn agent_utterance(&self) -> &str {
        &self.agent_utterance
    }

    pub fn citations(&self) -> &[GroundingCitation] {
        &self.citations
    }

    pub fn is_searching(&self) -> bool {
        self.searching
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(text: &str) -> ServerEvent {
        ServerEvent::InputTranscription(text.into())
    }

    fn output(text: &str) -> ServerEvent {
        ServerEvent::OutputTranscription(text.into())
    }

    fn citation(uri: &str) -> GroundingCitation {
        GroundingCitation {
            uri: uri.into(),
            title: None,
        }
    }

    #[test]
    fn user_replaces_agent_appends() {
        let mut state = TranscriptState::new();

        state.apply(&input("hello"));
        state.apply(&output("Hi"));
        state.apply(&output(" there"));
        state.apply(&input("bye"));

        assert_eq!(state.user_utterance(), "bye");
        assert_eq!(state.agent_utterance(), "Hi there");
    }

    #[test]
    fn new_user_input_clears_citations() {
        let mut state = TranscriptState::new();

        state.apply(&input("hello"));
        state.apply(&ServerEvent::GroundingCitations(vec![citation(
            "https://a.example",
        )]));
        assert_eq!(state.citations().len(), 1);

        state.apply(&input("bye"));
        assert!(state.citations().is_empty());
    }

    #[test]
    fn citations_accumulate_in_arrival_order_with_duplicates() {
        let mut state = TranscriptState::new();

        state.apply(&ServerEvent::GroundingCitations(vec![
            citation("https://a.example"),
            citation("https://b.example"),
        ]));
        state.apply(&ServerEvent::GroundingCitations(vec![citation(
            "https://a.example",
        )]));

        let uris: Vec<&str> = state.citations().iter().map(|c| c.uri.as_str()).collect();
        assert_eq!(
            uris,
            vec!["https://a.example", "https://b.example", "https://a.example"]
        );
    }

    #[test]
    fn searching_set_by_tool_cleared_by_results() {
        let mut state = TranscriptState::new();

        assert!(state.apply(&ServerEvent::ToolInvocation {
            name: "google_search".into()
        }));
        assert!(state.is_searching());

        state.apply(&ServerEvent::GroundingCitations(vec![citation(
            "https://a.example",
        )]));
        assert!(!state.is_searching());
    }

    #[test]
    fn searching_cleared_by_turn_complete_and_interrupt() {
        for clearing in [ServerEvent::TurnComplete, ServerEvent::Interrupted] {
            let mut state = TranscriptState::new();
            state.apply(&ServerEvent::ToolInvocation {
                name: "google_search".into(),
            });
            assert!(state.apply(&clearing));
            assert!(!state.is_searching());
        }
    }

    #[test]
    fn audio_and_setup_events_do_not_touch_text_state() {
        let mut state = TranscriptState::new();
        state.apply(&input("hello"));

        assert!(!state.apply(&ServerEvent::SetupComplete));
        assert!(!state.apply(&ServerEvent::Audio(crate::codec::encode_frame(&[0.0; 4]))));
        assert_eq!(state.user_utterance(), "hello");
    }
}
