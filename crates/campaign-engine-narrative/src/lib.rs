#![forbid(unsafe_code)]

use campaign_engine_domain::Lead;
use serde::{Deserialize, Serialize};

/// An ordered, immutable list of message identifiers for one campaign
/// sequence (e.g. intro -> follow-up-1 -> follow-up-2).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MessageSequence {
    pub sequence_name: String,
    pub messages: Vec<String>,
}

impl MessageSequence {
    /// # Errors
    /// Returns `NarrativeError::EmptySequence` when no messages are defined.
    pub fn new(sequence_name: &str, messages: Vec<String>) -> Result<Self, NarrativeError> {
        if messages.is_empty() {
            return Err(NarrativeError::EmptySequence {
                sequence_name: sequence_name.to_string(),
            });
        }
        Ok(Self {
            sequence_name: sequence_name.to_string(),
            messages,
        })
    }

    #[must_use]
    pub fn len(&self) -> u32 {
        u32::try_from(self.messages.len()).unwrap_or(u32::MAX)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum NarrativeError {
    #[error("sequence '{sequence_name}' has no messages")]
    EmptySequence { sequence_name: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NextStep {
    /// The message to dispatch at the lead's current step.
    Message { message_id: String, step_index: u32 },
    /// The lead has walked the whole sequence; mark it complete without
    /// dispatching.
    Exhausted,
}

/// Pure mapping from (sequence, current step index) to the next message.
#[must_use]
pub fn next_step(sequence: &MessageSequence, step_index: u32) -> NextStep {
    match sequence.messages.get(step_index as usize) {
        Some(message_id) => NextStep::Message {
            message_id: message_id.clone(),
            step_index,
        },
        None => NextStep::Exhausted,
    }
}

/// Convenience wrapper resolving the next step for a lead.
#[must_use]
pub fn next_step_for_lead(sequence: &MessageSequence, lead: &Lead) -> NextStep {
    next_step(sequence, lead.step_index)
}

#[cfg(test)]
mod tests {
    use super::{next_step, MessageSequence, NextStep};

    fn three_step() -> MessageSequence {
        let sequence = MessageSequence::new(
            "default",
            vec![
                "intro".to_string(),
                "follow-up-1".to_string(),
                "follow-up-2".to_string(),
            ],
        );
        assert!(sequence.is_ok());
        sequence.unwrap_or_else(|_| unreachable!())
    }

    #[test]
    fn every_step_maps_to_its_message() {
        let sequence = three_step();
        assert_eq!(
            next_step(&sequence, 0),
            NextStep::Message {
                message_id: "intro".to_string(),
                step_index: 0
            }
        );
        assert_eq!(
            next_step(&sequence, 1),
            NextStep::Message {
                message_id: "follow-up-1".to_string(),
                step_index: 1
            }
        );
        assert_eq!(
            next_step(&sequence, 2),
            NextStep::Message {
                message_id: "follow-up-2".to_string(),
                step_index: 2
            }
        );
    }

    #[test]
    fn index_at_or_past_length_is_exhausted() {
        let sequence = three_step();
        assert_eq!(next_step(&sequence, 3), NextStep::Exhausted);
        assert_eq!(next_step(&sequence, 100), NextStep::Exhausted);
        assert_eq!(next_step(&sequence, u32::MAX), NextStep::Exhausted);
    }

    #[test]
    fn selection_is_pure() {
        let sequence = three_step();
        assert_eq!(next_step(&sequence, 1), next_step(&sequence, 1));
    }

    #[test]
    fn empty_sequences_are_rejected() {
        let result = MessageSequence::new("empty", Vec::new());
        assert!(result.is_err());
    }

    #[test]
    fn sequence_length() {
        assert_eq!(three_step().len(), 3);
    }
}
