use thiserror::Error;

/// Failure kinds for every fallible pipeline operation.
///
/// Transient upstream faults (`ChainUnavailable`) recover locally via backoff
/// and only reach users through the `system.health` topic. State integrity
/// faults (`StateConflict`) are always recovered locally. Policy and
/// validation faults surface immediately.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("chain endpoint unavailable: {0}")]
    ChainUnavailable(String),

    #[error("undecodable notification: {0}")]
    Decode(String),

    #[error("stale state for {entity}: event slot {event_slot} < current slot {current_slot}")]
    StateConflict {
        entity: String,
        event_slot: u64,
        current_slot: u64,
    },

    #[error("composition abandoned: {0}")]
    CompositionAbandoned(AbandonReason),

    #[error("simulation failed at position {position}: {reason}")]
    SimulationFailed { position: usize, reason: String },

    #[error("block engine rejected submission: {0}")]
    SubmissionRejected(String),

    #[error("deadline expired during {0}")]
    Timeout(&'static str),

    #[error("subscriber too slow on topic {topic}")]
    SubscriberSlow { topic: String },

    #[error("bounded queue full: {0}")]
    ResourceExhausted(String),

    #[error("blocked by policy: {0}")]
    PolicyBlocked(String),
}

/// Why the composer gave up on a candidate set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbandonReason {
    EmptyInput,
    RetriesExhausted,
    NothingAdmissible,
}

impl std::fmt::Display for AbandonReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AbandonReason::EmptyInput => write!(f, "empty candidate set"),
            AbandonReason::RetriesExhausted => write!(f, "simulation retries exhausted"),
            AbandonReason::NothingAdmissible => write!(f, "no opportunity admissible"),
        }
    }
}

impl PipelineError {
    /// Transient faults are retried internally and never bubble to callers.
    pub fn is_transient(&self) -> bool {
        matches!(self, PipelineError::ChainUnavailable(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(PipelineError::ChainUnavailable("ws down".into()).is_transient());
        assert!(!PipelineError::Timeout("compose").is_transient());
    }

    #[test]
    fn test_abandon_reason_display() {
        let err = PipelineError::CompositionAbandoned(AbandonReason::EmptyInput);
        assert!(err.to_string().contains("empty candidate set"));
    }
}
