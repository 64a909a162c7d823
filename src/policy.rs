//! Pre-persistence write policy hook
use crate::event::Event;
use async_trait::async_trait;

/// Decision returned by a write policy for a submitted event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyResult {
    /// Admit the event for storage and fan-out.
    Accept,
    /// Reject, reporting the reason to the submitter.
    Deny(String),
    /// Acknowledge the event as accepted, but neither store nor
    /// deliver it.
    ShadowDeny,
}

/// External policy consulted before an event is persisted.  The
/// policy runs after syntactic validation and signature verification,
/// so implementations may assume a well-formed event.
#[async_trait]
pub trait WritePolicy: Send + Sync {
    async fn admit_event(&self, event: &Event, source_ip: &str) -> PolicyResult;
}

/// The default policy: everything that validated is admitted.
pub struct AllowAll;

#[async_trait]
impl WritePolicy for AllowAll {
    async fn admit_event(&self, _event: &Event, _source_ip: &str) -> PolicyResult {
        PolicyResult::Accept
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn allow_all_accepts() {
        let event = Event {
            id: "0".repeat(64),
            pubkey: "0".repeat(64),
            created_at: 0,
            kind: 1,
            tags: vec![],
            content: "".into(),
            sig: "0".repeat(128),
        };
        let p = AllowAll;
        assert_eq!(p.admit_event(&event, "127.0.0.1").await, PolicyResult::Accept);
    }
}
