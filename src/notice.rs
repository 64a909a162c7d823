//! Notice and OK result messages sent to clients

/// Classification of a command result reported back to a client.
#[derive(PartialEq, Eq, Debug, Clone)]
pub enum EventResultStatus {
    Saved,
    Duplicate,
    Invalid,
    Blocked,
    RateLimited,
    Error,
}

/// The result of processing a single EVENT command.
#[derive(PartialEq, Eq, Debug, Clone)]
pub struct EventResult {
    pub id: String,
    pub msg: String,
    pub status: EventResultStatus,
}

/// A client-facing message; either a NOTICE or an OK result.
#[derive(PartialEq, Eq, Debug, Clone)]
pub enum Notice {
    Message(String),
    EventResult(EventResult),
}

impl EventResultStatus {
    /// The boolean the OK message carries for this status.
    #[must_use]
    pub fn to_bool(&self) -> bool {
        match self {
            Self::Saved | Self::Duplicate => true,
            Self::Invalid | Self::Blocked | Self::RateLimited | Self::Error => false,
        }
    }

    /// Machine-readable message prefix for this status.
    #[must_use]
    pub fn prefix(&self) -> &'static str {
        match self {
            Self::Saved => "saved",
            Self::Duplicate => "duplicate",
            Self::Invalid => "invalid",
            Self::Blocked => "blocked",
            Self::RateLimited => "rate-limited",
            Self::Error => "error",
        }
    }
}

impl Notice {
    #[must_use]
    pub fn message(msg: String) -> Notice {
        Notice::Message(msg)
    }

    fn prefixed(id: String, msg: &str, status: EventResultStatus) -> Notice {
        let msg = format!("{}: {}", status.prefix(), msg);
        Notice::EventResult(EventResult { id, msg, status })
    }

    #[must_use]
    pub fn invalid(id: String, msg: &str) -> Notice {
        Notice::prefixed(id, msg, EventResultStatus::Invalid)
    }

    #[must_use]
    pub fn blocked(id: String, msg: &str) -> Notice {
        Notice::prefixed(id, msg, EventResultStatus::Blocked)
    }

    #[must_use]
    pub fn rate_limited(id: String, msg: &str) -> Notice {
        Notice::prefixed(id, msg, EventResultStatus::RateLimited)
    }

    #[must_use]
    pub fn duplicate(id: String) -> Notice {
        Notice::prefixed(id, "", EventResultStatus::Duplicate)
    }

    /// A replaceable event losing to a newer stored version is
    /// acknowledged as a duplicate with an explanation.
    #[must_use]
    pub fn shadowed(id: String) -> Notice {
        Notice::prefixed(
            id,
            "have a newer event for this key",
            EventResultStatus::Duplicate,
        )
    }

    #[must_use]
    pub fn error(id: String, msg: &str) -> Notice {
        Notice::prefixed(id, msg, EventResultStatus::Error)
    }

    #[must_use]
    pub fn saved(id: String) -> Notice {
        Notice::EventResult(EventResult {
            id,
            msg: "".into(),
            status: EventResultStatus::Saved,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_to_bool() {
        assert!(EventResultStatus::Saved.to_bool());
        assert!(EventResultStatus::Duplicate.to_bool());
        assert!(!EventResultStatus::Invalid.to_bool());
        assert!(!EventResultStatus::Blocked.to_bool());
        assert!(!EventResultStatus::RateLimited.to_bool());
        assert!(!EventResultStatus::Error.to_bool());
    }

    #[test]
    fn invalid_prefix() {
        if let Notice::EventResult(er) = Notice::invalid("abc".into(), "bad signature") {
            assert_eq!(er.msg, "invalid: bad signature");
            assert_eq!(er.id, "abc");
        } else {
            panic!("expected event result");
        }
    }
}
