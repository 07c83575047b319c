use std::fmt;

/// Final line of the registration block.
pub const REGISTER_READY: &str = "register|ready";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Report,
    Filter,
}

impl EventKind {
    fn as_str(&self) -> &'static str {
        match self {
            EventKind::Report => "report",
            EventKind::Filter => "filter",
        }
    }
}

/// An event stream the filter asks the server for during the handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub kind: EventKind,
    pub subsystem: String,
    pub event: String,
}

impl Subscription {
    pub fn report(subsystem: &str, event: &str) -> Self {
        Subscription {
            kind: EventKind::Report,
            subsystem: subsystem.to_string(),
            event: event.to_string(),
        }
    }

    pub fn filter(subsystem: &str, event: &str) -> Self {
        Subscription {
            kind: EventKind::Filter,
            subsystem: subsystem.to_string(),
            event: event.to_string(),
        }
    }
}

impl fmt::Display for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "register|{}|{}|{}",
            self.kind.as_str(),
            self.subsystem,
            self.event
        )
    }
}

/// The decision for a single filter request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Proceed,
    Reject { code: u16, message: String },
}

impl Verdict {
    pub fn reject(code: u16, message: impl Into<String>) -> Self {
        Verdict::Reject {
            code,
            message: message.into(),
        }
    }
}

/// A verdict bound to the session and request it answers.
pub struct FilterResult<'a> {
    pub session: &'a str,
    pub token: &'a str,
    pub verdict: &'a Verdict,
}

impl fmt::Display for FilterResult<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "filter-result|{}|{}|", self.session, self.token)?;
        match self.verdict {
            Verdict::Proceed => f.write_str("proceed"),
            Verdict::Reject { code, message } => write!(f, "reject|{} {}", code, message),
        }
    }
}
