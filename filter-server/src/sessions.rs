use std::collections::HashMap;

/// Senders accepted per session, waiting for the recipient they go with.
///
/// Every entry is removed either when its recipient is filtered, when the
/// transaction fails, or when the session disconnects, so the map never
/// outgrows the number of open transactions.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    senders: HashMap<String, String>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the sender accepted on `session`, replacing any previous one.
    pub fn note_sender(&mut self, session: &str, sender: &str) {
        self.senders.insert(session.to_string(), sender.to_string());
    }

    /// Removes and returns the sender of `session`.
    pub fn consume_sender(&mut self, session: &str) -> Option<String> {
        self.senders.remove(session)
    }

    pub fn forget(&mut self, session: &str) {
        self.senders.remove(session);
    }

    pub fn len(&self) -> usize {
        self.senders.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.senders.is_empty()
    }
}
