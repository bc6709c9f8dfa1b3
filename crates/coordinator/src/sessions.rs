//! Seeding sessions: who published a locator and who still has to fetch it

use std::collections::{BTreeSet, HashMap};

#[derive(Debug, Clone, PartialEq, Eq)]
struct Session {
    publisher: String,
    pending: BTreeSet<String>,
}

#[derive(Debug, Default)]
pub struct SeedingSessions {
    by_locator: HashMap<String, Session>,
}

impl SeedingSessions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Track `locator` until every recipient reports completion
    pub fn open(&mut self, locator: &str, publisher: &str, recipients: &[String]) {
        let session = self
            .by_locator
            .entry(locator.to_string())
            .or_insert_with(|| Session {
                publisher: publisher.to_string(),
                pending: BTreeSet::new(),
            });
        session.pending.extend(recipients.iter().cloned());
    }

    /// Mark `device_id` done; returns the publisher once nobody is pending
    pub fn complete(&mut self, locator: &str, device_id: &str) -> Option<String> {
        let session = self.by_locator.get_mut(locator)?;
        session.pending.remove(device_id);
        if session.pending.is_empty() {
            return self.by_locator.remove(locator).map(|s| s.publisher);
        }
        None
    }

    /// Forget a recipient everywhere, e.g. after it went offline; returns
    /// `(locator, publisher)` for sessions that closed as a result
    pub fn drop_recipient(&mut self, device_id: &str) -> Vec<(String, String)> {
        let mut closed = Vec::new();
        self.by_locator.retain(|locator, session| {
            if session.pending.remove(device_id) && session.pending.is_empty() {
                closed.push((locator.clone(), session.publisher.clone()));
                return false;
            }
            true
        });
        closed
    }

    #[must_use]
    pub fn pending(&self, locator: &str) -> Vec<String> {
        self.by_locator
            .get(locator)
            .map(|s| s.pending.iter().cloned().collect())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.by_locator.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_locator.is_empty()
    }
}
