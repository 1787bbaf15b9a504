//! Subscription registry.

use std::fmt;
use std::time::{Duration, Instant};

use super::message::QoS;
use super::topic;

/// Minimum spacing between subscribe attempts for one entry.
pub const RESUBSCRIBE_INTERVAL: Duration = Duration::from_secs(1);

/// Callback invoked with `(topic, payload)` for every matching message.
pub type MessageCallback = Box<dyn FnMut(&str, &str)>;

pub struct SubscriptionEntry {
    pub pattern: String,
    pub qos: QoS,
    callback: MessageCallback,
    /// The broker accepted the last subscribe request for this entry.
    pub subscribed: bool,
    pub last_attempt: Option<Instant>,
}

impl fmt::Debug for SubscriptionEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionEntry")
            .field("pattern", &self.pattern)
            .field("qos", &self.qos)
            .field("subscribed", &self.subscribed)
            .field("last_attempt", &self.last_attempt)
            .finish()
    }
}

impl SubscriptionEntry {
    fn is_due(&self, now: Instant) -> bool {
        if self.subscribed {
            return false;
        }
        match self.last_attempt {
            None => true,
            Some(at) => now.saturating_duration_since(at) > RESUBSCRIBE_INTERVAL,
        }
    }
}

/// Subscriptions in registration order. Entries live for the lifetime of
/// the registry; duplicates are allowed.
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    entries: Vec<SubscriptionEntry>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a pattern and return its index.
    pub fn add(
        &mut self,
        pattern: impl Into<String>,
        qos: QoS,
        callback: MessageCallback,
    ) -> usize {
        self.entries.push(SubscriptionEntry {
            pattern: pattern.into(),
            qos,
            callback,
            subscribed: false,
            last_attempt: None,
        });
        self.entries.len() - 1
    }

    /// Forget all broker-side state, e.g. before a fresh session.
    pub fn reset(&mut self) {
        for entry in &mut self.entries {
            entry.subscribed = false;
            entry.last_attempt = None;
        }
    }

    /// Try to subscribe a single entry if it is due.
    pub fn resubscribe_one(
        &mut self,
        index: usize,
        now: Instant,
        subscribe: impl FnOnce(&str, QoS) -> bool,
    ) {
        if let Some(entry) = self.entries.get_mut(index) {
            if entry.is_due(now) {
                entry.subscribed = subscribe(&entry.pattern, entry.qos);
                entry.last_attempt = Some(now);
            }
        }
    }

    /// Try every due entry once.
    pub fn resubscribe(&mut self, now: Instant, mut subscribe: impl FnMut(&str, QoS) -> bool) {
        for entry in self.entries.iter_mut().filter(|e| e.is_due(now)) {
            entry.subscribed = subscribe(&entry.pattern, entry.qos);
            entry.last_attempt = Some(now);
        }
    }

    /// Invoke every matching callback in registration order, regardless of
    /// whether the entry is currently marked subscribed. Returns the number
    /// of callbacks run.
    pub fn dispatch(&mut self, topic: &str, payload: &str) -> usize {
        let mut hits = 0;
        for entry in &mut self.entries {
            if topic::matches(topic, &entry.pattern) {
                (entry.callback)(topic, payload);
                hits += 1;
            }
        }
        hits
    }

    pub fn entries(&self) -> &[SubscriptionEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn pending(&self) -> usize {
        self.entries.iter().filter(|e| !e.subscribed).count()
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;

    fn recorder() -> (Rc<RefCell<Vec<String>>>, MessageCallback) {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();
        let cb: MessageCallback = Box::new(move |t: &str, p: &str| {
            sink.borrow_mut().push(format!("{t}={p}"));
        });
        (seen, cb)
    }

    #[test]
    fn test_dispatch_all_matches_in_order() {
        let mut reg = SubscriptionRegistry::new();
        let (a, cb_a) = recorder();
        let (b, cb_b) = recorder();
        let (c, cb_c) = recorder();
        reg.add("home/+/light", QoS::AtMostOnce, cb_a);
        reg.add("home/#", QoS::AtMostOnce, cb_b);
        reg.add("office/#", QoS::AtMostOnce, cb_c);

        assert_eq!(reg.dispatch("home/kitchen/light", "ON"), 2);
        assert_eq!(*a.borrow(), vec!["home/kitchen/light=ON"]);
        assert_eq!(*b.borrow(), vec!["home/kitchen/light=ON"]);
        assert!(c.borrow().is_empty());
    }

    #[test]
    fn test_dispatch_ignores_subscribed_flag() {
        let mut reg = SubscriptionRegistry::new();
        let (seen, cb) = recorder();
        reg.add("a/b", QoS::AtMostOnce, cb);
        assert_eq!(reg.pending(), 1);
        reg.dispatch("a/b", "retained");
        assert_eq!(seen.borrow().len(), 1);
    }

    #[test]
    fn test_resubscribe_floor() {
        let mut reg = SubscriptionRegistry::new();
        reg.add("a", QoS::AtMostOnce, Box::new(|_: &str, _: &str| {}));
        reg.add("b", QoS::AtLeastOnce, Box::new(|_: &str, _: &str| {}));

        let t0 = Instant::now();
        let mut attempts = 0;
        reg.resubscribe(t0, |_, _| {
            attempts += 1;
            false
        });
        assert_eq!(attempts, 2);

        // Within the floor nothing is retried.
        reg.resubscribe(t0 + Duration::from_millis(500), |_, _| {
            attempts += 1;
            true
        });
        assert_eq!(attempts, 2);
        assert_eq!(reg.pending(), 2);

        reg.resubscribe(t0 + Duration::from_millis(1001), |_, _| true);
        assert_eq!(reg.pending(), 0);

        reg.reset();
        assert_eq!(reg.pending(), 2);
        assert!(reg.entries().iter().all(|e| e.last_attempt.is_none()));
    }
}
