use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Handle returned by [`Event::subscribe`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(Uuid);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

type Handler<T> = Box<dyn FnMut(&T) + Send>;

/// Synchronous notification list. Handlers run in subscription order and
/// stay registered until explicitly unsubscribed.
pub struct Event<T> {
    handlers: BTreeMap<(u64, SubscriptionId), Handler<T>>,
    next: u64,
}

impl<T> Default for Event<T> {
    fn default() -> Self {
        Event {
            handlers: BTreeMap::new(),
            next: 0,
        }
    }
}

impl<T> Event<T> {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn subscribe(&mut self, handler: impl FnMut(&T) + Send + 'static) -> SubscriptionId {
        let id = SubscriptionId(Uuid::new_v4());
        self.handlers.insert((self.next, id), Box::new(handler));
        self.next += 1;
        id
    }
    /// Returns whether the subscription existed.
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let key = self.handlers.keys().find(|(_, other)| *other == id).copied();
        match key {
            Some(key) => self.handlers.remove(&key).is_some(),
            None => false,
        }
    }
    pub fn happened(&mut self, value: &T) {
        for handler in self.handlers.values_mut() {
            handler(value);
        }
    }
    pub fn len(&self) -> usize {
        self.handlers.len()
    }
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl<T> fmt::Debug for Event<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Event")
            .field("subscribers", &self.handlers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn unsubscribe_stops_delivery() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut event = Event::new();
        let sink = seen.clone();
        let first = event.subscribe(move |v: &u32| sink.lock().unwrap().push(*v));
        let sink = seen.clone();
        event.subscribe(move |v: &u32| sink.lock().unwrap().push(*v * 10));
        event.happened(&1);
        assert!(event.unsubscribe(first));
        assert!(!event.unsubscribe(first));
        event.happened(&2);
        assert_eq!(*seen.lock().unwrap(), vec![1, 10, 20]);
        assert_eq!(event.len(), 1);
    }
}
