//! FIFO event queue owned by the pipeline.
//!
//! Flush takes the whole content in one step and a failed batch goes back in
//! front of whatever arrived meanwhile, so events leave in enqueue order.

use std::collections::VecDeque;

use crate::events::Event;

#[derive(Debug, Default)]
pub struct EventQueue {
    events: VecDeque<Event>,
    max_size: Option<usize>,
}

impl EventQueue {
    /// Unbounded queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue holding at most `max_size` events; the oldest are evicted first.
    pub fn bounded(max_size: usize) -> Self {
        Self {
            events: VecDeque::new(),
            max_size: Some(max_size),
        }
    }

    pub fn set_max_size(&mut self, max_size: Option<usize>) -> usize {
        self.max_size = max_size;
        self.evict_overflow()
    }

    /// Append at the tail. Returns the number of events evicted to make room.
    pub fn push(&mut self, event: Event) -> usize {
        self.events.push_back(event);
        self.evict_overflow()
    }

    /// Remove and return everything queued, leaving the queue empty.
    pub fn take_all(&mut self) -> Vec<Event> {
        Vec::from(std::mem::take(&mut self.events))
    }

    /// Put a failed batch back ahead of the events queued since it was taken.
    /// Returns the number of events evicted.
    pub fn requeue_front(&mut self, batch: Vec<Event>) -> usize {
        for event in batch.into_iter().rev() {
            self.events.push_front(event);
        }
        self.evict_overflow()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Event> {
        self.events.iter()
    }

    fn evict_overflow(&mut self) -> usize {
        let Some(max) = self.max_size else {
            return 0;
        };
        let overflow = self.events.len().saturating_sub(max);
        self.events.drain(..overflow);
        overflow
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use sitepulse_core::EventKind;
    use std::collections::BTreeMap;
    use uuid::Uuid;

    fn event(label: &str) -> Event {
        Event {
            id: Uuid::new_v4(),
            kind: EventKind::Event,
            timestamp: Utc::now(),
            url: format!("https://example.com/{label}"),
            title: None,
            referrer: None,
            site_id: "site-1".into(),
            session_id: None,
            utm: BTreeMap::new(),
            custom_dimensions: BTreeMap::new(),
            payload: None,
        }
    }

    fn urls(queue: &EventQueue) -> Vec<String> {
        queue.iter().map(|e| e.url.replace("https://example.com/", "")).collect()
    }

    #[test]
    fn test_take_all_clears() {
        let mut queue = EventQueue::new();
        queue.push(event("a"));
        queue.push(event("b"));

        let taken = queue.take_all();
        assert_eq!(taken.len(), 2);
        assert_eq!(taken[0].url, "https://example.com/a");
        assert!(queue.is_empty());
        assert!(queue.take_all().is_empty());
    }

    #[test]
    fn test_requeue_goes_in_front() {
        let mut queue = EventQueue::new();
        queue.push(event("a"));
        queue.push(event("b"));
        let batch = queue.take_all();

        queue.push(event("c"));
        queue.requeue_front(batch);

        assert_eq!(urls(&queue), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_bounded_evicts_oldest() {
        let mut queue = EventQueue::bounded(2);
        assert_eq!(queue.push(event("a")), 0);
        assert_eq!(queue.push(event("b")), 0);
        assert_eq!(queue.push(event("c")), 1);
        assert_eq!(urls(&queue), vec!["b", "c"]);
    }

    #[test]
    fn test_bounded_requeue_evicts_from_failed_batch() {
        let mut queue = EventQueue::bounded(3);
        queue.push(event("a"));
        queue.push(event("b"));
        let batch = queue.take_all();

        queue.push(event("c"));
        queue.push(event("d"));
        assert_eq!(queue.requeue_front(batch), 1);
        assert_eq!(urls(&queue), vec!["b", "c", "d"]);
    }

    #[test]
    fn test_shrinking_bound() {
        let mut queue = EventQueue::new();
        for label in ["a", "b", "c", "d"] {
            queue.push(event(label));
        }
        assert_eq!(queue.set_max_size(Some(1)), 3);
        assert_eq!(urls(&queue), vec!["d"]);
        assert_eq!(queue.set_max_size(None), 0);
    }
}
