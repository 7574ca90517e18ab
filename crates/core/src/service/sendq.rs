use crate::service::{ConvoTag, ProtocolType};
use std::collections::{HashMap, VecDeque};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedSend {
    pub protocol: ProtocolType,
    pub payload: Vec<u8>,
}

#[derive(Debug, Default)]
struct ConvoQueue {
    queue: VecDeque<QueuedSend>,
    in_flight: bool,
}

/// Per-conversation outbound queues
///
/// Only one message per conversation is handed to the crypto worker at a
/// time, so frames leave in the order they were queued even when workers
/// finish out of order.
#[derive(Debug, Default)]
pub struct SendQueues {
    convos: HashMap<ConvoTag, ConvoQueue>,
}

impl SendQueues {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, tag: ConvoTag, send: QueuedSend) {
        self.convos.entry(tag).or_default().queue.push_back(send);
    }

    /// Next message to encrypt, unless one is already in flight
    pub fn next_ready(&mut self, tag: &ConvoTag) -> Option<QueuedSend> {
        let convo = self.convos.get_mut(tag)?;
        if convo.in_flight {
            return None;
        }
        let send = convo.queue.pop_front()?;
        convo.in_flight = true;
        Some(send)
    }

    /// The in-flight message for `tag` has been dealt with
    pub fn complete(&mut self, tag: &ConvoTag) {
        if let Some(convo) = self.convos.get_mut(tag) {
            convo.in_flight = false;
            if convo.queue.is_empty() {
                self.convos.remove(tag);
            }
        }
    }

    /// Discard everything queued for `tag`; returns how many were dropped
    pub fn drop_convo(&mut self, tag: &ConvoTag) -> usize {
        self.convos.remove(tag).map_or(0, |c| c.queue.len())
    }

    pub fn pending(&self, tag: &ConvoTag) -> usize {
        self.convos.get(tag).map_or(0, |c| c.queue.len())
    }

    pub fn total_pending(&self) -> usize {
        self.convos.values().map(|c| c.queue.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn send(byte: u8) -> QueuedSend {
        QueuedSend {
            protocol: ProtocolType::Text,
            payload: vec![byte],
        }
    }

    #[test]
    fn test_one_in_flight_per_convo() {
        let mut queues = SendQueues::new();
        let tag = ConvoTag::generate();
        queues.push(tag, send(1));
        queues.push(tag, send(2));

        assert_eq!(queues.next_ready(&tag), Some(send(1)));
        assert_eq!(queues.next_ready(&tag), None);
        queues.complete(&tag);
        assert_eq!(queues.next_ready(&tag), Some(send(2)));
        queues.complete(&tag);
        assert_eq!(queues.next_ready(&tag), None);
        assert_eq!(queues.total_pending(), 0);
    }

    #[test]
    fn test_convos_independent() {
        let mut queues = SendQueues::new();
        let a = ConvoTag::generate();
        let b = ConvoTag::generate();
        queues.push(a, send(1));
        queues.push(b, send(2));

        assert!(queues.next_ready(&a).is_some());
        assert_eq!(queues.next_ready(&b), Some(send(2)));
        assert_eq!(queues.drop_convo(&a), 0);
        assert_eq!(queues.pending(&b), 0);
    }
}
