use crate::message::{Message, MessageCode};
use ibft_common::{Address, ConsensusError, View};
use std::collections::{BTreeMap, HashMap};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct BacklogKey {
    view: View,
    code: MessageCode,
    arrival: u64,
}

/// Messages that arrived ahead of the local view, replayed in view order
#[derive(Debug)]
pub struct Backlog {
    capacity_per_sender: usize,
    entries: BTreeMap<BacklogKey, Message>,
    per_sender: HashMap<Address, usize>,
    arrivals: u64,
}

impl Backlog {
    pub fn new(capacity_per_sender: usize) -> Self {
        Self {
            capacity_per_sender,
            entries: BTreeMap::new(),
            per_sender: HashMap::new(),
            arrivals: 0,
        }
    }

    /// Buffer a message; returns false if its sender already filled its share
    pub fn store(&mut self, message: Message) -> bool {
        let count = self.per_sender.entry(message.address).or_insert(0);
        if *count >= self.capacity_per_sender {
            return false;
        }
        *count += 1;
        self.arrivals += 1;
        let key = BacklogKey { view: message.view(), code: message.code(), arrival: self.arrivals };
        self.entries.insert(key, message);
        true
    }

    /// Remove every message `check` no longer reports as future.
    ///
    /// Messages that pass are returned in view order; anything else that is not
    /// future is discarded.
    pub fn drain_ready<F>(&mut self, mut check: F) -> Vec<Message>
    where
        F: FnMut(&Message) -> Result<(), ConsensusError>,
    {
        let mut ready = Vec::new();
        let mut done = Vec::new();
        for (key, message) in &self.entries {
            match check(message) {
                Ok(()) => {
                    done.push(*key);
                    ready.push(*key);
                }
                Err(e) if e.is_future() => {}
                Err(_) => done.push(*key),
            }
        }

        let mut messages = Vec::with_capacity(ready.len());
        for key in done {
            if let Some(message) = self.entries.remove(&key) {
                if let Some(count) = self.per_sender.get_mut(&message.address) {
                    *count = count.saturating_sub(1);
                }
                if ready.binary_search(&key).is_ok() {
                    messages.push(message);
                }
            }
        }
        self.per_sender.retain(|_, count| *count > 0);
        messages
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
