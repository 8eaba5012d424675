//! In-memory event bus with an append-only journal, for tests/dev.

use std::sync::{Mutex, mpsc};

use thiserror::Error;

use crate::bus::{EventBus, Subscription};

#[derive(Debug, Error)]
pub enum InMemoryBusError {
    /// Publish failed due to internal lock poisoning.
    #[error("in-memory bus lock poisoned")]
    Poisoned,
}

#[derive(Debug)]
struct BusState<M> {
    subscribers: Vec<mpsc::Sender<M>>,
    journal: Vec<M>,
}

/// In-memory pub/sub bus.
///
/// Besides fanning out to subscribers, every published message is appended to
/// a journal that is never truncated, so the bus doubles as the audit sink in
/// tests and in the CLI.
#[derive(Debug)]
pub struct InMemoryEventBus<M> {
    state: Mutex<BusState<M>>,
}

impl<M> InMemoryEventBus<M> {
    pub fn new() -> Self {
        Self::default()
    }
}

impl<M: Clone> InMemoryEventBus<M> {
    /// Everything published so far, in publication order.
    pub fn journal(&self) -> Vec<M> {
        match self.state.lock() {
            Ok(state) => state.journal.clone(),
            Err(_) => Vec::new(),
        }
    }
}

impl<M> Default for InMemoryEventBus<M> {
    fn default() -> Self {
        Self {
            state: Mutex::new(BusState {
                subscribers: Vec::new(),
                journal: Vec::new(),
            }),
        }
    }
}

impl<M> EventBus<M> for InMemoryEventBus<M>
where
    M: Clone + Send + 'static,
{
    type Error = InMemoryBusError;

    fn publish(&self, message: M) -> Result<(), Self::Error> {
        let mut state = self.state.lock().map_err(|_| InMemoryBusError::Poisoned)?;

        // Drop any dead subscribers while publishing.
        state.subscribers.retain(|tx| tx.send(message.clone()).is_ok());
        state.journal.push(message);

        Ok(())
    }

    fn subscribe(&self) -> Subscription<M> {
        let (tx, rx) = mpsc::channel();
        if let Ok(mut state) = self.state.lock() {
            state.subscribers.push(tx);
        }
        Subscription::new(rx)
    }
}
