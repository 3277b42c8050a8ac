//! Registry of open page contexts.
//!
//! Each page holds an unbounded receiver; the worker posts notifications to
//! a single client or broadcasts them to all of them.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use uuid::Uuid;

use crate::message::Message;

/// Identifier of a page context.
pub type ClientId = Uuid;

/// Shared set of connected clients.
#[derive(Debug, Clone, Default)]
pub struct Clients {
    inner: Arc<Mutex<HashMap<ClientId, mpsc::UnboundedSender<Message>>>>,
}

impl Clients {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new client and returns its id and message receiver.
    pub fn connect(&self) -> (ClientId, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = Uuid::new_v4();
        if let Ok(mut clients) = self.inner.lock() {
            clients.insert(id, tx);
        }
        (id, rx)
    }

    /// Removes a client.
    pub fn disconnect(&self, id: ClientId) {
        if let Ok(mut clients) = self.inner.lock() {
            clients.remove(&id);
        }
    }

    /// Number of connected clients.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().map_or(0, |clients| clients.len())
    }

    /// Returns true if no client is connected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sends a message to one client. Returns false if it is gone.
    pub fn post(&self, id: ClientId, message: Message) -> bool {
        let Ok(mut clients) = self.inner.lock() else {
            return false;
        };
        let delivered = clients.get(&id).is_some_and(|tx| tx.send(message).is_ok());
        if !delivered {
            clients.remove(&id);
        }
        delivered
    }

    /// Sends a message to every client, dropping closed ones.
    /// Returns the number of clients reached.
    pub fn broadcast(&self, message: &Message) -> usize {
        let Ok(mut clients) = self.inner.lock() else {
            return 0;
        };
        clients.retain(|_, tx| tx.send(message.clone()).is_ok());
        clients.len()
    }
}
