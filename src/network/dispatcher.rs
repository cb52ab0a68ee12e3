//! Per-connection routing of inbound messages to waiting requesters

use super::message::Message;
use super::peer::PeerHandle;
use std::collections::HashMap;
use tracing::warn;

/// Continuation for one correlated conversation
///
/// Returns `true` once it has seen its final message; `false` keeps it
/// registered for further pages.
pub type Handler = Box<dyn FnMut(Message, &PeerHandle) -> bool + Send>;

/// Receiver of unsolicited traffic
pub type GlobalHandler = Box<dyn FnMut(Message, &PeerHandle) + Send>;

#[derive(Default)]
pub struct Dispatcher {
    handlers: HashMap<String, Handler>,
    global_handler: Option<GlobalHandler>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_global_handler(&mut self, handler: GlobalHandler) {
        self.global_handler = Some(handler);
    }

    /// Register before sending the question so no answer can outrun it
    pub fn register(&mut self, identifier: impl Into<String>, handler: Handler) {
        self.handlers.insert(identifier.into(), handler);
    }

    pub fn unregister(&mut self, identifier: &str) -> bool {
        self.handlers.remove(identifier).is_some()
    }

    pub fn is_registered(&self, identifier: &str) -> bool {
        self.handlers.contains_key(identifier)
    }

    pub fn pending(&self) -> usize {
        self.handlers.len()
    }

    /// Drop every outstanding continuation
    pub fn clear(&mut self) {
        self.handlers.clear();
    }

    pub fn dispatch(&mut self, message: Message, peer: &PeerHandle) {
        if let Some(handler) = self.handlers.get_mut(&message.identifier) {
            let identifier = message.identifier.clone();
            if handler(message, peer) {
                self.handlers.remove(&identifier);
            }
        } else if let Some(global) = self.global_handler.as_mut() {
            global(message, peer);
        } else {
            warn!(peer = %peer.address(), "No handler for message {}, dropped", message.identifier);
        }
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("pending", &self.handlers.len())
            .field("global_handler", &self.global_handler.is_some())
            .finish()
    }
}
