//! Message channel from the worker side to open client contexts.
//!
//! The cache worker and the pages share no memory; everything they need to
//! tell each other travels as a [`ClientMessage`].

use tokio::sync::broadcast;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
  /// A newly activated generation took control of the client
  Claimed { generation: String },
  /// Reload to show server-canonical state
  Reload,
  /// Open or focus a window at this url
  OpenWindow { url: String },
}

/// Broadcast hub for every open client context.
#[derive(Clone)]
pub struct ClientHub {
  tx: broadcast::Sender<ClientMessage>,
}

impl ClientHub {
  pub fn new() -> Self {
    let (tx, _) = broadcast::channel(32);
    Self { tx }
  }

  /// Register a client context.
  pub fn subscribe(&self) -> broadcast::Receiver<ClientMessage> {
    self.tx.subscribe()
  }

  /// Deliver a message to every client. Returns how many received it.
  pub fn send(&self, message: ClientMessage) -> usize {
    debug!(?message, "notifying clients");
    // No subscribers is fine: nothing to control
    self.tx.send(message).unwrap_or(0)
  }

  /// Take control of every open client under `generation`.
  pub fn claim(&self, generation: &str) -> usize {
    self.send(ClientMessage::Claimed {
      generation: generation.to_string(),
    })
  }
}

impl Default for ClientHub {
  fn default() -> Self {
    Self::new()
  }
}
