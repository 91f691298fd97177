use tokio::sync::mpsc;

use super::Connectivity;

/// Events that can start a sync
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
  /// Connectivity came back
  Online,
  /// Connectivity was lost
  Offline,
  /// The operator pressed "sync"
  ManualSync,
  /// The page was shown or hidden
  Visible(bool),
  /// Stop the monitor loop
  Shutdown,
}

/// Event handler that turns connectivity changes and external triggers into events
pub struct EventHandler {
  tx: mpsc::UnboundedSender<Event>,
  rx: mpsc::UnboundedReceiver<Event>,
}

impl EventHandler {
  /// Create a new event handler watching `connectivity`
  pub fn new(connectivity: &Connectivity) -> Self {
    let (tx, rx) = mpsc::unbounded_channel();
    let mut changes = connectivity.subscribe();

    // Spawn connectivity watcher
    let watcher_tx = tx.clone();
    tokio::spawn(async move {
      while changes.changed().await.is_ok() {
        let event = if *changes.borrow_and_update() {
          Event::Online
        } else {
          Event::Offline
        };
        if watcher_tx.send(event).is_err() {
          break;
        }
      }
    });

    Self { tx, rx }
  }

  /// Sender for manual triggers and shutdown
  pub fn sender(&self) -> mpsc::UnboundedSender<Event> {
    self.tx.clone()
  }

  /// Receive the next event
  pub async fn next(&mut self) -> Option<Event> {
    self.rx.recv().await
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn test_transitions_become_events() {
    let connectivity = Connectivity::new(false);
    let mut events = EventHandler::new(&connectivity);

    connectivity.set_online(true);
    assert_eq!(events.next().await, Some(Event::Online));

    connectivity.set_online(false);
    assert_eq!(events.next().await, Some(Event::Offline));
  }

  #[tokio::test]
  async fn test_manual_events_pass_through() {
    let connectivity = Connectivity::new(true);
    let mut events = EventHandler::new(&connectivity);

    events.sender().send(Event::ManualSync).unwrap();
    assert_eq!(events.next().await, Some(Event::ManualSync));
  }
}
