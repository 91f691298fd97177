//! Push message handling for the worker context.

use color_eyre::Result;
use serde::Deserialize;
use tracing::{info, warn};

use crate::clients::{ClientHub, ClientMessage};

const DEFAULT_TITLE: &str = "Nova Notificação do Condomínio";
const DEFAULT_BODY: &str = "Você tem uma nova atualização no portal.";
const DEFAULT_ICON: &str = "/static/img/icon-192.png";
const BADGE_ICON: &str = "/static/img/icon-192.png";
const DEFAULT_URL: &str = "/";

/// Optional JSON carried by a push message. Every field may be missing.
#[derive(Debug, Default, Deserialize)]
struct PushPayload {
  title: Option<String>,
  body: Option<String>,
  icon: Option<String>,
  url: Option<String>,
}

/// A notification ready to be shown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
  pub title: String,
  pub body: String,
  pub icon: String,
  pub badge: String,
  /// Where activating the notification navigates to
  pub url: String,
}

/// Displays notifications. The presentation layer owns the real one.
pub trait NotificationSink {
  fn show(&self, notification: &Notification) -> Result<()>;
}

/// Sink that writes notifications to the log.
pub struct LogSink;

impl NotificationSink for LogSink {
  fn show(&self, notification: &Notification) -> Result<()> {
    info!(
      title = %notification.title,
      body = %notification.body,
      url = %notification.url,
      "notification"
    );
    Ok(())
  }
}

/// Build a notification from raw push data.
///
/// Malformed or missing data never fails: it is logged and defaults are used.
pub fn parse_push(data: Option<&[u8]>) -> Notification {
  let payload = match data {
    Some(bytes) if !bytes.is_empty() => match serde_json::from_slice::<PushPayload>(bytes) {
      Ok(payload) => payload,
      Err(e) => {
        warn!(error = %e, "error parsing push data");
        PushPayload::default()
      }
    },
    _ => PushPayload::default(),
  };

  let or_default = |value: Option<String>, default: &str| {
    value
      .filter(|v| !v.is_empty())
      .unwrap_or_else(|| default.to_string())
  };

  Notification {
    title: or_default(payload.title, DEFAULT_TITLE),
    body: or_default(payload.body, DEFAULT_BODY),
    icon: or_default(payload.icon, DEFAULT_ICON),
    badge: BADGE_ICON.to_string(),
    url: or_default(payload.url, DEFAULT_URL),
  }
}

/// Handle a push message end to end.
pub fn on_push(data: Option<&[u8]>, sink: &impl NotificationSink) -> Result<Notification> {
  let notification = parse_push(data);
  sink.show(&notification)?;
  Ok(notification)
}

/// The operator activated a notification: open or focus its url.
pub fn on_notification_click(notification: &Notification, clients: &ClientHub) -> usize {
  clients.send(ClientMessage::OpenWindow {
    url: notification.url.clone(),
  })
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::cell::RefCell;

  #[derive(Default)]
  struct RecordingSink {
    shown: RefCell<Vec<Notification>>,
  }

  impl NotificationSink for RecordingSink {
    fn show(&self, notification: &Notification) -> Result<()> {
      self.shown.borrow_mut().push(notification.clone());
      Ok(())
    }
  }

  #[test]
  fn test_full_payload() {
    let data = br#"{"title":"Encomenda","body":"Chegou uma caixa","icon":"/i.png","url":"/morador/encomendas/"}"#;
    let n = parse_push(Some(data));
    assert_eq!(n.title, "Encomenda");
    assert_eq!(n.body, "Chegou uma caixa");
    assert_eq!(n.icon, "/i.png");
    assert_eq!(n.url, "/morador/encomendas/");
    assert_eq!(n.badge, BADGE_ICON);
  }

  #[test]
  fn test_partial_payload_uses_fallbacks() {
    let n = parse_push(Some(br#"{"title":"Aviso"}"#));
    assert_eq!(n.title, "Aviso");
    assert_eq!(n.body, DEFAULT_BODY);
    assert_eq!(n.url, DEFAULT_URL);
  }

  #[test]
  fn test_malformed_payload_does_not_fail() {
    let n = parse_push(Some(b"{not json"));
    assert_eq!(n.title, DEFAULT_TITLE);
    assert_eq!(n.icon, DEFAULT_ICON);

    assert_eq!(parse_push(None), parse_push(Some(b"")));
  }

  #[test]
  fn test_on_push_shows_notification() {
    let sink = RecordingSink::default();
    on_push(Some(r#"{"body":"Olá"}"#.as_bytes()), &sink).unwrap();
    assert_eq!(sink.shown.borrow().len(), 1);
    assert_eq!(sink.shown.borrow()[0].body, "Olá");
  }

  #[tokio::test]
  async fn test_click_opens_window() {
    let hub = ClientHub::new();
    let mut client = hub.subscribe();
    let n = parse_push(Some(br#"{"url":"/portaria/encomendas/"}"#));

    assert_eq!(on_notification_click(&n, &hub), 1);
    assert_eq!(
      client.recv().await.unwrap(),
      ClientMessage::OpenWindow {
        url: "/portaria/encomendas/".into()
      }
    );
  }
}
