//! Failure taxonomy shared by the sync engine and the presentation feed.

use thiserror::Error;

/// Failure classes surfaced to the operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
  /// Network unreachable or timed out; retried on the next trigger
  Transient,
  /// Server answered with something we could not understand
  MalformedPayload,
  /// Local database failed (quota, corruption, lock)
  Storage,
  /// Server accepted a batch that could not be cleared locally
  PartialSuccess,
}

/// Why a sync cycle failed.
///
/// Carries owned strings so outcomes can be shared between coalesced callers.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SyncError {
  #[error("network error: {0}")]
  Network(String),
  #[error("server rejected batch with status {status}")]
  Rejected { status: u16 },
  #[error("malformed server response: {0}")]
  Malformed(String),
  #[error("local storage error: {0}")]
  Storage(String),
  #[error("batch accepted but local clear failed: {0}")]
  ClearFailed(String),
}

impl SyncError {
  pub fn kind(&self) -> FailureKind {
    match self {
      SyncError::Network(_) | SyncError::Rejected { .. } => FailureKind::Transient,
      SyncError::Malformed(_) => FailureKind::MalformedPayload,
      SyncError::Storage(_) => FailureKind::Storage,
      SyncError::ClearFailed(_) => FailureKind::PartialSuccess,
    }
  }
}

/// Severity of a signal shown to the operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
  Success,
  Warning,
  Danger,
}

/// Signals fed to the presentation layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UiSignal {
  /// A message to display (alert banner)
  Notice {
    severity: Severity,
    kind: Option<FailureKind>,
    message: String,
  },
  /// Current number of pending records (badge)
  PendingCount(u64),
  /// Connectivity indicator changed
  Connectivity { online: bool },
}

impl UiSignal {
  pub fn notice(severity: Severity, message: impl Into<String>) -> Self {
    UiSignal::Notice {
      severity,
      kind: None,
      message: message.into(),
    }
  }

  pub fn failure(kind: FailureKind, message: impl Into<String>) -> Self {
    UiSignal::Notice {
      severity: Severity::Danger,
      kind: Some(kind),
      message: message.into(),
    }
  }
}
