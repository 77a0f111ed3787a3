//! Messages and reports produced by a sync cycle.

use serde::Serialize;

use super::operation::PendingOperation;

/// Message sent from whichever context ran a sync cycle to anyone listening.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SyncEvent {
  /// Operations confirmed by the upstream in this cycle.
  SyncComplete { items: Vec<PendingOperation> },
  /// An operation the upstream refused; it has been dropped from the log.
  OperationRejected {
    operation: PendingOperation,
    status: u16,
    message: String,
  },
}

/// Where a sync cycle ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SyncPhase {
  Idle,
  Draining,
  /// Every attempted operation was confirmed.
  Completed,
  /// Some operations stay queued or were rejected.
  PartiallyFailed,
  /// Replay was handed to the background dispatcher.
  Delegated,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RejectedOperation {
  pub operation: PendingOperation,
  pub status: u16,
  pub message: String,
}

/// Outcome of one sync cycle.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncReport {
  pub phase: SyncPhase,
  /// Confirmed and removed from the log.
  pub synced: Vec<PendingOperation>,
  /// Refused by the upstream and removed from the log.
  pub rejected: Vec<RejectedOperation>,
  /// Failed transiently and still queued (or, when delegated, registered).
  pub deferred: Vec<PendingOperation>,
}

impl SyncReport {
  pub fn empty() -> Self {
    Self {
      phase: SyncPhase::Completed,
      synced: Vec::new(),
      rejected: Vec::new(),
      deferred: Vec::new(),
    }
  }

  pub fn delegated(registered: Vec<PendingOperation>) -> Self {
    Self {
      phase: SyncPhase::Delegated,
      deferred: registered,
      ..Self::empty()
    }
  }

  pub fn merge(&mut self, other: SyncReport) {
    self.synced.extend(other.synced);
    self.rejected.extend(other.rejected);
    self.deferred.extend(other.deferred);
    self.settle();
  }

  /// Derive the final phase from what happened.
  pub(crate) fn settle(&mut self) {
    self.phase = if self.rejected.is_empty() && self.deferred.is_empty() {
      SyncPhase::Completed
    } else {
      SyncPhase::PartiallyFailed
    };
  }

  /// Messages to broadcast for this cycle.
  pub fn events(&self) -> Vec<SyncEvent> {
    let mut events: Vec<SyncEvent> = self
      .rejected
      .iter()
      .map(|r| SyncEvent::OperationRejected {
        operation: r.operation.clone(),
        status: r.status,
        message: r.message.clone(),
      })
      .collect();
    if !self.synced.is_empty() {
      events.push(SyncEvent::SyncComplete {
        items: self.synced.clone(),
      });
    }
    events
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::remote::Method;
  use crate::sync::operation::OperationIntent;
  use chrono::Utc;

  #[test]
  fn test_sync_complete_wire_format() {
    let op = PendingOperation::new(OperationIntent::new(Method::Get, "/api/repos"), Utc::now());
    let wire = serde_json::to_value(SyncEvent::SyncComplete {
      items: vec![op.clone()],
    })
    .unwrap();
    assert_eq!(wire["type"], "sync-complete");
    assert_eq!(wire["items"][0]["id"], op.id.as_str());
  }

  #[test]
  fn test_phase_after_merge() {
    let op = PendingOperation::new(OperationIntent::new(Method::Get, "/api/repos"), Utc::now());
    let mut report = SyncReport::empty();
    report.merge(SyncReport {
      synced: vec![op.clone()],
      ..SyncReport::empty()
    });
    assert_eq!(report.phase, SyncPhase::Completed);
    assert_eq!(report.events().len(), 1);

    report.merge(SyncReport {
      deferred: vec![op],
      ..SyncReport::empty()
    });
    assert_eq!(report.phase, SyncPhase::PartiallyFailed);
  }
}
