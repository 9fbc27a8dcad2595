//! Per-entity synchronization phase.

/// Where an entity's displayed quantity stands relative to the server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityPhase {
  /// Displayed quantity equals the last confirmed server quantity
  Settled,
  /// User is changing the value; the displayed quantity may diverge
  Editing,
  /// A write is in flight
  Flushing,
  /// A write failed and the displayed value was reverted. Transient: the
  /// entity re-enters `Settled` as soon as the rollback is applied.
  RolledBack,
  /// Removed from the list
  Deleted,
}

/// The only things that move an entity between phases
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
  Edit,
  Remove,
  TimerExpired,
  /// `pending` is true when another write is already queued behind this one
  WriteSucceeded { pending: bool },
  WriteFailed,
  RollbackApplied,
}

impl EntityPhase {
  /// Apply a trigger. Triggers that make no sense in the current phase leave
  /// it unchanged, which also keeps a deleted entity `Deleted` while its
  /// delete write is sent and confirmed.
  pub fn next(self, trigger: Trigger) -> EntityPhase {
    use EntityPhase::*;

    match (self, trigger) {
      (_, Trigger::Remove) => Deleted,
      (_, Trigger::Edit) => Editing,
      (Editing, Trigger::TimerExpired) => Flushing,
      (Flushing | Editing, Trigger::WriteSucceeded { pending: false }) => Settled,
      (Flushing | Editing | Deleted, Trigger::WriteSucceeded { pending: true }) => {
        self.keep_intent()
      }
      (Flushing | Editing | Deleted, Trigger::WriteFailed) => RolledBack,
      (RolledBack, Trigger::RollbackApplied) => Settled,
      (phase, _) => phase,
    }
  }

  /// Phase to show while a queued successor waits for its turn
  fn keep_intent(self) -> EntityPhase {
    match self {
      EntityPhase::Flushing => EntityPhase::Editing,
      other => other,
    }
  }

  pub fn label(self) -> &'static str {
    match self {
      EntityPhase::Settled => "settled",
      EntityPhase::Editing => "editing",
      EntityPhase::Flushing => "flushing",
      EntityPhase::RolledBack => "rolled back",
      EntityPhase::Deleted => "deleted",
    }
  }
}
