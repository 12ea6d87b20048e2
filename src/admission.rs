//! Admission gate: the set of active sessions under a hard ceiling.
//!
//! The gate itself is plain data (`&mut self`); callers that share it across
//! tasks keep it behind one lock and use [`AdmissionGate::try_reserve`], so the
//! capacity check and the reservation can never be split by a suspension point.

use std::collections::HashSet;

use tracing::debug;

use crate::error::DispatchError;

/// How a session slot was obtained by [`AdmissionGate::try_reserve`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reservation {
    /// A new slot was taken; roll it back with `release` if dispatch fails.
    Fresh,
    /// The session was already active; nothing to roll back.
    Existing,
}

impl Reservation {
    pub fn needs_rollback(self) -> bool {
        self == Reservation::Fresh
    }
}

/// Tracks active session ids and enforces the concurrency ceiling.
#[derive(Debug)]
pub struct AdmissionGate {
    max_active: usize,
    active: HashSet<String>,
}

impl AdmissionGate {
    pub fn new(max_active: usize) -> Self {
        Self {
            max_active,
            active: HashSet::new(),
        }
    }

    pub fn max_active(&self) -> usize {
        self.max_active
    }

    /// True iff another session could be admitted.
    pub fn has_capacity(&self) -> bool {
        self.active.len() < self.max_active
    }

    /// Add `session_id` to the active set. Re-admitting an active id is a no-op.
    pub fn admit(&mut self, session_id: &str) -> Result<(), DispatchError> {
        validate_session_id(session_id)?;
        if self.active.insert(session_id.to_string()) {
            debug!(session_id = %session_id, active = self.active.len(), "Session admitted");
        }
        Ok(())
    }

    /// Remove `session_id` from the active set. Returns whether it was active.
    pub fn release(&mut self, session_id: &str) -> bool {
        let removed = self.active.remove(session_id);
        if removed {
            debug!(session_id = %session_id, active = self.active.len(), "Session released");
        }
        removed
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn is_active(&self, session_id: &str) -> bool {
        self.active.contains(session_id)
    }

    /// Check capacity and admit in one step.
    ///
    /// `Ok(None)` means the gate is full and nothing changed.
    pub fn try_reserve(&mut self, session_id: &str) -> Result<Option<Reservation>, DispatchError> {
        validate_session_id(session_id)?;
        if !self.has_capacity() {
            return Ok(None);
        }
        let reservation = if self.is_active(session_id) {
            Reservation::Existing
        } else {
            Reservation::Fresh
        };
        self.admit(session_id)?;
        Ok(Some(reservation))
    }
}

/// Reject empty (or whitespace-only) session ids.
pub fn validate_session_id(session_id: &str) -> Result<(), DispatchError> {
    if session_id.trim().is_empty() {
        return Err(DispatchError::InvalidArgument(
            "session id must not be empty".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_tracks_ceiling() {
        let mut gate = AdmissionGate::new(2);
        assert!(gate.has_capacity());

        gate.admit("a").unwrap();
        assert!(gate.has_capacity());
        gate.admit("b").unwrap();
        assert!(!gate.has_capacity());
        assert_eq!(gate.active_count(), 2);
    }

    #[test]
    fn admit_rejects_empty_id() {
        let mut gate = AdmissionGate::new(2);
        assert!(matches!(
            gate.admit(""),
            Err(DispatchError::InvalidArgument(_))
        ));
        assert_eq!(gate.active_count(), 0);
    }

    #[test]
    fn admit_is_idempotent() {
        let mut gate = AdmissionGate::new(3);
        gate.admit("a").unwrap();
        gate.admit("a").unwrap();
        assert_eq!(gate.active_count(), 1);
    }

    #[test]
    fn release_twice_is_safe() {
        let mut gate = AdmissionGate::new(3);
        gate.admit("a").unwrap();
        gate.admit("b").unwrap();

        assert!(gate.release("a"));
        assert_eq!(gate.active_count(), 1);
        assert!(!gate.release("a"));
        assert_eq!(gate.active_count(), 1);
        assert!(!gate.release("never-admitted"));
    }

    #[test]
    fn try_reserve_stops_at_ceiling() {
        let mut gate = AdmissionGate::new(2);
        assert_eq!(gate.try_reserve("a").unwrap(), Some(Reservation::Fresh));
        assert_eq!(gate.try_reserve("b").unwrap(), Some(Reservation::Fresh));
        assert_eq!(gate.try_reserve("c").unwrap(), None);
        assert!(!gate.is_active("c"));
        assert_eq!(gate.active_count(), 2);
    }

    #[test]
    fn try_reserve_reports_existing_session() {
        let mut gate = AdmissionGate::new(2);
        gate.admit("a").unwrap();

        let reservation = gate.try_reserve("a").unwrap().unwrap();
        assert_eq!(reservation, Reservation::Existing);
        assert!(!reservation.needs_rollback());
        assert_eq!(gate.active_count(), 1);
    }

    #[test]
    fn try_reserve_never_exceeds_ceiling() {
        let mut gate = AdmissionGate::new(3);
        for i in 0..50 {
            let _ = gate.try_reserve(&format!("s{i}")).unwrap();
            assert!(gate.active_count() <= 3);
            if i % 4 == 0 {
                gate.release(&format!("s{}", i / 2));
            }
        }
    }
}
