//! Atomic connection state word and its legal transition graph.
//!
//! ```text
//! Disconnected → Connecting, Reconnecting, Closed
//! Connecting   → Connected, Disconnected, Closed
//! Connected    → Reconnecting, Closing, Closed
//! Reconnecting → Connecting, Connected, Disconnected, Closed
//! Closing      → Disconnected, Closed
//! Closed       → (absorbing)
//! ```

use std::sync::atomic::{AtomicU32, Ordering};

/// Observable lifecycle state of a [`crate::connection::Connection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ConnState {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
    Reconnecting = 3,
    Closing = 4,
    Closed = 5,
}

impl ConnState {
    fn from_u32(v: u32) -> Self {
        match v {
            0 => ConnState::Disconnected,
            1 => ConnState::Connecting,
            2 => ConnState::Connected,
            3 => ConnState::Reconnecting,
            4 => ConnState::Closing,
            5 => ConnState::Closed,
            _ => unreachable!("invalid encoded ConnState {v}"),
        }
    }
}

impl std::fmt::Display for ConnState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConnState::Disconnected => "disconnected",
            ConnState::Connecting => "connecting",
            ConnState::Connected => "connected",
            ConnState::Reconnecting => "reconnecting",
            ConnState::Closing => "closing",
            ConnState::Closed => "closed",
        };
        write!(f, "{s}")
    }
}

/// Lock-free state word with CAS-serialized transitions.
#[derive(Debug)]
pub struct StateWord(AtomicU32);

impl StateWord {
    pub fn new(initial: ConnState) -> Self {
        Self(AtomicU32::new(initial as u32))
    }

    pub fn load(&self) -> ConnState {
        ConnState::from_u32(self.0.load(Ordering::Acquire))
    }

    /// Attempt `from -> to`. Returns `true` on success. Races are resolved by
    /// `compare_exchange` — the loser observes a changed `from` and no-ops.
    ///
    /// `Closed` is absorbing regardless of the requested `from`: once the
    /// word reads `Closed`, every `try_set`/`try_set_from_any` call fails.
    pub fn try_set(&self, from: ConnState, to: ConnState) -> bool {
        if from == ConnState::Closed {
            return false;
        }
        self.0
            .compare_exchange(from as u32, to as u32, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Attempt `to` from any of several legal originating states.
    ///
    /// Loops a CAS against the current snapshot rather than trying each
    /// candidate `from` in turn, so a concurrent transition between the read
    /// and the CAS attempt is retried instead of silently missed.
    pub fn try_set_from_any(&self, from: &[ConnState], to: ConnState) -> bool {
        loop {
            let current = self.0.load(Ordering::Acquire);
            if current == ConnState::Closed as u32 {
                return false;
            }
            if !from.iter().any(|f| *f as u32 == current) {
                return false;
            }
            match self.0.compare_exchange(
                current,
                to as u32,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(_) => continue,
            }
        }
    }

    pub fn is(&self, state: ConnState) -> bool {
        self.load() == state
    }

    pub fn is_at_least_closing(&self) -> bool {
        matches!(self.load(), ConnState::Closing | ConnState::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn try_set_succeeds_on_matching_from() {
        let s = StateWord::new(ConnState::Disconnected);
        assert!(s.try_set(ConnState::Disconnected, ConnState::Connecting));
        assert_eq!(s.load(), ConnState::Connecting);
    }

    #[test]
    fn try_set_fails_on_mismatched_from() {
        let s = StateWord::new(ConnState::Connected);
        assert!(!s.try_set(ConnState::Disconnected, ConnState::Connecting));
        assert_eq!(s.load(), ConnState::Connected);
    }

    #[test]
    fn try_set_from_any_admits_several_originators() {
        let s = StateWord::new(ConnState::Reconnecting);
        assert!(s.try_set_from_any(
            &[ConnState::Disconnected, ConnState::Reconnecting],
            ConnState::Connecting
        ));
        assert_eq!(s.load(), ConnState::Connecting);
    }

    #[test]
    fn closed_is_absorbing_in_practice() {
        let s = StateWord::new(ConnState::Closed);
        assert!(!s.try_set(ConnState::Closed, ConnState::Disconnected));
    }
}
