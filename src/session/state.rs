//! The session state lattice.

/// A session's position in its lifecycle.
///
/// Transitions are validated by [`SessionState::can_transition_to`];
/// `Closed` is terminal. UDP sessions (§9 open question (b)) never enter
/// `Securing`/`Secured` — they run `Created -> Connected -> Closing -> Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Just constructed; not yet registered with a selector loop.
    Created,
    /// Registered and exchanging plaintext (or, if TLS is configured, about
    /// to begin a handshake).
    Connected,
    /// A TLS handshake is in progress.
    Securing,
    /// A TLS handshake has completed; application bytes are ciphered.
    Secured,
    /// Torn down has begun; no further application writes are accepted.
    Closing,
    /// Terminal. The session has been removed from its service.
    Closed,
}

impl SessionState {
    /// True if `self -> to` is a permitted transition under §3's lattice.
    pub fn can_transition_to(self, to: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, to),
            (Created, Connected)
                | (Created, Securing)
                | (Created, Closing)
                | (Connected, Securing)
                | (Connected, Closing)
                | (Securing, Secured)
                | (Securing, Closing)
                | (Secured, Connected)
                | (Secured, Securing)
                | (Secured, Closing)
                | (Closing, Closed)
        )
    }

    /// True once no further writes or state transitions are meaningful.
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Closed)
    }

    /// True if the session will reject application writes (`Closing`/`Closed`).
    pub fn rejects_writes(self) -> bool {
        matches!(self, SessionState::Closing | SessionState::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use SessionState::*;

    #[test]
    fn every_documented_transition_is_permitted() {
        let allowed = [
            (Created, Connected),
            (Created, Securing),
            (Created, Closing),
            (Connected, Securing),
            (Connected, Closing),
            (Securing, Secured),
            (Securing, Closing),
            (Secured, Connected),
            (Secured, Securing),
            (Secured, Closing),
            (Closing, Closed),
        ];
        for (from, to) in allowed {
            assert!(from.can_transition_to(to), "{from:?} -> {to:?} should be allowed");
        }
    }

    #[test]
    fn closed_is_terminal() {
        let all = [Created, Connected, Securing, Secured, Closing, Closed];
        for to in all {
            assert!(!Closed.can_transition_to(to));
        }
    }

    #[test]
    fn arbitrary_skips_are_rejected() {
        assert!(!Created.can_transition_to(Secured));
        assert!(!Connected.can_transition_to(Created));
        assert!(!Closing.can_transition_to(Connected));
    }
}
