//! Remote session state machine.

/// Lifecycle state of one remote command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    /// Created, no connection attempted yet.
    #[default]
    Init,
    /// Acquiring a pooled connection and opening a channel.
    Connecting,
    /// Command issued, I/O loop running.
    Executing,
    /// Remote side reported completion, reading remaining output.
    Draining,
    /// Finished with an exit status.
    Done,
    /// Ended with an error.
    Failed,
    /// Ended because the caller aborted it.
    Aborted,
}

impl SessionState {
    /// Check if transition to target state is valid.
    ///
    /// Valid transitions:
    /// - Init -> Connecting
    /// - Connecting -> Executing | Failed | Aborted
    /// - Executing -> Draining | Failed | Aborted
    /// - Draining -> Done | Failed
    pub fn can_transition_to(&self, target: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (*self, target),
            (Init, Connecting)
                | (Connecting, Executing)
                | (Connecting, Failed)
                | (Connecting, Aborted)
                | (Executing, Draining)
                | (Executing, Failed)
                | (Executing, Aborted)
                | (Draining, Done)
                | (Draining, Failed)
        )
    }

    /// Attempt to transition to a new state.
    pub fn transition_to(&mut self, target: SessionState) -> crate::Result<()> {
        if self.can_transition_to(target) {
            *self = target;
            Ok(())
        } else {
            Err(crate::error::ExecError::InvalidStateTransition {
                from: *self,
                to: target,
            })
        }
    }

    /// Check if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionState::Done | SessionState::Failed | SessionState::Aborted
        )
    }

    /// Whether the session currently holds a channel.
    pub fn holds_channel(&self) -> bool {
        matches!(self, SessionState::Executing | SessionState::Draining)
    }
}
