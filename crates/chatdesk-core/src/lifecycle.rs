//! Session lifecycle: `waiting -> active -> closed`, with a visitor message
//! on a closed session reopening it to `waiting`.

use crate::chat::{MessageKind, SessionStatus};
use crate::errors::ChatError;

/// Something that may move a session between states.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LifecycleEvent {
    Message(MessageKind),
    Close,
    Survey,
}

/// Compute the status that follows `current` once `event` is applied.
pub fn next_status(current: SessionStatus, event: LifecycleEvent) -> Result<SessionStatus, ChatError> {
    use SessionStatus::*;

    let next = match (current, event) {
        (Waiting, LifecycleEvent::Message(MessageKind::Agent)) => Active,
        (Closed, LifecycleEvent::Message(MessageKind::Visitor)) => Waiting,
        (status, LifecycleEvent::Message(_)) => status,
        (_, LifecycleEvent::Close) => Closed,
        (Closed, LifecycleEvent::Survey) => Closed,
        (status, LifecycleEvent::Survey) => {
            return Err(ChatError::SurveyRejected(format!(
                "session is {status}, surveys are accepted only after close"
            )))
        }
    };

    check_transition(current, next, event)?;
    Ok(next)
}

/// Guard for every status write. Only the edges of the lifecycle graph pass.
pub fn check_transition(
    from: SessionStatus,
    to: SessionStatus,
    event: LifecycleEvent,
) -> Result<(), ChatError> {
    use SessionStatus::*;

    let legal = match (from, to, event) {
        (a, b, _) if a == b => true,
        (_, Closed, LifecycleEvent::Close) => true,
        (Waiting, Active, LifecycleEvent::Message(MessageKind::Agent)) => true,
        (Closed, Waiting, LifecycleEvent::Message(MessageKind::Visitor)) => true,
        _ => false,
    };

    if legal {
        Ok(())
    } else {
        Err(ChatError::IllegalTransition { from, to })
    }
}
