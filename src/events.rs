use callcore::{CallState, ParticipantId, SessionId};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Severity of a user-facing notice (rendered as a toast).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeKind {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub kind: NoticeKind,
    pub message: String,
}

impl Notice {
    pub fn info(message: impl Into<String>) -> Self {
        Self {
            kind: NoticeKind::Info,
            message: message.into(),
        }
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self {
            kind: NoticeKind::Warning,
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            kind: NoticeKind::Error,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StateChanged {
    pub session_id: Option<SessionId>,
    pub from: &'static str,
    pub state: CallState,
}

/// An offer arrived and the incoming-call prompt should be shown.
#[derive(Debug, Clone)]
pub struct IncomingCall {
    pub session_id: SessionId,
    pub from: ParticipantId,
}

// Macro to generate EventBus fields and constructor
macro_rules! define_event_bus {
    ($(($field:ident, $type:ty)),* $(,)?) => {
        /// Typed event bus with a broadcast channel per event type.
        #[derive(Debug)]
        pub struct EventBus {
            $(
                pub $field: broadcast::Sender<$type>,
            )*
        }

        impl EventBus {
            pub fn new(capacity: usize) -> Self {
                let capacity = capacity.max(1);
                Self {
                    $(
                        $field: broadcast::channel(capacity).0,
                    )*
                }
            }
        }
    };
}

define_event_bus! {
    (state_changed, Arc<StateChanged>),
    (incoming_call, Arc<IncomingCall>),
    (notice, Arc<Notice>),
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(100)
    }
}

impl EventBus {
    // Sends fail only when nobody is listening, which is fine.
    pub fn emit_state(&self, event: StateChanged) {
        let _ = self.state_changed.send(Arc::new(event));
    }

    pub fn emit_incoming(&self, event: IncomingCall) {
        let _ = self.incoming_call.send(Arc::new(event));
    }

    pub fn emit_notice(&self, notice: Notice) {
        let _ = self.notice.send(Arc::new(notice));
    }
}
