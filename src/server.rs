//! Command dispatch for the orchestrator protocol.
//!
//! The orchestrator drives the service with single-token string commands
//! over an external transport. [`CommandDispatcher`] maps those tokens onto
//! [`ShotController`] transitions; the transport itself stays outside this
//! crate's core and only has to implement [`CommandLink`].
//!
//! # Protocol
//!
//! | Token | Effect | Reply |
//! |---|---|---|
//! | `hello` | none | `hello` |
//! | token ending in the shot-file suffix | Configure | `ok`, then after a second (empty) receive, `done` |
//! | `done` | Finalize | `ok`, then after a second (empty) receive, `done` |
//! | `abort` | Abort | `done` |
//! | anything else | none | error: invalid request |
//!
//! The dispatcher handles exactly one command at a time and blocks its
//! caller until the transition completes; there is no command pipelining and
//! no concurrent shot handling.

use async_trait::async_trait;
use tracing::debug;

use crate::config::Settings;
use crate::data::storage::ShotToken;
use crate::error::{ScopeError, ShotResult};
use crate::lifecycle::ShotController;

/// Reply side of the control transport.
///
/// The two-phase commands acknowledge with an interim `ok`, wait for the
/// orchestrator's empty follow-up message, run the transition, and only then
/// produce the final reply.
#[async_trait]
pub trait CommandLink: Send {
    /// Send one interim reply to the orchestrator.
    async fn send(&mut self, reply: &str) -> ShotResult<()>;

    /// Receive the orchestrator's next message.
    async fn recv(&mut self) -> ShotResult<String>;
}

/// Maps transport-delivered command tokens onto lifecycle transitions.
pub struct CommandDispatcher {
    controller: ShotController,
    shot_suffix: String,
}

impl CommandDispatcher {
    /// Build a dispatcher owning the controller.
    pub fn new(settings: &Settings, controller: ShotController) -> Self {
        Self {
            controller,
            shot_suffix: settings.service.shot_file_suffix.clone(),
        }
    }

    /// The wrapped controller, for state inspection.
    pub fn controller(&self) -> &ShotController {
        &self.controller
    }

    /// Handle one command token and return the final reply.
    ///
    /// Unrecognized tokens fail with [`ScopeError::ProtocolViolation`]
    /// immediately, with no instrument side effects.
    pub async fn dispatch(
        &mut self,
        request: &str,
        link: &mut dyn CommandLink,
    ) -> ShotResult<String> {
        debug!(request, "dispatching command");
        if request == "hello" {
            Ok("hello".to_string())
        } else if request.ends_with(&self.shot_suffix) {
            link.send("ok").await?;
            let _ = link.recv().await?;
            self.controller.configure(ShotToken::new(request)).await?;
            Ok("done".to_string())
        } else if request == "done" {
            link.send("ok").await?;
            let _ = link.recv().await?;
            self.controller.finalize().await?;
            Ok("done".to_string())
        } else if request == "abort" {
            self.controller.abort().await;
            Ok("done".to_string())
        } else {
            Err(ScopeError::ProtocolViolation(request.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Link stub recording interim replies and feeding empty follow-ups.
    pub(crate) struct RecordingLink {
        pub sent: Vec<String>,
    }

    impl RecordingLink {
        pub(crate) fn new() -> Self {
            Self { sent: Vec::new() }
        }
    }

    #[async_trait]
    impl CommandLink for RecordingLink {
        async fn send(&mut self, reply: &str) -> ShotResult<()> {
            self.sent.push(reply.to_string());
            Ok(())
        }

        async fn recv(&mut self) -> ShotResult<String> {
            Ok(String::new())
        }
    }

    use crate::data::storage::MemoryStore;
    use crate::instrument::mock::MockScope;
    use crate::instrument::ScopeInterface;
    use crate::lifecycle::ShotPhase;
    use std::sync::Arc;
    use std::time::Duration;

    async fn dispatcher() -> (CommandDispatcher, MockScope) {
        let scope = MockScope::new(4);
        let bus = scope.bus(vec!["USB0::0x1AB1::0x04CE::DS1ZA::INSTR".to_string()]);
        let interface = ScopeInterface::connect(&bus, "DS1ZA", Duration::from_millis(0))
            .await
            .unwrap();
        let store = Arc::new(MemoryStore::new());
        let settings = Settings::load(None).unwrap();
        let controller =
            ShotController::new(&settings, interface, store.clone(), store.clone());
        (CommandDispatcher::new(&settings, controller), scope)
    }

    #[tokio::test]
    async fn test_hello_is_side_effect_free() {
        let (mut dispatcher, scope) = dispatcher().await;
        let io_before = scope.command_log().len();
        let mut link = RecordingLink::new();

        let reply = dispatcher.dispatch("hello", &mut link).await.unwrap();
        assert_eq!(reply, "hello");
        assert_eq!(dispatcher.controller().phase(), ShotPhase::Idle);
        assert!(link.sent.is_empty());
        assert_eq!(scope.command_log().len(), io_before);
    }

    #[tokio::test]
    async fn test_unknown_token_is_a_protocol_violation() {
        let (mut dispatcher, scope) = dispatcher().await;
        let io_before = scope.command_log().len();
        let mut link = RecordingLink::new();

        let err = dispatcher.dispatch("restart", &mut link).await.unwrap_err();
        assert!(matches!(err, ScopeError::ProtocolViolation(token) if token == "restart"));
        assert!(link.sent.is_empty());
        assert_eq!(scope.command_log().len(), io_before);
    }

    #[tokio::test]
    async fn test_abort_replies_done_from_idle() {
        let (mut dispatcher, _scope) = dispatcher().await;
        let mut link = RecordingLink::new();

        let reply = dispatcher.dispatch("abort", &mut link).await.unwrap();
        assert_eq!(reply, "done");
        assert_eq!(dispatcher.controller().phase(), ShotPhase::Idle);
    }
}
