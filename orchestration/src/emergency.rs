//! Emergency triggers
//!
//! Externally raised conditions that stop dispatching and force the current
//! phase to escalate, bypassing retry bookkeeping. The first trigger raised
//! wins; later ones are logged and dropped.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Condition that forces an immediate escalation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "trigger", rename_all = "snake_case")]
pub enum EmergencyTrigger {
    UserAbort,
    ResourceExhaustion { resource: String },
    DependencyResolutionFailure { detail: String },
    CatastrophicBuildFailure { detail: String },
    CatastrophicTestFailure { detail: String },
    ExternalHalt { reason: String },
}

impl fmt::Display for EmergencyTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UserAbort => write!(f, "user abort"),
            Self::ResourceExhaustion { resource } => write!(f, "resource exhaustion: {resource}"),
            Self::DependencyResolutionFailure { detail } => {
                write!(f, "dependency resolution failure: {detail}")
            }
            Self::CatastrophicBuildFailure { detail } => {
                write!(f, "catastrophic build failure: {detail}")
            }
            Self::CatastrophicTestFailure { detail } => {
                write!(f, "catastrophic test failure: {detail}")
            }
            Self::ExternalHalt { reason } => write!(f, "external halt: {reason}"),
        }
    }
}

/// Channel through which callers raise an emergency into a running pipeline
#[derive(Debug, Default)]
pub struct EmergencyChannel {
    token: CancellationToken,
    trigger: Mutex<Option<EmergencyTrigger>>,
}

/// Shared handle to an emergency channel
pub type SharedEmergencyChannel = Arc<EmergencyChannel>;

impl EmergencyChannel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> SharedEmergencyChannel {
        Arc::new(Self::new())
    }

    /// Raise a trigger. Returns false if one was already raised.
    pub fn raise(&self, trigger: EmergencyTrigger) -> bool {
        let mut slot = self.trigger.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = slot.as_ref() {
            warn!(%existing, ignored = %trigger, "Emergency already raised");
            return false;
        }
        warn!(%trigger, "Emergency raised");
        *slot = Some(trigger);
        self.token.cancel();
        true
    }

    /// The raised trigger, if any
    pub fn triggered(&self) -> Option<EmergencyTrigger> {
        self.trigger
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn is_raised(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once a trigger is raised
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    /// Token cancelled when a trigger is raised.
    ///
    /// This is a child token: cancelling it does not raise the channel. Use
    /// [`EmergencyChannel::raise`] for that.
    pub fn token(&self) -> CancellationToken {
        self.token.child_token()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_first_trigger_wins() {
        let channel = EmergencyChannel::new();
        assert!(!channel.is_raised());
        assert!(channel.raise(EmergencyTrigger::UserAbort));
        assert!(!channel.raise(EmergencyTrigger::ExternalHalt {
            reason: "later".into()
        }));
        assert_eq!(channel.triggered(), Some(EmergencyTrigger::UserAbort));
        assert!(channel.is_raised());
    }

    #[tokio::test]
    async fn test_cancelled_resolves_after_raise() {
        let channel = EmergencyChannel::shared();
        let raiser = channel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            raiser.raise(EmergencyTrigger::ResourceExhaustion {
                resource: "memory".into(),
            });
        });
        tokio::time::timeout(Duration::from_secs(1), channel.cancelled())
            .await
            .expect("emergency should cancel");
        assert!(channel.token().is_cancelled());
    }

    #[test]
    fn test_cancelling_handed_out_token_does_not_raise() {
        let channel = EmergencyChannel::new();
        let token = channel.token();
        token.cancel();
        assert!(!channel.is_raised());
        assert_eq!(channel.triggered(), None);
        assert!(!channel.token().is_cancelled());

        channel.raise(EmergencyTrigger::UserAbort);
        assert!(channel.token().is_cancelled());
    }

    #[test]
    fn test_display_includes_detail() {
        let trigger = EmergencyTrigger::CatastrophicTestFailure {
            detail: "all suites crashed".into(),
        };
        assert_eq!(
            trigger.to_string(),
            "catastrophic test failure: all suites crashed"
        );
    }
}
