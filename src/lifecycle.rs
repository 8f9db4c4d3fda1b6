//! Process lifecycle: shutdown signals and the fatal exit policy
//!
//! Background tasks never call `process::exit` themselves. When leadership
//! is lost or the leader's startup callback fails they send a
//! [`FatalShutdown`] on the channel returned by [`fatal_channel`]; the binary
//! turns the first one it receives into an exit code, so that a supervisor
//! restarts the process cleanly as a follower. Tests hold the receiver and
//! assert on what would have happened.

use tokio::signal;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Exit status for errors before the election starts (e.g., no identity)
pub const EXIT_STARTUP_ERROR: i32 = 1;

/// Exit status when leadership was obtained but the leader callback failed
pub const EXIT_STARTUP_CALLBACK_FAILED: i32 = 2;

/// Exit status when leadership was lost or released
pub const EXIT_LEADERSHIP_LOST: i32 = 3;

/// A condition that ends the process
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FatalShutdown {
    /// Leadership was acquired but `on_started_leading` failed
    StartupFailed {
        /// Candidate identity of this process
        identity: String,
        /// Why the callback failed
        reason: String,
    },
    /// Leadership ended: renewal missed its deadline or the lease was released
    LeadershipLost {
        /// Candidate identity of this process
        identity: String,
        /// Why leadership ended
        reason: String,
    },
}

impl FatalShutdown {
    /// Process exit status for this condition
    pub fn exit_code(&self) -> i32 {
        match self {
            FatalShutdown::StartupFailed { .. } => EXIT_STARTUP_CALLBACK_FAILED,
            FatalShutdown::LeadershipLost { .. } => EXIT_LEADERSHIP_LOST,
        }
    }

    /// Human-readable reason
    pub fn reason(&self) -> &str {
        match self {
            FatalShutdown::StartupFailed { reason, .. } => reason,
            FatalShutdown::LeadershipLost { reason, .. } => reason,
        }
    }
}

impl std::fmt::Display for FatalShutdown {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FatalShutdown::StartupFailed { identity, reason } => {
                write!(f, "leader startup failed on {identity}: {reason}")
            }
            FatalShutdown::LeadershipLost { identity, reason } => {
                write!(f, "stopped leading: {identity}: {reason}")
            }
        }
    }
}

/// Sending half of the fatal shutdown channel
#[derive(Clone, Debug)]
pub struct ShutdownSender {
    tx: mpsc::UnboundedSender<FatalShutdown>,
}

impl ShutdownSender {
    /// Report a fatal condition
    pub fn send(&self, fatal: FatalShutdown) {
        error!(exit_code = fatal.exit_code(), reason = %fatal, "Fatal shutdown requested");
        // Receiver gone means the process is already on its way out
        let _ = self.tx.send(fatal);
    }
}

/// Receiving half of the fatal shutdown channel
#[derive(Debug)]
pub struct ShutdownReceiver {
    rx: mpsc::UnboundedReceiver<FatalShutdown>,
}

impl ShutdownReceiver {
    /// Wait for the next fatal condition; `None` once every sender is gone
    pub async fn recv(&mut self) -> Option<FatalShutdown> {
        self.rx.recv().await
    }

    /// Take a pending fatal condition without waiting
    pub fn try_recv(&mut self) -> Option<FatalShutdown> {
        self.rx.try_recv().ok()
    }
}

/// Create a fatal shutdown channel
pub fn fatal_channel() -> (ShutdownSender, ShutdownReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (ShutdownSender { tx }, ShutdownReceiver { rx })
}

/// Wait for SIGINT or SIGTERM
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }
}

/// Cancel `root` when the process receives SIGINT or SIGTERM
pub fn cancel_on_signal(root: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::select! {
            _ = shutdown_signal() => {
                info!("Shutdown signal received, cancelling");
                root.cancel();
            }
            _ = root.cancelled() => {}
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_are_distinct() {
        let startup = FatalShutdown::StartupFailed {
            identity: "pod-a".to_string(),
            reason: "boom".to_string(),
        };
        let lost = FatalShutdown::LeadershipLost {
            identity: "pod-a".to_string(),
            reason: "renew deadline exceeded".to_string(),
        };

        assert_eq!(startup.exit_code(), EXIT_STARTUP_CALLBACK_FAILED);
        assert_eq!(lost.exit_code(), EXIT_LEADERSHIP_LOST);
        assert_ne!(startup.exit_code(), EXIT_STARTUP_ERROR);
        assert_eq!(lost.reason(), "renew deadline exceeded");
        assert_eq!(lost.to_string(), "stopped leading: pod-a: renew deadline exceeded");
    }

    #[tokio::test]
    async fn fatal_conditions_reach_the_receiver() {
        let (tx, mut rx) = fatal_channel();
        assert!(rx.try_recv().is_none());

        tx.send(FatalShutdown::StartupFailed {
            identity: "pod-a".to_string(),
            reason: "boom".to_string(),
        });

        let fatal = rx.recv().await.unwrap();
        assert_eq!(fatal.exit_code(), EXIT_STARTUP_CALLBACK_FAILED);
    }

    #[test]
    fn send_without_receiver_does_not_panic() {
        let (tx, rx) = fatal_channel();
        drop(rx);
        tx.send(FatalShutdown::LeadershipLost {
            identity: "pod-a".to_string(),
            reason: "released".to_string(),
        });
    }

    #[tokio::test]
    async fn signal_task_exits_when_root_cancelled_elsewhere() {
        let root = CancellationToken::new();
        let task = cancel_on_signal(root.clone());
        root.cancel();
        assert!(task.await.is_ok());
    }
}
