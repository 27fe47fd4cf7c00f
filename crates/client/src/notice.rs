//! Deferred surfacing of authentication failures.
//!
//! A token rotation on the gateway side often shows up as one rejected
//! reconnect followed by a successful one a moment later. The gate only
//! reports an auth failure that is still standing after a grace window.

use std::time::Duration;

use {
    tokio::sync::watch,
    tokio_util::sync::CancellationToken,
    tracing::{debug, warn},
};

use crate::connection::{ConnectionState, FailureReason};

#[derive(Debug, Clone, Copy)]
pub struct AuthFailureNotice {
    grace: Duration,
}

fn auth_failure(state: &ConnectionState) -> Option<usize> {
    match state {
        ConnectionState::Failed(FailureReason::AuthFailed { attempts }) => Some(*attempts),
        _ => None,
    }
}

impl AuthFailureNotice {
    pub fn new(grace: Duration) -> Self {
        Self { grace }
    }

    /// Watch `state` and call `on_notice` with the rejected attempt count for
    /// every auth failure that outlives the grace window. Runs until
    /// cancelled or the state channel closes.
    pub async fn run<F>(
        self,
        mut state: watch::Receiver<ConnectionState>,
        cancel: CancellationToken,
        mut on_notice: F,
    ) where
        F: FnMut(usize) + Send,
    {
        loop {
            // Idle until an auth failure shows up.
            let attempts = loop {
                if let Some(attempts) = auth_failure(&state.borrow_and_update()) {
                    break attempts;
                }
                tokio::select! {
                    () = cancel.cancelled() => return,
                    changed = state.changed() => if changed.is_err() { return },
                }
            };

            // Pending: further failures do not restart the window.
            let deadline = tokio::time::sleep(self.grace);
            tokio::pin!(deadline);
            let recovered = loop {
                tokio::select! {
                    () = cancel.cancelled() => return,
                    () = &mut deadline => break false,
                    changed = state.changed() => {
                        if changed.is_err() {
                            return;
                        }
                        if state.borrow_and_update().is_connected() {
                            break true;
                        }
                    },
                }
            };

            if recovered {
                debug!("notice: connection recovered within the grace window");
                continue;
            }
            warn!(attempts, "notice: authentication failure persists");
            on_notice(attempts);

            // One notice per failure episode.
            while auth_failure(&state.borrow_and_update()).is_some() {
                tokio::select! {
                    () = cancel.cancelled() => return,
                    changed = state.changed() => if changed.is_err() { return },
                }
            }
        }
    }
}
