//! Verification task lifecycle management.
//!
//! Each login attempt that needs verification gets one background task that
//! contacts the user and then polls the network until it has an answer or the
//! attempt times out. Starting a new attempt for the same user cancels the
//! previous one.

use super::{Contact, IdentityVerifier, VerificationStatus};
use crate::config::VerificationConfig;
use crate::oauth2::identity::AuthenticatedIdentity;
use crate::oauth2::mark_user_verified;
use sea_orm::DatabaseConnection;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::{Instant, interval_at, timeout};

/// Polling cadence and overall bound for one attempt.
#[derive(Debug, Clone, Copy)]
pub struct PollSettings {
    pub interval: Duration,
    pub timeout: Duration,
}

impl From<&VerificationConfig> for PollSettings {
    fn from(config: &VerificationConfig) -> Self {
        Self {
            interval: Duration::from_secs(config.poll_interval_secs),
            timeout: Duration::from_secs(config.timeout_secs),
        }
    }
}

struct Attempt {
    id: String,
    running: Arc<AtomicBool>,
    status: VerificationStatus,
}

/// Tracks the current verification attempt per user.
pub struct VerificationTaskManager {
    attempts: RwLock<HashMap<String, Attempt>>,
    settings: PollSettings,
}

impl VerificationTaskManager {
    pub fn new(settings: PollSettings) -> Self {
        Self {
            attempts: RwLock::new(HashMap::new()),
            settings,
        }
    }

    /// Start verifying `identity`, cancelling any attempt already running for
    /// the same user. Returns the new attempt's id.
    #[tracing::instrument(skip(self, db, verifier, identity, email), fields(user_id = %identity.user_id))]
    pub async fn start_or_restart(
        self: &Arc<Self>,
        db: Arc<DatabaseConnection>,
        verifier: Arc<dyn IdentityVerifier>,
        identity: AuthenticatedIdentity,
        email: Option<String>,
    ) -> String {
        let attempt_id = uuid::Uuid::new_v4().to_string();
        let running = Arc::new(AtomicBool::new(true));
        {
            let mut attempts = self.attempts.write().await;
            if let Some(previous) = attempts.get(&identity.user_id) {
                previous.running.store(false, Ordering::SeqCst);
            }
            attempts.insert(
                identity.user_id.clone(),
                Attempt {
                    id: attempt_id.clone(),
                    running: running.clone(),
                    status: VerificationStatus::Pending,
                },
            );
        }

        let manager = Arc::clone(self);
        let id = attempt_id.clone();
        tokio::spawn(async move {
            let Some(mut status) =
                poll_until_answered(verifier.as_ref(), &identity, email, &running, manager.settings)
                    .await
            else {
                tracing::debug!(user_id = %identity.user_id, "Verification attempt superseded");
                return;
            };

            if status == VerificationStatus::Verified
                && let Err(e) = mark_user_verified(&db, &identity.user_id).await
            {
                tracing::error!(user_id = %identity.user_id, error = %e, "Failed to record verification");
                status = VerificationStatus::Failed;
            }
            manager.finish(&identity.user_id, &id, status).await;
        });

        attempt_id
    }

    /// Outcome of attempt `attempt_id` for `user_id`, if it is still the
    /// current one.
    pub async fn status(&self, user_id: &str, attempt_id: &str) -> Option<VerificationStatus> {
        let attempts = self.attempts.read().await;
        attempts
            .get(user_id)
            .filter(|a| a.id == attempt_id)
            .map(|a| a.status)
    }

    pub async fn is_running(&self, user_id: &str) -> bool {
        let attempts = self.attempts.read().await;
        attempts
            .get(user_id)
            .is_some_and(|a| a.running.load(Ordering::SeqCst))
    }

    /// Forget the user's attempt, cancelling it if still running.
    pub async fn stop(&self, user_id: &str) {
        let mut attempts = self.attempts.write().await;
        if let Some(attempt) = attempts.remove(user_id) {
            attempt.running.store(false, Ordering::SeqCst);
        }
    }

    /// Cancels all running attempts.
    pub async fn stop_all(&self) {
        let mut attempts = self.attempts.write().await;
        for attempt in attempts.values() {
            attempt.running.store(false, Ordering::SeqCst);
        }
        attempts.clear();
    }

    async fn finish(&self, user_id: &str, attempt_id: &str, status: VerificationStatus) {
        let mut attempts = self.attempts.write().await;
        if let Some(attempt) = attempts.get_mut(user_id)
            && attempt.id == attempt_id
        {
            attempt.running.store(false, Ordering::SeqCst);
            attempt.status = status;
            tracing::info!(user_id, ?status, "Verification attempt finished");
        }
    }
}

/// Contact the user, then poll until a terminal answer.
///
/// Returns `None` if the attempt was cancelled. Running out of time is
/// `Failed`; transport errors while polling are retried until then.
async fn poll_until_answered(
    verifier: &dyn IdentityVerifier,
    identity: &AuthenticatedIdentity,
    email: Option<String>,
    running: &AtomicBool,
    settings: PollSettings,
) -> Option<VerificationStatus> {
    let attempt = async {
        let network_id = match verifier.request(identity, email.as_deref()).await {
            Ok(Contact::Requested { network_id }) => network_id,
            Ok(Contact::Unreachable) => return Some(VerificationStatus::Failed),
            Err(e) => {
                tracing::warn!(error = %e, "Could not start verification");
                return Some(VerificationStatus::Failed);
            }
        };

        let mut ticker = interval_at(Instant::now() + settings.interval, settings.interval);
        loop {
            ticker.tick().await;
            if !running.load(Ordering::SeqCst) {
                return None;
            }
            match verifier.verify(&network_id).await {
                Ok(status) if status.is_terminal() => return Some(status),
                Ok(_) => continue,
                Err(e) => tracing::warn!(error = %e, "Verification poll failed, retrying"),
            }
        }
    };

    match timeout(settings.timeout, attempt).await {
        Ok(outcome) => outcome,
        Err(_) => {
            tracing::info!(user_id = %identity.user_id, "Verification timed out");
            running
                .load(Ordering::SeqCst)
                .then_some(VerificationStatus::Failed)
        }
    }
}
