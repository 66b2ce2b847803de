//! A minimal OAuth2 authorization server.
//!
//! Clients are registered by logged-in users and obtain tokens through the
//! authorization-code grant with an explicit consent step. Login can be gated
//! on confirmation from an external identity network.

use std::sync::Arc;

use sea_orm::DatabaseConnection;

use crate::config::AppConfig;
use crate::oauth2::OAuth2State;
use crate::verification::{IdentityVerifier, PollSettings, VerificationTaskManager};

pub mod api;
pub mod config;
pub mod entity;
pub mod error;
pub mod oauth2;
pub mod session;
pub mod verification;

#[derive(Clone)]
pub struct AppResources {
    pub db: Arc<DatabaseConnection>,
    pub config: Arc<AppConfig>,
    pub oauth2: OAuth2State,
    /// Present only when identity verification is enabled
    pub verifier: Option<Arc<dyn IdentityVerifier>>,
    pub verification_tasks: Arc<VerificationTaskManager>,
}

impl AppResources {
    pub fn new(
        db: Arc<DatabaseConnection>,
        config: Arc<AppConfig>,
        verifier: Option<Arc<dyn IdentityVerifier>>,
    ) -> Self {
        let oauth2 = OAuth2State::new(db.clone(), &config.oauth2);
        let verification_tasks = Arc::new(VerificationTaskManager::new(PollSettings::from(
            &config.verification,
        )));
        Self {
            db,
            config,
            oauth2,
            verifier,
            verification_tasks,
        }
    }
}
