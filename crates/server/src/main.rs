use sea_orm::Database;
use std::sync::Arc;
use tnid_oauth_server::AppResources;
use tnid_oauth_server::api::start_webserver;
use tnid_oauth_server::config::load_config_or_panic;
use tnid_oauth_server::verification::{IdentityVerifier, TnidClient};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

fn initialize_standard_tracing() {
    let default_directives = "tnid_oauth_server=info,hyper=warn,sea_orm=info";
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directives));

    let registry = tracing_subscriber::registry().with(env_filter);
    let layer = fmt::layer().with_target(true).with_level(true);

    registry.with(layer).init();
}

#[tokio::main]
async fn main() -> color_eyre::eyre::Result<()> {
    color_eyre::install().expect("Failed to install `color_eyre::install`");
    initialize_standard_tracing();

    // Load config
    let config = Arc::new(load_config_or_panic());

    // Set up SeaORM database connection
    let db = Arc::new(Database::connect(&config.database_url).await?);

    let verifier: Option<Arc<dyn IdentityVerifier>> = if config.verification.enabled {
        let client = TnidClient::new(&config.verification)?;
        tracing::info!(api_url = %config.verification.api_url, "Identity verification enabled");
        Some(Arc::new(client))
    } else {
        tracing::warn!("Identity verification disabled, logins are trusted as entered");
        None
    };

    let resources = AppResources::new(db, config, verifier);
    let tasks = resources.verification_tasks.clone();

    let result = start_webserver(resources).await;
    tasks.stop_all().await;
    result
}
