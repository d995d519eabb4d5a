//! Headless driver client for the `fieldtrack` engine.
//!
//! Runs one tracking session end to end:
//! - Loading configuration from environment variables or `.env`
//! - Initializing structured logging/tracing
//! - Signing the driver in and loading profile, assignment and routes
//! - Replaying a recorded track as the device location source
//! - Streaming positions to the remote store until Ctrl-C, then clearing the
//!   current position and signing out
//!
//! # Environment Variables
//! - `FIELDTRACK_DATABASE_URL`, `FIELDTRACK_API_KEY` (**required**)
//! - `FIELDTRACK_EMAIL`, `FIELDTRACK_PASSWORD`, `FIELDTRACK_TRACK_FILE`
//!   (**required** by this binary)
//! - `FIELDTRACK_LOG_LEVEL` (optional) – log verbosity (default: `debug`)
//! - `FIELDTRACK_SPAN_EVENTS` (optional) – span event mode for tracing
//!
//! See [`fieldtrack::config`] for the remaining settings.
use std::{env, io::IsTerminal, sync::Arc};

use anyhow::{anyhow, Context, Result};
use dotenvy::dotenv;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::format::FmtSpan;

use fieldtrack::store::{FirebaseIdentity, IdentityProvider, RemoteStore, RestStore};
use fieldtrack::{
    config, LocationProvider, ReplayLocationSource, RouteCatalog, RouteTrackingOrchestrator,
    SessionStateMachine, SyncGateway,
};

// ---

#[tokio::main]
async fn main() -> Result<()> {
    // ---
    init_tracing();
    dotenv().ok();

    let cfg = config::load_from_env()?;
    cfg.log_config();

    let email = cfg
        .email
        .clone()
        .ok_or_else(|| anyhow!("FIELDTRACK_EMAIL must be set in .env or environment"))?;
    let password = cfg
        .password
        .clone()
        .ok_or_else(|| anyhow!("FIELDTRACK_PASSWORD must be set in .env or environment"))?;
    let track_file = cfg
        .track_file
        .clone()
        .ok_or_else(|| anyhow!("FIELDTRACK_TRACK_FILE must be set in .env or environment"))?;

    let client = reqwest::Client::new();
    let identity: Arc<dyn IdentityProvider> = Arc::new(FirebaseIdentity::new(
        client.clone(),
        cfg.identity_url.clone(),
        cfg.token_url.clone(),
        cfg.api_key.clone(),
    ));
    let store: Arc<dyn RemoteStore> = Arc::new(RestStore::new(
        client,
        cfg.database_url.clone(),
        Arc::clone(&identity),
    ));

    let session = Arc::new(SessionStateMachine::new(
        Arc::clone(&identity),
        Arc::clone(&store),
        None,
    ));
    let conductor = session
        .login(&email, &password)
        .await
        .map_err(|e| anyhow!("{}: {}", e.user_message(), e))?;
    tracing::info!("Signed in as {} <{}>", conductor.name, conductor.email);

    let catalog = RouteCatalog::new(Arc::clone(&session), Arc::clone(&store));
    match catalog.load_routes().await {
        Ok(routes) => {
            for route in &routes {
                tracing::info!(
                    "Route {} \"{}\" {:?}: {} stops, {}, {}",
                    route.id,
                    route.name,
                    route.status,
                    route.stops.len(),
                    route.distance_label(),
                    route.duration_label()
                );
            }
        }
        Err(e) => tracing::warn!("Failed to load routes: {}", e),
    }

    let active = catalog.active_route().await;
    tracing::info!("Active route: {} ({} stops)", active.route_name, active.stops.len());

    let source = ReplayLocationSource::from_file(&track_file)
        .with_context(|| format!("Failed to load track {}", track_file.display()))?;
    let provider = LocationProvider::with_buffer(Arc::new(source), cfg.location_buffer);
    let gateway = Arc::new(SyncGateway::new(Arc::clone(&identity), Arc::clone(&store)));

    let tracker = RouteTrackingOrchestrator::new(
        Arc::clone(&session),
        provider,
        gateway,
        cfg.tracking_settings(),
    );

    if let Err(e) = tracker.start().await {
        session.logout().await;
        return Err(anyhow!("Cannot start tracking: {}", e));
    }

    let mut running = tracker.subscribe_running();
    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("Failed to listen for Ctrl-C")?;
            tracing::info!("Interrupted, stopping route");
        }
        _ = running.wait_for(|r| !*r) => {
            tracing::warn!("Tracking ended on its own: {:?}", tracker.status().last_error);
        }
    }

    tracker.stop().await;
    let status = tracker.status();
    tracing::info!(
        "Last synced at {:?}, {} failed writes",
        status.last_synced_at,
        status.failed_writes
    );

    session.logout().await;
    Ok(())
}

// ---

/// Initialize the global tracing subscriber for structured logging.
///
/// This function configures the [`tracing_subscriber`] with:
/// - Log target, file, and line number output enabled
/// - Color output controlled by TTY detection and `FORCE_COLOR` env var:
///   - `FORCE_COLOR=1|true|yes`: force colors on
///   - `FORCE_COLOR=0|false|no`: force colors off
///   - unset or other values: auto-detect TTY
/// - Span event emission mode controlled by the `FIELDTRACK_SPAN_EVENTS` env var:
///   - `"full"`       : emit ENTER, EXIT, and CLOSE events with timing
///   - `"enter_exit"` : emit ENTER and EXIT only
///   - unset or other values: emit CLOSE events only (default)
/// - Log level controlled by the `FIELDTRACK_LOG_LEVEL` env var
///
/// Called once at startup, before any logging macro runs.
fn init_tracing() {
    // ---
    let span_events = match env::var("FIELDTRACK_SPAN_EVENTS").as_deref() {
        Ok("full") => FmtSpan::FULL,
        Ok("enter_exit") => FmtSpan::ENTER | FmtSpan::EXIT,
        _ => FmtSpan::CLOSE,
    };

    // Determine if we should use colors
    let use_color = match env::var("FORCE_COLOR").as_deref() {
        Ok("1") | Ok("true") | Ok("yes") => true,
        Ok("0") | Ok("false") | Ok("no") => false,
        _ => std::io::stdout().is_terminal(),
    };

    // Use RUST_LOG if available, otherwise fall back to FIELDTRACK_LOG_LEVEL
    let env_filter = if env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = match env::var("FIELDTRACK_LOG_LEVEL").ok().as_deref() {
            Some("trace") => "trace",
            Some("debug") => "debug",
            Some("info") => "info",
            Some("warn") => "warn",
            Some("error") => "error",
            _ => "debug",
        };
        EnvFilter::new(format!("{level},hyper=warn,reqwest=warn"))
    };

    tracing_subscriber::fmt()
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(span_events)
        .with_env_filter(env_filter)
        .with_ansi(use_color)
        .compact()
        .init();
}
