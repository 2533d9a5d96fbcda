// =============================================================================
// PROXIMA — privacy-preserving proximity & shared-interest server
// =============================================================================
// Clients release planar-Laplace-perturbed coordinates, discover nearby users
// and run DH-style PSI over interest sets. This binary wires the library to
// the network: config from env, user provisioning, session expiry sweeper,
// router, graceful shutdown.
// =============================================================================

use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use proxima_server::auth::{self, TokenService};
use proxima_server::http::{router, AppState, Metrics};
use proxima_server::psi::session::SessionManager;
use proxima_server::store::{GeoStore, MemStore, UserStore};

// Development-only fallbacks. Production deployments must set the env vars.
const DEV_TOKEN_SECRET: &str = "proxima-dev-secret-do-not-deploy";
const DEV_USERS: &str =
    "big_ben:secret,london_eye:secret,tower_bridge:secret,wembley:secret,greenwich:secret";

struct Config {
    bind: SocketAddr,
    token_secret: String,
    users: String,
}

impl Config {
    fn from_env() -> Self {
        let port: u16 = std::env::var("PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(8000);
        let token_secret = std::env::var("PROXIMA_TOKEN_SECRET").unwrap_or_else(|_| {
            warn!("PROXIMA_TOKEN_SECRET not set — using the development secret");
            DEV_TOKEN_SECRET.to_string()
        });
        let users = std::env::var("PROXIMA_USERS").unwrap_or_else(|_| {
            warn!("PROXIMA_USERS not set — provisioning the development user list");
            DEV_USERS.to_string()
        });
        Self { bind: SocketAddr::from(([0, 0, 0, 0], port)), token_secret, users }
    }
}

/// Opportunistic expiry sweep. Per-access checks already guarantee
/// correctness; this just keeps the table from accumulating dead entries.
async fn session_sweeper(sessions: Arc<SessionManager>, metrics: Arc<Metrics>) {
    let mut interval = tokio::time::interval(Duration::from_secs(60));
    loop {
        interval.tick().await;
        let removed = sessions.sweep_expired();
        if removed > 0 {
            metrics.sessions_swept.fetch_add(removed as u64, Ordering::Relaxed);
            info!(removed, remaining = sessions.len(), "session_sweep");
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG").unwrap_or("proxima_server=info,tower_http=info".into()),
        )
        .json()
        .init();
    info!("Proxima server starting");

    let config = Config::from_env();

    let store = Arc::new(MemStore::new());
    match auth::provision_users(store.as_ref(), &config.users) {
        Ok(n) => info!(users = n, "provisioned users"),
        Err(e) => {
            eprintln!("[ERROR] user provisioning failed: {e}");
            std::process::exit(1);
        }
    }

    let users: Arc<dyn UserStore> = store.clone();
    let geo: Arc<dyn GeoStore> = store;
    let state = AppState::new(users, geo, TokenService::new(&config.token_secret));

    tokio::spawn(session_sweeper(state.sessions.clone(), state.metrics.clone()));

    let app = router(state);

    let addr = config.bind;
    info!(%addr, "listening");
    let listener = tokio::net::TcpListener::bind(addr).await.unwrap_or_else(|e| {
        eprintln!("\n[ERROR] could not bind {addr}: {e}");
        eprintln!("Most likely the port is already in use.");
        eprintln!("Stop the previous instance or pick another port via PORT.");
        eprintln!("  Example: PORT=8001 cargo run --release\n");
        std::process::exit(1);
    });
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
            info!("shutdown");
        })
        .await
        .unwrap_or_else(|e| {
            eprintln!("[ERROR] server failed: {e}");
            std::process::exit(1);
        });
}
