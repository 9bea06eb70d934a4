//! The inbound HTTP surface: the timer service POSTs expired timers here.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use serde::Deserialize;
use tracing::{info, warn};

use scscf_registrar_core::RegistrarService;

#[derive(Debug, Deserialize)]
pub struct TimerPop {
    pub aor: String,
    #[serde(default)]
    pub binding: Option<String>,
}

pub async fn serve(addr: SocketAddr, registrar: Arc<RegistrarService>) {
    let app = Router::new()
        .route("/timers", post(handle_timer_pop))
        .with_state(registrar);

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            warn!(addr = %addr, error = %e, "could not bind timer-callback port");
            return;
        }
    };
    info!(addr = %addr, "timer-callback endpoint listening");
    if let Err(e) = axum::serve(listener, app).await {
        warn!(error = %e, "timer-callback server exited");
    }
}

async fn handle_timer_pop(
    State(registrar): State<Arc<RegistrarService>>,
    Json(pop): Json<TimerPop>,
) -> StatusCode {
    registrar.handle_timer_pop(&pop.aor).await;
    StatusCode::OK
}
