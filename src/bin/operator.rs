use std::future::IntoFuture as _;

use mongo_operator::{
    config::OperatorConfig,
    operator::{self, State},
    telemetry,
};
use tokio::net::TcpListener;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = OperatorConfig::from_env()?;
    telemetry::init(config.log_format).await?;

    // Initialize Kubernetes controller state
    let state = State::default();
    let controller = operator::MongoDBController::new(state.clone());

    // Start web server
    let listener = TcpListener::bind(&config.listen_addr).await?;
    let router = handlers::router();
    let server = axum::serve(listener, router.with_state(state));

    // Run both the http server and the controller, stopping when either one does
    tokio::select! {
        c = controller.run(config) => c,
        s = server.into_future() => {
            s?;
            anyhow::bail!("server exited early")
        }
    }
}

/// Handlers for the web server portion of the operator
mod handlers {
    use axum::{extract::State, http::StatusCode, response::IntoResponse, routing, Json, Router};
    use prometheus::{Encoder, TextEncoder};

    use mongo_operator::operator::State as OperatorState;

    /// Construct the router for all the handlers
    pub fn router() -> Router<OperatorState> {
        Router::new()
            .route("/metrics", routing::get(metrics))
            .route("/health", routing::get(health))
            .route("/", routing::get(index))
    }

    /// Handler for exposing prometheus metrics
    async fn metrics(State(state): State<OperatorState>) -> impl IntoResponse {
        let metrics = state.metrics();
        let encoder = TextEncoder::new();
        let mut buffer = vec![];
        match encoder.encode(&metrics, &mut buffer) {
            Ok(()) => (StatusCode::OK, buffer),
            Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string().into_bytes()),
        }
    }

    /// Handler for checking the health of the server
    async fn health() -> impl IntoResponse {
        (StatusCode::OK, Json("healthy"))
    }

    /// Handler for interacting with the operator
    async fn index(State(state): State<OperatorState>) -> impl IntoResponse {
        let diagnostics = state.diagnostics().await;

        (StatusCode::OK, Json(diagnostics))
    }
}
