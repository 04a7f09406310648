//! HTTP status server
//!
//! Read-only endpoints for operators and supervisors:
//!
//! - `GET /health` - 200 when the client is connected, 503 otherwise
//! - `GET /status` - current [`DeviceStatus`](crate::protocol::DeviceStatus)
//! - `GET /metrics` - [`ConnectionMetrics`](super::metrics::ConnectionMetrics)
//! - `GET /automaton` - automaton state, 404 when no automaton runs

use crate::automaton::GateAutomaton;
use crate::messaging::MessagingClient;
use crate::resilience::CircuitBreakerSnapshot;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::convert::Infallible;
use std::sync::Arc;
use tracing::info;
use warp::http::StatusCode;
use warp::Filter;

pub struct StatusServer {
    port: u16,
    client: MessagingClient,
    automaton: Option<GateAutomaton>,
}

impl StatusServer {
    pub fn new(port: u16, client: MessagingClient, automaton: Option<GateAutomaton>) -> Self {
        Self {
            port,
            client,
            automaton,
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// All routes, for serving or for `warp::test`
    pub fn routes(
        self: Arc<Self>,
    ) -> impl Filter<Extract = (impl warp::Reply,), Error = warp::Rejection> + Clone {
        let with_server = {
            let server = self.clone();
            warp::any().map(move || server.clone())
        };

        let health = warp::path("health")
            .and(warp::path::end())
            .and(warp::get())
            .and(with_server.clone())
            .and_then(|server: Arc<Self>| async move {
                let report = server.health_report();
                let code = if report.connected {
                    StatusCode::OK
                } else {
                    StatusCode::SERVICE_UNAVAILABLE
                };
                Ok::<_, Infallible>(warp::reply::with_status(warp::reply::json(&report), code))
            });

        let status = warp::path("status")
            .and(warp::path::end())
            .and(warp::get())
            .and(with_server.clone())
            .and_then(|server: Arc<Self>| async move {
                Ok::<_, Infallible>(warp::reply::json(&server.client.get_status()))
            });

        let metrics = warp::path("metrics")
            .and(warp::path::end())
            .and(warp::get())
            .and(with_server.clone())
            .and_then(|server: Arc<Self>| async move {
                Ok::<_, Infallible>(warp::reply::json(&server.client.get_metrics()))
            });

        let automaton = warp::path("automaton")
            .and(warp::path::end())
            .and(warp::get())
            .and(with_server.clone())
            .and_then(|server: Arc<Self>| async move {
                let reply = match &server.automaton {
                    Some(automaton) => warp::reply::with_status(
                        warp::reply::json(&automaton.state()),
                        StatusCode::OK,
                    ),
                    None => warp::reply::with_status(
                        warp::reply::json(&ErrorResponse {
                            error: "Automaton is not running".to_string(),
                            timestamp: Utc::now(),
                        }),
                        StatusCode::NOT_FOUND,
                    ),
                };
                Ok::<_, Infallible>(reply)
            });

        let root = warp::path::end().and(warp::get()).map(|| {
            let endpoints: BTreeMap<&str, &str> = [
                ("/health", "Client liveness"),
                ("/status", "Gate and garage status"),
                ("/metrics", "Connection metrics"),
                ("/automaton", "Gate automaton state"),
            ]
            .into_iter()
            .collect();
            warp::reply::json(&endpoints)
        });

        health.or(status).or(metrics).or(automaton).or(root)
    }

    /// Serve until the task is dropped
    pub async fn start(self: Arc<Self>) {
        let port = self.port;
        info!(port, "Starting status server");
        warp::serve(self.routes()).run(([0, 0, 0, 0], port)).await;
    }

    fn health_report(&self) -> HealthReport {
        let status = self.client.get_status();
        HealthReport {
            status: if status.connected { "healthy" } else { "degraded" },
            client_id: self.client.client_id().to_string(),
            connected: status.connected,
            transport: status.transport.to_string(),
            last_error: status.last_error,
            circuit_breaker: self.client.breaker_snapshot(),
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthReport {
    status: &'static str,
    client_id: String,
    connected: bool,
    transport: String,
    last_error: Option<String>,
    circuit_breaker: CircuitBreakerSnapshot,
    timestamp: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
    timestamp: DateTime<Utc>,
}
