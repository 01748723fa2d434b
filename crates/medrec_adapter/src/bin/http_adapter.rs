#![forbid(unsafe_code)]

use std::{env, net::SocketAddr, str::FromStr, sync::Arc, time::Duration};

use axum::{
    extract::{rejection::JsonRejection, DefaultBodyLimit, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use medrec_adapter::{
    request_body_limit_bytes, AdapterErrorResponse, AdapterRuntime,
    SubmitDerivedSymptomAdapterRequest, SubmitFileAdapterRequest, SubmitSymptomAdapterRequest,
};
use medrec_engines::gateway::FileGatewayConfig;
use medrec_os::derived_symptom_worker::DerivedSymptomWorkerConfig;
use serde::{Deserialize, Serialize};
use tracing::{error, info, Level};

type SharedRuntime = Arc<AdapterRuntime>;

#[derive(Debug, Deserialize)]
struct ActorQuery {
    actor_id: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let bind = env::var("MEDREC_HTTP_BIND").unwrap_or_else(|_| "127.0.0.1:8080".to_string());
    let addr: SocketAddr = bind.parse()?;
    let worker = DerivedSymptomWorkerConfig::from_env();
    let body_limit = request_body_limit_bytes(FileGatewayConfig::from_env().max_file_bytes);

    let runtime: SharedRuntime = Arc::new(AdapterRuntime::default_from_env()?);
    if worker.enabled {
        let runtime_for_worker = runtime.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(worker.interval_ms));
            loop {
                ticker.tick().await;
                let rt = runtime_for_worker.clone();
                let pass = tokio::task::spawn_blocking(move || {
                    rt.run_derived_symptom_worker_pass(None)
                })
                .await;
                match pass {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => error!(error = %err, "derived symptom worker pass failed"),
                    Err(err) => error!(error = %err, "derived symptom worker task panicked"),
                }
            }
        });
    }

    let app = Router::new()
        .route("/healthz", get(healthz))
        .route("/v1/symptoms", post(submit_symptom))
        .route("/v1/files", post(submit_file))
        .route("/v1/derived-symptoms", post(submit_derived_symptom))
        .route("/v1/derived-symptoms/:job_id", get(derived_symptom_job_status))
        .route("/v1/subjects/:subject_index/evidence", get(view_evidence))
        .route(
            "/v1/subjects/:subject_index/images/:entry_index",
            get(view_decoded_image),
        )
        .route(
            "/v1/subjects/:subject_index/files/:content_id",
            get(fetch_file),
        )
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(runtime);

    info!(
        %addr,
        worker_enabled = worker.enabled,
        worker_interval_ms = worker.interval_ms,
        body_limit,
        "medrec_adapter_http listening"
    );
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

fn init_tracing() {
    let level = env::var("MEDREC_LOG_LEVEL")
        .ok()
        .and_then(|v| Level::from_str(v.trim()).ok())
        .unwrap_or(Level::INFO);
    let json = matches!(
        env::var("MEDREC_LOG_JSON").ok().as_deref().map(str::trim),
        Some("1") | Some("true") | Some("on")
    );
    if json {
        tracing_subscriber::fmt()
            .with_max_level(level)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_max_level(level).init();
    }
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "failed to listen for shutdown signal");
    }
}

/// Service calls block (ledger mutex, blob store HTTP, retry backoff), so
/// they run off the async executor.
async fn run_blocking<T, F>(runtime: SharedRuntime, f: F) -> Response
where
    T: Serialize + Send + 'static,
    F: FnOnce(&AdapterRuntime) -> Result<T, AdapterErrorResponse> + Send + 'static,
{
    match tokio::task::spawn_blocking(move || f(&runtime)).await {
        Ok(Ok(body)) => (StatusCode::OK, Json(body)).into_response(),
        Ok(Err(err)) => error_response(err),
        Err(join) => error_response(AdapterErrorResponse::new(
            "INTERNAL",
            format!("request task failed: {join}"),
        )),
    }
}

fn error_response(err: AdapterErrorResponse) -> Response {
    let status =
        StatusCode::from_u16(err.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(err)).into_response()
}

fn rejection_response(rejection: JsonRejection) -> Response {
    error_response(AdapterErrorResponse::body_rejected(
        rejection.status().as_u16(),
        rejection.body_text(),
    ))
}

async fn healthz(State(runtime): State<SharedRuntime>) -> Response {
    match runtime.health_report() {
        Ok(report) => (StatusCode::OK, Json(report)).into_response(),
        Err(reason) => error_response(AdapterErrorResponse::new("UNHEALTHY", reason)),
    }
}

async fn submit_symptom(
    State(runtime): State<SharedRuntime>,
    request: Result<Json<SubmitSymptomAdapterRequest>, JsonRejection>,
) -> Response {
    match request {
        Ok(Json(request)) => run_blocking(runtime, move |rt| rt.submit_symptom(request)).await,
        Err(rejection) => rejection_response(rejection),
    }
}

async fn submit_file(
    State(runtime): State<SharedRuntime>,
    request: Result<Json<SubmitFileAdapterRequest>, JsonRejection>,
) -> Response {
    match request {
        Ok(Json(request)) => run_blocking(runtime, move |rt| rt.submit_file(request)).await,
        Err(rejection) => rejection_response(rejection),
    }
}

async fn submit_derived_symptom(
    State(runtime): State<SharedRuntime>,
    request: Result<Json<SubmitDerivedSymptomAdapterRequest>, JsonRejection>,
) -> Response {
    match request {
        Ok(Json(request)) => run_blocking(runtime, move |rt| rt.submit_derived_symptom(request)).await,
        Err(rejection) => rejection_response(rejection),
    }
}

async fn derived_symptom_job_status(
    State(runtime): State<SharedRuntime>,
    Path(job_id): Path<String>,
    Query(query): Query<ActorQuery>,
) -> Response {
    run_blocking(runtime, move |rt| {
        rt.derived_symptom_job_status(&query.actor_id, &job_id)
    })
    .await
}

async fn view_evidence(
    State(runtime): State<SharedRuntime>,
    Path(subject_index): Path<u32>,
    Query(query): Query<ActorQuery>,
) -> Response {
    run_blocking(runtime, move |rt| {
        rt.view_evidence(&query.actor_id, subject_index)
    })
    .await
}

async fn view_decoded_image(
    State(runtime): State<SharedRuntime>,
    Path((subject_index, entry_index)): Path<(u32, u32)>,
    Query(query): Query<ActorQuery>,
) -> Response {
    run_blocking(runtime, move |rt| {
        rt.view_decoded_image(&query.actor_id, subject_index, entry_index)
    })
    .await
}

async fn fetch_file(
    State(runtime): State<SharedRuntime>,
    Path((subject_index, content_id)): Path<(u32, String)>,
    Query(query): Query<ActorQuery>,
) -> Response {
    run_blocking(runtime, move |rt| {
        rt.fetch_file(&query.actor_id, subject_index, &content_id)
    })
    .await
}
