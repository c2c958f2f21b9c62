//! HTTP trigger surface for the cron jobs plus a health probe.

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use dealspy_sync::{CronJobs, Runtime};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::{error, info, warn};

pub const CRATE_NAME: &str = "dealspy-web";

#[derive(Clone)]
pub struct AppState {
    pub jobs: Arc<dyn CronJobs>,
    /// Without a secret every cron request is refused.
    pub cron_secret: Option<String>,
}

impl AppState {
    pub fn new(jobs: Arc<dyn CronJobs>, cron_secret: Option<String>) -> Self {
        Self { jobs, cron_secret }
    }
}

#[derive(Debug, Default, Deserialize)]
struct CronQuery {
    #[serde(default, alias = "dryRun")]
    dry_run: Option<String>,
}

impl CronQuery {
    fn dry_run(&self) -> bool {
        matches!(self.dry_run.as_deref(), Some("1" | "true"))
    }
}

#[derive(Serialize)]
struct JobResponse<T: Serialize> {
    success: bool,
    #[serde(flatten)]
    result: T,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health_handler))
        .route("/api/cron/scrape", get(scrape_handler).post(scrape_handler))
        .route("/api/cron/notify", get(notify_handler).post(notify_handler))
        .route("/api/cron/digest", get(digest_handler).post(digest_handler))
        .with_state(Arc::new(state))
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let runtime = Runtime::from_env()?;
    let port = runtime.config().web_port;
    let cron_secret = runtime.config().cron_secret.clone();
    if cron_secret.is_none() {
        warn!("CRON_SECRET is not set, cron endpoints will refuse every request");
    }
    let state = AppState::new(Arc::new(runtime), cron_secret);
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health_handler() -> Response {
    Json(serde_json::json!({ "status": "ok" })).into_response()
}

async fn scrape_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<CronQuery>,
) -> Response {
    if let Err(resp) = authorize(&state, &headers) {
        return resp;
    }
    job_response("scrape", state.jobs.scrape(query.dry_run()).await)
}

async fn notify_handler(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    if let Err(resp) = authorize(&state, &headers) {
        return resp;
    }
    job_response("notify", state.jobs.notify().await)
}

async fn digest_handler(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    if let Err(resp) = authorize(&state, &headers) {
        return resp;
    }
    job_response("digest", state.jobs.digest().await)
}

fn authorize(state: &AppState, headers: &HeaderMap) -> Result<(), Response> {
    let presented = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    match (&state.cron_secret, presented) {
        (Some(secret), Some(token)) if token == secret => Ok(()),
        _ => Err((StatusCode::UNAUTHORIZED, Json(serde_json::json!({ "error": "Unauthorized" }))).into_response()),
    }
}

fn job_response<T: Serialize>(job: &'static str, result: anyhow::Result<T>) -> Response {
    match result {
        Ok(summary) => Json(JobResponse {
            success: true,
            result: summary,
        })
        .into_response(),
        Err(err) => {
            error!(job, error = %format!("{err:#}"), "job failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({
                    "error": format!("{job} job failed"),
                    "details": format!("{err:#}"),
                })),
            )
                .into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use chrono::Utc;
    use dealspy_sync::{DigestSummary, IngestSummary, NotifySummary, ScraperStats, StoreTally};
    use http_body_util::BodyExt;
    use std::sync::Mutex;
    use tower::ServiceExt;

    #[derive(Default)]
    struct FakeJobs {
        scrapes: Mutex<Vec<bool>>,
    }

    #[async_trait]
    impl CronJobs for FakeJobs {
        async fn scrape(&self, dry_run: bool) -> anyhow::Result<IngestSummary> {
            self.scrapes.lock().unwrap().push(dry_run);
            Ok(IngestSummary {
                run_id: uuid::Uuid::new_v4(),
                started_at: Utc::now(),
                finished_at: Utc::now(),
                dry_run,
                stats: ScraperStats::default(),
                stored: StoreTally {
                    new_deals: 4,
                    duplicates: 1,
                    failed: 0,
                },
            })
        }

        async fn notify(&self) -> anyhow::Result<NotifySummary> {
            anyhow::bail!("database unavailable")
        }

        async fn digest(&self) -> anyhow::Result<DigestSummary> {
            Ok(DigestSummary {
                total_deals: 3,
                sent: 2,
                failed: 0,
                skipped: 1,
            })
        }
    }

    fn test_app(jobs: Arc<FakeJobs>) -> Router {
        app(AppState::new(jobs, Some("s3cret".into())))
    }

    fn cron_request(method: &str, uri: &str, token: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }
        builder.body(Body::empty()).unwrap()
    }

    async fn json_body(resp: Response) -> serde_json::Value {
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn health_needs_no_secret() {
        let resp = test_app(Arc::default())
            .oneshot(Request::builder().uri("/api/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(json_body(resp).await["status"], "ok");
    }

    #[tokio::test]
    async fn wrong_or_missing_secret_is_unauthorized() {
        let jobs = Arc::new(FakeJobs::default());
        let app = test_app(jobs.clone());
        for token in [None, Some("guess")] {
            let resp = app
                .clone()
                .oneshot(cron_request("POST", "/api/cron/scrape", token))
                .await
                .unwrap();
            assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        }
        assert!(jobs.scrapes.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn unset_secret_refuses_everything() {
        let app = app(AppState::new(Arc::new(FakeJobs::default()), None));
        let resp = app
            .oneshot(cron_request("GET", "/api/cron/digest", Some("")))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn scrape_runs_with_dry_run_flag() {
        let jobs = Arc::new(FakeJobs::default());
        let resp = test_app(jobs.clone())
            .oneshot(cron_request("GET", "/api/cron/scrape?dry_run=1", Some("s3cret")))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = json_body(resp).await;
        assert_eq!(body["success"], true);
        assert_eq!(body["dry_run"], true);
        assert_eq!(body["new_deals"], 4);
        assert_eq!(*jobs.scrapes.lock().unwrap(), vec![true]);
    }

    #[tokio::test]
    async fn digest_returns_counts() {
        let resp = test_app(Arc::default())
            .oneshot(cron_request("POST", "/api/cron/digest", Some("s3cret")))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = json_body(resp).await;
        assert_eq!(body["sent"], 2);
        assert_eq!(body["skipped"], 1);
    }

    #[tokio::test]
    async fn failing_job_is_a_server_error() {
        let resp = test_app(Arc::default())
            .oneshot(cron_request("POST", "/api/cron/notify", Some("s3cret")))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = json_body(resp).await;
        assert_eq!(body["error"], "notify job failed");
        assert!(body["details"].as_str().unwrap().contains("database unavailable"));
    }
}
