use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use poem::http::{StatusCode, header};
use poem::listener::TcpListener;
use poem::web::{Data, Path, Query};
use poem::{Endpoint, EndpointExt, Request, Response, Route, Server, handler};
use ring::hmac;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::{error, info, warn};

use crate::oauth::{OAuthError, OAuthLogin};
use crate::platform::CertificateHost;
use crate::policy::{CleanupTrigger, ExpiryPolicy};
use crate::renewal;
use crate::status::{self, SELF_TEST_TOKEN};
use crate::store::OperationStore;
use crate::task::TaskQueue;
use crate::workflow::Workflow;

const STATUS_PATH: &str = "/ssl-certificates/status";
const TEAPOT_BODY: &str = "I'm a teapot!";

/// Bearer token check for operator routes.
pub struct OperatorAuth {
    key: hmac::Key,
    expected: hmac::Tag,
}

impl OperatorAuth {
    #[must_use]
    pub fn new(token: &str) -> Self {
        let key = hmac::Key::new(hmac::HMAC_SHA256, token.as_bytes());
        let expected = hmac::sign(&key, token.as_bytes());
        Self { key, expected }
    }

    fn verify(&self, req: &Request) -> bool {
        let Some(provided) = req
            .headers()
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .filter(|v| !v.is_empty())
        else {
            return false;
        };
        hmac::verify(&self.key, provided.as_bytes(), self.expected.as_ref()).is_ok()
    }
}

/// Where the status view sends its self-test request.
#[derive(Debug, Clone)]
pub struct SelfTestTarget {
    pub base_url: String,
    pub timeout: Duration,
}

pub struct AppState {
    pub workflow: Arc<Workflow>,
    pub queue: Arc<dyn TaskQueue>,
    pub host: Arc<dyn CertificateHost>,
    pub operations: Arc<dyn OperationStore>,
    pub cleanup: Arc<dyn CleanupTrigger>,
    pub oauth: Option<Arc<OAuthLogin>>,
    pub auth: OperatorAuth,
    pub expiry: ExpiryPolicy,
    pub renew_before: Duration,
    pub self_test: Option<SelfTestTarget>,
    pub http: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct CreateParams {
    hostname: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DeleteParams {
    id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OAuthCallbackParams {
    code: Option<String>,
    state: Option<String>,
}

#[derive(Debug, Serialize)]
struct CreateReply<'a> {
    hostname: &'a str,
    token: &'a str,
    stage: &'a str,
    issue_queued: bool,
}

fn text(status: StatusCode, body: impl Into<String>) -> Response {
    Response::builder()
        .status(status)
        .content_type("text/plain; charset=utf-8")
        .body(body.into())
}

fn json<T: Serialize>(value: &T) -> Response {
    match serde_json::to_string(value) {
        Ok(body) => Response::builder()
            .status(StatusCode::OK)
            .content_type("application/json")
            .body(body),
        Err(err) => text(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to encode response: {err}"),
        ),
    }
}

fn redirect(location: &str) -> Response {
    Response::builder()
        .status(StatusCode::FOUND)
        .header(header::LOCATION, location)
        .finish()
}

fn internal_error(context: &str, err: &anyhow::Error) -> Response {
    error!("{}: {:#}", context, err);
    text(
        StatusCode::INTERNAL_SERVER_ERROR,
        format!("{context}: {err:#}"),
    )
}

fn unauthorized() -> Response {
    text(StatusCode::UNAUTHORIZED, "Unauthorized")
}

fn required(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

#[handler]
async fn create_certificate(
    req: &Request,
    Query(params): Query<CreateParams>,
    Data(state): Data<&Arc<AppState>>,
) -> Response {
    if !state.auth.verify(req) {
        return unauthorized();
    }
    let Some(hostname) = required(params.hostname) else {
        return text(StatusCode::BAD_REQUEST, "Missing hostname");
    };

    let authorized = match state.workflow.authorize(&hostname).await {
        Ok(authorized) => authorized,
        Err(err) => return internal_error("Failed to start certificate workflow", &err),
    };
    let mut issue_queued = false;
    if let Some(next) = authorized.next {
        if let Err(err) = state.queue.enqueue(next).await {
            return internal_error("Failed to queue issue task", &err);
        }
        issue_queued = true;
    }
    let operation = &authorized.operation;
    json(&CreateReply {
        hostname: &operation.hostname,
        token: &operation.token,
        stage: operation.stage.as_str(),
        issue_queued,
    })
}

#[handler]
async fn acme_challenge(Path(token): Path<String>, Data(state): Data<&Arc<AppState>>) -> Response {
    if token == SELF_TEST_TOKEN {
        return text(StatusCode::IM_A_TEAPOT, TEAPOT_BODY);
    }
    match state.workflow.respond(&token).await {
        Ok(Some(reply)) => {
            if let Some(next) = reply.next {
                // The validator fetches again, which re-queues.
                if let Err(err) = state.queue.enqueue(next).await {
                    error!("Failed to queue issue task for {}: {:#}", token, err);
                }
            }
            text(StatusCode::OK, reply.body)
        }
        Ok(None) => text(StatusCode::NOT_FOUND, "Not Found"),
        Err(err) => internal_error("Failed to answer challenge", &err),
    }
}

#[handler]
async fn certificate_status(req: &Request, Data(state): Data<&Arc<AppState>>) -> Response {
    if !state.auth.verify(req) {
        return unauthorized();
    }
    let now = OffsetDateTime::now_utc();
    if state.cleanup.should_clean() {
        match state.operations.delete_expired(now, state.expiry.hard).await {
            Ok(0) => {}
            Ok(removed) => info!("Removed {} expired operations", removed),
            Err(err) => warn!("Expired operation cleanup failed: {}", err),
        }
    }

    let mut report = match status::collect_status(
        state.host.as_ref(),
        state.operations.as_ref(),
        state.expiry,
        now,
    )
    .await
    {
        Ok(report) => report,
        Err(err) => return internal_error("Failed to collect status", &err),
    };
    if let Some(target) = &state.self_test {
        report.self_test =
            Some(status::self_test(&state.http, &target.base_url, target.timeout).await);
    }
    json(&report)
}

#[handler]
async fn delete_certificate(
    req: &Request,
    Query(params): Query<DeleteParams>,
    Data(state): Data<&Arc<AppState>>,
) -> Response {
    if !state.auth.verify(req) {
        return unauthorized();
    }
    let Some(id) = required(params.id) else {
        return text(StatusCode::BAD_REQUEST, "Missing id");
    };
    match state.host.delete_certificate(&id).await {
        Ok(()) => redirect(STATUS_PATH),
        Err(err) => internal_error("Failed to delete certificate", &err),
    }
}

#[handler]
async fn auto_renew(req: &Request, Data(state): Data<&Arc<AppState>>) -> Response {
    if !state.auth.verify(req) {
        return unauthorized();
    }
    match renewal::schedule_renewals(
        state.host.as_ref(),
        state.queue.as_ref(),
        OffsetDateTime::now_utc(),
        state.renew_before,
    )
    .await
    {
        Ok(summary) => json(&summary),
        Err(err) => internal_error("Failed to schedule renewals", &err),
    }
}

#[handler]
async fn login(Data(state): Data<&Arc<AppState>>) -> Response {
    let Some(oauth) = &state.oauth else {
        return text(StatusCode::NOT_FOUND, "OAuth login is not configured");
    };
    match oauth.begin_login().await {
        Ok(url) => redirect(&url),
        Err(err) => internal_error("Failed to start login", &err),
    }
}

#[handler]
async fn oauth_callback(
    Query(params): Query<OAuthCallbackParams>,
    Data(state): Data<&Arc<AppState>>,
) -> Response {
    let Some(oauth) = &state.oauth else {
        return text(StatusCode::NOT_FOUND, "OAuth login is not configured");
    };
    let (Some(code), Some(login_state)) = (required(params.code), required(params.state)) else {
        return text(StatusCode::BAD_REQUEST, "Missing code or state");
    };
    match oauth.complete_login(&code, &login_state).await {
        Ok(()) => redirect(STATUS_PATH),
        Err(err) if err.downcast_ref::<OAuthError>() == Some(&OAuthError::StateMismatch) => {
            warn!("Rejected login callback with unknown state");
            text(StatusCode::BAD_REQUEST, err.to_string())
        }
        Err(err) => internal_error("Failed to complete login", &err),
    }
}

pub fn routes(state: Arc<AppState>) -> impl Endpoint {
    Route::new()
        .at("/ssl-certificates/create", poem::post(create_certificate))
        .at(
            "/.well-known/acme-challenge/:token",
            poem::get(acme_challenge),
        )
        .at(STATUS_PATH, poem::get(certificate_status))
        .at("/ssl-certificates/delete", poem::post(delete_certificate))
        .at("/ssl-certificates/auto-renew", poem::post(auto_renew))
        .at("/ssl-certificates/login", poem::get(login))
        .at("/ssl-certificates/oauth-login", poem::get(oauth_callback))
        .data(state)
}

/// Serves the routes on `listen_addr` until `shutdown` resolves.
///
/// # Errors
/// Returns error if the listener cannot be bound or the server fails.
pub async fn serve(
    listen_addr: &str,
    state: Arc<AppState>,
    shutdown: impl Future<Output = ()>,
) -> Result<()> {
    info!("Listening on {}", listen_addr);
    Server::new(TcpListener::bind(listen_addr.to_string()))
        .run_with_graceful_shutdown(routes(state), shutdown, Some(Duration::from_secs(10)))
        .await
        .context("HTTP server failed")
}
