use std::{sync::Arc, time::Duration};

use axum::{
    Json, Router,
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use preview_instance::InstanceStatus;
use serde::Serialize;

use crate::{
    dispatch::Dispatcher,
    port_alloc::PortStats,
    signature::verify_signature,
    webhook::{PreviewEvent, parse_webhook},
};

#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
    /// Empty disables signature checks.
    pub webhook_secret: Arc<str>,
    /// How long pull request events wait before they are acted on.
    pub pr_idle_wait: Duration,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/healthz", get(healthz))
        .route("/hook", post(hook))
        .with_state(state)
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub message: String,
}

fn json_error(code: StatusCode, message: impl Into<String>) -> Response {
    (
        code,
        Json(ErrorBody {
            message: message.into(),
        }),
    )
        .into_response()
}

async fn root() -> &'static str {
    "preview host is running"
}

#[derive(Debug, Serialize)]
struct PortUsage {
    min: u16,
    max: u16,
    assigned: usize,
    capacity: Option<usize>,
    #[serde(flatten)]
    stats: PortStats,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    ports: PortUsage,
    instances: Vec<InstanceStatus>,
}

async fn healthz(State(state): State<AppState>) -> Json<HealthResponse> {
    let registry = state.dispatcher.registry();
    let ports = {
        let ports = registry.env().lock_ports();
        PortUsage {
            min: ports.min_port(),
            max: ports.max_port(),
            assigned: ports.assigned_count(),
            capacity: ports.capacity(),
            stats: ports.stats(),
        }
    };
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        ports,
        instances: registry.statuses(),
    })
}

async fn hook(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    let delivery = headers
        .get("x-github-delivery")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    if !state.webhook_secret.is_empty() {
        let signature = headers
            .get("x-hub-signature-256")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        if !verify_signature(&body, signature, state.webhook_secret.as_bytes()) {
            tracing::warn!(%delivery, "rejected webhook with bad signature");
            return json_error(StatusCode::UNAUTHORIZED, "invalid signature");
        }
    }

    let Some(event_type) = headers
        .get("x-github-event")
        .and_then(|v| v.to_str().ok())
    else {
        return json_error(StatusCode::BAD_REQUEST, "missing X-GitHub-Event header");
    };

    let event = match parse_webhook(event_type, &body) {
        Ok(Some(event)) => event,
        Ok(None) => {
            tracing::debug!(%delivery, event_type, "ignoring webhook");
            return (StatusCode::OK, "ignored").into_response();
        }
        Err(err) => {
            tracing::warn!(%delivery, event_type, error = %err, "malformed webhook payload");
            return json_error(StatusCode::BAD_REQUEST, err.to_string());
        }
    };

    tracing::info!(%delivery, event_type, pr = %event.pr(), "webhook accepted");
    // GitHub needs a moment before a freshly pushed branch shows up in its archive.
    let delay = match event {
        PreviewEvent::PullRequest(_) => state.pr_idle_wait,
        PreviewEvent::Comment(_) => Duration::ZERO,
    };
    let dispatcher = Arc::clone(&state.dispatcher);
    tokio::spawn(async move {
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        dispatcher.dispatch(event).await;
    });

    (StatusCode::ACCEPTED, "accepted").into_response()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::{
        body::Body,
        http::{Request, StatusCode},
    };
    use http_body_util::BodyExt;
    use preview_instance::PrNumber;
    use tower::ServiceExt;

    use super::*;
    use crate::{
        signature::{compute_signature, format_signature_header},
        test_support::Harness,
        webhook::fixtures,
    };

    const SECRET: &str = "s3cret";

    fn app(h: &Harness, secret: &str) -> Router {
        router(AppState {
            dispatcher: Arc::new(Dispatcher::new(Arc::clone(&h.registry), "EPSWebPreview")),
            webhook_secret: Arc::from(secret),
            pr_idle_wait: Duration::from_secs(15),
        })
    }

    fn hook_request(event: &str, payload: &[u8], secret: Option<&str>) -> Request<Body> {
        let mut req = Request::builder()
            .method("POST")
            .uri("/hook")
            .header("content-type", "application/json")
            .header("x-github-delivery", "d-1");
        if !event.is_empty() {
            req = req.header("x-github-event", event);
        }
        if let Some(secret) = secret {
            let sig = format_signature_header(&compute_signature(payload, secret.as_bytes()));
            req = req.header("x-hub-signature-256", sig);
        }
        req.body(Body::from(payload.to_vec())).unwrap()
    }

    fn payload(v: serde_json::Value) -> Vec<u8> {
        serde_json::to_vec(&v).unwrap()
    }

    #[tokio::test]
    async fn root_is_alive() {
        let h = Harness::new(4000, 4999, None);
        let resp = app(&h, SECRET)
            .oneshot(Request::get("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn bad_signature_is_unauthorized() {
        let h = Harness::new(4000, 4999, None);
        let body = payload(fixtures::pull_request("opened", 1));
        let resp = app(&h, SECRET)
            .oneshot(hook_request("pull_request", &body, Some("wrong")))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        let resp = app(&h, SECRET)
            .oneshot(hook_request("pull_request", &body, None))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn missing_event_header_and_bad_payload_are_bad_requests() {
        let h = Harness::new(4000, 4999, None);
        let body = payload(fixtures::pull_request("opened", 1));
        let resp = app(&h, SECRET)
            .oneshot(hook_request("", &body, Some(SECRET)))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = app(&h, SECRET)
            .oneshot(hook_request("pull_request", b"not json", Some(SECRET)))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn unhandled_events_are_acknowledged() {
        let h = Harness::new(4000, 4999, None);
        let resp = app(&h, "")
            .oneshot(hook_request("ping", b"{\"zen\":\"ok\"}", None))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test(start_paused = true)]
    async fn pull_request_is_handled_after_idle_wait() {
        let h = Harness::new(4000, 4999, None);
        let body = payload(fixtures::pull_request("opened", 3));
        let resp = app(&h, SECRET)
            .oneshot(hook_request("pull_request", &body, Some(SECRET)))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
        assert!(!h.registry.contains(PrNumber(3)));

        tokio::time::sleep(Duration::from_secs(16)).await;
        let inst = h.registry.get(PrNumber(3)).unwrap();
        inst.current_run().await;
        assert_eq!(inst.port(), Some(4003));
    }

    #[tokio::test]
    async fn healthz_reports_instances() {
        let h = Harness::new(4000, 4999, Some(10));
        let inst = h.registry.get_or_create(&h.details(2));
        inst.download();
        inst.current_run().await;

        let resp = app(&h, SECRET)
            .oneshot(Request::get("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let v: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(v["status"], "ok");
        assert_eq!(v["ports"]["assigned"], 1);
        assert_eq!(v["ports"]["capacity"], 10);
        assert_eq!(v["ports"]["binds"], 1);
        assert_eq!(v["ports"]["releases"], 0);
        assert_eq!(v["instances"][0]["pr"], 2);
        assert_eq!(v["instances"][0]["state"], "active");
        assert_eq!(v["instances"][0]["port"], 4002);
    }
}
