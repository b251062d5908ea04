use crate::sandbox::{registry, scoped, TaskId};
use axum::http::Request;
use axum::response::Response;
use futures_util::future::BoxFuture;
use std::task::{Context, Poll};
use tower::{Layer, Service};

/// Header carrying an encoded sandbox owner identity. When present, the
/// request is served against that owner's isolated containers.
pub const SANDBOX_OWNER_HEADER: &str = "x-ps3-sandbox-owner";

/// Middleware binding each request to the sandbox registry: the request
/// runs under its own task identity, and the owner header (if any) turns
/// that identity into an allowance before the handler executes.
#[derive(Clone, Default)]
pub struct SandboxLayer;

impl<S> Layer<S> for SandboxLayer {
    type Service = SandboxService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        SandboxService { inner }
    }
}

#[derive(Clone)]
pub struct SandboxService<S> {
    inner: S,
}

impl<S, B> Service<Request<B>> for SandboxService<S>
where
    S: Service<Request<B>, Response = Response> + Clone + Send + 'static,
    S::Future: Send + 'static,
    B: Send + 'static,
{
    type Response = Response;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<B>) -> Self::Future {
        let mut inner = self.inner.clone();
        let task = TaskId::next();
        let owner_token = req
            .headers()
            .get(SANDBOX_OWNER_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(ToString::to_string);
        Box::pin(async move {
            bind_request_task(task, owner_token.as_deref());
            let response = scoped(task, inner.call(req)).await;
            registry().release_task(task);
            response
        })
    }
}

/// Registers the request task under the owner named by the header. Any
/// failure is swallowed: the request then proceeds under whatever the
/// current sandbox mode dictates.
fn bind_request_task(task: TaskId, owner_token: Option<&str>) {
    let Some(token) = owner_token else {
        return;
    };
    let registry = registry();
    let bound = registry
        .decode_metadata(token)
        .and_then(|owner| registry.force_allow(owner, task));
    if let Err(err) = bound {
        tracing::debug!(task = %task, error = %err, "sandbox owner binding skipped");
    }
}

#[cfg(test)]
mod tests {
    use super::{SandboxLayer, SANDBOX_OWNER_HEADER};
    use crate::sandbox::{current_task, registry, SandboxError};
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use axum::response::{IntoResponse, Response};
    use axum::routing::get;
    use axum::Router;
    use tower::ServiceExt;

    fn probe_router() -> Router {
        Router::new()
            .route(
                "/probe",
                get(|| async {
                    let lookup = registry().lookup_owner(current_task());
                    match lookup {
                        Ok(owner) => format!("owner:{owner}").into_response(),
                        Err(_) => "unbound".into_response(),
                    }
                }),
            )
            .layer(SandboxLayer)
    }

    async fn probe(router: Router, header: Option<&str>) -> (StatusCode, String) {
        let mut request = Request::builder().uri("/probe");
        if let Some(value) = header {
            request = request.header(SANDBOX_OWNER_HEADER, value);
        }
        let request = request.body(Body::empty()).expect("request");
        let response: Response = router.oneshot(request).await.expect("response");
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        (status, String::from_utf8(body.to_vec()).expect("utf8"))
    }

    #[tokio::test]
    async fn header_binds_the_request_task_to_the_owner() {
        let owner = registry().start_owner(false).await.expect("owner");
        let token = registry().encode_metadata(owner).expect("token");

        let (status, body) = probe(probe_router(), Some(&token)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, format!("owner:{owner}"));

        registry().stop_owner(owner);
    }

    #[tokio::test]
    async fn request_task_allowance_is_released_after_the_response() {
        let owner = registry().start_owner(false).await.expect("owner");
        let token = registry().encode_metadata(owner).expect("token");

        let _ = probe(probe_router(), Some(&token)).await;
        // The only remaining registry entry for this owner is the owner
        // itself; the per-request allowance is gone.
        registry().checkin_task(owner);
        assert_eq!(
            registry().lookup_owner(owner),
            Err(SandboxError::NotFound)
        );
        registry().stop_owner(owner);
    }

    #[tokio::test]
    async fn bad_or_stale_tokens_are_swallowed() {
        let (status, body) = probe(probe_router(), Some("!!not-a-token!!")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "unbound");

        let owner = registry().start_owner(false).await.expect("owner");
        let token = registry().encode_metadata(owner).expect("token");
        registry().stop_owner(owner);

        let (status, body) = probe(probe_router(), Some(&token)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "unbound");
    }

    #[tokio::test]
    async fn missing_header_leaves_the_request_unbound() {
        let (status, body) = probe(probe_router(), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "unbound");
    }
}
