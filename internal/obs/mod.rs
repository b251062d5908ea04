use axum::http::Request;
use futures_util::future::BoxFuture;
use prometheus::core::Collector;
use prometheus::{HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;
use tower::{Layer, Service};

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    pub http_requests: IntCounterVec,
    pub http_duration: HistogramVec,
    pub s3_requests: IntCounterVec,
}

impl Metrics {
    pub fn new() -> Arc<Self> {
        let registry = Registry::new();
        let http_requests = IntCounterVec::new(
            Opts::new("ps3_http_requests_total", "HTTP requests"),
            &["method", "status"],
        )
        .expect("http_requests");
        let http_duration = HistogramVec::new(
            HistogramOpts::new("ps3_http_request_duration_seconds", "HTTP request duration"),
            &["method"],
        )
        .expect("http_duration");
        let s3_requests = IntCounterVec::new(
            Opts::new("ps3_s3_requests_total", "S3 requests"),
            &["op", "status"],
        )
        .expect("s3_requests");
        register_collector(&registry, &http_requests);
        register_collector(&registry, &http_duration);
        register_collector(&registry, &s3_requests);
        Arc::new(Self {
            registry,
            http_requests,
            http_duration,
            s3_requests,
        })
    }

    pub fn gather(&self) -> Vec<prometheus::proto::MetricFamily> {
        self.registry.gather()
    }
}

fn register_collector<C>(registry: &Registry, collector: &C)
where
    C: Collector + Clone + 'static,
{
    registry.register(Box::new(collector.clone())).ok();
}

#[derive(Clone)]
pub struct MetricsLayer {
    metrics: Arc<Metrics>,
}

impl MetricsLayer {
    pub fn new(metrics: Arc<Metrics>) -> Self {
        Self { metrics }
    }
}

impl<S> Layer<S> for MetricsLayer {
    type Service = MetricsService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        MetricsService {
            inner,
            metrics: self.metrics.clone(),
        }
    }
}

#[derive(Clone)]
pub struct MetricsService<S> {
    inner: S,
    metrics: Arc<Metrics>,
}

impl<S, B> Service<Request<B>> for MetricsService<S>
where
    S: Service<Request<B>, Response = axum::response::Response> + Clone + Send + 'static,
    S::Future: Send + 'static,
    B: Send + 'static,
{
    type Response = axum::response::Response;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<B>) -> Self::Future {
        let mut inner = self.inner.clone();
        let metrics = self.metrics.clone();
        let method = req.method().clone();
        let start = Instant::now();
        Box::pin(async move {
            let response = inner.call(req).await?;
            let status_label = response.status().as_u16().to_string();
            metrics
                .http_requests
                .with_label_values(&[method.as_str(), &status_label])
                .inc();
            metrics
                .http_duration
                .with_label_values(&[method.as_str()])
                .observe(start.elapsed().as_secs_f64());
            Ok(response)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::{Metrics, MetricsLayer};
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use axum::routing::get;
    use axum::Router;
    use tower::ServiceExt;

    #[test]
    fn metrics_registry_exposes_known_metrics() {
        let metrics = Metrics::new();
        metrics
            .http_requests
            .with_label_values(&["GET", "200"])
            .inc();
        metrics
            .s3_requests
            .with_label_values(&["ListBuckets", "200"])
            .inc();
        let families = metrics.gather();
        let names: Vec<String> = families
            .iter()
            .map(|family| family.get_name().to_string())
            .collect();
        assert!(names.contains(&"ps3_http_requests_total".to_string()));
        assert!(names.contains(&"ps3_s3_requests_total".to_string()));
    }

    #[tokio::test]
    async fn layer_counts_requests() {
        let metrics = Metrics::new();
        let router = Router::new()
            .route("/", get(|| async { "ok" }))
            .layer(MetricsLayer::new(metrics.clone()));
        let response = router
            .oneshot(
                Request::builder()
                    .uri("/")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        let count = metrics
            .http_requests
            .with_label_values(&["GET", "200"])
            .get();
        assert_eq!(count, 1);
    }
}
