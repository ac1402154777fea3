//! Request handlers for machine-id and segment allocation.
//!
//! Both allocation routes accept `GET` and `POST` with their parameters in the
//! query string (`bizTag`, and `step` for segments) and answer with the
//! camelCase record DTOs from `ginkgo-id-meta-core`. Failures are answered
//! with an [`ErrorBody`](ginkgo_id_meta_core::ErrorBody) and the status from
//! [`Error::status_code`].
//!
//! The allocation protocol blocks (named locks, retry backoff, file writes),
//! so every allocation runs on the blocking pool.

use crate::server::allocator::{Authority, LocalLockService, RecordStore};
use axum::{
    Json, Router,
    extract::{Query, State, rejection::QueryRejection},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
};
use ginkgo_id_meta_core::{
    Error, HEALTH_PATH, MachineIdQuery, NEXT_MACHINE_ID_PATH, NEXT_SEGMENT_PATH, Result,
    SegmentMetaDto, SegmentQuery, SnowflakeNodeDto,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

pub type SharedAuthority = Arc<Authority<Arc<dyn RecordStore>, LocalLockService>>;

/// Shared state behind every route.
///
/// Cloning is cheap; clones share the authority and the shutdown token.
#[derive(Clone)]
pub struct MetaService {
    authority: SharedAuthority,
    shutdown: CancellationToken,
}

impl MetaService {
    pub fn new(authority: SharedAuthority) -> Self {
        Self {
            authority,
            shutdown: CancellationToken::new(),
        }
    }

    /// Stops accepting allocations. Requests arriving afterwards get 503 and
    /// the health route reports the service as unavailable.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Token cancelled by [`MetaService::shutdown`].
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    async fn run<T, F>(&self, allocate: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Authority<Arc<dyn RecordStore>, LocalLockService>) -> Result<T> + Send + 'static,
    {
        if self.is_shutting_down() {
            return Err(Error::ServiceShutdown);
        }

        let authority = Arc::clone(&self.authority);
        tokio::task::spawn_blocking(move || allocate(&authority))
            .await
            .map_err(|e| Error::internal(format!("allocation task failed: {e}")))?
    }
}

pub fn router(service: MetaService) -> Router {
    Router::new()
        .route(
            NEXT_MACHINE_ID_PATH,
            get(next_machine_id).post(next_machine_id),
        )
        .route(NEXT_SEGMENT_PATH, get(next_segment).post(next_segment))
        .route(HEALTH_PATH, get(health))
        .layer(
            ServiceBuilder::new().layer(TraceLayer::new_for_http()).layer(
                CorsLayer::new()
                    .allow_origin(Any)
                    .allow_methods(Any)
                    .allow_headers(Any),
            ),
        )
        .with_state(service)
}

async fn next_machine_id(
    State(service): State<MetaService>,
    query: core::result::Result<Query<MachineIdQuery>, QueryRejection>,
) -> Result<Json<SnowflakeNodeDto>> {
    let Query(query) = query.map_err(|rejection| Error::invalid_request(rejection.body_text()))?;

    let node = service
        .run(move |authority| authority.allocate_machine_id(&query.biz_tag))
        .await?;

    tracing::debug!(biz_tag = %node.biz_tag, machine_id = node.machine_id, "leased machine id");
    Ok(Json(node.into()))
}

async fn next_segment(
    State(service): State<MetaService>,
    query: core::result::Result<Query<SegmentQuery>, QueryRejection>,
) -> Result<Json<SegmentMetaDto>> {
    let Query(query) = query.map_err(|rejection| Error::invalid_request(rejection.body_text()))?;

    let allocation = service
        .run(move |authority| authority.allocate_segment(&query.biz_tag, query.step))
        .await?;

    tracing::debug!(
        biz_tag = %allocation.meta.biz_tag,
        next_id = allocation.next_id,
        step = allocation.step,
        "leased segment"
    );
    Ok(Json(allocation.into()))
}

async fn health(State(service): State<MetaService>) -> impl IntoResponse {
    if service.is_shutting_down() {
        (StatusCode::SERVICE_UNAVAILABLE, "shutting down")
    } else {
        (StatusCode::OK, "ok")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::allocator::{AuthorityConfig, MemoryStore};
    use axum::body::{Body, to_bytes};
    use axum::http::{Method, Request};
    use ginkgo_id_meta_core::ErrorBody;
    use serde::de::DeserializeOwned;
    use tower::ServiceExt;

    fn service(config: AuthorityConfig) -> MetaService {
        let store: Arc<dyn RecordStore> = Arc::new(MemoryStore::new());
        MetaService::new(Arc::new(Authority::new(
            store,
            LocalLockService::new(),
            config,
        )))
    }

    async fn call(service: &MetaService, method: Method, uri: &str) -> (StatusCode, Vec<u8>) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap();
        let response = router(service.clone()).oneshot(request).await.unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, body.to_vec())
    }

    async fn json<T: DeserializeOwned>(
        service: &MetaService,
        method: Method,
        uri: &str,
    ) -> (StatusCode, T) {
        let (status, body) = call(service, method, uri).await;
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn segments_follow_each_other() {
        let service = service(AuthorityConfig::default());

        let (status, first): (_, SegmentMetaDto) = json(
            &service,
            Method::POST,
            "/next-segment?bizTag=order&step=100",
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(first.biz_tag, "order");
        assert_eq!((first.next_id, first.step), (0, 100));

        let (status, second): (_, SegmentMetaDto) = json(
            &service,
            Method::GET,
            "/next-segment?bizTag=order&step=100",
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!((second.next_id, second.step), (100, 100));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn missing_step_uses_the_configured_default() {
        let service = service(AuthorityConfig {
            default_step: 250,
            ..AuthorityConfig::default()
        });

        let (_, first): (_, SegmentMetaDto) =
            json(&service, Method::POST, "/next-segment?bizTag=user").await;
        let (_, second): (_, SegmentMetaDto) =
            json(&service, Method::POST, "/next-segment?bizTag=user").await;

        assert_eq!((first.next_id, first.step), (0, 250));
        assert_eq!((second.next_id, second.step), (250, 250));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn machine_ids_increase_per_tag() {
        let service = service(AuthorityConfig::default());

        for expected in 0..3 {
            let (status, node): (_, SnowflakeNodeDto) =
                json(&service, Method::POST, "/next-machine-id?bizTag=order").await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(node.machine_id, expected);
        }

        let (_, other): (_, SnowflakeNodeDto) =
            json(&service, Method::GET, "/next-machine-id?bizTag=user").await;
        assert_eq!(other.machine_id, 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn encoded_biz_tags_are_decoded() {
        let service = service(AuthorityConfig::default());

        let (status, segment): (_, SegmentMetaDto) = json(
            &service,
            Method::POST,
            "/next-segment?bizTag=order+service%2F%E8%AE%A2%E5%8D%95&step=10",
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(segment.biz_tag, "order service/订单");
        assert_eq!((segment.next_id, segment.step), (0, 10));

        let (status, node): (_, SnowflakeNodeDto) = json(
            &service,
            Method::POST,
            "/next-machine-id?bizTag=a%26step%3D1",
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(node.biz_tag, "a&step=1");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn malformed_queries_are_bad_requests() {
        let service = service(AuthorityConfig::default());

        let (status, body): (_, ErrorBody) =
            json(&service, Method::POST, "/next-segment").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body.code, 400);
        assert!(!body.message.is_empty());

        let (status, body): (_, ErrorBody) =
            json(&service, Method::POST, "/next-segment?bizTag=order&step=0").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body.code, 400);

        let (status, _): (_, ErrorBody) =
            json(&service, Method::POST, "/next-segment?bizTag=order&step=abc").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _): (_, ErrorBody) =
            json(&service, Method::POST, "/next-machine-id?bizTag=").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn health_tracks_shutdown() {
        let service = service(AuthorityConfig::default());

        let (status, body) = call(&service, Method::GET, "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, b"ok");

        service.shutdown();
        assert!(service.is_shutting_down());
        assert!(service.shutdown_token().is_cancelled());

        let (status, _) = call(&service, Method::GET, "/health").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn allocations_refused_after_shutdown() {
        let service = service(AuthorityConfig::default());
        service.shutdown();

        let (status, body): (_, ErrorBody) =
            json(&service, Method::POST, "/next-segment?bizTag=order").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body.code, 503);

        let (status, _): (_, ErrorBody) =
            json(&service, Method::POST, "/next-machine-id?bizTag=order").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }
}
