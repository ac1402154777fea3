//! HTTP client for the allocation authority.
//!
//! [`MetaClient`] exposes the two allocation calls as `async fn`s and also
//! implements the synchronous [`SegmentProvider`] and [`MachineIdProvider`]
//! traits so it can be handed straight to a generator. The synchronous path
//! drives the request on a private current-thread runtime, which is why it
//! must not be called, nor the client dropped, from inside another async
//! runtime. Generators only call providers from their own background threads
//! or during construction.

use core::time::Duration;

use ginkgo_id::{BoxError, MachineIdProvider, Segment, SegmentProvider};
use http_body_util::{BodyExt, Empty};
use hyper::{Method, Request, Uri, body::Bytes};
use hyper_util::client::legacy::{Client, connect::HttpConnector};
use hyper_util::rt::TokioExecutor;
use serde::{Serialize, de::DeserializeOwned};
use tokio::runtime::{Builder, Runtime};

use crate::{
    Error, ErrorBody, MachineIdQuery, NEXT_MACHINE_ID_PATH, NEXT_SEGMENT_PATH, Result,
    SegmentMetaDto, SegmentQuery, SnowflakeNodeDto, validate_biz_tag,
};

/// Talks to one allocation authority over HTTP/1.
///
/// ```no_run
/// use ginkgo_id::SegmentIdGenerator;
/// use ginkgo_id_meta_core::MetaClient;
///
/// let client = MetaClient::new("http://127.0.0.1:8080").unwrap();
/// let generator = SegmentIdGenerator::new(client, "order", 10_000, 8).unwrap();
/// generator.start().unwrap();
/// let id = generator.next_id().unwrap();
/// # let _ = id;
/// ```
pub struct MetaClient {
    base_url: String,
    timeout: Duration,
    http: Client<HttpConnector, Empty<Bytes>>,
    runtime: Runtime,
}

impl MetaClient {
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3);

    /// # Errors
    ///
    /// See [`Self::with_timeout`].
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        Self::with_timeout(base_url, Self::DEFAULT_TIMEOUT)
    }

    /// Creates a client for the authority at `base_url`
    /// (e.g. `http://meta:8080`). `timeout` bounds each whole request.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidRequest`] if `base_url` is not an `http://` URL
    /// - [`Error::Transport`] if the private runtime cannot be built
    pub fn with_timeout(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let base_url = base_url.into().trim_end_matches('/').to_owned();
        let uri: Uri = base_url
            .parse()
            .map_err(|e| Error::invalid_request(format!("invalid base url `{base_url}`: {e}")))?;
        if uri.scheme_str() != Some("http") || uri.host().is_none() {
            return Err(Error::invalid_request(format!(
                "base url `{base_url}` must look like http://host:port"
            )));
        }

        let runtime = Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(Error::transport)?;
        let http = Client::builder(TokioExecutor::new()).build_http();

        Ok(Self {
            base_url,
            timeout,
            http,
            runtime,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub const fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Leases the next machine id for `biz_tag`.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidRequest`] for an empty `biz_tag`
    /// - [`Error::Remote`] if the authority rejects the request
    /// - [`Error::Transport`] on connect failure, timeout or a bad body
    pub async fn next_machine_id(&self, biz_tag: &str) -> Result<SnowflakeNodeDto> {
        validate_biz_tag(biz_tag)?;
        let query = MachineIdQuery {
            biz_tag: biz_tag.to_owned(),
        };
        self.post(with_query(NEXT_MACHINE_ID_PATH, &query)?).await
    }

    /// Leases the next `step` ids for `biz_tag`. `None` lets the authority
    /// apply its default step.
    ///
    /// # Errors
    ///
    /// See [`Self::next_machine_id`].
    pub async fn next_segment(&self, biz_tag: &str, step: Option<i64>) -> Result<SegmentMetaDto> {
        validate_biz_tag(biz_tag)?;
        let query = SegmentQuery {
            biz_tag: biz_tag.to_owned(),
            step,
        };
        self.post(with_query(NEXT_SEGMENT_PATH, &query)?).await
    }

    async fn post<T: DeserializeOwned>(&self, path_and_query: String) -> Result<T> {
        let uri: Uri = format!("{}{}", self.base_url, path_and_query)
            .parse()
            .map_err(Error::transport)?;
        let request = Request::builder()
            .method(Method::POST)
            .uri(uri)
            .body(Empty::new())
            .map_err(Error::transport)?;

        let exchange = async {
            let response = self.http.request(request).await.map_err(Error::transport)?;
            let status = response.status();
            let body = response
                .into_body()
                .collect()
                .await
                .map_err(Error::transport)?
                .to_bytes();
            Ok::<_, Error>((status, body))
        };
        let (status, body) = tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| Error::transport(format!("no response within {:?}", self.timeout)))??;

        if status.is_success() {
            return serde_json::from_slice(&body).map_err(Error::transport);
        }
        let message = match serde_json::from_slice::<ErrorBody>(&body) {
            Ok(body) => body.message,
            Err(_) => String::from_utf8_lossy(&body).into_owned(),
        };
        Err(Error::Remote {
            status: status.as_u16(),
            message,
        })
    }
}

/// `path?query` with every value percent-encoded.
fn with_query<Q: Serialize>(path: &str, query: &Q) -> Result<String> {
    let query = serde_urlencoded::to_string(query).map_err(Error::internal)?;
    Ok(format!("{path}?{query}"))
}

impl SegmentProvider for MetaClient {
    fn allocate(&self, biz_tag: &str, step: i64) -> core::result::Result<Segment, BoxError> {
        let dto = self.runtime.block_on(self.next_segment(biz_tag, Some(step)))?;
        Ok(dto.segment()?)
    }
}

impl MachineIdProvider for MetaClient {
    fn allocate_machine_id(&self, biz_tag: &str) -> core::result::Result<i64, BoxError> {
        let dto = self.runtime.block_on(self.next_machine_id(biz_tag))?;
        Ok(dto.machine_id)
    }
}

impl core::fmt::Debug for MetaClient {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MetaClient")
            .field("base_url", &self.base_url)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}
