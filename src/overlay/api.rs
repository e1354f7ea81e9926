//! FPP overlay-model control API
//!
//! Used once at startup to learn the matrix size and to switch the model
//! into shared-memory mode so its overlay buffer exists.

use std::time::Duration;

use bytes::Bytes;
use http::uri::InvalidUri;
use http_body_util::{BodyExt, Full};
use hyper::header::{CONTENT_TYPE, HOST};
use hyper::{Method, Request, StatusCode, Uri};
use hyper_util::rt::TokioIo;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::net::TcpStream;
use tracing::{debug, info, instrument};

use crate::capture::Geometry;
use crate::{retry, RetryError, RetryPolicy, StopFlag};

pub const DEFAULT_API_URL: &str = "http://127.0.0.1/api";
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Model state value meaning "overlay active"
pub const STATE_ENABLED: u8 = 1;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("invalid control API url: {0}")]
    Url(String),
    #[error("invalid control API url: {0}")]
    Uri(#[from] InvalidUri),
    #[error("connect failed: {0}")]
    Connect(#[from] std::io::Error),
    #[error("http error: {0}")]
    Http(#[from] hyper::Error),
    #[error("bad request: {0}")]
    Request(#[from] http::Error),
    #[error("HTTP {0}")]
    Status(StatusCode),
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("malformed JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unexpected value for {field}: {value}")]
    Field { field: &'static str, value: String },
    #[error("Invalid matrix dimensions from FPP API: {width}x{height}")]
    InvalidDimensions { width: i64, height: i64 },
}

#[derive(Debug, Error)]
pub enum NegotiationError {
    #[error("interrupted while preparing model")]
    Interrupted,
    #[error("could not prepare model '{model}' after {attempts} attempts: {last}")]
    Exhausted {
        model: String,
        attempts: u32,
        last: ApiError,
    },
}

/// Raw dimensions as reported, not yet validated
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ModelInfo {
    pub width: i64,
    pub height: i64,
}

/// Operations the supervisor needs from the control API
#[allow(async_fn_in_trait)]
pub trait ControlApi {
    async fn model_info(&self, model: &str) -> Result<ModelInfo, ApiError>;

    async fn set_state(&self, model: &str, state: u8) -> Result<(), ApiError>;

    /// Ask FPP to expose the model's overlay buffer as shared memory
    async fn enable_mmap(&self, model: &str) -> Result<(), ApiError>;
}

/// Look up the model's geometry and arm it for overlay writes.
///
/// Every failure, including a non-positive dimension or a failed follow-up
/// PUT, burns one attempt of `policy`.
#[instrument(skip(api, policy, stop))]
pub async fn negotiate<A: ControlApi>(
    api: &A,
    model: &str,
    policy: RetryPolicy,
    stop: &StopFlag,
) -> Result<Geometry, NegotiationError> {
    let geometry = retry(policy, stop, |_| async move { prepare_model(api, model).await })
        .await
        .map_err(|e| match e {
            RetryError::Interrupted => NegotiationError::Interrupted,
            RetryError::Exhausted { attempts, last } => NegotiationError::Exhausted {
                model: model.to_string(),
                attempts,
                last,
            },
        })?;

    info!("Model '{}' ready at {}", model, geometry);
    Ok(geometry)
}

async fn prepare_model<A: ControlApi>(api: &A, model: &str) -> Result<Geometry, ApiError> {
    let info = api.model_info(model).await?;
    let geometry = Geometry::new(info.width, info.height).ok_or(ApiError::InvalidDimensions {
        width: info.width,
        height: info.height,
    })?;

    api.set_state(model, STATE_ENABLED).await?;
    api.enable_mmap(model).await?;
    Ok(geometry)
}

/// `ControlApi` over plain HTTP/1.1, one connection per call.
#[derive(Debug, Clone)]
pub struct HttpControlApi {
    addr: String,
    host: String,
    base_path: String,
    timeout: Duration,
}

impl HttpControlApi {
    pub fn new(base_url: &str) -> Result<Self, ApiError> {
        let uri: Uri = base_url.parse()?;
        if uri.scheme_str() != Some("http") {
            return Err(ApiError::Url(format!("{} (only http:// is supported)", base_url)));
        }
        let host = uri
            .host()
            .ok_or_else(|| ApiError::Url(format!("{} has no host", base_url)))?;
        let port = uri.port_u16().unwrap_or(80);

        Ok(Self {
            addr: format!("{}:{}", host, port),
            host: uri
                .authority()
                .map(|a| a.as_str().to_string())
                .unwrap_or_else(|| host.to_string()),
            base_path: uri.path().trim_end_matches('/').to_string(),
            timeout: REQUEST_TIMEOUT,
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn model_path(&self, model: &str, suffix: &str) -> String {
        format!(
            "{}/overlays/model/{}{}",
            self.base_path,
            urlencoding::encode(model),
            suffix
        )
    }

    async fn send(&self, method: Method, path: &str, body: Option<Value>) -> Result<Bytes, ApiError> {
        tokio::time::timeout(self.timeout, self.exchange(method, path, body))
            .await
            .map_err(|_| ApiError::Timeout(self.timeout))?
    }

    async fn exchange(&self, method: Method, path: &str, body: Option<Value>) -> Result<Bytes, ApiError> {
        debug!("{} {}", method, path);

        let payload = match body {
            Some(body) => serde_json::to_vec(&body)?,
            None => Vec::new(),
        };
        let request = Request::builder()
            .method(method)
            .uri(path)
            .header(HOST, &self.host)
            .header(CONTENT_TYPE, "application/json")
            .body(Full::new(Bytes::from(payload)))?;

        let stream = TcpStream::connect(&self.addr).await?;
        let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream)).await?;
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!("Control API connection error: {}", e);
            }
        });

        let response = sender.send_request(request).await?;
        let status = response.status();
        let body = response.into_body().collect().await?.to_bytes();
        if !status.is_success() {
            return Err(ApiError::Status(status));
        }
        Ok(body)
    }
}

impl ControlApi for HttpControlApi {
    async fn model_info(&self, model: &str) -> Result<ModelInfo, ApiError> {
        let body = self.send(Method::GET, &self.model_path(model, ""), None).await?;
        if body.is_empty() {
            return Ok(ModelInfo::default());
        }
        let info: Value = serde_json::from_slice(&body)?;
        Ok(ModelInfo {
            width: dimension(&info, "width")?,
            height: dimension(&info, "height")?,
        })
    }

    async fn set_state(&self, model: &str, state: u8) -> Result<(), ApiError> {
        let path = self.model_path(model, "/state");
        self.send(Method::PUT, &path, Some(json!({ "State": state }))).await?;
        Ok(())
    }

    async fn enable_mmap(&self, model: &str) -> Result<(), ApiError> {
        let path = self.model_path(model, "/mmap");
        self.send(Method::PUT, &path, Some(json!({}))).await?;
        Ok(())
    }
}

/// Missing fields read as 0; integral numbers and numeric strings are accepted.
fn dimension(info: &Value, field: &'static str) -> Result<i64, ApiError> {
    let bad = |v: &Value| ApiError::Field {
        field,
        value: v.to_string(),
    };
    let Some(v) = info.get(field) else {
        return Ok(0);
    };
    match v {
        Value::Null => Ok(0),
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f.trunc() as i64))
            .ok_or_else(|| bad(v)),
        Value::String(s) => s.trim().parse().map_err(|_| bad(v)),
        _ => Err(bad(v)),
    }
}
