use log::debug;
use once_cell::sync::Lazy;
use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::{Method, StatusCode};
use segprof_api::{
    ArtifactHandle, BackendId, CompileRequest, ContentDigest, ExecutionReport, InputsDescriptor,
    RemoteError, RemoteService, SessionId,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use url::Url;

static USER_AGENT: Lazy<String> = Lazy::new(|| {
    format!(
        "segprof/{} ({})",
        env!("CARGO_PKG_VERSION"),
        std::env::consts::OS
    )
});

#[derive(Clone, Debug)]
pub struct HttpRemoteConfig {
    pub base_url: String,
    pub auth_token: Option<String>,
    pub timeout: Duration,
}

impl Default for HttpRemoteConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            auth_token: None,
            timeout: Duration::from_secs(120),
        }
    }
}

#[derive(Debug, Error)]
pub enum HttpSetupError {
    #[error("remote base_url must be provided")]
    MissingBaseUrl,
    #[error("invalid remote base_url: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("failed to build HTTP client: {0}")]
    Client(#[from] reqwest::Error),
}

/// [`RemoteService`] spoken over HTTP.
///
/// Retrying is left to the dispatch client: this type only classifies
/// failures, mapping 429 and 5xx responses to retryable transport errors.
pub struct HttpRemoteService {
    client: Client,
    base: Url,
    auth_header: Option<String>,
}

#[derive(Serialize)]
struct ExecuteBody<'a> {
    backend: BackendId,
    inputs: &'a InputsDescriptor,
}

#[derive(Deserialize)]
struct CompileResponse {
    artifact_id: String,
}

#[derive(Deserialize)]
struct ExecuteResponse {
    #[serde(default)]
    device_elapsed_ns: Option<u64>,
}

#[derive(Deserialize)]
struct ErrorBody {
    kind: String,
    message: String,
}

impl HttpRemoteService {
    pub fn new(config: HttpRemoteConfig) -> Result<Self, HttpSetupError> {
        if config.base_url.is_empty() {
            return Err(HttpSetupError::MissingBaseUrl);
        }
        let mut raw = config.base_url;
        if !raw.ends_with('/') {
            raw.push('/');
        }
        let base = Url::parse(&raw)?;
        let client = Client::builder()
            .timeout(config.timeout)
            .user_agent(USER_AGENT.clone())
            .build()?;
        Ok(Self {
            client,
            base,
            auth_header: config.auth_token.map(|token| format!("Bearer {token}")),
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base
    }

    fn request(&self, method: Method, route: &str) -> Result<RequestBuilder, RemoteError> {
        let url = self
            .base
            .join(route.trim_start_matches('/'))
            .map_err(|err| RemoteError::Transport(format!("bad route {route}: {err}")))?;
        let mut builder = self.client.request(method, url);
        if let Some(auth) = &self.auth_header {
            builder = builder.header("Authorization", auth);
        }
        Ok(builder)
    }

    fn send(&self, builder: RequestBuilder) -> Result<Response, RemoteError> {
        builder.send().map_err(map_http_err)
    }
}

impl RemoteService for HttpRemoteService {
    fn has_blob(&self, digest: &ContentDigest) -> Result<bool, RemoteError> {
        let resp = self.send(self.request(Method::HEAD, &format!("v1/blobs/{digest}"))?)?;
        match resp.status() {
            StatusCode::NOT_FOUND => Ok(false),
            status if status.is_success() => Ok(true),
            _ => Err(error_from(resp, RemoteError::Transport)),
        }
    }

    fn upload_blob(&self, digest: &ContentDigest, bytes: &[u8]) -> Result<(), RemoteError> {
        let builder = self
            .request(Method::PUT, &format!("v1/blobs/{digest}"))?
            .header("Content-Type", "application/octet-stream")
            .body(bytes.to_vec());
        check(self.send(builder)?, RemoteError::Transport)?;
        debug!("PUT blob {digest} ({} bytes)", bytes.len());
        Ok(())
    }

    fn compile(&self, request: &CompileRequest) -> Result<ArtifactHandle, RemoteError> {
        let builder = self
            .request(Method::POST, &format!("v1/sessions/{}/compile", request.session))?
            .json(request);
        let resp = check(self.send(builder)?, RemoteError::Compilation)?;
        let body: CompileResponse = resp.json().map_err(map_http_err)?;
        Ok(ArtifactHandle {
            id: body.artifact_id,
            backend: request.backend,
        })
    }

    fn execute(
        &self,
        artifact: &ArtifactHandle,
        inputs: &InputsDescriptor,
    ) -> Result<ExecutionReport, RemoteError> {
        let builder = self
            .request(Method::POST, &format!("v1/artifacts/{}/execute", artifact.id))?
            .json(&ExecuteBody {
                backend: artifact.backend,
                inputs,
            });
        let resp = self.send(builder)?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Err(RemoteError::UnknownArtifact(artifact.id.clone()));
        }
        let body: ExecuteResponse = check(resp, RemoteError::Runtime)?
            .json()
            .map_err(map_http_err)?;
        Ok(ExecutionReport {
            device_elapsed: body.device_elapsed_ns.map(Duration::from_nanos),
        })
    }

    fn release_session(&self, session: SessionId) -> Result<(), RemoteError> {
        let resp = self.send(self.request(Method::DELETE, &format!("v1/sessions/{session}"))?)?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        check(resp, RemoteError::Transport)?;
        Ok(())
    }
}

impl fmt::Debug for HttpRemoteService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpRemoteService")
            .field("base", &self.base.as_str())
            .finish_non_exhaustive()
    }
}

fn map_http_err(err: reqwest::Error) -> RemoteError {
    RemoteError::Transport(err.to_string())
}

fn should_retry(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

fn check(resp: Response, fallback: fn(String) -> RemoteError) -> Result<Response, RemoteError> {
    if resp.status().is_success() {
        Ok(resp)
    } else {
        Err(error_from(resp, fallback))
    }
}

/// Classifies a failed response. Retryable statuses win over the body, then
/// a typed error body, then `fallback` for anything else.
fn error_from(resp: Response, fallback: fn(String) -> RemoteError) -> RemoteError {
    let status = resp.status();
    let text = resp.text().unwrap_or_else(|_| status.to_string());
    if should_retry(status) {
        return RemoteError::Transport(format!("{status}: {text}"));
    }
    match serde_json::from_str::<ErrorBody>(&text) {
        Ok(body) => match body.kind.as_str() {
            "compilation" => RemoteError::Compilation(body.message),
            "load" => RemoteError::Load(body.message),
            "runtime" => RemoteError::Runtime(body.message),
            _ => fallback(format!("{status}: {}", body.message)),
        },
        Err(_) => fallback(format!("{status}: {text}")),
    }
}
