use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::debug;
use url::Url;

use super::{ActionSender, SendError};
use crate::network::ConnectivityProbe;
use crate::queue::{ActionKind, QueuedAction};

/// REST backend client.
///
/// Mutations go to `{base}/{target_resource}`; the action id travels in the
/// `Idempotency-Key` header so the server can drop replays.
#[derive(Clone)]
pub struct HttpBackend {
  client: reqwest::Client,
  base_url: Url,
  token: Option<String>,
}

impl HttpBackend {
  pub fn new(base_url: &str, timeout: Duration, token: Option<String>) -> Result<Self> {
    let mut base_url =
      Url::parse(base_url).map_err(|e| eyre!("Invalid backend url '{}': {}", base_url, e))?;

    // Without a trailing slash `join` would replace the last path segment
    if !base_url.path().ends_with('/') {
      let path = format!("{}/", base_url.path());
      base_url.set_path(&path);
    }

    let client = reqwest::Client::builder()
      .timeout(timeout)
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self {
      client,
      base_url,
      token,
    })
  }

  pub fn base_url(&self) -> &Url {
    &self.base_url
  }

  fn endpoint(&self, path: &str) -> Result<Url, SendError> {
    self
      .base_url
      .join(path.trim_start_matches('/'))
      .map_err(|e| SendError::Rejected {
        status: 0,
        message: format!("invalid path '{}': {}", path, e),
      })
  }

  fn request(&self, method: Method, url: Url) -> RequestBuilder {
    let builder = self.client.request(method, url);
    match &self.token {
      Some(token) => builder.bearer_auth(token),
      None => builder,
    }
  }

  /// GET a JSON document relative to the base url.
  pub async fn fetch_json(&self, path: &str) -> Result<Value, SendError> {
    let url = self.endpoint(path)?;
    debug!(%url, "Fetching");

    let response = self
      .request(Method::GET, url)
      .send()
      .await
      .map_err(transport_error)?;

    check_status(response)
      .await?
      .json::<Value>()
      .await
      .map_err(|e| SendError::Decode(e.to_string()))
  }
}

/// HTTP method used to deliver each kind of action.
fn method_for(kind: &ActionKind) -> Method {
  match kind {
    ActionKind::Create | ActionKind::Custom(_) => Method::POST,
    ActionKind::Update => Method::PATCH,
    ActionKind::Delete => Method::DELETE,
  }
}

fn transport_error(e: reqwest::Error) -> SendError {
  if e.is_decode() {
    SendError::Decode(e.to_string())
  } else {
    SendError::Transient(e.to_string())
  }
}

async fn check_status(response: Response) -> Result<Response, SendError> {
  let status = response.status();
  if status.is_success() {
    return Ok(response);
  }

  let body = response.text().await.unwrap_or_default();
  Err(classify_status(status, body))
}

fn classify_status(status: StatusCode, body: String) -> SendError {
  let message = if body.trim().is_empty() {
    status
      .canonical_reason()
      .unwrap_or("unknown status")
      .to_string()
  } else {
    body
  };

  if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
    SendError::Transient(format!("{}: {}", status.as_u16(), message))
  } else {
    SendError::Rejected {
      status: status.as_u16(),
      message,
    }
  }
}

#[async_trait]
impl ActionSender for HttpBackend {
  async fn send(&self, action: &QueuedAction) -> Result<(), SendError> {
    let url = self.endpoint(&action.target_resource)?;
    let body = json!({
      "id": action.id,
      "kind": action.kind.to_string(),
      "payload": action.payload,
    });

    debug!(action_id = %action.id, kind = %action.kind, %url, "Sending action");

    let response = self
      .request(method_for(&action.kind), url)
      .header("Idempotency-Key", action.id.to_string())
      .json(&body)
      .send()
      .await
      .map_err(transport_error)?;

    check_status(response).await.map(|_| ())
  }
}

#[async_trait]
impl ConnectivityProbe for HttpBackend {
  /// Any HTTP answer, even an error status, means the backend is reachable.
  async fn is_online(&self) -> bool {
    self
      .request(Method::HEAD, self.base_url.clone())
      .send()
      .await
      .is_ok()
  }
}
