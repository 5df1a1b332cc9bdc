//! HTTP/JSON gateway implementation of [`MessagingApi`].
//!
//! Every response is an envelope `{"ok": bool, "result": ..., "error": CODE,
//! "session": ...}`. A `session` field, when present, replaces the client's
//! current session blob; that is how provisional sign-in sessions and final
//! grants travel back to the caller.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::redirect::Policy;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{debug, warn};
use url::Url;

use crate::types::{
    AuthGrant, CodeRequest, LoginToken, PageRequest, RawConversation, RawItem, RawReaction,
    RawUser,
};
use crate::{ApiError, Connector, MessagingApi};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    #[serde(default)]
    ok: bool,
    result: Option<T>,
    error: Option<String>,
    description: Option<String>,
    session: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CountResult {
    count: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct HistoryResult {
    #[serde(default)]
    messages: Vec<RawItem>,
}

#[derive(Debug, Deserialize)]
struct ReactionsResult {
    #[serde(default)]
    reactions: Vec<RawReaction>,
}

pub struct HttpApi {
    client: Client,
    base_url: Url,
    session: RwLock<Option<String>>,
}

impl HttpApi {
    pub fn new(base_url: Url, session: Option<String>, timeout: Duration) -> Self {
        let client = Client::builder()
            .timeout(timeout)
            .redirect(Policy::limited(5))
            .user_agent(concat!("grouplog/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            client,
            base_url,
            session: RwLock::new(session),
        }
    }

    /// Current session blob (updated by handshakes).
    pub fn session(&self) -> Option<String> {
        self.session.read().ok().and_then(|s| s.clone())
    }

    fn set_session(&self, session: String) {
        if let Ok(mut guard) = self.session.write() {
            *guard = Some(session);
        }
    }

    fn endpoint(&self, path: &str) -> Result<Url, ApiError> {
        self.base_url
            .join(path)
            .map_err(|e| ApiError::Malformed(format!("bad endpoint {}: {}", path, e)))
    }

    /// Provider file ids go in as single percent-encoded path segments.
    fn file_endpoint(
        &self,
        conversation_id: i64,
        message_id: i64,
        file_id: &str,
        thumb: bool,
    ) -> Result<Url, ApiError> {
        if file_id.is_empty() || file_id == "." || file_id == ".." {
            return Err(ApiError::Malformed(format!("bad file id: {:?}", file_id)));
        }
        let mut url = self.endpoint(&format!(
            "v1/conversations/{}/messages/{}/files/",
            conversation_id, message_id
        ))?;
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| ApiError::Malformed("gateway url cannot hold a path".to_string()))?;
            segments.pop_if_empty().push(file_id);
            if thumb {
                segments.push("thumb");
            }
        }
        Ok(url)
    }

    fn authorize(&self, builder: RequestBuilder) -> RequestBuilder {
        match self.session() {
            Some(session) => builder.bearer_auth(session),
            None => builder,
        }
    }

    async fn send<T: DeserializeOwned>(&self, builder: RequestBuilder) -> Result<T, ApiError> {
        let response = self.authorize(builder).send().await.map_err(transport_error)?;
        let status = response.status();
        let retry_after = retry_after_secs(&response);
        let body = response.text().await.map_err(transport_error)?;

        if !status.is_success() {
            return Err(classify(status, retry_after, &body));
        }

        let envelope: Envelope<T> = serde_json::from_str(&body)
            .map_err(|e| ApiError::Malformed(e.to_string()))?;
        if let Some(session) = envelope.session.clone() {
            self.set_session(session);
        }
        if !envelope.ok {
            let code = envelope.error.unwrap_or_default();
            return Err(ApiError::from_code(&code).unwrap_or(ApiError::Rejected {
                status: status.as_u16(),
                message: envelope.description.unwrap_or(code),
            }));
        }
        match envelope.result {
            Some(result) => Ok(result),
            // Acknowledgement-only endpoints omit `result`.
            None => serde_json::from_value(serde_json::Value::Null)
                .map_err(|_| ApiError::Malformed("missing result".to_string())),
        }
    }

    async fn send_bytes(&self, builder: RequestBuilder) -> Result<Option<Vec<u8>>, ApiError> {
        let response = self.authorize(builder).send().await.map_err(transport_error)?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            let retry_after = retry_after_secs(&response);
            let body = response.text().await.unwrap_or_default();
            return Err(classify(status, retry_after, &body));
        }
        let bytes = response.bytes().await.map_err(transport_error)?;
        Ok(Some(bytes.to_vec()))
    }
}

#[async_trait]
impl MessagingApi for HttpApi {
    async fn connect(&self) -> Result<(), ApiError> {
        let url = self.endpoint("v1/ping")?;
        let _: serde_json::Value = self.send(self.client.get(url)).await?;
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), ApiError> {
        let url = self.endpoint("v1/auth/disconnect")?;
        let _: serde_json::Value = self.send(self.client.post(url)).await?;
        Ok(())
    }

    async fn me(&self) -> Result<RawUser, ApiError> {
        let url = self.endpoint("v1/me")?;
        self.send(self.client.get(url)).await
    }

    async fn send_code(&self, phone: &str) -> Result<CodeRequest, ApiError> {
        let url = self.endpoint("v1/auth/send_code")?;
        self.send(self.client.post(url).json(&serde_json::json!({ "phone": phone })))
            .await
    }

    async fn sign_in(
        &self,
        phone: &str,
        phone_code_hash: &str,
        code: &str,
    ) -> Result<AuthGrant, ApiError> {
        let url = self.endpoint("v1/auth/sign_in")?;
        let body = serde_json::json!({
            "phone": phone,
            "phone_code_hash": phone_code_hash,
            "code": code,
        });
        let grant: AuthGrant = self.send(self.client.post(url).json(&body)).await?;
        self.set_session(grant.session.clone());
        Ok(grant)
    }

    async fn check_password(&self, password: &str) -> Result<AuthGrant, ApiError> {
        let url = self.endpoint("v1/auth/check_password")?;
        let grant: AuthGrant = self
            .send(self.client.post(url).json(&serde_json::json!({ "password": password })))
            .await?;
        self.set_session(grant.session.clone());
        Ok(grant)
    }

    async fn export_login_token(&self) -> Result<LoginToken, ApiError> {
        let url = self.endpoint("v1/auth/login_token")?;
        self.send(self.client.post(url)).await
    }

    async fn accept_login_token(&self, token: &str) -> Result<AuthGrant, ApiError> {
        let url = self.endpoint("v1/auth/login_token/poll")?;
        let grant: AuthGrant = self
            .send(self.client.post(url).json(&serde_json::json!({ "token": token })))
            .await?;
        self.set_session(grant.session.clone());
        Ok(grant)
    }

    async fn log_out(&self) -> Result<(), ApiError> {
        let url = self.endpoint("v1/auth/log_out")?;
        let _: serde_json::Value = self.send(self.client.post(url)).await?;
        Ok(())
    }

    async fn resolve_conversation(&self, reference: &str) -> Result<RawConversation, ApiError> {
        let url = self.endpoint("v1/conversations/resolve")?;
        self.send(self.client.get(url).query(&[("ref", reference)]))
            .await
    }

    async fn history_count(
        &self,
        conversation_id: i64,
        since: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
    ) -> Result<Option<u64>, ApiError> {
        let url = self.endpoint(&format!("v1/conversations/{}/history/count", conversation_id))?;
        let mut params: Vec<(&str, String)> = Vec::new();
        if let Some(since) = since {
            params.push(("since", since.timestamp().to_string()));
        }
        if let Some(until) = until {
            params.push(("until", until.timestamp().to_string()));
        }
        let result: CountResult = self.send(self.client.get(url).query(&params)).await?;
        Ok(result.count)
    }

    async fn history_page(
        &self,
        conversation_id: i64,
        request: &PageRequest,
    ) -> Result<Vec<RawItem>, ApiError> {
        let url = self.endpoint(&format!("v1/conversations/{}/history", conversation_id))?;
        let mut params: Vec<(&str, String)> = vec![("limit", request.limit.to_string())];
        if let Some(since) = request.since {
            params.push(("since", since.timestamp().to_string()));
        }
        if let Some(until) = request.until {
            params.push(("until", until.timestamp().to_string()));
        }
        if let Some(offset_id) = request.offset_id {
            params.push(("offset_id", offset_id.to_string()));
        }
        let result: HistoryResult = self.send(self.client.get(url).query(&params)).await?;
        debug!(
            conversation_id,
            count = result.messages.len(),
            "history page received"
        );
        Ok(result.messages)
    }

    async fn reactions(
        &self,
        conversation_id: i64,
        message_id: i64,
    ) -> Result<Vec<RawReaction>, ApiError> {
        let url = self.endpoint(&format!(
            "v1/conversations/{}/messages/{}/reactions",
            conversation_id, message_id
        ))?;
        let result: ReactionsResult = self.send(self.client.get(url)).await?;
        Ok(result.reactions)
    }

    async fn download(
        &self,
        conversation_id: i64,
        message_id: i64,
        file_id: &str,
    ) -> Result<Vec<u8>, ApiError> {
        let url = self.file_endpoint(conversation_id, message_id, file_id, false)?;
        self.send_bytes(self.client.get(url))
            .await?
            .ok_or_else(|| ApiError::Rejected {
                status: 404,
                message: format!("file {} not found", file_id),
            })
    }

    async fn download_thumbnail(
        &self,
        conversation_id: i64,
        message_id: i64,
        file_id: &str,
    ) -> Result<Option<Vec<u8>>, ApiError> {
        let url = self.file_endpoint(conversation_id, message_id, file_id, true)?;
        self.send_bytes(self.client.get(url)).await
    }
}

/// Builds [`HttpApi`] clients against one gateway.
#[derive(Debug, Clone)]
pub struct HttpConnector {
    base_url: Url,
    timeout: Duration,
}

impl HttpConnector {
    pub fn new(base_url: &str) -> Result<Self> {
        // A trailing slash keeps `Url::join` from dropping the last path segment.
        let normalized = if base_url.ends_with('/') {
            base_url.to_string()
        } else {
            format!("{}/", base_url)
        };
        let base_url = Url::parse(&normalized)
            .with_context(|| format!("invalid gateway url: {}", base_url))?;
        Ok(Self {
            base_url,
            timeout: DEFAULT_TIMEOUT,
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl Connector for HttpConnector {
    fn open(&self, session: Option<&str>) -> Arc<dyn MessagingApi> {
        Arc::new(HttpApi::new(
            self.base_url.clone(),
            session.map(str::to_string),
            self.timeout,
        ))
    }
}

fn retry_after_secs(response: &reqwest::Response) -> Option<u64> {
    response
        .headers()
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
}

fn transport_error(err: reqwest::Error) -> ApiError {
    if err.is_decode() {
        ApiError::Malformed(err.to_string())
    } else {
        ApiError::Transient(err.to_string())
    }
}

/// Fold a non-success HTTP response into an error class.
pub(crate) fn classify(status: StatusCode, retry_after: Option<u64>, body: &str) -> ApiError {
    let envelope: Option<Envelope<serde_json::Value>> = serde_json::from_str(body).ok();
    let code = envelope
        .as_ref()
        .and_then(|e| e.error.clone())
        .unwrap_or_default();

    if let Some(err) = ApiError::from_code(&code) {
        return err;
    }

    match status.as_u16() {
        420 | 429 => ApiError::Throttled {
            seconds: retry_after.unwrap_or(1),
        },
        401 => ApiError::AuthExpired(if code.is_empty() {
            "unauthorized".to_string()
        } else {
            code
        }),
        403 | 404 => ApiError::Access(if code.is_empty() {
            status.to_string()
        } else {
            code
        }),
        500..=599 => ApiError::Transient(format!("gateway returned {}", status)),
        other => {
            warn!("unclassified gateway error {}: {}", other, code);
            ApiError::Rejected {
                status: other,
                message: envelope
                    .and_then(|e| e.description)
                    .unwrap_or(code),
            }
        }
    }
}
