//! Direct-streaming protocol against a self-hosted ADK runtime.
//!
//! The runtime emits raw agent records, so its body goes through the
//! transcoder before reaching the client.

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue};
use reqwest::{Client, StatusCode};
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use super::{Upstream, UpstreamStream, generated_session_id};
use crate::auth::Credentials;
use crate::error::{RelayError, RelayResult};
use crate::protocol::{ChatTurn, Content, DeploymentMode, Part, RunSseRequest, SessionContext};
use crate::sse;

pub struct AdkRuntime {
    http: Client,
    credentials: Credentials,
    base_url: String,
    app_name: String,
}

impl AdkRuntime {
    pub fn new(http: Client, credentials: Credentials, base_url: String, app_name: String) -> Self {
        Self {
            http,
            credentials,
            base_url,
            app_name,
        }
    }

    /// Ids come from the inbound request; each one stays a single path segment.
    fn sessions_url(&self, user_id: &str) -> String {
        format!(
            "{}/apps/{}/users/{}/sessions",
            self.base_url,
            urlencoding::encode(&self.app_name),
            urlencoding::encode(user_id)
        )
    }

    /// Best effort: the runtime creates sessions lazily on some versions, so
    /// failures here are logged and the turn proceeds.
    async fn ensure_session(&self, headers: HeaderMap, session: &SessionContext) {
        let url = format!(
            "{}/{}",
            self.sessions_url(&session.user_id),
            urlencoding::encode(&session.session_id)
        );
        let result = self
            .http
            .post(&url)
            .headers(headers)
            .json(&json!({}))
            .send()
            .await;

        match result {
            Ok(response) if response.status().is_success() => {
                debug!(session_id = %session.session_id, "Created ADK session");
            }
            Ok(response) if response.status() == StatusCode::CONFLICT => {
                debug!(session_id = %session.session_id, "ADK session already exists");
            }
            Ok(response) => {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                warn!(
                    session_id = %session.session_id,
                    status = status.as_u16(),
                    body = %body,
                    "Session ensure failed; streaming anyway"
                );
            }
            Err(err) => {
                warn!(session_id = %session.session_id, error = %err, "Session ensure failed; streaming anyway");
            }
        }
    }
}

#[async_trait]
impl Upstream for AdkRuntime {
    fn mode(&self) -> DeploymentMode {
        DeploymentMode::Local
    }

    async fn run(&self, turn: &ChatTurn) -> RelayResult<UpstreamStream> {
        let mut headers = self.credentials.headers(&self.http).await?;
        let session = SessionContext {
            user_id: turn.user_id.clone(),
            session_id: turn.session_id.clone().unwrap_or_else(generated_session_id),
        };

        self.ensure_session(headers.clone(), &session).await;

        if let Some(value) = turn
            .authorization
            .as_deref()
            .and_then(|value| HeaderValue::from_str(value).ok())
        {
            headers.insert(AUTHORIZATION, value);
        }

        info!(user_id = %session.user_id, session_id = %session.session_id, "Streaming run_sse from ADK runtime");
        let response = self
            .http
            .post(format!("{}/run_sse", self.base_url))
            .headers(headers)
            .json(&RunSseRequest {
                app_name: &self.app_name,
                user_id: &session.user_id,
                session_id: &session.session_id,
                new_message: Content {
                    parts: vec![Part::text(turn.message.as_str())],
                    role: Some("user".to_string()),
                },
                streaming: true,
            })
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(RelayError::from_response("Failed to stream from ADK runtime", response).await);
        }

        Ok(UpstreamStream {
            session,
            body: sse::transcode(response.bytes_stream()).boxed(),
        })
    }

    async fn list_sessions(&self, user_id: &str) -> RelayResult<Value> {
        let headers = self.credentials.headers(&self.http).await?;
        let response = self
            .http
            .get(self.sessions_url(user_id))
            .headers(headers)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(RelayError::from_response("Failed to list sessions", response).await);
        }

        Ok(response.json().await?)
    }
}
