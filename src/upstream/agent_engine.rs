//! Managed-session protocol against a deployed Vertex AI Agent Engine.
//!
//! Sessions are created through the `:query` class-method endpoint, then the
//! turn is streamed from `:streamQuery`. The engine already emits client-ready
//! SSE, so the body is forwarded chunk for chunk without reparsing.

use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use reqwest::Client;
use reqwest::header::HeaderMap;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::io;
use tracing::{debug, info};

use super::{Upstream, UpstreamStream};
use crate::auth::Credentials;
use crate::error::{RelayError, RelayResult};
use crate::protocol::{
    ChatTurn, ClassMethodCall, ClassMethodResult, CreatedSession, DeploymentMode, SessionContext,
};

pub struct AgentEngine {
    http: Client,
    credentials: Credentials,
    query_url: String,
    stream_url: String,
}

#[derive(Debug, Serialize)]
struct UserInput<'a> {
    user_id: &'a str,
}

#[derive(Debug, Serialize)]
struct StreamQueryInput<'a> {
    user_id: &'a str,
    session_id: &'a str,
    message: &'a str,
}

impl AgentEngine {
    pub fn new(http: Client, credentials: Credentials, query_url: String, stream_url: String) -> Self {
        Self {
            http,
            credentials,
            query_url,
            stream_url,
        }
    }

    async fn query<I, O>(
        &self,
        headers: HeaderMap,
        class_method: &'static str,
        input: I,
        context: &'static str,
    ) -> RelayResult<Option<O>>
    where
        I: Serialize,
        O: DeserializeOwned,
    {
        let response = self
            .http
            .post(&self.query_url)
            .headers(headers)
            .json(&ClassMethodCall {
                class_method,
                input,
            })
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(RelayError::from_response(context, response).await);
        }

        let result: ClassMethodResult<O> = response.json().await?;
        Ok(result.output)
    }

    async fn create_session(&self, headers: HeaderMap, user_id: &str) -> RelayResult<String> {
        let created: Option<CreatedSession> = self
            .query(
                headers,
                "create_session",
                UserInput { user_id },
                "Failed to create session",
            )
            .await?;

        let session_id = created
            .and_then(|session| session.id)
            .filter(|id| !id.is_empty())
            .ok_or(RelayError::MissingSessionId)?;
        debug!(user_id, session_id = %session_id, "Created Agent Engine session");
        Ok(session_id)
    }
}

#[async_trait]
impl Upstream for AgentEngine {
    fn mode(&self) -> DeploymentMode {
        DeploymentMode::AgentEngine
    }

    async fn run(&self, turn: &ChatTurn) -> RelayResult<UpstreamStream> {
        let headers = self.credentials.headers(&self.http).await?;

        let session_id = match &turn.session_id {
            Some(id) => id.clone(),
            None => self.create_session(headers.clone(), &turn.user_id).await?,
        };

        info!(user_id = %turn.user_id, session_id = %session_id, "Streaming query from Agent Engine");
        let response = self
            .http
            .post(&self.stream_url)
            .headers(headers)
            .json(&ClassMethodCall {
                class_method: "stream_query",
                input: StreamQueryInput {
                    user_id: &turn.user_id,
                    session_id: &session_id,
                    message: &turn.message,
                },
            })
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(RelayError::from_response("Failed to stream query", response).await);
        }

        Ok(UpstreamStream {
            session: SessionContext {
                user_id: turn.user_id.clone(),
                session_id,
            },
            body: response.bytes_stream().map_err(io::Error::other).boxed(),
        })
    }

    async fn list_sessions(&self, user_id: &str) -> RelayResult<Value> {
        let headers = self.credentials.headers(&self.http).await?;
        let sessions: Option<Value> = self
            .query(
                headers,
                "list_sessions",
                UserInput { user_id },
                "Failed to list sessions",
            )
            .await?;
        Ok(sessions.unwrap_or_else(|| Value::Array(Vec::new())))
    }
}
