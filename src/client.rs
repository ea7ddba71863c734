use crate::protocol::{ChatRequest, LIST_SESSIONS_ACTION, NormalizedEvent};
use crate::server::SESSION_ID_HEADER;
use crate::sse::{LineCodec, parse_payload};
use futures::{StreamExt, TryStreamExt};
use reqwest::Client as HttpClient;
use serde_json::Value;
use std::error::Error;
use std::future::Future;
use std::io;
use tokio_util::codec::FramedRead;
use tokio_util::io::StreamReader;

pub struct ClientConfig {
    pub base_url: String,
    pub user_id: Option<String>,
    pub session_id: Option<String>,
}

/// Terminal client for a running relay.
#[derive(Clone)]
pub struct RelayClient {
    base_url: String,
    user_id: Option<String>,
    session_id: Option<String>,
    http: HttpClient,
}

type ClientResult<T> = Result<T, Box<dyn Error + Send + Sync>>;

impl RelayClient {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            base_url: normalize_base_url(&config.base_url),
            user_id: config.user_id,
            session_id: config.session_id,
            http: HttpClient::new(),
        }
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub async fn list_sessions(&self) -> ClientResult<Value> {
        let request = ChatRequest {
            user_id: self.user_id.clone(),
            action: Some(LIST_SESSIONS_ACTION.to_string()),
            ..ChatRequest::default()
        };
        let response = self
            .http
            .post(format!("{}/api/chat", self.base_url))
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(format!("Failed to list sessions: {} - {}", status, body).into());
        }

        Ok(response.json().await?)
    }

    /// Sends one message and feeds every decodable event to `on_event`.
    ///
    /// Remembers the session the relay assigned so the next call continues it.
    pub async fn send_message<F, Fut>(&mut self, message: String, mut on_event: F) -> ClientResult<()>
    where
        F: FnMut(NormalizedEvent) -> Fut,
        Fut: Future<Output = ()>,
    {
        let request = ChatRequest {
            message: Some(message),
            user_id: self.user_id.clone(),
            session_id: self.session_id.clone(),
            ..ChatRequest::default()
        };
        let response = self
            .http
            .post(format!("{}/api/chat", self.base_url))
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(format!("Failed to send message: {} - {}", status, body).into());
        }

        if let Some(session_id) = response
            .headers()
            .get(SESSION_ID_HEADER)
            .and_then(|value| value.to_str().ok())
        {
            self.session_id = Some(session_id.to_string());
        }

        let reader = StreamReader::new(Box::pin(response.bytes_stream().map_err(io::Error::other)));
        let mut lines = FramedRead::new(reader, LineCodec::new());
        let mut data_lines = Vec::new();

        while let Some(line) = lines.next().await {
            let line = line?;
            let line = line.trim_end_matches('\r');

            if line.is_empty() {
                if let Some(event) = take_event(&mut data_lines) {
                    on_event(event).await;
                }
                continue;
            }

            if let Some(data) = line.strip_prefix("data:") {
                data_lines.push(data.trim_start().to_string());
            }
        }

        if let Some(event) = take_event(&mut data_lines) {
            on_event(event).await;
        }

        Ok(())
    }
}

fn normalize_base_url(value: &str) -> String {
    value.trim_end_matches('/').to_string()
}

fn take_event(data_lines: &mut Vec<String>) -> Option<NormalizedEvent> {
    if data_lines.is_empty() {
        return None;
    }
    let data = data_lines.join("\n");
    data_lines.clear();
    parse_payload(&data)
}
