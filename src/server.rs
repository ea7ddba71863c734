use axum::Json;
use axum::body::Body;
use axum::extract::State;
use axum::extract::rejection::JsonRejection;
use axum::http::header::{AUTHORIZATION, CACHE_CONTROL, CONNECTION, CONTENT_TYPE};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use futures::TryStreamExt;
use serde_json::{Value, json};
use std::error::Error;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{Instrument, error, info, info_span};
use uuid::Uuid;

use crate::config::Config;
use crate::error::{RelayError, RelayResult};
use crate::protocol::{ChatRequest, ChatTurn};
use crate::upstream::{Upstream, UpstreamStream, generated_user_id};

pub const SESSION_ID_HEADER: &str = "x-session-id";
pub const USER_ID_HEADER: &str = "x-user-id";

pub(crate) struct ServerState {
    pub(crate) upstream: Arc<dyn Upstream>,
}

type ServerResult<T> = Result<T, Box<dyn Error + Send + Sync>>;

pub async fn run(config: Config) -> ServerResult<()> {
    let http = config.http_client()?;
    let state = Arc::new(ServerState {
        upstream: config.upstream(http),
    });

    let listener = tokio::net::TcpListener::bind(&config.listen).await?;
    info!(
        listen = %config.listen,
        mode = %config.mode(),
        "agent-relay listening"
    );
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

pub(crate) fn router(state: Arc<ServerState>) -> axum::Router {
    axum::Router::new()
        .route("/api/chat", post(chat))
        .route("/health", get(health))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutting down");
}

async fn health(State(state): State<Arc<ServerState>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "deploymentMode": state.upstream.mode(),
    }))
}

async fn chat(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    payload: Result<Json<ChatRequest>, JsonRejection>,
) -> Result<Response, RelayError> {
    let mode = state.upstream.mode();
    let Json(request) = payload.map_err(|rejection| RelayError::bad_request(rejection.body_text()))?;
    let span = info_span!("chat", request_id = %Uuid::new_v4(), mode = %mode);

    handle_chat(state.upstream.as_ref(), &headers, request)
        .instrument(span)
        .await
        .map_err(|err| err.with_mode(mode))
}

async fn handle_chat(
    upstream: &dyn Upstream,
    headers: &HeaderMap,
    request: ChatRequest,
) -> RelayResult<Response> {
    if request.is_list_sessions() {
        let user_id = request
            .user_id()
            .ok_or_else(|| RelayError::bad_request("User ID is required for listing sessions"))?;
        let sessions = upstream.list_sessions(user_id).await?;
        return Ok(Json(sessions).into_response());
    }

    let message = request
        .text()
        .ok_or_else(|| RelayError::bad_request("Message is required"))?;

    let turn = ChatTurn {
        user_id: request
            .user_id()
            .map(str::to_string)
            .unwrap_or_else(generated_user_id),
        session_id: request.session_id().map(str::to_string),
        message: message.to_string(),
        authorization: headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string),
    };

    let stream = upstream.run(&turn).await?;
    Ok(sse_response(stream))
}

fn sse_response(stream: UpstreamStream) -> Response {
    let UpstreamStream { session, body } = stream;
    let session_id = session.session_id.clone();
    let body = body.inspect_err(move |err| {
        error!(session_id = %session_id, error = %err, "Upstream stream failed; closing response");
    });

    let mut response = Response::new(Body::from_stream(body));
    *response.status_mut() = StatusCode::OK;
    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/event-stream"));
    headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(CONNECTION, HeaderValue::from_static("keep-alive"));
    headers.insert(
        HeaderName::from_static("x-accel-buffering"),
        HeaderValue::from_static("no"),
    );
    if let Ok(value) = HeaderValue::from_str(&session.session_id) {
        headers.insert(HeaderName::from_static(SESSION_ID_HEADER), value);
    }
    if let Ok(value) = HeaderValue::from_str(&session.user_id) {
        headers.insert(HeaderName::from_static(USER_ID_HEADER), value);
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Credentials;
    use crate::config::{Config, test_config};
    use crate::protocol::{DeploymentMode, SessionContext};
    use crate::upstream::adk::AdkRuntime;
    use async_trait::async_trait;
    use bytes::Bytes;
    use futures::{StreamExt, stream};
    use mockito::{Matcher, Server};
    use reqwest::Method;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    struct SetOnDrop(Arc<AtomicBool>);

    impl Drop for SetOnDrop {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    /// Streams a keep-alive comment every few milliseconds until dropped.
    struct EndlessUpstream {
        dropped: Arc<AtomicBool>,
    }

    #[async_trait]
    impl Upstream for EndlessUpstream {
        fn mode(&self) -> DeploymentMode {
            DeploymentMode::Local
        }

        async fn run(&self, turn: &ChatTurn) -> RelayResult<UpstreamStream> {
            let guard = SetOnDrop(Arc::clone(&self.dropped));
            let body = stream::unfold(guard, |guard| async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                Some((Ok(Bytes::from_static(b": ping\n")), guard))
            });
            Ok(UpstreamStream {
                session: SessionContext {
                    user_id: turn.user_id.clone(),
                    session_id: "s1".to_string(),
                },
                body: body.boxed(),
            })
        }

        async fn list_sessions(&self, _user_id: &str) -> RelayResult<Value> {
            Ok(json!([]))
        }
    }

    async fn spawn(upstream: Arc<dyn Upstream>) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = router(Arc::new(ServerState { upstream }));
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    async fn spawn_with(config: &Config) -> String {
        spawn(config.upstream(reqwest::Client::new())).await
    }

    fn engine_config(server: &Server) -> Config {
        Config {
            project: Some("proj".to_string()),
            agent_engine_id: Some("42".to_string()),
            agent_engine_api_base: Some(server.url()),
            ..test_config(&server.url())
        }
    }

    const ENGINE_PATH: &str = "/v1/projects/proj/locations/us-central1/reasoningEngines/42";

    async fn post_chat(relay: &str, body: Value) -> reqwest::Response {
        reqwest::Client::new()
            .post(format!("{}/api/chat", relay))
            .header("origin", "http://localhost:3000")
            .json(&body)
            .send()
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn list_sessions_requires_user_id() {
        let server = Server::new_async().await;
        let relay = spawn_with(&engine_config(&server)).await;

        let response = post_chat(&relay, json!({"action": "list_sessions"})).await;
        assert_eq!(response.status(), 400);
        let body: Value = response.json().await.unwrap();
        assert_eq!(
            body,
            json!({"error": "User ID is required for listing sessions"})
        );
    }

    #[tokio::test]
    async fn list_sessions_returns_upstream_output() {
        let mut server = Server::new_async().await;
        server
            .mock("POST", format!("{}:query", ENGINE_PATH).as_str())
            .match_body(Matcher::PartialJson(json!({"class_method": "list_sessions"})))
            .with_status(200)
            .with_body(r#"{"output":{"sessions":[{"id":"s1"}]}}"#)
            .create_async()
            .await;
        let relay = spawn_with(&engine_config(&server)).await;

        let response = post_chat(&relay, json!({"action": "list_sessions", "userId": "u1"})).await;
        assert_eq!(response.status(), 200);
        let body: Value = response.json().await.unwrap();
        assert_eq!(body, json!({"sessions": [{"id": "s1"}]}));
    }

    #[tokio::test]
    async fn missing_message_is_rejected() {
        let server = Server::new_async().await;
        let relay = spawn_with(&test_config(&server.url())).await;

        let response = post_chat(&relay, json!({"userId": "u1"})).await;
        assert_eq!(response.status(), 400);
        let body: Value = response.json().await.unwrap();
        assert_eq!(body, json!({"error": "Message is required"}));
    }

    #[tokio::test]
    async fn managed_mode_creates_session_and_forwards_raw_bytes() {
        let mut server = Server::new_async().await;
        let create = server
            .mock("POST", format!("{}:query", ENGINE_PATH).as_str())
            .match_body(Matcher::Json(json!({
                "class_method": "create_session",
                "input": {"user_id": "u1"},
            })))
            .with_status(200)
            .with_body(r#"{"output":{"id":"created-1"}}"#)
            .expect(1)
            .create_async()
            .await;
        let upstream_body = "data: {\"content\":{\"parts\":[{\"text\":\"hi there\"}]}}\n\ndata: {bad\n\n";
        let stream = server
            .mock("POST", format!("{}:streamQuery", ENGINE_PATH).as_str())
            .match_query(Matcher::UrlEncoded("alt".into(), "sse".into()))
            .match_body(Matcher::Json(json!({
                "class_method": "stream_query",
                "input": {"user_id": "u1", "session_id": "created-1", "message": "hi"},
            })))
            .with_status(200)
            .with_header("content-type", "text/event-stream")
            .with_body(upstream_body)
            .expect(1)
            .create_async()
            .await;
        let relay = spawn_with(&engine_config(&server)).await;

        let response = post_chat(&relay, json!({"query": "hi", "userId": "u1"})).await;
        assert_eq!(response.status(), 200);
        assert_eq!(response.headers()[CONTENT_TYPE], "text/event-stream");
        assert_eq!(response.headers()[CACHE_CONTROL], "no-cache");
        assert_eq!(response.headers()[SESSION_ID_HEADER], "created-1");
        assert_eq!(response.text().await.unwrap(), upstream_body);

        create.assert_async().await;
        stream.assert_async().await;
    }

    #[tokio::test]
    async fn managed_mode_without_session_id_is_a_server_error() {
        let mut server = Server::new_async().await;
        server
            .mock("POST", format!("{}:query", ENGINE_PATH).as_str())
            .with_status(200)
            .with_body(r#"{"output":{"user_id":"u1"}}"#)
            .create_async()
            .await;
        let relay = spawn_with(&engine_config(&server)).await;

        let response = post_chat(&relay, json!({"query": "hi", "userId": "u1"})).await;
        assert_eq!(response.status(), 500);
        let body: Value = response.json().await.unwrap();
        assert!(body["error"]
            .as_str()
            .unwrap()
            .contains("No session ID returned"));
    }

    #[tokio::test]
    async fn direct_mode_reshapes_every_data_line() {
        let mut server = Server::new_async().await;
        let ensure = server
            .mock("POST", "/apps/app/users/u1/sessions/s1")
            .with_status(409)
            .expect(1)
            .create_async()
            .await;
        let run = server
            .mock("POST", "/run_sse")
            .match_header("authorization", "Bearer user-token")
            .match_body(Matcher::Json(json!({
                "appName": "app",
                "userId": "u1",
                "sessionId": "s1",
                "newMessage": {"parts": [{"text": "hi"}], "role": "user"},
                "streaming": true,
            })))
            .with_status(200)
            .with_header("content-type", "text/event-stream")
            .with_body(concat!(
                "data: {\"author\":\"a\",\"output\":\"hi\"}\n\n",
                "data: [{\"author\":\"a\",\"output\":\"hi\"}]\n\n",
                "data: {\"content\":{\"parts\":[{\"text\":\"thinking\",\"thought\":true}]},\"usageMetadata\":{\"totalTokenCount\":3}}\n\n",
            ))
            .expect(1)
            .create_async()
            .await;
        let relay = spawn_with(&test_config(&server.url())).await;

        let response = reqwest::Client::new()
            .post(format!("{}/api/chat", relay))
            .header("origin", "http://localhost:3000")
            .bearer_auth("user-token")
            .json(&json!({"message": "hi", "userId": "u1", "sessionId": "s1"}))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
        assert_eq!(response.headers()["access-control-allow-origin"], "*");
        assert_eq!(
            response.text().await.unwrap(),
            concat!(
                "data: {\"content\":{\"parts\":[{\"text\":\"hi\"}]},\"author\":\"a\"}\n\n",
                "data: {\"content\":{\"parts\":[{\"text\":\"hi\"}]},\"author\":\"a\"}\n\n",
                "data: {\"content\":{\"parts\":[{\"text\":\"thinking\",\"thought\":true}]},\"usageMetadata\":{\"totalTokenCount\":3}}\n\n",
            )
        );

        ensure.assert_async().await;
        run.assert_async().await;
    }

    #[tokio::test]
    async fn direct_mode_stream_failure_propagates_status() {
        let mut server = Server::new_async().await;
        server
            .mock("POST", "/apps/app/users/u1/sessions/s1")
            .with_status(200)
            .create_async()
            .await;
        server
            .mock("POST", "/run_sse")
            .with_status(503)
            .with_body("runtime warming up")
            .create_async()
            .await;
        let relay = spawn_with(&test_config(&server.url())).await;

        let response =
            post_chat(&relay, json!({"message": "hi", "userId": "u1", "sessionId": "s1"})).await;
        assert_eq!(response.status(), 503);
        let body: Value = response.json().await.unwrap();
        assert!(body["error"].as_str().unwrap().contains("runtime warming up"));
    }

    #[tokio::test]
    async fn auth_failure_reports_deployment_mode() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", "/token")
            .with_status(500)
            .with_body("metadata internals")
            .create_async()
            .await;
        let upstream = Arc::new(AdkRuntime::new(
            reqwest::Client::new(),
            Credentials::MetadataServer {
                token_url: format!("{}/token", server.url()),
            },
            server.url(),
            "app".to_string(),
        ));
        let relay = spawn(upstream).await;

        let response = post_chat(&relay, json!({"message": "hi"})).await;
        assert_eq!(response.status(), 500);
        let body: Value = response.json().await.unwrap();
        assert_eq!(
            body,
            json!({
                "error": "Internal server error",
                "deploymentMode": "local",
                "useAgentEngine": false,
            })
        );
    }

    #[tokio::test]
    async fn client_disconnect_drops_upstream_stream() {
        let dropped = Arc::new(AtomicBool::new(false));
        let relay = spawn(Arc::new(EndlessUpstream {
            dropped: Arc::clone(&dropped),
        }))
        .await;

        let mut response = post_chat(&relay, json!({"message": "hi"})).await;
        assert_eq!(response.status(), 200);
        let first = response.chunk().await.unwrap().unwrap();
        assert!(first.starts_with(b": ping\n"));
        assert!(!dropped.load(Ordering::SeqCst));
        drop(response);

        tokio::time::timeout(Duration::from_secs(5), async {
            while !dropped.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("upstream stream still alive after client went away");
    }

    #[tokio::test]
    async fn malformed_body_is_a_json_bad_request() {
        let server = Server::new_async().await;
        let relay = spawn_with(&test_config(&server.url())).await;

        let response = reqwest::Client::new()
            .post(format!("{}/api/chat", relay))
            .header("content-type", "application/json")
            .body("{not json")
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 400);
        let body: Value = response.json().await.unwrap();
        assert!(body["error"].is_string());

        let response = reqwest::Client::new()
            .post(format!("{}/api/chat", relay))
            .body(r#"{"message":"hi"}"#)
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 400);
        let body: Value = response.json().await.unwrap();
        assert!(body["error"].as_str().unwrap().contains("Content-Type"));
    }

    #[tokio::test]
    async fn preflight_gets_cors_headers() {
        let server = Server::new_async().await;
        let relay = spawn_with(&test_config(&server.url())).await;

        let response = reqwest::Client::new()
            .request(Method::OPTIONS, format!("{}/api/chat", relay))
            .header("origin", "http://localhost:3000")
            .header("access-control-request-method", "POST")
            .header("access-control-request-headers", "content-type")
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
        assert_eq!(response.headers()["access-control-allow-origin"], "*");
        assert!(response.text().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn health_reports_mode() {
        let server = Server::new_async().await;
        let relay = spawn_with(&engine_config(&server)).await;

        let body: Value = reqwest::get(format!("{}/health", relay))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body, json!({"status": "ok", "deploymentMode": "agent_engine"}));
    }
}
