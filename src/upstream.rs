//! The two backend protocols behind one narrow interface.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use serde_json::Value;
use std::io;

use crate::error::RelayResult;
use crate::protocol::{ChatTurn, DeploymentMode, SessionContext};

pub mod adk;
pub mod agent_engine;

pub type ByteStream = BoxStream<'static, io::Result<Bytes>>;

/// Client-ready SSE bytes plus the session they belong to.
pub struct UpstreamStream {
    pub session: SessionContext,
    pub body: ByteStream,
}

#[async_trait]
pub trait Upstream: Send + Sync {
    fn mode(&self) -> DeploymentMode;

    /// Runs one chat turn. Every error is returned before any body byte.
    async fn run(&self, turn: &ChatTurn) -> RelayResult<UpstreamStream>;

    async fn list_sessions(&self, user_id: &str) -> RelayResult<Value>;
}

pub fn generated_user_id() -> String {
    format!("user-{}", chrono::Utc::now().timestamp_millis())
}

pub fn generated_session_id() -> String {
    format!("session-{}", chrono::Utc::now().timestamp_millis())
}
