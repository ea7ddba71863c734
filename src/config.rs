use clap::Args;
use std::sync::Arc;
use std::time::Duration;

use crate::auth::{Credentials, METADATA_TOKEN_URL};
use crate::protocol::DeploymentMode;
use crate::upstream::Upstream;
use crate::upstream::adk::AdkRuntime;
use crate::upstream::agent_engine::AgentEngine;

#[derive(Debug, Clone, Args)]
pub struct Config {
    /// Address the relay listens on
    #[arg(long, env = "RELAY_LISTEN", default_value = "127.0.0.1:8080")]
    pub listen: String,

    /// Base URL of a self-hosted ADK runtime
    #[arg(long, env = "ADK_BACKEND_URL", default_value = "http://127.0.0.1:8000")]
    pub backend_url: String,

    /// ADK application name used in direct mode
    #[arg(long, env = "ADK_APP_NAME", default_value = "app")]
    pub app_name: String,

    #[arg(long, env = "GOOGLE_CLOUD_PROJECT")]
    pub project: Option<String>,

    #[arg(long, env = "GOOGLE_CLOUD_LOCATION", default_value = "us-central1")]
    pub location: String,

    /// Reasoning engine resource id of a deployed Agent Engine
    #[arg(long, env = "AGENT_ENGINE_ID")]
    pub agent_engine_id: Option<String>,

    /// Override for the Vertex AI API host
    #[arg(long, env = "AGENT_ENGINE_API_BASE")]
    pub agent_engine_api_base: Option<String>,

    /// Use the ADK runtime even when an Agent Engine is configured
    #[arg(long, env = "FORCE_LOCAL_BACKEND")]
    pub force_local: bool,

    #[arg(long, env = "GOOGLE_ACCESS_TOKEN", hide_env_values = true)]
    pub access_token: Option<String>,

    /// Mint access tokens from the GCE metadata server
    #[arg(long, env = "USE_METADATA_SERVER_AUTH")]
    pub metadata_auth: bool,

    /// Overall timeout for upstream requests, streaming included
    #[arg(long, env = "RELAY_REQUEST_TIMEOUT_SECS")]
    pub request_timeout_secs: Option<u64>,
}

impl Config {
    pub fn should_use_agent_engine(&self) -> bool {
        !self.force_local && self.project.is_some() && self.agent_engine_id.is_some()
    }

    pub fn mode(&self) -> DeploymentMode {
        if self.should_use_agent_engine() {
            DeploymentMode::AgentEngine
        } else {
            DeploymentMode::Local
        }
    }

    fn reasoning_engine_url(&self) -> String {
        let base = self
            .agent_engine_api_base
            .clone()
            .unwrap_or_else(|| format!("https://{}-aiplatform.googleapis.com", self.location));
        format!(
            "{}/v1/projects/{}/locations/{}/reasoningEngines/{}",
            base.trim_end_matches('/'),
            self.project.as_deref().unwrap_or_default(),
            self.location,
            self.agent_engine_id.as_deref().unwrap_or_default()
        )
    }

    pub fn agent_engine_query_endpoint(&self) -> String {
        format!("{}:query", self.reasoning_engine_url())
    }

    pub fn agent_engine_stream_endpoint(&self) -> String {
        format!("{}:streamQuery?alt=sse", self.reasoning_engine_url())
    }

    pub fn backend_base_url(&self) -> &str {
        self.backend_url.trim_end_matches('/')
    }

    pub fn credentials(&self) -> Credentials {
        if let Some(token) = &self.access_token {
            Credentials::Bearer(token.clone())
        } else if self.metadata_auth {
            Credentials::MetadataServer {
                token_url: METADATA_TOKEN_URL.to_string(),
            }
        } else {
            Credentials::Anonymous
        }
    }

    pub fn http_client(&self) -> reqwest::Result<reqwest::Client> {
        let mut builder = reqwest::Client::builder();
        if let Some(secs) = self.request_timeout_secs {
            builder = builder.timeout(Duration::from_secs(secs));
        }
        builder.build()
    }

    /// Picks the upstream protocol once, from the deployment mode.
    pub fn upstream(&self, http: reqwest::Client) -> Arc<dyn Upstream> {
        match self.mode() {
            DeploymentMode::AgentEngine => Arc::new(AgentEngine::new(
                http,
                self.credentials(),
                self.agent_engine_query_endpoint(),
                self.agent_engine_stream_endpoint(),
            )),
            DeploymentMode::Local => Arc::new(AdkRuntime::new(
                http,
                self.credentials(),
                self.backend_base_url().to_string(),
                self.app_name.clone(),
            )),
        }
    }
}

#[cfg(test)]
pub(crate) fn test_config(backend_url: &str) -> Config {
    Config {
        listen: "127.0.0.1:0".to_string(),
        backend_url: backend_url.to_string(),
        app_name: "app".to_string(),
        project: None,
        location: "us-central1".to_string(),
        agent_engine_id: None,
        agent_engine_api_base: None,
        force_local: false,
        access_token: None,
        metadata_auth: false,
        request_timeout_secs: None,
    }
}
