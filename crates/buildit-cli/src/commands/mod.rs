//! CLI command implementations.

pub mod jobs;
pub mod worker;

use anyhow::{Context, Result, bail};
use reqwest::{RequestBuilder, Response};
use serde::de::DeserializeOwned;
use std::path::Path;
use url::Url;

/// Thin client for the job API.
pub struct ApiClient {
    http: reqwest::Client,
    base: Url,
    token: Option<String>,
}

impl ApiClient {
    pub fn new(api_url: &str, token: Option<String>) -> Result<Self> {
        let base = Url::parse(api_url).with_context(|| format!("Invalid API URL: {}", api_url))?;
        Ok(Self {
            http: reqwest::Client::new(),
            base,
            token,
        })
    }

    fn url(&self, path: &str) -> Result<Url> {
        self.base
            .join(path)
            .with_context(|| format!("Invalid API path: {}", path))
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let response = self.http.get(self.url(path)?).send().await?;
        Ok(check(response).await?.json().await?)
    }

    pub async fn post<T: DeserializeOwned>(
        &self,
        path: &str,
        body: &serde_json::Value,
    ) -> Result<T> {
        let request = self.authorized(self.http.post(self.url(path)?).json(body));
        Ok(check(request.send().await?).await?.json().await?)
    }

    /// POST without a response body.
    pub async fn post_empty(&self, path: &str) -> Result<()> {
        let request = self.authorized(self.http.post(self.url(path)?));
        check(request.send().await?).await?;
        Ok(())
    }
}

/// Turn an error response into its `{"error": ...}` message.
async fn check(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let message = response
        .json::<serde_json::Value>()
        .await
        .ok()
        .and_then(|body| body["error"].as_str().map(str::to_string))
        .unwrap_or_else(|| status.to_string());
    bail!("{} ({})", message, status)
}

pub fn validate(path: &Path) -> Result<()> {
    match buildit_config::load_system_config(path) {
        Ok(config) => {
            let targets: Vec<_> = config.targets.targets().map(|t| t.to_string()).collect();
            println!("Configuration is valid");
            println!("Targets: {}", targets.join(", "));
            if let Some(worker) = &config.worker {
                println!("Worker target: {}", worker.target);
            }
            Ok(())
        }
        Err(e) => {
            println!("Configuration error: {}", e);
            std::process::exit(1);
        }
    }
}
