//! A small client for the parts of the Kubernetes API the worker needs.

pub mod exec;
pub mod pods;
pub mod snapshots;

use crate::error::{ResticError, Result};
use reqwest::{Method, StatusCode};
use serde::{Serialize, de::DeserializeOwned};
use std::path::Path;

const SERVICE_ACCOUNT_DIR: &str = "/var/run/secrets/kubernetes.io/serviceaccount";

#[derive(Debug, Clone)]
pub struct KubeClient {
    http: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl KubeClient {
    pub fn new(base_url: &str, token: Option<String>) -> Result<Self> {
        Ok(Self {
            http: reqwest::Client::builder().build()?,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        })
    }

    /// Configures the client from the service account mounted into every pod.
    pub fn in_cluster() -> Result<Self> {
        let host = std::env::var("KUBERNETES_SERVICE_HOST")
            .map_err(|_| ResticError::Kubernetes("KUBERNETES_SERVICE_HOST is not set".into()))?;
        let port = std::env::var("KUBERNETES_SERVICE_PORT").unwrap_or_else(|_| "443".into());
        let host = if host.contains(':') {
            format!("[{host}]")
        } else {
            host
        };

        let dir = Path::new(SERVICE_ACCOUNT_DIR);
        let token = std::fs::read_to_string(dir.join("token"))?;
        let ca = std::fs::read(dir.join("ca.crt"))?;
        let http = reqwest::Client::builder()
            .add_root_certificate(reqwest::Certificate::from_pem(&ca)?)
            .build()?;

        Ok(Self {
            http,
            base_url: format!("https://{host}:{port}"),
            token: Some(token.trim().to_string()),
        })
    }

    fn request(&self, method: Method, path: &str) -> reqwest::RequestBuilder {
        let req = self.http.request(method, format!("{}{path}", self.base_url));
        match &self.token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    async fn check(
        method: &Method,
        path: &str,
        resp: reqwest::Response,
        tolerated: Option<StatusCode>,
    ) -> Result<Option<reqwest::Response>> {
        let status = resp.status();
        if status.is_success() {
            return Ok(Some(resp));
        }
        if Some(status) == tolerated {
            tracing::debug!(%method, path, %status, "tolerated api response");
            return Ok(None);
        }
        let body = resp.text().await.unwrap_or_default();
        Err(ResticError::Kubernetes(format!(
            "{method} {path} returned {status}: {body}"
        )))
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let resp = self.request(Method::GET, path).send().await?;
        let resp = Self::check(&Method::GET, path, resp, None)
            .await?
            .ok_or_else(|| ResticError::Kubernetes(format!("GET {path} returned no body")))?;
        let bytes = resp.bytes().await?;
        serde_json::from_slice(&bytes).map_err(|e| ResticError::decode("api response", e))
    }

    /// Creates an object, an already existing one is left alone.
    pub async fn create<B: Serialize + ?Sized>(&self, path: &str, body: &B) -> Result<()> {
        let resp = self.request(Method::POST, path).json(body).send().await?;
        Self::check(&Method::POST, path, resp, Some(StatusCode::CONFLICT)).await?;
        Ok(())
    }

    /// Deletes an object, a missing one counts as deleted.
    pub async fn delete(&self, path: &str) -> Result<()> {
        let resp = self.request(Method::DELETE, path).send().await?;
        Self::check(&Method::DELETE, path, resp, Some(StatusCode::NOT_FOUND)).await?;
        Ok(())
    }
}
