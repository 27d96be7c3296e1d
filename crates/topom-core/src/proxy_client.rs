//! Client for a proxy's admin endpoint.

use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use topom_models::{Proxy, Sentinel, Slot};

/// Errors from a proxy admin RPC.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("http: {0}")]
    Http(#[from] reqwest::Error),

    /// The proxy answered with a non-success status.
    #[error("status {status}: {body}")]
    Status { status: u16, body: String },
}

/// Authenticated stub for one proxy's admin RPC surface.
///
/// Cheap to construct: the HTTP connection pool lives in the shared
/// `reqwest::Client`.
#[derive(Debug, Clone)]
pub struct ProxyClient {
    http: reqwest::Client,
    addr: String,
    xauth: String,
}

impl ProxyClient {
    pub fn new(http: reqwest::Client, addr: &str, xauth: &str) -> Self {
        ProxyClient {
            http,
            addr: addr.to_owned(),
            xauth: xauth.to_owned(),
        }
    }

    /// Builds the shared HTTP client with a per-request deadline.
    pub fn http_client(timeout: Duration) -> Result<reqwest::Client, ProxyError> {
        Ok(reqwest::Client::builder().timeout(timeout).build()?)
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, ProxyError> {
        let resp = self.http.get(self.url(path)).send().await?;
        Ok(check(resp).await?.json().await?)
    }

    async fn put<B: Serialize + ?Sized>(&self, path: &str, body: Option<&B>) -> Result<(), ProxyError> {
        let mut req = self.http.put(self.url(path));
        if let Some(body) = body {
            req = req.json(body);
        }
        check(req.send().await?).await?;
        Ok(())
    }

    /// Fetches the proxy's identity document. Needs no xauth.
    pub async fn model(&self) -> Result<Proxy, ProxyError> {
        self.get("/api/model").await
    }

    pub async fn xping(&self) -> Result<(), ProxyError> {
        let resp = self
            .http
            .get(self.url(&format!("/api/xping/{}", self.xauth)))
            .send()
            .await?;
        check(resp).await?;
        Ok(())
    }

    pub async fn stats(&self) -> Result<serde_json::Value, ProxyError> {
        self.get(&format!("/api/stats/{}", self.xauth)).await
    }

    pub async fn start(&self) -> Result<(), ProxyError> {
        self.put::<()>(&format!("/api/proxy/start/{}", self.xauth), None)
            .await
    }

    pub async fn shutdown(&self) -> Result<(), ProxyError> {
        self.put::<()>(&format!("/api/proxy/shutdown/{}", self.xauth), None)
            .await
    }

    /// Pushes routing views. The proxy merges them by slot id.
    pub async fn fill_slots(&self, slots: &[Slot]) -> Result<(), ProxyError> {
        self.put(&format!("/api/proxy/slots/{}", self.xauth), Some(slots))
            .await
    }

    pub async fn set_sentinels(&self, sentinel: &Sentinel) -> Result<(), ProxyError> {
        self.put(&format!("/api/proxy/sentinels/{}", self.xauth), Some(sentinel))
            .await
    }
}

async fn check(resp: reqwest::Response) -> Result<reqwest::Response, ProxyError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(ProxyError::Status {
        status: status.as_u16(),
        body,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn urls() {
        let http = reqwest::Client::new();
        let c = ProxyClient::new(http, "127.0.0.1:11080", "abc");
        assert_eq!(c.url("/api/model"), "http://127.0.0.1:11080/api/model");
        assert_eq!(c.addr(), "127.0.0.1:11080");
    }

    #[tokio::test]
    async fn unreachable_proxy_is_an_http_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let http = ProxyClient::http_client(Duration::from_millis(500)).unwrap();
        let c = ProxyClient::new(http, &addr, "abc");
        assert!(matches!(c.xping().await, Err(ProxyError::Http(_))));
    }
}
