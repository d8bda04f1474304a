use reqwest::Method;
use serde_json::Value;
use std::net::IpAddr;
use std::time::Duration;
use tracing::debug;

use crate::core::error::{CoreError, CoreResult};

/// Response of an outbound webhook call. `body` holds at most the client's byte cap.
#[derive(Debug, Clone)]
pub struct WebhookResponse {
    pub status: u16,
    pub body: Vec<u8>,
    pub truncated: bool,
}

/// HTTP client for tenant webhooks with a per-call timeout and a response size cap.
#[derive(Clone)]
pub struct WebhookClient {
    client: reqwest::Client,
    timeout: Duration,
    max_response_bytes: usize,
}

impl WebhookClient {
    pub fn new(timeout: Duration, max_response_bytes: usize) -> CoreResult<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("tenantd/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()
            .map_err(|e| CoreError::Internal(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            timeout,
            max_response_bytes,
        })
    }

    pub async fn send(&self, method: &str, url: &str, payload: &Value) -> CoreResult<WebhookResponse> {
        let method = Method::from_bytes(method.trim().to_ascii_uppercase().as_bytes())
            .map_err(|_| CoreError::Validation(format!("Invalid webhook method: {}", method)))?;

        debug!("Calling webhook {} {}", method, url);
        let mut response = self
            .client
            .request(method, url)
            .timeout(self.timeout)
            .json(payload)
            .send()
            .await
            .map_err(|e| CoreError::Transport(format!("Webhook call to {} failed: {}", url, e)))?;

        let status = response.status().as_u16();
        let mut body = Vec::new();
        let mut truncated = false;
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| CoreError::Transport(format!("Reading response from {} failed: {}", url, e)))?
        {
            let room = self.max_response_bytes.saturating_sub(body.len());
            if chunk.len() > room {
                body.extend_from_slice(&chunk[..room]);
                truncated = true;
                break;
            }
            body.extend_from_slice(&chunk);
        }

        Ok(WebhookResponse {
            status,
            body,
            truncated,
        })
    }
}

/// True when `url` points back at this host: loopback or unspecified addresses and `localhost`.
pub fn is_loopback_url(url: &str) -> bool {
    let lowered = url.to_ascii_lowercase();
    if lowered.contains("://127.0.0.1") || lowered.contains("://localhost") || lowered.contains("://[::1]") {
        return true;
    }
    let Ok(parsed) = url::Url::parse(url) else {
        return false;
    };
    match parsed.host() {
        Some(url::Host::Domain(host)) => {
            let host = host.trim_end_matches('.');
            host == "localhost" || host.ends_with(".localhost")
        }
        Some(url::Host::Ipv4(ip)) => {
            let ip = IpAddr::V4(ip);
            ip.is_loopback() || ip.is_unspecified()
        }
        Some(url::Host::Ipv6(ip)) => {
            let ip = IpAddr::V6(ip);
            ip.is_loopback() || ip.is_unspecified()
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{Json, Router, routing::post};
    use serde_json::json;

    #[test]
    fn loopback_detection() {
        for url in [
            "http://127.0.0.1:8080/hook",
            "https://localhost/hook",
            "http://[::1]/x",
            "http://127.1.2.3/x",
            "http://0.0.0.0:9/x",
            "http://api.localhost/x",
        ] {
            assert!(is_loopback_url(url), "{}", url);
        }
        for url in ["https://hooks.example.com/x", "http://10.0.0.2/x", "not a url"] {
            assert!(!is_loopback_url(url), "{}", url);
        }
    }

    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn posts_json_and_reads_status() {
        let app = Router::new().route("/echo", post(|Json(v): Json<Value>| async move { Json(v) }));
        let base = serve(app).await;
        let client = WebhookClient::new(Duration::from_secs(5), 1024).unwrap();
        let payload = json!({"target": "orders"});
        let resp = client.send("post", &format!("{}/echo", base), &payload).await.unwrap();
        assert_eq!(resp.status, 200);
        assert_eq!(serde_json::from_slice::<Value>(&resp.body).unwrap(), payload);
    }

    #[tokio::test]
    async fn caps_response_size() {
        let app = Router::new().route("/big", post(|| async { "x".repeat(10_000) }));
        let base = serve(app).await;
        let client = WebhookClient::new(Duration::from_secs(5), 100).unwrap();
        let resp = client.send("POST", &format!("{}/big", base), &json!({})).await.unwrap();
        assert_eq!(resp.body.len(), 100);
        assert!(resp.truncated);
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_transport_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let client = WebhookClient::new(Duration::from_secs(2), 100).unwrap();
        let err = client
            .send("POST", &format!("http://{}/gone", addr), &json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Transport(_)));
    }
}
