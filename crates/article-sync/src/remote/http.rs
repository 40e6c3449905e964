//! HTTP 传输 - JSON POST 到 `{base_url}/rpc`

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{RemoteRequest, RemoteResponse, RemoteTransport};
use crate::config::HttpClientConfig;
use crate::error::{Result, SyncError};

#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
    endpoint: String,
}

impl HttpTransport {
    pub fn new(config: &HttpClientConfig, base_url: &str) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| SyncError::Config(format!("创建 HTTP 客户端失败: {}", e)))?;

        let endpoint = format!("{}/rpc", base_url.trim_end_matches('/'));
        info!("✅ HTTP 传输已创建 (endpoint: {})", endpoint);
        Ok(Self { client, endpoint })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl RemoteTransport for HttpTransport {
    async fn call(&self, request: RemoteRequest) -> Result<RemoteResponse> {
        let action = request.action();
        let response = self.client.post(&self.endpoint).json(&request).send().await?;
        let status = response.status();
        debug!("[http] {} -> {}", action, status);

        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            let body = response.text().await.unwrap_or_default();
            warn!("[http] {} 服务端错误 {}: {}", action, status, body);
            return Err(SyncError::Transport(format!("{} returned {}", action, status)));
        }

        // 4xx 也可能携带结构化的 error 响应
        let body = response.bytes().await?;
        match serde_json::from_slice::<RemoteResponse>(&body) {
            Ok(parsed) => Ok(parsed),
            Err(e) if status.is_success() => Err(SyncError::validation(
                "response",
                format!("malformed {} response: {}", action, e),
            )),
            Err(_) => Err(SyncError::validation(
                "response",
                format!("{} rejected with {}", action, status),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_normalization() {
        let transport = HttpTransport::new(&HttpClientConfig::default(), "https://api.example.com/").unwrap();
        assert_eq!(transport.endpoint(), "https://api.example.com/rpc");
    }

    #[tokio::test]
    async fn test_connection_refused_is_transport_error() {
        let config = HttpClientConfig {
            connect_timeout_secs: 1,
            request_timeout_secs: 1,
        };
        // 保留端口，无人监听
        let transport = HttpTransport::new(&config, "http://127.0.0.1:9").unwrap();
        let err = transport
            .call(RemoteRequest::Fetch { article_id: 1 })
            .await
            .unwrap_err();
        assert!(err.is_transport(), "unexpected error: {err:?}");
    }
}
