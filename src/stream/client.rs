use super::{ChatRequest, StreamError};
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use reqwest::Client;
use tracing::debug;

/// Response body of one assistant request, as raw chunks.
pub type ByteStream = BoxStream<'static, Result<Bytes, StreamError>>;

#[derive(Debug, Clone)]
pub struct AssistantClient {
    http: Client,
    endpoint: String,
    auth_token: Option<String>,
}

impl AssistantClient {
    pub fn new(api_base_url: &str, auth_token: Option<String>) -> Self {
        Self {
            http: Client::new(),
            endpoint: format!("{}/ai/chat", api_base_url.trim_end_matches('/')),
            auth_token,
        }
    }

    /// Issues the chat request and hands back the body once headers arrive.
    /// A non-success status is reported as [`StreamError::Api`].
    pub async fn open(&self, request: &ChatRequest) -> Result<ByteStream, StreamError> {
        let mut req = self
            .http
            .post(&self.endpoint)
            .header("Content-Type", "application/json")
            .header("Accept", "text/event-stream")
            .json(request);

        if let Some(token) = &self.auth_token {
            req = req.header("Authorization", format!("Bearer {}", token));
        }

        let resp = req.send().await?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let text = resp.text().await.unwrap_or_default();
            return Err(StreamError::Api {
                status,
                message: text,
            });
        }

        debug!(endpoint = %self.endpoint, "assistant stream opened");
        Ok(resp.bytes_stream().map_err(StreamError::from).boxed())
    }
}
