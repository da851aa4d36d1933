use async_trait::async_trait;
use drover_core::WorkItem;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use std::time::Duration;
use tracing::{debug, trace};

use super::WorkQueue;
use crate::config::QueueConfig;
use crate::error::{Result, TransportError};

/// Client for a remote work queue server.
///
/// Every request carries the bearer token when one is configured. `pull`
/// and `cancelled` are long-polls: the server answers `204 No Content`
/// when its wait expires and the client simply asks again.
pub struct HttpQueue {
    client: Client,
    base_url: String,
    token: Option<String>,
    request_timeout: Duration,
}

impl HttpQueue {
    /// Creates a client for the queue server at `base_url`.
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> Result<Self> {
        Self::with_timeouts(base_url, token, Duration::from_secs(10), Duration::from_secs(30))
    }

    /// Creates a client with explicit connect and request timeouts. The
    /// request timeout applies to every call except `pull`.
    pub fn with_timeouts(
        base_url: impl Into<String>,
        token: Option<String>,
        connect_timeout: Duration,
        request_timeout: Duration,
    ) -> Result<Self> {
        let client = Client::builder().connect_timeout(connect_timeout).build()?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
            request_timeout,
        })
    }

    /// Creates a client from the `[queue]` configuration section.
    pub fn from_config(config: &QueueConfig) -> Result<Self> {
        Self::with_timeouts(
            config.endpoint.clone(),
            config.token.clone(),
            Duration::from_secs(config.connect_timeout_secs),
            Duration::from_secs(config.request_timeout_secs),
        )
    }

    /// Returns the server base URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}{path}", self.base_url);
        let mut req = self.client.request(method, &url);
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }
        req
    }

    async fn send(&self, req: RequestBuilder) -> Result<Response> {
        let response = req.send().await?;

        if response.status().is_success() {
            Ok(response)
        } else {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            Err(TransportError::Status { status, body })
        }
    }
}

#[async_trait]
impl WorkQueue for HttpQueue {
    async fn publish(&self, item: WorkItem) -> Result<()> {
        let req = self
            .request(Method::POST, "/queue")
            .timeout(self.request_timeout)
            .json(&item);
        self.send(req).await?;
        debug!(item = %item.id, "work item published");
        Ok(())
    }

    async fn remove(&self, item: &WorkItem) -> Result<()> {
        let req = self
            .request(Method::DELETE, "/queue")
            .timeout(self.request_timeout)
            .json(item);
        self.send(req).await?;
        Ok(())
    }

    async fn pull(&self) -> Result<WorkItem> {
        loop {
            let response = self.send(self.request(Method::POST, "/queue/pull")).await?;

            if response.status() == StatusCode::NO_CONTENT {
                trace!("queue pull expired, polling again");
                continue;
            }

            let bytes = response.bytes().await?;
            let item: WorkItem = serde_json::from_slice(&bytes)?;
            debug!(item = %item.id, "work item claimed");
            return Ok(item);
        }
    }

    async fn ack(&self, item: &WorkItem) -> Result<()> {
        let req = self
            .request(Method::POST, "/queue/ack")
            .timeout(self.request_timeout)
            .json(item);
        self.send(req).await?;
        Ok(())
    }

    async fn items(&self) -> Result<Vec<WorkItem>> {
        let req = self
            .request(Method::GET, "/queue/items")
            .timeout(self.request_timeout);
        let bytes = self.send(req).await?.bytes().await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    async fn extend(&self, item: &WorkItem) -> Result<()> {
        let req = self
            .request(Method::POST, "/queue/extend")
            .timeout(self.request_timeout)
            .json(item);
        self.send(req).await?;
        Ok(())
    }

    async fn cancelled(&self, item: &WorkItem) -> Result<()> {
        loop {
            let req = self.request(Method::POST, "/queue/wait").json(item);
            let response = self.send(req).await?;

            if response.status() == StatusCode::NO_CONTENT {
                trace!(item = %item.id, "cancel wait expired, polling again");
                continue;
            }
            debug!(item = %item.id, "work item cancelled by the server");
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use drover_core::PipelineConfig;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::task::JoinHandle;

    fn response(status: &str, body: &str) -> String {
        format!(
            "HTTP/1.1 {status}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
            body.len()
        )
    }

    async fn read_request(socket: &mut TcpStream) -> String {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 1024];
        loop {
            let n = socket.read(&mut chunk).await.unwrap();
            if n == 0 {
                break;
            }
            buf.extend_from_slice(&chunk[..n]);
            if let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                let head = String::from_utf8_lossy(&buf[..end]).to_lowercase();
                let len = head
                    .lines()
                    .find_map(|l| l.strip_prefix("content-length:"))
                    .and_then(|v| v.trim().parse::<usize>().ok())
                    .unwrap_or(0);
                if buf.len() >= end + 4 + len {
                    break;
                }
            }
        }
        String::from_utf8_lossy(&buf).into_owned()
    }

    /// Answers one connection per canned response and returns the raw
    /// requests it saw.
    async fn serve(responses: Vec<String>) -> (String, JoinHandle<Vec<String>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let mut requests = Vec::new();
            for canned in responses {
                let (mut socket, _) = listener.accept().await.unwrap();
                requests.push(read_request(&mut socket).await);
                socket.write_all(canned.as_bytes()).await.unwrap();
                socket.shutdown().await.unwrap();
            }
            requests
        });
        (format!("http://{addr}"), handle)
    }

    #[tokio::test]
    async fn pull_polls_again_after_no_content() {
        let item = WorkItem::new("42", PipelineConfig::new("p"));
        let body = serde_json::to_string(&item).unwrap();
        let (url, server) = serve(vec![
            response("204 No Content", ""),
            response("200 OK", &body),
        ])
        .await;

        let queue = HttpQueue::new(url, None).unwrap();
        let pulled = queue.pull().await.unwrap();
        assert_eq!(pulled, item);

        let requests = server.await.unwrap();
        assert_eq!(requests.len(), 2);
        assert!(requests.iter().all(|r| r.starts_with("POST /queue/pull ")));
    }

    #[tokio::test]
    async fn error_status_keeps_the_body() {
        let (url, server) = serve(vec![response("500 Internal Server Error", "queue exploded")]).await;

        let queue = HttpQueue::new(url, None).unwrap();
        match queue.items().await {
            Err(TransportError::Status { status, body }) => {
                assert_eq!(status, 500);
                assert_eq!(body, "queue exploded");
            }
            other => panic!("unexpected result: {other:?}"),
        }
        server.await.unwrap();
    }

    #[tokio::test]
    async fn malformed_item_is_a_decode_error() {
        let (url, server) = serve(vec![response("200 OK", "{\"id\":")]).await;

        let queue = HttpQueue::new(url, None).unwrap();
        let err = queue.pull().await.unwrap_err();
        assert!(!matches!(err, TransportError::Status { .. }));
        assert!(!err.is_transient());
        server.await.unwrap();
    }

    #[tokio::test]
    async fn ack_sends_the_claimed_item_with_auth() {
        let (url, server) = serve(vec![response("200 OK", "")]).await;

        let queue = HttpQueue::new(url, Some("t0k".into())).unwrap();
        let mut item = WorkItem::new("42", PipelineConfig::new("p"));
        item.claim = 3;
        queue.ack(&item).await.unwrap();

        let requests = server.await.unwrap();
        let request = &requests[0];
        assert!(request.starts_with("POST /queue/ack "));
        assert!(request.to_lowercase().contains("authorization: bearer t0k"));
        assert!(request.contains("\"claim\":3"));
    }

    #[tokio::test]
    async fn cancelled_resolves_when_the_server_signals() {
        let (url, server) = serve(vec![
            response("204 No Content", ""),
            response("200 OK", ""),
        ])
        .await;

        let queue = HttpQueue::new(url, None).unwrap();
        queue.cancelled(&WorkItem::new("42", PipelineConfig::new("p"))).await.unwrap();

        let requests = server.await.unwrap();
        assert!(requests.iter().all(|r| r.starts_with("POST /queue/wait ")));
    }

    #[test]
    fn trailing_slash_is_trimmed() {
        let queue = HttpQueue::new("http://queue.local:8000/", None).unwrap();
        assert_eq!(queue.base_url(), "http://queue.local:8000");
    }

    #[test]
    fn requests_carry_bearer_token() {
        let queue = HttpQueue::new("http://queue.local", Some("t0k".into())).unwrap();
        let req = queue.request(Method::POST, "/queue/ack").build().unwrap();

        assert_eq!(req.url().as_str(), "http://queue.local/queue/ack");
        assert_eq!(
            req.headers().get(reqwest::header::AUTHORIZATION).unwrap(),
            "Bearer t0k"
        );
    }

    #[test]
    fn anonymous_requests_have_no_auth_header() {
        let queue = HttpQueue::new("http://queue.local", None).unwrap();
        let req = queue.request(Method::GET, "/queue/items").build().unwrap();
        assert!(req.headers().get(reqwest::header::AUTHORIZATION).is_none());
    }

    #[test]
    fn built_from_config() {
        let config = QueueConfig {
            endpoint: "https://ci.example.com/".into(),
            token: Some("abc".into()),
            ..QueueConfig::default()
        };
        let queue = HttpQueue::from_config(&config).unwrap();
        assert_eq!(queue.base_url(), "https://ci.example.com");
    }

    #[tokio::test]
    async fn unreachable_server_is_transient() {
        let queue = HttpQueue::with_timeouts(
            "http://127.0.0.1:1",
            None,
            Duration::from_millis(200),
            Duration::from_millis(200),
        )
        .unwrap();

        let err = queue.items().await.unwrap_err();
        assert!(err.is_transient());
    }
}
