//! HTTP probing for readiness and periodic health checks.

use std::future::Future;
use std::time::Duration;

use reqwest::redirect::Policy;
use tracing::debug;

/// Issues short-timeout HTTP requests against local dev servers.
///
/// Any HTTP response, whatever its status, counts as responding. Only connection
/// failures and timeouts count as not responding.
#[derive(Debug, Clone)]
pub struct HttpProber {
    client: reqwest::Client,
}

impl HttpProber {
    pub fn new(timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .user_agent(format!("devrack/{}", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .connect_timeout(timeout)
            .redirect(Policy::none())
            .no_proxy()
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { client }
    }

    pub async fn is_responding(&self, url: &str) -> bool {
        match self.client.get(url).send().await {
            Ok(response) => {
                debug!(url, status = %response.status(), "probe answered");
                true
            }
            Err(err) => {
                debug!(url, error = %err, "probe failed");
                false
            }
        }
    }
}

/// How a readiness wait ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    TimedOut,
    /// `should_abort` asked to stop waiting.
    Aborted,
}

/// Polls `url` every `poll` until it responds, `timeout` elapses, or `should_abort` returns true.
pub async fn wait_until_responding<F, Fut>(
    prober: &HttpProber,
    url: &str,
    timeout: Duration,
    poll: Duration,
    mut should_abort: F,
) -> Readiness
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if should_abort().await {
            return Readiness::Aborted;
        }
        if prober.is_responding(url).await {
            return Readiness::Ready;
        }
        if tokio::time::Instant::now() + poll >= deadline {
            return Readiness::TimedOut;
        }
        tokio::time::sleep(poll).await;
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Answers every connection on `listener` with an empty response of `status`.
    pub(crate) fn serve(listener: TcpListener, status: &'static str) {
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    let _ = socket.read(&mut buf).await;
                    let response = format!(
                        "HTTP/1.1 {}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
                        status
                    );
                    let _ = socket.write_all(response.as_bytes()).await;
                    let _ = socket.shutdown().await;
                });
            }
        });
    }

    async fn free_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    #[tokio::test]
    async fn non_success_status_still_counts() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        serve(listener, "503 Service Unavailable");
        let prober = HttpProber::new(Duration::from_secs(1));
        assert!(prober.is_responding(&format!("http://127.0.0.1:{}/", port)).await);
    }

    #[tokio::test]
    async fn closed_port_is_not_responding() {
        let port = free_port().await;
        let prober = HttpProber::new(Duration::from_millis(300));
        assert!(!prober.is_responding(&format!("http://127.0.0.1:{}/", port)).await);
    }

    #[tokio::test]
    async fn waits_for_late_server() {
        let port = free_port().await;
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(400)).await;
            let listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
            serve(listener, "200 OK");
        });
        let prober = HttpProber::new(Duration::from_millis(300));
        let outcome = wait_until_responding(
            &prober,
            &format!("http://127.0.0.1:{}/", port),
            Duration::from_secs(5),
            Duration::from_millis(100),
            || async { false },
        )
        .await;
        assert_eq!(outcome, Readiness::Ready);
    }

    #[tokio::test]
    async fn times_out_and_aborts() {
        let port = free_port().await;
        let url = format!("http://127.0.0.1:{}/", port);
        let prober = HttpProber::new(Duration::from_millis(100));
        let outcome = wait_until_responding(
            &prober,
            &url,
            Duration::from_millis(300),
            Duration::from_millis(50),
            || async { false },
        )
        .await;
        assert_eq!(outcome, Readiness::TimedOut);

        let outcome = wait_until_responding(
            &prober,
            &url,
            Duration::from_secs(5),
            Duration::from_millis(50),
            || async { true },
        )
        .await;
        assert_eq!(outcome, Readiness::Aborted);
    }
}
