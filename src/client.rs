//! HTTP client for a running `coqpool serve`.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use reqwest::blocking::Client;
use serde::Deserialize;

use crate::check::{CheckResult, ProblemId};
use crate::error::{CoqpoolError, Result};
use crate::rpc::{CHECK_PROOF, JsonRpcRequest, JsonRpcResponse};
use crate::server::types::CheckProofParams;

/// Extra time granted to the HTTP call on top of the check's own budget, so
/// the server's error result arrives before the client gives up.
const RESPONSE_SLACK: Duration = Duration::from_secs(30);

/// Client for the pool's JSON-RPC API.
pub struct PoolClient {
    base_url: String,
    client: Client,
    next_id: AtomicI64,
}

impl PoolClient {
    /// Create a new client for the server at `base_url`.
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(CoqpoolError::Network)?;

        Ok(Self {
            base_url,
            client,
            next_id: AtomicI64::new(1),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Submit one proof for `problem` and wait for the verdict.
    pub fn check_proof(&self, problem: &ProblemId, proof: &str, timeout: Duration) -> Result<CheckResult> {
        let params = CheckProofParams {
            split: problem.split.clone(),
            idx: problem.idx,
            proof: proof.to_string(),
            timeout: timeout.as_secs(),
        };
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = JsonRpcRequest::new(id, CHECK_PROOF).with_params(serde_json::to_value(params)?);

        let response = self
            .client
            .post(format!("{}/", self.base_url))
            .timeout(timeout.saturating_add(RESPONSE_SLACK))
            .json(&request)
            .send()
            .map_err(CoqpoolError::Network)?;

        let status = response.status();
        if !status.is_success() {
            return Err(CoqpoolError::Rpc {
                code: i64::from(status.as_u16()),
                message: format!("HTTP error: {}", status),
            });
        }

        let response: JsonRpcResponse = response.json().map_err(CoqpoolError::Network)?;
        response.into_result()
    }

    /// Fetch `/health`.
    pub fn health(&self) -> Result<HealthInfo> {
        let url = format!("{}/health", self.base_url);
        let response = self
            .client
            .get(url)
            .timeout(Duration::from_secs(10))
            .send()
            .and_then(|r| r.error_for_status())
            .map_err(CoqpoolError::Network)?;
        response.json().map_err(CoqpoolError::Network)
    }
}

/// Health response from the server.
#[derive(Debug, Deserialize)]
pub struct HealthInfo {
    pub status: String,
    pub version: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::check::Score;
    use std::io::{BufRead, BufReader, Read, Write};
    use std::net::TcpListener;
    use std::sync::mpsc;

    /// Answer one HTTP request with `body`, handing the request body back.
    fn serve_once(body: &'static str) -> (String, mpsc::Receiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let url = format!("http://{}/", listener.local_addr().unwrap());
        let (tx, rx) = mpsc::channel();
        std::thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(stream);
            let mut content_length = 0;
            loop {
                let mut line = String::new();
                reader.read_line(&mut line).unwrap();
                if line == "\r\n" || line.is_empty() {
                    break;
                }
                let lower = line.to_ascii_lowercase();
                if let Some(value) = lower.strip_prefix("content-length:") {
                    content_length = value.trim().parse().unwrap();
                }
            }
            let mut request_body = vec![0; content_length];
            reader.read_exact(&mut request_body).unwrap();
            tx.send(String::from_utf8(request_body).unwrap()).unwrap();

            let mut stream = reader.into_inner();
            let _ = write!(
                stream,
                "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                body.len(),
                body
            );
        });
        (url, rx)
    }

    #[test]
    fn test_trailing_slash_trimmed() {
        let client = PoolClient::new("http://localhost:8080/").unwrap();
        assert_eq!(client.base_url(), "http://localhost:8080");
    }

    #[test]
    fn test_check_proof_request_and_result() {
        let (url, requests) =
            serve_once(r#"{"jsonrpc":"2.0","id":1,"result":{"score":-1,"messages":["Timed out"]}}"#);
        let client = PoolClient::new(url).unwrap();
        let result = client
            .check_proof(&ProblemId::new("val", 12), "Proof. auto. Qed.", Duration::from_secs(7))
            .unwrap();
        assert_eq!(result.score, Score::Error);
        assert_eq!(result.messages, vec!["Timed out"]);

        let sent: serde_json::Value = serde_json::from_str(&requests.recv().unwrap()).unwrap();
        assert_eq!(sent["method"], "check_proof");
        assert_eq!(sent["params"]["split"], "val");
        assert_eq!(sent["params"]["idx"], 12);
        assert_eq!(sent["params"]["timeout"], 7);
    }

    #[test]
    fn test_check_proof_rpc_error() {
        let (url, _requests) = serve_once(
            r#"{"jsonrpc":"2.0","id":1,"error":{"code":-32601,"message":"Method not found: check_proof"}}"#,
        );
        let client = PoolClient::new(url).unwrap();
        let err = client
            .check_proof(&ProblemId::new("val", 0), "auto.", Duration::from_secs(1))
            .unwrap_err();
        assert!(matches!(err, CoqpoolError::Rpc { code: -32601, .. }));
    }

    #[test]
    fn test_unreachable_server() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        drop(listener);

        let client = PoolClient::new(url).unwrap();
        assert!(matches!(client.health(), Err(CoqpoolError::Network(_))));
    }
}
