//! Talking to workers over their private HTTP endpoints.

use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use reqwest::blocking::Client;
use serde_json::json;

use crate::check::{CheckResult, Score};
use crate::error::{CoqpoolError, Result};
use crate::rpc::{CHECK_PROOF, JsonRpcRequest, JsonRpcResponse};

/// How long a single readiness probe may take to connect.
const PROBE_CONNECT_TIMEOUT: Duration = Duration::from_millis(250);

/// Request/response channel to a worker.
pub trait WorkerTransport: Send + Sync {
    /// Whether the worker's endpoint accepts connections yet.
    fn probe(&self, address: SocketAddr) -> bool;

    /// Forward one proof to the worker, waiting at most `timeout` for the
    /// answer. Timeouts surface as [`CoqpoolError::Timeout`].
    fn check_proof(&self, address: SocketAddr, proof: &str, timeout: Duration) -> Result<CheckResult>;
}

/// JSON-RPC over HTTP, as spoken by `coqpool worker`.
///
/// Holds a blocking `reqwest` client, so it must be created and dropped
/// outside of any async runtime.
pub struct HttpTransport {
    client: Client,
    next_id: AtomicI64,
}

impl HttpTransport {
    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .pool_max_idle_per_host(1)
            .build()
            .map_err(CoqpoolError::Network)?;
        Ok(Self {
            client,
            next_id: AtomicI64::new(1),
        })
    }
}

impl WorkerTransport for HttpTransport {
    fn probe(&self, address: SocketAddr) -> bool {
        TcpStream::connect_timeout(&address, PROBE_CONNECT_TIMEOUT).is_ok()
    }

    fn check_proof(&self, address: SocketAddr, proof: &str, timeout: Duration) -> Result<CheckResult> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = JsonRpcRequest::new(id, CHECK_PROOF).with_params(json!({ "proof": proof }));

        let response = self
            .client
            .post(format!("http://{}/", address))
            .timeout(timeout)
            .json(&request)
            .send()
            .and_then(|r| r.error_for_status())
            .and_then(|r| r.json::<JsonRpcResponse>())
            .map_err(|e| {
                if e.is_timeout() {
                    CoqpoolError::Timeout(format!(
                        "worker at {} did not answer within {}s",
                        address,
                        timeout.as_secs()
                    ))
                } else {
                    CoqpoolError::Network(e)
                }
            })?;

        let result: CheckResult = response.into_result()?;
        // Workers only decide; errors are the pool's to report.
        if result.score == Score::Error {
            return Err(CoqpoolError::Worker(format!(
                "worker at {} returned an error score: {}",
                address,
                result.messages.join("; ")
            )));
        }
        Ok(result)
    }
}
