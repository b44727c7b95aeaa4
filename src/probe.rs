use crate::error::AgentError;
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    Http,
    TcpOnly,
    NotRunning,
}

impl ProbeOutcome {
    pub fn is_running(self) -> bool {
        !matches!(self, ProbeOutcome::NotRunning)
    }
}

pub trait LivenessProbe: Send + Sync {
    fn probe(&self, port: u16) -> ProbeOutcome;
}

pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// HTTP GET against the companion root, falling back to a bare TCP connect
/// since the port is bound before the companion serves HTTP.
pub struct HttpProbe {
    timeout: Duration,
}

impl HttpProbe {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    fn http_get(&self, port: u16) -> Result<u16, AgentError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(self.timeout)
            .build()?;
        let response = client.get(format!("http://localhost:{port}/")).send()?;
        Ok(response.status().as_u16())
    }

    fn tcp_connect(&self, port: u16) -> Result<(), AgentError> {
        let addrs: Vec<SocketAddr> = ("localhost", port).to_socket_addrs()?.collect();
        let mut last_err = None;
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, self.timeout) {
                Ok(_) => return Ok(()),
                Err(err) => last_err = Some(err),
            }
        }
        Err(last_err.map(AgentError::Io).unwrap_or_else(|| {
            AgentError::Process(format!("localhost:{port} did not resolve"))
        }))
    }
}

impl LivenessProbe for HttpProbe {
    fn probe(&self, port: u16) -> ProbeOutcome {
        match self.http_get(port) {
            Ok(status) => {
                tracing::debug!(port, status, "companion answered http probe");
                return ProbeOutcome::Http;
            }
            Err(err) => tracing::debug!(port, error = %err, "http probe failed"),
        }
        match self.tcp_connect(port) {
            Ok(()) => ProbeOutcome::TcpOnly,
            Err(err) => {
                tracing::debug!(port, error = %err, "tcp probe failed");
                ProbeOutcome::NotRunning
            }
        }
    }
}
