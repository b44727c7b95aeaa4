use crate::error::AgentError;
use crate::lifecycle::LifecycleManager;
use serde_json::json;
use std::collections::BTreeMap;
use std::env;
use std::io::{self, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

pub const AGENT_NAME: &str = "T2AutoTron Local Agent";
const MAX_HEADER_BYTES: usize = 1024 * 1024;
// No route reads a body.
const MAX_BODY_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    AgentStatus,
    CompanionStatus,
    CompanionStart,
    CompanionStop,
    Preflight,
    NotFound,
}

impl Route {
    pub fn resolve(method: &str, path: &str) -> Self {
        let path = path.split_once('?').map(|(path, _)| path).unwrap_or(path);
        match (method, path) {
            ("OPTIONS", _) => Route::Preflight,
            ("GET", "/" | "/status") => Route::AgentStatus,
            ("GET", "/chatterbox/status") => Route::CompanionStatus,
            ("POST", "/chatterbox/start") => Route::CompanionStart,
            ("POST", "/chatterbox/stop") => Route::CompanionStop,
            _ => Route::NotFound,
        }
    }
}

#[derive(Debug)]
pub struct IncomingRequest {
    pub method: String,
    pub path: String,
    pub headers: BTreeMap<String, String>,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub status: u16,
    pub body: Option<serde_json::Value>,
}

impl Response {
    fn json(status: u16, body: serde_json::Value) -> Self {
        Self {
            status,
            body: Some(body),
        }
    }

    fn empty(status: u16) -> Self {
        Self { status, body: None }
    }
}

/// Translates routes into lifecycle calls; no socket handling.
pub struct Dispatcher {
    manager: Arc<LifecycleManager>,
}

impl Dispatcher {
    pub fn new(manager: Arc<LifecycleManager>) -> Self {
        Self { manager }
    }

    pub fn dispatch(&self, method: &str, path: &str) -> Result<Response, AgentError> {
        let response = match Route::resolve(method, path) {
            Route::Preflight => Response::empty(200),
            Route::AgentStatus => Response::json(
                200,
                json!({
                    "agent": AGENT_NAME,
                    "version": env!("CARGO_PKG_VERSION"),
                    "running": true,
                    "platform": env::consts::OS,
                    "chatterboxConfigured": self.manager.config().setup_complete,
                }),
            ),
            Route::CompanionStatus => {
                Response::json(200, serde_json::to_value(self.manager.status())?)
            }
            Route::CompanionStart => Response::json(200, serde_json::to_value(self.manager.start())?),
            Route::CompanionStop => Response::json(200, serde_json::to_value(self.manager.stop())?),
            Route::NotFound => Response::json(404, json!({"error": "Not found"})),
        };
        Ok(response)
    }
}

fn status_text(status: u16) -> &'static str {
    match status {
        200 => "OK",
        400 => "Bad Request",
        404 => "Not Found",
        500 => "Internal Server Error",
        _ => "OK",
    }
}

fn bad_request(reason: &str) -> AgentError {
    AgentError::Process(format!("bad request: {reason}"))
}

/// Reads up to the blank line; returns the head and any body bytes read past it.
fn read_head<R: Read>(stream: &mut R) -> Result<Option<(String, Vec<u8>)>, AgentError> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    loop {
        if let Some(pos) = buf.windows(4).position(|window| window == b"\r\n\r\n") {
            let rest = buf.split_off(pos + 4);
            buf.truncate(pos);
            return Ok(Some((String::from_utf8_lossy(&buf).into_owned(), rest)));
        }
        if buf.len() > MAX_HEADER_BYTES {
            return Err(bad_request("headers too large"));
        }
        let read = stream.read(&mut chunk)?;
        if read == 0 {
            return if buf.is_empty() {
                Ok(None)
            } else {
                Err(bad_request("missing header delimiter"))
            };
        }
        buf.extend_from_slice(&chunk[..read]);
    }
}

fn declared_body_len(headers: &BTreeMap<String, String>) -> Result<usize, AgentError> {
    let Some(raw) = headers.get("content-length") else {
        return Ok(0);
    };
    let len = raw
        .parse::<usize>()
        .map_err(|_| bad_request("invalid content-length"))?;
    if len > MAX_BODY_BYTES {
        return Err(bad_request("body too large"));
    }
    Ok(len)
}

pub fn read_request<R: Read>(stream: &mut R) -> Result<Option<IncomingRequest>, AgentError> {
    let Some((head, mut body)) = read_head(stream)? else {
        return Ok(None);
    };
    let mut lines = head.lines();
    let mut request_line = lines.next().unwrap_or_default().split_whitespace();
    let (Some(method), Some(target)) = (request_line.next(), request_line.next()) else {
        return Err(bad_request("malformed request line"));
    };
    let method = method.to_ascii_uppercase();
    let path = target.split_once('?').map_or(target, |(path, _)| path).to_string();
    let headers: BTreeMap<String, String> = lines
        .filter_map(|line| line.split_once(':'))
        .map(|(key, value)| (key.trim().to_ascii_lowercase(), value.trim().to_string()))
        .collect();

    let body_len = declared_body_len(&headers)?;
    let mut chunk = [0u8; 1024];
    while body.len() < body_len {
        let read = stream.read(&mut chunk)?;
        if read == 0 {
            return Err(bad_request("body shorter than content-length"));
        }
        body.extend_from_slice(&chunk[..read]);
    }
    body.truncate(body_len);
    Ok(Some(IncomingRequest {
        method,
        path,
        headers,
        body,
    }))
}

pub fn write_response<W: Write>(stream: &mut W, response: &Response) -> Result<(), AgentError> {
    let body = match &response.body {
        Some(value) => serde_json::to_vec(value)?,
        None => Vec::new(),
    };
    let mut header = format!(
        "HTTP/1.1 {} {}\r\n\
         Access-Control-Allow-Origin: *\r\n\
         Access-Control-Allow-Methods: GET, POST, OPTIONS\r\n\
         Access-Control-Allow-Headers: Content-Type\r\n",
        response.status,
        status_text(response.status)
    );
    if response.body.is_some() {
        header.push_str("Content-Type: application/json\r\n");
    }
    header.push_str(&format!(
        "Content-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    ));
    stream.write_all(header.as_bytes())?;
    stream.write_all(&body)?;
    stream.flush()?;
    Ok(())
}

fn handle_connection(mut stream: TcpStream, dispatcher: &Dispatcher) -> Result<(), AgentError> {
    stream.set_read_timeout(Some(Duration::from_secs(10)))?;
    let request = match read_request(&mut stream) {
        Ok(Some(request)) => request,
        Ok(None) => return Ok(()),
        Err(err) => {
            tracing::warn!(error = %err, "rejecting malformed request");
            return write_response(
                &mut stream,
                &Response::json(400, json!({"error": err.to_string()})),
            );
        }
    };
    let response = match dispatcher.dispatch(&request.method, &request.path) {
        Ok(response) => response,
        Err(err) => Response::json(500, json!({"error": err.to_string()})),
    };
    tracing::info!(
        method = %request.method,
        path = %request.path,
        status = response.status,
        origin = request.headers.get("origin").map(String::as_str).unwrap_or("-"),
        body_len = request.body.len(),
        "handled request"
    );
    write_response(&mut stream, &response)
}

/// Accepts connections forever, one thread per connection.
pub fn serve(listener: TcpListener, dispatcher: Arc<Dispatcher>) -> Result<(), AgentError> {
    loop {
        match listener.accept() {
            Ok((stream, addr)) => {
                let dispatcher = Arc::clone(&dispatcher);
                thread::spawn(move || {
                    if let Err(err) = handle_connection(stream, &dispatcher) {
                        tracing::debug!(%addr, error = %err, "connection ended with error");
                    }
                });
            }
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => {
                tracing::warn!(error = %err, "accept failed");
                thread::sleep(Duration::from_millis(250));
            }
        }
    }
}
