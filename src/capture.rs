// SPDX-License-Identifier: Apache-2.0

//! Request-path hook that assembles one [`AccessLogRecord`] per sampled
//! exchange.
//!
//! A proxy calls [`AccessLogCapture::begin`] when a request arrives, feeds
//! body chunks and the response head as they pass through, and finishes with
//! [`AccessLogCapture::on_complete`] or [`AccessLogCapture::on_error`]. A
//! capture dropped without finishing is recorded as failed, so every sampled
//! exchange reaches the collector exactly once.

use crate::collector::Collector;
use crate::record::{AccessLogRecord, AccessLogRecordBuilder};
use chrono::{DateTime, Utc};
use http::header::{CONTENT_LENGTH, HOST, USER_AGENT};
use http::{HeaderMap, HeaderName, Method, StatusCode, Uri};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Instant;
use tracing::trace;

static X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
static X_REAL_IP: HeaderName = HeaderName::from_static("x-real-ip");

/// Accumulates body bytes up to a ceiling; anything past it is discarded.
#[derive(Debug)]
struct BodyBuffer {
    buf: Vec<u8>,
    limit: usize,
    truncated: bool,
}

impl BodyBuffer {
    fn new(limit: usize) -> Self {
        Self {
            buf: Vec::new(),
            limit,
            truncated: false,
        }
    }

    fn push(&mut self, chunk: &[u8]) {
        let room = self.limit.saturating_sub(self.buf.len());
        if chunk.len() > room {
            self.truncated = true;
        }
        self.buf.extend_from_slice(&chunk[..chunk.len().min(room)]);
    }

    fn into_string(self) -> Option<String> {
        if self.buf.is_empty() {
            return None;
        }
        Some(String::from_utf8_lossy(&self.buf).into_owned())
    }
}

struct Exchange {
    collector: Arc<Collector>,
    method: String,
    uri: String,
    request_headers: HashMap<String, String>,
    response_headers: HashMap<String, String>,
    client_ip: String,
    user_agent: Option<String>,
    host: Option<String>,
    request_body: BodyBuffer,
    response_body: BodyBuffer,
    status: Option<u16>,
    response_content_length: Option<u64>,
    upstream_ip: Option<String>,
    rpc_type: Option<String>,
    module: Option<String>,
    timestamp: DateTime<Utc>,
    started: Instant,
}

impl Exchange {
    fn into_record(self, fallback_status: u16) -> (Arc<Collector>, AccessLogRecord) {
        let elapsed = self.started.elapsed().as_millis() as u64;
        let record = AccessLogRecordBuilder::new(self.method, self.uri)
            .with_request_headers(self.request_headers)
            .with_response_headers(self.response_headers)
            .with_client_ip(self.client_ip)
            .with_user_agent(self.user_agent)
            .with_host(self.host)
            .with_request_body(self.request_body.into_string())
            .with_response_body(self.response_body.into_string())
            .with_status(self.status.unwrap_or(fallback_status))
            .with_elapsed_millis(elapsed)
            .with_timestamp(self.timestamp)
            .with_upstream_ip(self.upstream_ip)
            .with_rpc_type(self.rpc_type)
            .with_module(self.module)
            .with_response_content_length(self.response_content_length)
            .build();
        (self.collector, record)
    }
}

/// Capture state for one in-flight exchange.
pub struct AccessLogCapture {
    exchange: Option<Exchange>,
}

impl AccessLogCapture {
    /// Start capturing, or `None` when the path is not sampled.
    pub fn begin(
        collector: Arc<Collector>,
        method: &Method,
        uri: &Uri,
        headers: &HeaderMap,
        peer: Option<IpAddr>,
    ) -> Option<Self> {
        let Some(config) = collector.config().sample(uri.path()) else {
            trace!(path = uri.path(), "Request not sampled");
            return None;
        };

        let host = header_value(headers, &HOST).or_else(|| uri.host().map(str::to_string));
        Some(Self {
            exchange: Some(Exchange {
                method: method.as_str().to_string(),
                uri: uri.to_string(),
                request_headers: header_map(headers),
                response_headers: HashMap::new(),
                client_ip: client_ip(headers, peer),
                user_agent: header_value(headers, &USER_AGENT),
                host,
                request_body: BodyBuffer::new(config.max_request_body_size),
                response_body: BodyBuffer::new(config.max_response_body_size),
                status: None,
                response_content_length: None,
                upstream_ip: None,
                rpc_type: None,
                module: None,
                timestamp: Utc::now(),
                started: Instant::now(),
                collector,
            }),
        })
    }

    pub fn from_request_parts(
        collector: Arc<Collector>,
        parts: &http::request::Parts,
        peer: Option<IpAddr>,
    ) -> Option<Self> {
        Self::begin(collector, &parts.method, &parts.uri, &parts.headers, peer)
    }

    pub fn on_request_body_chunk(&mut self, chunk: &[u8]) {
        if let Some(ex) = self.exchange.as_mut() {
            ex.request_body.push(chunk);
        }
    }

    pub fn on_response_head(&mut self, status: StatusCode, headers: &HeaderMap) {
        if let Some(ex) = self.exchange.as_mut() {
            ex.status = Some(status.as_u16());
            ex.response_headers = header_map(headers);
            ex.response_content_length = header_value(headers, &CONTENT_LENGTH)
                .and_then(|v| v.trim().parse::<u64>().ok());
        }
    }

    pub fn on_response_body_chunk(&mut self, chunk: &[u8]) {
        if let Some(ex) = self.exchange.as_mut() {
            ex.response_body.push(chunk);
        }
    }

    /// Address of the upstream that served the request.
    pub fn set_upstream_ip(&mut self, ip: impl Into<String>) {
        if let Some(ex) = self.exchange.as_mut() {
            ex.upstream_ip = Some(ip.into());
        }
    }

    pub fn set_rpc_type(&mut self, rpc_type: impl Into<String>) {
        if let Some(ex) = self.exchange.as_mut() {
            ex.rpc_type = Some(rpc_type.into());
        }
    }

    pub fn set_module(&mut self, module: impl Into<String>) {
        if let Some(ex) = self.exchange.as_mut() {
            ex.module = Some(module.into());
        }
    }

    pub fn request_body_truncated(&self) -> bool {
        self.exchange
            .as_ref()
            .is_some_and(|ex| ex.request_body.truncated)
    }

    pub fn response_body_truncated(&self) -> bool {
        self.exchange
            .as_ref()
            .is_some_and(|ex| ex.response_body.truncated)
    }

    /// The exchange finished normally.
    pub fn on_complete(mut self) {
        self.finish(StatusCode::OK);
    }

    /// The exchange failed. Records status 500 unless a response status was
    /// already written.
    pub fn on_error(mut self) {
        self.finish(StatusCode::INTERNAL_SERVER_ERROR);
    }

    fn finish(&mut self, fallback: StatusCode) {
        if let Some(ex) = self.exchange.take() {
            let (collector, record) = ex.into_record(fallback.as_u16());
            collector.collect(record);
        }
    }
}

impl Drop for AccessLogCapture {
    fn drop(&mut self) {
        self.finish(StatusCode::INTERNAL_SERVER_ERROR);
    }
}

fn header_value(headers: &HeaderMap, name: &HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

// Repeated headers are joined with ", ", values that are not visible ASCII
// are skipped.
fn header_map(headers: &HeaderMap) -> HashMap<String, String> {
    let mut out: HashMap<String, String> = HashMap::with_capacity(headers.keys_len());
    for (name, value) in headers {
        let Ok(value) = value.to_str() else {
            continue;
        };
        out.entry(name.as_str().to_string())
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(value);
            })
            .or_insert_with(|| value.to_string());
    }
    out
}

/// First `X-Forwarded-For` hop, then `X-Real-IP`, then the peer address.
fn client_ip(headers: &HeaderMap, peer: Option<IpAddr>) -> String {
    let forwarded = header_value(headers, &X_FORWARDED_FOR).and_then(|v| {
        v.split(',')
            .map(str::trim)
            .find(|hop| !hop.is_empty())
            .map(str::to_string)
    });

    forwarded
        .or_else(|| {
            header_value(headers, &X_REAL_IP)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        })
        .or_else(|| peer.map(|ip| ip.to_string()))
        .unwrap_or_default()
}
