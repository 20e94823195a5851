// SPDX-License-Identifier: Apache-2.0

//! Access log record captured for a single sampled request.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One access log entry. Built once by the capture layer and never mutated
/// after it is handed to the collector.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessLogRecord {
    pub request_uri: String,
    pub method: String,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query_params: Option<String>,
    #[serde(default)]
    pub request_header: HashMap<String, String>,
    #[serde(default)]
    pub response_header: HashMap<String, String>,
    pub client_ip: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_body: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_body: Option<String>,
    pub status: u16,
    pub elapsed_millis: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upstream_ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rpc_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub module: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_content_length: Option<u64>,
}

impl AccessLogRecord {
    pub fn builder(
        method: impl Into<String>,
        request_uri: impl Into<String>,
    ) -> AccessLogRecordBuilder {
        AccessLogRecordBuilder::new(method, request_uri)
    }

    /// Serialize to the flat JSON encoding shipped to brokers.
    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// Assembles an [`AccessLogRecord`]. The path and query string are derived
/// from the request URI.
#[derive(Debug)]
pub struct AccessLogRecordBuilder {
    record: AccessLogRecord,
}

impl AccessLogRecordBuilder {
    pub fn new(method: impl Into<String>, request_uri: impl Into<String>) -> Self {
        let request_uri = request_uri.into();
        let (path, query) = split_uri(&request_uri);
        Self {
            record: AccessLogRecord {
                method: method.into(),
                path,
                query_params: query,
                request_uri,
                timestamp: Utc::now(),
                ..Default::default()
            },
        }
    }

    pub fn with_request_header(
        mut self,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.record.request_header.insert(name.into(), value.into());
        self
    }

    pub fn with_request_headers(mut self, headers: HashMap<String, String>) -> Self {
        self.record.request_header = headers;
        self
    }

    pub fn with_response_headers(mut self, headers: HashMap<String, String>) -> Self {
        self.record.response_header = headers;
        self
    }

    pub fn with_client_ip(mut self, ip: impl Into<String>) -> Self {
        self.record.client_ip = ip.into();
        self
    }

    pub fn with_user_agent(mut self, user_agent: Option<String>) -> Self {
        self.record.user_agent = user_agent;
        self
    }

    pub fn with_host(mut self, host: Option<String>) -> Self {
        self.record.host = host;
        self
    }

    pub fn with_request_body(mut self, body: Option<String>) -> Self {
        self.record.request_body = body;
        self
    }

    pub fn with_response_body(mut self, body: Option<String>) -> Self {
        self.record.response_body = body;
        self
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.record.status = status;
        self
    }

    pub fn with_elapsed_millis(mut self, elapsed: u64) -> Self {
        self.record.elapsed_millis = elapsed;
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.record.timestamp = timestamp;
        self
    }

    pub fn with_upstream_ip(mut self, ip: Option<String>) -> Self {
        self.record.upstream_ip = ip;
        self
    }

    pub fn with_rpc_type(mut self, rpc_type: Option<String>) -> Self {
        self.record.rpc_type = rpc_type;
        self
    }

    pub fn with_module(mut self, module: Option<String>) -> Self {
        self.record.module = module;
        self
    }

    pub fn with_response_content_length(mut self, len: Option<u64>) -> Self {
        self.record.response_content_length = len;
        self
    }

    pub fn build(self) -> AccessLogRecord {
        self.record
    }
}

// Splits "scheme://host/path?query" or "/path?query" into (path, query).
fn split_uri(uri: &str) -> (String, Option<String>) {
    let without_scheme = match uri.find("://") {
        Some(idx) => {
            let rest = &uri[idx + 3..];
            match rest.find('/') {
                Some(slash) => &rest[slash..],
                None => "/",
            }
        }
        None => uri,
    };

    match without_scheme.split_once('?') {
        Some((path, query)) if !query.is_empty() => (path.to_string(), Some(query.to_string())),
        Some((path, _)) => (path.to_string(), None),
        None => (without_scheme.to_string(), None),
    }
}
