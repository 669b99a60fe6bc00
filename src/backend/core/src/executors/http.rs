//! HTTP call executor with SSRF protection.
//!
//! Only `http`/`https` targets are allowed, and every address the
//! hostname resolves to is checked against the blocked ranges before a
//! request leaves the worker. A non-2xx response is an executor failure.

use async_trait::async_trait;
use serde_json::json;
use std::net::IpAddr;
use std::time::Instant;

use super::{config_mismatch, ExecutionContext, Executor, ExecutorOutcome};
use crate::dag::NodeConfig;
use crate::error::{CascadeError, ErrorCode, Result};

/// Bounds for the per-request timeout, milliseconds.
const MIN_TIMEOUT_MS: u64 = 1_000;
const MAX_TIMEOUT_MS: u64 = 300_000;
const DEFAULT_TIMEOUT_MS: u64 = 30_000;

/// Header names whose values are masked in recorded output.
const MASKED_HEADERS: &[&str] = &["authorization", "proxy-authorization", "cookie", "set-cookie", "x-api-key"];

pub struct HttpExecutor {
    client: reqwest::Client,
}

impl HttpExecutor {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Executor for HttpExecutor {
    fn kind(&self) -> &'static str {
        "http"
    }

    async fn execute(
        &self,
        config: &NodeConfig,
        _ctx: &ExecutionContext,
    ) -> Result<ExecutorOutcome> {
        let NodeConfig::Http(config) = config else {
            return Err(config_mismatch(self.kind()));
        };

        let url = guard_url(&config.url).await?;

        let method: reqwest::Method = config.method.to_uppercase().parse().map_err(|_| {
            CascadeError::validation(format!("Unsupported HTTP method: {}", config.method))
        })?;

        let timeout_ms = config
            .timeout_ms
            .unwrap_or(DEFAULT_TIMEOUT_MS)
            .clamp(MIN_TIMEOUT_MS, MAX_TIMEOUT_MS);

        let mut request = self
            .client
            .request(method, url)
            .timeout(std::time::Duration::from_millis(timeout_ms))
            .query(&config.query);

        for (name, value) in &config.headers {
            request = request.header(name, value);
        }
        if let Some(body) = &config.body {
            request = match body {
                serde_json::Value::String(s) => request.body(s.clone()),
                other => request.json(other),
            };
        }

        let started = Instant::now();
        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                CascadeError::executor_timeout(format!(
                    "HTTP request to {} exceeded {} ms",
                    config.url, timeout_ms
                ))
            } else {
                CascadeError::executor_failure(format!("HTTP request failed: {}", e))
            }
        })?;

        let status = response.status();
        let headers = recorded_headers(response.headers());
        let body_text = response.text().await.unwrap_or_default();
        let duration_ms = started.elapsed().as_millis() as u64;

        // Surface JSON bodies structurally when they parse.
        let body: serde_json::Value = serde_json::from_str(&body_text)
            .unwrap_or(serde_json::Value::String(body_text));

        let success = status.is_success();
        let record = json!({
            "statusCode": status.as_u16(),
            "body": body,
            "headers": headers,
            "durationMs": duration_ms,
            "success": success,
        });

        if !success {
            return Err(CascadeError::with_internal(
                ErrorCode::ExecutorFailure,
                format!("HTTP {} from {}", status.as_u16(), config.url),
                record.to_string(),
            ));
        }

        Ok(ExecutorOutcome::Success(record))
    }
}

fn recorded_headers(headers: &reqwest::header::HeaderMap) -> serde_json::Value {
    let mut map = serde_json::Map::new();
    for (name, value) in headers {
        let lowered = name.as_str().to_ascii_lowercase();
        let recorded = if MASKED_HEADERS.contains(&lowered.as_str()) {
            "***".to_string()
        } else {
            value.to_str().unwrap_or("<binary>").to_string()
        };
        map.insert(lowered, serde_json::Value::String(recorded));
    }
    serde_json::Value::Object(map)
}

/// Validate the scheme and resolve the host, rejecting targets in the
/// blocked ranges. Returns the parsed URL.
pub(crate) async fn guard_url(raw: &str) -> Result<reqwest::Url> {
    let url = reqwest::Url::parse(raw)
        .map_err(|e| CascadeError::validation(format!("Invalid URL {:?}: {}", raw, e)))?;

    match url.scheme() {
        "http" | "https" => {}
        other => {
            return Err(CascadeError::new(
                ErrorCode::SsrfBlocked,
                format!("URL scheme {:?} is not allowed", other),
            ));
        }
    }

    let host = url
        .host_str()
        .ok_or_else(|| CascadeError::validation("URL has no host"))?;

    if host.eq_ignore_ascii_case("localhost") {
        return Err(blocked(host));
    }

    // IP literals are checked directly; hostnames by every resolved address.
    if let Ok(ip) = host.trim_matches(['[', ']']).parse::<IpAddr>() {
        if is_blocked_ip(ip) {
            return Err(blocked(host));
        }
        return Ok(url);
    }

    let port = url.port_or_known_default().unwrap_or(80);
    let addrs = tokio::net::lookup_host((host, port)).await.map_err(|e| {
        CascadeError::executor_failure(format!("Failed to resolve host {}: {}", host, e))
    })?;

    for addr in addrs {
        if is_blocked_ip(addr.ip()) {
            return Err(blocked(host));
        }
    }

    Ok(url)
}

fn blocked(host: &str) -> CascadeError {
    CascadeError::new(
        ErrorCode::SsrfBlocked,
        format!("Target host {} resolves to a blocked address range", host),
    )
}

/// Blocked ranges: loopback, link-local, RFC1918, ULA.
fn is_blocked_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            let octets = v4.octets();
            v4.is_loopback()                                   // 127.0.0.0/8
                || v4.is_private()                             // 10/8, 172.16/12, 192.168/16
                || v4.is_link_local()                          // 169.254/16
                || v4.is_unspecified()
                || octets[0] == 100 && (64..128).contains(&octets[1]) // CGNAT 100.64/10
        }
        IpAddr::V6(v6) => {
            let segments = v6.segments();
            v6.is_loopback()                                   // ::1
                || v6.is_unspecified()
                || (segments[0] & 0xfe00) == 0xfc00            // fc00::/7
                || (segments[0] & 0xffc0) == 0xfe80            // fe80::/10
                || v6.to_ipv4_mapped().map(|v4| is_blocked_ip(IpAddr::V4(v4))).unwrap_or(false)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_loopback_blocked() {
        for target in [
            "http://127.0.0.1:80",
            "http://localhost/path",
            "http://[::1]:8080",
        ] {
            let err = guard_url(target).await.unwrap_err();
            assert_eq!(err.code(), ErrorCode::SsrfBlocked, "target {}", target);
        }
    }

    #[tokio::test]
    async fn test_private_ranges_blocked() {
        for target in [
            "http://10.1.2.3",
            "http://172.16.0.1",
            "http://192.168.1.1",
            "http://169.254.169.254/latest/meta-data",
            "http://[fc00::1]",
            "http://[fe80::1]",
        ] {
            let err = guard_url(target).await.unwrap_err();
            assert_eq!(err.code(), ErrorCode::SsrfBlocked, "target {}", target);
        }
    }

    #[tokio::test]
    async fn test_non_http_scheme_blocked() {
        let err = guard_url("ftp://example.com/file").await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::SsrfBlocked);

        let err = guard_url("file:///etc/passwd").await.unwrap_err();
        // file URLs have no host; either rejection is acceptable, but the
        // scheme check fires first.
        assert_eq!(err.code(), ErrorCode::SsrfBlocked);
    }

    #[tokio::test]
    async fn test_public_ip_literal_allowed() {
        assert!(guard_url("https://93.184.216.34/").await.is_ok());
    }

    #[test]
    fn test_blocked_ip_table() {
        assert!(is_blocked_ip("127.0.0.1".parse().unwrap()));
        assert!(is_blocked_ip("10.0.0.1".parse().unwrap()));
        assert!(is_blocked_ip("172.31.255.255".parse().unwrap()));
        assert!(is_blocked_ip("192.168.0.1".parse().unwrap()));
        assert!(is_blocked_ip("100.64.0.1".parse().unwrap()));
        assert!(is_blocked_ip("::1".parse().unwrap()));
        assert!(is_blocked_ip("fd12:3456::1".parse().unwrap()));
        assert!(!is_blocked_ip("8.8.8.8".parse().unwrap()));
        assert!(!is_blocked_ip("2606:4700::1111".parse().unwrap()));
    }

    #[test]
    fn test_header_masking() {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert("Authorization", "Bearer secret".parse().unwrap());
        headers.insert("Content-Type", "application/json".parse().unwrap());

        let recorded = recorded_headers(&headers);
        assert_eq!(recorded["authorization"], "***");
        assert_eq!(recorded["content-type"], "application/json");
    }
}
