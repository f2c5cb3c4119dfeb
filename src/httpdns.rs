//! Alternate A-record resolution over HTTP (DNSPod-style `/d` interface).
//!
//! GET `http://<server>/d?dn=<name>&ttl=1` 返回纯文本 `ip1;ip2;…,ttl`，
//! 空响应体表示域名不存在。

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use crate::error::CoreError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HttpAnswer {
    Records { ips: Vec<Ipv4Addr>, ttl: u32 },
    NxDomain,
}

pub struct HttpResolver {
    client: reqwest::Client,
}

impl HttpResolver {
    pub fn new() -> Self {
        Self { client: reqwest::Client::new() }
    }

    pub async fn resolve_a(
        &self,
        server: IpAddr,
        name: &str,
        timeout: Duration,
    ) -> Result<HttpAnswer, CoreError> {
        let url = format!("http://{}/d?dn={}&ttl=1", server, name);
        let response = self
            .client
            .get(&url)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| CoreError::HttpResolve(e.to_string()))?;
        if !response.status().is_success() {
            return Err(CoreError::HttpResolve(format!(
                "{} answered status {}",
                server,
                response.status()
            )));
        }
        let body = response.text().await.map_err(|e| CoreError::HttpResolve(e.to_string()))?;
        parse_body(&body)
    }
}

fn parse_body(body: &str) -> Result<HttpAnswer, CoreError> {
    let body = body.trim();
    if body.is_empty() {
        return Ok(HttpAnswer::NxDomain);
    }
    let (ips_part, ttl_part) = body
        .rsplit_once(',')
        .ok_or_else(|| CoreError::HttpResolve(format!("body without ttl: '{}'", body)))?;
    let ttl: u32 = ttl_part
        .trim()
        .parse()
        .map_err(|_| CoreError::HttpResolve(format!("bad ttl in body: '{}'", body)))?;
    let mut ips = Vec::new();
    for raw in ips_part.split(';').filter(|s| !s.is_empty()) {
        let ip: Ipv4Addr = raw
            .trim()
            .parse()
            .map_err(|_| CoreError::HttpResolve(format!("bad address in body: '{}'", raw)))?;
        ips.push(ip);
    }
    if ips.is_empty() {
        return Ok(HttpAnswer::NxDomain);
    }
    Ok(HttpAnswer::Records { ips, ttl })
}
