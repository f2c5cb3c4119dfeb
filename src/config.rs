//! Configuration loading: `options.json` and `rules.json`.
//!
//! 加载是宽容的：文件缺失回退默认值，解析失败打日志后同样回退默认值，
//! 绝不让坏配置拦住启动。配置在启动后不可变，规则文件可以热重载。

use std::net::{IpAddr, SocketAddr};
use std::path::Path;

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AppConfig {
    /// UI-host concern (hide the console window); parsed and ignored here.
    pub hide_on_start: bool,
    /// Comma separated listen specs, one Agent per entry, default port 53.
    pub listen_on: String,
    pub local_name_server: String,
    pub world_name_server: String,
    pub use_http_query: bool,
    /// Milliseconds.
    pub query_timeout: u64,
    pub compression_mutation: bool,
    pub cache_response: bool,
    /// Cached-TTL ceiling in seconds, 0 keeps record TTLs verbatim.
    pub cache_age: u32,
    /// `None` disables the ACL, an empty list denies everyone.
    pub network_whitelist: Option<Vec<String>>,
    /// Optional `host:port` for the prometheus exposition listener.
    pub metrics_on: Option<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            hide_on_start: false,
            listen_on: "127.0.0.1".to_string(),
            local_name_server: "119.29.29.29".to_string(),
            world_name_server: "8.8.8.8".to_string(),
            use_http_query: false,
            query_timeout: 4000,
            compression_mutation: false,
            cache_response: true,
            cache_age: 0,
            network_whitelist: None,
            metrics_on: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawRule {
    pub pattern: String,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub name_server: Option<String>,
    #[serde(default)]
    pub use_http_query: Option<bool>,
    #[serde(default)]
    pub query_timeout: Option<u64>,
    #[serde(default)]
    pub compression_mutation: Option<bool>,
    #[serde(default)]
    pub force_aaaa: Option<bool>,
}

pub fn load_options(path: &Path) -> AppConfig {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(_) => {
            tracing::info!("[config] {} not found, using default options", path.display());
            return AppConfig::default();
        }
    };
    match serde_json::from_str(&content) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("[config] Failed to parse {}: {}, using defaults", path.display(), e);
            AppConfig::default()
        }
    }
}

pub fn load_rules(path: &Path) -> Vec<RawRule> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(_) => {
            tracing::info!("[config] {} not found, starting with an empty rule list", path.display());
            return Vec::new();
        }
    };
    match serde_json::from_str(&content) {
        Ok(rules) => rules,
        Err(e) => {
            tracing::error!("[config] Failed to parse {}: {}, ignoring the file", path.display(), e);
            Vec::new()
        }
    }
}

/// Parse a `host[:port]` spec. Bracketed IPv6 (`[::1]:53`) and bare
/// addresses of both families are accepted.
pub fn parse_host_spec(spec: &str, default_port: u16) -> Option<SocketAddr> {
    let spec = spec.trim();
    if let Ok(addr) = spec.parse::<SocketAddr>() {
        return Some(addr);
    }
    let bare = spec.strip_prefix('[').and_then(|s| s.strip_suffix(']')).unwrap_or(spec);
    bare.parse::<IpAddr>().ok().map(|ip| SocketAddr::new(ip, default_port))
}

/// Split the comma separated `listenOn` value into socket addresses,
/// skipping entries that do not parse.
pub fn split_listen_specs(listen_on: &str) -> Vec<SocketAddr> {
    listen_on
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .filter_map(|spec| match parse_host_spec(spec, 53) {
            Some(addr) => Some(addr),
            None => {
                tracing::warn!("[config] Ignoring bad listen spec '{}'", spec);
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_options_file_yields_defaults() {
        let config = load_options(Path::new("/nonexistent/options.json"));
        assert_eq!(config.listen_on, "127.0.0.1");
        assert_eq!(config.query_timeout, 4000);
        assert!(config.cache_response);
        assert!(config.network_whitelist.is_none());
    }

    #[test]
    fn options_parse_partial_json() {
        let config: AppConfig = serde_json::from_str(
            r#"{"listenOn": "0.0.0.0:5353, ::1", "cacheAge": 60, "networkWhitelist": []}"#,
        )
        .unwrap();
        assert_eq!(config.listen_on, "0.0.0.0:5353, ::1");
        assert_eq!(config.cache_age, 60);
        assert_eq!(config.network_whitelist, Some(vec![]));
        // 未提供的字段回退默认值
        assert_eq!(config.local_name_server, "119.29.29.29");
    }

    #[test]
    fn rules_parse_with_optional_fields() {
        let rules: Vec<RawRule> = serde_json::from_str(
            r#"[
                {"pattern": "^ads\\.evil\\.com$", "address": "0.0.0.0"},
                {"pattern": "^(.+)\\.cn$", "nameServer": "local", "compressionMutation": true}
            ]"#,
        )
        .unwrap();
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[0].address.as_deref(), Some("0.0.0.0"));
        assert_eq!(rules[1].name_server.as_deref(), Some("local"));
        assert_eq!(rules[1].compression_mutation, Some(true));
        assert!(rules[1].address.is_none());
    }

    #[test]
    fn host_specs_accept_both_families_and_ports() {
        assert_eq!(parse_host_spec("8.8.8.8", 53), Some("8.8.8.8:53".parse().unwrap()));
        assert_eq!(parse_host_spec("8.8.8.8:5353", 53), Some("8.8.8.8:5353".parse().unwrap()));
        assert_eq!(parse_host_spec("[2001:db8::1]:53", 53), Some("[2001:db8::1]:53".parse().unwrap()));
        assert_eq!(parse_host_spec("2001:db8::1", 53), Some("[2001:db8::1]:53".parse().unwrap()));
        assert_eq!(parse_host_spec("not an address", 53), None);
    }

    #[test]
    fn listen_specs_split_on_commas() {
        let specs = split_listen_specs("127.0.0.1, 10.0.0.1:5353, bogus");
        assert_eq!(specs, vec!["127.0.0.1:53".parse().unwrap(), "10.0.0.1:5353".parse().unwrap()]);
    }
}
