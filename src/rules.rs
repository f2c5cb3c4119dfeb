//! Rule engine: ordered pattern list resolved against the question name.
//!
//! 规则在加载时编译（正则、上游地址、开关），查询路径上只做匹配和覆盖叠加。
//! 匹配顺序是倒序的：最后一条规则最先尝试，命中即停。

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use regex::Regex;

use crate::config::{parse_host_spec, RawRule};
use crate::message::{QTYPE_A, QTYPE_AAAA};
use crate::metrics::RULE_MATCHES_TOTAL;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UpstreamOverride {
    Local,
    World,
    Addr(SocketAddr),
}

struct CompiledRule {
    pattern: Regex,
    raw_pattern: String,
    address: Option<String>,
    name_server: Option<UpstreamOverride>,
    use_http_query: Option<bool>,
    query_timeout: Option<Duration>,
    compression_mutation: Option<bool>,
    force_aaaa: bool,
}

/// Immutable compiled snapshot; the supervisor swaps whole instances on
/// reload, a query holds one snapshot for its entire pipeline.
pub struct RuleSet {
    rules: Vec<CompiledRule>,
}

/// Per-query knobs inherited from `AppConfig` when a rule does not override
/// them.
#[derive(Debug, Clone, Copy)]
pub struct ResolveDefaults {
    pub local: SocketAddr,
    pub world: SocketAddr,
    pub use_http: bool,
    pub timeout: Duration,
    pub mutate: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleAction {
    /// Answer directly with this literal address.
    Synthesize(IpAddr),
    /// Query the upstream for this rewritten name instead.
    Redirect(String),
    /// Forward the original query untouched.
    Passthrough,
}

#[derive(Debug, Clone)]
pub struct RuleOutcome {
    pub effective_type: u16,
    pub upstream: SocketAddr,
    pub use_http: bool,
    pub timeout: Duration,
    pub mutate: bool,
    pub action: RuleAction,
}

impl RuleOutcome {
    pub fn passthrough(defaults: &ResolveDefaults, qtype: u16) -> Self {
        Self {
            effective_type: qtype,
            upstream: defaults.local,
            use_http: defaults.use_http,
            timeout: defaults.timeout,
            mutate: defaults.mutate,
            action: RuleAction::Passthrough,
        }
    }
}

impl RuleSet {
    pub fn empty() -> Self {
        Self { rules: Vec::new() }
    }

    /// Compile raw rule-file entries. Entries whose pattern or nameServer
    /// does not parse are dropped with a warning.
    pub fn compile(raw_rules: Vec<RawRule>) -> Self {
        let mut rules = Vec::with_capacity(raw_rules.len());
        for raw in raw_rules {
            let pattern = match Regex::new(&raw.pattern) {
                Ok(re) => re,
                Err(e) => {
                    tracing::warn!("[rules] Dropping rule with bad pattern '{}': {}", raw.pattern, e);
                    continue;
                }
            };
            let name_server = match raw.name_server.as_deref() {
                None => None,
                Some("local") => Some(UpstreamOverride::Local),
                Some("world") => Some(UpstreamOverride::World),
                Some(spec) => match parse_host_spec(spec, 53) {
                    Some(addr) => Some(UpstreamOverride::Addr(addr)),
                    None => {
                        tracing::warn!(
                            "[rules] Dropping rule '{}' with bad nameServer '{}'",
                            raw.pattern,
                            spec
                        );
                        continue;
                    }
                },
            };
            rules.push(CompiledRule {
                pattern,
                raw_pattern: raw.pattern,
                address: raw.address,
                name_server,
                use_http_query: raw.use_http_query,
                query_timeout: raw.query_timeout.map(Duration::from_millis),
                compression_mutation: raw.compression_mutation,
                force_aaaa: raw.force_aaaa.unwrap_or(false),
            });
        }
        Self { rules }
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Walk the list from the last entry to the first; the first rule whose
    /// pattern matches wins and its overrides are layered on the defaults.
    pub fn resolve(&self, qname_key: &str, qtype: u16, defaults: &ResolveDefaults) -> RuleOutcome {
        for rule in self.rules.iter().rev() {
            let caps = match rule.pattern.captures(qname_key) {
                Some(caps) => caps,
                None => continue,
            };

            let effective_type = if rule.force_aaaa { QTYPE_AAAA } else { qtype };
            let action = match rule.address.as_deref() {
                None => RuleAction::Passthrough,
                Some(address) => match address.parse::<IpAddr>() {
                    Ok(ip) => {
                        if !family_matches(ip, effective_type) {
                            // 地址族和记录类型不符：放弃整条规则并且终止搜索，
                            // 不回退到更早的规则（沿用原始实现的语义）
                            tracing::warn!(
                                "[rules] Rule '{}' address {} does not fit {}, skipping",
                                rule.raw_pattern,
                                ip,
                                crate::message::qtype_str(effective_type)
                            );
                            break;
                        }
                        RuleAction::Synthesize(ip)
                    }
                    Err(_) => RuleAction::Redirect(expand_template(address, &caps)),
                },
            };

            RULE_MATCHES_TOTAL.inc();
            let upstream = match rule.name_server {
                None => defaults.local,
                Some(UpstreamOverride::Local) => defaults.local,
                Some(UpstreamOverride::World) => defaults.world,
                Some(UpstreamOverride::Addr(addr)) => addr,
            };
            return RuleOutcome {
                effective_type,
                upstream,
                use_http: rule.use_http_query.unwrap_or(defaults.use_http),
                timeout: rule.query_timeout.unwrap_or(defaults.timeout),
                mutate: rule.compression_mutation.unwrap_or(defaults.mutate),
                action,
            };
        }
        RuleOutcome::passthrough(defaults, qtype)
    }
}

fn family_matches(ip: IpAddr, effective_type: u16) -> bool {
    match effective_type {
        QTYPE_A => ip.is_ipv4(),
        QTYPE_AAAA => ip.is_ipv6(),
        _ => false,
    }
}

/// Positional template expansion: `{0}` is the full match, `{1}` the first
/// capture group, and so on.
fn expand_template(template: &str, caps: &regex::Captures) -> String {
    let mut out = template.to_string();
    for i in 0..caps.len() {
        if let Some(m) = caps.get(i) {
            out = out.replace(&format!("{{{}}}", i), m.as_str());
        }
    }
    out
}
