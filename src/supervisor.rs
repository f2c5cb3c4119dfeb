//! Supervisor: owns the shared state, spawns one Agent per listen endpoint
//! and applies rule reloads.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use arc_swap::ArcSwap;
use tokio::task::JoinHandle;

use crate::acl::NetworkWhitelist;
use crate::agent::Agent;
use crate::cache::ResponseCache;
use crate::config::{parse_host_spec, split_listen_specs, AppConfig};
use crate::httpdns::HttpResolver;
use crate::metrics::{RELOAD_FAILED_TOTAL, RELOAD_TOTAL};
use crate::rules::{ResolveDefaults, RuleSet};

const CACHE_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Everything the agents share. `rules` is swapped atomically on reload;
/// one query holds one snapshot for its whole pipeline.
pub struct SharedState {
    pub cache: ResponseCache,
    pub rules: ArcSwap<RuleSet>,
    pub whitelist: NetworkWhitelist,
    pub http: HttpResolver,
    pub defaults: ResolveDefaults,
    pub cache_response: bool,
    pub cache_age: u32,
}

impl SharedState {
    pub fn new(config: &AppConfig, rules: RuleSet) -> Self {
        let fallback = AppConfig::default();
        let local = resolve_upstream(&config.local_name_server, &fallback.local_name_server);
        let world = resolve_upstream(&config.world_name_server, &fallback.world_name_server);
        Self {
            cache: ResponseCache::new(),
            rules: ArcSwap::from_pointee(rules),
            whitelist: NetworkWhitelist::from_config(config.network_whitelist.as_deref()),
            http: HttpResolver::new(),
            defaults: ResolveDefaults {
                local,
                world,
                use_http: config.use_http_query,
                timeout: Duration::from_millis(config.query_timeout),
                mutate: config.compression_mutation,
            },
            cache_response: config.cache_response,
            cache_age: config.cache_age,
        }
    }
}

fn resolve_upstream(spec: &str, fallback: &str) -> std::net::SocketAddr {
    match parse_host_spec(spec, 53) {
        Some(addr) => addr,
        None => {
            tracing::warn!("[supervisor] Bad upstream spec '{}', falling back to {}", spec, fallback);
            parse_host_spec(fallback, 53).expect("builtin upstream spec parses")
        }
    }
}

pub struct Supervisor {
    shared: Arc<SharedState>,
    tasks: Vec<JoinHandle<()>>,
}

impl Supervisor {
    pub fn new(config: &AppConfig, rules: RuleSet) -> Self {
        Self { shared: Arc::new(SharedState::new(config, rules)), tasks: Vec::new() }
    }

    pub fn shared(&self) -> Arc<SharedState> {
        self.shared.clone()
    }

    /// Bind one Agent per comma separated listen spec. A bind failure is
    /// fatal; a spec that does not even parse was already skipped with a
    /// warning.
    pub async fn start(&mut self, listen_on: &str) -> Result<()> {
        let specs = split_listen_specs(listen_on);
        anyhow::ensure!(!specs.is_empty(), "no usable listen endpoint in '{}'", listen_on);
        for addr in specs {
            let agent = Arc::new(Agent::bind(addr, self.shared.clone()).await?);
            tracing::info!("[supervisor] Agent ready on {}", agent.local_addr());
            self.tasks.push(agent.run());
        }

        // 低频兜底清扫，保持条目数指标诚实
        let shared = self.shared.clone();
        self.tasks.push(tokio::spawn(async move {
            loop {
                tokio::time::sleep(CACHE_SWEEP_INTERVAL).await;
                shared.cache.sweep();
            }
        }));
        Ok(())
    }

    /// Swap in a reloaded rule set. An empty set is rejected (the previous
    /// rules stay live) but the cache is flushed either way.
    pub fn apply_rules(&self, new_rules: RuleSet) {
        if new_rules.is_empty() {
            tracing::warn!(
                "[supervisor] Reloaded rule list is empty or unusable, keeping the previous {} rule(s)",
                self.shared.rules.load().len()
            );
            RELOAD_FAILED_TOTAL.inc();
        } else {
            tracing::info!("[supervisor] Applied {} rule(s)", new_rules.len());
            self.shared.rules.store(Arc::new(new_rules));
            RELOAD_TOTAL.inc();
        }
        self.shared.cache.clear();
    }

    pub fn shutdown(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        tracing::info!("[supervisor] All agents stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RawRule;
    use crate::message::QTYPE_A;

    fn one_rule() -> Vec<RawRule> {
        vec![RawRule {
            pattern: "^blocked\\.example$".to_string(),
            address: Some("0.0.0.0".to_string()),
            name_server: None,
            use_http_query: None,
            query_timeout: None,
            compression_mutation: None,
            force_aaaa: None,
        }]
    }

    #[test]
    fn empty_reload_keeps_rules_but_flushes_cache() {
        let supervisor = Supervisor::new(&AppConfig::default(), RuleSet::compile(one_rule()));
        let shared = supervisor.shared();

        let msg = crate::message::DnsMessage {
            id: 1,
            questions: vec![crate::message::Question {
                name: "cached.example".to_string(),
                qtype: QTYPE_A,
                qclass: 1,
            }],
            ..Default::default()
        }
        .into_answer(
            vec![crate::message::Record::a("cached.example", 300, "1.2.3.4".parse().unwrap())],
            0,
        );
        shared.cache.insert("cached.example", QTYPE_A, msg, 0);
        assert!(shared.cache.lookup("cached.example", QTYPE_A).is_some());

        supervisor.apply_rules(RuleSet::empty());
        // 旧规则保留，缓存照清
        assert_eq!(shared.rules.load().len(), 1);
        assert!(shared.cache.lookup("cached.example", QTYPE_A).is_none());
    }

    #[test]
    fn non_empty_reload_replaces_the_snapshot() {
        let supervisor = Supervisor::new(&AppConfig::default(), RuleSet::empty());
        let shared = supervisor.shared();
        assert_eq!(shared.rules.load().len(), 0);
        supervisor.apply_rules(RuleSet::compile(one_rule()));
        assert_eq!(shared.rules.load().len(), 1);
    }

    #[test]
    fn bad_upstream_specs_fall_back_to_defaults() {
        let mut config = AppConfig::default();
        config.local_name_server = "definitely not an ip".to_string();
        let shared = SharedState::new(&config, RuleSet::empty());
        assert_eq!(shared.defaults.local, "119.29.29.29:53".parse().unwrap());
    }

    #[tokio::test]
    async fn start_requires_a_usable_listen_spec() {
        let mut supervisor = Supervisor::new(&AppConfig::default(), RuleSet::empty());
        assert!(supervisor.start("bogus, also bad").await.is_err());
        assert!(supervisor.start("127.0.0.1:0").await.is_ok());
        supervisor.shutdown();
    }
}
