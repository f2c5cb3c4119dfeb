//! Agent: one listening UDP endpoint and its per-query pipeline.
//!
//! 每个数据报走固定流水线：解析 → ACL → 缓存 → 规则 → 分发（合成 / HTTP /
//! 改写转发 / 直接转发）→ 回包 → 缓存回填。失败处理按 error.rs 里的策略表
//! 统一收口。

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;

use crate::error::CoreError;
use crate::exchange::{query_once, UpstreamExchange};
use crate::httpdns::HttpAnswer;
use crate::message::{
    qtype_str, DnsMessage, Question, Record, QTYPE_A, QTYPE_AAAA, RCODE_NOERROR, RCODE_NXDOMAIN,
    RCODE_REFUSED, RCODE_SERVFAIL,
};
use crate::metrics::{DNS_REFUSED_TOTAL, DNS_REQUESTS_TOTAL};
use crate::rules::{RuleAction, RuleOutcome};
use crate::supervisor::SharedState;

const RECV_BUFFER_LEN: usize = 4096;

/// TTL attached to answers synthesized from a rule's literal address.
const SYNTHETIC_TTL: u32 = 600;

pub struct Agent {
    addr: SocketAddr,
    socket: Arc<UdpSocket>,
    exchange: UpstreamExchange,
    shared: Arc<SharedState>,
}

impl Agent {
    /// Bind the listener and its forwarding sockets. A bind failure here is
    /// the one startup error that is fatal to the process.
    pub async fn bind(addr: SocketAddr, shared: Arc<SharedState>) -> anyhow::Result<Agent> {
        let socket = UdpSocket::bind(addr)
            .await
            .with_context(|| format!("failed to bind listener on udp://{}", addr))?;
        let addr = socket.local_addr()?;
        let exchange = UpstreamExchange::bind(addr.port()).await?;
        tracing::info!("[agent] Listening on udp://{}", addr);
        Ok(Agent { addr, socket: Arc::new(socket), exchange, shared })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn run(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut buf = vec![0u8; RECV_BUFFER_LEN];
            loop {
                if let Ok((n, src)) = self.socket.recv_from(&mut buf).await {
                    let data = buf[..n].to_vec();
                    let agent = self.clone();
                    tokio::spawn(async move {
                        agent.handle_datagram(data, src).await;
                    });
                }
            }
        })
    }

    async fn handle_datagram(&self, data: Vec<u8>, src: SocketAddr) {
        let query = match DnsMessage::parse(&data) {
            Ok(msg) if msg.is_query() => msg,
            Ok(_) => return,
            Err(e) => {
                // 垃圾报文静默丢弃，只留一条 debug 便于排障
                tracing::debug!("[agent] Dropping unparseable datagram from {}: {}", src, e);
                return;
            }
        };

        if let Err(e) = self.shared.whitelist.authorize(src.ip()) {
            self.handle_failure(e, &query, src).await;
            return;
        }

        // parse 保证查询至少带一个 question
        let question = query.questions[0].clone();
        let qname_key = question.key_name();
        tracing::info!(
            "{} requested {} (#{:#06x}, {})",
            src.ip(),
            question.name,
            query.id,
            qtype_str(question.qtype)
        );
        DNS_REQUESTS_TOTAL.with_label_values(&[qtype_str(question.qtype)]).inc();

        if self.shared.cache_response {
            if let Some(mut cached) = self.shared.cache.lookup(&qname_key, question.qtype) {
                cached.id = query.id;
                cached.replace_tsig(&query);
                let _ = self.socket.send_to(&cached.encode(), src).await;
                tracing::info!("-> #{:#06x} served from cache.", query.id);
                return;
            }
        }

        // 规则只作用于 A / AAAA，其余类型绕开引擎按原始字节直透
        let outcome = if matches!(question.qtype, QTYPE_A | QTYPE_AAAA) {
            let rules = self.shared.rules.load();
            rules.resolve(&qname_key, question.qtype, &self.shared.defaults)
        } else {
            let mut outcome = RuleOutcome::passthrough(&self.shared.defaults, question.qtype);
            outcome.mutate = false;
            outcome
        };

        if let Err(e) = self.dispatch(&data, &query, &question, &qname_key, outcome, src).await {
            self.handle_failure(e, &query, src).await;
        }
    }

    async fn dispatch(
        &self,
        raw: &[u8],
        query: &DnsMessage,
        question: &Question,
        qname_key: &str,
        outcome: RuleOutcome,
        src: SocketAddr,
    ) -> Result<(), CoreError> {
        match &outcome.action {
            RuleAction::Synthesize(ip) => {
                let record = Record::from_ip(question.name.clone(), SYNTHETIC_TTL, *ip);
                let reply = query.clone().into_answer(vec![record], RCODE_NOERROR);
                self.send_reply(&reply.encode(), src).await?;
                self.cache_insert(qname_key, question.qtype, reply);
                Ok(())
            }
            RuleAction::Redirect(rewritten) => {
                // useHttpQuery 只定义在 A 记录上
                if outcome.use_http && outcome.effective_type == QTYPE_A {
                    self.answer_via_http(query, question, qname_key, rewritten, &outcome, src).await
                } else {
                    self.answer_via_redirect(query, question, qname_key, rewritten, &outcome, src)
                        .await
                }
            }
            RuleAction::Passthrough => {
                if outcome.use_http && outcome.effective_type == QTYPE_A {
                    self.answer_via_http(query, question, qname_key, &question.name, &outcome, src)
                        .await
                } else {
                    self.forward(raw, query, question, qname_key, &outcome, src).await
                }
            }
        }
    }

    /// Plain forward through the shared exchange. The original buffer goes
    /// out untouched unless the rule changed the record type or asked for
    /// the mutated encoding.
    async fn forward(
        &self,
        raw: &[u8],
        query: &DnsMessage,
        question: &Question,
        qname_key: &str,
        outcome: &RuleOutcome,
        src: SocketAddr,
    ) -> Result<(), CoreError> {
        let payload: Vec<u8> = if outcome.effective_type != question.qtype || outcome.mutate {
            let mut outbound = query.clone();
            outbound.questions[0].qtype = outcome.effective_type;
            if outcome.mutate {
                outbound.encode_mutated()
            } else {
                outbound.encode()
            }
        } else {
            raw.to_vec()
        };

        let response = self
            .exchange
            .exchange(&payload, query.id, outcome.upstream, src, outcome.timeout)
            .await?;
        self.send_reply(&response, src).await?;
        if let Ok(parsed) = DnsMessage::parse(&response) {
            self.cache_insert(qname_key, question.qtype, parsed);
        }
        Ok(())
    }

    /// Rewritten lookup on a short-lived client socket; answers are carried
    /// back under the name the client actually asked about.
    async fn answer_via_redirect(
        &self,
        query: &DnsMessage,
        question: &Question,
        qname_key: &str,
        rewritten: &str,
        outcome: &RuleOutcome,
        src: SocketAddr,
    ) -> Result<(), CoreError> {
        if outcome.upstream.ip().is_loopback() && outcome.upstream.port() == self.addr.port() {
            return Err(CoreError::InfiniteForwarding(outcome.upstream));
        }
        let mut outbound = query.clone();
        outbound.questions[0].name = rewritten.to_string();
        outbound.questions[0].qtype = outcome.effective_type;
        let payload = if outcome.mutate { outbound.encode_mutated() } else { outbound.encode() };

        let raw_response = query_once(outcome.upstream, &payload, outcome.timeout).await?;
        let upstream_msg = DnsMessage::parse(&raw_response)?;

        let mut reply = query.clone();
        reply.flags.qr = true;
        reply.flags.ra = true;
        reply.flags.rcode = upstream_msg.flags.rcode;
        reply.answers = upstream_msg
            .answers
            .into_iter()
            .map(|mut record| {
                if record.name.eq_ignore_ascii_case(rewritten) {
                    record.name = question.name.clone();
                }
                record
            })
            .collect();
        self.send_reply(&reply.encode(), src).await?;
        self.cache_insert(qname_key, question.qtype, reply);
        Ok(())
    }

    async fn answer_via_http(
        &self,
        query: &DnsMessage,
        question: &Question,
        qname_key: &str,
        lookup_name: &str,
        outcome: &RuleOutcome,
        src: SocketAddr,
    ) -> Result<(), CoreError> {
        let answer = self
            .shared
            .http
            .resolve_a(outcome.upstream.ip(), lookup_name, outcome.timeout)
            .await?;
        let reply = match answer {
            HttpAnswer::Records { ips, ttl } => {
                let records = ips
                    .into_iter()
                    .map(|ip| Record::a(question.name.clone(), ttl, ip))
                    .collect();
                query.clone().into_answer(records, RCODE_NOERROR)
            }
            HttpAnswer::NxDomain => query.clone().into_answer(Vec::new(), RCODE_NXDOMAIN),
        };
        self.send_reply(&reply.encode(), src).await?;
        self.cache_insert(qname_key, question.qtype, reply);
        Ok(())
    }

    async fn send_reply(&self, payload: &[u8], src: SocketAddr) -> Result<(), CoreError> {
        self.socket.send_to(payload, src).await?;
        Ok(())
    }

    fn cache_insert(&self, qname_key: &str, qtype: u16, message: DnsMessage) {
        if self.shared.cache_response {
            self.shared.cache.insert(qname_key, qtype, message, self.shared.cache_age);
        }
    }

    async fn handle_failure(&self, err: CoreError, query: &DnsMessage, src: SocketAddr) {
        match err {
            CoreError::InfiniteForwarding(target) => {
                tracing::warn!(
                    "[agent] #{:#06x} would forward to our own endpoint {}, answering SERVFAIL",
                    query.id,
                    target
                );
                self.send_failure(query, src).await;
            }
            CoreError::UpstreamUnreachable(target) => {
                tracing::warn!("[agent] Upstream {} unreachable for #{:#06x}, answering SERVFAIL", target, query.id);
                self.send_failure(query, src).await;
            }
            CoreError::HttpResolve(reason) => {
                tracing::warn!("[agent] Remote resolve failed for #{:#06x}: {}", query.id, reason);
                self.send_failure(query, src).await;
            }
            // 超时不回包，客户端会按自己的解析超时重试
            CoreError::Timeout(target, timeout) => {
                tracing::warn!(
                    "[agent] Query #{:#06x} to {} timed out after {:?}",
                    query.id,
                    target,
                    timeout
                );
            }
            CoreError::Superseded(id) => {
                tracing::debug!("[agent] Transaction {:#06x} superseded, dropping", id);
            }
            CoreError::Parse(reason) => {
                tracing::error!("[agent] Unusable upstream response for #{:#06x}: {}", query.id, reason);
            }
            CoreError::Socket(e) => {
                tracing::error!("[agent] Socket error while serving #{:#06x}: {}", query.id, e);
            }
            CoreError::Unauthorized(ip) => {
                tracing::warn!("[agent] Unauthorized client {}, answering REFUSED", ip);
                DNS_REFUSED_TOTAL.inc();
                let refused = query.clone().into_answer(Vec::new(), RCODE_REFUSED);
                let _ = self.socket.send_to(&refused.encode(), src).await;
            }
        }
    }

    async fn send_failure(&self, query: &DnsMessage, src: SocketAddr) {
        let reply = query.clone().into_answer(Vec::new(), RCODE_SERVFAIL);
        let _ = self.socket.send_to(&reply.encode(), src).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acl::NetworkWhitelist;
    use crate::cache::ResponseCache;
    use crate::config::RawRule;
    use crate::httpdns::HttpResolver;
    use crate::message::{HeaderFlags, QCLASS_IN, RData};
    use crate::rules::{ResolveDefaults, RuleSet};
    use arc_swap::ArcSwap;
    use std::net::Ipv4Addr;
    use std::time::Duration;

    fn raw_rule(pattern: &str, address: Option<&str>) -> RawRule {
        RawRule {
            pattern: pattern.to_string(),
            address: address.map(str::to_string),
            name_server: None,
            use_http_query: None,
            query_timeout: None,
            compression_mutation: None,
            force_aaaa: None,
        }
    }

    fn shared_state(
        upstream: SocketAddr,
        rules: RuleSet,
        whitelist: Option<&[String]>,
        cache_age: u32,
        timeout: Duration,
    ) -> Arc<SharedState> {
        Arc::new(SharedState {
            cache: ResponseCache::new(),
            rules: ArcSwap::from_pointee(rules),
            whitelist: NetworkWhitelist::from_config(whitelist),
            http: HttpResolver::new(),
            defaults: ResolveDefaults {
                local: upstream,
                world: upstream,
                use_http: false,
                timeout,
                mutate: false,
            },
            cache_response: true,
            cache_age,
        })
    }

    async fn start_agent(shared: Arc<SharedState>) -> SocketAddr {
        let agent = Arc::new(
            Agent::bind("127.0.0.1:0".parse().unwrap(), shared).await.expect("agent bind"),
        );
        let addr = agent.local_addr();
        agent.run();
        addr
    }

    /// Answers every A query with one record for the name it was asked.
    async fn spawn_dns_upstream(ttl: u32, ip: Ipv4Addr) -> SocketAddr {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 1024];
            loop {
                let Ok((n, from)) = socket.recv_from(&mut buf).await else { break };
                if let Ok(query) = DnsMessage::parse(&buf[..n]) {
                    let name = query.questions[0].name.clone();
                    let reply =
                        query.into_answer(vec![Record::a(name, ttl, ip)], RCODE_NOERROR);
                    let _ = socket.send_to(&reply.encode(), from).await;
                }
            }
        });
        addr
    }

    async fn spawn_silent_upstream() -> SocketAddr {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 1024];
            loop {
                if socket.recv_from(&mut buf).await.is_err() {
                    break;
                }
            }
        });
        addr
    }

    async fn ask(agent: SocketAddr, id: u16, name: &str, qtype: u16) -> Option<DnsMessage> {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        socket.connect(agent).await.unwrap();
        let query = DnsMessage {
            id,
            flags: HeaderFlags { rd: true, ..Default::default() },
            questions: vec![Question { name: name.to_string(), qtype, qclass: QCLASS_IN }],
            ..Default::default()
        };
        socket.send(&query.encode()).await.unwrap();
        let mut buf = [0u8; 1024];
        match tokio::time::timeout(Duration::from_millis(700), socket.recv(&mut buf)).await {
            Ok(Ok(n)) => Some(DnsMessage::parse(&buf[..n]).expect("parse reply")),
            _ => None,
        }
    }

    #[tokio::test]
    async fn synthetic_rule_answers_directly() {
        let upstream = spawn_silent_upstream().await;
        let rules = RuleSet::compile(vec![raw_rule("^ads\\.evil\\.com$", Some("0.0.0.0"))]);
        let agent =
            start_agent(shared_state(upstream, rules, None, 0, Duration::from_secs(1))).await;

        let reply = ask(agent, 0x4242, "ADS.evil.com", QTYPE_A).await.expect("reply");
        assert_eq!(reply.id, 0x4242);
        assert_eq!(reply.flags.rcode, RCODE_NOERROR);
        assert!(reply.flags.qr);
        assert_eq!(reply.answers.len(), 1);
        // 合成答案保留请求里的大小写
        assert_eq!(reply.answers[0].name, "ADS.evil.com");
        assert_eq!(reply.answers[0].ttl, SYNTHETIC_TTL);
        assert_eq!(reply.answers[0].rdata, RData::A(Ipv4Addr::new(0, 0, 0, 0)));
    }

    #[tokio::test]
    async fn whitelist_denial_answers_refused() {
        let upstream = spawn_dns_upstream(300, Ipv4Addr::new(1, 2, 3, 4)).await;
        let nets = vec!["10.0.0.0/8".to_string()];
        let agent = start_agent(shared_state(
            upstream,
            RuleSet::empty(),
            Some(&nets),
            0,
            Duration::from_secs(1),
        ))
        .await;

        let reply = ask(agent, 0x0001, "example.com", QTYPE_A).await.expect("reply");
        assert_eq!(reply.flags.rcode, RCODE_REFUSED);
        assert!(reply.answers.is_empty());
    }

    #[tokio::test]
    async fn forwarded_answer_is_cached_and_served_with_new_txid() {
        let upstream = spawn_dns_upstream(300, Ipv4Addr::new(9, 8, 7, 6)).await;
        let agent = start_agent(shared_state(
            upstream,
            RuleSet::empty(),
            None,
            60,
            Duration::from_secs(1),
        ))
        .await;

        let first = ask(agent, 0x1111, "cached.example", QTYPE_A).await.expect("first reply");
        assert_eq!(first.id, 0x1111);
        assert_eq!(first.answers.len(), 1);

        let second = ask(agent, 0x2222, "cached.example", QTYPE_A).await.expect("second reply");
        assert_eq!(second.id, 0x2222);
        assert!(!second.answers.is_empty());
        assert_eq!(second.answers[0].rdata, RData::A(Ipv4Addr::new(9, 8, 7, 6)));
    }

    #[tokio::test]
    async fn rewrite_rule_queries_upstream_under_the_new_name() {
        let upstream = spawn_dns_upstream(120, Ipv4Addr::new(5, 5, 5, 5)).await;
        let rules = RuleSet::compile(vec![raw_rule("^(.+)\\.cn$", Some("{1}.cn.mirror"))]);
        let shared = shared_state(upstream, rules, None, 0, Duration::from_secs(1));
        let agent = start_agent(shared).await;

        let reply = ask(agent, 0x3333, "foo.cn", QTYPE_A).await.expect("reply");
        assert_eq!(reply.flags.rcode, RCODE_NOERROR);
        assert_eq!(reply.answers.len(), 1);
        // 答案挂回客户端询问的原名下
        assert_eq!(reply.answers[0].name, "foo.cn");
        assert_eq!(reply.answers[0].rdata, RData::A(Ipv4Addr::new(5, 5, 5, 5)));
    }

    #[tokio::test]
    async fn forwarding_to_our_own_endpoint_fails_servfail() {
        // 默认上游指回 agent 自己的监听端口
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        let shared = shared_state(addr, RuleSet::empty(), None, 0, Duration::from_secs(1));
        let agent = Arc::new(Agent {
            addr,
            socket: Arc::new(socket),
            exchange: UpstreamExchange::bind(addr.port()).await.unwrap(),
            shared,
        });
        agent.run();

        let reply = ask(addr, 0x5555, "loop.example", QTYPE_A).await.expect("reply");
        assert_eq!(reply.flags.rcode, RCODE_SERVFAIL);
        assert!(reply.answers.is_empty());
    }

    #[tokio::test]
    async fn upstream_timeout_leaves_the_client_without_a_reply() {
        let upstream = spawn_silent_upstream().await;
        let agent = start_agent(shared_state(
            upstream,
            RuleSet::empty(),
            None,
            0,
            Duration::from_millis(200),
        ))
        .await;

        let reply = ask(agent, 0x6666, "silent.example", QTYPE_A).await;
        assert!(reply.is_none());
    }
}
