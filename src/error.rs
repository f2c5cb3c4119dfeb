//! Error kinds of the DNS transaction core.
//!
//! 每一个变体都对应一条固定的处理策略（丢弃 / Refused / ServFail / 仅告警），
//! 由 agent 的查询流水线统一执行，见 agent.rs。

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    /// Truncated, malformed or pointer-looped wire data. Dropped silently.
    #[error("malformed dns message: {0}")]
    Parse(&'static str),

    /// Client address not covered by the network whitelist. Answered REFUSED.
    #[error("client {0} is not in the network whitelist")]
    Unauthorized(IpAddr),

    /// Forwarding target is our own listening endpoint. Answered SERVFAIL.
    #[error("forwarding to {0} would loop back into this agent")]
    InfiniteForwarding(SocketAddr),

    /// ICMP port unreachable while talking to the upstream. Answered SERVFAIL.
    #[error("upstream {0} is unreachable")]
    UpstreamUnreachable(SocketAddr),

    /// No upstream response within the deadline. Logged, the client gets
    /// nothing and retries on its own resolver timeout.
    #[error("upstream {0} did not answer within {1:?}")]
    Timeout(SocketAddr, Duration),

    /// A later query reused our transaction id and evicted this exchange.
    /// The losing client sees nothing.
    #[error("transaction {0:#06x} was superseded by a newer query")]
    Superseded(u16),

    /// HTTP resolution failed (status, transport or body shape). SERVFAIL.
    #[error("http resolution failed: {0}")]
    HttpResolve(String),

    /// Any other socket error. Logged, query dropped.
    #[error("socket error: {0}")]
    Socket(#[from] std::io::Error),
}
