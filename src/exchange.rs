//! Upstream exchange: the shared forwarding socket and its transaction demux.
//!
//! 转发套接字是长寿命的，成千上万个事务在它上面复用。发起方把
//! oneshot 发送端登记进 pending 表后写出报文；常驻的 reader 任务按响应
//! 前两个字节里的事务 id 摘下对应表项并把原始报文交还给等待的查询任务。
//! 事务 id 撞车时后来者直接顶掉前者（前者的等待端收到取消，客户端什么也
//! 看不到），保证表里每个 id 至多一个活事务、永不泄漏。

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::net::UdpSocket;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::error::CoreError;
use crate::metrics::{EXCHANGE_DURATION, EXCHANGE_TIMEOUTS_TOTAL};

const RECV_BUFFER_LEN: usize = 4096;

struct PendingExchange {
    client: SocketAddr,
    token: u64,
    done: oneshot::Sender<Vec<u8>>,
}

pub struct UpstreamExchange {
    sock4: Arc<UdpSocket>,
    /// IPv6 twin for v6 upstreams; absent when the host has no v6 stack.
    sock6: Option<Arc<UdpSocket>>,
    pending: Arc<Mutex<HashMap<u16, PendingExchange>>>,
    token_counter: AtomicU64,
    agent_port: u16,
    readers: Vec<JoinHandle<()>>,
}

impl UpstreamExchange {
    pub async fn bind(agent_port: u16) -> Result<Self, CoreError> {
        let sock4 = Arc::new(UdpSocket::bind(("0.0.0.0", 0)).await?);
        let sock6 = match UdpSocket::bind(("::", 0)).await {
            Ok(socket) => Some(Arc::new(socket)),
            Err(e) => {
                tracing::debug!("[exchange] No IPv6 forwarder socket: {}", e);
                None
            }
        };

        let pending: Arc<Mutex<HashMap<u16, PendingExchange>>> = Arc::new(Mutex::new(HashMap::new()));
        let mut readers = vec![spawn_reader(sock4.clone(), pending.clone())];
        if let Some(socket) = &sock6 {
            readers.push(spawn_reader(socket.clone(), pending.clone()));
        }

        Ok(Self {
            sock4,
            sock6,
            pending,
            token_counter: AtomicU64::new(1),
            agent_port,
            readers,
        })
    }

    /// One upstream round-trip: register, send, await the demuxed response
    /// or the deadline.
    pub async fn exchange(
        &self,
        payload: &[u8],
        txid: u16,
        target: SocketAddr,
        client: SocketAddr,
        timeout: Duration,
    ) -> Result<Vec<u8>, CoreError> {
        if target.ip().is_loopback() && target.port() == self.agent_port {
            return Err(CoreError::InfiniteForwarding(target));
        }

        let socket = match (&self.sock6, target.is_ipv6()) {
            (_, false) => &self.sock4,
            (Some(sock6), true) => sock6,
            (None, true) => {
                return Err(CoreError::Socket(io::Error::new(
                    io::ErrorKind::Unsupported,
                    "ipv6 upstream but no ipv6 forwarder socket",
                )))
            }
        };

        let token = self.token_counter.fetch_add(1, Ordering::Relaxed);
        let (done_tx, done_rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().unwrap();
            if let Some(old) = pending.insert(txid, PendingExchange { client, token, done: done_tx }) {
                tracing::warn!(
                    "[exchange] Transaction {:#06x} reused, dropping the older exchange for {}",
                    txid,
                    old.client
                );
            }
        }

        let started = Instant::now();
        if let Err(e) = socket.send_to(payload, target).await {
            self.remove_if_token(txid, token);
            return Err(map_send_error(e, target));
        }

        match tokio::time::timeout(timeout, done_rx).await {
            Ok(Ok(response)) => {
                EXCHANGE_DURATION
                    .with_label_values(&[&target.to_string()])
                    .observe(started.elapsed().as_secs_f64());
                Ok(response)
            }
            // 发送端被顶掉：这条事务已被同 id 的新查询取代
            Ok(Err(_)) => Err(CoreError::Superseded(txid)),
            Err(_) => {
                // 超时和"被顶掉后又超时"之间有一条窄缝：只有表项还是自己的
                // 那一个时才允许摘掉，免得误杀顶替者
                self.remove_if_token(txid, token);
                EXCHANGE_TIMEOUTS_TOTAL.with_label_values(&[&target.to_string()]).inc();
                Err(CoreError::Timeout(target, timeout))
            }
        }
    }

    fn remove_if_token(&self, txid: u16, token: u64) {
        let mut pending = self.pending.lock().unwrap();
        if pending.get(&txid).map(|e| e.token) == Some(token) {
            pending.remove(&txid);
        }
    }

    #[cfg(test)]
    fn pending_len(&self) -> usize {
        self.pending.lock().unwrap().len()
    }
}

impl Drop for UpstreamExchange {
    fn drop(&mut self) {
        for reader in &self.readers {
            reader.abort();
        }
    }
}

fn spawn_reader(
    socket: Arc<UdpSocket>,
    pending: Arc<Mutex<HashMap<u16, PendingExchange>>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut buf = vec![0u8; RECV_BUFFER_LEN];
        loop {
            match socket.recv_from(&mut buf).await {
                Ok((n, from)) => {
                    if n < 2 {
                        continue;
                    }
                    let txid = u16::from_be_bytes([buf[0], buf[1]]);
                    let entry = pending.lock().unwrap().remove(&txid);
                    match entry {
                        Some(waiting) => {
                            let _ = waiting.done.send(buf[..n].to_vec());
                        }
                        None => {
                            tracing::debug!(
                                "[exchange] Orphan response {:#06x} from {}",
                                txid,
                                from
                            );
                        }
                    }
                }
                Err(e)
                    if e.kind() == io::ErrorKind::ConnectionRefused
                        || e.kind() == io::ErrorKind::ConnectionReset =>
                {
                    // ICMP port unreachable 落在共享套接字上，无法归属到
                    // 具体事务，等对应事务自己超时
                    tracing::warn!("[exchange] Upstream port unreachable: {}", e);
                }
                Err(e) => {
                    // 关停时套接字被回收，读错误属于预期，静默退出
                    tracing::debug!("[exchange] Reader exiting: {}", e);
                    break;
                }
            }
        }
    })
}

fn map_send_error(e: io::Error, target: SocketAddr) -> CoreError {
    if e.kind() == io::ErrorKind::ConnectionRefused {
        CoreError::UpstreamUnreachable(target)
    } else {
        CoreError::Socket(e)
    }
}

/// Short-lived single exchange on its own ephemeral socket, used for
/// rule-rewritten lookups so they never collide with the shared demux.
pub async fn query_once(
    target: SocketAddr,
    payload: &[u8],
    timeout: Duration,
) -> Result<Vec<u8>, CoreError> {
    let bind_addr = if target.is_ipv6() { "[::]:0" } else { "0.0.0.0:0" };
    let socket = UdpSocket::bind(bind_addr).await?;
    socket.connect(target).await.map_err(|e| map_send_error(e, target))?;
    socket.send(payload).await.map_err(|e| map_send_error(e, target))?;
    let mut buf = vec![0u8; RECV_BUFFER_LEN];
    let n = tokio::time::timeout(timeout, socket.recv(&mut buf))
        .await
        .map_err(|_| CoreError::Timeout(target, timeout))?
        .map_err(|e| map_send_error(e, target))?;
    buf.truncate(n);
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    const CLIENT: &str = "192.0.2.10:33000";

    /// A fake upstream that answers every datagram by echoing the first two
    /// bytes followed by a fixed marker.
    async fn spawn_fake_upstream(marker: u8) -> SocketAddr {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 512];
            loop {
                let Ok((n, from)) = socket.recv_from(&mut buf).await else { break };
                if n < 2 {
                    continue;
                }
                let reply = [buf[0], buf[1], marker];
                let _ = socket.send_to(&reply, from).await;
            }
        });
        addr
    }

    async fn spawn_silent_upstream() -> SocketAddr {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 512];
            loop {
                if socket.recv_from(&mut buf).await.is_err() {
                    break;
                }
            }
        });
        addr
    }

    #[tokio::test]
    async fn loopback_to_own_port_is_rejected_synchronously() {
        let exchange = UpstreamExchange::bind(5533).await.unwrap();
        let target: SocketAddr = "127.0.0.1:5533".parse().unwrap();
        let err = exchange
            .exchange(&[0x00, 0x07], 7, target, CLIENT.parse().unwrap(), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::InfiniteForwarding(_)));
        assert_eq!(exchange.pending_len(), 0);
    }

    #[tokio::test]
    async fn response_is_demuxed_back_to_the_waiter() {
        let upstream = spawn_fake_upstream(0xAB).await;
        let exchange = UpstreamExchange::bind(53).await.unwrap();
        let reply = exchange
            .exchange(&[0x12, 0x34], 0x1234, upstream, CLIENT.parse().unwrap(), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(reply, vec![0x12, 0x34, 0xAB]);
        assert_eq!(exchange.pending_len(), 0);
    }

    #[tokio::test]
    async fn deadline_removes_the_transaction_without_a_reply() {
        let upstream = spawn_silent_upstream().await;
        let exchange = UpstreamExchange::bind(53).await.unwrap();
        let started = Instant::now();
        let err = exchange
            .exchange(&[0x00, 0x01], 1, upstream, CLIENT.parse().unwrap(), Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Timeout(..)));
        assert!(started.elapsed() >= Duration::from_millis(100));
        assert_eq!(exchange.pending_len(), 0);
    }

    #[tokio::test]
    async fn id_collision_cancels_the_older_exchange() {
        let silent = spawn_silent_upstream().await;
        let answering = spawn_fake_upstream(0xCD).await;
        let exchange = Arc::new(UpstreamExchange::bind(53).await.unwrap());

        let first = {
            let exchange = exchange.clone();
            tokio::spawn(async move {
                exchange
                    .exchange(
                        &[0x00, 0x07],
                        7,
                        silent,
                        "192.0.2.10:33001".parse().unwrap(),
                        Duration::from_secs(5),
                    )
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let second = exchange
            .exchange(&[0x00, 0x07], 7, answering, CLIENT.parse().unwrap(), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(second, vec![0x00, 0x07, 0xCD]);

        let err = first.await.unwrap().unwrap_err();
        assert!(matches!(err, CoreError::Superseded(7)));
        assert_eq!(exchange.pending_len(), 0);
    }

    #[tokio::test]
    async fn query_once_talks_on_its_own_socket() {
        let upstream = spawn_fake_upstream(0xEE).await;
        let reply = query_once(upstream, &[0x55, 0x66], Duration::from_secs(1)).await.unwrap();
        assert_eq!(reply, vec![0x55, 0x66, 0xEE]);
    }

    #[tokio::test]
    async fn query_once_times_out() {
        let upstream = spawn_silent_upstream().await;
        let err = query_once(upstream, &[0x01, 0x02], Duration::from_millis(80)).await.unwrap_err();
        assert!(matches!(err, CoreError::Timeout(..)));
    }
}
