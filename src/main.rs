//! DNSAgent Rust - a rule-driven DNS forwarding proxy

mod acl;
mod agent;
mod cache;
mod config;
mod error;
mod exchange;
mod httpdns;
mod message;
mod metrics;
mod rules;
mod supervisor;

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use chrono::Local;
use clap::Parser;
use rand::Rng;
use rolling_file::{RollingConditionBasic, RollingFileAppender};
use sha2::{Digest, Sha512};
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::rules::RuleSet;

// 自定义本地时间格式化器，解决日志默认输出 UTC 时间的问题
struct LocalTimer;
impl fmt::time::FormatTime for LocalTimer {
    fn format_time(&self, w: &mut fmt::format::Writer<'_>) -> std::fmt::Result {
        write!(w, "{}", Local::now().format("%Y-%m-%dT%H:%M:%S%.3f%:z"))
    }
}

#[derive(Parser, Debug)]
#[command(name = "dnsagent-rust")]
#[command(about = "A rule-driven DNS forwarding proxy", long_about = None)]
struct Args {
    /// Path to the options file
    #[arg(long, default_value = "options.json")]
    options: PathBuf,

    /// Path to the rules file (watched for changes)
    #[arg(long, default_value = "rules.json")]
    rules: PathBuf,
}

// 手动构建多核引擎：worker 线程数 1:1 绑定 CPU 核心数量
fn main() -> Result<()> {
    let cores = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(cores)
        .thread_name("dnsagent-worker")
        .enable_all()
        .build()?;

    runtime.block_on(async_main(cores))
}

async fn async_main(cores: usize) -> Result<()> {
    std::fs::create_dir_all("logs").unwrap_or_default();

    // 本地时区 00:00 准时切割的日志轮转器，保留最近 30 天
    let file_appender = RollingFileAppender::new(
        "logs/dnsagent.log",
        RollingConditionBasic::new().daily(),
        30,
    )?;
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().with_writer(non_blocking).with_ansi(false).with_timer(LocalTimer))
        .with(fmt::layer().with_writer(std::io::stdout).with_timer(LocalTimer))
        .init();

    let args = Args::parse();
    info!("Starting DNSAgent Rust version {}", env!("CARGO_PKG_VERSION"));
    info!(">>> Multi-core runtime enabled: {} worker threads", cores);

    let options = config::load_options(&args.options);
    if options.hide_on_start {
        // 控制台窗口的显隐是宿主 UI 的事，这里只认下这个字段
        tracing::debug!("hideOnStart is set but has no effect on this host");
    }
    let rule_set = RuleSet::compile(config::load_rules(&args.rules));
    info!(">>> Loaded {} rule(s) from {}", rule_set.len(), args.rules.display());

    let mut supervisor = supervisor::Supervisor::new(&options, rule_set);
    supervisor.start(&options.listen_on).await?;

    if let Some(metrics_addr) = options.metrics_on.clone() {
        metrics::spawn_exposition(metrics_addr);
    }

    // 规则文件监视：哈希轮询 + 抖动，变更后通过 watch channel 通知主循环
    let (reload_tx, mut reload_rx) = tokio::sync::watch::channel(false);
    let watcher = spawn_rules_watcher(args.rules.clone(), reload_tx);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl-C received, shutting down");
                break;
            }
            result = reload_rx.changed() => {
                if result.is_err() {
                    break;
                }
                info!("--- Reloading rules from {} ---", args.rules.display());
                let new_rules = RuleSet::compile(config::load_rules(&args.rules));
                supervisor.apply_rules(new_rules);
            }
        }
    }

    watcher.abort();
    supervisor.shutdown();
    Ok(())
}

fn spawn_rules_watcher(
    path: PathBuf,
    reload_tx: tokio::sync::watch::Sender<bool>,
) -> tokio::task::JoinHandle<()> {
    let interval = Duration::from_secs(10);
    let jitter = Duration::from_secs(3);

    tokio::spawn(async move {
        let mut current_hash = hash_file(&path).unwrap_or_default();
        loop {
            // 给轮询加抖动，免得多实例部署时在同一毫秒一起读盘
            let sleep_time = {
                let mut rng = rand::thread_rng();
                let j = rng.gen_range(0..=(jitter.as_millis() as u64 * 2));
                let j_offset = j as i64 - jitter.as_millis() as i64;
                if j_offset > 0 {
                    interval + Duration::from_millis(j_offset as u64)
                } else {
                    interval - Duration::from_millis(-j_offset as u64)
                }
            };
            tokio::time::sleep(sleep_time).await;

            // 文件暂时不存在不算错，出现后第一次哈希即触发重载
            if let Ok(new_hash) = hash_file(&path) {
                if new_hash != current_hash {
                    info!("[watcher] Rules file change detected! New SHA512: {}...", &new_hash[..16]);
                    current_hash = new_hash;
                    let _ = reload_tx.send(true);
                }
            }
        }
    })
}

fn hash_file(path: &Path) -> Result<String> {
    let content = std::fs::read(path)?;
    let mut hasher = Sha512::new();
    hasher.update(&content);
    Ok(hex::encode(hasher.finalize()))
}
