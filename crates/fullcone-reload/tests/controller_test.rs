//! Integration tests for the debounced reload loop
//!
//! The reload action is a hand-written fake so tests can count invocations
//! and make the proxy "fail" on demand. Timers run on tokio's paused clock.

use async_trait::async_trait;
use fullcone_proto::{ConfigSnapshot, ForwardRule};
use fullcone_reload::{
    AtomicWriter, NginxRenderer, ReloadAction, ReloadController, ReloadError, ReloadSettings,
    ReloadStatus,
};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};

#[derive(Clone, Default)]
struct FakeReload {
    calls: Arc<AtomicUsize>,
    fail: Arc<AtomicBool>,
}

impl FakeReload {
    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn set_failing(&self, failing: bool) {
        self.fail.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl ReloadAction for FakeReload {
    async fn apply(&self) -> Result<(), ReloadError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(ReloadError::Failed {
                command: "nginx -s reload".to_string(),
                status: "exit status: 1".to_string(),
                stderr: "nginx: [emerg] bind() failed".to_string(),
            });
        }
        Ok(())
    }

    fn describe(&self) -> String {
        "fake reload".to_string()
    }
}

fn snapshot(ports: impl IntoIterator<Item = u16>) -> Arc<ConfigSnapshot> {
    Arc::new(ConfigSnapshot::new(
        ports
            .into_iter()
            .map(|port| ForwardRule {
                listen: format!("203.0.113.7:{}", port).parse().unwrap(),
                target: format!("192.168.25.44:{}", port).parse().unwrap(),
            })
            .collect(),
    ))
}

struct Harness {
    tx: watch::Sender<Arc<ConfigSnapshot>>,
    status: watch::Receiver<ReloadStatus>,
    reload: FakeReload,
    conf: PathBuf,
    task: JoinHandle<ReloadStatus>,
    _dir: TempDir,
}

impl Harness {
    fn start() -> Self {
        let dir = TempDir::new().unwrap();
        let conf = dir.path().join("fullcone.conf");
        let reload = FakeReload::default();

        let controller = ReloadController::new(
            NginxRenderer::new("proxy_timeout 1h;"),
            AtomicWriter::new(&conf),
            reload.clone(),
            ReloadSettings::default(),
        );
        let status = controller.status();
        let (tx, rx) = watch::channel(snapshot([]));
        let task = tokio::spawn(controller.run(rx));

        Self {
            tx,
            status,
            reload,
            conf,
            task,
            _dir: dir,
        }
    }

    async fn wait_for(&mut self, f: impl FnMut(&ReloadStatus) -> bool) -> ReloadStatus {
        timeout(Duration::from_secs(600), self.status.wait_for(f))
            .await
            .expect("controller did not reach the expected state")
            .unwrap()
            .clone()
    }

    fn contents(&self) -> String {
        std::fs::read_to_string(&self.conf).unwrap()
    }

    async fn finish(self) -> ReloadStatus {
        drop(self.tx);
        self.task.await.unwrap()
    }
}

#[tokio::test(start_paused = true)]
async fn test_startup_cycle_runs_once() {
    let mut harness = Harness::start();

    let status = harness.wait_for(|s| s.applied == 1).await;
    assert_eq!(status.live_rules, 0);
    assert_eq!(harness.contents(), "# generated by fullcone; do not edit\n");

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(harness.reload.calls(), 1);

    let status = harness.finish().await;
    assert_eq!(status.applied, 1);
    assert_eq!(status.failures, 0);
}

#[tokio::test(start_paused = true)]
async fn test_burst_of_signals_reloads_once() {
    let mut harness = Harness::start();
    harness.wait_for(|s| s.applied == 1).await;

    for n in 1..=20u16 {
        harness.tx.send_replace(snapshot(40000..40000 + n));
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let status = harness.wait_for(|s| s.applied == 2).await;
    assert_eq!(status.live_rules, 20);
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(harness.reload.calls(), 2);
    assert_eq!(harness.contents().lines().count(), 21);

    harness.finish().await;
}

#[tokio::test(start_paused = true)]
async fn test_unchanged_snapshot_skips_reload() {
    let mut harness = Harness::start();
    harness.tx.send_replace(snapshot([40000]));
    harness.wait_for(|s| s.applied == 1).await;

    // Same rules in a new allocation: rendered document is identical
    harness.tx.send_replace(snapshot([40000]));
    let status = harness.wait_for(|s| s.unchanged == 1).await;
    assert_eq!(status.applied, 1);
    assert_eq!(harness.reload.calls(), 1);

    harness.finish().await;
}

#[tokio::test(start_paused = true)]
async fn test_steady_signals_cannot_defer_forever() {
    let mut harness = Harness::start();
    harness.wait_for(|s| s.applied == 1).await;

    let tx = harness.tx.clone();
    let started = Instant::now();
    let sender = tokio::spawn(async move {
        for n in 1..=100u16 {
            tx.send_replace(snapshot(40000..40000 + n));
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    });

    harness.wait_for(|s| s.applied == 2).await;
    let waited = started.elapsed();
    assert!(waited >= Duration::from_secs(2));
    assert!(waited < Duration::from_secs(3));

    sender.await.unwrap();
    harness.finish().await;
}

#[tokio::test(start_paused = true)]
async fn test_failed_reload_retries_with_backoff() {
    let mut harness = Harness::start();
    harness.wait_for(|s| s.applied == 1).await;

    harness.reload.set_failing(true);
    harness.tx.send_replace(snapshot([40000]));

    let first = harness.wait_for(|s| s.failures == 1).await;
    let failed_at = Instant::now();
    assert_eq!(first.consecutive_failures, 1);
    assert_eq!(first.live_rules, 0);
    assert!(first
        .last_error
        .as_deref()
        .is_some_and(|e| e.contains("bind() failed")));

    // Retried on its own after the initial backoff, then after a doubled one
    harness.wait_for(|s| s.failures == 2).await;
    assert!(failed_at.elapsed() >= Duration::from_secs(1));
    harness.wait_for(|s| s.failures == 3).await;
    assert!(failed_at.elapsed() >= Duration::from_secs(3));

    harness.reload.set_failing(false);
    let status = harness.wait_for(|s| s.applied == 2).await;
    assert_eq!(status.consecutive_failures, 0);
    assert_eq!(status.live_rules, 1);
    assert!(status.last_error.is_none());

    // Backoff was reset; nothing more to do
    let calls = harness.reload.calls();
    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(harness.reload.calls(), calls);

    harness.finish().await;
}

#[tokio::test(start_paused = true)]
async fn test_signals_during_backoff_fold_into_retry() {
    let mut harness = Harness::start();
    harness.wait_for(|s| s.applied == 1).await;

    harness.reload.set_failing(true);
    harness.tx.send_replace(snapshot([40000]));
    harness.wait_for(|s| s.failures == 1).await;
    let calls = harness.reload.calls();

    // Changes arriving inside the backoff window do not trigger extra reloads
    for n in 2..=5u16 {
        harness.tx.send_replace(snapshot(40000..40000 + n));
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert_eq!(harness.reload.calls(), calls);

    harness.reload.set_failing(false);
    let status = harness.wait_for(|s| s.applied == 2).await;
    assert_eq!(status.live_rules, 5);
    assert_eq!(harness.reload.calls(), calls + 1);

    harness.finish().await;
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_completes_pending_cycle() {
    let harness = Harness::start();
    harness.tx.send_replace(snapshot([40000, 40001]));

    let Harness {
        tx, task, conf, _dir, ..
    } = harness;
    drop(tx);
    let status = task.await.unwrap();

    assert_eq!(status.applied, 1);
    assert_eq!(status.live_rules, 2);
    assert!(std::fs::read_to_string(conf).unwrap().contains(":40001;"));
}
