use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use wrt_scan_rs::coordinator::{EngineConfig, ScanCoordinator};
use wrt_scan_rs::error::{ProbeFailure, ScanError};
use wrt_scan_rs::probe::{Credential, ProbeConnection, Prober, StaticCredentials};
use wrt_scan_rs::publisher::{EventPublisher, Subscription};
use wrt_scan_rs::reconciler::Reconciler;
use wrt_scan_rs::targets::{parse_targets_str, Target};
use wrt_scan_rs::types::{ProbeStatus, ScanEvent, SessionState};

/// Test prober: hosts starting with `down` refuse, hosts starting with `slow`
/// wait for `gate`, everything else sleeps briefly and accepts `root:secret`.
#[derive(Default)]
struct MockProber {
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    gate: CancellationToken,
}

struct MockConnection;

#[async_trait]
impl Prober for MockProber {
    async fn connect(&self, target: &Target) -> Result<Box<dyn ProbeConnection>, ProbeFailure> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let host = target.as_str();
        if host.starts_with("slow") {
            self.gate.cancelled().await;
        } else {
            let jitter = host.bytes().map(u64::from).sum::<u64>() % 4;
            tokio::time::sleep(Duration::from_millis(1 + jitter)).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if host.starts_with("down") {
            return Err(ProbeFailure::Refused("connection refused".into()));
        }
        Ok(Box::new(MockConnection))
    }
}

#[async_trait]
impl ProbeConnection for MockConnection {
    fn identification(&self) -> Option<String> {
        Some("OpenWrt 23.05.3".into())
    }

    async fn try_credential(&mut self, credential: &Credential) -> Result<bool, ProbeFailure> {
        Ok(credential.username == "root" && credential.password == "secret")
    }
}

fn engine(prober: Arc<MockProber>) -> ScanCoordinator {
    ScanCoordinator::new(
        EngineConfig::default(),
        EventPublisher::new(),
        prober,
        Arc::new(StaticCredentials(vec![
            Credential::new("root", "admin"),
            Credential::new("root", "secret"),
        ])),
    )
}

/// Collect events until the session reports `scanning: false`.
async fn drain_session(sub: &mut Subscription) -> Vec<ScanEvent> {
    let mut out = Vec::new();
    timeout(Duration::from_secs(10), async {
        while let Some(ev) = sub.recv().await {
            let done = matches!(ev, ScanEvent::Status(s) if !s.scanning);
            out.push(ev);
            if done {
                break;
            }
        }
    })
    .await
    .expect("session did not complete in time");
    out
}

#[tokio::test]
async fn duplicate_lines_dedupe_and_concurrency_is_bounded() {
    let parsed = parse_targets_str("10.0.0.1\n10.0.0.1\n10.0.0.2");
    let names: Vec<&str> = parsed.targets.iter().map(Target::as_str).collect();
    assert_eq!(names, vec!["10.0.0.1", "10.0.0.2"]);

    let prober = Arc::new(MockProber::default());
    let engine = engine(prober.clone());
    let mut sub = engine.subscribe();
    let many: String = (1..=60).map(|i| format!("10.0.1.{i}\n")).collect();
    engine.start(parse_targets_str(&many).targets, 2).unwrap();
    drain_session(&mut sub).await;

    assert!(prober.max_in_flight.load(Ordering::SeqCst) <= 2);
    assert_eq!(prober.in_flight.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn every_target_gets_exactly_one_terminal_record() {
    let prober = Arc::new(MockProber::default());
    let engine = engine(prober.clone());
    let mut sub = engine.subscribe();

    let input: String = (0..150)
        .map(|i| if i % 3 == 0 { format!("down{i}.lan\n") } else { format!("dev{i}.lan\n") })
        .collect();
    let targets = parse_targets_str(&input).targets;
    let ticket = engine.start(targets.clone(), 8).unwrap();
    assert_eq!(ticket.workers, 8);

    let events = drain_session(&mut sub).await;
    assert!(prober.max_in_flight.load(Ordering::SeqCst) <= 8);

    // Stream view.
    let mut terminal_by_address: HashMap<String, usize> = HashMap::new();
    let mut reconciler = Reconciler::new();
    for ev in events {
        if let ScanEvent::Result(r) = &ev {
            if r.status.is_terminal() {
                *terminal_by_address.entry(r.address.clone()).or_default() += 1;
            }
        }
        reconciler.apply(ev);
    }
    assert_eq!(terminal_by_address.len(), targets.len());
    assert!(terminal_by_address.values().all(|&n| n == 1));
    assert_eq!(reconciler.table().len(), targets.len());
    assert_eq!(reconciler.table().count(ProbeStatus::Pending), 0);

    // Server-side view agrees and ids are 1..=n.
    let rows = engine.results();
    let ids: Vec<u64> = rows.iter().map(|r| r.id).collect();
    assert_eq!(ids, (1..=targets.len() as u64).collect::<Vec<_>>());
    let ok = rows.iter().filter(|r| r.status == ProbeStatus::Success).count();
    assert_eq!(ok, 100);
    assert!(rows
        .iter()
        .filter(|r| r.address.starts_with("down"))
        .all(|r| r.details == "connection-refused"));
    let snap = engine.snapshot();
    assert_eq!(snap.state, SessionState::Completed);
    assert_eq!(snap.finalized, 150);
    assert_eq!(snap.succeeded, 100);
}

#[tokio::test]
async fn pending_then_success_reconciles_to_one_row() {
    let prober = Arc::new(MockProber::default());
    let engine = engine(prober);
    let mut sub = engine.subscribe();
    engine.start(parse_targets_str("router.lan").targets, 1).unwrap();
    let events = drain_session(&mut sub).await;

    let kinds: Vec<String> = events
        .iter()
        .map(|e| match e {
            ScanEvent::Status(s) => format!("status:{}", s.scanning),
            ScanEvent::Result(r) => format!("{}:{}", r.id, r.status),
        })
        .collect();
    assert_eq!(kinds, vec!["status:true", "1:pending", "1:success", "status:false"]);

    let mut reconciler = Reconciler::new();
    events.into_iter().for_each(|e| reconciler.apply(e));
    let rows = reconciler.table().rows();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].status, ProbeStatus::Success);
    assert_eq!(rows[0].username, "root");
    assert_eq!(rows[0].password, "secret");
    assert_eq!(rows[0].details, "OpenWrt 23.05.3");
}

#[tokio::test]
async fn start_while_running_is_session_busy() {
    let prober = Arc::new(MockProber::default());
    let engine = engine(prober.clone());
    let mut sub = engine.subscribe();
    engine.start(parse_targets_str("slow1.lan\nslow2.lan").targets, 2).unwrap();

    let err = engine
        .start(parse_targets_str("10.9.9.9").targets, 1)
        .unwrap_err();
    assert_eq!(err, ScanError::SessionBusy("running"));
    let snap = engine.snapshot();
    assert_eq!(snap.total, 2);
    assert_eq!(snap.state, SessionState::Running);

    engine.stop();
    let err = engine.start(parse_targets_str("10.9.9.9").targets, 1).unwrap_err();
    assert_eq!(err, ScanError::SessionBusy("stopping"));

    prober.gate.cancel();
    drain_session(&mut sub).await;
    let addresses: Vec<String> = engine.results().into_iter().map(|r| r.address).collect();
    assert_eq!(addresses, vec!["slow1.lan", "slow2.lan"]);

    // A finished session no longer blocks a new one, and its rows are replaced.
    engine.start(parse_targets_str("10.9.9.9").targets, 1).unwrap();
    drain_session(&mut sub).await;
    let rows = engine.results();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].id, 1);
    assert_eq!(rows[0].address, "10.9.9.9");
}

#[tokio::test]
async fn stop_finalizes_in_flight_attempts_as_cancelled() {
    let prober = Arc::new(MockProber::default());
    let engine = engine(prober.clone());
    let mut sub = engine.subscribe();
    let input = "down1.lan\ndown2.lan\nslow1.lan\nslow2.lan\nslow3.lan";
    engine.start(parse_targets_str(input).targets, 5).unwrap();

    // Wait for the two quick targets to finalize.
    let mut seen = Vec::new();
    let mut finalized = 0;
    timeout(Duration::from_secs(5), async {
        while finalized < 2 {
            let ev = sub.recv().await.expect("publisher alive");
            if let ScanEvent::Result(r) = &ev {
                if r.status.is_terminal() {
                    finalized += 1;
                }
            }
            seen.push(ev);
        }
    })
    .await
    .expect("quick targets did not finalize");

    assert_eq!(engine.stop(), SessionState::Stopping);
    assert_eq!(engine.stop(), SessionState::Stopping);
    prober.gate.cancel();
    seen.extend(drain_session(&mut sub).await);

    let mut reconciler = Reconciler::new();
    let mut scanning_false = 0;
    for ev in &seen {
        if matches!(ev, ScanEvent::Status(s) if !s.scanning) {
            scanning_false += 1;
        }
        reconciler.apply(ev.clone());
    }
    assert_eq!(scanning_false, 1);
    assert!(matches!(seen.last(), Some(ScanEvent::Status(s)) if !s.scanning));

    let rows = reconciler.table().rows();
    assert_eq!(rows.len(), 5);
    for r in rows {
        assert_eq!(r.status, ProbeStatus::Failed);
        if r.address.starts_with("slow") {
            assert_eq!(r.details, "cancelled");
        } else {
            assert_eq!(r.details, "connection-refused");
        }
    }
    assert_eq!(engine.state(), SessionState::Completed);
    assert_eq!(engine.stop(), SessionState::Completed);
}

#[tokio::test]
async fn queued_targets_after_stop_are_cancelled_without_probing() {
    let prober = Arc::new(MockProber::default());
    let engine = engine(prober.clone());
    let mut sub = engine.subscribe();
    let input = "slow1.lan\nq1.lan\nq2.lan\nq3.lan";
    engine.start(parse_targets_str(input).targets, 1).unwrap();

    // Worker is parked on slow1; the other three are still queued.
    timeout(Duration::from_secs(5), async {
        loop {
            if let Some(ScanEvent::Result(r)) = sub.recv().await {
                if r.address == "slow1.lan" {
                    break;
                }
            }
        }
    })
    .await
    .unwrap();
    engine.stop();
    prober.gate.cancel();
    drain_session(&mut sub).await;

    let rows = engine.results();
    assert_eq!(rows.len(), 4);
    assert!(rows.iter().all(|r| r.details == "cancelled"));
    // Only slow1 ever reached the prober.
    assert_eq!(prober.max_in_flight.load(Ordering::SeqCst), 1);
}
