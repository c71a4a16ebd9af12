//! Capacity, idle eviction and lifecycle notification over the local transport.

mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use common::{Harness, PROMPT, TIMEOUT, limits, wait_until};
use termhost::prelude::*;
use termhost::session::SessionId;
use termhost::{REJECTION_MESSAGE, SessionManager};

// -----------------------------------------------------------------------------
// Capacity
// -----------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_capacity_rejects_third_session_until_one_closes() {
    let harness = Harness::new(limits(2, Duration::ZERO));

    let (mut a, a_task) = harness.open().await;
    let (mut b, _b_task) = harness.open().await;
    assert_eq!(harness.manager().session_count(), 2);

    a.send_line("echo from a");
    let output = a.read_until(PROMPT, TIMEOUT).await.unwrap();
    assert!(output.contains("from a\r\n"), "{output:?}");
    b.send_line("echo from b");
    let output = b.read_until(PROMPT, TIMEOUT).await.unwrap();
    assert!(output.contains("from b\r\n"), "{output:?}");

    let (mut c, c_task) = harness.connect();
    let rejected = c.read_to_end(TIMEOUT).await.unwrap();
    assert_eq!(rejected, REJECTION_MESSAGE);
    assert!(matches!(c_task.await.unwrap(), SessionOutcome::Rejected));
    assert_eq!(harness.manager().session_count(), 2);

    a.send_line("exit");
    a.read_to_end(TIMEOUT).await.unwrap();
    assert!(matches!(a_task.await.unwrap(), SessionOutcome::Completed(_)));
    assert_eq!(harness.manager().session_count(), 1);

    let (mut d, _d_task) = harness.open().await;
    d.send_line("echo admitted");
    let output = d.read_until(PROMPT, TIMEOUT).await.unwrap();
    assert!(output.contains("admitted"));

    // The rejected connection never opened a session.
    assert_eq!(harness.count(SessionEventKind::Opened), 3);
    assert_eq!(harness.count(SessionEventKind::Closed), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_connections_never_exceed_bound() {
    let harness = Harness::new(limits(5, Duration::ZERO));

    let mut sessions = Vec::new();
    for _ in 0..20 {
        sessions.push(harness.connect());
    }

    let settled = wait_until(TIMEOUT, || {
        sessions.iter().filter(|(_, task)| task.is_finished()).count() == 15
    })
    .await;
    assert!(settled, "rejected sessions should finish immediately");
    assert_eq!(harness.manager().session_count(), 5);
    assert_eq!(harness.manager().limiter().active(), 5);

    for (client, _) in &sessions {
        client.close();
    }
    let mut rejected = 0;
    for (_, task) in sessions {
        if matches!(task.await.unwrap(), SessionOutcome::Rejected) {
            rejected += 1;
        }
    }
    assert_eq!(rejected, 15);
    assert_eq!(harness.manager().limiter().active(), 0);
    assert_eq!(harness.count(SessionEventKind::Opened), 5);
    assert_eq!(harness.count(SessionEventKind::Closed), 5);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_limiter_under_load() {
    let manager = Arc::new(SessionManager::new(
        TransportKind::Local,
        limits(10, Duration::ZERO),
    ));
    let barrier = Arc::new(tokio::sync::Barrier::new(64));

    let mut tasks = Vec::new();
    for _ in 0..64 {
        let manager = manager.clone();
        let barrier = barrier.clone();
        tasks.push(tokio::spawn(async move {
            barrier.wait().await;
            let permit = manager.try_admit();
            assert!(manager.limiter().active() <= 10);
            tokio::time::sleep(Duration::from_millis(20)).await;
            permit.is_some()
        }));
    }

    let mut admitted = 0;
    for task in tasks {
        if task.await.unwrap() {
            admitted += 1;
        }
    }
    assert_eq!(admitted, 10);
    assert_eq!(manager.limiter().active(), 0);
}

// -----------------------------------------------------------------------------
// Idle eviction
// -----------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_idle_session_closed_after_timeout() {
    let harness = Harness::new(limits(0, Duration::from_secs(2)));

    let (mut idle, idle_task) = harness.open().await;
    idle.send_line("echo still here");
    idle.read_until(PROMPT, TIMEOUT).await.unwrap();
    let quiet_since = Instant::now();

    idle.read_to_end(Duration::from_secs(5)).await.unwrap();
    let waited = quiet_since.elapsed();
    assert!(waited >= Duration::from_millis(1900), "closed too early: {waited:?}");
    assert!(waited <= Duration::from_millis(3500), "closed too late: {waited:?}");

    assert!(idle.is_closed());
    assert!(matches!(idle_task.await.unwrap(), SessionOutcome::Completed(_)));
    assert_eq!(harness.manager().session_count(), 0);
    assert_eq!(harness.count(SessionEventKind::Closed), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_active_session_survives_eviction() {
    let harness = Harness::new(limits(0, Duration::from_secs(1)));
    let (mut busy, _busy_task) = harness.open().await;

    for _ in 0..6 {
        tokio::time::sleep(Duration::from_millis(400)).await;
        busy.send_line("echo tick");
        busy.read_until(PROMPT, TIMEOUT).await.unwrap();
    }

    assert!(!busy.is_closed());
    assert_eq!(harness.manager().session_count(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_resize_does_not_count_as_activity() {
    let harness = Harness::new(limits(0, Duration::from_secs(1)));
    let (mut client, _task) = harness.open().await;

    let resizes = async {
        for width in 81..90 {
            client.resize(width, 24);
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
    };
    resizes.await;

    client.read_to_end(TIMEOUT).await.unwrap();
    assert!(client.is_closed());
}

// -----------------------------------------------------------------------------
// Lifecycle notification
// -----------------------------------------------------------------------------

fn session_id(manager: &SessionManager) -> SessionId {
    manager.sessions().first().expect("one session").id
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_opened_precedes_closed() {
    let harness = Harness::new(limits(0, Duration::ZERO));
    let (mut client, task) = harness.open().await;
    let id = session_id(harness.manager());

    client.send_line("exit");
    task.await.unwrap();
    harness.flush();

    let kinds: Vec<_> = harness.log.events_for(id).iter().map(|e| e.kind).collect();
    assert_eq!(kinds, vec![SessionEventKind::Opened, SessionEventKind::Closed]);
    assert!(harness.log.events_for(id).iter().all(|e| e.transport == TransportKind::Local));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_racing_closes_notify_once() {
    let harness = Harness::new(limits(3, Duration::ZERO));
    let (client, task) = harness.open().await;
    let id = session_id(harness.manager());
    let connection = client.connection();

    let barrier = Arc::new(tokio::sync::Barrier::new(12));
    let mut closers = Vec::new();
    for i in 0..12 {
        let barrier = barrier.clone();
        let manager = harness.manager().clone();
        let connection = connection.clone();
        closers.push(tokio::spawn(async move {
            barrier.wait().await;
            if i % 2 == 0 {
                connection.close();
            } else {
                manager.close_session(id);
            }
        }));
    }
    for closer in closers {
        closer.await.unwrap();
    }
    client.close();
    task.await.unwrap();
    harness.flush();

    let closed = harness
        .log
        .events_for(id)
        .iter()
        .filter(|e| e.kind == SessionEventKind::Closed)
        .count();
    assert_eq!(closed, 1);
    assert_eq!(harness.manager().limiter().active(), 0);
    assert_eq!(harness.manager().session_count(), 0);
}

#[tokio::test]
async fn test_registry_failure_releases_capacity() {
    let harness = Harness::with_host(
        limits(1, Duration::ZERO),
        SessionHost::builder()
            .registry_factory(|| -> Result<CommandRegistry> {
                Err(Error::Registry("no commands today".to_string()))
            }),
    );

    for _ in 0..3 {
        let (mut client, task) = harness.connect();
        assert!(matches!(task.await.unwrap(), SessionOutcome::Failed(_)));
        client.read_to_end(TIMEOUT).await.unwrap();
    }

    assert_eq!(harness.manager().limiter().active(), 0);
    assert_eq!(harness.count(SessionEventKind::Opened), 3);
    assert_eq!(harness.count(SessionEventKind::Closed), 3);
}

struct Panicking;

#[async_trait]
impl Interpreter for Panicking {
    async fn run(
        &self,
        _registry: CommandRegistry,
        _connection: Arc<dyn Connection>,
        _settings: ShellSettings,
        _session_id: SessionId,
    ) -> Result<()> {
        panic!("interpreter bug");
    }
}

#[tokio::test]
async fn test_interpreter_panic_closes_session() {
    let harness = Harness::with_host(
        limits(1, Duration::ZERO),
        SessionHost::builder().interpreter(Arc::new(Panicking)),
    );

    let (client, task) = harness.connect();
    assert!(matches!(task.await.unwrap(), SessionOutcome::Failed(_)));
    assert!(client.is_closed());
    assert_eq!(harness.manager().limiter().active(), 0);
    assert_eq!(harness.count(SessionEventKind::Closed), 1);

    let (_client, task) = harness.connect();
    assert!(matches!(task.await.unwrap(), SessionOutcome::Failed(_)));
}

#[tokio::test]
async fn test_shutdown_closes_every_session() {
    let harness = Harness::new(limits(0, Duration::ZERO));
    let (mut a, _) = harness.open().await;
    let (mut b, _) = harness.open().await;

    let remaining = harness.manager().shutdown(TIMEOUT).await;
    assert_eq!(remaining, 0);
    a.read_to_end(TIMEOUT).await.unwrap();
    b.read_to_end(TIMEOUT).await.unwrap();
    assert_eq!(harness.count(SessionEventKind::Closed), 2);
    assert!(!harness.manager().is_running());
}
