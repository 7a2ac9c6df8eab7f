//! ==============================================================================
//! service.rs - single-writer authority task
//! ==============================================================================
//!
//! purpose:
//!     every document is owned by one task. callers hold a cloneable
//!     `AuthorityHandle` and submit units of work over a bounded channel;
//!     the task applies each unit, saves what changed, hands alerts to the
//!     sink and answers on a oneshot. units are therefore serialized without
//!     any file lock.
//!
//!     ┌──────────┐  Unit   ┌──────────────────────────────┐
//!     │ stdin    │ ──────> │ writer task (blocking thread)│
//!     │ ticker   │ ──────> │  apply -> save -> alerts     │ ──> AlertSink
//!     └──────────┘ <────── └──────────────────────────────┘
//!                 Response
//!
//! relationships:
//!     - used by: main.rs
//!     - uses: engine.rs (Authority), alert.rs (AlertSink)
//!
//! ==============================================================================

use crate::alert::AlertSink;
use crate::engine::{Authority, Outcome, Reply, Unit};
use crate::error::{Error, Result};
use crate::timestamp::Stamp;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// Answer to one submitted unit.
#[derive(Debug, Clone, Serialize)]
pub struct Response {
    pub reply: Reply,
    pub outcome: Outcome,
}

struct Request {
    unit: Unit,
    now: Stamp,
    respond: oneshot::Sender<Response>,
}

#[derive(Clone)]
pub struct AuthorityHandle {
    tx: mpsc::Sender<Request>,
}

impl AuthorityHandle {
    /// Submit a unit stamped with the current time.
    pub async fn submit(&self, unit: Unit) -> Result<Response> {
        self.submit_at(unit, Stamp::now()).await
    }

    pub async fn submit_at(&self, unit: Unit, now: Stamp) -> Result<Response> {
        let (respond, answer) = oneshot::channel();
        self.tx
            .send(Request { unit, now, respond })
            .await
            .map_err(|_| Error::ServiceClosed)?;
        answer.await.map_err(|_| Error::ServiceClosed)
    }
}

/// Start the writer. It stops once every handle is dropped.
pub fn spawn<S>(authority: Authority, sink: S, queue_depth: usize) -> (AuthorityHandle, JoinHandle<()>)
where
    S: AlertSink + 'static,
{
    let (tx, rx) = mpsc::channel(queue_depth.max(1));
    let worker = tokio::task::spawn_blocking(move || run(authority, sink, rx));
    (AuthorityHandle { tx }, worker)
}

fn run<S: AlertSink>(mut authority: Authority, mut sink: S, mut rx: mpsc::Receiver<Request>) {
    tracing::info!("authority service started");
    while let Some(request) = rx.blocking_recv() {
        let reply = authority.apply(request.unit, request.now);
        if let Err(e) = authority.save(request.now) {
            tracing::error!("saving documents failed: {}", e);
        }
        let outcome = authority.take_outcome();
        for alert in &outcome.alerts {
            sink.deliver(alert);
        }
        // caller may have given up waiting
        let _ = request.respond.send(Response { reply, outcome });
    }
    if let Err(e) = authority.save(Stamp::now()) {
        tracing::error!("final save failed: {}", e);
    }
    tracing::info!("authority service stopped");
}

// ==============================================================================
// tests
// ==============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::Alert;
    use crate::config::AuthorityConfig;
    use crate::device::DeviceReport;
    use crate::engine::ServerHeartbeat;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct Collected(Arc<Mutex<Vec<Alert>>>);

    impl AlertSink for Collected {
        fn deliver(&mut self, alert: &Alert) {
            self.0.lock().unwrap().push(alert.clone());
        }
    }

    fn t(secs: i64) -> Stamp {
        Stamp::from_secs(1_700_000_000 + secs)
    }

    fn open(dir: &tempfile::TempDir) -> Authority {
        let mut config = AuthorityConfig::default();
        config.storage.data_dir = dir.path().to_path_buf();
        Authority::open(config)
    }

    #[tokio::test]
    async fn units_are_applied_and_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let (handle, worker) = spawn(open(&dir), Collected::default(), 4);

        let heartbeat = Unit::Heartbeat(ServerHeartbeat {
            server_id: 1,
            devices: vec![DeviceReport { mac: "AA:BB:CC:DD:EE:FF".into(), ..Default::default() }],
            ..Default::default()
        });
        let response = handle.submit_at(heartbeat, t(0)).await.unwrap();
        assert!(response.reply.applied);
        assert!(response.outcome.dirty_projects.contains(&0));
        assert!(response.outcome.stale_servers.contains(&1));

        drop(handle);
        worker.await.unwrap();
        assert!(dir.path().join("registry.json").exists());
        assert_eq!(open(&dir).registry().lookup("AA:BB:CC:DD:EE:FF"), Some(1));
    }

    #[tokio::test]
    async fn alerts_reach_the_sink() {
        let dir = tempfile::tempdir().unwrap();
        let sink = Collected::default();
        let (handle, _worker) = spawn(open(&dir), sink.clone(), 4);

        handle
            .submit_at(Unit::Heartbeat(ServerHeartbeat { server_id: 2, ..Default::default() }), t(0))
            .await
            .unwrap();
        let first_alert = AuthorityConfig::default().server.first_alert_secs as i64;
        let response = handle.submit_at(Unit::Sweep, t(first_alert + 1)).await.unwrap();

        assert_eq!(response.outcome.alerts.len(), 1);
        assert_eq!(sink.0.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn closed_service_is_reported() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let handle = AuthorityHandle { tx };
        assert!(matches!(handle.submit(Unit::Sweep).await, Err(Error::ServiceClosed)));
    }
}
