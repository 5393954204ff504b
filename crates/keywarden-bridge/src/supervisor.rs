use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use keywarden_core::{
    interaction_slot, ApprovalPrompt, InteractionOutcome, InteractionSender, InteractionSlot,
    SelectedKey, SigningAuthority, SigningGateway,
};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};
use tracing::{debug, info, warn};

use crate::config::Bootstrap;
use crate::session::{Session, SessionContext};
use crate::{transport, Result};

const JOIN_WAIT: Duration = Duration::from_secs(3);

struct Worker {
    id: u64,
    handle: JoinHandle<()>,
    interaction: InteractionSender,
}

struct Inner {
    gateway: Arc<SigningGateway>,
    workers: DashMap<u16, Worker>,
    next_worker_id: AtomicU64,
}

/// Owns one worker per proxy port. Each worker establishes its own
/// authenticated channel and runs the protocol session to completion;
/// workers deregister themselves when they exit.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

impl Supervisor {
    pub fn new(authority: Arc<dyn SigningAuthority>, prompt: Arc<dyn ApprovalPrompt>) -> Self {
        Self {
            inner: Arc::new(Inner {
                gateway: Arc::new(SigningGateway::new(authority, prompt)),
                workers: DashMap::new(),
                next_worker_id: AtomicU64::new(0),
            }),
        }
    }

    /// Spawns a worker for `bootstrap.proxy_port` unless one is already
    /// running there; a duplicate start is a no-op.
    pub fn start(&self, bootstrap: Bootstrap, selected_keys: Vec<SelectedKey>) {
        let port = bootstrap.proxy_port;
        // The entry guard spans the liveness check and the insert, so two
        // racing starts for one port cannot both spawn a worker.
        let entry = match self.inner.workers.entry(port) {
            Entry::Occupied(occupied) if !occupied.get().handle.is_finished() => {
                debug!(port, "worker already running, ignoring duplicate start");
                return;
            }
            entry => entry,
        };

        let id = self.inner.next_worker_id.fetch_add(1, Ordering::Relaxed);
        let (sender, slot) = interaction_slot();
        // The worker waits for its map entry to exist before it runs, so its
        // self-deregistration cannot race the insert below.
        let (registered_tx, registered_rx) = oneshot::channel::<()>();

        let inner = self.inner.clone();
        let handle = tokio::spawn(async move {
            let _ = registered_rx.await;
            match run_worker(inner.gateway.clone(), bootstrap, selected_keys, slot).await {
                Ok(()) => info!(port, "worker finished"),
                Err(err) => warn!(port, %err, "worker exited with error"),
            }
            inner.workers.remove_if(&port, |_, worker| worker.id == id);
        });

        let worker = Worker {
            id,
            handle,
            interaction: sender,
        };
        match entry {
            Entry::Occupied(mut occupied) => {
                occupied.insert(worker);
            }
            Entry::Vacant(vacant) => {
                vacant.insert(worker);
            }
        }
        let _ = registered_tx.send(());
        info!(port, "worker started");
    }

    /// Routes a user-approval outcome to the worker blocked on it. A missing
    /// worker or an already-filled slot is logged and otherwise ignored.
    pub fn deliver_interaction(&self, port: u16, outcome: InteractionOutcome) {
        match self.inner.workers.get(&port) {
            Some(worker) => {
                if !worker.interaction.deliver(outcome) {
                    warn!(port, "interaction result dropped, slot full or worker gone");
                }
            }
            None => warn!(port, "interaction result for a port with no worker"),
        }
    }

    pub fn worker_count(&self) -> usize {
        self.inner.workers.len()
    }

    /// Aborts every worker, then waits up to a bounded interval for each to
    /// wind down. Best effort: teardown proceeds regardless of join outcome.
    pub async fn stop_all(&self) {
        let ports: Vec<u16> = self.inner.workers.iter().map(|entry| *entry.key()).collect();
        let mut handles = Vec::with_capacity(ports.len());
        for port in ports {
            if let Some((_, worker)) = self.inner.workers.remove(&port) {
                worker.handle.abort();
                handles.push((port, worker.handle));
            }
        }

        for (port, mut handle) in handles {
            if timeout(JOIN_WAIT, &mut handle).await.is_err() {
                warn!(port, "worker did not stop within the join window");
            }
        }
        info!("all workers stopped");
    }
}

async fn run_worker(
    gateway: Arc<SigningGateway>,
    bootstrap: Bootstrap,
    selected_keys: Vec<SelectedKey>,
    slot: InteractionSlot,
) -> Result<()> {
    let port = bootstrap.proxy_port;
    let stream = transport::connect(&bootstrap).await?;

    let session = Session::new(
        SessionContext {
            gateway,
            selected_keys: Arc::new(selected_keys),
            port,
        },
        slot,
    );
    session.run(stream).await
}

#[cfg(test)]
mod tests {
    use keywarden_core::{LogPrompt, NullAuthority};
    use rustls::pki_types::CertificateDer;
    use tokio::net::TcpListener;

    use super::*;

    fn supervisor() -> Supervisor {
        Supervisor::new(Arc::new(NullAuthority), Arc::new(LogPrompt))
    }

    /// A listener that accepts and then never speaks; the worker's TLS
    /// handshake stays pending until the handshake timeout, far longer than
    /// any of these tests run, so the worker stays alive throughout.
    async fn silent_listener() -> (u16, JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });
        (port, handle)
    }

    fn bootstrap_for(port: u16) -> Bootstrap {
        Bootstrap {
            proxy_port: port,
            certificate: CertificateDer::from(vec![0u8]),
            fingerprint: "sha256:00".to_string(),
            auth_token: Vec::new(),
        }
    }

    #[tokio::test]
    async fn duplicate_start_is_a_no_op() {
        let (port, _listener) = silent_listener().await;
        let supervisor = supervisor();

        supervisor.start(bootstrap_for(port), Vec::new());
        supervisor.start(bootstrap_for(port), Vec::new());

        assert_eq!(supervisor.worker_count(), 1);
        supervisor.stop_all().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_starts_for_one_port_spawn_one_worker() {
        let (port, _listener) = silent_listener().await;
        let supervisor = supervisor();

        let mut starts = Vec::new();
        for _ in 0..8 {
            let supervisor = supervisor.clone();
            starts.push(tokio::spawn(async move {
                supervisor.start(bootstrap_for(port), Vec::new());
            }));
        }
        for start in starts {
            start.await.unwrap();
        }

        assert_eq!(supervisor.worker_count(), 1);
        supervisor.stop_all().await;
        assert_eq!(supervisor.worker_count(), 0);
    }

    #[tokio::test]
    async fn stop_all_tears_every_worker_down() {
        let (port_a, _la) = silent_listener().await;
        let (port_b, _lb) = silent_listener().await;
        let supervisor = supervisor();

        supervisor.start(bootstrap_for(port_a), Vec::new());
        supervisor.start(bootstrap_for(port_b), Vec::new());
        assert_eq!(supervisor.worker_count(), 2);

        supervisor.stop_all().await;
        assert_eq!(supervisor.worker_count(), 0);
    }

    #[tokio::test]
    async fn interaction_for_missing_worker_is_ignored() {
        let supervisor = supervisor();
        // Must not panic or block.
        supervisor.deliver_interaction(9999, InteractionOutcome::Cancelled);
    }

    #[tokio::test]
    async fn interaction_reaches_a_live_worker_slot() {
        let (port, _listener) = silent_listener().await;
        let supervisor = supervisor();
        supervisor.start(bootstrap_for(port), Vec::new());

        supervisor.deliver_interaction(port, InteractionOutcome::Cancelled);
        // Slot has capacity 1; a second delivery is dropped, not queued.
        supervisor.deliver_interaction(port, InteractionOutcome::Cancelled);

        supervisor.stop_all().await;
    }

    #[tokio::test]
    async fn finished_worker_deregisters_itself() {
        // Nothing listening: each connect refuses immediately, so the worker
        // burns its retry budget (~1.5s of backoff) and removes itself.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let supervisor = supervisor();
        supervisor.start(bootstrap_for(port), Vec::new());

        // Connect refusals plus four backoff sleeps (100..800ms) bound this.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        while supervisor.worker_count() != 0 {
            assert!(tokio::time::Instant::now() < deadline, "worker never exited");
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}
