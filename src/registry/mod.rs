use std::collections::{HashMap, HashSet};
use tokio::sync::{oneshot, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::protocol::ClientId;
use crate::{HubError, Result};

/// Live engine process owned by a job
#[derive(Debug)]
pub struct ProcessHandle {
    pub client_id: ClientId,
    pub job_id: Uuid,
    pub server_number: u8,
    pub pid: Option<u32>,
    kill_tx: oneshot::Sender<()>,
}

impl ProcessHandle {
    /// Create a handle and the receiver the supervising task waits on
    pub fn new(
        client_id: ClientId,
        job_id: Uuid,
        server_number: u8,
        pid: Option<u32>,
    ) -> (Self, oneshot::Receiver<()>) {
        let (kill_tx, kill_rx) = oneshot::channel();
        let handle = Self {
            client_id,
            job_id,
            server_number,
            pid,
            kill_tx,
        };
        (handle, kill_rx)
    }

    /// Ask the supervising task to kill the process
    fn terminate(self) -> bool {
        self.kill_tx.send(()).is_ok()
    }
}

/// Process-wide table of wanted clients and live engine processes
///
/// A client is "wanted" from submission until it disconnects. The
/// orchestrator re-checks this right before spawning, since a client can
/// leave while jobs ahead of it are still running.
#[derive(Debug, Default)]
pub struct JobRegistry {
    wanted: RwLock<HashSet<ClientId>>,
    processes: RwLock<HashMap<ClientId, Vec<ProcessHandle>>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a client as wanting its submitted jobs to run
    pub async fn admit(&self, client_id: &str) {
        self.wanted.write().await.insert(client_id.to_string());
    }

    /// Drop a client from the wanted set; returns whether it was present
    pub async fn withdraw(&self, client_id: &str) -> bool {
        let removed = self.wanted.write().await.remove(client_id);
        if removed {
            debug!("Client {} withdrawn from the wanted set", client_id);
        }
        removed
    }

    /// True iff the client is still wanted at this moment
    pub async fn is_admitted(&self, client_id: &str) -> bool {
        self.wanted.read().await.contains(client_id)
    }

    /// Track a live process; a job may own at most one
    pub async fn register(&self, handle: ProcessHandle) -> Result<()> {
        let mut processes = self.processes.write().await;
        let entry = processes.entry(handle.client_id.clone()).or_default();

        if entry.iter().any(|h| h.job_id == handle.job_id) {
            return Err(HubError::AlreadyRegistered(handle.job_id));
        }

        debug!(
            "Registered process {:?} for job {} (client {}, server {})",
            handle.pid, handle.job_id, handle.client_id, handle.server_number
        );
        entry.push(handle);
        Ok(())
    }

    /// Forget the process of a job once it exited; returns whether it was tracked
    pub async fn unregister(&self, client_id: &str, job_id: Uuid) -> bool {
        let mut processes = self.processes.write().await;
        let Some(entry) = processes.get_mut(client_id) else {
            return false;
        };

        let before = entry.len();
        entry.retain(|h| h.job_id != job_id);
        let removed = entry.len() != before;

        if entry.is_empty() {
            processes.remove(client_id);
        }
        removed
    }

    /// Kill every live process of a client; returns how many were signalled
    pub async fn terminate_all(&self, client_id: &str) -> usize {
        let handles = self
            .processes
            .write()
            .await
            .remove(client_id)
            .unwrap_or_default();

        let mut signalled = 0;
        for handle in handles {
            let job_id = handle.job_id;
            let pid = handle.pid;
            if handle.terminate() {
                info!("Terminating process {:?} of job {} for client {}", pid, job_id, client_id);
                signalled += 1;
            } else {
                warn!("Process of job {} already gone", job_id);
            }
        }
        signalled
    }

    /// Number of live processes across all clients
    pub async fn live_count(&self) -> usize {
        self.processes.read().await.values().map(Vec::len).sum()
    }

    /// Jobs with a live process for a client
    pub async fn live_jobs(&self, client_id: &str) -> Vec<Uuid> {
        self.processes
            .read()
            .await
            .get(client_id)
            .map(|handles| handles.iter().map(|h| h.job_id).collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_admission_lifecycle() {
        let registry = JobRegistry::new();
        assert!(!registry.is_admitted("c1").await);

        registry.admit("c1").await;
        assert!(registry.is_admitted("c1").await);

        assert!(registry.withdraw("c1").await);
        assert!(!registry.is_admitted("c1").await);
        assert!(!registry.withdraw("c1").await);
    }

    #[tokio::test]
    async fn test_one_process_per_job() {
        let registry = JobRegistry::new();
        let job_id = Uuid::new_v4();

        let (first, _rx1) = ProcessHandle::new("c1".into(), job_id, 1, Some(10));
        let (second, _rx2) = ProcessHandle::new("c1".into(), job_id, 1, Some(11));

        registry.register(first).await.unwrap();
        assert!(matches!(
            registry.register(second).await,
            Err(HubError::AlreadyRegistered(id)) if id == job_id
        ));
        assert_eq!(registry.live_count().await, 1);
    }

    #[tokio::test]
    async fn test_terminate_all_signals_only_that_client() {
        let registry = JobRegistry::new();
        let (a1, mut rx_a1) = ProcessHandle::new("a".into(), Uuid::new_v4(), 1, None);
        let (a2, mut rx_a2) = ProcessHandle::new("a".into(), Uuid::new_v4(), 2, None);
        let (b1, mut rx_b1) = ProcessHandle::new("b".into(), Uuid::new_v4(), 1, None);

        registry.register(a1).await.unwrap();
        registry.register(a2).await.unwrap();
        registry.register(b1).await.unwrap();

        assert_eq!(registry.terminate_all("a").await, 2);
        assert!(rx_a1.try_recv().is_ok());
        assert!(rx_a2.try_recv().is_ok());
        assert!(rx_b1.try_recv().is_err());

        assert_eq!(registry.live_count().await, 1);
        assert_eq!(registry.terminate_all("a").await, 0);
    }

    #[tokio::test]
    async fn test_terminate_after_supervisor_gone() {
        let registry = JobRegistry::new();
        let (handle, rx) = ProcessHandle::new("a".into(), Uuid::new_v4(), 1, None);
        registry.register(handle).await.unwrap();
        drop(rx);

        assert_eq!(registry.terminate_all("a").await, 0);
    }

    #[tokio::test]
    async fn test_unregister() {
        let registry = JobRegistry::new();
        let job_id = Uuid::new_v4();
        let (handle, _rx) = ProcessHandle::new("a".into(), job_id, 1, None);
        registry.register(handle).await.unwrap();

        assert_eq!(registry.live_jobs("a").await, vec![job_id]);
        assert!(registry.unregister("a", job_id).await);
        assert!(!registry.unregister("a", job_id).await);
        assert!(registry.live_jobs("a").await.is_empty());
    }
}
