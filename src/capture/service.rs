//! UDP listener feeding the record store.

use chrono::Local;
use futures::Stream;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::capture::record::LogRecord;
use crate::capture::store::LogStore;
use crate::capture::types::{CaptureError, CaptureResult, CaptureState};
use crate::config::CaptureSettings;

/// Largest datagram accepted; longer payloads are truncated by the socket
const MAX_DATAGRAM: usize = 64 * 1024;

/// Long-lived capture service. Cheap to clone; clones share one listener.
#[derive(Debug, Clone)]
pub struct CaptureService {
    inner: Arc<CaptureInner>,
}

#[derive(Debug)]
struct CaptureInner {
    listen_addr: String,
    store: Arc<LogStore>,
    running: Mutex<Option<Listener>>,
}

#[derive(Debug)]
struct Listener {
    local_addr: SocketAddr,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl CaptureService {
    pub fn new(settings: &CaptureSettings) -> Self {
        Self::with_store(settings.listen_addr(), LogStore::new(settings.dir.clone()))
    }

    pub fn with_store(listen_addr: impl Into<String>, store: LogStore) -> Self {
        Self {
            inner: Arc::new(CaptureInner {
                listen_addr: listen_addr.into(),
                store: Arc::new(store),
                running: Mutex::new(None),
            }),
        }
    }

    pub fn store(&self) -> &Arc<LogStore> {
        &self.inner.store
    }

    pub fn log_dir(&self) -> PathBuf {
        self.inner.store.dir().to_path_buf()
    }

    /// Bind the listener and start accepting. Calling it while running is a
    /// no-op that reports the existing address.
    pub async fn start(&self) -> CaptureResult<SocketAddr> {
        let mut running = self.inner.running.lock().await;
        if let Some(listener) = running.as_ref() {
            return Ok(listener.local_addr);
        }

        let socket = UdpSocket::bind(&self.inner.listen_addr)
            .await
            .map_err(|source| CaptureError::Bind {
                addr: self.inner.listen_addr.clone(),
                source,
            })?;
        let local_addr = socket.local_addr()?;

        self.inner.store.reset_cursors();
        if let Err(e) = self
            .inner
            .store
            .log_server_message(&format!("Started on UDP :{}", local_addr.port()))
        {
            warn!(error = %e, "failed to write server log");
        }
        info!(%local_addr, dir = %self.inner.store.dir().display(), "capture service started");

        let shutdown = CancellationToken::new();
        let task = tokio::spawn(receive_loop(
            socket,
            self.inner.store.clone(),
            shutdown.clone(),
        ));
        *running = Some(Listener {
            local_addr,
            shutdown,
            task,
        });
        Ok(local_addr)
    }

    /// Unbind and wait until every in-flight datagram handler has finished.
    /// Stopping a stopped service is a no-op.
    pub async fn stop(&self) {
        let Some(listener) = self.inner.running.lock().await.take() else {
            return;
        };
        listener.shutdown.cancel();
        if let Err(e) = listener.task.await {
            warn!(error = %e, "capture receive loop ended abnormally");
        }
        if let Err(e) = self.inner.store.log_server_message("Stopped") {
            warn!(error = %e, "failed to write server log");
        }
        info!(local_addr = %listener.local_addr, "capture service stopped");
    }

    pub async fn state(&self) -> CaptureState {
        match self.inner.running.lock().await.as_ref() {
            Some(listener) => CaptureState::Running {
                local_addr: listener.local_addr,
            },
            None => CaptureState::Stopped,
        }
    }

    pub async fn is_running(&self) -> bool {
        matches!(self.state().await, CaptureState::Running { .. })
    }

    /// Read a device's stream. With `follow`, only records appended since
    /// `caller`'s previous follow read are returned.
    pub async fn read(
        &self,
        host: &str,
        caller: &str,
        follow: bool,
    ) -> CaptureResult<Vec<LogRecord>> {
        let store = self.inner.store.clone();
        let host = host.to_string();
        let caller = caller.to_string();
        tokio::task::spawn_blocking(move || {
            if follow {
                store.read_follow(&host, &caller)
            } else {
                store.read_full(&host)
            }
        })
        .await
        .map_err(|e| CaptureError::Task(e.to_string()))?
    }

    /// Follow a device's stream like `tail -f`: first the records already
    /// stored, then each non-empty batch appended afterwards, checked every
    /// `interval`. The stream ends after the first read error.
    ///
    /// Works against streams written by another process sharing the directory.
    pub fn tail(
        &self,
        host: &str,
        caller: &str,
        interval: Duration,
    ) -> impl Stream<Item = CaptureResult<Vec<LogRecord>>> + Send + use<> {
        let svc = self.clone();
        let host = host.to_string();
        let caller = caller.to_string();
        futures::stream::unfold(Some(true), move |state| {
            let svc = svc.clone();
            let host = host.clone();
            let caller = caller.clone();
            async move {
                let first = state?;
                let batch = if first {
                    // Pin the cursor to end of stream, then show what is there.
                    match svc.read(&host, &caller, true).await {
                        Ok(_) => svc.read(&host, &caller, false).await,
                        Err(e) => Err(e),
                    }
                } else {
                    loop {
                        tokio::time::sleep(interval).await;
                        match svc.read(&host, &caller, true).await {
                            Ok(records) if records.is_empty() => continue,
                            other => break other,
                        }
                    }
                };
                let next = batch.is_ok().then_some(false);
                Some((batch, next))
            }
        })
    }
}

async fn receive_loop(socket: UdpSocket, store: Arc<LogStore>, shutdown: CancellationToken) {
    let handlers = TaskTracker::new();
    let mut buf = vec![0u8; MAX_DATAGRAM];

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            received = socket.recv_from(&mut buf) => match received {
                Ok((len, peer)) => {
                    let payload = buf[..len].to_vec();
                    let store = store.clone();
                    handlers.spawn_blocking(move || {
                        let received_at = Local::now().naive_local();
                        match store.ingest(&payload, peer, received_at) {
                            Ok(path) => debug!(%peer, stream = %path.display(), "record stored"),
                            Err(e) => warn!(%peer, error = %e, "failed to store record"),
                        }
                    });
                }
                Err(e) => warn!(error = %e, "capture receive failed"),
            },
        }
    }

    handlers.close();
    handlers.wait().await;
}
