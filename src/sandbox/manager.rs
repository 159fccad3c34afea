//! Session-scoped owner of the single sandbox connection.
//!
//! Booting is expensive, so the manager boots at most once per session and
//! hands the same [`Connection`] to every caller. Concurrent `connect` calls
//! during a boot all await one shared boot future. A failed boot clears the
//! in-flight marker so a later call can try again; it is never retried
//! automatically.

use super::{BootOptions, Connection, FsEvent, SandboxProvider};
use crate::error::{PlaygroundError, Result};
use crate::events::{Observers, Subscription};
use futures_util::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

type BootFuture = Shared<BoxFuture<'static, Result<Arc<dyn Connection>>>>;

struct InFlight {
    attempt: u64,
    future: BootFuture,
}

#[derive(Default)]
struct Slot {
    connection: Option<Arc<dyn Connection>>,
    in_flight: Option<InFlight>,
    workdir: Option<String>,
    /// Bumped by `dispose`; boots started under an older generation are
    /// not cached.
    generation: u64,
    pump: Option<JoinHandle<()>>,
}

pub struct SandboxManager {
    provider: Arc<dyn SandboxProvider>,
    slot: Mutex<Slot>,
    listeners: Observers<FsEvent>,
    /// Notified with the number of dropped events when the watch lags.
    resync: Observers<u64>,
    attempts: AtomicU64,
}

impl SandboxManager {
    pub fn new(provider: Arc<dyn SandboxProvider>) -> Self {
        Self {
            provider,
            slot: Mutex::new(Slot::default()),
            listeners: Observers::new(),
            resync: Observers::new(),
            attempts: AtomicU64::new(0),
        }
    }

    /// Return the live connection, joining or starting a boot as needed.
    pub async fn connect(&self, options: &BootOptions) -> Result<Arc<dyn Connection>> {
        let (generation, attempt, boot) = {
            let mut slot = self.slot.lock();
            if let Some(connection) = &slot.connection {
                if connection.workdir() != options.workdir {
                    tracing::warn!(
                        fixed = connection.workdir(),
                        requested = %options.workdir,
                        "Workdir is fixed for the session; ignoring requested workdir"
                    );
                }
                return Ok(Arc::clone(connection));
            }

            let joined = slot
                .in_flight
                .as_ref()
                .map(|in_flight| (in_flight.attempt, in_flight.future.clone()));

            match joined {
                Some((attempt, future)) => {
                    tracing::debug!(attempt, "Joining in-flight sandbox boot");
                    (slot.generation, attempt, future)
                }
                None => {
                    let options = self.fixed_options(&slot, options);
                    let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
                    let provider = Arc::clone(&self.provider);

                    tracing::info!(
                        provider = provider.name(),
                        workdir = %options.workdir,
                        attempt,
                        "Booting sandbox"
                    );

                    let future = async move {
                        provider.boot(&options).await.map_err(|e| {
                            PlaygroundError::ConnectionBootFailure(format!("{e:#}"))
                        })
                    }
                    .boxed()
                    .shared();

                    slot.in_flight = Some(InFlight {
                        attempt,
                        future: future.clone(),
                    });
                    (slot.generation, attempt, future)
                }
            }
        };

        let result = boot.await;

        let mut slot = self.slot.lock();
        if slot.generation != generation {
            tracing::warn!(attempt, "Sandbox disposed while booting; discarding connection");
            return Err(PlaygroundError::ConnectionBootFailure(
                "sandbox was disposed during boot".to_string(),
            ));
        }

        if slot
            .in_flight
            .as_ref()
            .is_some_and(|in_flight| in_flight.attempt == attempt)
        {
            slot.in_flight = None;
            match &result {
                Ok(connection) => {
                    tracing::info!(attempt, workdir = connection.workdir(), "Sandbox booted");
                    slot.workdir = Some(connection.workdir().to_string());
                    slot.connection = Some(Arc::clone(connection));
                    slot.pump = Some(self.spawn_pump(connection.as_ref()));
                }
                Err(e) => {
                    tracing::warn!(attempt, error = %e, "Sandbox boot failed");
                }
            }
        }

        result
    }

    /// The cached connection, without booting.
    pub fn get(&self) -> Result<Arc<dyn Connection>> {
        self.slot
            .lock()
            .connection
            .clone()
            .ok_or(PlaygroundError::NotBooted)
    }

    pub fn is_connected(&self) -> bool {
        self.slot.lock().connection.is_some()
    }

    /// Number of boots started so far.
    pub fn boot_count(&self) -> u64 {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Drop the connection, the in-flight boot and every file listener. The
    /// workdir chosen by the first boot stays fixed.
    pub fn dispose(&self) {
        let mut slot = self.slot.lock();
        let had_connection = slot.connection.take().is_some();
        slot.in_flight = None;
        slot.generation += 1;
        if let Some(pump) = slot.pump.take() {
            pump.abort();
        }
        drop(slot);

        self.listeners.clear();
        self.resync.clear();
        if had_connection {
            tracing::info!("Sandbox connection disposed");
        }
    }

    /// Subscribe to every filesystem change the sandbox reports.
    pub fn on_file_change<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&FsEvent) + Send + Sync + 'static,
    {
        self.listeners.subscribe(callback)
    }

    /// Feed an event to the subscribers as if the sandbox reported it.
    pub fn dispatch(&self, event: &FsEvent) {
        self.listeners.emit(event);
    }

    /// Subscribe to lag notices. After one, some change notifications were
    /// lost and per-path bookkeeping built on them is stale.
    pub fn on_resync<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&u64) + Send + Sync + 'static,
    {
        self.resync.subscribe(callback)
    }

    fn fixed_options(&self, slot: &Slot, requested: &BootOptions) -> BootOptions {
        let mut options = requested.clone();
        if let Some(workdir) = &slot.workdir {
            if workdir != &requested.workdir {
                tracing::warn!(
                    fixed = %workdir,
                    requested = %requested.workdir,
                    "Workdir is fixed for the session; ignoring requested workdir"
                );
                options.workdir = workdir.clone();
            }
        }
        options
    }

    fn spawn_pump(&self, connection: &dyn Connection) -> JoinHandle<()> {
        let mut events = connection.watch();
        let listeners = self.listeners.clone();
        let resync = self.resync.clone();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => listeners.emit(&event),
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "File watch lagged; events dropped");
                        resync.emit(&skipped);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }
}

impl Drop for SandboxManager {
    fn drop(&mut self) {
        if let Some(pump) = self.slot.get_mut().pump.take() {
            pump.abort();
        }
    }
}
