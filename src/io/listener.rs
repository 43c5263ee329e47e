//! Listener lifecycle
//!
//! Binds one TCP listener per configured analyzer port and spawns an
//! accept loop for each. Ports must be unique and every bind must succeed
//! before any accept loop starts. `stop()` flips a shutdown watch, waits a
//! bounded time for sessions to drain, then aborts stragglers.

use crate::config::ListenerConfig;
use crate::error::{LinkError, Result};
use crate::io::session::Session;
use crate::model::LinkObserver;
use crate::protocol::{make_parser, SyncTrigger};
use crate::store::ResultStore;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const STOP_TIMEOUT: Duration = Duration::from_secs(2);

struct Inner {
    shutdown: Option<watch::Sender<bool>>,
    accept_tasks: Vec<JoinHandle<()>>,
    sessions: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

/// Owns every analyzer listener and its sessions
pub struct ListenerManager {
    store: Arc<dyn ResultStore>,
    observer: Arc<dyn LinkObserver>,
    sync_trigger: Option<SyncTrigger>,
    connections: Arc<AtomicUsize>,
    inner: Mutex<Inner>,
}

impl ListenerManager {
    pub fn new(store: Arc<dyn ResultStore>, observer: Arc<dyn LinkObserver>) -> Self {
        ListenerManager {
            store,
            observer,
            sync_trigger: None,
            connections: Arc::new(AtomicUsize::new(0)),
            inner: Mutex::new(Inner {
                shutdown: None,
                accept_tasks: Vec::new(),
                sessions: Arc::new(Mutex::new(Vec::new())),
            }),
        }
    }

    /// Hook parsers fire after persisting a patient's results
    pub fn set_sync_trigger(&mut self, trigger: SyncTrigger) {
        self.sync_trigger = Some(trigger);
    }

    /// Number of live analyzer connections
    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// Bind every configured port and start accepting
    pub async fn start(&self, configs: &[ListenerConfig]) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.shutdown.is_some() {
            return Err(LinkError::InvalidConfig("listeners already running".into()));
        }

        let mut seen = HashSet::new();
        for config in configs {
            if !seen.insert(config.port) {
                return Err(LinkError::InvalidConfig(format!(
                    "duplicate listener port {}",
                    config.port
                )));
            }
        }

        // Every bind must succeed before any accept loop runs
        let mut bound = Vec::with_capacity(configs.len());
        for config in configs {
            let listener = TcpListener::bind(("0.0.0.0", config.port)).await?;
            info!(
                port = config.port,
                name = %config.name,
                analyzer = ?config.analyzer,
                protocol = ?config.protocol,
                "Listener bound"
            );
            bound.push((listener, config.clone()));
        }

        let (shutdown_tx, _) = watch::channel(false);

        for (listener, config) in bound {
            let store = self.store.clone();
            let observer = self.observer.clone();
            let sync_trigger = self.sync_trigger.clone();
            let connections = self.connections.clone();
            let sessions = inner.sessions.clone();
            let mut shutdown_rx = shutdown_tx.subscribe();
            let session_shutdown = shutdown_tx.subscribe();

            inner.accept_tasks.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        changed = shutdown_rx.changed() => {
                            if changed.is_err() || *shutdown_rx.borrow() {
                                debug!(port = config.port, "Accept loop stopping");
                                break;
                            }
                        }
                        accepted = listener.accept() => {
                            let (socket, peer) = match accepted {
                                Ok(pair) => pair,
                                Err(e) => {
                                    warn!(port = config.port, error = %e, "Accept failed");
                                    continue;
                                }
                            };

                            let mut parser = make_parser(
                                config.analyzer,
                                config.protocol,
                                store.clone(),
                                observer.clone(),
                            );
                            if let Some(trigger) = &sync_trigger {
                                parser.set_sync_trigger(trigger.clone());
                            }

                            let count = connections.fetch_add(1, Ordering::SeqCst) + 1;
                            observer.on_connection_count(count);
                            observer.on_log(
                                tracing::Level::INFO,
                                &format!("analyzer connected from {peer} on port {}", config.port),
                            );

                            let session = Session::new(
                                socket,
                                peer,
                                config.name.clone(),
                                config.port,
                                parser,
                                session_shutdown.clone(),
                            );
                            let connections = connections.clone();
                            let observer = observer.clone();
                            let handle = tokio::spawn(async move {
                                session.run().await;
                                let count = connections.fetch_sub(1, Ordering::SeqCst) - 1;
                                observer.on_connection_count(count);
                                observer.on_log(
                                    tracing::Level::INFO,
                                    &format!("analyzer {peer} disconnected"),
                                );
                            });
                            sessions.lock().await.push(handle);
                        }
                    }
                }
            }));
        }

        inner.shutdown = Some(shutdown_tx);
        info!(listeners = configs.len(), "Listener manager started");
        Ok(())
    }

    /// Stop accepting and drain sessions; safe to call more than once
    pub async fn stop(&self) {
        let mut inner = self.inner.lock().await;
        let shutdown = match inner.shutdown.take() {
            Some(tx) => tx,
            None => return, // never started or already stopped
        };
        let _ = shutdown.send(true);

        for mut task in inner.accept_tasks.drain(..) {
            if tokio::time::timeout(STOP_TIMEOUT, &mut task).await.is_err() {
                warn!("Accept task did not stop in time, aborting");
                task.abort();
            }
        }

        let mut sessions = inner.sessions.lock().await;
        for mut handle in sessions.drain(..) {
            if tokio::time::timeout(STOP_TIMEOUT, &mut handle).await.is_err() {
                warn!("Session did not stop in time, aborting");
                handle.abort();
            }
        }

        info!("Listener manager stopped");
    }
}
