// Copyright 2025 Jayashankar
// SPDX-License-Identifier: Apache-2.0

//! Lifecycle of the loopback HTTPS listener.

use crate::config::{HttpsConfig, Paths, SecretStore};
use crate::dispatch::{Dispatcher, SecureConnection};
use crate::error::{Error, Result};
use crate::keystore::{KeystoreProvisioner, ENTRY_ALIAS};
use crate::tls::TlsContext;
use crate::trust::{NoopTrust, PlatformTrust};
use rustls::ClientConfig;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpSocket};
use tokio::sync::{oneshot, watch, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tokio_rustls::TlsAcceptor;

/// Pending connections the kernel may queue. One is enough for a local
/// control channel.
const LISTEN_BACKLOG: u32 = 1;

/// Pause after a failed accept so a persistent error does not spin.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    Stopped,
    Initializing,
    Running,
}

struct RunningListener {
    addr: SocketAddr,
    tls: TlsContext,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

/// Owns at most one bound listener.
///
/// `start`, `stop` and `restart` serialize on an internal lock, so a stop can
/// never race a start and two sockets are never bound at once.
pub struct RemoteControlServer {
    paths: Paths,
    host: String,
    enabled: AtomicBool,
    secrets: Arc<dyn SecretStore>,
    trust: Arc<dyn PlatformTrust>,
    dispatcher: Arc<dyn Dispatcher>,
    slot: Mutex<Option<RunningListener>>,
    state: watch::Sender<ListenerState>,
}

impl RemoteControlServer {
    pub fn new(
        paths: Paths,
        https: &HttpsConfig,
        secrets: Arc<dyn SecretStore>,
        dispatcher: Arc<dyn Dispatcher>,
    ) -> Self {
        let (state, _) = watch::channel(ListenerState::Stopped);
        Self {
            paths,
            host: https.host.clone(),
            enabled: AtomicBool::new(https.enabled),
            secrets,
            trust: Arc::new(NoopTrust),
            dispatcher,
            slot: Mutex::new(None),
            state,
        }
    }

    /// Replace the trust hook run on every start.
    pub fn with_trust(mut self, trust: Arc<dyn PlatformTrust>) -> Self {
        self.trust = trust;
        self
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> ListenerState {
        *self.state.borrow()
    }

    /// Watch state transitions.
    pub fn subscribe(&self) -> watch::Receiver<ListenerState> {
        self.state.subscribe()
    }

    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.slot.lock().await.as_ref().map(|l| l.addr)
    }

    /// Client configuration trusting the running listener's certificate.
    pub async fn client_config(&self) -> Option<Arc<ClientConfig>> {
        self.slot.lock().await.as_ref().map(|l| l.tls.client_config())
    }

    pub async fn tls_context(&self) -> Option<TlsContext> {
        self.slot.lock().await.as_ref().map(|l| l.tls.clone())
    }

    /// Provision if needed, build the TLS context and bind `port`.
    ///
    /// Fails with [`Error::AlreadyRunning`] while a listener is up. Any other
    /// failure leaves the server stopped.
    pub async fn start(&self, port: u16) -> Result<SocketAddr> {
        let mut slot = self.slot.lock().await;
        self.start_locked(&mut slot, port).await
    }

    /// Close the listener and wait for the accept loop to exit. No-op when stopped.
    pub async fn stop(&self) {
        let mut slot = self.slot.lock().await;
        self.stop_locked(&mut slot).await;
    }

    /// Stop any running listener, then start on `port` unless disabled.
    ///
    /// Returns `Ok(None)` when the feature is disabled. A port conflict is
    /// returned as an error for which [`Error::is_bind_conflict`] holds.
    pub async fn restart(&self, port: u16) -> Result<Option<SocketAddr>> {
        let mut slot = self.slot.lock().await;
        self.stop_locked(&mut slot).await;

        if !self.is_enabled() {
            tracing::info!("remote control over HTTPS is disabled");
            return Ok(None);
        }

        self.start_locked(&mut slot, port).await.map(Some)
    }

    async fn start_locked(
        &self,
        slot: &mut Option<RunningListener>,
        port: u16,
    ) -> Result<SocketAddr> {
        if let Some(running) = slot.as_ref() {
            return Err(Error::AlreadyRunning { addr: running.addr });
        }

        self.state.send_replace(ListenerState::Initializing);

        match self.launch(port).await {
            Ok(running) => {
                let addr = running.addr;
                *slot = Some(running);
                self.state.send_replace(ListenerState::Running);
                tracing::info!(addr = %addr, "remote control listening on https://{}", addr);
                Ok(addr)
            }
            Err(e) => {
                self.state.send_replace(ListenerState::Stopped);
                if e.is_bind_conflict() {
                    tracing::warn!(port, error = %e, "remote control port unavailable");
                } else {
                    tracing::error!(port, error = %e, "remote control failed to start");
                }
                Err(e)
            }
        }
    }

    async fn stop_locked(&self, slot: &mut Option<RunningListener>) {
        let Some(running) = slot.take() else {
            self.state.send_replace(ListenerState::Stopped);
            return;
        };

        let _ = running.shutdown.send(());
        if let Err(e) = running.task.await {
            tracing::warn!(error = %e, "accept loop ended abnormally");
        }

        self.state.send_replace(ListenerState::Stopped);
        tracing::info!(addr = %running.addr, "remote control stopped");
    }

    async fn launch(&self, port: u16) -> Result<RunningListener> {
        let paths = self.paths.clone();
        let secrets = self.secrets.clone();
        let tls = tokio::task::spawn_blocking(move || prepare_tls(&paths, secrets, port))
            .await
            .map_err(|e| Error::Task(e.to_string()))??;

        self.install_trust(&tls).await;

        let addr = resolve_bind_addr(&self.host, port).await?;
        let listener = bind(addr)?;
        let addr = listener
            .local_addr()
            .map_err(|source| Error::BindFailed { addr, source })?;

        let (shutdown, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(accept_loop(
            listener,
            tls.acceptor(),
            self.dispatcher.clone(),
            shutdown_rx,
        ));

        Ok(RunningListener {
            addr,
            tls,
            shutdown,
            task,
        })
    }

    /// Trust hook failures never prevent the listener from starting.
    async fn install_trust(&self, tls: &TlsContext) {
        let trust = self.trust.clone();
        let certificate = tls.certificate().clone();
        let result =
            tokio::task::spawn_blocking(move || trust.install_certificate(ENTRY_ALIAS, &certificate))
                .await;

        match result {
            Ok(Ok(true)) => tracing::info!(store = self.trust.name(), "certificate installed"),
            Ok(Ok(false)) => {
                tracing::debug!(store = self.trust.name(), "trust store unchanged")
            }
            Ok(Err(e)) => {
                tracing::warn!(store = self.trust.name(), error = %e, "could not install certificate")
            }
            Err(e) => tracing::warn!(error = %e, "trust hook panicked"),
        }
    }
}

impl std::fmt::Debug for RemoteControlServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteControlServer")
            .field("host", &self.host)
            .field("enabled", &self.is_enabled())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Ensure the keystore exists and build a TLS context from it. Blocking.
pub fn prepare_tls(paths: &Paths, secrets: Arc<dyn SecretStore>, port: u16) -> Result<TlsContext> {
    paths.ensure_dir()?;
    let provisioner = KeystoreProvisioner::new(secrets, port);
    let handle = provisioner.ensure_keystore(&paths.keystore)?;
    let keystore = provisioner.load_keystore(&handle.path)?;
    let entry_password = provisioner.entry_password(&handle.path)?;
    TlsContext::build(&keystore, &entry_password)
}

/// Resolve `host`, preferring IPv4 loopback, then any loopback address.
async fn resolve_bind_addr(host: &str, port: u16) -> Result<SocketAddr> {
    let candidates: Vec<SocketAddr> = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| Error::InvalidHost {
            host: host.to_string(),
            reason: e.to_string(),
        })?
        .collect();

    let chosen = candidates
        .iter()
        .find(|a| a.is_ipv4() && a.ip().is_loopback())
        .or_else(|| candidates.iter().find(|a| a.ip().is_loopback()))
        .or_else(|| candidates.first())
        .copied()
        .ok_or_else(|| Error::InvalidHost {
            host: host.to_string(),
            reason: "resolved to no addresses".into(),
        })?;

    if !chosen.ip().is_loopback() {
        tracing::warn!(host, addr = %chosen, "bind address is not loopback");
    }
    Ok(chosen)
}

fn bind(addr: SocketAddr) -> Result<TcpListener> {
    let bind_err = |source: std::io::Error| Error::BindFailed { addr, source };

    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()
    } else {
        TcpSocket::new_v6()
    }
    .map_err(bind_err)?;

    // On Windows SO_REUSEADDR lets another socket steal the port
    #[cfg(unix)]
    socket.set_reuseaddr(true).map_err(bind_err)?;

    socket.bind(addr).map_err(bind_err)?;
    socket.listen(LISTEN_BACKLOG).map_err(bind_err)
}

async fn accept_loop(
    listener: TcpListener,
    acceptor: TlsAcceptor,
    dispatcher: Arc<dyn Dispatcher>,
    mut shutdown: oneshot::Receiver<()>,
) {
    // Handshakes in flight; dispatched connections are not tracked here
    let mut handshakes: JoinSet<()> = JoinSet::new();

    loop {
        tokio::select! {
            // Also fires when the owning server is dropped
            _ = &mut shutdown => break,

            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        tracing::warn!(error = %Error::Accept(e), "accept failed");
                        tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                        continue;
                    }
                };

                let acceptor = acceptor.clone();
                let dispatcher = dispatcher.clone();
                handshakes.spawn(async move {
                    match acceptor.accept(stream).await {
                        Ok(tls_stream) => {
                            let connection = SecureConnection::new(tls_stream, peer);
                            tracing::trace!(
                                peer = %peer,
                                sni = ?connection.server_name(),
                                protocol = ?connection.protocol_version(),
                                cipher = ?connection.cipher_suite(),
                                "handshake complete"
                            );
                            dispatcher.dispatch(connection);
                        }
                        Err(e) => tracing::debug!(peer = %peer, error = %e, "TLS handshake failed"),
                    }
                });

                while handshakes.try_join_next().is_some() {}
            }
        }
    }

    handshakes.abort_all();
    drop(listener);
    tracing::debug!("accept loop exited");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_resolve_prefers_ipv4_loopback() {
        let addr = resolve_bind_addr("localhost", 8112).await.unwrap();
        assert!(addr.ip().is_loopback());
        assert_eq!(addr.port(), 8112);

        let v6 = resolve_bind_addr("::1", 9000).await.unwrap();
        assert!(v6.is_ipv6());
    }

    #[tokio::test]
    async fn test_bind_conflict_is_reported() {
        let taken = bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = taken.local_addr().unwrap();

        let err = bind(addr).unwrap_err();
        assert!(err.is_bind_conflict(), "{}", err);
    }
}
