//! The discovery worker as a locator.
//!
//! [`ProcessLocator`] owns one worker session at a time. The session is
//! spawned lazily on first use, configured before its first request, and
//! thrown away when the worker dies or a request is cancelled; the next call
//! spawns a fresh worker and configures it again.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};

use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use log::{debug, info, warn};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::error::DiscoveryError;
use crate::protocol::{
    ConfigureOptions, NativeEnvInfo, NativeInfo, Notification, RefreshOptions, RefreshSummary,
    ResolveParams, METHOD_CONFIGURE, METHOD_REFRESH, METHOD_RESOLVE,
};
use crate::rpc::RpcConnection;

/// Something that can enumerate and resolve environments.
///
/// `refresh` is not safe to run concurrently against one backing worker;
/// callers go through [`crate::WorkerPool`]. `resolve` may overlap freely.
pub trait NativeLocator: Send + Sync {
    fn refresh<'a>(
        &'a self,
        options: RefreshOptions,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<Vec<NativeInfo>, DiscoveryError>>;

    /// Resolve one interpreter path. `Ok(None)` means the path is not a
    /// Python environment the worker recognises.
    fn resolve<'a>(
        &'a self,
        executable: &'a Path,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<Option<NativeEnvInfo>, DiscoveryError>>;

    /// Release the backing worker, if any.
    fn shutdown(&self);
}

/// Produces a fresh connection each time the worker has to be (re)started.
pub type Connector = Arc<dyn Fn() -> Result<RpcConnection, DiscoveryError> + Send + Sync>;

struct Session {
    conn: RpcConnection,
    /// Serialized options last acknowledged by this worker.
    configured: Mutex<Option<String>>,
}

/// Locator backed by an external worker process.
pub struct ProcessLocator {
    connector: Connector,
    options: StdMutex<ConfigureOptions>,
    session: StdMutex<Option<Arc<Session>>>,
}

impl ProcessLocator {
    /// Locator that spawns `<worker> server` on demand.
    pub fn new(worker: impl Into<PathBuf>, options: ConfigureOptions) -> Self {
        let worker = worker.into();
        Self::with_connector(Arc::new(move || RpcConnection::spawn(&worker)), options)
    }

    pub fn with_connector(connector: Connector, options: ConfigureOptions) -> Self {
        Self {
            connector,
            options: StdMutex::new(options),
            session: StdMutex::new(None),
        }
    }

    /// Replace the configuration. The worker is reconfigured before the next
    /// request, unless the new options serialize identically.
    pub fn update_options(&self, options: ConfigureOptions) {
        *self.options.lock().unwrap() = options;
    }

    fn current_session(&self) -> Result<Arc<Session>, DiscoveryError> {
        let mut slot = self.session.lock().unwrap();
        if let Some(session) = slot.as_ref() {
            if !session.conn.is_closed() {
                return Ok(session.clone());
            }
            info!("[discovery] Worker connection closed, restarting");
        }

        let session = Arc::new(Session {
            conn: (self.connector)()?,
            configured: Mutex::new(None),
        });
        *slot = Some(session.clone());
        Ok(session)
    }

    /// Get a live session that has acknowledged the current options.
    async fn ready_session(&self, cancel: &CancellationToken) -> Result<Arc<Session>, DiscoveryError> {
        let session = self.current_session()?;
        let options = self.options.lock().unwrap().clone();
        let serialized = serde_json::to_string(&options)?;

        let mut configured = session.configured.lock().await;
        if configured.as_deref() == Some(serialized.as_str()) {
            return Ok(session.clone());
        }

        debug!("[discovery] Configuring worker");
        let outcome = session
            .conn
            .request::<_, serde_json::Value>(METHOD_CONFIGURE, &options, cancel)
            .await;
        match outcome {
            Ok(_) => {
                *configured = Some(serialized);
                drop(configured);
                Ok(session)
            }
            Err(e) => {
                drop(configured);
                self.after_failure(&session, &e);
                Err(e)
            }
        }
    }

    /// A cancelled request leaves the worker busy with work nobody wants, so
    /// the session is killed and the next call starts over.
    fn after_failure(&self, session: &Arc<Session>, error: &DiscoveryError) {
        if !error.is_cancelled() {
            return;
        }
        let mut slot = self.session.lock().unwrap();
        if slot.as_ref().is_some_and(|current| Arc::ptr_eq(current, session)) {
            *slot = None;
        }
        drop(slot);
        info!("[discovery] Request cancelled, stopping worker");
        session.conn.kill();
    }

    async fn run_refresh(
        &self,
        session: &Session,
        options: RefreshOptions,
        cancel: &CancellationToken,
    ) -> Result<Vec<NativeInfo>, DiscoveryError> {
        let mut notifications = session.conn.subscribe();
        let request = session
            .conn
            .request::<_, RefreshSummary>(METHOD_REFRESH, &options, cancel);
        tokio::pin!(request);

        let mut collected = Collected::default();
        let mut followups: FuturesUnordered<BoxFuture<'_, FollowUp>> = FuturesUnordered::new();

        let summary = loop {
            tokio::select! {
                biased;
                Some(notification) = notifications.recv() => {
                    if let Some(pending) = collected.accept(notification) {
                        followups.push(resolve_followup(session, pending, cancel));
                    }
                }
                Some(done) = followups.next(), if !followups.is_empty() => {
                    collected.finish(done)?;
                }
                summary = &mut request => break summary?,
            }
        };

        // Everything streamed before the response is already queued.
        while let Ok(notification) = notifications.try_recv() {
            if let Some(pending) = collected.accept(notification) {
                followups.push(resolve_followup(session, pending, cancel));
            }
        }
        while let Some(done) = followups.next().await {
            collected.finish(done)?;
        }

        debug!(
            "[discovery] Refresh finished in {}ms with {} items",
            summary.duration,
            collected.items.len()
        );
        Ok(collected.items)
    }
}

/// An incomplete environment and the outcome of resolving it.
struct FollowUp {
    partial: NativeEnvInfo,
    resolved: Result<Option<NativeEnvInfo>, DiscoveryError>,
}

fn resolve_followup<'a>(
    session: &'a Session,
    partial: NativeEnvInfo,
    cancel: &'a CancellationToken,
) -> BoxFuture<'a, FollowUp> {
    async move {
        let resolved = match partial.executable.clone() {
            Some(executable) => {
                session
                    .conn
                    .request(METHOD_RESOLVE, &ResolveParams { executable }, cancel)
                    .await
            }
            None => Ok(None),
        };
        FollowUp { partial, resolved }
    }
    .boxed()
}

/// Accumulates refresh output, deduplicated by executable (or prefix).
#[derive(Default)]
struct Collected {
    items: Vec<NativeInfo>,
    seen: HashSet<PathBuf>,
}

impl Collected {
    fn first_sighting(&mut self, key: Option<&PathBuf>) -> bool {
        match key {
            Some(key) => self.seen.insert(key.clone()),
            None => true,
        }
    }

    /// Take a notification; returns an environment that still needs resolving.
    fn accept(&mut self, notification: Notification) -> Option<NativeEnvInfo> {
        match notification {
            Notification::Environment(env) => {
                let key = env.executable.as_ref().or(env.prefix.as_ref()).cloned();
                if !self.first_sighting(key.as_ref()) {
                    return None;
                }
                if env.is_incomplete() && env.executable.is_some() {
                    return Some(env);
                }
                self.items.push(NativeInfo::Environment(env));
                None
            }
            Notification::Manager(manager) => {
                if self.first_sighting(Some(&manager.executable)) {
                    self.items.push(NativeInfo::Manager(manager));
                }
                None
            }
            _ => None,
        }
    }

    fn finish(&mut self, done: FollowUp) -> Result<(), DiscoveryError> {
        let FollowUp { partial, resolved } = done;
        let env = match resolved {
            Ok(Some(resolved)) => merge(partial, resolved),
            Ok(None) => partial,
            Err(e) if e.is_cancelled() => return Err(e),
            Err(e) => {
                warn!(
                    "[discovery] Could not resolve {:?}, keeping partial record: {}",
                    partial.executable, e
                );
                partial
            }
        };
        self.items.push(NativeInfo::Environment(env));
        Ok(())
    }
}

/// Resolved fields win; anything the resolve left out keeps the streamed value.
fn merge(partial: NativeEnvInfo, resolved: NativeEnvInfo) -> NativeEnvInfo {
    NativeEnvInfo {
        display_name: resolved.display_name.or(partial.display_name),
        name: resolved.name.or(partial.name),
        executable: resolved.executable.or(partial.executable),
        kind: resolved.kind.or(partial.kind),
        version: resolved.version.or(partial.version),
        prefix: resolved.prefix.or(partial.prefix),
        manager: resolved.manager.or(partial.manager),
        project: resolved.project.or(partial.project),
        arch: resolved.arch.or(partial.arch),
        symlinks: resolved.symlinks.or(partial.symlinks),
    }
}

impl NativeLocator for ProcessLocator {
    fn refresh<'a>(
        &'a self,
        options: RefreshOptions,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<Vec<NativeInfo>, DiscoveryError>> {
        async move {
            let session = self.ready_session(cancel).await?;
            let result = self.run_refresh(&session, options, cancel).await;
            if let Err(e) = &result {
                self.after_failure(&session, e);
            }
            result
        }
        .boxed()
    }

    fn resolve<'a>(
        &'a self,
        executable: &'a Path,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<Option<NativeEnvInfo>, DiscoveryError>> {
        async move {
            let session = self.ready_session(cancel).await?;
            let params = ResolveParams {
                executable: executable.to_path_buf(),
            };
            let result = session.conn.request(METHOD_RESOLVE, &params, cancel).await;
            if let Err(e) = &result {
                self.after_failure(&session, e);
            }
            result
        }
        .boxed()
    }

    fn shutdown(&self) {
        if let Some(session) = self.session.lock().unwrap().take() {
            info!("[discovery] Stopping worker");
            session.conn.kill();
        }
    }
}

impl Drop for ProcessLocator {
    fn drop(&mut self) {
        self.shutdown();
    }
}
