//! Per-PR preview lifecycle.
//!
//! A [`PreviewInstance`] owns one PR's checkout directory and, while active, a
//! site server, the port it listens on and a staleness timer. Every public
//! operation is queued on the instance's [`OperationQueue`], so for a given PR
//! fetches, spawns and teardowns never overlap.

use std::{
    net::IpAddr,
    path::PathBuf,
    sync::{Arc, Mutex, MutexGuard, Weak},
    time::Duration,
};

use anyhow::Context;
use chrono::{DateTime, Utc};
use preview_instance::{InstanceState, InstanceStatus, PrDetails, PrNumber};
use tokio::task::AbortHandle;

use crate::{
    archive::ArchiveFetcher,
    comments::Templates,
    github::GithubApi,
    op_queue::OperationQueue,
    port_alloc::{PortAllocator, PortError, preferred_port},
    registry::InstanceRegistry,
    site_server::{LaunchSpec, SiteLauncher, SiteServer},
};

#[derive(Debug, Clone)]
pub struct InstanceSettings {
    /// Parent of every PR checkout (`<site_root>/<pr>`).
    pub site_root: PathBuf,
    /// Directory inside the checkout the site server runs in.
    pub site_subdir: String,
    /// A PR prefers port `port_base + pr`.
    pub port_base: u16,
    pub stale_after: Duration,
    pub bind_addr: IpAddr,
}

/// Collaborators shared by every instance.
pub struct InstanceEnv {
    pub ports: Arc<Mutex<PortAllocator>>,
    pub fetcher: Arc<dyn ArchiveFetcher>,
    pub launcher: Arc<dyn SiteLauncher>,
    pub github: Arc<dyn GithubApi>,
    pub templates: Templates,
    pub settings: InstanceSettings,
}

impl InstanceEnv {
    pub(crate) fn lock_ports(&self) -> MutexGuard<'_, PortAllocator> {
        self.ports.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ActivationError {
    #[error("site directory {} is missing", .0.display())]
    Malformed(PathBuf),
    #[error(transparent)]
    Ports(#[from] PortError),
    #[error("launch site server: {0:#}")]
    Launch(anyhow::Error),
}

struct StaleTimer {
    // Activation this timer belongs to; a newer activation makes it moot.
    epoch: u64,
    expires_at: Option<DateTime<Utc>>,
    handle: AbortHandle,
}

impl Drop for StaleTimer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Port, server and timer exist together or not at all.
struct ActiveServer {
    port: u16,
    server: Box<dyn SiteServer>,
    stale_timer: StaleTimer,
}

struct Slot {
    details: PrDetails,
    active: Option<ActiveServer>,
    epoch: u64,
    // A forced destroy could not leave the registry because something was
    // queued behind it. Cleared by the next operation; an expire finishes it.
    release_pending: bool,
}

pub struct PreviewInstance {
    pr: PrNumber,
    env: Arc<InstanceEnv>,
    registry: Weak<InstanceRegistry>,
    queue: OperationQueue,
    slot: Mutex<Slot>,
}

impl PreviewInstance {
    pub(crate) fn new(
        details: PrDetails,
        env: Arc<InstanceEnv>,
        registry: Weak<InstanceRegistry>,
    ) -> Arc<Self> {
        let pr = details.number;
        Arc::new(Self {
            pr,
            env,
            registry,
            queue: OperationQueue::new(format!("pr-{pr}")),
            slot: Mutex::new(Slot {
                details,
                active: None,
                epoch: 0,
                release_pending: false,
            }),
        })
    }

    pub fn pr(&self) -> PrNumber {
        self.pr
    }

    pub fn details(&self) -> PrDetails {
        self.lock().details.clone()
    }

    pub fn is_active(&self) -> bool {
        self.lock().active.is_some()
    }

    pub fn port(&self) -> Option<u16> {
        self.lock().active.as_ref().map(|a| a.port)
    }

    pub(crate) fn queue(&self) -> &OperationQueue {
        &self.queue
    }

    /// `<site_root>/<pr>`, the unpacked branch.
    pub fn checkout_dir(&self) -> PathBuf {
        self.env.settings.site_root.join(self.pr.to_string())
    }

    fn site_dir(&self) -> PathBuf {
        self.checkout_dir().join(&self.env.settings.site_subdir)
    }

    pub fn status(&self) -> InstanceStatus {
        let present = self.checkout_dir().is_dir();
        let slot = self.lock();
        let active = slot.active.as_ref();
        InstanceStatus {
            pr: self.pr,
            state: InstanceState::from_parts(present, active.is_some()),
            port: active.map(|a| a.port),
            pid: active.and_then(|a| a.server.pid()),
            expires_at: active.and_then(|a| a.stale_timer.expires_at),
            queued: self.queue.waiting(),
        }
    }

    /// Resolves when everything queued so far (and anything queued meanwhile) has run.
    pub fn current_run(&self) -> impl Future<Output = ()> + Send + 'static {
        self.queue.current_run()
    }

    /// First preview for the PR. Falls through to a rebuild when a checkout
    /// is already on disk.
    pub fn download(self: &Arc<Self>) {
        self.enqueue_work(Arc::clone(self).run_download());
    }

    /// Re-fetches the branch and restarts the server. `refresh` replaces the
    /// stored PR details first.
    pub fn rebuild(self: &Arc<Self>, refresh: Option<PrDetails>) {
        self.enqueue_work(Arc::clone(self).run_rebuild(refresh));
    }

    /// Serves the checkout already on disk again, e.g. after the preview went
    /// stale. Downloads when there is nothing on disk.
    pub fn relight(self: &Arc<Self>) {
        self.enqueue_work(Arc::clone(self).run_relight());
    }

    /// Stops the server and deletes the checkout. With `force_release` the
    /// instance also leaves the registry, unless more work was queued behind
    /// the teardown.
    pub fn destroy(self: &Arc<Self>, force_release: bool) {
        self.enqueue_work(Arc::clone(self).run_destroy(force_release));
    }

    // Work that wants the instance kept around. Expiry goes straight to the
    // queue instead.
    fn enqueue_work<F>(self: &Arc<Self>, op: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let this = Arc::clone(self);
        self.queue.enqueue(async move {
            this.lock().release_pending = false;
            op.await;
        });
    }

    async fn run_download(self: Arc<Self>) {
        if self.checkout_dir().exists() {
            return self.run_rebuild(None).await;
        }
        let details = self.details();
        if let Err(err) = self.fetch(&details).await {
            tracing::warn!(pr = %self.pr, op = "download", error = %format!("{err:#}"), "fetch failed");
            return;
        }
        match self.activate() {
            Ok(port) => {
                let body = self.env.templates.new_preview(&details.author, port);
                self.comment(&details, &body).await;
            }
            Err(err) => {
                tracing::warn!(pr = %self.pr, op = "download", error = %err, "activation failed");
                let body = self.env.templates.no_resources(&details.author);
                self.comment(&details, &body).await;
            }
        }
    }

    async fn run_rebuild(self: Arc<Self>, refresh: Option<PrDetails>) {
        if let Some(details) = refresh {
            self.lock().details = details;
        }
        let details = self.details();

        self.deactivate();
        if let Err(err) = self.remove_checkout().await {
            tracing::warn!(pr = %self.pr, op = "rebuild", error = %format!("{err:#}"), "could not clear checkout");
            return;
        }
        if let Err(err) = self.fetch(&details).await {
            tracing::warn!(pr = %self.pr, op = "rebuild", error = %format!("{err:#}"), "fetch failed");
            return;
        }
        match self.activate() {
            Ok(port) => {
                let body = self.env.templates.updated(port);
                self.comment(&details, &body).await;
            }
            Err(ActivationError::Ports(err)) => {
                tracing::warn!(pr = %self.pr, op = "rebuild", error = %err, "no port for preview");
                let body = self.env.templates.no_resources(&details.author);
                self.comment(&details, &body).await;
            }
            Err(err) => {
                tracing::warn!(pr = %self.pr, op = "rebuild", error = %err, "activation failed");
            }
        }
    }

    async fn run_relight(self: Arc<Self>) {
        if !self.checkout_dir().exists() {
            return self.run_download().await;
        }
        let was_active = self.is_active();
        let details = self.details();
        match self.activate() {
            Ok(_) if was_active => {
                tracing::debug!(pr = %self.pr, "stale timer re-armed");
            }
            Ok(port) => {
                let body = self.env.templates.updated(port);
                self.comment(&details, &body).await;
            }
            Err(err) => {
                tracing::warn!(pr = %self.pr, op = "relight", error = %err, "activation failed");
                let body = self.env.templates.no_resources(&details.author);
                self.comment(&details, &body).await;
            }
        }
    }

    async fn run_destroy(self: Arc<Self>, force_release: bool) {
        self.deactivate();
        if let Err(err) = self.remove_checkout().await {
            tracing::warn!(pr = %self.pr, op = "destroy", error = %format!("{err:#}"), "could not remove checkout");
        }
        if force_release {
            let released = self.leave_registry();
            if !released {
                self.lock().release_pending = true;
            }
            tracing::info!(pr = %self.pr, released, "preview destroyed");
        } else {
            tracing::info!(pr = %self.pr, "preview destroyed");
        }
    }

    async fn run_expire(self: Arc<Self>, epoch: u64) {
        let current = self
            .lock()
            .active
            .as_ref()
            .is_some_and(|a| a.stale_timer.epoch == epoch);
        if current {
            tracing::info!(pr = %self.pr, "preview went stale");
            self.deactivate();
        }

        let pending = self.lock().release_pending;
        if pending && self.leave_registry() {
            self.lock().release_pending = false;
            tracing::info!(pr = %self.pr, "deferred release done");
        }
    }

    fn leave_registry(self: &Arc<Self>) -> bool {
        self.registry
            .upgrade()
            .is_some_and(|registry| registry.remove_if_idle(self))
    }

    async fn fetch(&self, details: &PrDetails) -> anyhow::Result<()> {
        let dest = self.checkout_dir();
        tokio::fs::create_dir_all(&self.env.settings.site_root)
            .await
            .context("create site root")?;
        self.env
            .fetcher
            .fetch(&details.source_repo, &details.branch, &dest)
            .await
            .with_context(|| format!("fetch {}@{}", details.source_repo, details.branch))
    }

    async fn remove_checkout(&self) -> anyhow::Result<()> {
        let dir = self.checkout_dir();
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("remove {}", dir.display())),
        }
    }

    /// Binds a port, starts the server and arms the stale timer. On failure
    /// nothing is left held. An already active instance only gets a fresh timer.
    fn activate(self: &Arc<Self>) -> Result<u16, ActivationError> {
        let site_dir = self.site_dir();
        if !site_dir.is_dir() {
            return Err(ActivationError::Malformed(site_dir));
        }

        let mut slot = self.lock();
        slot.epoch += 1;
        let epoch = slot.epoch;

        if let Some(active) = slot.active.as_mut() {
            active.stale_timer = self.arm_stale_timer(epoch);
            return Ok(active.port);
        }

        let settings = &self.env.settings;
        let port = self
            .env
            .lock_ports()
            .bind_preferred(preferred_port(settings.port_base, self.pr), self.pr)?;

        let spec = LaunchSpec {
            pr: self.pr,
            cwd: &site_dir,
            port,
            bind_addr: settings.bind_addr,
        };
        let server = match self.env.launcher.launch(&spec) {
            Ok(server) => server,
            Err(err) => {
                let _ = self.env.lock_ports().release(port);
                return Err(ActivationError::Launch(err));
            }
        };

        tracing::info!(pr = %self.pr, port, pid = ?server.pid(), "preview active");
        slot.active = Some(ActiveServer {
            port,
            server,
            stale_timer: self.arm_stale_timer(epoch),
        });
        Ok(port)
    }

    /// Stops the server and frees its port. No-op when inactive.
    fn deactivate(&self) {
        let mut slot = self.lock();
        let Some(mut active) = slot.active.take() else {
            return;
        };
        active.server.kill();
        if let Err(err) = self.env.lock_ports().release(active.port) {
            tracing::warn!(pr = %self.pr, port = active.port, error = %err, "port release failed");
        }
        tracing::info!(pr = %self.pr, port = active.port, "preview stopped");
    }

    fn arm_stale_timer(self: &Arc<Self>, epoch: u64) -> StaleTimer {
        let stale_after = self.env.settings.stale_after;
        let expires_at = chrono::TimeDelta::from_std(stale_after)
            .ok()
            .and_then(|d| Utc::now().checked_add_signed(d));

        let weak = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(stale_after).await;
            if let Some(instance) = weak.upgrade() {
                instance
                    .queue
                    .enqueue(Arc::clone(&instance).run_expire(epoch));
            }
        })
        .abort_handle();

        StaleTimer {
            epoch,
            expires_at,
            handle,
        }
    }

    async fn comment(&self, details: &PrDetails, body: &str) {
        if let Err(err) = self
            .env
            .github
            .post_comment(&details.target_owner, &details.target_repo, self.pr, body)
            .await
        {
            tracing::warn!(pr = %self.pr, error = %format!("{err:#}"), "posting comment failed");
        }
    }

    fn lock(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl std::fmt::Debug for PreviewInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PreviewInstance")
            .field("pr", &self.pr)
            .field("port", &self.port())
            .finish_non_exhaustive()
    }
}
