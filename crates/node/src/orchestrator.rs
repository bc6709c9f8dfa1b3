//! The per-device synchronization state machine
//!
//! A [`Node`] owns the previous snapshot of its root and drives three kinds of round:
//! the periodic patch broadcast, the join round run when the device comes online, and
//! the inbound work triggered by notifications (reconciling for a joining peer or
//! applying published content).

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use color_eyre::Result;
use color_eyre::eyre::{WrapErr, bail, eyre};
use parking_lot::Mutex;
use swarmsync_core::{
    Applier, ApplyReport, BlockManifest, ChangeKind, Chunker, Manifest, Message, Snapshot,
    SyncConfig, detect, reconcile,
};
use swarmsync_transport::{Coordination, InboundHandler, StatusUpdate, Swarm};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::decision::{DecisionProvider, JoinDecision};
use crate::status::{State, SyncStatus};

pub struct Node {
    me: Weak<Node>,
    config: SyncConfig,
    coordination: Arc<dyn Coordination>,
    swarm: Arc<dyn Swarm>,
    decisions: Arc<dyn DecisionProvider>,

    previous: Mutex<Snapshot>,
    /// Single-flight guard for timer ticks and join rounds
    round: tokio::sync::Mutex<()>,
    /// Serializes everything that mutates the tree or the previous snapshot
    apply_gate: tokio::sync::Mutex<()>,
    /// Armed while a join round waits for its pulled blocks
    completion: Mutex<Option<oneshot::Sender<()>>>,

    status: watch::Sender<SyncStatus>,
    state: watch::Sender<State>,
    interval_secs: AtomicU64,
    away: AtomicBool,
    /// Set by `shutdown`; no round or timer starts while it holds
    stopped: AtomicBool,
    timer: Mutex<Option<JoinHandle<()>>>,
    heartbeat: Mutex<Option<JoinHandle<()>>>,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl Node {
    /// Build a node and take its initial snapshot.
    ///
    /// # Errors
    /// Returns an error if the config is invalid or the root cannot be read.
    pub fn new(
        config: SyncConfig,
        coordination: Arc<dyn Coordination>,
        swarm: Arc<dyn Swarm>,
        decisions: Arc<dyn DecisionProvider>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        std::fs::create_dir_all(&config.root)
            .wrap_err_with(|| format!("failed to create {}", config.root.display()))?;
        let previous = Snapshot::capture(&config.root)?;
        info!(
            "{}: watching {} ({} entries)",
            config.device_id,
            config.root.display(),
            previous.len()
        );

        Ok(Arc::new_cyclic(|me| Self {
            me: me.clone(),
            interval_secs: AtomicU64::new(config.interval_in_seconds_check),
            away: AtomicBool::new(config.away),
            stopped: AtomicBool::new(false),
            config,
            coordination,
            swarm,
            decisions,
            previous: Mutex::new(previous),
            round: tokio::sync::Mutex::new(()),
            apply_gate: tokio::sync::Mutex::new(()),
            completion: Mutex::new(None),
            status: watch::Sender::new(SyncStatus::Offline),
            state: watch::Sender::new(State::Monitoring),
            timer: Mutex::new(None),
            heartbeat: Mutex::new(None),
            join: Mutex::new(None),
        }))
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.config.device_id
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.config.root
    }

    #[must_use]
    pub fn subscribe_status(&self) -> watch::Receiver<SyncStatus> {
        self.status.subscribe()
    }

    #[must_use]
    pub fn subscribe_state(&self) -> watch::Receiver<State> {
        self.state.subscribe()
    }

    #[must_use]
    pub fn current_status(&self) -> SyncStatus {
        *self.status.borrow()
    }

    #[must_use]
    pub fn current_state(&self) -> State {
        *self.state.borrow()
    }

    #[must_use]
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.load(Ordering::SeqCst))
    }

    #[must_use]
    pub fn is_away(&self) -> bool {
        self.away.load(Ordering::SeqCst)
    }

    fn arc(&self) -> Result<Arc<Self>> {
        self.me.upgrade().ok_or_else(|| eyre!("node is shutting down"))
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    fn set_status(&self, status: SyncStatus) {
        if self.status.send_replace(status) != status {
            debug!("{}: {status}", self.id());
        }
    }

    fn set_state(&self, state: State) {
        if self.state.send_replace(state) != state {
            debug!("{}: state {state:?}", self.id());
        }
    }

    /// Start the heartbeat and the periodic change-detection timer.
    ///
    /// The first heartbeat brings the device online, which starts a join round.
    ///
    /// # Errors
    /// Returns an error if the node is already being dropped.
    pub fn start(&self) -> Result<()> {
        let node = self.arc()?;
        self.stopped.store(false, Ordering::SeqCst);
        let period = self.config.heartbeat_interval();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                node.beat().await;
            }
        });
        if let Some(old) = self.heartbeat.lock().replace(task) {
            old.abort();
        }
        self.restart_timer()
    }

    /// Stop background tasks and sign off from the coordinator.
    ///
    /// An in-flight join round is aborted, and a round still running on another task
    /// finishes without re-arming the timer.
    pub async fn shutdown(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        for slot in [&self.heartbeat, &self.timer, &self.join] {
            if let Some(task) = slot.lock().take() {
                task.abort();
            }
        }
        *self.completion.lock() = None;
        if let Err(e) = self
            .coordination
            .update_status(self.id(), StatusUpdate::Offline)
            .await
        {
            debug!("{}: sign-off failed: {e}", self.id());
        }
        self.set_status(SyncStatus::Offline);
    }

    /// Send one heartbeat; a transition to online triggers a join round
    pub async fn beat(&self) {
        if self.is_stopped() {
            return;
        }
        match self.coordination.heartbeat(self.id()).await {
            Ok(ack) if ack.came_online => {
                info!("{}: online", self.id());
                match self.arc() {
                    Ok(node) => self.spawn_join(node),
                    Err(e) => debug!("{e}"),
                }
            }
            Ok(_) => {}
            Err(e) => {
                warn!("{}: heartbeat failed: {e}", self.id());
                self.set_status(SyncStatus::Offline);
            }
        }
    }

    fn spawn_join(&self, node: Arc<Self>) {
        let mut slot = self.join.lock();
        if self.is_stopped() {
            return;
        }
        let task = tokio::spawn(async move {
            if let Err(e) = node.join_round().await {
                warn!("{}: join round failed: {e:#}", node.id());
            }
        });
        if let Some(old) = slot.replace(task) {
            old.abort();
        }
    }

    /// Change the tick period; the timer restarts without leaving `Monitoring`
    ///
    /// # Errors
    /// Returns an error for a zero interval.
    pub fn set_interval(&self, secs: u64) -> Result<()> {
        if secs == 0 {
            bail!("interval must be positive");
        }
        self.interval_secs.store(secs, Ordering::SeqCst);
        self.restart_timer()
    }

    /// # Errors
    /// Returns an error if the coordinator cannot be told.
    pub async fn set_away(&self, away: bool) -> Result<()> {
        self.away.store(away, Ordering::SeqCst);
        self.coordination
            .update_status(self.id(), StatusUpdate::Away(away))
            .await
    }

    fn restart_timer(&self) -> Result<()> {
        let node = self.arc()?;
        let mut slot = self.timer.lock();
        if self.is_stopped() {
            debug!("{}: stopped, timer stays off", self.id());
            return Ok(());
        }
        let period = self.interval();
        let task = tokio::spawn(async move {
            let start = tokio::time::Instant::now() + period;
            let mut ticker = tokio::time::interval_at(start, period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(e) = node.tick().await {
                    warn!("{}: periodic round failed: {e:#}", node.id());
                    node.set_status(SyncStatus::RoundIncomplete);
                }
            }
        });
        if let Some(old) = slot.replace(task) {
            old.abort();
        }
        Ok(())
    }

    /// One change-detection round: broadcast local edits as a patch.
    ///
    /// Skipped when another round is in flight or the device is away. On failure the
    /// previous snapshot is kept so the next tick retries the same changes.
    ///
    /// # Errors
    /// Returns an error if the tree cannot be read or the patch cannot be published.
    pub async fn tick(&self) -> Result<()> {
        let Ok(_round) = self.round.try_lock() else {
            debug!("{}: round in flight, skipping tick", self.id());
            return Ok(());
        };
        if self.is_away() || self.is_stopped() {
            return Ok(());
        }
        let _gate = self.apply_gate.lock().await;

        let root = self.config.root.clone();
        let previous = self.previous.lock().clone();
        let (current, changes) = tokio::task::spawn_blocking(move || -> Result<_> {
            let current = Snapshot::capture(&root)?;
            let changes = detect(&previous, &current)?;
            Ok((current, changes))
        })
        .await??;

        let Some(changes) = changes else {
            self.set_status(SyncStatus::Synchronized);
            return Ok(());
        };

        self.set_status(SyncStatus::GeneratingManifest);
        info!("{}: broadcasting {} changes", self.id(), changes.len());
        let document = Manifest::new(changes).encode()?;
        let locator = self.swarm.publish(Bytes::from(document)).await?;
        let recipients = self
            .coordination
            .announce(self.id(), &locator, ChangeKind::Patch, None)
            .await?;
        if recipients == 0 {
            self.swarm.stop_seeding(&locator).await?;
        }

        *self.previous.lock() = current;
        self.coordination.record_synchronization(self.id()).await?;
        self.set_status(SyncStatus::Synchronized);
        Ok(())
    }

    /// Run the join protocol after coming online.
    ///
    /// With no other online, non-away peers the node just resumes monitoring.
    /// Otherwise the decision provider picks Overwrite (pull the swarm's state) or
    /// Transfer (pull, then restore the local backup so the next tick pushes it out).
    ///
    /// # Errors
    /// Returns an error if the peer count cannot be fetched or the round fails.
    pub async fn join_round(&self) -> Result<()> {
        let _round = self.round.lock().await;
        if self.is_stopped() {
            return Ok(());
        }

        if self.is_away() {
            self.set_state(State::Monitoring);
            self.set_status(SyncStatus::Synchronized);
            return Ok(());
        }

        let peers = self.coordination.broadcast_targets(self.id()).await?.len();
        if peers == 0 {
            debug!("{}: no peers online", self.id());
            self.set_state(State::Monitoring);
            self.set_status(SyncStatus::Synchronized);
            return self.restart_timer();
        }

        self.set_state(State::AwaitingPeerDecision);
        let decision = self.decisions.decide(peers).await;
        if self.is_stopped() {
            debug!("{}: stopped while deciding, abandoning join", self.id());
            self.set_state(State::Monitoring);
            return Ok(());
        }
        info!("{}: joining {peers} peers with {decision}", self.id());

        let result = match decision {
            JoinDecision::Overwrite => self.pull(State::Pulling).await,
            JoinDecision::Transfer => self.transfer().await,
        };

        self.set_state(State::Monitoring);
        self.restart_timer()?;
        match result {
            Ok(()) => {
                self.set_status(SyncStatus::Synchronized);
                Ok(())
            }
            Err(e) => {
                self.set_status(SyncStatus::RoundIncomplete);
                Err(e)
            }
        }
    }

    /// Push the local chunk manifest and wait until the peer's blocks are applied
    async fn pull(&self, state: State) -> Result<()> {
        self.set_state(state);
        self.set_status(SyncStatus::WaitingForReconciliation);

        let (tx, rx) = oneshot::channel();
        *self.completion.lock() = Some(tx);

        let result = self.submit_and_wait(rx).await;
        self.completion.lock().take();
        result
    }

    async fn submit_and_wait(&self, rx: oneshot::Receiver<()>) -> Result<()> {
        let root = self.config.root.clone();
        let block_size = self.config.block_size_in_bytes;
        let manifest = tokio::task::spawn_blocking(move || -> Result<Vec<u8>> {
            Chunker::new(root, block_size)?.chunk()?.encode()
        })
        .await??;

        let target = self
            .coordination
            .submit_block_manifest(self.id(), manifest)
            .await?;
        debug!("{}: reconciling against {target}", self.id());

        match tokio::time::timeout(self.config.reconcile_timeout(), rx).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => bail!("reconciliation with {target} failed"),
            Err(_) => bail!("timed out waiting for reconciliation with {target}"),
        }
    }

    async fn transfer(&self) -> Result<()> {
        let root = self.config.root.clone();
        let backup = tokio::task::spawn_blocking(move || Snapshot::capture(&root)).await??;

        self.pull(State::Pushing).await?;

        self.set_state(State::Reconciling);
        let _gate = self.apply_gate.lock().await;
        let applier = Applier::new(&self.config.root);
        tokio::task::spawn_blocking(move || applier.restore(&backup)).await??;
        info!("{}: restored local state, next tick pushes it out", self.id());
        Ok(())
    }

    /// Reconcile a joining peer's manifest and publish the blocks it needs
    async fn serve_block_manifest(&self, requester: String, encoded: Vec<u8>) -> Result<()> {
        let remote = BlockManifest::decode(&encoded)?;

        let document = {
            let _gate = self.apply_gate.lock().await;
            self.set_status(SyncStatus::GeneratingManifest);
            let root = self.config.root.clone();
            let block_size = self.config.block_size_in_bytes;
            tokio::task::spawn_blocking(move || -> Result<Vec<u8>> {
                let local = Chunker::new(&root, block_size)?.chunk()?;
                let changes = reconcile(&root, &local, &remote)?;
                Manifest::new(changes).encode()
            })
            .await??
        };

        let locator = self.swarm.publish(Bytes::from(document)).await?;
        let recipients = self
            .coordination
            .announce(self.id(), &locator, ChangeKind::Block, Some(&requester))
            .await?;
        if recipients == 0 {
            self.swarm.stop_seeding(&locator).await?;
        }
        self.coordination.record_synchronization(self.id()).await?;
        self.set_status(SyncStatus::Synchronized);
        info!("{}: served blocks to {requester}", self.id());
        Ok(())
    }

    /// Pull a published manifest and apply it
    async fn receive(&self, kind: ChangeKind, locator: String, publisher: String) -> Result<()> {
        let result = self.pull_and_apply(kind, &locator).await;

        if let Err(e) = self
            .coordination
            .report_completion(self.id(), &locator)
            .await
        {
            warn!("{}: could not report completion of {locator}: {e}", self.id());
        }

        match result {
            Ok(report) => {
                info!(
                    "{}: applied {kind} changes from {publisher} ({} modified, {} skipped)",
                    self.id(),
                    report.modified,
                    report.skipped.len()
                );
                if kind == ChangeKind::Block {
                    if let Some(tx) = self.completion.lock().take() {
                        let _ = tx.send(());
                    }
                }
                self.coordination.record_synchronization(self.id()).await?;
                self.set_status(SyncStatus::Synchronized);
                Ok(())
            }
            Err(e) => {
                error!("{}: failed to apply {locator}: {e:#}", self.id());
                if kind == ChangeKind::Block {
                    self.completion.lock().take();
                }
                self.set_status(SyncStatus::ErrorApplying);
                Err(e)
            }
        }
    }

    /// Retrieve and apply a manifest, then recapture the tree as the new baseline.
    ///
    /// Local edits made since the last tick are folded into that baseline and are not
    /// broadcast by a later tick.
    async fn pull_and_apply(&self, kind: ChangeKind, locator: &str) -> Result<ApplyReport> {
        let document = self.swarm.retrieve(locator).await?;
        let manifest = Manifest::decode_expecting(&document, kind)?;

        let _gate = self.apply_gate.lock().await;
        self.set_status(SyncStatus::ApplyingModifications);
        let root: PathBuf = self.config.root.clone();
        let (report, refreshed) = tokio::task::spawn_blocking(move || -> Result<_> {
            let report = Applier::new(&root).apply(&manifest.changes)?;
            Ok((report, Snapshot::capture(&root)?))
        })
        .await??;

        *self.previous.lock() = refreshed;
        Ok(report)
    }

    fn spawn_work<F>(&self, what: &'static str, work: F) -> Result<()>
    where
        F: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        let id = self.id().to_string();
        tokio::spawn(async move {
            if let Err(e) = work.await {
                warn!("{id}: {what} failed: {e:#}");
            }
        });
        Ok(())
    }
}

#[async_trait]
impl InboundHandler for Node {
    /// Acknowledge at once; reconciliation and application run on their own tasks so a
    /// relay never waits on another device's round
    async fn handle(&self, message: Message) -> Result<()> {
        match message {
            Message::BlockManifest { requester, manifest } => {
                let node = self.arc()?;
                self.spawn_work("serving blocks", async move {
                    node.serve_block_manifest(requester, manifest).await
                })
            }
            Message::ContentAvailable {
                kind,
                locator,
                publisher,
            } => {
                let node = self.arc()?;
                self.spawn_work("applying content", async move {
                    node.receive(kind, locator, publisher).await
                })
            }
            Message::CompleteSeeding { locator } => self.swarm.stop_seeding(&locator).await,
            other => bail!("unexpected {} notification", other.name()),
        }
    }
}
