//! The background task behind one running stream.
//!
//! Each cycle the poller:
//! 1. snapshots the listener registry (reinstalling the change filter if
//!    membership changed or the node lost the filter)
//! 2. reads the chain head and emits a block-hash notice if it advanced
//! 3. drains `eth_getFilterChanges` into the held-log buffer
//! 4. fetches one `eth_getLogs` page for every listener still catching up
//! 5. matches, orders and delivers events, advancing checkpoints after each
//!    successful send
//!
//! Transport failures never end the task; only cancellation does.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use chainstream_core::{
    Backoff, BlockHashEvent, Checkpoint, Listener, ListenerEvent, ListenerRegistry, LogQuery,
    RawLog, RegistrySnapshot, ResolvedFilter, StreamConfig,
};

use crate::decoder::decode_event;
use crate::rpc::{EvmRpcClient, FilterId};
use crate::transport::TransportError;

/// Head value published before the poller has read the chain head.
pub const HEAD_UNKNOWN: i64 = -1;

/// Lifecycle of a poller task, published on a `watch` channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollerState {
    Installing,
    CatchingUp,
    Live,
    Draining,
    Exited,
}

impl PollerState {
    pub fn is_exited(&self) -> bool {
        matches!(self, Self::Exited)
    }
}

/// Where a stream delivers its output.
#[derive(Debug, Clone)]
pub struct StreamOutputs {
    pub events: mpsc::Sender<ListenerEvent>,
    pub block_notices: Option<mpsc::Sender<BlockHashEvent>>,
}

#[derive(Debug, Error)]
enum CycleError {
    #[error("cancelled")]
    Cancelled,
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("event consumer closed")]
    ConsumerClosed,
}

enum CycleOutcome {
    Idle,
    CatchingUp,
    Live,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    CatchingUp { next_block: i64 },
    Live,
}

/// Per-listener scan state. `covered` is the highest block for which every
/// matching log has been fetched, and only holds for the registry instance
/// the entry was planned for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Progress {
    instance: u64,
    covered: i64,
    phase: Phase,
}

impl Progress {
    fn plan(instance: u64, checkpoint: Checkpoint, covered: Option<i64>, head: i64) -> Self {
        let (next, live) = match covered {
            Some(c) => {
                let next = checkpoint.block.max(c + 1);
                (next, next > head)
            }
            // A fresh listener at the head leaves the head to the change filter.
            None => (checkpoint.block, checkpoint.block >= head),
        };
        if live {
            Self {
                instance,
                covered: covered.map_or(head, |c| c.max(head)),
                phase: Phase::Live,
            }
        } else {
            Self {
                instance,
                covered: next - 1,
                phase: Phase::CatchingUp { next_block: next },
            }
        }
    }
}

struct InstalledFilter {
    id: FilterId,
    generation: u64,
}

struct Page {
    listener_id: Uuid,
    to_block: i64,
    done: bool,
    logs: Vec<RawLog>,
}

struct Match<'a> {
    position: Checkpoint,
    instance: u64,
    listener: &'a Listener,
    filter: &'a ResolvedFilter,
    log: RawLog,
}

/// Publishes `Exited` however the poller goes away, including a panic or
/// the task being dropped before it ever ran.
struct ExitGuard(Arc<watch::Sender<PollerState>>);

impl Drop for ExitGuard {
    fn drop(&mut self) {
        self.0.send_replace(PollerState::Exited);
    }
}

pub struct StreamPoller<C> {
    stream_id: Uuid,
    client: Arc<C>,
    registry: Arc<ListenerRegistry>,
    config: StreamConfig,
    outputs: StreamOutputs,
    cancel: CancellationToken,
    head: Arc<AtomicI64>,
    state: Arc<watch::Sender<PollerState>>,
    filter: Option<InstalledFilter>,
    progress: HashMap<Uuid, Progress>,
    held: Vec<RawLog>,
    last_notice: Option<i64>,
    backoff: Backoff,
    _exit: ExitGuard,
}

impl<C: EvmRpcClient> StreamPoller<C> {
    pub fn new(
        client: Arc<C>,
        registry: Arc<ListenerRegistry>,
        config: StreamConfig,
        outputs: StreamOutputs,
        cancel: CancellationToken,
    ) -> Self {
        let (tx, _) = watch::channel(PollerState::Installing);
        let state = Arc::new(tx);
        Self {
            stream_id: registry.stream_id(),
            client,
            registry,
            backoff: Backoff::new(config.retry.clone()),
            config,
            outputs,
            cancel,
            head: Arc::new(AtomicI64::new(HEAD_UNKNOWN)),
            _exit: ExitGuard(state.clone()),
            state,
            filter: None,
            progress: HashMap::new(),
            held: Vec::new(),
            last_notice: None,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<PollerState> {
        self.state.subscribe()
    }

    /// Shared view of the last observed chain head.
    pub fn head_handle(&self) -> Arc<AtomicI64> {
        self.head.clone()
    }

    pub async fn run(mut self) {
        info!(stream = %self.stream_id, listeners = self.registry.len(), "stream poller started");
        loop {
            let delay = match self.cycle().await {
                Ok(outcome) => {
                    self.backoff.reset();
                    match outcome {
                        CycleOutcome::CatchingUp => Duration::ZERO,
                        CycleOutcome::Idle | CycleOutcome::Live => self.config.poll_interval(),
                    }
                }
                Err(CycleError::Cancelled) => break,
                Err(e) => {
                    let delay = self.backoff.next_delay();
                    warn!(
                        stream = %self.stream_id,
                        error = %e,
                        failures = self.backoff.failures(),
                        retry_in_ms = delay.as_millis() as u64,
                        "poll cycle failed"
                    );
                    delay
                }
            };
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        self.set_state(PollerState::Draining);
        info!(stream = %self.stream_id, "stream poller stopped");
    }

    async fn cycle(&mut self) -> Result<CycleOutcome, CycleError> {
        let snapshot = self.registry.snapshot();
        self.forget_stale(&snapshot);

        if snapshot.listeners.is_empty() {
            if let Some(old) = self.filter.take() {
                self.uninstall(old).await?;
            }
            self.held.clear();
            let head = guarded(&self.cancel, self.client.block_number()).await?;
            self.observe_head(head).await?;
            self.set_state(PollerState::Live);
            debug!(stream = %self.stream_id, head, "idle poll cycle");
            return Ok(CycleOutcome::Idle);
        }

        let installed_generation = self.filter.as_ref().map(|f| f.generation);
        let snapshot = if installed_generation != Some(snapshot.generation) {
            self.install(&snapshot).await?;
            // Install may have pinned `latest` checkpoints.
            let snapshot = self.registry.snapshot();
            self.forget_stale(&snapshot);
            snapshot
        } else {
            snapshot
        };

        let head = guarded(&self.cancel, self.client.block_number()).await?;
        self.observe_head(head).await?;

        let filter_id = match &self.filter {
            Some(f) => f.id.clone(),
            None => return Err(TransportError::Other("change filter not installed".into()).into()),
        };
        let changes = match guarded(&self.cancel, self.client.get_filter_changes(&filter_id)).await
        {
            Ok(changes) => changes,
            Err(CycleError::Transport(e)) => {
                if e.is_filter_not_found() {
                    // Reinstall next cycle; the scanned range covers the gap.
                    warn!(stream = %self.stream_id, filter = %filter_id, "change filter lost by node");
                    self.filter = None;
                }
                return Err(e.into());
            }
            Err(e) => return Err(e),
        };
        self.held
            .extend(changes.into_iter().filter(|l| !l.is_removed() && l.position().is_some()));

        let pages = self.fetch_pages(&snapshot, head).await?;
        let turning_live: HashSet<Uuid> =
            pages.iter().filter(|p| p.done).map(|p| p.listener_id).collect();

        let mut matches = Vec::new();
        for l in &snapshot.listeners {
            let Some(p) = self.progress.get(&l.id) else {
                continue;
            };
            if p.phase == Phase::Live || turning_live.contains(&l.id) {
                for log in &self.held {
                    push_match(&mut matches, l, p.instance, log);
                }
            }
        }
        for page in &pages {
            let Some(p) = self.progress.get(&page.listener_id) else {
                continue;
            };
            if let Some(l) = snapshot.listeners.iter().find(|l| l.id == page.listener_id) {
                for log in page.logs.iter().filter(|log| !log.is_removed()) {
                    push_match(&mut matches, l, p.instance, log);
                }
            }
        }
        matches.sort_by(|a, b| (a.position, a.listener.id).cmp(&(b.position, b.listener.id)));
        matches.dedup_by(|a, b| a.position == b.position && a.listener.id == b.listener.id);

        let delivered = self.deliver(matches).await?;

        for page in &pages {
            let Some(p) = self.progress.get_mut(&page.listener_id) else {
                continue;
            };
            if page.done {
                p.covered = head;
                p.phase = Phase::Live;
                info!(stream = %self.stream_id, listener = %page.listener_id, head, "listener caught up");
            } else {
                p.covered = page.to_block;
                p.phase = Phase::CatchingUp {
                    next_block: page.to_block.saturating_add(1),
                };
            }
        }
        for p in self.progress.values_mut() {
            if p.phase == Phase::Live {
                p.covered = p.covered.max(head);
            }
        }

        let still_catching: Vec<(&Listener, i64)> = snapshot
            .listeners
            .iter()
            .filter_map(|l| match self.progress.get(&l.id) {
                Some(Progress {
                    covered,
                    phase: Phase::CatchingUp { .. },
                    ..
                }) => Some((l, *covered)),
                _ => None,
            })
            .collect();
        self.held.retain(|log| {
            still_catching.iter().any(|(l, covered)| {
                log.block().is_some_and(|b| b > *covered)
                    && l.matching_filter(&log.address, &log.topics).is_some()
            })
        });

        debug!(
            stream = %self.stream_id,
            head,
            delivered,
            catching_up = still_catching.len(),
            held = self.held.len(),
            "poll cycle complete"
        );

        if still_catching.is_empty() {
            self.set_state(PollerState::Live);
            Ok(CycleOutcome::Live)
        } else {
            self.set_state(PollerState::CatchingUp);
            Ok(CycleOutcome::CatchingUp)
        }
    }

    async fn install(&mut self, snapshot: &RegistrySnapshot) -> Result<(), CycleError> {
        self.set_state(PollerState::Installing);
        if let Some(old) = self.filter.take() {
            self.uninstall(old).await?;
        }

        let mut query = LogQuery::default();
        for l in &snapshot.listeners {
            for address in l.addresses() {
                if !query.addresses.contains(&address) {
                    query.addresses.push(address);
                }
            }
            for topic in l.topic0s() {
                if !query.topic0s.contains(&topic) {
                    query.topic0s.push(topic);
                }
            }
        }

        // Filter before head: anything mined after the head read is
        // guaranteed to show up in the filter's changes.
        let id = guarded(&self.cancel, self.client.new_filter(&query)).await?;
        let head = guarded(&self.cancel, self.client.block_number()).await?;
        self.head.store(head, Ordering::Release);

        for l in &snapshot.listeners {
            let Some(instance) = snapshot.instance(l.id) else {
                continue;
            };
            let checkpoint = match l.checkpoint {
                Some(cp) => cp,
                None => match self.registry.resolve_latest(l.id, head) {
                    Some(cp) => cp,
                    None => continue,
                },
            };
            let prior = self.progress.get(&l.id).map(|p| p.covered);
            let planned = Progress::plan(instance, checkpoint, prior, head);
            if let Phase::CatchingUp { next_block } = planned.phase {
                info!(
                    stream = %self.stream_id,
                    listener = %l.id,
                    from_block = next_block,
                    head,
                    "listener catching up"
                );
            }
            self.progress.insert(l.id, planned);
        }

        info!(
            stream = %self.stream_id,
            filter = %id,
            head,
            listeners = snapshot.listeners.len(),
            generation = snapshot.generation,
            "change filter installed"
        );
        self.filter = Some(InstalledFilter {
            id,
            generation: snapshot.generation,
        });
        Ok(())
    }

    async fn uninstall(&self, old: InstalledFilter) -> Result<(), CycleError> {
        match guarded(&self.cancel, self.client.uninstall_filter(&old.id)).await {
            Ok(()) => Ok(()),
            Err(CycleError::Transport(e)) => {
                debug!(stream = %self.stream_id, filter = %old.id, error = %e, "failed to uninstall filter");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// One bounded `eth_getLogs` page per catching-up listener.
    async fn fetch_pages(
        &self,
        snapshot: &RegistrySnapshot,
        head: i64,
    ) -> Result<Vec<Page>, CycleError> {
        let page_size = self.config.page_size();
        let mut pages = Vec::new();
        for l in &snapshot.listeners {
            let next = match self.progress.get(&l.id) {
                Some(Progress {
                    phase: Phase::CatchingUp { next_block },
                    ..
                }) => *next_block,
                _ => continue,
            };
            let (to, done) = page_bounds(next, page_size, head);
            let logs = if to >= next {
                let query = LogQuery {
                    from_block: Some(next),
                    to_block: Some(to),
                    addresses: l.addresses(),
                    topic0s: l.topic0s(),
                };
                let logs = guarded(&self.cancel, self.client.get_logs(&query)).await?;
                debug!(
                    stream = %self.stream_id,
                    listener = %l.id,
                    from_block = next,
                    to_block = to,
                    logs = logs.len(),
                    "catch-up page fetched"
                );
                logs
            } else {
                Vec::new()
            };
            pages.push(Page {
                listener_id: l.id,
                to_block: to.max(next - 1),
                done,
                logs,
            });
        }
        Ok(pages)
    }

    async fn deliver(&self, matches: Vec<Match<'_>>) -> Result<usize, CycleError> {
        let mut delivered = 0;
        for m in matches {
            // Removed or re-added since the snapshot, or already past this position.
            let Some(cursor) = self.registry.cursor(m.listener.id) else {
                continue;
            };
            let seen = cursor.checkpoint.is_some_and(|cp| m.position <= cp);
            if cursor.instance != m.instance || seen {
                continue;
            }

            let event = match decode_event(m.filter, &m.log, m.position) {
                Ok(data) => ListenerEvent {
                    stream_id: self.stream_id,
                    listener_id: m.listener.id,
                    checkpoint: m.position,
                    event: data,
                },
                Err(e) => {
                    error!(
                        stream = %self.stream_id,
                        listener = %m.listener.id,
                        position = %m.position,
                        error = %e,
                        "failed to decode log, skipping"
                    );
                    continue;
                }
            };

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(CycleError::Cancelled),
                res = self.outputs.events.send(event) => {
                    res.map_err(|_| CycleError::ConsumerClosed)?;
                }
            }
            self.registry
                .advance_checkpoint(m.listener.id, m.instance, m.position);
            delivered += 1;
        }
        Ok(delivered)
    }

    async fn observe_head(&mut self, head: i64) -> Result<(), CycleError> {
        self.head.store(head, Ordering::Release);
        if !self.config.block_notices || self.last_notice.is_some_and(|prev| head <= prev) {
            return Ok(());
        }
        let Some(tx) = self.outputs.block_notices.clone() else {
            return Ok(());
        };
        let Some(hash) = guarded(&self.cancel, self.client.block_hash(head)).await? else {
            return Ok(());
        };

        let notice = BlockHashEvent {
            stream_id: self.stream_id,
            block_number: head,
            block_hashes: vec![hash],
            gap_potential: self.last_notice.is_some_and(|prev| head - prev > 1),
            created: Utc::now(),
        };
        let sent = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(CycleError::Cancelled),
            res = tx.send(notice) => res.is_ok(),
        };
        if !sent {
            warn!(stream = %self.stream_id, "block notice consumer closed, notices disabled");
            self.outputs.block_notices = None;
        }
        self.last_notice = Some(head);
        Ok(())
    }

    /// Drop scan state for listeners that are gone or were re-added.
    fn forget_stale(&mut self, snapshot: &RegistrySnapshot) {
        self.progress
            .retain(|id, p| snapshot.instance(*id) == Some(p.instance));
    }

    fn set_state(&self, state: PollerState) {
        self.state.send_if_modified(|cur| {
            if *cur == state {
                false
            } else {
                *cur = state;
                true
            }
        });
    }
}

fn push_match<'a>(
    matches: &mut Vec<Match<'a>>,
    listener: &'a Listener,
    instance: u64,
    log: &RawLog,
) {
    let Some(position) = log.position() else {
        return;
    };
    if let Some(filter) = listener.matching_filter(&log.address, &log.topics) {
        matches.push(Match {
            position,
            instance,
            listener,
            filter,
            log: log.clone(),
        });
    }
}

/// Last block of the page starting at `next`, clamped to the head, and
/// whether the page reaches the head.
fn page_bounds(next: i64, page_size: i64, head: i64) -> (i64, bool) {
    let last = next.saturating_add(page_size.max(1) - 1);
    (last.min(head), last >= head)
}

/// Run an RPC future unless the stream is cancelled first.
async fn guarded<T>(
    cancel: &CancellationToken,
    fut: impl Future<Output = Result<T, TransportError>>,
) -> Result<T, CycleError> {
    if cancel.is_cancelled() {
        return Err(CycleError::Cancelled);
    }
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(CycleError::Cancelled),
        res = fut => res.map_err(CycleError::Transport),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_listener_at_head_goes_live() {
        let p = Progress::plan(1, Checkpoint::new(12345, 0, 0), None, 12345);
        assert_eq!(p.phase, Phase::Live);
        assert_eq!(p.covered, 12345);

        let p = Progress::plan(1, Checkpoint::before_block(20_000), None, 12345);
        assert_eq!(p.phase, Phase::Live);
    }

    #[test]
    fn fresh_listener_behind_head_catches_up_from_its_block() {
        let p = Progress::plan(1, Checkpoint::before_block(100), None, 150);
        assert_eq!(p.phase, Phase::CatchingUp { next_block: 100 });
        assert_eq!(p.covered, 99);
    }

    #[test]
    fn reinstall_resumes_after_scanned_range() {
        // Scanned through 140, checkpoint lags behind at 120.
        let p = Progress::plan(1, Checkpoint::new(120, 1, 0), Some(140), 145);
        assert_eq!(p.phase, Phase::CatchingUp { next_block: 141 });

        // Nothing new since the last scan.
        let p = Progress::plan(1, Checkpoint::new(120, 1, 0), Some(145), 145);
        assert_eq!(p.phase, Phase::Live);
        assert_eq!(p.covered, 145);
    }

    #[test]
    fn pages_stop_at_the_head() {
        assert_eq!(page_bounds(100, 10, 120), (109, false));
        assert_eq!(page_bounds(110, 10, 120), (119, false));
        assert_eq!(page_bounds(120, 10, 120), (120, true));
        assert_eq!(page_bounds(0, i64::MAX, 1_000), (1_000, true));
        assert_eq!(page_bounds(i64::MAX - 5, i64::MAX, i64::MAX), (i64::MAX, true));
    }

    #[test]
    fn exited_state() {
        assert!(PollerState::Exited.is_exited());
        assert!(!PollerState::Draining.is_exited());
    }

    #[test]
    fn exit_guard_publishes_exited_on_drop() {
        let (tx, rx) = watch::channel(PollerState::Live);
        drop(ExitGuard(Arc::new(tx)));
        assert_eq!(*rx.borrow(), PollerState::Exited);
    }
}
