//! Stream lifecycle manager. Owns the stream table and exposes the control
//! surface.
//!
//! Control operations are synchronous and never wait on a poller, apart from
//! [`StreamManager::wait_exited`]. Stopping is two-phase: [`StreamManager::stop`]
//! cancels the stream's context; [`StreamManager::stop_confirm`] succeeds only
//! once the poller has published `Exited`, and removes the stream.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

use chainstream_core::{
    Checkpoint, Listener, ListenerAddRequest, ListenerOptions, ListenerRegistry, StreamConfig,
    StreamError, VerifiedOptions,
};

use crate::poller::{PollerState, StreamOutputs, StreamPoller, HEAD_UNKNOWN};
use crate::rpc::EvmRpcClient;

/// A request to start a stream with its initial listener set.
#[derive(Debug, Clone)]
pub struct StartStreamRequest {
    pub stream_id: Uuid,
    pub name: String,
    /// `stream_id` on each request is overwritten with the stream's id.
    pub listeners: Vec<ListenerAddRequest>,
}

/// Result of adding a listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerAdded {
    pub listener_id: Uuid,
    pub resolved_signature: String,
    pub resolved_options: String,
    /// The listener starts behind the last observed head. Always `false`
    /// before the stream has read the head.
    pub catchup_required: bool,
}

/// A listener's high-water mark.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerHwm {
    /// `None` for a `latest` listener that has not yet seen the head.
    pub checkpoint: Option<Checkpoint>,
}

struct StreamEntry {
    name: String,
    registry: Arc<ListenerRegistry>,
    cancel: CancellationToken,
    state: watch::Receiver<PollerState>,
    head: Arc<AtomicI64>,
}

pub struct StreamManager<C> {
    client: Arc<C>,
    config: StreamConfig,
    streams: Mutex<HashMap<Uuid, StreamEntry>>,
}

impl<C: EvmRpcClient> StreamManager<C> {
    pub fn new(client: Arc<C>, config: StreamConfig) -> Self {
        Self {
            client,
            config,
            streams: Mutex::new(HashMap::new()),
        }
    }

    /// Resolve the initial listeners and spawn the stream's poller.
    ///
    /// Must be called from within a Tokio runtime. `parent` is the caller's
    /// context: cancelling it stops the stream, but stopping the stream never
    /// cancels `parent`.
    pub fn start(
        &self,
        parent: &CancellationToken,
        req: StartStreamRequest,
        outputs: StreamOutputs,
    ) -> Result<(), StreamError> {
        let stream_id = req.stream_id;
        if self.streams.lock().contains_key(&stream_id) {
            return Err(StreamError::DuplicateStream { id: stream_id });
        }

        let listeners = req
            .listeners
            .into_iter()
            .map(|mut l| {
                l.stream_id = stream_id;
                Listener::resolve(l)
            })
            .collect::<Result<Vec<_>, _>>()?;
        let registry = Arc::new(ListenerRegistry::with_listeners(stream_id, listeners)?);

        let mut streams = self.streams.lock();
        if streams.contains_key(&stream_id) {
            return Err(StreamError::DuplicateStream { id: stream_id });
        }

        let cancel = parent.child_token();
        let poller = StreamPoller::new(
            self.client.clone(),
            registry.clone(),
            self.config.clone(),
            outputs,
            cancel.clone(),
        );
        let state = poller.subscribe();
        let head = poller.head_handle();
        info!(stream = %stream_id, name = %req.name, listeners = registry.len(), "starting event stream");
        tokio::spawn(poller.run());

        streams.insert(
            stream_id,
            StreamEntry {
                name: req.name,
                registry,
                cancel,
                state,
                head,
            },
        );
        Ok(())
    }

    /// Request the stream to stop. Unknown ids are ignored.
    pub fn stop(&self, stream_id: Uuid) {
        if let Some(entry) = self.streams.lock().get(&stream_id) {
            info!(stream = %stream_id, name = %entry.name, "stopping event stream");
            entry.cancel.cancel();
        }
    }

    /// Confirm the stream's poller has exited and remove the stream,
    /// returning the final checkpoint of every listener.
    pub fn stop_confirm(
        &self,
        stream_id: Uuid,
    ) -> Result<BTreeMap<Uuid, Option<Checkpoint>>, StreamError> {
        let mut streams = self.streams.lock();
        let entry = streams
            .get(&stream_id)
            .ok_or(StreamError::UnknownStream { id: stream_id })?;
        if !entry.state.borrow().is_exited() {
            return Err(StreamError::NotYetStopped { id: stream_id });
        }
        let checkpoints = entry.registry.checkpoints();
        streams.remove(&stream_id);
        info!(stream = %stream_id, "event stream stopped");
        Ok(checkpoints)
    }

    /// Wait up to `timeout` for the stream's poller to exit.
    pub async fn wait_exited(&self, stream_id: Uuid, timeout: Duration) -> Result<(), StreamError> {
        let mut rx = self.entry(stream_id, |e| e.state.clone())?;
        // `wait_for` checks the current value first, so an already exited
        // poller resolves even though its sender is gone.
        let result = match tokio::time::timeout(timeout, rx.wait_for(|s| s.is_exited())).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(_)) | Err(_) => Err(StreamError::NotYetStopped { id: stream_id }),
        };
        result
    }

    pub fn add_listener(&self, req: ListenerAddRequest) -> Result<ListenerAdded, StreamError> {
        let stream_id = req.stream_id;
        let (registry, head) = self.entry(stream_id, |e| (e.registry.clone(), e.head.clone()))?;

        let listener = Listener::resolve(req)?;
        let head = head.load(Ordering::Acquire);
        let catchup_required = match listener.checkpoint {
            Some(cp) if head != HEAD_UNKNOWN => cp.block < head,
            _ => false,
        };
        let added = ListenerAdded {
            listener_id: listener.id,
            resolved_signature: listener.resolved_signature.clone(),
            resolved_options: listener.resolved_options.clone(),
            catchup_required,
        };
        registry.add(listener)?;
        info!(
            stream = %stream_id,
            listener = %added.listener_id,
            signature = %added.resolved_signature,
            catchup_required,
            "listener added"
        );
        Ok(added)
    }

    pub fn remove_listener(&self, stream_id: Uuid, listener_id: Uuid) -> Result<(), StreamError> {
        let registry = self.entry(stream_id, |e| e.registry.clone())?;
        registry.remove(listener_id)?;
        info!(stream = %stream_id, listener = %listener_id, "listener removed");
        Ok(())
    }

    pub fn hwm(&self, stream_id: Uuid, listener_id: Uuid) -> Result<ListenerHwm, StreamError> {
        let registry = self.entry(stream_id, |e| e.registry.clone())?;
        Ok(ListenerHwm {
            checkpoint: registry.checkpoint_of(listener_id)?,
        })
    }

    /// Dry-run filter resolution for a listener's options.
    pub fn verify_options(
        &self,
        options: &ListenerOptions,
    ) -> Result<VerifiedOptions, StreamError> {
        chainstream_core::verify_options(&options.filters, options.options.as_deref())
    }

    /// The empty checkpoint, for callers deserializing a stored one.
    pub fn new_checkpoint(&self) -> Checkpoint {
        Checkpoint::empty()
    }

    pub fn poller_state(&self, stream_id: Uuid) -> Result<PollerState, StreamError> {
        self.entry(stream_id, |e| *e.state.borrow())
    }

    /// Ids of every stream in the table, including stopped-but-unconfirmed ones.
    pub fn stream_ids(&self) -> Vec<Uuid> {
        self.streams.lock().keys().copied().collect()
    }

    fn entry<T>(
        &self,
        stream_id: Uuid,
        f: impl FnOnce(&StreamEntry) -> T,
    ) -> Result<T, StreamError> {
        self.streams
            .lock()
            .get(&stream_id)
            .map(f)
            .ok_or(StreamError::UnknownStream { id: stream_id })
    }
}
