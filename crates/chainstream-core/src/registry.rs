//! Per-stream listener registry.
//!
//! Control operations mutate the registry while the poller runs. The poller
//! takes one [`RegistrySnapshot`] per cycle and compares generations to spot
//! membership changes. Checkpoint writes go back through
//! [`ListenerRegistry::advance_checkpoint`] so a listener removed mid-cycle
//! is never resurrected.
//!
//! Every `add` stamps the listener with a fresh instance number, so a
//! listener removed and re-added under the same id is told apart from its
//! predecessor.

use std::collections::BTreeMap;

use parking_lot::RwLock;
use tracing::trace;
use uuid::Uuid;

use crate::checkpoint::Checkpoint;
use crate::error::StreamError;
use crate::listener::Listener;

/// Point-in-time copy of a registry.
#[derive(Debug, Clone)]
pub struct RegistrySnapshot {
    /// Bumped on every add/remove.
    pub generation: u64,
    /// Listeners ordered by id.
    pub listeners: Vec<Listener>,
    instances: BTreeMap<Uuid, u64>,
}

impl RegistrySnapshot {
    /// Instance number of a listener in this snapshot.
    pub fn instance(&self, id: Uuid) -> Option<u64> {
        self.instances.get(&id).copied()
    }
}

/// A listener's instance number and checkpoint, read together.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerCursor {
    pub instance: u64,
    pub checkpoint: Option<Checkpoint>,
}

#[derive(Debug)]
struct Entry {
    listener: Listener,
    instance: u64,
}

#[derive(Debug, Default)]
struct RegistryInner {
    listeners: BTreeMap<Uuid, Entry>,
    generation: u64,
}

/// Lock-guarded set of listeners belonging to one stream.
#[derive(Debug)]
pub struct ListenerRegistry {
    stream_id: Uuid,
    inner: RwLock<RegistryInner>,
}

impl ListenerRegistry {
    pub fn new(stream_id: Uuid) -> Self {
        Self {
            stream_id,
            inner: RwLock::new(RegistryInner::default()),
        }
    }

    /// Build a registry from an initial listener set, rejecting duplicate ids.
    pub fn with_listeners(
        stream_id: Uuid,
        listeners: impl IntoIterator<Item = Listener>,
    ) -> Result<Self, StreamError> {
        let registry = Self::new(stream_id);
        for l in listeners {
            registry.add(l)?;
        }
        Ok(registry)
    }

    pub fn stream_id(&self) -> Uuid {
        self.stream_id
    }

    pub fn add(&self, listener: Listener) -> Result<(), StreamError> {
        let mut inner = self.inner.write();
        if inner.listeners.contains_key(&listener.id) {
            return Err(StreamError::DuplicateListener {
                stream_id: self.stream_id,
                listener_id: listener.id,
            });
        }
        inner.generation += 1;
        let instance = inner.generation;
        inner.listeners.insert(listener.id, Entry { listener, instance });
        Ok(())
    }

    pub fn remove(&self, id: Uuid) -> Result<Listener, StreamError> {
        let mut inner = self.inner.write();
        let removed = inner
            .listeners
            .remove(&id)
            .ok_or_else(|| self.unknown(id))?;
        inner.generation += 1;
        Ok(removed.listener)
    }

    pub fn get(&self, id: Uuid) -> Result<Listener, StreamError> {
        self.inner
            .read()
            .listeners
            .get(&id)
            .map(|e| e.listener.clone())
            .ok_or_else(|| self.unknown(id))
    }

    /// Every listener, ordered by id.
    pub fn list(&self) -> Vec<Listener> {
        self.inner
            .read()
            .listeners
            .values()
            .map(|e| e.listener.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().listeners.is_empty()
    }

    pub fn generation(&self) -> u64 {
        self.inner.read().generation
    }

    /// Current checkpoint of a listener (`None` for an unresolved `latest`).
    pub fn checkpoint_of(&self, id: Uuid) -> Result<Option<Checkpoint>, StreamError> {
        self.inner
            .read()
            .listeners
            .get(&id)
            .map(|e| e.listener.checkpoint)
            .ok_or_else(|| self.unknown(id))
    }

    pub fn cursor(&self, id: Uuid) -> Option<ListenerCursor> {
        self.inner.read().listeners.get(&id).map(|e| ListenerCursor {
            instance: e.instance,
            checkpoint: e.listener.checkpoint,
        })
    }

    /// Checkpoints of every listener, keyed by id.
    pub fn checkpoints(&self) -> BTreeMap<Uuid, Option<Checkpoint>> {
        self.inner
            .read()
            .listeners
            .iter()
            .map(|(id, e)| (*id, e.listener.checkpoint))
            .collect()
    }

    pub fn snapshot(&self) -> RegistrySnapshot {
        let inner = self.inner.read();
        RegistrySnapshot {
            generation: inner.generation,
            listeners: inner.listeners.values().map(|e| e.listener.clone()).collect(),
            instances: inner.listeners.iter().map(|(id, e)| (*id, e.instance)).collect(),
        }
    }

    /// Move a listener's checkpoint forward.
    ///
    /// Returns `false` (and changes nothing) if the listener is gone, has
    /// been re-added as a different instance, or `cp` is not strictly ahead
    /// of the stored checkpoint.
    pub fn advance_checkpoint(&self, id: Uuid, instance: u64, cp: Checkpoint) -> bool {
        let mut inner = self.inner.write();
        match inner.listeners.get_mut(&id) {
            Some(e)
                if e.instance == instance && e.listener.checkpoint.map_or(true, |cur| cur < cp) =>
            {
                e.listener.checkpoint = Some(cp);
                trace!(stream = %self.stream_id, listener = %id, checkpoint = %cp, "checkpoint advanced");
                true
            }
            _ => false,
        }
    }

    /// Pin an unresolved `latest` listener to the observed head.
    ///
    /// Returns the listener's checkpoint after the call, or `None` if it no
    /// longer exists. A checkpoint that is already set is left alone.
    pub fn resolve_latest(&self, id: Uuid, head: i64) -> Option<Checkpoint> {
        let mut inner = self.inner.write();
        let e = inner.listeners.get_mut(&id)?;
        Some(*e.listener.checkpoint.get_or_insert(Checkpoint::before_block(head)))
    }

    fn unknown(&self, listener_id: Uuid) -> StreamError {
        StreamError::UnknownListener {
            stream_id: self.stream_id,
            listener_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::listener::{ListenerAddRequest, ListenerOptions};

    const FILTER: &str = r#"{"address":"0x5600ff383458ae30de902d096ba89f7f81f0a2fc","event":{"type":"event","name":"Transfer","inputs":[{"indexed":true,"name":"from","type":"address"},{"indexed":true,"name":"to","type":"address"},{"indexed":false,"name":"value","type":"uint256"}]}}"#;

    fn listener(stream_id: Uuid, from_block: Option<&str>) -> Listener {
        Listener::resolve(ListenerAddRequest {
            stream_id,
            listener_id: Uuid::new_v4(),
            name: "l".into(),
            options: ListenerOptions {
                from_block: from_block.map(String::from),
                filters: vec![FILTER.into()],
                options: None,
            },
            checkpoint: None,
        })
        .unwrap()
    }

    #[test]
    fn duplicate_add_is_rejected_and_leaves_registry_unchanged() {
        let sid = Uuid::new_v4();
        let reg = ListenerRegistry::new(sid);
        let l = listener(sid, Some("10"));
        reg.add(l.clone()).unwrap();
        let gen = reg.generation();

        let err = reg.add(l).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DuplicateListener);
        assert_eq!(reg.len(), 1);
        assert_eq!(reg.generation(), gen);
    }

    #[test]
    fn unknown_listener_errors() {
        let sid = Uuid::new_v4();
        let reg = ListenerRegistry::new(sid);
        let id = Uuid::new_v4();
        assert_eq!(reg.remove(id).unwrap_err().kind(), ErrorKind::UnknownListener);
        assert_eq!(reg.checkpoint_of(id).unwrap_err().kind(), ErrorKind::UnknownListener);
        assert_eq!(reg.get(id).unwrap_err().kind(), ErrorKind::UnknownListener);
    }

    #[test]
    fn generation_tracks_membership_only() {
        let sid = Uuid::new_v4();
        let reg = ListenerRegistry::new(sid);
        let l = listener(sid, Some("10"));
        let id = l.id;
        reg.add(l).unwrap();
        assert_eq!(reg.generation(), 1);

        let instance = reg.cursor(id).unwrap().instance;
        assert!(reg.advance_checkpoint(id, instance, Checkpoint::new(10, 0, 0)));
        assert_eq!(reg.generation(), 1);

        reg.remove(id).unwrap();
        assert_eq!(reg.generation(), 2);
        assert!(reg.is_empty());
    }

    #[test]
    fn checkpoints_only_move_forward() {
        let sid = Uuid::new_v4();
        let reg = ListenerRegistry::new(sid);
        let l = listener(sid, Some("10"));
        let id = l.id;
        reg.add(l).unwrap();
        let instance = reg.cursor(id).unwrap().instance;

        assert!(reg.advance_checkpoint(id, instance, Checkpoint::new(11, 2, 0)));
        assert!(!reg.advance_checkpoint(id, instance, Checkpoint::new(11, 2, 0)));
        assert!(!reg.advance_checkpoint(id, instance, Checkpoint::new(11, 1, 7)));
        assert_eq!(reg.checkpoint_of(id).unwrap(), Some(Checkpoint::new(11, 2, 0)));

        reg.remove(id).unwrap();
        assert!(!reg.advance_checkpoint(id, instance, Checkpoint::new(12, 0, 0)));
    }

    #[test]
    fn re_added_listener_is_a_new_instance() {
        let sid = Uuid::new_v4();
        let reg = ListenerRegistry::new(sid);
        let l = listener(sid, Some("200"));
        let id = l.id;
        reg.add(l.clone()).unwrap();
        let first = reg.cursor(id).unwrap().instance;
        assert_eq!(reg.snapshot().instance(id), Some(first));

        reg.remove(id).unwrap();
        let mut again = l;
        again.checkpoint = Some(Checkpoint::before_block(100));
        reg.add(again).unwrap();
        let second = reg.cursor(id).unwrap();
        assert_ne!(second.instance, first);
        assert_eq!(second.checkpoint, Some(Checkpoint::before_block(100)));
        assert_eq!(reg.snapshot().instance(id), Some(second.instance));

        // Writes meant for the removed instance are dropped.
        assert!(!reg.advance_checkpoint(id, first, Checkpoint::new(250, 0, 0)));
        assert_eq!(reg.checkpoint_of(id).unwrap(), Some(Checkpoint::before_block(100)));
        assert!(reg.cursor(Uuid::new_v4()).is_none());
    }

    #[test]
    fn list_returns_every_listener_in_id_order() {
        let sid = Uuid::new_v4();
        let reg = ListenerRegistry::new(sid);
        assert!(reg.list().is_empty());

        let a = listener(sid, Some("1"));
        let b = listener(sid, None);
        reg.add(a.clone()).unwrap();
        reg.add(b.clone()).unwrap();

        let mut expected = vec![a.id, b.id];
        expected.sort();
        let listed: Vec<_> = reg.list().iter().map(|l| l.id).collect();
        assert_eq!(listed, expected);

        reg.remove(a.id).unwrap();
        let listed: Vec<_> = reg.list().iter().map(|l| l.id).collect();
        assert_eq!(listed, vec![b.id]);
    }

    #[test]
    fn latest_resolves_once() {
        let sid = Uuid::new_v4();
        let reg = ListenerRegistry::new(sid);
        let l = listener(sid, None);
        let id = l.id;
        reg.add(l).unwrap();
        assert_eq!(reg.checkpoint_of(id).unwrap(), None);

        assert_eq!(reg.resolve_latest(id, 500), Some(Checkpoint::before_block(500)));
        assert_eq!(reg.resolve_latest(id, 900), Some(Checkpoint::before_block(500)));
        assert_eq!(reg.resolve_latest(Uuid::new_v4(), 900), None);
    }

    #[test]
    fn snapshot_is_ordered_by_id() {
        let sid = Uuid::new_v4();
        let reg = ListenerRegistry::with_listeners(
            sid,
            (0..5).map(|_| listener(sid, Some("1"))),
        )
        .unwrap();
        let snap = reg.snapshot();
        assert_eq!(snap.generation, 5);
        let ids: Vec<_> = snap.listeners.iter().map(|l| l.id).collect();
        let mut sorted = ids.clone();
        sorted.sort();
        assert_eq!(ids, sorted);
    }
}
