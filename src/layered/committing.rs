//! The committing wrapper: a frozen generation with a background commit
//!
//! Rotation wraps the overflowed generation in a `CommittingIndex`, which
//! keeps serving reads by delegation while a worker thread serializes it.
//! The outcome is reported through the notify callback; once `Ok` arrives
//! the monitor calls `reduce()` to swap in the loaded segment.

use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::Mutex;
use tracing::{debug, error};

use crate::error::{Result, StrataError};
use crate::index::{ContentsIndex, EntityCursor, LayerKind};
use crate::layered::layers::token_of;
use crate::notify::{Event, NotifyFn};
use crate::segment::SegmentIndex;
use crate::storage::SerializedSegment;
use crate::types::{BlockInfo, Entity, EntityId};

pub struct CommittingIndex {
    inner: Arc<dyn ContentsIndex>,
    result: Mutex<Option<Arc<SerializedSegment>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl CommittingIndex {
    /// Wrap `inner` and start its background commit. The notify callback
    /// receives this wrapper's token with `Ok`, `Empty` or `Failed`.
    pub fn start(inner: Arc<dyn ContentsIndex>, notify: NotifyFn) -> Arc<Self> {
        let this = Arc::new(Self {
            inner: Arc::clone(&inner),
            result: Mutex::new(None),
            worker: Mutex::new(None),
        });
        let token = token_of(&(Arc::clone(&this) as Arc<dyn ContentsIndex>));
        let weak = Arc::downgrade(&this);

        let handle = std::thread::Builder::new()
            .name("commit".into())
            .spawn(move || {
                let empty = inner
                    .list_entities()
                    .map(|live| live.is_empty())
                    .unwrap_or(false);
                if empty {
                    debug!("nothing to commit, reporting empty");
                    notify(token, Event::Empty);
                    return;
                }
                match inner.commit() {
                    Ok(segment) => {
                        if let Some(this) = weak.upgrade() {
                            *this.result.lock() = Some(segment);
                        }
                        notify(token, Event::Ok);
                    }
                    Err(e) => {
                        error!(error = %e, "background commit failed");
                        notify(token, Event::Failed);
                    }
                }
            });

        match handle {
            Ok(handle) => *this.worker.lock() = Some(handle),
            Err(e) => error!(error = %e, "cannot spawn commit thread"),
        }
        this
    }
}

impl ContentsIndex for CommittingIndex {
    fn get_entity(&self, id: &EntityId) -> Option<Entity> {
        self.inner.get_entity(id)
    }

    fn get_entity_by_index(&self, index: u32) -> Option<Entity> {
        self.inner.get_entity_by_index(index)
    }

    fn set_entity(
        &self,
        _id: EntityId,
        _contents: Option<&dyn crate::contents::Contents>,
        _extras: &[u8],
    ) -> Result<Entity> {
        // A writer racing the rotation may still hold this layer as the
        // tail; overflow sends it back around the retry loop
        Err(StrataError::Overflow("generation is committing"))
    }

    fn del_entity(&self, id: &EntityId) -> Result<bool> {
        self.inner.del_entity(id)
    }

    fn set_extras(&self, id: &EntityId, extras: &[u8]) -> Result<bool> {
        self.inner.set_extras(id, extras)
    }

    fn get_max_index(&self) -> u32 {
        self.inner.get_max_index()
    }

    fn get_key_block(&self, key: &[u8]) -> Option<Box<dyn EntityCursor>> {
        self.inner.get_key_block(key)
    }

    fn get_key_stats(&self, key: &[u8]) -> BlockInfo {
        self.inner.get_key_stats(key)
    }

    fn key_set(&self, pattern: &[u8]) -> Result<Vec<Vec<u8>>> {
        self.inner.key_set(pattern)
    }

    fn list_entities(&self) -> Result<Vec<Entity>> {
        self.inner.list_entities()
    }

    fn commit(&self) -> Result<Arc<SerializedSegment>> {
        match self.result.lock().clone() {
            Some(segment) => Ok(segment),
            None => Err(StrataError::InvalidState("commit still in flight")),
        }
    }

    fn reduce(self: Arc<Self>) -> Result<Arc<dyn ContentsIndex>> {
        let segment = self
            .result
            .lock()
            .clone()
            .ok_or(StrataError::InvalidState("commit result not available"))?;
        Ok(Arc::new(SegmentIndex::load(segment)?))
    }

    fn kind(&self) -> LayerKind {
        LayerKind::Committing
    }
}

impl Drop for CommittingIndex {
    fn drop(&mut self) {
        if let Some(handle) = self.worker.get_mut().take() {
            // The worker only holds a weak reference, but guard against
            // dropping on the worker thread itself
            if handle.thread().id() != std::thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::contents::PairsContents;
    use crate::generation::MutableIndex;
    use crate::notify::LayerToken;
    use crate::storage::{MemoryStorage, Storage};
    use std::sync::atomic::AtomicU64;
    use std::time::Duration;

    fn wait_for_event(events: &Mutex<Vec<(LayerToken, Event)>>) -> (LayerToken, Event) {
        for _ in 0..100 {
            if let Some(&event) = events.lock().first() {
                return event;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        panic!("no event within timeout");
    }

    fn notify_into(events: &Arc<Mutex<Vec<(LayerToken, Event)>>>) -> NotifyFn {
        let sink = Arc::clone(events);
        Arc::new(move |token, event| sink.lock().push((token, event)))
    }

    #[test]
    fn test_commit_reports_ok_and_reduces() {
        let inner = MutableIndex::new(
            Settings::default(),
            Arc::new(MemoryStorage::new()) as Arc<dyn Storage>,
            Arc::new(AtomicU64::new(0)),
        );
        let contents = PairsContents::new().with_key("alpha");
        inner
            .set_entity(EntityId::from("doc"), Some(&contents), b"")
            .unwrap();

        let events = Arc::new(Mutex::new(Vec::new()));
        let committing = CommittingIndex::start(Arc::new(inner), notify_into(&events));

        let (token, event) = wait_for_event(&events);
        assert_eq!(event, Event::Ok);
        assert_eq!(
            token,
            token_of(&(Arc::clone(&committing) as Arc<dyn ContentsIndex>))
        );

        // Reads still served by delegation
        assert!(committing.get_entity(&EntityId::from("doc")).is_some());

        let reduced = committing.reduce().unwrap();
        assert_eq!(reduced.kind(), LayerKind::Serialized);
        assert!(reduced.get_entity(&EntityId::from("doc")).is_some());
    }

    #[test]
    fn test_empty_generation_reports_empty() {
        let inner = MutableIndex::new(
            Settings::default(),
            Arc::new(MemoryStorage::new()) as Arc<dyn Storage>,
            Arc::new(AtomicU64::new(0)),
        );
        let events = Arc::new(Mutex::new(Vec::new()));
        let _committing = CommittingIndex::start(Arc::new(inner), notify_into(&events));
        assert_eq!(wait_for_event(&events).1, Event::Empty);
    }

    #[test]
    fn test_writes_bounce_with_overflow() {
        let inner = MutableIndex::new(
            Settings::default(),
            Arc::new(MemoryStorage::new()) as Arc<dyn Storage>,
            Arc::new(AtomicU64::new(0)),
        );
        inner.set_entity(EntityId::from("doc"), None, b"").unwrap();
        let events = Arc::new(Mutex::new(Vec::new()));
        let committing = CommittingIndex::start(Arc::new(inner), notify_into(&events));

        let err = committing
            .set_entity(EntityId::from("other"), None, b"")
            .unwrap_err();
        assert!(err.is_overflow());
    }
}
