//! Session and channel handles
//!
//! Ownership wrappers around native engine objects. A `ChannelHandle` keeps a
//! liveness flag of its session, never the session itself, and checks it on
//! release: a channel whose session is already gone is never handed back to
//! the engine.
//!
//! Handles are `Send` but not `Sync`. Debug builds additionally record the
//! creating thread and assert it on every native call.

use std::mem::ManuallyDrop;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};

use tracing::{debug, warn};

use super::registry::{HandleId, HandleKind, HandleRegistry};
use crate::engine::{codes, EngineChannel, EngineError, EngineResult, EngineSession};

/// Thread that created a handle
#[derive(Debug, Clone, Copy)]
struct ThreadOwner {
    #[cfg(debug_assertions)]
    thread: ThreadId,
}

impl ThreadOwner {
    fn current() -> Self {
        Self {
            #[cfg(debug_assertions)]
            thread: thread::current().id(),
        }
    }

    #[inline]
    fn check(&self, id: HandleId) {
        #[cfg(debug_assertions)]
        assert_eq!(
            thread::current().id(),
            self.thread,
            "handle {} used outside its owning thread",
            id
        );
        #[cfg(not(debug_assertions))]
        let _ = id;
    }
}

/// Owns a native session
pub struct SessionHandle {
    id: HandleId,
    engine: ManuallyDrop<Box<dyn EngineSession>>,
    alive: Arc<AtomicBool>,
    registry: Arc<HandleRegistry>,
    owner: ThreadOwner,
}

impl SessionHandle {
    pub(crate) fn new(
        engine: Box<dyn EngineSession>,
        registry: Arc<HandleRegistry>,
        label: impl Into<String>,
    ) -> Self {
        let id = registry.register(HandleKind::Session, None, label);
        Self {
            id,
            engine: ManuallyDrop::new(engine),
            alive: Arc::new(AtomicBool::new(true)),
            registry,
            owner: ThreadOwner::current(),
        }
    }

    pub fn id(&self) -> HandleId {
        self.id
    }

    pub fn registry(&self) -> &Arc<HandleRegistry> {
        &self.registry
    }

    pub(crate) fn engine(&mut self) -> &mut dyn EngineSession {
        self.owner.check(self.id);
        self.engine.as_mut()
    }

    pub(crate) fn engine_ref(&self) -> &dyn EngineSession {
        self.owner.check(self.id);
        self.engine.as_ref()
    }

    /// Wrap a channel opened on this session.
    pub(crate) fn adopt_channel(
        &self,
        channel: Box<dyn EngineChannel>,
        label: impl Into<String>,
    ) -> ChannelHandle {
        let id = self
            .registry
            .register(HandleKind::Channel, Some(self.id), label);
        ChannelHandle {
            id,
            session_id: self.id,
            session_alive: self.alive.clone(),
            engine: ManuallyDrop::new(channel),
            registry: self.registry.clone(),
            owner: ThreadOwner::current(),
        }
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        let children = self.registry.children_of(self.id);
        for child in children {
            warn!(
                "Session handle {} released while channel {} is still open",
                self.id, child
            );
            self.registry.report_violation(child, self.id);
        }

        self.alive.store(false, Ordering::SeqCst);
        // SAFETY: dropped exactly once, here.
        unsafe { ManuallyDrop::drop(&mut self.engine) };
        self.registry.release(self.id);
    }
}

/// Owns a native channel
pub struct ChannelHandle {
    id: HandleId,
    session_id: HandleId,
    session_alive: Arc<AtomicBool>,
    engine: ManuallyDrop<Box<dyn EngineChannel>>,
    registry: Arc<HandleRegistry>,
    owner: ThreadOwner,
}

impl ChannelHandle {
    pub fn id(&self) -> HandleId {
        self.id
    }

    pub fn session_id(&self) -> HandleId {
        self.session_id
    }

    /// True once the owning session has been released
    pub fn is_orphaned(&self) -> bool {
        !self.session_alive.load(Ordering::SeqCst)
    }

    pub(crate) fn engine(&mut self) -> EngineResult<&mut dyn EngineChannel> {
        self.owner.check(self.id);
        if self.is_orphaned() {
            return Err(EngineError::native(
                codes::BAD_USE,
                format!("Session {} of channel {} has been released", self.session_id, self.id),
            ));
        }
        Ok(self.engine.as_mut())
    }

    pub(crate) fn engine_ref(&self) -> EngineResult<&dyn EngineChannel> {
        self.owner.check(self.id);
        if self.is_orphaned() {
            return Err(EngineError::native(
                codes::BAD_USE,
                format!("Session {} of channel {} has been released", self.session_id, self.id),
            ));
        }
        Ok(self.engine.as_ref())
    }

    /// Release the native channel now.
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for ChannelHandle {
    fn drop(&mut self) {
        if self.is_orphaned() {
            debug!(
                "Skipping native release of channel {}: session {} already released",
                self.id, self.session_id
            );
        } else {
            // SAFETY: dropped exactly once, here.
            unsafe { ManuallyDrop::drop(&mut self.engine) };
        }
        self.registry.release(self.id);
    }
}
