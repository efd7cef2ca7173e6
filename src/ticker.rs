//! The shared frame scheduler: batches per-frame draws for multiple
//! instances under one host frame callback.
//!
//! The ticker holds only non-owning references for dispatch — GPU resources
//! stay exclusively owned by their instance controllers, and a destroyed or
//! dropped instance is simply skipped on the next tick. The host callback
//! loop runs while the registry is non-empty: adding to an empty registry
//! starts it, removing the last instance stops it. Draws happen in insertion
//! order with no further fairness guarantees.

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use tracing::debug;

use crate::context::{FramePump, FrameRequest};
use crate::instance::{draw_instance, InstanceState};

struct TickerInner {
    pump: Rc<dyn FramePump>,
    pool: RefCell<Vec<Weak<RefCell<InstanceState>>>>,
    pending: Cell<Option<FrameRequest>>,
}

/// A shared, cloneable handle to one frame-dispatch registry.
#[derive(Clone)]
pub struct Ticker {
    inner: Rc<TickerInner>,
}

impl Ticker {
    /// A ticker driving its registry from the given frame pump.
    pub fn new(pump: Rc<dyn FramePump>) -> Self {
        Self {
            inner: Rc::new(TickerInner {
                pump,
                pool: RefCell::new(Vec::new()),
                pending: Cell::new(None),
            }),
        }
    }

    /// Number of registered instances.
    pub fn len(&self) -> usize {
        self.inner.pool.borrow().len()
    }

    /// Whether the registry is empty (and the loop stopped).
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Draw every registered instance once, in insertion order.
    ///
    /// Hosts that own their own frame loop may call this directly instead of
    /// supplying a live pump.
    pub fn tick(&self, time: f64) {
        // Snapshot the pool so draw callbacks can add/remove instances
        // without aliasing the borrow.
        let snapshot: Vec<_> = self.inner.pool.borrow().clone();
        for weak in snapshot {
            if let Some(instance) = weak.upgrade() {
                draw_instance(&instance, time);
            }
        }
        self.inner
            .pool
            .borrow_mut()
            .retain(|weak| weak.upgrade().is_some());
        if self.inner.pool.borrow().is_empty() {
            self.cancel_pending();
        }
    }

    /// Register an instance. Starts the host loop when the registry was
    /// empty; re-adding a registered instance is a no-op.
    pub(crate) fn add(&self, instance: &Rc<RefCell<InstanceState>>) {
        {
            let mut pool = self.inner.pool.borrow_mut();
            let present = pool
                .iter()
                .any(|weak| weak.upgrade().is_some_and(|rc| Rc::ptr_eq(&rc, instance)));
            if present {
                return;
            }
            pool.push(Rc::downgrade(instance));
        }
        if self.inner.pending.get().is_none() {
            debug!("ticker registry non-empty; starting frame loop");
            schedule(&self.inner);
        }
    }

    /// Deregister an instance. Stops the host loop when the registry
    /// empties; unknown instances are ignored.
    pub(crate) fn remove(&self, instance: &Rc<RefCell<InstanceState>>) {
        self.inner.pool.borrow_mut().retain(|weak| {
            weak.upgrade()
                .is_some_and(|rc| !Rc::ptr_eq(&rc, instance))
        });
        if self.inner.pool.borrow().is_empty() {
            self.cancel_pending();
        }
    }

    fn cancel_pending(&self) {
        if let Some(request) = self.inner.pending.take() {
            debug!("ticker registry empty; stopping frame loop");
            self.inner.pump.cancel(request);
        }
    }
}

/// Request the next frame callback, re-arming while instances remain.
fn schedule(inner: &Rc<TickerInner>) {
    let weak = Rc::downgrade(inner);
    let request = inner.pump.request(Box::new(move |time| {
        let Some(inner) = weak.upgrade() else {
            return;
        };
        inner.pending.set(None);
        Ticker {
            inner: inner.clone(),
        }
        .tick(time);
        if !inner.pool.borrow().is_empty() && inner.pending.get().is_none() {
            schedule(&inner);
        }
    }));
    inner.pending.set(Some(request));
}
