use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::mpsc;

use crate::gateway::events::GatewayEvent;

pub type Handler = Arc<dyn Fn(&GatewayEvent) + Send + Sync>;

/// In-process fan-out of relayed events.
///
/// Events are delivered one at a time, in publish order: every subscriber
/// sees an event before any subscriber sees the next one. A publisher that
/// arrives while another call is dispatching (including a handler publishing
/// from inside its callback) only enqueues; the dispatching call delivers it.
/// Events published with no subscribers are dropped.
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

#[derive(Default)]
struct BusInner {
    next_id: AtomicU64,
    subscribers: Mutex<Vec<(u64, Handler)>>,
    dispatch: Mutex<DispatchQueue>,
}

#[derive(Default)]
struct DispatchQueue {
    pending: VecDeque<GatewayEvent>,
    draining: bool,
}

impl BusInner {
    fn subscribers(&self) -> MutexGuard<'_, Vec<(u64, Handler)>> {
        self.subscribers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn dispatch(&self) -> MutexGuard<'_, DispatchQueue> {
        self.dispatch.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Handle returned by [`EventBus::subscribe`]. Dropping it keeps the
/// subscription alive; call [`Subscription::unsubscribe`] to end it.
pub struct Subscription {
    id: u64,
    bus: Weak<BusInner>,
}

impl Subscription {
    pub fn unsubscribe(self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.subscribers().retain(|(id, _)| *id != self.id);
        }
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&GatewayEvent) + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.subscribers().push((id, Arc::new(handler)));
        Subscription {
            id,
            bus: Arc::downgrade(&self.inner),
        }
    }

    /// Subscribe with an unbounded channel, for consumers that live in their
    /// own task.
    pub fn subscribe_channel(&self) -> (Subscription, mpsc::UnboundedReceiver<GatewayEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let subscription = self.subscribe(move |event| {
            let _ = tx.send(event.clone());
        });
        (subscription, rx)
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers().len()
    }

    pub fn publish(&self, event: GatewayEvent) {
        {
            let mut queue = self.inner.dispatch();
            queue.pending.push_back(event);
            if queue.draining {
                return;
            }
            queue.draining = true;
        }

        loop {
            let next = {
                let mut queue = self.inner.dispatch();
                match queue.pending.pop_front() {
                    Some(event) => event,
                    None => {
                        queue.draining = false;
                        return;
                    }
                }
            };
            self.deliver(&next);
        }
    }

    fn deliver(&self, event: &GatewayEvent) {
        let handlers: Vec<Handler> = self
            .inner
            .subscribers()
            .iter()
            .map(|(_, handler)| Arc::clone(handler))
            .collect();

        for handler in handlers {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| handler(event))) {
                tracing::error!(
                    event_type = ?event.kind(),
                    trace_id = event.trace_id(),
                    panic = panic_message(panic.as_ref()),
                    "event handler panicked"
                );
            }
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        msg
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.as_str()
    } else {
        "non-string panic payload"
    }
}
