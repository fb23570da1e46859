use crate::comm::EngineShared;
use crate::dbglog;
use crate::error::{CommError, CommResult};
use crate::event::{DispatchHandlerRef, Event};
use crate::flat_storage::FlatStorage;
use crate::io_handler::{IoHandler, INVALID_TOKEN};
use crate::logerr;
use polling::{Events, PollMode, Poller};
use std::io::ErrorKind;
use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;

//====================================================================================
//            ExpireTimer
//====================================================================================

pub(crate) enum TimerAction {
    /// Application timer; `None` is a pure poll-loop wakeup.
    Dispatch(Option<DispatchHandlerRef>),
    /// Deadline for an outstanding request. Weak so a timer never keeps a dead
    /// connection alive.
    RequestTimeout { handler: Weak<IoHandler>, id: u32 },
}

pub(crate) struct ExpireTimer {
    pub(crate) deadline: Instant,
    pub(crate) action: TimerAction,
}

//====================================================================================
//            timer min-heap on a Vec
//====================================================================================

fn heap_push(heap: &mut Vec<ExpireTimer>, timer: ExpireTimer) {
    heap.push(timer);
    let mut idx = heap.len() - 1;
    while idx > 0 {
        let parent = (idx - 1) / 2;
        if heap[parent].deadline <= heap[idx].deadline {
            break;
        }
        heap.swap(parent, idx);
        idx = parent;
    }
}

fn heap_pop(heap: &mut Vec<ExpireTimer>) -> Option<ExpireTimer> {
    if heap.is_empty() {
        return None;
    }
    let last = heap.len() - 1;
    heap.swap(0, last);
    let top = heap.pop();
    let mut idx = 0;
    loop {
        let left = idx * 2 + 1;
        if left >= heap.len() {
            break;
        }
        let right = left + 1;
        let mut smallest = left;
        if right < heap.len() && heap[right].deadline < heap[left].deadline {
            smallest = right;
        }
        if heap[idx].deadline <= heap[smallest].deadline {
            break;
        }
        heap.swap(idx, smallest);
        idx = smallest;
    }
    top
}

//====================================================================================
//            Reactor
//====================================================================================

/// One poll loop plus everything it owns: the live handler set (whose slab keys
/// double as OS poll tokens), the timer heap, and the deferred-removal list.
/// State is shared with the runner thread via `Arc<Reactor>`.
pub(crate) struct Reactor {
    pub(crate) name: String,
    poller: Poller,
    handlers: Mutex<FlatStorage<Arc<IoHandler>>>,
    timers: Mutex<Vec<ExpireTimer>>,
    removed: Mutex<Vec<Arc<IoHandler>>>,
}

impl Reactor {
    pub(crate) fn new(name: String) -> CommResult<Arc<Self>> {
        let poller = Poller::new().map_err(CommError::PollError)?;
        Ok(Arc::new(Self {
            name,
            poller,
            handlers: Mutex::new(FlatStorage::new()),
            timers: Mutex::new(Vec::new()),
            removed: Mutex::new(Vec::new()),
        }))
    }

    //------------------------------ handler set ------------------------------

    pub(crate) fn alloc_token(&self, handler: Arc<IoHandler>) -> usize {
        self.handlers.lock().unwrap().add(handler)
    }

    pub(crate) fn free_token(&self, token: usize) {
        self.handlers.lock().unwrap().take(token);
    }

    fn handler_for(&self, token: usize) -> Option<Arc<IoHandler>> {
        self.handlers.lock().unwrap().get(token).cloned()
    }

    //------------------------------ poll interest ------------------------------

    pub(crate) fn add_poll_interest(
        &self,
        source: impl polling::AsRawSource,
        interest: polling::Event,
    ) -> CommResult<()> {
        // SAFETY: the source stays registered only while its IoHandler is in this
        // reactor's handler set, which holds the socket alive; detach_poll runs
        // before the last Arc drops.
        unsafe {
            self.poller
                .add_with_mode(source, interest, PollMode::Level)
                .map_err(CommError::PollError)
        }
    }

    pub(crate) fn modify_poll_interest(
        &self,
        source: impl polling::AsSource,
        interest: polling::Event,
    ) -> CommResult<()> {
        self.poller
            .modify_with_mode(source, interest, PollMode::Level)
            .map_err(CommError::PollError)
    }

    pub(crate) fn remove_poll_interest(&self, source: impl polling::AsSource) -> CommResult<()> {
        self.poller.delete(source).map_err(CommError::PollError)
    }

    //------------------------------ removal / timers ------------------------------

    /// Queue a handler for teardown on this reactor's thread. First caller wins;
    /// repeats are no-ops.
    pub(crate) fn schedule_removal(&self, handler: Arc<IoHandler>) {
        if handler.mark_removal_scheduled() {
            return;
        }
        self.removed.lock().unwrap().push(handler);
        self.interrupt();
    }

    pub(crate) fn add_timer(&self, timer: ExpireTimer) {
        heap_push(&mut self.timers.lock().unwrap(), timer);
        // re-enter wait() so the new deadline bounds the poll timeout.
        self.interrupt();
    }

    pub(crate) fn interrupt(&self) {
        if let Err(err) = self.poller.notify() {
            logerr!("reactor {}: notify failed: {}", self.name, err);
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.timers.lock().unwrap().first().map(|t| t.deadline)
    }

    /// Fire every timer at or past its deadline. Dispatch happens after the heap
    /// lock is dropped.
    fn fire_due_timers(&self) {
        let now = Instant::now();
        let mut due = Vec::new();
        {
            let mut timers = self.timers.lock().unwrap();
            while timers.first().map(|t| t.deadline <= now).unwrap_or(false) {
                if let Some(t) = heap_pop(&mut timers) {
                    due.push(t);
                }
            }
        }
        for timer in due {
            match timer.action {
                TimerAction::Dispatch(Some(handler)) => handler.handle(Event::Timer),
                TimerAction::Dispatch(None) => {}
                TimerAction::RequestTimeout { handler, id } => {
                    let Some(handler) = handler.upgrade() else { continue };
                    // the response path may have claimed the id already; only
                    // one of the two ever delivers.
                    if let Some(target) = handler.take_pending(id) {
                        target.handle(Event::Error {
                            addr: handler.peer_addr(),
                            error: CommError::RequestTimeout { id },
                        });
                    }
                }
            }
        }
    }

    //------------------------------ cleanup ------------------------------

    /// Deferred teardown of handlers queued by `schedule_removal`. Runs on the
    /// reactor thread between poll iterations, when no event dispatch holds a
    /// reference into the handler's state.
    fn cleanup_removed(&self, shared: &EngineShared) {
        let batch: Vec<Arc<IoHandler>> = std::mem::take(&mut *self.removed.lock().unwrap());
        for handler in batch {
            shared.map.decommission_object(&handler);
            if !shared.map.destroy_ok(&handler) {
                logerr!("handler {} not retired, skipping purge", handler.peer_addr());
                continue;
            }
            self.release(&handler, shared);
        }
    }

    fn release(&self, handler: &Arc<IoHandler>, shared: &EngineShared) {
        handler.detach_poll();
        let token = handler.token();
        if token != INVALID_TOKEN {
            self.free_token(token);
        }
        handler.cancel_requests();
        shared.map.purge(handler);
        dbglog!("reactor {}: released handler {}", self.name, handler.peer_addr());
    }

    /// Shutdown path: tear down every handler still registered with this reactor.
    fn drain_all(&self, shared: &EngineShared) {
        self.cleanup_removed(shared);
        let remaining: Vec<Arc<IoHandler>> = {
            let handlers = self.handlers.lock().unwrap();
            handlers
                .keys()
                .iter()
                .filter_map(|k| handlers.get(*k).cloned())
                .collect()
        };
        for handler in remaining {
            handler.mark_removal_scheduled();
            shared.map.decommission_object(&handler);
            self.release(&handler, shared);
        }
        self.timers.lock().unwrap().clear();
    }
}

//====================================================================================
//            runner
//====================================================================================

/// Body of one reactor thread. Alternates between waiting for readiness or the
/// nearest timer deadline, dispatching events, firing timers and processing
/// deferred removals, until the engine is shut down.
pub(crate) fn run_reactor(reactor: Arc<Reactor>, shared: Arc<EngineShared>) {
    dbglog!("reactor {} running", reactor.name);
    let mut events = Events::new();
    while !shared.is_shutdown() {
        let timeout = reactor
            .next_deadline()
            .map(|d| d.saturating_duration_since(Instant::now()));
        events.clear();
        if let Err(err) = reactor.poller.wait(&mut events, timeout) {
            if err.kind() == ErrorKind::Interrupted {
                continue;
            }
            logerr!("reactor {}: wait failed: {}", reactor.name, err);
            break;
        }
        if let Some(delay) = shared.cfg.dispatch_delay {
            std::thread::sleep(delay);
        }
        // hangup/error conditions surface as events too (is_interrupt is set by
        // EPOLLHUP, not just poller notifications), so every event with a live
        // token goes through handle_event; error classification happens there.
        for ev in events.iter() {
            let Some(handler) = reactor.handler_for(ev.key) else {
                continue; // stale key, handler already released.
            };
            if handler.is_removal_scheduled() {
                continue;
            }
            if handler.handle_event(&ev, &shared) {
                reactor.schedule_removal(handler);
            }
        }
        reactor.fire_due_timers();
        reactor.cleanup_removed(&shared);
    }
    reactor.drain_all(&shared);
    dbglog!("reactor {} stopped", reactor.name);
}

#[cfg(test)]
mod test {
    use super::*;
    use std::time::Duration;

    #[test]
    pub fn test_heap_orders_by_deadline() {
        let base = Instant::now();
        let mut heap = Vec::new();
        for offset in [50u64, 10, 40, 20, 30] {
            heap_push(
                &mut heap,
                ExpireTimer {
                    deadline: base + Duration::from_millis(offset),
                    action: TimerAction::Dispatch(None),
                },
            );
        }
        let mut got = Vec::new();
        while let Some(t) = heap_pop(&mut heap) {
            got.push(t.deadline.duration_since(base).as_millis() as u64);
        }
        assert_eq!(got, vec![10, 20, 30, 40, 50]);
    }
}
