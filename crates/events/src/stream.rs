//! Bridge from one bus subscription to one outbound push connection.
//!
//! Wire format per event (server-sent events):
//!
//! ```text
//! event: <type>
//! data: <json>
//!
//! ```
//!
//! A synthetic `connected` frame is written on attach, before any domain
//! event, so clients can tell "stream open" apart from "first event".
//! Nothing is buffered: events published while no connection is attached are
//! never replayed.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tracing::debug;

use pressflow_core::RunId;

use crate::bus::{ExecutionEventBus, SubscriberError, Subscription};
use crate::event::ExecutionEvent;

/// SSE event name of the frame sent on attach.
pub const CONNECTED_EVENT: &str = "connected";

/// One outbound frame: an event name plus a single-line JSON body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamFrame {
    event: String,
    data: String,
}

impl StreamFrame {
    pub fn new(event: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            event: event.into(),
            data: data.into(),
        }
    }

    /// The frame written when a client attaches to `run_id`.
    pub fn connected(run_id: &RunId) -> Self {
        Self::new(
            CONNECTED_EVENT,
            serde_json::json!({ "runId": run_id }).to_string(),
        )
    }

    /// Frame carrying `event`, named after its type.
    pub fn from_event(event: &ExecutionEvent) -> Result<Self, serde_json::Error> {
        Ok(Self::new(event.event_type().as_str(), serde_json::to_string(event)?))
    }

    pub fn event(&self) -> &str {
        &self.event
    }

    pub fn data(&self) -> &str {
        &self.data
    }

    /// Serialize as an SSE record. Multi-line data gets one `data:` line each.
    pub fn encode(&self) -> String {
        let mut out = format!("event: {}\n", self.event);
        for line in self.data.split('\n') {
            out.push_str("data: ");
            out.push_str(line);
            out.push('\n');
        }
        out.push('\n');
        out
    }
}

/// The remote end went away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("push connection closed")]
pub struct ConnectionClosed;

/// A long-lived outbound connection to one client.
pub trait PushConnection: Send + Sync + 'static {
    fn send(&self, frame: StreamFrame) -> Result<(), ConnectionClosed>;
}

impl PushConnection for std::sync::mpsc::Sender<StreamFrame> {
    fn send(&self, frame: StreamFrame) -> Result<(), ConnectionClosed> {
        std::sync::mpsc::Sender::send(self, frame).map_err(|_| ConnectionClosed)
    }
}

type SubscriptionSlot = Arc<Mutex<Option<Subscription>>>;

fn release(slot: &SubscriptionSlot) -> bool {
    let taken = slot.lock().unwrap_or_else(PoisonError::into_inner).take();
    match taken {
        Some(subscription) => {
            subscription.unsubscribe();
            true
        }
        None => false,
    }
}

/// Attaches push connections to runs on an [`ExecutionEventBus`].
#[derive(Debug, Clone)]
pub struct StreamAdapter {
    bus: ExecutionEventBus,
}

impl StreamAdapter {
    pub fn new(bus: ExecutionEventBus) -> Self {
        Self { bus }
    }

    pub fn bus(&self) -> &ExecutionEventBus {
        &self.bus
    }

    /// Send the `connected` frame, then forward every event of `run_id` to
    /// `connection` until the returned [`AttachedStream`] is detached or
    /// dropped, or a send reports the connection closed.
    pub fn attach<C: PushConnection>(&self, run_id: RunId, connection: C) -> AttachedStream {
        let slot: SubscriptionSlot = Arc::new(Mutex::new(None));
        let closed = Arc::new(AtomicBool::new(false));

        if connection.send(StreamFrame::connected(&run_id)).is_err() {
            debug!(run_id = %run_id, "push connection closed before attach");
            closed.store(true, Ordering::Release);
            return AttachedStream { run_id, slot, closed };
        }

        let handler_slot = slot.clone();
        let handler_closed = closed.clone();
        let subscription = self.bus.subscribe(run_id.clone(), move |event| {
            if handler_closed.load(Ordering::Acquire) {
                return Ok(());
            }
            let frame = StreamFrame::from_event(event)
                .map_err(|e| SubscriberError::new(format!("failed to encode event: {e}")))?;
            if connection.send(frame).is_err() {
                handler_closed.store(true, Ordering::Release);
                if release(&handler_slot) {
                    debug!(run_id = %event.run_id(), "push connection closed; stream detached");
                }
            }
            Ok(())
        });

        *slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(subscription);
        // The connection may have closed between subscribing and storing the handle.
        if closed.load(Ordering::Acquire) {
            release(&slot);
        }

        debug!(run_id = %run_id, "stream attached");
        AttachedStream { run_id, slot, closed }
    }
}

/// A live attachment. Detaching, or dropping it, unsubscribes exactly once.
#[must_use = "dropping an AttachedStream detaches it immediately"]
#[derive(Debug)]
pub struct AttachedStream {
    run_id: RunId,
    slot: SubscriptionSlot,
    closed: Arc<AtomicBool>,
}

impl AttachedStream {
    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    /// Whether a send has observed the connection as closed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Whether the bus subscription is still held.
    pub fn is_attached(&self) -> bool {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    pub fn detach(&self) {
        self.closed.store(true, Ordering::Release);
        if release(&self.slot) {
            debug!(run_id = %self.run_id, "stream detached");
        }
    }
}

impl Drop for AttachedStream {
    fn drop(&mut self) {
        self.detach();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::ExecutionEventType;
    use std::sync::mpsc;

    fn run(id: &str) -> RunId {
        RunId::new(id).unwrap()
    }

    fn drain(rx: &mpsc::Receiver<StreamFrame>) -> Vec<StreamFrame> {
        rx.try_iter().collect()
    }

    #[test]
    fn connected_frame_comes_first_then_domain_events() {
        let bus = ExecutionEventBus::new();
        let adapter = StreamAdapter::new(bus.clone());
        let (tx, rx) = mpsc::channel();

        let _stream = adapter.attach(run("run-A"), tx);
        bus.publish(
            &ExecutionEvent::new(ExecutionEventType::StepCompleted, run("run-A"))
                .with_step("outline"),
        );

        let frames = drain(&rx);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].event(), CONNECTED_EVENT);
        assert_eq!(frames[0].data(), r#"{"runId":"run-A"}"#);
        assert_eq!(frames[1].event(), "step-completed");

        let body: serde_json::Value = serde_json::from_str(frames[1].data()).unwrap();
        assert_eq!(body["stepKey"], "outline");
        assert_eq!(body["runId"], "run-A");
    }

    #[test]
    fn detach_restores_subscription_count() {
        let bus = ExecutionEventBus::new();
        let adapter = StreamAdapter::new(bus.clone());
        let before = bus.total_subscription_count();
        let (tx, _rx) = mpsc::channel();

        let stream = adapter.attach(run("run-A"), tx);
        assert_eq!(bus.subscription_count(&run("run-A")), 1);

        stream.detach();
        stream.detach();
        assert!(!stream.is_attached());
        assert_eq!(bus.total_subscription_count(), before);
        drop(stream);
        assert_eq!(bus.total_subscription_count(), before);
    }

    #[test]
    fn dropping_the_stream_detaches_it() {
        let bus = ExecutionEventBus::new();
        let adapter = StreamAdapter::new(bus.clone());
        let (tx, rx) = mpsc::channel();

        drop(adapter.attach(run("run-A"), tx));
        bus.publish(&ExecutionEvent::new(ExecutionEventType::RunUpdated, run("run-A")));

        assert_eq!(bus.subscription_count(&run("run-A")), 0);
        assert_eq!(drain(&rx).len(), 1);
    }

    #[test]
    fn closed_connection_unsubscribes_on_next_publish() {
        let bus = ExecutionEventBus::new();
        let adapter = StreamAdapter::new(bus.clone());
        let (tx, rx) = mpsc::channel();

        let stream = adapter.attach(run("run-A"), tx);
        drop(rx);
        assert_eq!(bus.subscription_count(&run("run-A")), 1);

        bus.publish(&ExecutionEvent::new(ExecutionEventType::RunUpdated, run("run-A")));

        assert!(stream.is_closed());
        assert!(!stream.is_attached());
        assert_eq!(bus.subscription_count(&run("run-A")), 0);
    }

    #[test]
    fn connection_closed_before_attach_never_subscribes() {
        let bus = ExecutionEventBus::new();
        let adapter = StreamAdapter::new(bus.clone());
        let (tx, rx) = mpsc::channel::<StreamFrame>();
        drop(rx);

        let stream = adapter.attach(run("run-A"), tx);
        assert!(stream.is_closed());
        assert_eq!(bus.total_subscription_count(), 0);
    }

    #[test]
    fn events_before_attach_are_not_replayed() {
        let bus = ExecutionEventBus::new();
        let adapter = StreamAdapter::new(bus.clone());
        bus.publish(&ExecutionEvent::new(ExecutionEventType::RunUpdated, run("run-A")));

        let (tx, rx) = mpsc::channel();
        let _stream = adapter.attach(run("run-A"), tx);

        let frames = drain(&rx);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].event(), CONNECTED_EVENT);
    }

    #[test]
    fn two_viewers_of_one_run_each_get_every_event() {
        let bus = ExecutionEventBus::new();
        let adapter = StreamAdapter::new(bus.clone());
        let (tx1, rx1) = mpsc::channel();
        let (tx2, rx2) = mpsc::channel();
        let _s1 = adapter.attach(run("run-A"), tx1);
        let _s2 = adapter.attach(run("run-A"), tx2);

        bus.publish(&ExecutionEvent::new(ExecutionEventType::RunCompleted, run("run-A")));
        bus.publish(&ExecutionEvent::new(ExecutionEventType::RunCompleted, run("run-B")));

        assert_eq!(drain(&rx1).len(), 2);
        assert_eq!(drain(&rx2).len(), 2);
    }

    #[test]
    fn frames_encode_as_server_sent_events() {
        let frame = StreamFrame::new("run-updated", r#"{"a":1}"#);
        assert_eq!(frame.encode(), "event: run-updated\ndata: {\"a\":1}\n\n");

        let multi = StreamFrame::new("log-appended", "one\ntwo");
        assert_eq!(multi.encode(), "event: log-appended\ndata: one\ndata: two\n\n");
    }
}
