//! Run-scoped execution events: the event value type, the in-process bus that
//! fans events out to live subscribers, and the adapter that bridges one
//! subscription to one outbound push connection.

pub mod bus;
pub mod event;
pub mod stream;

pub use bus::{ExecutionEventBus, SubscriberError, SubscriberResult, Subscription};
pub use event::{ExecutionEvent, ExecutionEventType};
pub use stream::{
    AttachedStream, CONNECTED_EVENT, ConnectionClosed, PushConnection, StreamAdapter, StreamFrame,
};
