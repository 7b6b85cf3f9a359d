//! Process-wide services shared by every request and by the worker pool.

use std::convert::Infallible;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::Stream;

use pressflow_core::RunId;
use pressflow_events::{
    AttachedStream, ConnectionClosed, ExecutionEventBus, PushConnection, StreamAdapter, StreamFrame,
};
use pressflow_infra::jobs::{
    HandlerRegistry, InMemoryJobRepository, Job, JobOutcome, JobQueue, JobRepository,
    WorkerPool, WorkerPoolConfig, WorkerPoolError, WorkerPoolHandle,
};

use crate::app::dto::PublishEventRequest;

/// Job type whose payload is an event to publish on the job's run.
pub const RUN_EVENT_JOB: &str = "run.event";

pub type SharedJobRepository = Arc<dyn JobRepository>;
pub type SharedJobQueue = Arc<JobQueue<SharedJobRepository>>;

/// One bus, one queue, one stream adapter for the whole process.
pub struct AppServices {
    bus: ExecutionEventBus,
    queue: SharedJobQueue,
    streams: StreamAdapter,
    sse_keep_alive: Duration,
}

impl AppServices {
    pub fn new(
        bus: ExecutionEventBus,
        repository: SharedJobRepository,
        sse_keep_alive: Duration,
    ) -> Self {
        Self {
            streams: StreamAdapter::new(bus.clone()),
            queue: Arc::new(JobQueue::new(repository)),
            bus,
            sse_keep_alive,
        }
    }

    /// Services backed by the in-memory job store.
    pub fn in_memory(sse_keep_alive: Duration) -> Self {
        Self::new(ExecutionEventBus::new(), InMemoryJobRepository::arc(), sse_keep_alive)
    }

    pub fn bus(&self) -> &ExecutionEventBus {
        &self.bus
    }

    pub fn queue(&self) -> &SharedJobQueue {
        &self.queue
    }

    pub fn streams(&self) -> &StreamAdapter {
        &self.streams
    }

    /// Handlers every deployment runs; callers may add their own before starting.
    pub fn builtin_handlers(&self) -> HandlerRegistry {
        let mut handlers = HandlerRegistry::new();
        let bus = self.bus.clone();
        handlers.register(RUN_EVENT_JOB, move |job| publish_run_event(&bus, job));
        handlers
    }

    /// Start the worker pool draining this process's queue.
    pub fn start_workers(
        &self,
        handlers: HandlerRegistry,
        config: WorkerPoolConfig,
    ) -> Result<WorkerPoolHandle, WorkerPoolError> {
        WorkerPool::new(self.queue.clone(), handlers).start(config)
    }

    /// SSE response streaming every event of `run_id` until the client goes away.
    pub fn run_sse_stream(&self, run_id: RunId) -> Sse<RunEventStream> {
        let (tx, rx) = unbounded_channel();
        let attached = self.streams.attach(run_id, SseConnection(tx));
        let stream = RunEventStream {
            events: UnboundedReceiverStream::new(rx),
            _attached: attached,
        };

        Sse::new(stream).keep_alive(KeepAlive::new().interval(self.sse_keep_alive))
    }
}

fn publish_run_event(bus: &ExecutionEventBus, job: &Job) -> JobOutcome {
    let Some(run_id) = job.run_id.clone() else {
        return JobOutcome::permanent("run.event job has no run_id");
    };
    let request: PublishEventRequest = match serde_json::from_value(job.payload.clone()) {
        Ok(r) => r,
        Err(e) => return JobOutcome::permanent(format!("invalid run.event payload: {}", e)),
    };
    match request.into_event(run_id) {
        Ok(event) => {
            bus.publish(&event);
            JobOutcome::Success
        }
        Err(msg) => JobOutcome::permanent(msg),
    }
}

/// Push connection over an SSE response body.
struct SseConnection(UnboundedSender<Result<SseEvent, Infallible>>);

impl PushConnection for SseConnection {
    fn send(&self, frame: StreamFrame) -> Result<(), ConnectionClosed> {
        let event = SseEvent::default().event(frame.event()).data(frame.data());
        self.0.send(Ok(event)).map_err(|_| ConnectionClosed)
    }
}

/// SSE body that owns its bus attachment: dropping the response detaches it.
pub struct RunEventStream {
    events: UnboundedReceiverStream<Result<SseEvent, Infallible>>,
    _attached: AttachedStream,
}

impl Stream for RunEventStream {
    type Item = Result<SseEvent, Infallible>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.events).poll_next(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pressflow_events::{ExecutionEvent, ExecutionEventType};
    use std::sync::Mutex;

    fn services() -> AppServices {
        AppServices::in_memory(Duration::from_secs(15))
    }

    #[test]
    fn run_event_job_publishes_to_subscribers() {
        let services = services();
        let run_id = RunId::new("run-7").unwrap();
        let seen = Arc::new(Mutex::new(Vec::<ExecutionEvent>::new()));
        let sink = seen.clone();
        let _sub = services.bus().subscribe(run_id.clone(), move |e| {
            sink.lock().unwrap().push(e.clone());
            Ok(())
        });

        let handlers = services.builtin_handlers();
        let job = Job::new(
            RUN_EVENT_JOB,
            serde_json::json!({"type": "log-appended", "payload": {"line": "hello"}}),
            1,
            chrono::Utc::now(),
        )
        .for_run(run_id);

        assert_eq!((handlers.get(RUN_EVENT_JOB).unwrap())(&job), JobOutcome::Success);
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].event_type(), ExecutionEventType::LogAppended);
    }

    #[test]
    fn run_event_job_without_run_fails_permanently() {
        let services = services();
        let payload = serde_json::json!({"type": "run-updated"});
        let job = Job::new(RUN_EVENT_JOB, payload, 1, chrono::Utc::now());
        assert!(matches!(
            publish_run_event(services.bus(), &job),
            JobOutcome::Permanent(_)
        ));
    }

    #[test]
    fn dropping_sse_stream_unsubscribes() {
        let services = services();
        let run_id = RunId::new("run-8").unwrap();

        let sse = services.run_sse_stream(run_id.clone());
        assert_eq!(services.bus().subscription_count(&run_id), 1);

        drop(sse);
        assert_eq!(services.bus().subscription_count(&run_id), 0);
    }
}
