//! Background tasks.
//!
//! Inbound [`ActionEvent`]s arrive on an mpsc channel and are applied by a
//! small pool of consumers. A separate sweeper settles timed-out joins,
//! requeues stale or cold work, and runs auto-resume on a fixed interval.
//! Both stop when their cancellation token fires.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::event::ActionEvent;
use crate::service::DeltaFilesService;

/// Create the channel workers report into.
pub fn event_channel(capacity: usize) -> (mpsc::Sender<ActionEvent>, mpsc::Receiver<ActionEvent>) {
    mpsc::channel(capacity.max(1))
}

/// Apply inbound events with `workers` concurrent consumers.
///
/// Returns when the channel closes or `cancel` fires.
pub async fn run_event_workers(
    service: Arc<DeltaFilesService>,
    events: mpsc::Receiver<ActionEvent>,
    workers: usize,
    cancel: CancellationToken,
) {
    let events = Arc::new(Mutex::new(events));
    let mut tasks = JoinSet::new();
    for worker in 0..workers.max(1) {
        tasks.spawn(consume(worker, service.clone(), events.clone(), cancel.clone()));
    }
    tracing::info!(workers = workers.max(1), "Event workers started");

    while let Some(result) = tasks.join_next().await {
        if let Err(e) = result {
            tracing::error!("Event worker panicked: {e}");
        }
    }
    tracing::info!("Event workers stopped");
}

async fn consume(
    worker: usize,
    service: Arc<DeltaFilesService>,
    events: Arc<Mutex<mpsc::Receiver<ActionEvent>>>,
    cancel: CancellationToken,
) {
    loop {
        let next = tokio::select! {
            event = async { events.lock().await.recv().await } => event,
            _ = cancel.cancelled() => break,
        };
        let Some(event) = next else {
            break;
        };

        let did = event.did;
        let action = event.action_name.clone();
        match service.handle_event(event).await {
            Ok(delta_file) => {
                tracing::debug!(worker, did = %did, action = %action, stage = %delta_file.stage, "Event applied");
            }
            // Rejections are already logged and announced by the service.
            Err(df_core::Error::UnexpectedAction { .. } | df_core::Error::InvalidEvent { .. }) => {}
            Err(e) => {
                tracing::error!(worker, did = %did, action = %action, "Event failed: {e}");
            }
        }
    }
}

/// Run the periodic sweeps until `cancel` fires.
pub async fn run_sweeper(service: Arc<DeltaFilesService>, interval: Duration, cancel: CancellationToken) {
    tracing::info!(interval_ms = interval.as_millis() as u64, "Sweeper started");

    match service.restore_joins().await {
        Ok(0) => {}
        Ok(restored) => tracing::info!(restored, "Restored parked join members"),
        Err(e) => tracing::error!("Failed to restore joins: {e}"),
    }

    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = cancel.cancelled() => { break; }
        }
        sweep_once(&service).await;
    }

    tracing::info!("Sweeper stopped");
}

/// One pass of every sweep. Failures are logged; the next pass retries.
pub async fn sweep_once(service: &DeltaFilesService) {
    let now = Utc::now();
    if let Err(e) = service.sweep_joins(now).await {
        tracing::error!("Join sweep failed: {e}");
    }
    if let Err(e) = service.requeue(now).await {
        tracing::error!("Requeue sweep failed: {e}");
    }
    if let Err(e) = service.auto_resume(now).await {
        tracing::error!("Auto-resume sweep failed: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::InMemoryDispatchQueue;
    use crate::event::Outcome;
    use crate::repository::InMemoryDeltaFileRepository;
    use crate::router::FlowRouter;
    use crate::service::IngressRequest;
    use df_core::config::Config;
    use df_core::events::EventBus;
    use df_model::{ActionType, DeltaFileStage, FlowType};
    use df_rules::{ActionConfiguration, FlowPlan, FlowPlans, PublishRules, Rule};

    fn make_test_service(queue: Arc<InMemoryDispatchQueue>) -> Arc<DeltaFilesService> {
        let mut source = FlowPlan::new("rest", FlowType::RestDataSource);
        source.publish = Some(PublishRules::to_topic("raw"));
        let mut sink = FlowPlan::new("archive", FlowType::DataSink);
        sink.subscribe = vec![Rule::new("raw")];
        sink.actions = vec![ActionConfiguration::new("egress", ActionType::Egress, "E")];
        let router = FlowRouter::new(
            Arc::new(FlowPlans::new(vec![source, sink])),
            Arc::new(Config::default()),
        );
        Arc::new(DeltaFilesService::new(
            Arc::new(InMemoryDeltaFileRepository::new()),
            queue,
            router,
            Arc::new(EventBus::default()),
        ))
    }

    #[tokio::test]
    async fn workers_apply_events_until_channel_closes() {
        let queue = Arc::new(InMemoryDispatchQueue::new());
        let service = make_test_service(queue.clone());
        let df = service
            .ingest(IngressRequest {
                data_source: "rest".into(),
                name: "input.txt".into(),
                content: Vec::new(),
                metadata: Default::default(),
            })
            .await
            .unwrap();
        let invocation = queue.pop("E").unwrap();

        let (tx, rx) = event_channel(8);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_event_workers(service.clone(), rx, 2, cancel.clone()));

        let now = Utc::now();
        tx.send(ActionEvent {
            did: df.did,
            flow_id: invocation.context.flow_id,
            action_name: invocation.context.action_name.clone(),
            attempt: invocation.context.attempt,
            start: now,
            stop: now,
            outcome: Outcome::Egress(Default::default()),
        })
        .await
        .unwrap();
        drop(tx);
        handle.await.unwrap();

        let stored = service.get(df.did).await.unwrap();
        assert_eq!(stored.stage, DeltaFileStage::Complete);
        assert!(stored.egressed);
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_stops_on_cancel() {
        let service = make_test_service(Arc::new(InMemoryDispatchQueue::new()));
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_sweeper(service, Duration::from_millis(10), cancel.clone()));
        tokio::time::sleep(Duration::from_millis(35)).await;
        cancel.cancel();
        handle.await.unwrap();
    }
}
