//! Broadcast event bus for job progress.
//!
//! Built on `tokio::sync::broadcast`. Several jobs may share one bus;
//! `subscribe_job` narrows a receiver to the events of a single job.
//! Publishing with no active subscribers is a no-op.

use folio_types::event::JobEvent;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

/// Multi-consumer bus for `JobEvent`s.
///
/// Cloning the bus clones the sender, so coordinators and the CLI can hold
/// their own handle to the same channel.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<JobEvent>,
}

impl EventBus {
    /// Create a bus whose receivers lag after `capacity` unread events.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Receive every event published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.sender.subscribe()
    }

    /// Receive the events of `job_id` published from now on.
    pub fn subscribe_job(&self, job_id: impl Into<String>) -> JobEvents {
        JobEvents {
            job_id: job_id.into(),
            receiver: self.sender.subscribe(),
        }
    }

    pub fn publish(&self, event: JobEvent) {
        let _ = self.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.sender.receiver_count())
            .finish()
    }
}

/// A receiver filtered to one job.
pub struct JobEvents {
    job_id: String,
    receiver: broadcast::Receiver<JobEvent>,
}

impl JobEvents {
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// Next event for this job. Errors mirror `broadcast::Receiver::recv`:
    /// `Lagged` when events were dropped, `Closed` once every sender is gone.
    pub async fn recv(&mut self) -> Result<JobEvent, RecvError> {
        loop {
            let event = self.receiver.recv().await?;
            if event.job_id() == self.job_id {
                return Ok(event);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use folio_types::workflow::JobPhase;

    fn started(job_id: &str) -> JobEvent {
        JobEvent::JobStarted {
            job_id: job_id.to_string(),
            total_units: 3,
        }
    }

    #[tokio::test]
    async fn test_every_subscriber_sees_event() {
        let bus = EventBus::new(16);
        let mut first = bus.subscribe();
        let mut second = bus.clone().subscribe();

        bus.publish(started("job-1"));

        assert!(matches!(first.recv().await.unwrap(), JobEvent::JobStarted { total_units: 3, .. }));
        assert_eq!(second.recv().await.unwrap().job_id(), "job-1");
    }

    #[tokio::test]
    async fn test_job_subscription_skips_other_jobs() {
        let bus = EventBus::new(16);
        let mut events = bus.subscribe_job("job-2");

        bus.publish(started("job-1"));
        bus.publish(JobEvent::JobFinished {
            job_id: "job-2".to_string(),
            phase: JobPhase::Done,
            completed: 3,
            abandoned: 0,
        });

        let event = events.recv().await.unwrap();
        assert!(matches!(event, JobEvent::JobFinished { phase: JobPhase::Done, .. }));
        assert_eq!(events.job_id(), "job-2");
    }

    #[tokio::test]
    async fn test_job_subscription_closes_with_bus() {
        let bus = EventBus::new(16);
        let mut events = bus.subscribe_job("job-1");
        drop(bus);

        assert_eq!(events.recv().await.unwrap_err(), RecvError::Closed);
    }

    #[test]
    fn test_publish_without_subscribers() {
        let bus = EventBus::new(16);
        bus.publish(started("job-1"));
        assert!(format!("{bus:?}").contains("subscribers: 0"));
    }
}
