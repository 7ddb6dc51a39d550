use std::sync::{Arc, Weak};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::engine::Conflict;
use crate::model::{Allocation, Ms};

const CHANNEL_CAPACITY: usize = 1024;

/// Change events published after a commit is durable. Never sent for a chunk
/// that rolled back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChangeEvent {
    AllocationCreated {
        allocation: Allocation,
        timestamp: Ms,
    },
    AllocationUpdated {
        allocation: Allocation,
        /// Set when the allocation moved to another employee.
        previous_employee_id: Option<Ulid>,
        /// Set when the allocation moved to another project.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        previous_project_id: Option<Ulid>,
        timestamp: Ms,
    },
    AllocationDeleted {
        allocation_id: Ulid,
        employee_id: Ulid,
        project_id: Ulid,
        cascaded: Vec<Ulid>,
        /// Soft delete: the row still exists with `is_active = false`.
        soft: bool,
        timestamp: Ms,
    },
    ConflictDetected {
        allocation_id: Option<Ulid>,
        employee_id: Ulid,
        project_id: Ulid,
        conflicts: Vec<Conflict>,
        timestamp: Ms,
    },
    BulkProgress {
        operation_id: Ulid,
        current: u64,
        total: u64,
        percentage: u8,
        timestamp: Ms,
    },
}

impl ChangeEvent {
    /// Every employee the event concerns. A move touches two.
    pub fn employee_ids(&self) -> Vec<Ulid> {
        match self {
            ChangeEvent::AllocationCreated { allocation, .. } => vec![allocation.employee_id],
            ChangeEvent::AllocationUpdated {
                allocation,
                previous_employee_id,
                ..
            } => match previous_employee_id {
                Some(prev) if *prev != allocation.employee_id => vec![*prev, allocation.employee_id],
                _ => vec![allocation.employee_id],
            },
            ChangeEvent::AllocationDeleted { employee_id, .. }
            | ChangeEvent::ConflictDetected { employee_id, .. } => vec![*employee_id],
            ChangeEvent::BulkProgress { .. } => Vec::new(),
        }
    }

    /// Every project the event concerns. A move across projects touches two.
    pub fn project_ids(&self) -> Vec<Ulid> {
        match self {
            ChangeEvent::AllocationCreated { allocation, .. } => vec![allocation.project_id],
            ChangeEvent::AllocationUpdated {
                allocation,
                previous_project_id,
                ..
            } => match previous_project_id {
                Some(prev) if *prev != allocation.project_id => vec![*prev, allocation.project_id],
                _ => vec![allocation.project_id],
            },
            ChangeEvent::AllocationDeleted { project_id, .. }
            | ChangeEvent::ConflictDetected { project_id, .. } => vec![*project_id],
            ChangeEvent::BulkProgress { .. } => Vec::new(),
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            ChangeEvent::AllocationCreated { .. } => "allocation_created",
            ChangeEvent::AllocationUpdated { .. } => "allocation_updated",
            ChangeEvent::AllocationDeleted { .. } => "allocation_deleted",
            ChangeEvent::ConflictDetected { .. } => "conflict_detected",
            ChangeEvent::BulkProgress { .. } => "bulk_progress",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    All,
    Employee(Ulid),
    Project(Ulid),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionFilter {
    #[serde(default)]
    pub employee_id: Option<Ulid>,
    #[serde(default)]
    pub project_id: Option<Ulid>,
}

impl SubscriptionFilter {
    /// One topic per subscriber, so an event is delivered to it at most once.
    fn topic(&self) -> Topic {
        match (self.employee_id, self.project_id) {
            (Some(e), _) => Topic::Employee(e),
            (None, Some(p)) => Topic::Project(p),
            (None, None) => Topic::All,
        }
    }

    pub fn matches(&self, event: &ChangeEvent) -> bool {
        if let Some(e) = self.employee_id
            && !event.employee_ids().contains(&e) {
                return false;
            }
        if let Some(p) = self.project_id
            && !event.project_ids().contains(&p) {
                return false;
            }
        true
    }
}

/// Broadcast hub: one channel per topic, created on first subscribe and
/// dropped once its last receiver goes away.
pub struct NotifyHub {
    channels: Arc<Channels>,
}

type Channels = DashMap<Topic, broadcast::Sender<ChangeEvent>>;

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: Arc::new(DashMap::new()),
        }
    }

    pub fn subscribe(&self, filter: SubscriptionFilter) -> Subscription {
        let topic = filter.topic();
        let rx = self
            .channels
            .entry(topic)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe();
        metrics::gauge!(crate::observability::SUBSCRIBERS_ACTIVE).increment(1.0);
        Subscription {
            rx,
            filter,
            topic,
            channels: Arc::downgrade(&self.channels),
        }
    }

    /// Fan out to the global topic and every employee/project topic the event
    /// touches. No-op for topics nobody listens to.
    pub fn publish(&self, event: &ChangeEvent) {
        let mut topics = vec![Topic::All];
        topics.extend(event.employee_ids().into_iter().map(Topic::Employee));
        topics.extend(event.project_ids().into_iter().map(Topic::Project));

        let mut dead = Vec::new();
        for topic in topics {
            if let Some(sender) = self.channels.get(&topic)
                && sender.send(event.clone()).is_err() {
                    dead.push(topic);
                }
        }
        for topic in dead {
            self.channels.remove_if(&topic, |_, s| s.receiver_count() == 0);
        }
    }

    pub fn topic_count(&self) -> usize {
        self.channels.len()
    }
}

/// Receiving half of a subscription. A lagged receiver has lost events and
/// must re-fetch state instead of trusting its buffer.
pub struct Subscription {
    rx: broadcast::Receiver<ChangeEvent>,
    filter: SubscriptionFilter,
    topic: Topic,
    channels: Weak<Channels>,
}

impl Subscription {
    pub fn filter(&self) -> SubscriptionFilter {
        self.filter
    }

    /// Next matching event. `Lagged(n)` means `n` events were dropped.
    pub async fn recv(&mut self) -> Result<ChangeEvent, broadcast::error::RecvError> {
        loop {
            let event = self.rx.recv().await?;
            if self.filter.matches(&event) {
                return Ok(event);
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        metrics::gauge!(crate::observability::SUBSCRIBERS_ACTIVE).decrement(1.0);
        // `self.rx` is still counted here; it is released after this body.
        if let Some(channels) = self.channels.upgrade() {
            channels.remove_if(&self.topic, |_, s| s.receiver_count() <= 1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AllocationStatus, DateRange};
    use broadcast::error::{RecvError, TryRecvError};

    fn allocation(employee_id: Ulid, project_id: Ulid) -> Allocation {
        Allocation {
            id: Ulid::new(),
            employee_id,
            project_id,
            range: DateRange::new(
                "2026-01-01".parse().unwrap(),
                "2026-01-31".parse().unwrap(),
            ),
            allocated_hours: 8.0,
            role: None,
            status: AllocationStatus::Active,
            is_active: true,
            created_at: 0,
            updated_at: 0,
        }
    }

    fn created(employee_id: Ulid, project_id: Ulid) -> ChangeEvent {
        ChangeEvent::AllocationCreated {
            allocation: allocation(employee_id, project_id),
            timestamp: 1,
        }
    }

    #[tokio::test]
    async fn employee_subscriber_sees_only_its_employee() {
        let hub = NotifyHub::new();
        let (alice, bob, project) = (Ulid::new(), Ulid::new(), Ulid::new());
        let mut sub = hub.subscribe(SubscriptionFilter {
            employee_id: Some(alice),
            project_id: None,
        });

        hub.publish(&created(bob, project));
        let mine = created(alice, project);
        hub.publish(&mine);

        assert_eq!(sub.recv().await.unwrap(), mine);
        assert!(matches!(sub.rx.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test]
    async fn global_and_project_subscribers_each_get_one_copy() {
        let hub = NotifyHub::new();
        let (employee, project) = (Ulid::new(), Ulid::new());
        let mut all = hub.subscribe(SubscriptionFilter::default());
        let mut by_project = hub.subscribe(SubscriptionFilter {
            employee_id: None,
            project_id: Some(project),
        });

        let event = created(employee, project);
        hub.publish(&event);

        assert_eq!(all.recv().await.unwrap(), event);
        assert_eq!(by_project.recv().await.unwrap(), event);
        assert!(matches!(all.rx.try_recv(), Err(TryRecvError::Empty)));
        assert!(matches!(by_project.rx.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test]
    async fn combined_filter_requires_both() {
        let hub = NotifyHub::new();
        let (employee, p1, p2) = (Ulid::new(), Ulid::new(), Ulid::new());
        let mut sub = hub.subscribe(SubscriptionFilter {
            employee_id: Some(employee),
            project_id: Some(p2),
        });
        hub.publish(&created(employee, p1));
        let wanted = created(employee, p2);
        hub.publish(&wanted);
        assert_eq!(sub.recv().await.unwrap(), wanted);
    }

    #[tokio::test]
    async fn move_reaches_old_and_new_employee() {
        let hub = NotifyHub::new();
        let (from, to, project) = (Ulid::new(), Ulid::new(), Ulid::new());
        let mut old = hub.subscribe(SubscriptionFilter {
            employee_id: Some(from),
            project_id: None,
        });
        let mut new = hub.subscribe(SubscriptionFilter {
            employee_id: Some(to),
            project_id: None,
        });

        let event = ChangeEvent::AllocationUpdated {
            allocation: allocation(to, project),
            previous_employee_id: Some(from),
            previous_project_id: None,
            timestamp: 2,
        };
        hub.publish(&event);
        assert_eq!(old.recv().await.unwrap(), event);
        assert_eq!(new.recv().await.unwrap(), event);
    }

    #[tokio::test]
    async fn project_move_reaches_old_project() {
        let hub = NotifyHub::new();
        let (employee, from, to) = (Ulid::new(), Ulid::new(), Ulid::new());
        let mut old = hub.subscribe(SubscriptionFilter {
            employee_id: None,
            project_id: Some(from),
        });

        let event = ChangeEvent::AllocationUpdated {
            allocation: allocation(employee, to),
            previous_employee_id: None,
            previous_project_id: Some(from),
            timestamp: 3,
        };
        hub.publish(&event);
        assert_eq!(old.recv().await.unwrap(), event);
    }

    #[tokio::test]
    async fn lagged_subscriber_is_told() {
        let hub = NotifyHub::new();
        let mut sub = hub.subscribe(SubscriptionFilter::default());
        for _ in 0..CHANNEL_CAPACITY + 10 {
            hub.publish(&created(Ulid::new(), Ulid::new()));
        }
        assert!(matches!(sub.recv().await, Err(RecvError::Lagged(_))));
    }

    #[tokio::test]
    async fn dropped_topics_are_pruned() {
        let hub = NotifyHub::new();
        let employee = Ulid::new();
        let sub = hub.subscribe(SubscriptionFilter {
            employee_id: Some(employee),
            project_id: None,
        });
        assert_eq!(hub.topic_count(), 1);
        drop(sub);
        hub.publish(&created(employee, Ulid::new()));
        assert_eq!(hub.topic_count(), 0);
    }

    #[test]
    fn last_subscriber_drop_removes_topic() {
        let hub = NotifyHub::new();
        let project = Ulid::new();
        let filter = SubscriptionFilter {
            employee_id: None,
            project_id: Some(project),
        };
        let first = hub.subscribe(filter);
        let second = hub.subscribe(filter);
        let all = hub.subscribe(SubscriptionFilter::default());
        assert_eq!(hub.topic_count(), 2);

        drop(first);
        assert_eq!(hub.topic_count(), 2);
        drop(second);
        assert_eq!(hub.topic_count(), 1);
        drop(all);
        assert_eq!(hub.topic_count(), 0);
    }

    #[test]
    fn subscription_outliving_hub_drops_cleanly() {
        let hub = NotifyHub::new();
        let sub = hub.subscribe(SubscriptionFilter::default());
        drop(hub);
        drop(sub);
    }

    #[test]
    fn publish_without_subscribers_is_noop() {
        let hub = NotifyHub::new();
        hub.publish(&created(Ulid::new(), Ulid::new()));
        assert_eq!(hub.topic_count(), 0);
    }

    #[test]
    fn event_json_is_tagged() {
        let event = ChangeEvent::BulkProgress {
            operation_id: Ulid::new(),
            current: 2,
            total: 5,
            percentage: 40,
            timestamp: 3,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "bulk_progress");
        assert_eq!(json["percentage"], 40);
    }
}
