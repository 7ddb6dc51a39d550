use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};
use ulid::Ulid;

use crate::engine::{AllocationQuery, Engine};
use crate::model::Allocation;
use crate::notify::{ChangeEvent, Subscription, SubscriptionFilter};

/// Subscriber-side cache of the active allocations matching a filter.
///
/// The subscription is opened before the snapshot is read, so nothing
/// committed in between is lost; events that the snapshot already reflects
/// are applied again harmlessly. When the channel lags the cache is stale
/// and re-reads the engine before trusting any further event.
pub struct AllocationCache {
    engine: Arc<Engine>,
    subscription: Subscription,
    rows: HashMap<Ulid, Allocation>,
    stale: bool,
    resyncs: u64,
}

impl AllocationCache {
    pub async fn open(engine: Arc<Engine>, filter: SubscriptionFilter) -> Self {
        let subscription = engine.notify.subscribe(filter);
        let mut cache = Self {
            engine,
            subscription,
            rows: HashMap::new(),
            stale: true,
            resyncs: 0,
        };
        cache.resync().await;
        cache.resyncs = 0;
        cache
    }

    pub fn filter(&self) -> SubscriptionFilter {
        self.subscription.filter()
    }

    /// Replace the cached rows with a fresh read of the engine.
    pub async fn resync(&mut self) {
        let filter = self.filter();
        let query = AllocationQuery {
            employee_id: filter.employee_id,
            project_id: filter.project_id,
            include_inactive: false,
        };
        self.rows = self
            .engine
            .list_allocations(&query)
            .await
            .into_iter()
            .map(|a| (a.id, a))
            .collect();
        self.stale = false;
        self.resyncs += 1;
        debug!(rows = self.rows.len(), "allocation cache resynced");
    }

    /// Fold one event into the cache. Applying the same event twice leaves
    /// the cache unchanged. Returns whether any row changed.
    pub fn apply(&mut self, event: &ChangeEvent) -> bool {
        match event {
            ChangeEvent::AllocationCreated { allocation, .. }
            | ChangeEvent::AllocationUpdated { allocation, .. } => self.upsert(allocation),
            ChangeEvent::AllocationDeleted {
                allocation_id,
                cascaded,
                ..
            } => {
                let mut changed = self.rows.remove(allocation_id).is_some();
                for id in cascaded {
                    changed |= self.rows.remove(id).is_some();
                }
                changed
            }
            ChangeEvent::ConflictDetected { .. } | ChangeEvent::BulkProgress { .. } => false,
        }
    }

    fn upsert(&mut self, allocation: &Allocation) -> bool {
        let filter = self.filter();
        let in_view = allocation.is_active
            && filter.employee_id.is_none_or(|e| e == allocation.employee_id)
            && filter.project_id.is_none_or(|p| p == allocation.project_id);
        if !in_view {
            return self.rows.remove(&allocation.id).is_some();
        }
        if let Some(cached) = self.rows.get(&allocation.id)
            && (cached.updated_at > allocation.updated_at || cached == allocation)
        {
            return false;
        }
        self.rows.insert(allocation.id, allocation.clone());
        true
    }

    /// Wait for the next change and apply it. On lag the cache resyncs and
    /// keeps waiting. `None` once the hub is gone.
    pub async fn next(&mut self) -> Option<ChangeEvent> {
        loop {
            match self.subscription.recv().await {
                Ok(event) => {
                    self.apply(&event);
                    return Some(event);
                }
                Err(RecvError::Lagged(missed)) => {
                    warn!(missed, "allocation cache lagged, resyncing");
                    self.stale = true;
                    self.resync().await;
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    pub fn get(&self, id: &Ulid) -> Option<&Allocation> {
        self.rows.get(id)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn is_stale(&self) -> bool {
        self.stale
    }

    /// Resyncs forced by lag since the cache was opened.
    pub fn resyncs(&self) -> u64 {
        self.resyncs
    }

    /// Cached rows ordered the way `Engine::list_allocations` returns them.
    pub fn allocations(&self) -> Vec<Allocation> {
        let mut out: Vec<Allocation> = self.rows.values().cloned().collect();
        out.sort_by(|a, b| {
            (a.employee_id, a.range.start, a.id).cmp(&(b.employee_id, b.range.start, b.id))
        });
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{BulkOptions, NoopObserver};
    use crate::model::*;
    use crate::notify::NotifyHub;
    use std::path::PathBuf;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("allocd_test_view");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    async fn setup(name: &str) -> (Arc<Engine>, Ulid, Ulid) {
        let engine = Arc::new(Engine::new(test_wal_path(name), Arc::new(NotifyHub::new())).unwrap());
        let (employee, project) = (Ulid::new(), Ulid::new());
        engine.upsert_employee(employee, 40.0, true).await.unwrap();
        engine.upsert_project(project, Some("Apollo".into()), true).await.unwrap();
        (engine, employee, project)
    }

    fn input(employee: Ulid, project: Ulid, start: &str, end: &str, hours: f64) -> OperationRequest {
        OperationRequest::Create(AllocationInput {
            employee_id: employee.to_string(),
            project_id: project.to_string(),
            start_date: start.into(),
            end_date: end.into(),
            allocated_hours: hours,
            role: None,
            status: None,
        })
    }

    #[tokio::test]
    async fn snapshot_then_events() {
        let (engine, employee, project) = setup("view_snapshot.wal").await;
        let options = BulkOptions::default();
        engine
            .execute(&[input(employee, project, "2026-01-05", "2026-01-09", 10.0)], &options, &NoopObserver)
            .await
            .unwrap();

        let mut cache = AllocationCache::open(engine.clone(), SubscriptionFilter::default()).await;
        assert_eq!(cache.len(), 1);
        assert!(!cache.is_stale());

        let run = engine
            .execute(&[input(employee, project, "2026-02-02", "2026-02-06", 10.0)], &options, &NoopObserver)
            .await
            .unwrap();
        let created = run.result.successful[0].allocation_id;

        let event = cache.next().await.unwrap();
        assert_eq!(event.type_name(), "allocation_created");
        assert!(cache.get(&created).is_some());
        assert_eq!(cache.allocations(), engine.list_allocations(&AllocationQuery::default()).await);
    }

    #[tokio::test]
    async fn apply_is_idempotent() {
        let (engine, employee, project) = setup("view_idempotent.wal").await;
        let mut cache = AllocationCache::open(engine.clone(), SubscriptionFilter::default()).await;
        let run = engine
            .execute(
                &[input(employee, project, "2026-01-05", "2026-01-09", 10.0)],
                &BulkOptions::default(),
                &NoopObserver,
            )
            .await
            .unwrap();
        let allocation = run.result.successful[0].allocation.clone().unwrap();
        let event = ChangeEvent::AllocationCreated {
            allocation,
            timestamp: 1,
        };

        cache.next().await.unwrap();
        assert!(!cache.apply(&event));
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn soft_delete_leaves_the_view() {
        let (engine, employee, project) = setup("view_soft_delete.wal").await;
        let options = BulkOptions::default();
        let run = engine
            .execute(&[input(employee, project, "2026-01-05", "2026-01-09", 10.0)], &options, &NoopObserver)
            .await
            .unwrap();
        let id = run.result.successful[0].allocation_id;

        let mut cache = AllocationCache::open(engine.clone(), SubscriptionFilter::default()).await;
        assert_eq!(cache.len(), 1);
        engine
            .execute(&[OperationRequest::Delete { id: id.to_string() }], &options, &NoopObserver)
            .await
            .unwrap();

        let event = cache.next().await.unwrap();
        assert_eq!(event.type_name(), "allocation_deleted");
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn stale_update_is_ignored() {
        let (engine, employee, project) = setup("view_stale_update.wal").await;
        let mut cache = AllocationCache::open(engine, SubscriptionFilter::default()).await;
        let mut allocation = Allocation {
            id: Ulid::new(),
            employee_id: employee,
            project_id: project,
            range: DateRange::new("2026-01-05".parse().unwrap(), "2026-01-09".parse().unwrap()),
            allocated_hours: 10.0,
            role: None,
            status: AllocationStatus::Active,
            is_active: true,
            created_at: 10,
            updated_at: 20,
        };
        assert!(cache.apply(&ChangeEvent::AllocationCreated {
            allocation: allocation.clone(),
            timestamp: 20,
        }));

        allocation.updated_at = 15;
        allocation.allocated_hours = 5.0;
        assert!(!cache.apply(&ChangeEvent::AllocationUpdated {
            allocation,
            previous_employee_id: None,
            previous_project_id: None,
            timestamp: 15,
        }));
        assert_eq!(cache.allocations()[0].allocated_hours, 10.0);
    }

    #[tokio::test]
    async fn move_out_of_filter_removes_row() {
        let (engine, employee, project) = setup("view_move_out.wal").await;
        let other = Ulid::new();
        engine.upsert_employee(other, 40.0, true).await.unwrap();
        let options = BulkOptions::default();
        let run = engine
            .execute(&[input(employee, project, "2026-01-05", "2026-01-09", 10.0)], &options, &NoopObserver)
            .await
            .unwrap();
        let id = run.result.successful[0].allocation_id;

        let mut cache = AllocationCache::open(
            engine.clone(),
            SubscriptionFilter {
                employee_id: Some(employee),
                project_id: None,
            },
        )
        .await;
        assert_eq!(cache.len(), 1);

        let patch = AllocationPatch {
            employee_id: Some(other.to_string()),
            ..AllocationPatch::default()
        };
        engine
            .execute(
                &[OperationRequest::Update(UpdateItem {
                    id: id.to_string(),
                    updates: patch,
                })],
                &options,
                &NoopObserver,
            )
            .await
            .unwrap();

        cache.next().await.unwrap();
        assert!(cache.is_empty());
    }
}
