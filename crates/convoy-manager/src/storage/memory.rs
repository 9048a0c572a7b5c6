//! In-memory storage backend.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;

use convoy_model::{LogRecord, Order, OrderId, Target, TargetId};

use super::{LogFilter, LogSortField, MatchedTargets, Storage, StorageError, StorageResult};

/// In-memory storage. Data is lost when the process exits.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    orders: RwLock<HashMap<String, Order>>,
    targets: RwLock<HashMap<String, Target>>,
    logs: RwLock<Vec<LogRecord>>,
}

impl MemoryStorage {
    /// Create a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned() -> StorageError {
    StorageError::internal("lock poisoned")
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn add_order(&self, order: &Order) -> StorageResult<()> {
        let mut orders = self.orders.write().map_err(|_| poisoned())?;
        orders.insert(order.header.id.as_str().to_owned(), order.clone());
        Ok(())
    }

    async fn get_order(&self, id: &OrderId) -> StorageResult<Option<Order>> {
        let orders = self.orders.read().map_err(|_| poisoned())?;
        Ok(orders.get(id.as_str()).cloned())
    }

    async fn get_orders(&self, offset: usize, limit: usize) -> StorageResult<(Vec<Order>, usize)> {
        let orders = self.orders.read().map_err(|_| poisoned())?;

        let mut all: Vec<_> = orders.values().cloned().collect();
        all.sort_by(|a, b| b.header.created.cmp(&a.header.created));

        let total = all.len();
        let page = all.into_iter().skip(offset).take(limit).collect();
        Ok((page, total))
    }

    async fn add_target(&self, target: &Target) -> StorageResult<()> {
        let mut targets = self.targets.write().map_err(|_| poisoned())?;
        targets.insert(target.id.as_str().to_owned(), target.clone());
        Ok(())
    }

    async fn patch_target(&self, id: &TargetId, target: &Target) -> StorageResult<bool> {
        let mut targets = self.targets.write().map_err(|_| poisoned())?;
        match targets.get_mut(id.as_str()) {
            Some(existing) => {
                *existing = target.clone();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn get_target(&self, id: &TargetId) -> StorageResult<Option<Target>> {
        let targets = self.targets.read().map_err(|_| poisoned())?;
        Ok(targets.get(id.as_str()).cloned())
    }

    async fn get_targets(
        &self,
        tags: &[String],
        offset: usize,
        limit: usize,
    ) -> StorageResult<(Vec<Target>, usize)> {
        let targets = self.targets.read().map_err(|_| poisoned())?;

        let mut matched: Vec<_> = targets
            .values()
            .filter(|t| tags.is_empty() || tags.iter().any(|tag| t.has_tag(tag)))
            .cloned()
            .collect();
        matched.sort_by(|a, b| a.id.as_str().cmp(b.id.as_str()));

        let total = matched.len();
        let page = matched.into_iter().skip(offset).take(limit).collect();
        Ok((page, total))
    }

    async fn match_targets(
        &self,
        ids: &[TargetId],
        tags: &[String],
    ) -> StorageResult<MatchedTargets> {
        let targets = self.targets.read().map_err(|_| poisoned())?;

        let mut matched = MatchedTargets::default();

        for id in ids {
            if targets.contains_key(id.as_str()) {
                matched.hit_ids.push(id.clone());
            }
        }
        for tag in tags {
            if targets.values().any(|t| t.has_tag(tag)) {
                matched.hit_tags.push(tag.clone());
            }
        }

        let mut receivers: Vec<_> = targets
            .values()
            .filter(|t| {
                ids.iter().any(|id| id == &t.id) || tags.iter().any(|tag| t.has_tag(tag))
            })
            .cloned()
            .collect();
        receivers.sort_by(|a, b| a.id.as_str().cmp(b.id.as_str()));
        matched.receivers = receivers;

        Ok(matched)
    }

    async fn add_logs(&self, records: &[LogRecord]) -> StorageResult<()> {
        let mut logs = self.logs.write().map_err(|_| poisoned())?;
        logs.extend_from_slice(records);
        Ok(())
    }

    async fn get_logs(&self, filter: &LogFilter) -> StorageResult<(Vec<LogRecord>, usize)> {
        let logs = self.logs.read().map_err(|_| poisoned())?;

        let mut matched: Vec<_> = logs
            .iter()
            .filter(|log| {
                if let Some(ref target) = filter.target {
                    if &log.target != target {
                        return false;
                    }
                }
                if let Some(ref task) = filter.task {
                    if &log.task != task {
                        return false;
                    }
                }
                if let Some(stage) = filter.stage {
                    if log.stage != stage {
                        return false;
                    }
                }
                if let Some(ref command) = filter.command {
                    if &log.command != command {
                        return false;
                    }
                }
                true
            })
            .cloned()
            .collect();

        matched.sort_by(|a, b| {
            let ordering = match filter.sort {
                LogSortField::Time => a.time.cmp(&b.time),
                LogSortField::Target => a.target.as_str().cmp(b.target.as_str()),
                LogSortField::Task => a.task.as_str().cmp(b.task.as_str()),
            };
            if filter.ascending {
                ordering
            } else {
                ordering.reverse()
            }
        });

        let total = matched.len();
        let page: Vec<_> = matched.into_iter().skip(filter.offset).collect();
        let page = match filter.limit {
            Some(limit) => page.into_iter().take(limit).collect(),
            None => page,
        };
        Ok((page, total))
    }

    async fn search_logs(&self, query: &str) -> StorageResult<(Vec<LogRecord>, usize)> {
        let logs = self.logs.read().map_err(|_| poisoned())?;

        let mut matched: Vec<_> = logs
            .iter()
            .filter(|log| log.output.contains(query))
            .cloned()
            .collect();
        matched.sort_by(|a, b| match a.time.cmp(&b.time) {
            Ordering::Equal => a.task.as_str().cmp(b.task.as_str()),
            other => other,
        });

        let total = matched.len();
        Ok((matched, total))
    }

    async fn delivered_task(&self, target: &TargetId, task: &OrderId) -> StorageResult<bool> {
        let logs = self.logs.read().map_err(|_| poisoned())?;
        Ok(logs
            .iter()
            .any(|log| &log.target == target && &log.task == task))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use convoy_model::{Header, Stage, UnixTime};

    fn order(id: &str, created: i64) -> Order {
        Order {
            header: Header {
                id: OrderId::new(id),
                debug: false,
                created: UnixTime::from_secs(created),
            },
            build: None,
            deploy: Some(convoy_model::Deploy::default()),
        }
    }

    fn target(id: &str, tags: &[&str]) -> Target {
        Target::new(
            TargetId::new(id),
            tags.iter().map(|t| (*t).to_owned()).collect(),
        )
    }

    fn log(task: &str, target: &str, output: &str, time: i64) -> LogRecord {
        LogRecord {
            task: OrderId::new(task),
            target: TargetId::new(target),
            stage: Stage::Install,
            command: "cmd".to_owned(),
            output: output.to_owned(),
            error: false,
            time: UnixTime::from_secs(time),
            debug: false,
        }
    }

    #[tokio::test]
    async fn orders_are_upserted() {
        let store = MemoryStorage::new();
        let mut o = order("o1", 10);
        store.add_order(&o).await.expect("add");

        o.build = None;
        store.add_order(&o).await.expect("replace");

        let got = store
            .get_order(&OrderId::new("o1"))
            .await
            .expect("get")
            .expect("present");
        assert!(got.build.is_none());

        let (page, total) = store.get_orders(0, 10).await.expect("list");
        assert_eq!(total, 1);
        assert_eq!(page.len(), 1);
    }

    #[tokio::test]
    async fn orders_list_newest_first() {
        let store = MemoryStorage::new();
        store.add_order(&order("old", 10)).await.expect("add");
        store.add_order(&order("new", 20)).await.expect("add");

        let (page, total) = store.get_orders(0, 1).await.expect("list");
        assert_eq!(total, 2);
        assert_eq!(page[0].header.id.as_str(), "new");
    }

    #[tokio::test]
    async fn patch_requires_existing_target() {
        let store = MemoryStorage::new();
        let t = target("t1", &["edge"]);

        assert!(!store
            .patch_target(&t.id, &t)
            .await
            .expect("patch missing"));

        store.add_target(&t).await.expect("add");
        let mut updated = t.clone();
        updated.tags = vec!["eu".to_owned()];
        assert!(store.patch_target(&t.id, &updated).await.expect("patch"));

        let got = store
            .get_target(&t.id)
            .await
            .expect("get")
            .expect("present");
        assert_eq!(got.tags, vec!["eu".to_owned()]);
    }

    #[tokio::test]
    async fn match_targets_by_id_and_tag() {
        let store = MemoryStorage::new();
        store.add_target(&target("t1", &["edge"])).await.expect("add");
        store.add_target(&target("t2", &["edge", "eu"])).await.expect("add");
        store.add_target(&target("t3", &[])).await.expect("add");

        let matched = store
            .match_targets(&[TargetId::new("t3")], &["edge".to_owned()])
            .await
            .expect("match");

        assert_eq!(matched.receivers.len(), 3);
        assert_eq!(matched.hit_ids, vec![TargetId::new("t3")]);
        assert_eq!(matched.hit_tags, vec!["edge".to_owned()]);
    }

    #[tokio::test]
    async fn match_targets_misses_return_empty() {
        let store = MemoryStorage::new();
        store.add_target(&target("t1", &["edge"])).await.expect("add");

        let matched = store
            .match_targets(&[TargetId::new("ghost")], &["none".to_owned()])
            .await
            .expect("match");

        assert!(matched.receivers.is_empty());
        assert!(matched.hit_ids.is_empty());
        assert!(matched.hit_tags.is_empty());
    }

    #[tokio::test]
    async fn get_targets_filters_by_tag() {
        let store = MemoryStorage::new();
        store.add_target(&target("t1", &["edge"])).await.expect("add");
        store.add_target(&target("t2", &["core"])).await.expect("add");

        let (page, total) = store
            .get_targets(&["edge".to_owned()], 0, 10)
            .await
            .expect("list");
        assert_eq!(total, 1);
        assert_eq!(page[0].id.as_str(), "t1");

        let (_, total) = store.get_targets(&[], 0, 10).await.expect("list all");
        assert_eq!(total, 2);
    }

    #[tokio::test]
    async fn log_filtering_and_sorting() {
        let store = MemoryStorage::new();
        store
            .add_logs(&[
                log("o1", "t1", "a", 3),
                log("o1", "t2", "b", 1),
                log("o2", "t1", "c", 2),
            ])
            .await
            .expect("add");

        let (page, total) = store
            .get_logs(
                &LogFilter::new()
                    .with_task(OrderId::new("o1"))
                    .sorted(LogSortField::Time, true),
            )
            .await
            .expect("get");
        assert_eq!(total, 2);
        assert_eq!(page[0].output, "b");
        assert_eq!(page[1].output, "a");

        let (page, _) = store
            .get_logs(&LogFilter::new().sorted(LogSortField::Time, false).with_limit(1))
            .await
            .expect("get");
        assert_eq!(page[0].output, "a");
    }

    #[tokio::test]
    async fn search_matches_output_substrings() {
        let store = MemoryStorage::new();
        store
            .add_logs(&[
                log("o1", "t1", "compiling unit", 1),
                log("o1", "t1", "link complete", 2),
            ])
            .await
            .expect("add");

        let (matches, total) = store.search_logs("compil").await.expect("search");
        assert_eq!(total, 1);
        assert_eq!(matches[0].output, "compiling unit");
    }

    #[tokio::test]
    async fn delivered_task_is_monotonic() {
        let store = MemoryStorage::new();
        let target_id = TargetId::new("t1");
        let task_id = OrderId::new("o1");

        assert!(!store
            .delivered_task(&target_id, &task_id)
            .await
            .expect("probe"));

        store
            .add_logs(&[log("o1", "t1", "anything", 1)])
            .await
            .expect("add");

        assert!(store
            .delivered_task(&target_id, &task_id)
            .await
            .expect("probe"));

        // More logs never flip it back.
        store
            .add_logs(&[log("o1", "t1", "more", 2)])
            .await
            .expect("add");
        assert!(store
            .delivered_task(&target_id, &task_id)
            .await
            .expect("probe"));
    }
}
