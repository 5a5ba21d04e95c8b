//! A [`skald_core::TaskRepository`] adapter over the `tasks` document
//! collection: unique index on `id`, compound index on
//! `(executor, lifecycleStatus)` for the monitor/dispatcher queries.

use async_trait::async_trait;
use mongodb::bson::{doc, Bson};
use mongodb::options::IndexOptions;
use mongodb::{Client, Collection, IndexModel};
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use skald_core::{
    AssignmentOrder, ErrorKind, LifecycleStatus, SkaldConfig, SkaldError, Task, TaskMode, TaskRepository,
};

const COLLECTION: &str = "tasks";

pub struct MongoTaskRepository {
    collection: Collection<TaskDoc>,
    config: SkaldConfig,
}

impl MongoTaskRepository {
    pub async fn connect(uri: &str, database: &str, config: &SkaldConfig) -> Result<Self, SkaldError> {
        let client = Client::with_uri_str(uri)
            .await
            .map_err(|err| SkaldError::new(ErrorKind::FatalResourceLoss, err))?;
        let collection = client.database(database).collection::<TaskDoc>(COLLECTION);
        let repo = Self {
            collection,
            config: config.clone(),
        };
        repo.ensure_indexes().await?;
        Ok(repo)
    }

    /// Create the unique `id` index and the compound `(executor,
    /// lifecycleStatus)` index named below. Idempotent: creating an index
    /// that already exists with the same spec is a no-op.
    async fn ensure_indexes(&self) -> Result<(), SkaldError> {
        let id_index = IndexModel::builder()
            .keys(doc! { "id": 1 })
            .options(IndexOptions::builder().unique(true).build())
            .build();
        let executor_status_index = IndexModel::builder()
            .keys(doc! { "executor": 1, "lifecycleStatus": 1 })
            .build();

        self.collection
            .create_indexes(vec![id_index, executor_status_index])
            .await
            .map_err(transient)?;
        Ok(())
    }
}

fn transient(err: mongodb::error::Error) -> SkaldError {
    SkaldError::new(ErrorKind::TransientIo, err)
}

/// The BSON document shape stored in `tasks`, with timestamps kept as raw
/// milliseconds-since-epoch and the opaque attachment blob kept as the
/// JSON text itself rather than decoded into BSON, so it round-trips
/// byte-identically regardless of what shape a worker class gives it.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct TaskDoc {
    id: String,
    #[serde(rename = "className")]
    class_name: String,
    source: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    executor: Option<String>,
    mode: TaskMode,
    #[serde(rename = "createDateTime")]
    create_date_time: i64,
    #[serde(rename = "updateDateTime")]
    update_date_time: i64,
    #[serde(rename = "deadlineDateTime")]
    deadline_date_time: Option<i64>,
    #[serde(rename = "lifecycleStatus")]
    lifecycle_status: LifecycleStatus,
    priority: i32,
    attachments: String,
}

impl TaskDoc {
    fn from_task(task: &Task) -> Self {
        Self {
            id: task.id.clone(),
            class_name: task.class_name.clone(),
            source: task.source.clone(),
            name: task.name.clone(),
            description: task.description.clone(),
            executor: task.executor.clone(),
            mode: task.mode,
            create_date_time: task.create_date_time.timestamp_millis(),
            update_date_time: task.update_date_time.timestamp_millis(),
            deadline_date_time: task.deadline_date_time.map(|t| t.timestamp_millis()),
            lifecycle_status: task.lifecycle_status,
            priority: task.priority as i32,
            attachments: task.attachments.get().to_string(),
        }
    }

    fn into_task(self) -> Result<Task, SkaldError> {
        Ok(Task {
            id: self.id,
            class_name: self.class_name,
            source: self.source,
            name: self.name,
            description: self.description,
            executor: self.executor,
            mode: self.mode,
            create_date_time: millis_to_datetime(self.create_date_time),
            update_date_time: millis_to_datetime(self.update_date_time),
            deadline_date_time: self.deadline_date_time.map(millis_to_datetime),
            lifecycle_status: self.lifecycle_status,
            priority: self.priority as u8,
            attachments: RawValue::from_string(self.attachments).map_err(SkaldError::malformed)?,
        })
    }
}

fn millis_to_datetime(millis: i64) -> chrono::DateTime<chrono::Utc> {
    chrono::DateTime::from_timestamp_millis(millis).unwrap_or_default()
}

fn status_bson(status: LifecycleStatus) -> Bson {
    Bson::String(format!("{status:?}"))
}

#[async_trait]
impl TaskRepository for MongoTaskRepository {
    async fn find_by_id(&self, id: &str) -> Result<Option<Task>, SkaldError> {
        let doc = skald_core::retry(&self.config, || async {
            self.collection.find_one(doc! { "id": id }).await.map_err(transient)
        })
        .await?;
        doc.map(TaskDoc::into_task).transpose()
    }

    async fn insert(&self, task: Task) -> Result<(), SkaldError> {
        let doc = TaskDoc::from_task(&task);
        skald_core::retry(&self.config, || async {
            self.collection.insert_one(doc.clone()).await.map_err(transient)
        })
        .await?;
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<(), SkaldError> {
        skald_core::retry(&self.config, || async {
            self.collection.delete_one(doc! { "id": id }).await.map_err(transient)
        })
        .await?;
        Ok(())
    }

    async fn find_by_status(&self, statuses: &[LifecycleStatus]) -> Result<Vec<Task>, SkaldError> {
        use futures_util::TryStreamExt;

        let values: Vec<Bson> = statuses.iter().copied().map(status_bson).collect();
        let docs: Vec<TaskDoc> = skald_core::retry(&self.config, || async {
            let mut cursor = self
                .collection
                .find(doc! { "lifecycleStatus": { "$in": values.clone() } })
                .await
                .map_err(transient)?;

            let mut docs = Vec::new();
            while let Some(doc) = cursor.try_next().await.map_err(transient)? {
                docs.push(doc);
            }
            Ok(docs)
        })
        .await?;

        docs.into_iter().map(TaskDoc::into_task).collect()
    }

    async fn find_unassigned_passive(&self, _order: AssignmentOrder) -> Result<Vec<Task>, SkaldError> {
        use futures_util::TryStreamExt;

        let docs: Vec<TaskDoc> = skald_core::retry(&self.config, || async {
            let filter = doc! {
                "executor": Bson::Null,
                "lifecycleStatus": status_bson(LifecycleStatus::Created),
                "mode": "passive",
            };

            let mut cursor = self
                .collection
                .find(filter)
                .sort(doc! { "priority": -1, "createDateTime": 1 })
                .await
                .map_err(transient)?;
            let mut docs = Vec::new();
            while let Some(doc) = cursor.try_next().await.map_err(transient)? {
                docs.push(doc);
            }
            Ok(docs)
        })
        .await?;

        docs.into_iter().map(TaskDoc::into_task).collect()
    }

    async fn update_status_if(
        &self,
        id: &str,
        expected: LifecycleStatus,
        new: LifecycleStatus,
    ) -> Result<bool, SkaldError> {
        skald_core::retry(&self.config, || async {
            let now_ms = skald_core::now_ms();
            let result = self
                .collection
                .update_one(
                    doc! { "id": id, "lifecycleStatus": status_bson(expected) },
                    doc! { "$set": { "lifecycleStatus": status_bson(new), "updateDateTime": now_ms } },
                )
                .await
                .map_err(transient)?;
            Ok(result.modified_count > 0)
        })
        .await
    }

    async fn set_executor(
        &self,
        id: &str,
        executor: &str,
        expected: LifecycleStatus,
        new: LifecycleStatus,
    ) -> Result<bool, SkaldError> {
        skald_core::retry(&self.config, || async {
            let now_ms = skald_core::now_ms();
            let result = self
                .collection
                .update_one(
                    doc! { "id": id, "lifecycleStatus": status_bson(expected) },
                    doc! {
                        "$set": {
                            "executor": executor,
                            "lifecycleStatus": status_bson(new),
                            "updateDateTime": now_ms,
                        }
                    },
                )
                .await
                .map_err(transient)?;
            Ok(result.modified_count > 0)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    //! Requires a local mongod instance; skipped unless `SKALD_TEST_MONGO_URL`
    //! is set.
    use super::*;

    #[tokio::test]
    #[ignore = "requires a live mongod instance"]
    async fn behaves_like_a_task_repository() {
        let uri = std::env::var("SKALD_TEST_MONGO_URL").expect("SKALD_TEST_MONGO_URL not set");
        let repo = MongoTaskRepository::connect(&uri, "skalds_test", &SkaldConfig::default())
            .await
            .unwrap();
        skald_core::db::asserts::behaves_like_a_task_repository(&repo).await;
    }
}
