// [[CONDUIT]]/apps/kernel-server/src/task_store.rs
// Purpose: Durable task/run records with compare-and-set terminal transitions.
// Architecture: Persistence Layer
// Dependencies: DashMap, Redis, Chrono

use async_trait::async_trait;
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

use crate::error::{KernelError, KernelResult};
use crate::models::{Retention, TaskRecord, Transition};

#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Inserts a fresh record; fails with `Duplicate` if the id is taken.
    async fn create(&self, record: TaskRecord) -> KernelResult<()>;

    async fn get(&self, task_id: &str) -> KernelResult<TaskRecord>;

    /// Applies `transition` atomically. Records already terminal are left untouched.
    async fn transition(&self, task_id: &str, transition: Transition) -> KernelResult<TaskRecord>;

    /// Ids of records that were pending or running when last written.
    async fn active_ids(&self) -> KernelResult<Vec<String>>;

    /// Drops expired terminal records. Returns how many were removed.
    async fn purge_expired(&self) -> KernelResult<usize>;

    async fn mark_running(&self, task_id: &str) -> KernelResult<TaskRecord> {
        self.transition(task_id, Transition::Running).await
    }

    async fn mark_completed(
        &self,
        task_id: &str,
        exit_status: &str,
        submission: &str,
    ) -> KernelResult<TaskRecord> {
        self.transition(
            task_id,
            Transition::Completed {
                exit_status: exit_status.to_string(),
                submission: submission.to_string(),
            },
        )
        .await
    }

    async fn mark_failed(&self, task_id: &str, error: &str) -> KernelResult<TaskRecord> {
        self.transition(task_id, Transition::Failed { error: error.to_string() }).await
    }

    async fn mark_cancelled(&self, task_id: &str, reason: &str) -> KernelResult<TaskRecord> {
        self.transition(task_id, Transition::Cancelled { reason: reason.to_string() }).await
    }
}

// === IN-MEMORY STORE ===

pub struct MemoryTaskStore {
    tasks: DashMap<String, TaskRecord>,
    retention: Retention,
}

impl MemoryTaskStore {
    pub fn new(retention: Retention) -> Self {
        Self {
            tasks: DashMap::new(),
            retention,
        }
    }
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn create(&self, record: TaskRecord) -> KernelResult<()> {
        match self.tasks.entry(record.task_id.clone()) {
            Entry::Occupied(_) => Err(KernelError::Duplicate {
                kind: "task",
                id: record.task_id,
            }),
            Entry::Vacant(slot) => {
                slot.insert(record);
                Ok(())
            }
        }
    }

    async fn get(&self, task_id: &str) -> KernelResult<TaskRecord> {
        self.tasks
            .get(task_id)
            .filter(|r| !r.is_expired(Utc::now()))
            .map(|r| r.clone())
            .ok_or_else(|| KernelError::task_not_found(task_id))
    }

    async fn transition(&self, task_id: &str, transition: Transition) -> KernelResult<TaskRecord> {
        let now = Utc::now();
        // get_mut holds the shard write lock: check-and-set happens under it.
        let mut record = self
            .tasks
            .get_mut(task_id)
            .filter(|r| !r.is_expired(now))
            .ok_or_else(|| KernelError::task_not_found(task_id))?;
        record.apply(&transition, now, &self.retention)?;
        Ok(record.clone())
    }

    async fn active_ids(&self) -> KernelResult<Vec<String>> {
        Ok(self
            .tasks
            .iter()
            .filter(|r| !r.status.is_terminal())
            .map(|r| r.task_id.clone())
            .collect())
    }

    async fn purge_expired(&self) -> KernelResult<usize> {
        let now = Utc::now();
        let before = self.tasks.len();
        self.tasks.retain(|_, r| !r.is_expired(now));
        Ok(before - self.tasks.len())
    }
}

// === REDIS STORE ===

const ACTIVE_SET_KEY: &str = "sys:active_tasks";

// KEYS[1] record, KEYS[2] active set
// ARGV[1] status the caller read, ARGV[2] new record JSON, ARGV[3] ttl secs (0 = none),
// ARGV[4] task id, ARGV[5] "1" if the new status is terminal.
// Returns -1 missing, 0 lost the race, 1 written.
const CAS_SCRIPT: &str = r#"
local cur = redis.call('GET', KEYS[1])
if not cur then return -1 end
local rec = cjson.decode(cur)
if rec['status'] ~= ARGV[1] then return 0 end
redis.call('SET', KEYS[1], ARGV[2])
local ttl = tonumber(ARGV[3])
if ttl > 0 then redis.call('EXPIRE', KEYS[1], ttl) end
if ARGV[5] == '1' then
  redis.call('SREM', KEYS[2], ARGV[4])
else
  redis.call('SADD', KEYS[2], ARGV[4])
end
return 1
"#;

const CAS_ATTEMPTS: usize = 5;

pub struct RedisTaskStore {
    conn: ConnectionManager,
    retention: Retention,
    cas_script: redis::Script,
}

impl RedisTaskStore {
    pub fn new(conn: ConnectionManager, retention: Retention) -> Self {
        Self {
            conn,
            retention,
            cas_script: redis::Script::new(CAS_SCRIPT),
        }
    }

    fn task_key(task_id: &str) -> String {
        format!("task:{}", task_id)
    }
}

#[async_trait]
impl TaskStore for RedisTaskStore {
    async fn create(&self, record: TaskRecord) -> KernelResult<()> {
        let json = serde_json::to_string(&record)?;
        let mut con = self.conn.clone();

        let created: bool = con.set_nx(Self::task_key(&record.task_id), json).await?;
        if !created {
            return Err(KernelError::Duplicate {
                kind: "task",
                id: record.task_id,
            });
        }
        con.sadd::<_, _, ()>(ACTIVE_SET_KEY, &record.task_id).await?;
        Ok(())
    }

    async fn get(&self, task_id: &str) -> KernelResult<TaskRecord> {
        let mut con = self.conn.clone();
        let json: Option<String> = con.get(Self::task_key(task_id)).await?;
        match json {
            Some(json) => Ok(serde_json::from_str(&json)?),
            None => Err(KernelError::task_not_found(task_id)),
        }
    }

    async fn transition(&self, task_id: &str, transition: Transition) -> KernelResult<TaskRecord> {
        let key = Self::task_key(task_id);

        for _ in 0..CAS_ATTEMPTS {
            let mut record = self.get(task_id).await?;
            let read_status = record.status;
            let now = Utc::now();
            record.apply(&transition, now, &self.retention)?;

            if record.status == read_status {
                // Running -> Running is a no-op; nothing to write.
                return Ok(record);
            }

            let ttl = record.ttl_secs(now).unwrap_or(0);
            let terminal = if record.status.is_terminal() { "1" } else { "0" };
            let mut con = self.conn.clone();
            let outcome: i64 = self
                .cas_script
                .key(&key)
                .key(ACTIVE_SET_KEY)
                .arg(read_status.as_str())
                .arg(serde_json::to_string(&record)?)
                .arg(ttl)
                .arg(task_id)
                .arg(terminal)
                .invoke_async(&mut con)
                .await?;

            match outcome {
                1 => return Ok(record),
                -1 => return Err(KernelError::task_not_found(task_id)),
                _ => {
                    tracing::debug!("Lost status race on task {}, re-reading", task_id);
                }
            }
        }

        Err(KernelError::Storage(format!(
            "task {} changed concurrently {} times in a row",
            task_id, CAS_ATTEMPTS
        )))
    }

    async fn active_ids(&self) -> KernelResult<Vec<String>> {
        let mut con = self.conn.clone();
        Ok(con.smembers(ACTIVE_SET_KEY).await?)
    }

    async fn purge_expired(&self) -> KernelResult<usize> {
        // Redis expires records on its own (EXPIRE set on terminal write).
        Ok(0)
    }
}
