//! PostgreSQL implementation of `Store`.
//!
//! Transactions lock each touched row with `SELECT ... FOR UPDATE`, so two
//! schedulers reserving on the same node serialize on the row lock and the
//! second one sees the first one's allocation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hangar_core::{
    AffinityExpression, Node, NodeMutator, Resource, ResourceId, Result, Runner, RunnerFilter,
    RunnerMutator, Store, Transaction,
};
use sqlx::{PgConnection, PgPool, Postgres};
use tracing::instrument;
use uuid::Uuid;

use crate::{DbError, DbResult};

/// Database row for nodes.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct NodeRow {
    pub id: Uuid,
    pub name: String,
    pub organisation: String,
    pub group_name: String,
    pub status: String,
    pub labels: serde_json::Value,
    pub cpu_capacity: i64,
    pub cpu_allocated: i64,
    pub cpu_overcommit: f64,
    pub ram_capacity: i64,
    pub ram_allocated: i64,
    pub ram_overcommit: f64,
    pub is_cordoned: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<NodeRow> for Node {
    type Error = DbError;

    fn try_from(row: NodeRow) -> std::result::Result<Self, Self::Error> {
        let status = row
            .status
            .parse()
            .map_err(|e: hangar_core::Error| DbError::Decode(e.to_string()))?;
        let labels = serde_json::from_value(row.labels)
            .map_err(|e| DbError::Decode(format!("node {} labels: {}", row.id, e)))?;

        Ok(Node {
            id: ResourceId::from_uuid(row.id),
            name: row.name,
            organisation: row.organisation,
            group: row.group_name,
            status,
            labels,
            cpu: Resource {
                capacity: to_u64(row.cpu_capacity, "cpu_capacity")?,
                allocated: to_u64(row.cpu_allocated, "cpu_allocated")?,
                overcommit_ratio: row.cpu_overcommit,
            },
            ram: Resource {
                capacity: to_u64(row.ram_capacity, "ram_capacity")?,
                allocated: to_u64(row.ram_allocated, "ram_allocated")?,
                overcommit_ratio: row.ram_overcommit,
            },
            is_cordoned: row.is_cordoned,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

/// Database row for runners.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct RunnerRow {
    pub id: Uuid,
    pub name: String,
    pub organisation: String,
    pub group_name: String,
    pub vcpus: i64,
    pub memory_mb: i64,
    pub affinity: serde_json::Value,
    pub node_id: Option<Uuid>,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<RunnerRow> for Runner {
    type Error = DbError;

    fn try_from(row: RunnerRow) -> std::result::Result<Self, Self::Error> {
        let status = row
            .status
            .parse()
            .map_err(|e: hangar_core::Error| DbError::Decode(e.to_string()))?;
        let affinity: Vec<AffinityExpression> = serde_json::from_value(row.affinity)
            .map_err(|e| DbError::Decode(format!("runner {} affinity: {}", row.id, e)))?;

        Ok(Runner {
            id: ResourceId::from_uuid(row.id),
            name: row.name,
            organisation: row.organisation,
            group: row.group_name,
            vcpus: to_u64(row.vcpus, "vcpus")?,
            memory_mb: to_u64(row.memory_mb, "memory_mb")?,
            affinity,
            node_id: row.node_id.map(ResourceId::from_uuid),
            status,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

fn to_u64(value: i64, column: &str) -> DbResult<u64> {
    u64::try_from(value).map_err(|_| DbError::Decode(format!("negative {}: {}", column, value)))
}

fn to_i64(value: u64, column: &str) -> DbResult<i64> {
    i64::try_from(value).map_err(|_| DbError::Decode(format!("{} out of range: {}", column, value)))
}

async fn lock_node(conn: &mut PgConnection, id: ResourceId) -> DbResult<Node> {
    sqlx::query_as::<_, NodeRow>("SELECT * FROM nodes WHERE id = $1 FOR UPDATE")
        .bind(id.as_uuid())
        .fetch_optional(conn)
        .await?
        .ok_or_else(|| DbError::NotFound(format!("node {}", id)))?
        .try_into()
}

async fn lock_runner(conn: &mut PgConnection, id: ResourceId) -> DbResult<Runner> {
    sqlx::query_as::<_, RunnerRow>("SELECT * FROM runners WHERE id = $1 FOR UPDATE")
        .bind(id.as_uuid())
        .fetch_optional(conn)
        .await?
        .ok_or_else(|| DbError::NotFound(format!("runner {}", id)))?
        .try_into()
}

async fn write_node(conn: &mut PgConnection, node: &Node) -> DbResult<()> {
    let labels = serde_json::to_value(&node.labels)
        .map_err(|e| DbError::Decode(format!("node {} labels: {}", node.id, e)))?;

    sqlx::query(
        r#"
        UPDATE nodes
        SET name = $2, organisation = $3, group_name = $4, status = $5, labels = $6,
            cpu_capacity = $7, cpu_allocated = $8, cpu_overcommit = $9,
            ram_capacity = $10, ram_allocated = $11, ram_overcommit = $12,
            is_cordoned = $13, updated_at = $14
        WHERE id = $1
        "#,
    )
    .bind(node.id.as_uuid())
    .bind(&node.name)
    .bind(&node.organisation)
    .bind(&node.group)
    .bind(node.status.to_string())
    .bind(labels)
    .bind(to_i64(node.cpu.capacity, "cpu_capacity")?)
    .bind(to_i64(node.cpu.allocated, "cpu_allocated")?)
    .bind(node.cpu.overcommit_ratio)
    .bind(to_i64(node.ram.capacity, "ram_capacity")?)
    .bind(to_i64(node.ram.allocated, "ram_allocated")?)
    .bind(node.ram.overcommit_ratio)
    .bind(node.is_cordoned)
    .bind(node.updated_at)
    .execute(conn)
    .await?;
    Ok(())
}

async fn write_runner(conn: &mut PgConnection, runner: &Runner) -> DbResult<()> {
    let affinity = serde_json::to_value(&runner.affinity)
        .map_err(|e| DbError::Decode(format!("runner {} affinity: {}", runner.id, e)))?;

    sqlx::query(
        r#"
        UPDATE runners
        SET name = $2, organisation = $3, group_name = $4, vcpus = $5, memory_mb = $6,
            affinity = $7, node_id = $8, status = $9, updated_at = NOW()
        WHERE id = $1
        "#,
    )
    .bind(runner.id.as_uuid())
    .bind(&runner.name)
    .bind(&runner.organisation)
    .bind(&runner.group)
    .bind(to_i64(runner.vcpus, "vcpus")?)
    .bind(to_i64(runner.memory_mb, "memory_mb")?)
    .bind(affinity)
    .bind(runner.node_id.map(Uuid::from))
    .bind(runner.status.to_string())
    .execute(conn)
    .await?;
    Ok(())
}

/// PostgreSQL implementation of Store.
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn begin_pg(&self) -> DbResult<PgTransaction> {
        Ok(PgTransaction {
            tx: self.pool.begin().await?,
        })
    }
}

#[async_trait]
impl Store for PgStore {
    async fn list_nodes(&self) -> Result<Vec<Node>> {
        let rows = sqlx::query_as::<_, NodeRow>("SELECT * FROM nodes ORDER BY name")
            .fetch_all(&self.pool)
            .await
            .map_err(DbError::from)?;
        let nodes = rows
            .into_iter()
            .map(Node::try_from)
            .collect::<DbResult<Vec<_>>>()?;
        Ok(nodes)
    }

    async fn list_runners(&self, filter: RunnerFilter) -> Result<Vec<Runner>> {
        let rows = sqlx::query_as::<_, RunnerRow>(
            r#"
            SELECT * FROM runners
            WHERE ($1 = FALSE OR node_id IS NULL)
            ORDER BY created_at, id
            "#,
        )
        .bind(filter.unassigned_only)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::from)?;
        let runners = rows
            .into_iter()
            .map(Runner::try_from)
            .collect::<DbResult<Vec<_>>>()?;
        Ok(runners)
    }

    async fn get_node(&self, id: ResourceId) -> Result<Node> {
        let node = sqlx::query_as::<_, NodeRow>("SELECT * FROM nodes WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(DbError::from)?
            .ok_or_else(|| DbError::NotFound(format!("node {}", id)))?;
        Ok(Node::try_from(node)?)
    }

    async fn get_runner(&self, id: ResourceId) -> Result<Runner> {
        let runner = sqlx::query_as::<_, RunnerRow>("SELECT * FROM runners WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(DbError::from)?
            .ok_or_else(|| DbError::NotFound(format!("runner {}", id)))?;
        Ok(Runner::try_from(runner)?)
    }

    async fn begin(&self) -> Result<Box<dyn Transaction>> {
        Ok(Box::new(self.begin_pg().await?))
    }

    #[instrument(skip(self))]
    async fn reserve_node_resources(
        &self,
        id: ResourceId,
        vcpus: u64,
        memory_bytes: u64,
    ) -> Result<Node> {
        let mut tx = self.begin_pg().await?;
        let node = tx
            .update_node(
                id,
                Box::new(move |n: &mut Node| n.reserve(vcpus, memory_bytes)),
            )
            .await?;
        Box::new(tx).commit().await?;
        Ok(node)
    }

    #[instrument(skip(self))]
    async fn release_node_resources(
        &self,
        id: ResourceId,
        vcpus: u64,
        memory_bytes: u64,
    ) -> Result<Node> {
        let mut tx = self.begin_pg().await?;
        let node = tx
            .update_node(
                id,
                Box::new(move |n: &mut Node| {
                    n.release(vcpus, memory_bytes);
                    Ok(())
                }),
            )
            .await?;
        Box::new(tx).commit().await?;
        Ok(node)
    }
}

/// A PostgreSQL transaction holding row locks on everything it touched.
pub struct PgTransaction {
    tx: sqlx::Transaction<'static, Postgres>,
}

#[async_trait]
impl Transaction for PgTransaction {
    async fn update_runner(&mut self, id: ResourceId, mutator: RunnerMutator) -> Result<Runner> {
        let mut runner = lock_runner(&mut self.tx, id).await?;
        mutator(&mut runner)?;
        write_runner(&mut self.tx, &runner).await?;
        Ok(runner)
    }

    async fn update_node(&mut self, id: ResourceId, mutator: NodeMutator) -> Result<Node> {
        let mut node = lock_node(&mut self.tx, id).await?;
        mutator(&mut node)?;
        write_node(&mut self.tx, &node).await?;
        Ok(node)
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.tx.commit().await.map_err(DbError::from)?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.tx.rollback().await.map_err(DbError::from)?;
        Ok(())
    }
}
