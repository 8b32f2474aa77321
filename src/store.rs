use crate::models::{Extension, ForkRank, MemberKind, RankMember, RankMode};
use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use std::collections::HashMap;
use tracing::info;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store query failed: {0}")]
    Query(#[from] sqlx::Error),
}

/// Read-only loader of extension, fork-rank and membership records. The tree
/// builder issues many point queries per request, concurrently within a
/// discovery layer.
#[async_trait]
pub trait RoutingStore: Send + Sync {
    async fn extension_by_number(&self, number: &str) -> Result<Option<Extension>, StoreError>;
    async fn extension_by_id(&self, id: i32) -> Result<Option<Extension>, StoreError>;
    /// Fork ranks of an extension in index order, each with its members in
    /// stored order.
    async fn fork_ranks_for(&self, extension_id: i32) -> Result<Vec<ForkRank>, StoreError>;
}

const EXTENSION_COLUMNS: &str = "id, number, name, short_name, yate_id, outgoing_extension, \
     outgoing_name, dialout_allowed, ringback, forwarding_delay, forwarding_extension_id, \
     lang, type, forwarding_mode";

/// Postgres-backed store gateway.
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;
        info!("connected to routing store");
        Ok(Self { pool })
    }

    pub fn with_pool(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RoutingStore for PgStore {
    async fn extension_by_number(&self, number: &str) -> Result<Option<Extension>, StoreError> {
        let query = format!("SELECT {} FROM extensions WHERE number = $1", EXTENSION_COLUMNS);
        Ok(sqlx::query_as::<_, Extension>(&query)
            .bind(number)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn extension_by_id(&self, id: i32) -> Result<Option<Extension>, StoreError> {
        let query = format!("SELECT {} FROM extensions WHERE id = $1", EXTENSION_COLUMNS);
        Ok(sqlx::query_as::<_, Extension>(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn fork_ranks_for(&self, extension_id: i32) -> Result<Vec<ForkRank>, StoreError> {
        // Left join keeps ranks without members visible in the tree.
        let rows = sqlx::query(
            "SELECT r.id, r.extension_id, r.\"index\", r.delay, r.mode, \
                    m.extension_id AS member_extension_id, m.active, m.type AS member_type \
             FROM fork_ranks r \
             LEFT JOIN fork_rank_members m ON m.fork_rank_id = r.id \
             WHERE r.extension_id = $1 \
             ORDER BY r.\"index\", m.id",
        )
        .bind(extension_id)
        .fetch_all(&self.pool)
        .await?;

        let mut ranks: Vec<ForkRank> = Vec::new();
        for row in rows {
            let rank_id: i32 = row.try_get("id")?;
            if ranks.last().map(|r| r.id) != Some(rank_id) {
                ranks.push(ForkRank {
                    id: rank_id,
                    extension_id: row.try_get("extension_id")?,
                    index: row.try_get("index")?,
                    delay: row.try_get("delay")?,
                    mode: row.try_get("mode")?,
                    members: Vec::new(),
                });
            }
            let member_id: Option<i32> = row.try_get("member_extension_id")?;
            if let (Some(extension_id), Some(rank)) = (member_id, ranks.last_mut()) {
                rank.members.push(RankMember {
                    extension_id,
                    active: row.try_get("active")?,
                    kind: row.try_get("member_type")?,
                });
            }
        }
        Ok(ranks)
    }
}

/// In-process store used by tests and single-host fixtures.
#[derive(Default)]
pub struct MemoryStore {
    by_id: HashMap<i32, Extension>,
    by_number: HashMap<String, i32>,
    ranks: HashMap<i32, Vec<ForkRank>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, extension: Extension) {
        self.by_number.insert(extension.number.clone(), extension.id);
        self.by_id.insert(extension.id, extension);
    }

    /// Register a fork rank for an extension; members ring in the given
    /// order, ranks in insertion order.
    pub fn insert_rank(
        &mut self,
        extension_id: i32,
        mode: RankMode,
        delay: Option<i32>,
        members: Vec<RankMember>,
    ) {
        let ranks = self.ranks.entry(extension_id).or_default();
        let index = ranks.len() as i32;
        ranks.push(ForkRank {
            id: extension_id * 100 + index,
            extension_id,
            index,
            delay,
            mode,
            members,
        });
    }
}

pub fn member(extension_id: i32, active: bool) -> RankMember {
    RankMember {
        extension_id,
        active,
        kind: MemberKind::Default,
    }
}

#[async_trait]
impl RoutingStore for MemoryStore {
    async fn extension_by_number(&self, number: &str) -> Result<Option<Extension>, StoreError> {
        Ok(self
            .by_number
            .get(number)
            .and_then(|id| self.by_id.get(id))
            .cloned())
    }

    async fn extension_by_id(&self, id: i32) -> Result<Option<Extension>, StoreError> {
        Ok(self.by_id.get(&id).cloned())
    }

    async fn fork_ranks_for(&self, extension_id: i32) -> Result<Vec<ForkRank>, StoreError> {
        Ok(self.ranks.get(&extension_id).cloned().unwrap_or_default())
    }
}
