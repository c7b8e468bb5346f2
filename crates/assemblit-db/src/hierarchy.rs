//! Ownership hierarchy across databases and cascading deletion.
//!
//! Each tier lives in its own database and is keyed by a query-index column.
//! A tier's database also holds the edges `(own key, child key)` to the next
//! tier. Deleting keys at one tier deletes every descendant no surviving
//! parent still references.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;
use sqlx::{Sqlite, Transaction};
use tracing::{debug, info, instrument, warn};

use crate::{
    coerce::{serialize, Value},
    config::parse_db_name,
    error::{StoreError, StoreResult},
    filter::{DeleteTarget, Filter},
    handler::{delete_rows_on, drop_table_on, Handler},
    registry::StoreRegistry,
    schema::tables,
};

pub const USERS_LEVEL: usize = 0;
pub const SESSIONS_LEVEL: usize = 1;
pub const DATASETS_LEVEL: usize = 2;

/// One level of the hierarchy.
#[derive(Clone, Debug)]
pub struct Tier {
    pub handler: Handler,
    pub query_index: String,
    /// Table holding one row per key of this tier.
    pub metadata_table: String,
    /// Every key owns a table of raw rows named after the key itself.
    pub materialized: bool,
}

impl Tier {
    pub fn new(
        handler: Handler,
        query_index: impl Into<String>,
        metadata_table: impl Into<String>,
    ) -> Self {
        Self {
            handler,
            query_index: query_index.into(),
            metadata_table: metadata_table.into(),
            materialized: false,
        }
    }

    pub fn materialized(mut self) -> Self {
        self.materialized = true;
        self
    }
}

/// Tiers ordered from the root (users) down to the leaves (datasets).
#[derive(Clone, Debug)]
pub struct Hierarchy {
    tiers: Vec<Tier>,
}

/// Work for one database, computed before anything is deleted.
#[derive(Clone, Debug, Serialize)]
pub struct CascadeStep {
    pub level: usize,
    pub database: String,
    pub query_index: String,
    pub keys: Vec<Value>,
    pub deletes: Vec<DeleteTarget>,
    pub drop_tables: Vec<String>,
    /// Removes edges in the parent tier rather than the keys' own records.
    pub unlink: bool,
}

/// Top-down list of steps; executed in reverse.
#[derive(Clone, Debug, Default, Serialize)]
pub struct CascadePlan {
    pub steps: Vec<CascadeStep>,
}

impl CascadePlan {
    pub fn is_empty(&self) -> bool {
        self.steps
            .iter()
            .all(|step| step.deletes.is_empty() && step.drop_tables.is_empty())
    }

    /// Keys removed at `level`, not counting unlinked edges.
    pub fn keys_at(&self, level: usize) -> Vec<Value> {
        self.steps
            .iter()
            .filter(|step| step.level == level && !step.unlink)
            .flat_map(|step| step.keys.iter().cloned())
            .collect()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CascadeOutcome {
    pub rows_deleted: u64,
    pub tables_dropped: Vec<String>,
}

impl Hierarchy {
    pub fn new(tiers: Vec<Tier>) -> Self {
        Self { tiers }
    }

    /// Users → sessions → datasets, as named by the registry's configuration.
    pub async fn open(registry: &StoreRegistry) -> StoreResult<Self> {
        let config = registry.config().clone();
        let users = registry.handler(&config.users.db_name).await?;
        let sessions = registry.handler(&config.sessions.db_name).await?;
        let data = registry.handler(&config.data.db_name).await?;

        Ok(Self::new(vec![
            Tier::new(users, config.users.query_index, tables::CREDENTIALS),
            Tier::new(sessions, config.sessions.query_index, tables::SESSIONS),
            Tier::new(data, config.data.query_index, tables::DATASETS).materialized(),
        ]))
    }

    pub fn tiers(&self) -> &[Tier] {
        &self.tiers
    }

    pub fn tier(&self, level: usize) -> StoreResult<&Tier> {
        self.tiers.get(level).ok_or_else(|| StoreError::UnknownTier {
            database: format!("level {level}"),
            query_index: String::new(),
        })
    }

    /// Level of the tier stored in `db_name` and keyed by `query_index`.
    pub fn level_of(&self, db_name: &str, query_index: &str) -> StoreResult<usize> {
        let db_name = parse_db_name(db_name);
        self.tiers
            .iter()
            .position(|tier| tier.handler.name() == db_name && tier.query_index == query_index)
            .ok_or_else(|| StoreError::UnknownTier {
                database: db_name,
                query_index: query_index.to_owned(),
            })
    }

    /// Computes what deleting `root_values` from `root_db` would remove.
    pub async fn plan_subtree(
        &self,
        root_db: &str,
        root_query_index: &str,
        root_values: &[Value],
    ) -> StoreResult<CascadePlan> {
        let level = self.level_of(root_db, root_query_index)?;
        self.plan_level(level, root_values).await
    }

    /// Deletes `root_values` and every descendant left without a parent.
    #[instrument(skip(self, root_values), fields(roots = root_values.len()))]
    pub async fn delete_subtree(
        &self,
        root_db: &str,
        root_query_index: &str,
        root_values: &[Value],
    ) -> StoreResult<CascadeOutcome> {
        let plan = self
            .plan_subtree(root_db, root_query_index, root_values)
            .await?;
        self.execute(&plan).await
    }

    /// Same as [`Hierarchy::delete_subtree`], addressed by tier level.
    pub async fn delete_level(
        &self,
        level: usize,
        root_values: &[Value],
    ) -> StoreResult<CascadeOutcome> {
        let plan = self.plan_level(level, root_values).await?;
        self.execute(&plan).await
    }

    pub async fn plan_level(&self, level: usize, root_values: &[Value]) -> StoreResult<CascadePlan> {
        let mut plan = CascadePlan::default();
        let start = self.tier(level)?;

        if level > 0 {
            let parent = self.tier(level - 1)?;
            let deletes =
                matching_targets(&parent.handler, &start.query_index, root_values).await?;
            plan.steps.push(CascadeStep {
                level: level - 1,
                database: parent.handler.name().to_owned(),
                query_index: start.query_index.clone(),
                keys: root_values.to_vec(),
                deletes,
                drop_tables: Vec::new(),
                unlink: true,
            });
        }

        let mut keys = root_values.to_vec();
        let mut level = level;
        while !keys.is_empty() {
            let Some(tier) = self.tiers.get(level) else {
                break;
            };

            let deletes = matching_targets(&tier.handler, &tier.query_index, &keys).await?;
            let mut drop_tables = Vec::new();
            if tier.materialized {
                for key in &keys {
                    let name = serialize(key);
                    if tier.handler.table_exists(&name).await? {
                        drop_tables.push(name);
                    }
                }
            }

            let orphans = match self.tiers.get(level + 1) {
                Some(next) => orphaned_children(tier, next, &keys).await?,
                None => Vec::new(),
            };
            debug!(
                level,
                db = %tier.handler.name(),
                keys = keys.len(),
                orphans = orphans.len(),
                "cascade level planned"
            );

            plan.steps.push(CascadeStep {
                level,
                database: tier.handler.name().to_owned(),
                query_index: tier.query_index.clone(),
                keys,
                deletes,
                drop_tables,
                unlink: false,
            });
            keys = orphans;
            level += 1;
        }

        Ok(plan)
    }

    /// Runs `plan` bottom-up with one transaction per database.
    ///
    /// Transactions are committed, leaves first, only after every statement
    /// has succeeded. The commits themselves are independent: a crash between
    /// two of them leaves the upper databases untouched.
    #[instrument(skip(self, plan), fields(steps = plan.steps.len()))]
    pub async fn execute(&self, plan: &CascadePlan) -> StoreResult<CascadeOutcome> {
        let mut open: Vec<(String, Transaction<'static, Sqlite>)> = Vec::new();
        let mut outcome = CascadeOutcome::default();

        for step in plan.steps.iter().rev() {
            let handler = &self.tier(step.level)?.handler;
            let idx = match open.iter().position(|(name, _)| name == handler.name()) {
                Some(idx) => idx,
                None => {
                    open.push((handler.name().to_owned(), handler.begin().await?));
                    open.len() - 1
                }
            };
            let tx = &mut open[idx].1;

            for table in &step.drop_tables {
                if drop_table_on(tx, table).await? {
                    outcome.tables_dropped.push(table.clone());
                } else {
                    warn!(db = %step.database, table = %table, "planned table already gone");
                }
            }
            for target in &step.deletes {
                outcome.rows_deleted += delete_rows_on(tx, &target.table, &target.filtr).await?;
            }
        }

        for (database, tx) in open {
            tx.commit().await?;
            debug!(db = %database, "cascade committed");
        }

        info!(
            rows = outcome.rows_deleted,
            tables = outcome.tables_dropped.len(),
            "cascade finished"
        );
        Ok(outcome)
    }
}

/// Deletes for every table of `handler` with a `col` column and a row in `keys`.
async fn matching_targets(
    handler: &Handler,
    col: &str,
    keys: &[Value],
) -> StoreResult<Vec<DeleteTarget>> {
    let filtr = Filter::any_of(col, keys.iter().cloned());
    let mut targets = Vec::new();
    for table in handler.tables_with_column(col).await? {
        if handler.row_count(&table, Some(&filtr)).await? > 0 {
            targets.push(DeleteTarget::new(table, filtr.clone()));
        }
    }
    Ok(targets)
}

/// Children of `keys` that no other parent references.
///
/// Every table of the parent database carrying both query-indexes contributes
/// `(parent, child)` edges. A child is orphaned when at least one edge comes
/// from a deleted parent and none from a surviving one.
async fn orphaned_children(parent: &Tier, child: &Tier, keys: &[Value]) -> StoreResult<Vec<Value>> {
    if parent.query_index == child.query_index {
        return Ok(Vec::new());
    }

    let deleting: BTreeSet<String> = keys.iter().map(serialize).collect();
    let mut candidates: BTreeMap<String, Value> = BTreeMap::new();
    let mut retained: BTreeSet<String> = BTreeSet::new();
    let columns = [parent.query_index.as_str(), child.query_index.as_str()];

    for table in parent.handler.tables_with_column(&child.query_index).await? {
        let declared = parent.handler.column_names(&table).await?;
        if !declared.contains(&parent.query_index) {
            continue;
        }

        let edges = parent
            .handler
            .select_rows(&table, Some(&columns[..]), None)
            .await?;
        for edge in edges {
            let (Some(owner), Some(owned)) = (
                edge.get(&parent.query_index),
                edge.get(&child.query_index),
            ) else {
                continue;
            };
            if owned.is_null() {
                continue;
            }

            let owned_key = serialize(owned);
            if deleting.contains(&serialize(owner)) {
                candidates.entry(owned_key).or_insert_with(|| owned.clone());
            } else {
                retained.insert(owned_key);
            }
        }
    }

    Ok(candidates
        .into_iter()
        .filter(|(key, _)| !retained.contains(key))
        .map(|(_, value)| value)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::StoreConfig, filter::Record};
    use tempfile::TempDir;

    async fn setup() -> (TempDir, Hierarchy) {
        let dir = tempfile::tempdir().unwrap();
        let registry = StoreRegistry::new(StoreConfig::with_root(dir.path()));
        let hierarchy = Hierarchy::open(&registry).await.unwrap();

        let users = &hierarchy.tiers()[0].handler;
        users.create_table("sessions", &["user_id", "session_id"]).await.unwrap();
        let sessions = &hierarchy.tiers()[1].handler;
        sessions.create_table("sessions", &["session_id", "session_name"]).await.unwrap();
        (dir, hierarchy)
    }

    async fn link(handler: &Handler, table: &str, parent: (&str, &str), child: (&str, &str)) {
        let row = Record::new().with(parent.0, parent.1).with(child.0, child.1);
        handler.insert(table, &row, None).await.unwrap();
    }

    #[tokio::test]
    async fn single_reference_child_is_orphaned() {
        let (_dir, hierarchy) = setup().await;
        let users = &hierarchy.tiers()[0].handler;
        link(users, "sessions", ("user_id", "u1"), ("session_id", "s1")).await;
        link(users, "sessions", ("user_id", "u2"), ("session_id", "s2")).await;

        let plan = hierarchy
            .plan_subtree("users", "user_id", &[Value::from("u1")])
            .await
            .unwrap();
        assert_eq!(plan.keys_at(1), [Value::from("s1")]);
    }

    #[tokio::test]
    async fn shared_child_survives_partial_delete() {
        let (_dir, hierarchy) = setup().await;
        let users = &hierarchy.tiers()[0].handler;
        link(users, "sessions", ("user_id", "u1"), ("session_id", "shared")).await;
        link(users, "sessions", ("user_id", "u2"), ("session_id", "shared")).await;

        let plan = hierarchy
            .plan_subtree("users", "user_id", &[Value::from("u1")])
            .await
            .unwrap();
        assert!(plan.keys_at(1).is_empty());

        let both = hierarchy
            .plan_subtree("users", "user_id", &[Value::from("u1"), Value::from("u2")])
            .await
            .unwrap();
        assert_eq!(both.keys_at(1), [Value::from("shared")]);
    }

    #[tokio::test]
    async fn repeated_edge_from_a_deleted_parent_still_orphans() {
        let (_dir, hierarchy) = setup().await;
        let users = &hierarchy.tiers()[0].handler;
        link(users, "sessions", ("user_id", "u1"), ("session_id", "s1")).await;
        link(users, "sessions", ("user_id", "u1"), ("session_id", "s1")).await;

        let plan = hierarchy
            .plan_subtree("users", "user_id", &[Value::from("u1")])
            .await
            .unwrap();
        assert_eq!(plan.keys_at(1), [Value::from("s1")]);
    }

    #[tokio::test]
    async fn nonroot_start_unlinks_parent_edges() {
        let (_dir, hierarchy) = setup().await;
        let users = &hierarchy.tiers()[0].handler;
        let sessions = &hierarchy.tiers()[1].handler;
        link(users, "sessions", ("user_id", "u1"), ("session_id", "s1")).await;
        link(sessions, "sessions", ("session_id", "s1"), ("session_name", "first")).await;

        let outcome = hierarchy
            .delete_subtree("sessions", "session_id", &[Value::from("s1")])
            .await
            .unwrap();
        assert_eq!(outcome.rows_deleted, 2);
        assert_eq!(users.row_count("sessions", None).await.unwrap(), 0);
        assert_eq!(sessions.row_count("sessions", None).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn unknown_tier_is_rejected() {
        let (_dir, hierarchy) = setup().await;
        let err = hierarchy
            .plan_subtree("users", "session_id", &[Value::from("s1")])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::UnknownTier { .. }));
    }

    #[tokio::test]
    async fn empty_roots_plan_nothing() {
        let (_dir, hierarchy) = setup().await;
        let plan = hierarchy.plan_subtree("users", "user_id", &[]).await.unwrap();
        assert!(plan.is_empty());
        assert_eq!(
            hierarchy.execute(&plan).await.unwrap(),
            CascadeOutcome::default()
        );
    }
}
