//! Ownership invariants across the hierarchy.

use std::{collections::BTreeSet, fmt};

use serde::Serialize;
use tracing::{info, warn};

use crate::{
    coerce::serialize,
    error::StoreResult,
    hierarchy::{Hierarchy, Tier},
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Violation {
    /// An edge in the parent database points at a key with no record.
    DanglingEdge {
        database: String,
        table: String,
        parent: String,
        child: String,
    },
    /// An edge whose parent key has no record in its own tier.
    OrphanedEdge {
        database: String,
        table: String,
        parent: String,
        child: String,
    },
    /// A record no edge in the parent database owns.
    UnlinkedRecord {
        database: String,
        table: String,
        key: String,
    },
    /// A record of a materialised tier without its data table.
    MissingDataTable { database: String, key: String },
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Violation::DanglingEdge {
                database,
                table,
                parent,
                child,
            } => write!(f, "{database}/{table}: edge {parent} -> {child} has no record"),
            Violation::OrphanedEdge {
                database,
                table,
                parent,
                child,
            } => write!(f, "{database}/{table}: edge {parent} -> {child} has no owner record"),
            Violation::UnlinkedRecord {
                database,
                table,
                key,
            } => write!(f, "{database}/{table}: {key} has no owner"),
            Violation::MissingDataTable { database, key } => {
                write!(f, "{database}: data table {key} is missing")
            }
        }
    }
}

/// Returns every violation of the ownership tree. Empty means consistent.
pub async fn check(hierarchy: &Hierarchy) -> StoreResult<Vec<Violation>> {
    let mut violations = Vec::new();
    let tiers = hierarchy.tiers();

    for pair in tiers.windows(2) {
        let (parent, child) = (&pair[0], &pair[1]);
        let records = record_keys(child).await?;
        let owners = if parent.handler.table_exists(&parent.metadata_table).await? {
            Some(record_keys(parent).await?)
        } else {
            None
        };
        let mut linked = BTreeSet::new();

        for table in parent.handler.tables_with_column(&child.query_index).await? {
            let declared = parent.handler.column_names(&table).await?;
            if !declared.contains(&parent.query_index) {
                continue;
            }

            let columns = [parent.query_index.as_str(), child.query_index.as_str()];
            let edges = parent
                .handler
                .select_rows(&table, Some(&columns[..]), None)
                .await?;
            for edge in edges {
                let owner = edge.get(&parent.query_index).map(serialize).unwrap_or_default();
                let owned = match edge.get(&child.query_index) {
                    Some(value) if !value.is_null() => serialize(value),
                    _ => continue,
                };
                if owners.as_ref().is_some_and(|keys| !keys.contains(&owner)) {
                    violations.push(Violation::OrphanedEdge {
                        database: parent.handler.name().to_owned(),
                        table: table.clone(),
                        parent: owner.clone(),
                        child: owned.clone(),
                    });
                }
                if !records.contains(&owned) {
                    violations.push(Violation::DanglingEdge {
                        database: parent.handler.name().to_owned(),
                        table: table.clone(),
                        parent: owner,
                        child: owned.clone(),
                    });
                }
                linked.insert(owned);
            }
        }

        for key in records.difference(&linked) {
            violations.push(Violation::UnlinkedRecord {
                database: child.handler.name().to_owned(),
                table: child.metadata_table.clone(),
                key: key.clone(),
            });
        }
    }

    for tier in tiers.iter().filter(|tier| tier.materialized) {
        for key in record_keys(tier).await? {
            if !tier.handler.table_exists(&key).await? {
                violations.push(Violation::MissingDataTable {
                    database: tier.handler.name().to_owned(),
                    key,
                });
            }
        }
    }

    if violations.is_empty() {
        info!("ownership hierarchy is consistent");
    } else {
        for violation in &violations {
            warn!(%violation, "integrity violation");
        }
    }
    Ok(violations)
}

async fn record_keys(tier: &Tier) -> StoreResult<BTreeSet<String>> {
    if !tier.handler.table_exists(&tier.metadata_table).await? {
        return Ok(BTreeSet::new());
    }
    let columns = [tier.query_index.as_str()];
    let rows = tier
        .handler
        .select_rows(&tier.metadata_table, Some(&columns[..]), None)
        .await?;
    Ok(rows
        .iter()
        .filter_map(|row| row.get(&tier.query_index))
        .filter(|value| !value.is_null())
        .map(serialize)
        .collect())
}
