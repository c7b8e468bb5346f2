//! Declared table schemas.

use serde::{Deserialize, Serialize};

use crate::{coerce::ValueKind, error::StoreResult, ident};

/// Fixed table names of the three stores.
pub mod tables {
    /// users: one row per account.
    pub const CREDENTIALS: &str = "credentials";
    /// users: `(user_id, session_id)` edges.
    pub const USER_SESSIONS: &str = "sessions";
    /// sessions: one row per session.
    pub const SESSIONS: &str = "sessions";
    /// sessions: `(session_id, dataset_id)` edges.
    pub const SESSION_DATASETS: &str = "data";
    /// data: one row per dataset; the rows themselves live in a table named by the id.
    pub const DATASETS: &str = "data";
}

/// One column of a declared schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    pub kind: ValueKind,
    pub nullable: bool,
    pub unique: bool,
    pub primary_key: bool,
}

impl ColumnDef {
    /// A non-null column of the given kind.
    pub fn new(name: impl Into<String>, kind: ValueKind) -> Self {
        Self {
            name: name.into(),
            kind,
            nullable: false,
            unique: false,
            primary_key: false,
        }
    }

    pub fn text(name: impl Into<String>) -> Self {
        Self::new(name, ValueKind::String)
    }

    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self
    }

    fn to_sql(&self) -> StoreResult<String> {
        let mut def = format!("{} {}", ident::quote(&self.name)?, self.kind.sql_type());
        if !self.nullable {
            def.push_str(" NOT NULL");
        }
        if self.unique && !self.primary_key {
            def.push_str(" UNIQUE");
        }
        Ok(def)
    }
}

/// Named, ordered set of columns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    pub name: String,
    pub columns: Vec<ColumnDef>,
}

impl TableSchema {
    pub fn new(name: impl Into<String>, columns: Vec<ColumnDef>) -> Self {
        Self {
            name: name.into(),
            columns,
        }
    }

    /// Two-column ownership edge `(parent, child)`, keyed on the pair.
    pub fn edge(name: impl Into<String>, parent: &str, child: &str) -> Self {
        Self::new(
            name,
            vec![
                ColumnDef::text(parent).primary_key(),
                ColumnDef::text(child).primary_key(),
            ],
        )
    }

    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|col| col.name.clone()).collect()
    }

    /// Column definition list, including a table-level primary key clause.
    pub fn to_sql(&self) -> StoreResult<String> {
        let mut parts = self
            .columns
            .iter()
            .map(ColumnDef::to_sql)
            .collect::<StoreResult<Vec<_>>>()?;

        let keys: Vec<&str> = self
            .columns
            .iter()
            .filter(|col| col.primary_key)
            .map(|col| col.name.as_str())
            .collect();
        if !keys.is_empty() {
            parts.push(format!("PRIMARY KEY ({})", ident::quote_list(&keys)?));
        }

        Ok(format!("({})", parts.join(", ")))
    }
}
