//! Sessions and datasets: content-derived identity, creation and removal.

use chrono::Utc;
use md5::Md5;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{info, instrument, warn};

use crate::{
    coerce::{coerce_value, Value, ValueKind},
    error::{StoreError, StoreResult},
    filter::{Assignment, Filter, Record, SortOrder},
    handler::Handler,
    hierarchy::{CascadeOutcome, Hierarchy, DATASETS_LEVEL, SESSIONS_LEVEL, USERS_LEVEL},
    ident,
    registry::StoreRegistry,
    schema::{tables, ColumnDef, TableSchema},
};

/// Session id: MD5 hex of `lower(user_id + session_name)`.
pub fn session_id_for(user_id: &str, session_name: &str) -> String {
    md5_hex(&format!("{user_id}{session_name}").to_lowercase())
}

/// Dataset id: MD5 hex of `lower(session_id + file_name)`.
pub fn dataset_id_for(session_id: &str, file_name: &str) -> String {
    md5_hex(&format!("{session_id}{file_name}").to_lowercase())
}

pub(crate) fn md5_hex(input: &str) -> String {
    format!("{:x}", Md5::digest(input.as_bytes()))
}

/// Metadata row of one dataset.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DatasetInfo {
    pub dataset_id: String,
    pub uploaded_by: String,
    pub created_on: String,
    pub is_final: bool,
    pub version: i64,
    pub file_name: String,
    pub columns: Vec<String>,
    pub size_bytes: i64,
    pub sha256: String,
}

/// Sessions and datasets on top of the three-tier [`Hierarchy`].
#[derive(Clone, Debug)]
pub struct Catalog {
    hierarchy: Hierarchy,
}

impl Catalog {
    /// Opens the configured stores and creates the catalog tables if missing.
    pub async fn open(registry: &StoreRegistry) -> StoreResult<Self> {
        let catalog = Self {
            hierarchy: Hierarchy::open(registry).await?,
        };
        catalog.ensure_schema().await?;
        Ok(catalog)
    }

    pub fn hierarchy(&self) -> &Hierarchy {
        &self.hierarchy
    }

    pub fn users(&self) -> &Handler {
        &self.hierarchy.tiers()[USERS_LEVEL].handler
    }

    pub fn sessions(&self) -> &Handler {
        &self.hierarchy.tiers()[SESSIONS_LEVEL].handler
    }

    pub fn data(&self) -> &Handler {
        &self.hierarchy.tiers()[DATASETS_LEVEL].handler
    }

    fn user_index(&self) -> &str {
        &self.hierarchy.tiers()[USERS_LEVEL].query_index
    }

    fn session_index(&self) -> &str {
        &self.hierarchy.tiers()[SESSIONS_LEVEL].query_index
    }

    fn dataset_index(&self) -> &str {
        &self.hierarchy.tiers()[DATASETS_LEVEL].query_index
    }

    async fn ensure_schema(&self) -> StoreResult<()> {
        let (user, session, dataset) = (self.user_index(), self.session_index(), self.dataset_index());

        self.users()
            .create_table_with_schema(&TableSchema::edge(tables::USER_SESSIONS, user, session))
            .await?;
        self.sessions()
            .create_table_with_schema(&TableSchema::new(
                tables::SESSIONS,
                vec![
                    ColumnDef::text(session).primary_key(),
                    ColumnDef::text("session_name"),
                    ColumnDef::text("created_on"),
                ],
            ))
            .await?;
        self.sessions()
            .create_table_with_schema(&TableSchema::edge(tables::SESSION_DATASETS, session, dataset))
            .await?;
        self.data()
            .create_table_with_schema(&TableSchema::new(
                tables::DATASETS,
                vec![
                    ColumnDef::text(dataset).primary_key(),
                    ColumnDef::text("uploaded_by"),
                    ColumnDef::text("created_on"),
                    ColumnDef::new("final", ValueKind::Boolean),
                    ColumnDef::new("version", ValueKind::Integer),
                    ColumnDef::text("file_name"),
                    ColumnDef::new("columns", ValueKind::List),
                    ColumnDef::new("size_bytes", ValueKind::Integer),
                    ColumnDef::text("sha256"),
                ],
            ))
            .await?;
        Ok(())
    }

    /// Fails with [`StoreError::MissingParent`] unless `key` has a record at `level`.
    ///
    /// A tier whose metadata table was never created is not checked, so the
    /// catalog works without a credential store.
    async fn require_record(&self, level: usize, key: &str) -> StoreResult<()> {
        let tier = self.hierarchy.tier(level)?;
        if !tier.handler.table_exists(&tier.metadata_table).await? {
            return Ok(());
        }
        let filtr = Filter::eq(tier.query_index.as_str(), key);
        if tier.handler.record_exists(&tier.metadata_table, &filtr).await? {
            return Ok(());
        }
        Err(StoreError::MissingParent {
            table: tier.metadata_table.clone(),
            col: tier.query_index.clone(),
            val: key.to_owned(),
        })
    }

    /// Creates a named session for `user_id` and returns its id.
    #[instrument(skip(self))]
    pub async fn create_session(&self, user_id: &str, session_name: &str) -> StoreResult<String> {
        self.require_record(USERS_LEVEL, user_id).await?;
        let session_id = session_id_for(user_id, session_name);
        let by_id = Filter::eq(self.session_index(), &session_id);

        let metadata = Record::new()
            .with(self.session_index(), &session_id)
            .with("session_name", session_name)
            .with("created_on", Utc::now().to_rfc3339());
        self.sessions()
            .insert(tables::SESSIONS, &metadata, Some(&by_id))
            .await?;

        let edge = Record::new()
            .with(self.user_index(), user_id)
            .with(self.session_index(), &session_id);
        if let Err(err) = self.users().insert(tables::USER_SESSIONS, &edge, None).await {
            warn!(session_id = %session_id, error = %err, "session link failed");
            self.sessions().delete_rows(tables::SESSIONS, &by_id).await?;
            return Err(err);
        }

        info!(session_id = %session_id, "session created");
        Ok(session_id)
    }

    /// Session ids owned by `user_id`, sorted. Empty when there are none.
    pub async fn list_sessions(&self, user_id: &str) -> StoreResult<Vec<String>> {
        let ids = self
            .users()
            .select_values_or_empty(
                tables::USER_SESSIONS,
                self.session_index(),
                &Filter::eq(self.user_index(), user_id),
                ValueKind::String,
                SortOrder::Ascending,
            )
            .await?;
        Ok(ids.into_iter().map(Value::into_text).collect())
    }

    /// Dataset ids owned by `session_id`, sorted. Empty when there are none.
    pub async fn list_datasets(&self, session_id: &str) -> StoreResult<Vec<String>> {
        let ids = self
            .sessions()
            .select_values_or_empty(
                tables::SESSION_DATASETS,
                self.dataset_index(),
                &Filter::eq(self.session_index(), session_id),
                ValueKind::String,
                SortOrder::Ascending,
            )
            .await?;
        Ok(ids.into_iter().map(Value::into_text).collect())
    }

    pub async fn session_name(&self, session_id: &str) -> StoreResult<String> {
        let name = self
            .sessions()
            .select_value(
                tables::SESSIONS,
                "session_name",
                &Filter::eq(self.session_index(), session_id),
                ValueKind::String,
            )
            .await?;
        Ok(name.into_text())
    }

    /// Stores `rows` as a new dataset of `session_id` and returns its id.
    ///
    /// The rows go into a table named after the dataset id. The metadata row
    /// gets the next version number within the session. Every row must have
    /// exactly one cell per column. On failure nothing written here is kept.
    #[instrument(skip(self, columns, rows), fields(rows = rows.len()))]
    pub async fn register_dataset<S: AsRef<str>>(
        &self,
        session_id: &str,
        uploaded_by: &str,
        file_name: &str,
        columns: &[S],
        rows: Vec<Vec<Value>>,
    ) -> StoreResult<String> {
        self.require_record(SESSIONS_LEVEL, session_id).await?;
        let dataset_id = dataset_id_for(session_id, file_name);
        if self.data().table_exists(&dataset_id).await? {
            return Err(StoreError::DuplicateRecord {
                table: dataset_id.clone(),
                col: self.dataset_index().to_owned(),
                val: dataset_id,
            });
        }

        let names: Vec<String> = columns.iter().map(|c| c.as_ref().to_owned()).collect();
        if let Some(row) = rows.iter().find(|row| row.len() != names.len()) {
            return Err(StoreError::SchemaMismatch {
                database: self.data().name().to_owned(),
                table: dataset_id,
                expected: names,
                actual: row.iter().map(ToString::to_string).collect(),
            });
        }

        let (sha256, size_bytes) = digest(&names, &rows);
        let records: Vec<Record> = rows
            .into_iter()
            .map(|row| names.iter().cloned().zip(row).collect())
            .collect();

        let version = self.next_version(session_id).await?;

        self.data().create_table(&dataset_id, &names).await?;
        if let Err(err) = self.data().insert_many(&dataset_id, &records).await {
            return Err(self.discard_dataset(&dataset_id, false, err).await);
        }

        let by_id = Filter::eq(self.dataset_index(), &dataset_id);
        let metadata = Record::new()
            .with(self.dataset_index(), &dataset_id)
            .with("uploaded_by", uploaded_by)
            .with("created_on", Utc::now().to_rfc3339())
            .with("final", false)
            .with("version", version)
            .with("file_name", file_name)
            .with(
                "columns",
                Value::List(names.iter().cloned().map(Into::into).collect()),
            )
            .with("size_bytes", size_bytes as i64)
            .with("sha256", sha256);
        if let Err(err) = self
            .data()
            .insert(tables::DATASETS, &metadata, Some(&by_id))
            .await
        {
            return Err(self.discard_dataset(&dataset_id, false, err).await);
        }

        let edge = Record::new()
            .with(self.session_index(), session_id)
            .with(self.dataset_index(), &dataset_id);
        if let Err(err) = self
            .sessions()
            .insert(tables::SESSION_DATASETS, &edge, None)
            .await
        {
            return Err(self.discard_dataset(&dataset_id, true, err).await);
        }

        info!(dataset_id = %dataset_id, version, "dataset registered");
        Ok(dataset_id)
    }

    /// Removes the raw table of a half-registered dataset, and its metadata row
    /// when `with_metadata`. Returns `cause`, or the cleanup error if that fails.
    async fn discard_dataset(
        &self,
        dataset_id: &str,
        with_metadata: bool,
        cause: StoreError,
    ) -> StoreError {
        warn!(dataset_id, error = %cause, "dataset registration failed");
        if with_metadata {
            let by_id = Filter::eq(self.dataset_index(), dataset_id);
            if let Err(err) = self.data().delete_rows(tables::DATASETS, &by_id).await {
                return err;
            }
        }
        match self.data().drop_table_if_exists(dataset_id).await {
            Ok(_) => cause,
            Err(err) => err,
        }
    }

    /// `max(version) + 1` over the session's datasets, or 1 for the first one.
    async fn next_version(&self, session_id: &str) -> StoreResult<i64> {
        let owned = self.list_datasets(session_id).await?;
        if owned.is_empty() {
            return Ok(1);
        }

        let placeholders = vec!["?"; owned.len()].join(", ");
        let query = format!(
            "SELECT MAX(\"version\") FROM {} WHERE {} IN ({placeholders})",
            ident::quote(tables::DATASETS)?,
            ident::quote(self.dataset_index())?,
        );
        let params: Vec<Value> = owned.into_iter().map(Value::Text).collect();
        match self.data().select_scalar(&query, &params, ValueKind::Integer).await {
            Ok(Value::Integer(max)) => Ok(max + 1),
            Ok(_) => Ok(1),
            Err(err) if err.is_empty_result() => Ok(1),
            Err(err) => Err(err),
        }
    }

    /// Raw rows of a dataset, in load order.
    pub async fn load_dataset(&self, dataset_id: &str) -> StoreResult<Vec<Record>> {
        self.data()
            .select_rows(dataset_id, None::<&[&str]>, None)
            .await
    }

    pub async fn dataset_info(&self, dataset_id: &str) -> StoreResult<DatasetInfo> {
        let row = self
            .data()
            .select_rows(
                tables::DATASETS,
                None::<&[&str]>,
                Some(&Filter::eq(self.dataset_index(), dataset_id)),
            )
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| StoreError::EmptyResult(tables::DATASETS.to_owned()))?;

        let field = |col: &str, kind: ValueKind| -> StoreResult<Value> {
            coerce_value(row.get(col).cloned().unwrap_or(Value::Null), kind)
        };
        let columns = match field("columns", ValueKind::List)? {
            Value::List(items) => items
                .into_iter()
                .map(|item| match item {
                    serde_json::Value::String(name) => name,
                    other => other.to_string(),
                })
                .collect(),
            _ => Vec::new(),
        };

        Ok(DatasetInfo {
            dataset_id: dataset_id.to_owned(),
            uploaded_by: field("uploaded_by", ValueKind::String)?.into_text(),
            created_on: field("created_on", ValueKind::String)?.into_text(),
            is_final: field("final", ValueKind::Boolean)?.as_bool().unwrap_or(false),
            version: field("version", ValueKind::Integer)?.as_i64().unwrap_or_default(),
            file_name: field("file_name", ValueKind::String)?.into_text(),
            columns,
            size_bytes: field("size_bytes", ValueKind::Integer)?.as_i64().unwrap_or_default(),
            sha256: field("sha256", ValueKind::String)?.into_text(),
        })
    }

    /// Flags `dataset_id` as the final dataset of its session, clearing the others.
    #[instrument(skip(self))]
    pub async fn mark_final(&self, session_id: &str, dataset_id: &str) -> StoreResult<()> {
        let owned = self.list_datasets(session_id).await?;
        if !owned.iter().any(|id| id == dataset_id) {
            return Err(StoreError::EmptyResult(tables::SESSION_DATASETS.to_owned()));
        }

        self.data()
            .reset_column(
                tables::DATASETS,
                &Assignment::new("final", false),
                Some(&Filter::any_of(self.dataset_index(), owned)),
            )
            .await?;
        self.data()
            .update(
                tables::DATASETS,
                &Assignment::new("final", true),
                &Filter::eq(self.dataset_index(), dataset_id),
            )
            .await
    }

    /// Deletes a session with its datasets and unlinks it from its user.
    pub async fn delete_session(&self, session_id: &str) -> StoreResult<CascadeOutcome> {
        self.hierarchy
            .delete_level(SESSIONS_LEVEL, &[Value::from(session_id)])
            .await
    }

    /// Deletes a dataset, its rows and its session edge.
    pub async fn delete_dataset(&self, dataset_id: &str) -> StoreResult<CascadeOutcome> {
        self.hierarchy
            .delete_level(DATASETS_LEVEL, &[Value::from(dataset_id)])
            .await
    }

    /// Deletes a user's sessions and datasets, and the user's own rows.
    pub async fn delete_user(&self, user_id: &str) -> StoreResult<CascadeOutcome> {
        self.hierarchy
            .delete_level(USERS_LEVEL, &[Value::from(user_id)])
            .await
    }
}

/// SHA-256 over the header and every cell, with the number of bytes hashed.
fn digest(columns: &[String], rows: &[Vec<Value>]) -> (String, usize) {
    let mut hasher = Sha256::new();
    let mut size = 0;
    let mut feed = |line: String| {
        size += line.len() + 1;
        hasher.update(line.as_bytes());
        hasher.update(b"\n");
    };

    feed(columns.join("\x1f"));
    for row in rows {
        let cells: Vec<String> = row.iter().map(ToString::to_string).collect();
        feed(cells.join("\x1f"));
    }
    (format!("{:x}", hasher.finalize()), size)
}
