//! Handler over one SQLite database file.
//!
//! Every statement is assembled with [`QueryBuilder`]: identifiers go through
//! [`ident::quote`], values are always bound. Operations that touch more than
//! one statement (validated inserts, exactly-one updates, batch deletes) run
//! inside a single transaction.

use std::path::{Path, PathBuf};

use futures::TryStreamExt;
use sqlx::{
    query::Query,
    sqlite::{SqliteArguments, SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
    QueryBuilder, Row, Sqlite, SqliteConnection, SqlitePool, Transaction, TypeInfo, ValueRef,
};
use tracing::{debug, info, instrument};

use crate::{
    coerce::{coerce_value, serialize, Value, ValueKind},
    config::{parse_db_name, StoreConfig},
    error::{StoreError, StoreResult},
    filter::{Assignment, DeleteTarget, Filter, FilterValue, Record, SortOrder},
    ident,
    schema::TableSchema,
};

/// Connection pool to one named database file.
#[derive(Clone, Debug)]
pub struct Handler {
    name: String,
    path: PathBuf,
    pool: SqlitePool,
}

impl Handler {
    /// Opens (or creates) `db_name` under the configured root directory.
    pub async fn open(config: &StoreConfig, db_name: &str) -> StoreResult<Self> {
        let root = &config.root_dir;
        std::fs::create_dir_all(root).map_err(|err| StoreError::Io(root.clone(), err))?;

        let path = config.path_for(db_name);
        let options = SqliteConnectOptions::new()
            .filename(&path)
            .create_if_missing(true)
            .busy_timeout(config.busy_timeout);

        let pool = SqlitePoolOptions::new()
            .min_connections(1)
            .max_connections(config.max_connections)
            .connect_with(options)
            .await?;

        info!(db = %db_name, path = %path.display(), "database opened");
        Ok(Self {
            name: parse_db_name(db_name),
            path,
            pool,
        })
    }

    /// File name of the database, including its extension.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Exposes the underlying pool for callers composing their own queries.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Starts a transaction on a pooled connection.
    pub async fn begin(&self) -> StoreResult<Transaction<'static, Sqlite>> {
        Ok(self.pool.begin().await?)
    }

    /// Waits for checked-out connections and closes the pool.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Creates an untyped table. Returns `false` when it already existed.
    #[instrument(skip(self, columns), fields(db = %self.name))]
    pub async fn create_table<S: AsRef<str>>(&self, table: &str, columns: &[S]) -> StoreResult<bool> {
        if columns.is_empty() {
            return Err(StoreError::InvalidIdentifier(format!(
                "{table}: empty column list"
            )));
        }
        if self.table_exists(table).await? {
            return Ok(false);
        }

        let sql = format!(
            "CREATE TABLE IF NOT EXISTS {} ({})",
            ident::quote(table)?,
            ident::quote_list(columns)?
        );
        sqlx::query(&sql).execute(&self.pool).await?;
        debug!(table, "table created");
        Ok(true)
    }

    /// Creates a table from a declared schema. Returns `false` when it already existed.
    #[instrument(skip(self, schema), fields(db = %self.name, table = %schema.name))]
    pub async fn create_table_with_schema(&self, schema: &TableSchema) -> StoreResult<bool> {
        if self.table_exists(&schema.name).await? {
            return Ok(false);
        }

        let sql = format!(
            "CREATE TABLE IF NOT EXISTS {} {}",
            ident::quote(&schema.name)?,
            schema.to_sql()?
        );
        sqlx::query(&sql).execute(&self.pool).await?;
        debug!("table created from schema");
        Ok(true)
    }

    pub async fn table_exists(&self, table: &str) -> StoreResult<bool> {
        let mut conn = self.pool.acquire().await?;
        table_exists_on(&mut conn, table).await
    }

    /// Drops `table`, failing with [`StoreError::MissingTable`] when it does not exist.
    #[instrument(skip(self), fields(db = %self.name))]
    pub async fn drop_table(&self, table: &str) -> StoreResult<()> {
        let mut conn = self.pool.acquire().await?;
        if !drop_table_on(&mut conn, table).await? {
            return Err(StoreError::MissingTable {
                database: self.name.clone(),
                table: table.to_owned(),
            });
        }
        info!(table, "table dropped");
        Ok(())
    }

    /// Drops `table` when present. Returns whether anything was dropped.
    pub async fn drop_table_if_exists(&self, table: &str) -> StoreResult<bool> {
        let mut conn = self.pool.acquire().await?;
        drop_table_on(&mut conn, table).await
    }

    /// Appends one row.
    ///
    /// With `validate`, a row already matching that filter aborts the insert with
    /// [`StoreError::DuplicateRecord`]. The value columns must equal the table's
    /// declared columns, in declared order.
    #[instrument(skip(self, values, validate), fields(db = %self.name))]
    pub async fn insert(
        &self,
        table: &str,
        values: &Record,
        validate: Option<&Filter>,
    ) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;

        if let Some(filtr) = validate {
            if record_exists_on(&mut tx, table, filtr).await? {
                return Err(StoreError::DuplicateRecord {
                    table: table.to_owned(),
                    col: filtr.col.clone(),
                    val: filtr.val.to_string(),
                });
            }
        }

        self.check_columns(&mut tx, table, values.columns()).await?;
        insert_on(&mut tx, table, values).await?;
        tx.commit().await?;
        debug!(table, "row inserted");
        Ok(())
    }

    /// Appends many rows sharing the same columns in one transaction.
    #[instrument(skip(self, rows), fields(db = %self.name, rows = rows.len()))]
    pub async fn insert_many(&self, table: &str, rows: &[Record]) -> StoreResult<u64> {
        let mut tx = self.pool.begin().await?;
        for row in rows {
            self.check_columns(&mut tx, table, row.columns()).await?;
            insert_on(&mut tx, table, row).await?;
        }
        tx.commit().await?;
        Ok(rows.len() as u64)
    }

    /// Sets one column on the single row matching `filtr`.
    ///
    /// Zero or several matches fail with [`StoreError::Cardinality`] and nothing is written.
    #[instrument(skip(self, assignment, filtr), fields(db = %self.name, col = %assignment.col))]
    pub async fn update(
        &self,
        table: &str,
        assignment: &Assignment,
        filtr: &Filter,
    ) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;
        let found = row_count_on(&mut tx, table, Some(filtr)).await?;
        if found != 1 {
            return Err(StoreError::Cardinality {
                table: table.to_owned(),
                found,
            });
        }

        update_on(&mut tx, table, assignment, Some(filtr)).await?;
        tx.commit().await?;
        debug!(table, "row updated");
        Ok(())
    }

    /// Sets one column on every row matching `filtr` (all rows without a filter).
    #[instrument(skip(self, assignment, filtr), fields(db = %self.name, col = %assignment.col))]
    pub async fn reset_column(
        &self,
        table: &str,
        assignment: &Assignment,
        filtr: Option<&Filter>,
    ) -> StoreResult<u64> {
        let mut conn = self.pool.acquire().await?;
        let affected = update_on(&mut conn, table, assignment, filtr).await?;
        debug!(table, affected, "column reset");
        Ok(affected)
    }

    /// Deletes every row matching `filtr`.
    #[instrument(skip(self, filtr), fields(db = %self.name))]
    pub async fn delete_rows(&self, table: &str, filtr: &Filter) -> StoreResult<u64> {
        let mut conn = self.pool.acquire().await?;
        delete_rows_on(&mut conn, table, filtr).await
    }

    /// Applies every delete in one transaction; a failure leaves all tables untouched.
    #[instrument(skip(self, targets), fields(db = %self.name, targets = targets.len()))]
    pub async fn delete_batch(&self, targets: &[DeleteTarget]) -> StoreResult<u64> {
        let mut tx = self.pool.begin().await?;
        let mut affected = 0;
        for target in targets {
            affected += delete_rows_on(&mut tx, &target.table, &target.filtr).await?;
        }
        tx.commit().await?;
        info!(affected, "batch delete committed");
        Ok(affected)
    }

    pub async fn record_exists(&self, table: &str, filtr: &Filter) -> StoreResult<bool> {
        let mut conn = self.pool.acquire().await?;
        record_exists_on(&mut conn, table, filtr).await
    }

    /// Declared column names of `table`, in declaration order. Empty for a missing table.
    pub async fn column_names(&self, table: &str) -> StoreResult<Vec<String>> {
        let mut conn = self.pool.acquire().await?;
        column_names_on(&mut conn, table).await
    }

    pub async fn row_count(&self, table: &str, filtr: Option<&Filter>) -> StoreResult<u64> {
        let mut conn = self.pool.acquire().await?;
        row_count_on(&mut conn, table, filtr).await
    }

    /// Names of all tables declaring a column called `col`, sorted.
    pub async fn tables_with_column(&self, col: &str) -> StoreResult<Vec<String>> {
        let mut conn = self.pool.acquire().await?;
        tables_with_column_on(&mut conn, col).await
    }

    /// Every user table in the database, sorted.
    pub async fn table_names(&self) -> StoreResult<Vec<String>> {
        let names = sqlx::query_scalar::<_, String>(
            r#"
            SELECT name FROM sqlite_master
            WHERE type = 'table' AND name NOT LIKE 'sqlite_%'
            ORDER BY name
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(names)
    }

    /// The single `col` value matching `filtr`, coerced to `kind`.
    ///
    /// No match fails with [`StoreError::EmptyResult`], several with
    /// [`StoreError::Cardinality`].
    pub async fn select_value(
        &self,
        table: &str,
        col: &str,
        filtr: &Filter,
        kind: ValueKind,
    ) -> StoreResult<Value> {
        let mut values = self
            .select_column(table, col, filtr, SortOrder::Ascending)
            .await?;
        match values.len() {
            0 => Err(StoreError::EmptyResult(table.to_owned())),
            1 => coerce_value(values.remove(0), kind),
            found => Err(StoreError::Cardinality {
                table: table.to_owned(),
                found: found as u64,
            }),
        }
    }

    /// Every `col` value matching `filtr`, coerced and sorted by `col`.
    ///
    /// A single match still yields a one-element list; no match fails with
    /// [`StoreError::EmptyResult`].
    pub async fn select_values(
        &self,
        table: &str,
        col: &str,
        filtr: &Filter,
        kind: ValueKind,
        order: SortOrder,
    ) -> StoreResult<Vec<Value>> {
        let values = self.select_column(table, col, filtr, order).await?;
        if values.is_empty() {
            return Err(StoreError::EmptyResult(table.to_owned()));
        }
        values
            .into_iter()
            .map(|value| coerce_value(value, kind))
            .collect()
    }

    /// Like [`Handler::select_values`] but an empty match is an empty list.
    pub async fn select_values_or_empty(
        &self,
        table: &str,
        col: &str,
        filtr: &Filter,
        kind: ValueKind,
        order: SortOrder,
    ) -> StoreResult<Vec<Value>> {
        match self.select_values(table, col, filtr, kind, order).await {
            Err(StoreError::EmptyResult(_)) => Ok(Vec::new()),
            other => other,
        }
    }

    /// Exactly one row as an uncoerced column → value record.
    ///
    /// Several matching rows are a [`StoreError::Cardinality`] error rather than
    /// a silent pick of the first one.
    pub async fn select_row<S: AsRef<str>>(
        &self,
        table: &str,
        columns: &[S],
        filtr: &Filter,
    ) -> StoreResult<Record> {
        let mut rows = self.select_rows(table, Some(columns), Some(filtr)).await?;
        match rows.len() {
            0 => Err(StoreError::EmptyResult(table.to_owned())),
            1 => Ok(rows.remove(0)),
            found => Err(StoreError::Cardinality {
                table: table.to_owned(),
                found: found as u64,
            }),
        }
    }

    /// All matching rows, uncoerced, in storage order. `None` columns selects every column.
    pub async fn select_rows<S: AsRef<str>>(
        &self,
        table: &str,
        columns: Option<&[S]>,
        filtr: Option<&Filter>,
    ) -> StoreResult<Vec<Record>> {
        let names = match columns {
            Some(columns) => columns.iter().map(|c| c.as_ref().to_owned()).collect(),
            None => self.column_names(table).await?,
        };
        if names.is_empty() {
            return Err(StoreError::MissingTable {
                database: self.name.clone(),
                table: table.to_owned(),
            });
        }

        let mut qb = QueryBuilder::<Sqlite>::new("SELECT ");
        qb.push(ident::quote_list(&names)?)
            .push(" FROM ")
            .push(ident::quote(table)?);
        if let Some(filtr) = filtr {
            push_where(&mut qb, filtr)?;
        }
        qb.push(" ORDER BY rowid");

        let mut stream = qb.build().fetch(&self.pool);
        let mut out = Vec::new();
        while let Some(row) = stream.try_next().await? {
            let mut record = Record::new();
            for (idx, name) in names.iter().enumerate() {
                record.push(name.clone(), decode_column(&row, idx)?);
            }
            out.push(record);
        }
        Ok(out)
    }

    /// Runs a free-form query expected to yield exactly one row with one column.
    ///
    /// `params` are bound to the query's `?` placeholders in order. No row, or a
    /// NULL result (e.g. `MAX` over nothing), fails with [`StoreError::EmptyResult`].
    #[instrument(skip(self, params), fields(db = %self.name))]
    pub async fn select_scalar(
        &self,
        query: &str,
        params: &[Value],
        kind: ValueKind,
    ) -> StoreResult<Value> {
        let mut statement = sqlx::query(query);
        for param in params {
            statement = bind_value(statement, param);
        }

        let rows = statement.fetch_all(&self.pool).await?;
        let row = match rows.len() {
            0 => return Err(StoreError::EmptyResult(query.trim().to_owned())),
            1 => &rows[0],
            found => {
                return Err(StoreError::Cardinality {
                    table: query.trim().to_owned(),
                    found: found as u64,
                })
            }
        };

        match decode_column(row, 0)? {
            Value::Null => Err(StoreError::EmptyResult(query.trim().to_owned())),
            value => coerce_value(value, kind),
        }
    }

    async fn select_column(
        &self,
        table: &str,
        col: &str,
        filtr: &Filter,
        order: SortOrder,
    ) -> StoreResult<Vec<Value>> {
        let quoted = ident::quote(col)?;
        let mut qb = QueryBuilder::<Sqlite>::new("SELECT ");
        qb.push(&quoted).push(" FROM ").push(ident::quote(table)?);
        push_where(&mut qb, filtr)?;
        qb.push(" ORDER BY ").push(&quoted).push(" ").push(order.as_sql());

        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter().map(|row| decode_column(row, 0)).collect()
    }

    async fn check_columns(
        &self,
        conn: &mut SqliteConnection,
        table: &str,
        actual: &[String],
    ) -> StoreResult<()> {
        let expected = column_names_on(conn, table).await?;
        if expected.is_empty() {
            return Err(StoreError::MissingTable {
                database: self.name.clone(),
                table: table.to_owned(),
            });
        }
        if expected != actual {
            return Err(StoreError::SchemaMismatch {
                database: self.name.clone(),
                table: table.to_owned(),
                expected,
                actual: actual.to_vec(),
            });
        }
        Ok(())
    }
}

pub(crate) async fn table_exists_on(conn: &mut SqliteConnection, table: &str) -> StoreResult<bool> {
    let count: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?")
            .bind(table)
            .fetch_one(&mut *conn)
            .await?;
    Ok(count > 0)
}

/// Drops `table` on the given connection. Returns `false` when it was absent.
pub(crate) async fn drop_table_on(conn: &mut SqliteConnection, table: &str) -> StoreResult<bool> {
    if !table_exists_on(conn, table).await? {
        return Ok(false);
    }
    let sql = format!("DROP TABLE {}", ident::quote(table)?);
    sqlx::query(&sql).execute(&mut *conn).await?;
    Ok(true)
}

pub(crate) async fn delete_rows_on(
    conn: &mut SqliteConnection,
    table: &str,
    filtr: &Filter,
) -> StoreResult<u64> {
    let mut qb = QueryBuilder::<Sqlite>::new("DELETE FROM ");
    qb.push(ident::quote(table)?);
    push_where(&mut qb, filtr)?;
    let result = qb.build().execute(&mut *conn).await?;
    debug!(table, col = %filtr.col, affected = result.rows_affected(), "rows deleted");
    Ok(result.rows_affected())
}

pub(crate) async fn record_exists_on(
    conn: &mut SqliteConnection,
    table: &str,
    filtr: &Filter,
) -> StoreResult<bool> {
    let mut qb = QueryBuilder::<Sqlite>::new("SELECT EXISTS (SELECT 1 FROM ");
    qb.push(ident::quote(table)?);
    push_where(&mut qb, filtr)?;
    qb.push(")");
    let exists: i64 = qb.build_query_scalar().fetch_one(&mut *conn).await?;
    Ok(exists != 0)
}

pub(crate) async fn row_count_on(
    conn: &mut SqliteConnection,
    table: &str,
    filtr: Option<&Filter>,
) -> StoreResult<u64> {
    let mut qb = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM ");
    qb.push(ident::quote(table)?);
    if let Some(filtr) = filtr {
        push_where(&mut qb, filtr)?;
    }
    let count: i64 = qb.build_query_scalar().fetch_one(&mut *conn).await?;
    Ok(count as u64)
}

pub(crate) async fn column_names_on(
    conn: &mut SqliteConnection,
    table: &str,
) -> StoreResult<Vec<String>> {
    let names = sqlx::query_scalar("SELECT name FROM pragma_table_info(?) ORDER BY cid")
        .bind(table)
        .fetch_all(&mut *conn)
        .await?;
    Ok(names)
}

pub(crate) async fn tables_with_column_on(
    conn: &mut SqliteConnection,
    col: &str,
) -> StoreResult<Vec<String>> {
    let names = sqlx::query_scalar(
        r#"
        SELECT m.name
        FROM sqlite_master AS m
        JOIN pragma_table_info(m.name) AS p
        WHERE m.type = 'table'
          AND m.name NOT LIKE 'sqlite_%'
          AND p.name = ?
        ORDER BY m.name
        "#,
    )
    .bind(col)
    .fetch_all(&mut *conn)
    .await?;
    Ok(names)
}

async fn insert_on(conn: &mut SqliteConnection, table: &str, values: &Record) -> StoreResult<()> {
    let mut qb = QueryBuilder::<Sqlite>::new("INSERT INTO ");
    qb.push(ident::quote(table)?)
        .push(" (")
        .push(ident::quote_list(values.columns())?)
        .push(") VALUES (");
    for (idx, value) in values.values().iter().enumerate() {
        if idx > 0 {
            qb.push(", ");
        }
        push_bind_value(&mut qb, value);
    }
    qb.push(")");
    qb.build().execute(&mut *conn).await?;
    Ok(())
}

async fn update_on(
    conn: &mut SqliteConnection,
    table: &str,
    assignment: &Assignment,
    filtr: Option<&Filter>,
) -> StoreResult<u64> {
    let mut qb = QueryBuilder::<Sqlite>::new("UPDATE ");
    qb.push(ident::quote(table)?)
        .push(" SET ")
        .push(ident::quote(&assignment.col)?)
        .push(" = ");
    push_bind_value(&mut qb, &assignment.val);
    if let Some(filtr) = filtr {
        push_where(&mut qb, filtr)?;
    }
    let result = qb.build().execute(&mut *conn).await?;
    Ok(result.rows_affected())
}

pub(crate) fn push_where(qb: &mut QueryBuilder<'_, Sqlite>, filtr: &Filter) -> StoreResult<()> {
    let col = ident::quote(&filtr.col)?;
    qb.push(" WHERE ");
    match &filtr.val {
        FilterValue::One(Value::Null) => {
            qb.push(col).push(" IS NULL");
        }
        FilterValue::One(value) => {
            qb.push(col).push(" = ");
            push_bind_value(qb, value);
        }
        FilterValue::Many(values) if values.is_empty() => {
            qb.push("0");
        }
        FilterValue::Many(values) => {
            qb.push(col).push(" IN (");
            for (idx, value) in values.iter().enumerate() {
                if idx > 0 {
                    qb.push(", ");
                }
                push_bind_value(qb, value);
            }
            qb.push(")");
        }
    }
    Ok(())
}

pub(crate) fn push_bind_value(qb: &mut QueryBuilder<'_, Sqlite>, value: &Value) {
    match value {
        Value::Null => {
            qb.push_bind(None::<String>);
        }
        Value::Boolean(flag) => {
            qb.push_bind(i64::from(*flag));
        }
        Value::Integer(number) => {
            qb.push_bind(*number);
        }
        Value::Float(number) => {
            qb.push_bind(*number);
        }
        Value::Text(text) => {
            qb.push_bind(text.clone());
        }
        Value::List(_) | Value::Mapping(_) => {
            qb.push_bind(serialize(value));
        }
    }
}

fn bind_value<'q>(
    query: Query<'q, Sqlite, SqliteArguments<'q>>,
    value: &Value,
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    match value {
        Value::Null => query.bind(None::<String>),
        Value::Boolean(flag) => query.bind(i64::from(*flag)),
        Value::Integer(number) => query.bind(*number),
        Value::Float(number) => query.bind(*number),
        Value::Text(text) => query.bind(text.clone()),
        Value::List(_) | Value::Mapping(_) => query.bind(serialize(value)),
    }
}

/// Reads column `idx` using the storage class of the value itself.
pub(crate) fn decode_column(row: &SqliteRow, idx: usize) -> StoreResult<Value> {
    let raw = row.try_get_raw(idx)?;
    if raw.is_null() {
        return Ok(Value::Null);
    }
    let storage_class = raw.type_info().name().to_owned();

    let value = match storage_class.as_str() {
        "INTEGER" | "BOOLEAN" => Value::Integer(row.try_get_unchecked::<i64, _>(idx)?),
        "REAL" => Value::Float(row.try_get_unchecked::<f64, _>(idx)?),
        "BLOB" => {
            let bytes = row.try_get_unchecked::<Vec<u8>, _>(idx)?;
            Value::Text(String::from_utf8_lossy(&bytes).into_owned())
        }
        _ => Value::Text(row.try_get_unchecked::<String, _>(idx)?),
    };
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn setup_handler() -> (TempDir, Handler) {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig::with_root(dir.path().join("db"));
        let handler = Handler::open(&config, "test").await.unwrap();
        (dir, handler)
    }

    async fn credentials(handler: &Handler) {
        handler
            .create_table("credentials", &["id", "username", "password", "first_name"])
            .await
            .unwrap();
    }

    fn user(id: &str, username: &str) -> Record {
        Record::new()
            .with("id", id)
            .with("username", username)
            .with("password", "hash")
            .with("first_name", "A")
    }

    #[tokio::test]
    async fn create_table_is_idempotent() {
        let (_dir, handler) = setup_handler().await;
        assert!(handler.create_table("t", &["a", "b"]).await.unwrap());
        assert!(!handler.create_table("t", &["a", "b"]).await.unwrap());
        assert!(handler.table_exists("t").await.unwrap());
        assert_eq!(handler.column_names("t").await.unwrap(), ["a", "b"]);
        assert_eq!(handler.name(), "test.db");
    }

    #[tokio::test]
    async fn insert_then_exists_and_duplicate_is_rejected() {
        let (_dir, handler) = setup_handler().await;
        credentials(&handler).await;
        let validate = Filter::eq("username", "a@example.com");

        handler
            .insert("credentials", &user("u1", "a@example.com"), Some(&validate))
            .await
            .unwrap();
        assert!(handler.record_exists("credentials", &validate).await.unwrap());

        let err = handler
            .insert("credentials", &user("u2", "a@example.com"), Some(&validate))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::DuplicateRecord { .. }));
        assert_eq!(handler.row_count("credentials", None).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn insert_rejects_mismatched_columns() {
        let (_dir, handler) = setup_handler().await;
        credentials(&handler).await;

        let reordered = Record::new()
            .with("username", "a@example.com")
            .with("id", "u1")
            .with("password", "hash")
            .with("first_name", "A");
        let missing = Record::new().with("id", "u1");

        for record in [reordered, missing] {
            match handler.insert("credentials", &record, None).await {
                Err(StoreError::SchemaMismatch { expected, .. }) => {
                    assert_eq!(expected, ["id", "username", "password", "first_name"]);
                }
                other => panic!("expected schema mismatch, got {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn update_requires_exactly_one_row() {
        let (_dir, handler) = setup_handler().await;
        credentials(&handler).await;
        handler.insert("credentials", &user("u1", "a@x.io"), None).await.unwrap();
        handler.insert("credentials", &user("u2", "b@x.io"), None).await.unwrap();

        let rename = Assignment::new("first_name", "Bea");
        let err = handler
            .update("credentials", &rename, &Filter::eq("id", "nobody"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Cardinality { found: 0, .. }));

        let err = handler
            .update("credentials", &rename, &Filter::eq("password", "hash"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Cardinality { found: 2, .. }));

        handler
            .update("credentials", &rename, &Filter::eq("id", "u2"))
            .await
            .unwrap();
        let name = handler
            .select_value("credentials", "first_name", &Filter::eq("id", "u2"), ValueKind::String)
            .await
            .unwrap();
        assert_eq!(name, Value::Text("Bea".into()));
    }

    #[tokio::test]
    async fn reset_column_touches_every_match() {
        let (_dir, handler) = setup_handler().await;
        credentials(&handler).await;
        for (id, name) in [("u1", "a@x.io"), ("u2", "b@x.io"), ("u3", "c@x.io")] {
            handler.insert("credentials", &user(id, name), None).await.unwrap();
        }

        let affected = handler
            .reset_column(
                "credentials",
                &Assignment::new("first_name", "Z"),
                Some(&Filter::any_of("id", ["u1", "u3"])),
            )
            .await
            .unwrap();
        assert_eq!(affected, 2);

        let all = handler
            .reset_column("credentials", &Assignment::new("password", "reset"), None)
            .await
            .unwrap();
        assert_eq!(all, 3);
    }

    #[tokio::test]
    async fn select_value_cardinality_and_ordering() {
        let (_dir, handler) = setup_handler().await;
        handler.create_table("runs", &["session", "version"]).await.unwrap();
        for version in [2_i64, 10, 1] {
            let row = Record::new().with("session", "s1").with("version", version);
            handler.insert("runs", &row, None).await.unwrap();
        }
        let filtr = Filter::eq("session", "s1");

        let err = handler
            .select_value("runs", "version", &filtr, ValueKind::Integer)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Cardinality { found: 3, .. }));

        let asc = handler
            .select_values("runs", "version", &filtr, ValueKind::Integer, SortOrder::Ascending)
            .await
            .unwrap();
        assert_eq!(asc, [Value::Integer(1), Value::Integer(2), Value::Integer(10)]);

        let desc = handler
            .select_values("runs", "version", &filtr, ValueKind::Integer, SortOrder::Descending)
            .await
            .unwrap();
        assert_eq!(desc[0], Value::Integer(10));

        let single = handler
            .select_values(
                "runs",
                "version",
                &Filter::eq("version", 10_i64),
                ValueKind::String,
                SortOrder::Ascending,
            )
            .await
            .unwrap();
        assert_eq!(single, [Value::Text("10".into())]);

        let err = handler
            .select_value("runs", "version", &Filter::eq("session", "s9"), ValueKind::Integer)
            .await
            .unwrap_err();
        assert!(err.is_empty_result());
    }

    #[tokio::test]
    async fn select_row_returns_one_record() {
        let (_dir, handler) = setup_handler().await;
        credentials(&handler).await;
        handler.insert("credentials", &user("u1", "a@x.io"), None).await.unwrap();
        handler.insert("credentials", &user("u2", "b@x.io"), None).await.unwrap();

        let row = handler
            .select_row("credentials", &["first_name", "id"], &Filter::eq("id", "u2"))
            .await
            .unwrap();
        assert_eq!(row.columns(), ["first_name", "id"]);
        assert_eq!(row.get("id"), Some(&Value::Text("u2".into())));

        let err = handler
            .select_row("credentials", &["id"], &Filter::eq("first_name", "A"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Cardinality { found: 2, .. }));

        let err = handler
            .select_row("credentials", &["id"], &Filter::eq("id", "nope"))
            .await
            .unwrap_err();
        assert!(err.is_empty_result());
    }

    #[tokio::test]
    async fn select_scalar_binds_parameters() {
        let (_dir, handler) = setup_handler().await;
        handler.create_table("data", &["session", "version"]).await.unwrap();
        for (session, version) in [("s1", 1_i64), ("s1", 4), ("s2", 9)] {
            let row = Record::new().with("session", session).with("version", version);
            handler.insert("data", &row, None).await.unwrap();
        }

        let max = handler
            .select_scalar(
                "SELECT MAX(version) FROM data WHERE session = ?",
                &[Value::from("s1")],
                ValueKind::Integer,
            )
            .await
            .unwrap();
        assert_eq!(max, Value::Integer(4));

        let hostile = handler
            .select_scalar(
                "SELECT MAX(version) FROM data WHERE session = ?",
                &[Value::from("s1' OR '1'='1")],
                ValueKind::Integer,
            )
            .await
            .unwrap_err();
        assert!(hostile.is_empty_result());

        let err = handler
            .select_scalar("SELECT version FROM data", &[], ValueKind::Integer)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Cardinality { found: 3, .. }));
    }

    #[tokio::test]
    async fn delete_batch_is_atomic() {
        let (_dir, handler) = setup_handler().await;
        handler.create_table("a", &["k"]).await.unwrap();
        handler.insert("a", &Record::new().with("k", "1"), None).await.unwrap();

        let err = handler
            .delete_batch(&[
                DeleteTarget::new("a", Filter::eq("k", "1")),
                DeleteTarget::new("missing", Filter::eq("k", "1")),
            ])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Sqlx(_)));
        assert_eq!(handler.row_count("a", None).await.unwrap(), 1);

        let affected = handler
            .delete_batch(&[DeleteTarget::new("a", Filter::any_of("k", ["1", "2"]))])
            .await
            .unwrap();
        assert_eq!(affected, 1);
    }

    #[tokio::test]
    async fn drop_table_fails_loudly_when_missing() {
        let (_dir, handler) = setup_handler().await;
        handler.create_table("t", &["a"]).await.unwrap();
        handler.drop_table("t").await.unwrap();
        assert!(!handler.table_exists("t").await.unwrap());
        assert!(matches!(
            handler.drop_table("t").await,
            Err(StoreError::MissingTable { .. })
        ));
        assert!(!handler.drop_table_if_exists("t").await.unwrap());
    }

    #[tokio::test]
    async fn tables_with_column_introspects_schema() {
        let (_dir, handler) = setup_handler().await;
        handler.create_table("sessions", &["user_id", "session_id"]).await.unwrap();
        handler.create_table("credentials", &["user_id", "username"]).await.unwrap();
        handler.create_table("other", &["x"]).await.unwrap();

        assert_eq!(
            handler.tables_with_column("user_id").await.unwrap(),
            ["credentials", "sessions"]
        );
        assert!(handler.tables_with_column("nope").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn typed_schema_round_trips_booleans_and_json() {
        use crate::schema::ColumnDef;

        let (_dir, handler) = setup_handler().await;
        let schema = TableSchema::new(
            "meta",
            vec![
                ColumnDef::text("id").primary_key(),
                ColumnDef::new("final", ValueKind::Boolean),
                ColumnDef::new("columns", ValueKind::List),
            ],
        );
        handler.create_table_with_schema(&schema).await.unwrap();
        let row = Record::new()
            .with("id", "d1")
            .with("final", true)
            .with("columns", Value::List(vec!["a".into(), "b".into()]));
        handler.insert("meta", &row, None).await.unwrap();

        let filtr = Filter::eq("id", "d1");
        assert_eq!(
            handler.select_value("meta", "final", &filtr, ValueKind::Boolean).await.unwrap(),
            Value::Boolean(true)
        );
        assert_eq!(
            handler.select_value("meta", "columns", &filtr, ValueKind::List).await.unwrap(),
            Value::List(vec!["a".into(), "b".into()])
        );
        assert!(matches!(
            handler.select_value("meta", "columns", &filtr, ValueKind::Integer).await,
            Err(StoreError::Conversion { .. })
        ));
    }
}
