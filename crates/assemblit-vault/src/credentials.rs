//! User accounts stored in the `credentials` table of the users database.

use std::sync::Arc;

use argon2::{
    password_hash::{self, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use assemblit_db::{
    md5_hex, tables, Assignment, CascadeOutcome, ColumnDef, Filter, Handler, Hierarchy, Record,
    StoreError, StoreRegistry, TableSchema, Value, USERS_LEVEL,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::{
    email::{normalize, normalize_deliverable, DeliverabilityProbe},
    error::{AuthError, AuthResult},
    status::StatusReport,
};

/// Who a successful log-in belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Identity {
    pub display_name: String,
    pub user_id: String,
}

/// Account-settings form. Every present field is applied.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SettingsForm {
    pub change_username: Option<String>,
    pub change_password0: Option<String>,
    pub change_password1: Option<String>,
    #[serde(default)]
    pub delete_account: bool,
}

#[derive(Clone)]
pub struct CredentialStore {
    users: Handler,
    user_index: String,
    hierarchy: Hierarchy,
    probe: Arc<dyn DeliverabilityProbe>,
}

impl CredentialStore {
    /// Opens the configured stores and creates the credentials table if missing.
    pub async fn open(
        registry: &StoreRegistry,
        probe: Arc<dyn DeliverabilityProbe>,
    ) -> AuthResult<Self> {
        let hierarchy = Hierarchy::open(registry).await?;
        let tier = hierarchy.tier(USERS_LEVEL)?;
        let store = Self {
            users: tier.handler.clone(),
            user_index: tier.query_index.clone(),
            hierarchy,
            probe,
        };
        store
            .users
            .create_table_with_schema(&credentials_schema(&store.user_index))
            .await?;
        Ok(store)
    }

    pub fn users(&self) -> &Handler {
        &self.users
    }

    /// Checks a username/password pair.
    #[instrument(skip(self, password))]
    pub async fn authenticate(&self, username: &str, password: &str) -> AuthResult<Identity> {
        let username = normalize(username)?;
        let password = password.trim();

        let columns = ["password", "first_name", self.user_index.as_str()];
        let row = match self
            .users
            .select_row(tables::CREDENTIALS, &columns, &Filter::eq("username", &username))
            .await
        {
            Ok(row) => row,
            Err(err) if err.is_empty_result() => return Err(AuthError::UserNotFound(username)),
            Err(err) => return Err(err.into()),
        };

        let stored = text(&row, "password");
        if !verify_password(password, &stored)? {
            warn!(username = %username, "password mismatch");
            return Err(AuthError::IncorrectPassword);
        }

        Ok(Identity {
            display_name: text(&row, "first_name"),
            user_id: text(&row, &self.user_index),
        })
    }

    /// Creates an account and returns its identity.
    #[instrument(skip(self, first_name, password, password_confirm))]
    pub async fn register(
        &self,
        first_name: &str,
        username: &str,
        password: &str,
        password_confirm: &str,
    ) -> AuthResult<Identity> {
        let first_name = first_name.trim();
        let username = normalize_deliverable(username, self.probe.as_ref()).await?;
        let password = password.trim();
        if password != password_confirm.trim() {
            return Err(AuthError::PasswordMismatch);
        }

        let user_id = md5_hex(&format!("{}{}", Utc::now().to_rfc3339(), username));
        let row = Record::new()
            .with(self.user_index.as_str(), &user_id)
            .with("username", &username)
            .with("password", hash_password(password)?)
            .with("first_name", first_name);

        match self
            .users
            .insert(
                tables::CREDENTIALS,
                &row,
                Some(&Filter::eq("username", &username)),
            )
            .await
        {
            Ok(()) => {}
            Err(StoreError::DuplicateRecord { .. }) => return Err(AuthError::UserAlreadyExists),
            Err(err) => return Err(err.into()),
        }

        info!(user_id = %user_id, "user registered");
        Ok(Identity {
            display_name: first_name.to_owned(),
            user_id,
        })
    }

    /// Replaces the username of `user_id`. Returns the normalised new username.
    #[instrument(skip(self))]
    pub async fn change_username(&self, user_id: &str, username: &str) -> AuthResult<String> {
        let username = normalize_deliverable(username, self.probe.as_ref()).await?;
        if self
            .users
            .record_exists(tables::CREDENTIALS, &Filter::eq("username", &username))
            .await?
        {
            return Err(AuthError::UserAlreadyExists);
        }

        self.update_own_row(user_id, Assignment::new("username", &username))
            .await?;
        info!(user_id, "username changed");
        Ok(username)
    }

    #[instrument(skip(self, password, password_confirm))]
    pub async fn change_password(
        &self,
        user_id: &str,
        password: &str,
        password_confirm: &str,
    ) -> AuthResult<()> {
        let password = password.trim();
        if password != password_confirm.trim() {
            return Err(AuthError::PasswordMismatch);
        }

        self.update_own_row(user_id, Assignment::new("password", hash_password(password)?))
            .await?;
        info!(user_id, "password changed");
        Ok(())
    }

    /// Deletes the account with every session and dataset it solely owns.
    #[instrument(skip(self))]
    pub async fn delete_account(&self, user_id: &str) -> AuthResult<CascadeOutcome> {
        let outcome = self
            .hierarchy
            .delete_level(USERS_LEVEL, &[Value::from(user_id)])
            .await?;
        info!(user_id, rows = outcome.rows_deleted, "account deleted");
        Ok(outcome)
    }

    /// Applies a settings form, reporting request errors instead of failing.
    ///
    /// Storage and hashing faults still return `Err`.
    pub async fn apply_settings(
        &self,
        user_id: &str,
        form: &SettingsForm,
    ) -> AuthResult<StatusReport> {
        let mut report = StatusReport::new();

        if let Some(username) = &form.change_username {
            match self.change_username(user_id, username).await {
                Ok(username) => report.success(format!("Username successfully changed to {username}.")),
                Err(err) if err.is_user_facing() => report.error(err.to_string()),
                Err(err) => return Err(err),
            }
        }

        match (&form.change_password0, &form.change_password1) {
            (Some(password), Some(confirm)) => {
                match self.change_password(user_id, password, confirm).await {
                    Ok(()) => report.success("Password successfully changed."),
                    Err(err) if err.is_user_facing() => report.error(err.to_string()),
                    Err(err) => return Err(err),
                }
            }
            (None, None) => {}
            _ => report.warning("Enter the new password twice to change it."),
        }

        if form.delete_account {
            let outcome = self.delete_account(user_id).await?;
            report.info(format!(
                "Account deleted ({} records removed).",
                outcome.rows_deleted
            ));
        }

        Ok(report)
    }

    async fn update_own_row(&self, user_id: &str, assignment: Assignment) -> AuthResult<()> {
        let filtr = Filter::eq(self.user_index.as_str(), user_id);
        match self
            .users
            .update(tables::CREDENTIALS, &assignment, &filtr)
            .await
        {
            Ok(()) => Ok(()),
            Err(StoreError::Cardinality { found: 0, .. }) => {
                Err(AuthError::UserNotFound(user_id.to_owned()))
            }
            Err(err) => Err(err.into()),
        }
    }
}

/// `credentials(user_id, username, password, first_name)`.
pub fn credentials_schema(user_index: &str) -> TableSchema {
    TableSchema::new(
        tables::CREDENTIALS,
        vec![
            ColumnDef::text(user_index).primary_key(),
            ColumnDef::text("username").unique(),
            ColumnDef::text("password"),
            ColumnDef::text("first_name"),
        ],
    )
}

/// Argon2id PHC string for `password` with a fresh random salt.
pub fn hash_password(password: &str) -> AuthResult<String> {
    let salt = SaltString::generate(&mut rand::thread_rng());
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|err| AuthError::Hash(err.to_string()))
}

fn verify_password(password: &str, stored: &str) -> AuthResult<bool> {
    let parsed = PasswordHash::new(stored).map_err(|err| AuthError::Hash(err.to_string()))?;
    match Argon2::default().verify_password(password.as_bytes(), &parsed) {
        Ok(()) => Ok(true),
        Err(password_hash::Error::Password) => Ok(false),
        Err(err) => Err(AuthError::Hash(err.to_string())),
    }
}

fn text(row: &Record, col: &str) -> String {
    row.get(col).cloned().map(Value::into_text).unwrap_or_default()
}
