use assemblit_db::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("invalid email address: {0}")]
    InvalidEmail(String),
    #[error("user {0} not found")]
    UserNotFound(String),
    #[error("incorrect password")]
    IncorrectPassword,
    #[error("the user already exists")]
    UserAlreadyExists,
    #[error("the passwords do not match")]
    PasswordMismatch,
    #[error("password hashing failed: {0}")]
    Hash(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl AuthError {
    /// Errors caused by the request itself, safe to show to the user.
    pub fn is_user_facing(&self) -> bool {
        !matches!(self, AuthError::Hash(_) | AuthError::Store(_))
    }
}

pub type AuthResult<T> = Result<T, AuthError>;
