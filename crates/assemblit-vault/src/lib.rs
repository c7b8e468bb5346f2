//! Credential vault for assemblit users.
//!
//! Accounts live in the users database next to their session edges, so
//! deleting an account goes through the same cascade as any other subtree.

pub mod credentials;
pub mod email;
pub mod error;
pub mod status;

pub use credentials::{credentials_schema, hash_password, CredentialStore, Identity, SettingsForm};
pub use email::{DeliverabilityProbe, DnsProbe, StaticProbe};
pub use error::{AuthError, AuthResult};
pub use status::StatusReport;
