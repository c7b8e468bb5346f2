//! Email usernames: syntax, normalisation and deliverability.

use std::time::Duration;

use async_trait::async_trait;
use tokio::{net::lookup_host, time::timeout};
use tracing::debug;

use crate::error::{AuthError, AuthResult};

const MAX_LOCAL_LEN: usize = 64;
const MAX_DOMAIN_LEN: usize = 253;
const MAX_LABEL_LEN: usize = 63;
const LOCAL_SPECIALS: &str = "!#$%&'*+/=?^_`{|}~.-";

/// Decides whether a domain can receive mail.
#[async_trait]
pub trait DeliverabilityProbe: Send + Sync {
    async fn accepts_mail(&self, domain: &str) -> bool;
}

/// Resolves the domain through the system resolver.
#[derive(Debug, Clone)]
pub struct DnsProbe {
    timeout: Duration,
}

impl Default for DnsProbe {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
        }
    }
}

#[async_trait]
impl DeliverabilityProbe for DnsProbe {
    async fn accepts_mail(&self, domain: &str) -> bool {
        match timeout(self.timeout, lookup_host((domain, 25))).await {
            Ok(Ok(mut addrs)) => addrs.next().is_some(),
            Ok(Err(error)) => {
                debug!(domain, %error, "domain did not resolve");
                false
            }
            Err(_) => {
                debug!(domain, "domain lookup timed out");
                false
            }
        }
    }
}

/// Gives the same answer for every domain.
#[derive(Debug, Clone, Copy)]
pub struct StaticProbe(pub bool);

#[async_trait]
impl DeliverabilityProbe for StaticProbe {
    async fn accepts_mail(&self, _domain: &str) -> bool {
        self.0
    }
}

/// Validates `raw` and returns it trimmed, with the domain lower-cased.
pub fn normalize(raw: &str) -> AuthResult<String> {
    let raw = raw.trim();
    let invalid = |reason: &str| AuthError::InvalidEmail(format!("{raw}: {reason}"));

    let (local, domain) = raw
        .rsplit_once('@')
        .ok_or_else(|| invalid("missing @ sign"))?;

    if local.is_empty() || local.len() > MAX_LOCAL_LEN {
        return Err(invalid("bad local part length"));
    }
    if local.starts_with('.') || local.ends_with('.') || local.contains("..") {
        return Err(invalid("misplaced dot in local part"));
    }
    if !local
        .chars()
        .all(|ch| ch.is_ascii_alphanumeric() || LOCAL_SPECIALS.contains(ch))
    {
        return Err(invalid("unexpected character in local part"));
    }

    let domain = domain.to_ascii_lowercase();
    if domain.is_empty() || domain.len() > MAX_DOMAIN_LEN {
        return Err(invalid("bad domain length"));
    }
    let labels: Vec<&str> = domain.split('.').collect();
    if labels.len() < 2 {
        return Err(invalid("domain needs a top-level part"));
    }
    for label in &labels {
        let valid = !label.is_empty()
            && label.len() <= MAX_LABEL_LEN
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label.chars().all(|ch| ch.is_ascii_alphanumeric() || ch == '-');
        if !valid {
            return Err(invalid("malformed domain label"));
        }
    }
    if labels
        .last()
        .is_some_and(|tld| tld.chars().all(|ch| ch.is_ascii_digit()))
    {
        return Err(invalid("numeric top-level domain"));
    }

    Ok(format!("{local}@{domain}"))
}

/// [`normalize`], then asks `probe` whether the domain accepts mail.
pub async fn normalize_deliverable(
    raw: &str,
    probe: &dyn DeliverabilityProbe,
) -> AuthResult<String> {
    let email = normalize(raw)?;
    let domain = email.rsplit_once('@').map(|(_, d)| d).unwrap_or_default();
    if !probe.accepts_mail(domain).await {
        return Err(AuthError::InvalidEmail(format!(
            "{email}: the domain {domain} does not accept email"
        )));
    }
    Ok(email)
}
