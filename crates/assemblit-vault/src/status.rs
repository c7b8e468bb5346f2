use serde::Serialize;

/// Messages collected while handling one request, grouped by severity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatusReport {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub successes: Vec<String>,
    pub infos: Vec<String>,
}

impl StatusReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn error(&mut self, message: impl Into<String>) {
        self.errors.push(message.into());
    }

    pub fn warning(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }

    pub fn success(&mut self, message: impl Into<String>) {
        self.successes.push(message.into());
    }

    pub fn info(&mut self, message: impl Into<String>) {
        self.infos.push(message.into());
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }
}
