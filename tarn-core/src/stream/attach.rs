//! Attach directives for auxiliary databases.

use serde::{Deserialize, Serialize};

/// A database to make visible to a query before it runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachSpec {
    pub db_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default)]
    pub read_only: bool,
    /// A complete statement provided by a trusted layer. Takes precedence
    /// over synthesis so provider-managed credentials never leave that
    /// process.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_sql: Option<String>,
}

impl AttachSpec {
    pub fn new(db_name: impl Into<String>, url: impl Into<String>) -> Self {
        AttachSpec {
            db_name: db_name.into(),
            url: Some(url.into()),
            read_only: false,
            raw_sql: None,
        }
    }

    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    pub fn raw(db_name: impl Into<String>, sql: impl Into<String>) -> Self {
        AttachSpec {
            db_name: db_name.into(),
            url: None,
            read_only: false,
            raw_sql: Some(sql.into()),
        }
    }
}

/// Double-quote an identifier, escaping `"` as `""`.
pub(crate) fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Single-quote a string literal, escaping `'` as `''`.
pub(crate) fn quote_literal(literal: &str) -> String {
    format!("'{}'", literal.replace('\'', "''"))
}

/// Synthesize the statements executed before a stream begins.
pub(crate) fn attach_statements(specs: &[AttachSpec]) -> Vec<String> {
    let mut statements = Vec::new();

    for spec in specs {
        if let Some(raw) = &spec.raw_sql {
            statements.push(raw.clone());
            continue;
        }

        let Some(url) = &spec.url else {
            continue;
        };

        let name = quote_ident(&spec.db_name);
        statements.push(format!("DETACH DATABASE IF EXISTS {name}"));

        let mut attach = format!("ATTACH {} AS {name}", quote_literal(url));
        if spec.read_only {
            attach.push_str(" (READ_ONLY)");
        }
        statements.push(attach);
    }

    statements
}
