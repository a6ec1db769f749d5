//! Entity kinds known to the sync core.
//!
//! A kind is a named entity type ("invoice", "budget", ...) backed by its own
//! table. All kinds share the versioned-record row shape; only the payload
//! differs.

use serde::{Deserialize, Serialize};

/// Describes one entity kind and how it is stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KindSpec {
    /// Name used on the wire and in URLs.
    pub name: String,
    /// Backing table. Defaults to the kind name.
    #[serde(default)]
    pub table: Option<String>,
    /// Payload fields removed from snapshot responses.
    #[serde(default)]
    pub heavy_fields: Vec<String>,
    /// Payload field holding a tenant-unique reference (e.g. an invoice number).
    #[serde(default)]
    pub natural_key: Option<String>,
}

impl KindSpec {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            table: None,
            heavy_fields: Vec::new(),
            natural_key: None,
        }
    }

    pub fn with_table(mut self, table: &str) -> Self {
        self.table = Some(table.to_string());
        self
    }

    pub fn with_heavy_fields(mut self, fields: &[&str]) -> Self {
        self.heavy_fields = fields.iter().map(|f| f.to_string()).collect();
        self
    }

    pub fn with_natural_key(mut self, field: &str) -> Self {
        self.natural_key = Some(field.to_string());
        self
    }

    /// Returns the backing table name.
    pub fn table(&self) -> &str {
        self.table.as_deref().unwrap_or(&self.name)
    }

    /// Extracts the natural key from a payload, if this kind has one and the
    /// payload carries it as a non-empty scalar.
    pub fn natural_key_of(&self, payload: &serde_json::Value) -> Option<String> {
        let field = self.natural_key.as_deref()?;
        match payload.get(field)? {
            serde_json::Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
            serde_json::Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }
}

/// Errors building a kind registry.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum KindError {
    #[error("invalid table name '{0}': use lowercase letters, digits and underscores")]
    InvalidTable(String),
    #[error("duplicate kind '{0}'")]
    Duplicate(String),
}

/// The set of registered kinds, in declaration order.
#[derive(Debug, Clone)]
pub struct KindRegistry {
    kinds: Vec<KindSpec>,
}

impl KindRegistry {
    /// Builds a registry, validating table names.
    ///
    /// Table names end up interpolated into SQL, so they must be plain
    /// identifiers.
    pub fn new(kinds: Vec<KindSpec>) -> Result<Self, KindError> {
        let mut seen = std::collections::HashSet::new();
        for kind in &kinds {
            if !is_identifier(kind.table()) {
                return Err(KindError::InvalidTable(kind.table().to_string()));
            }
            if !seen.insert(kind.name.clone()) {
                return Err(KindError::Duplicate(kind.name.clone()));
            }
        }
        Ok(Self { kinds })
    }

    /// Looks up a kind by name (case-insensitive).
    pub fn get(&self, name: &str) -> Option<&KindSpec> {
        let name = name.trim();
        self.kinds.iter().find(|k| k.name.eq_ignore_ascii_case(name))
    }

    pub fn iter(&self) -> impl Iterator<Item = &KindSpec> {
        self.kinds.iter()
    }

    pub fn names(&self) -> Vec<String> {
        self.kinds.iter().map(|k| k.name.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.kinds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.kinds.is_empty()
    }

    /// Resolves an optional requested set of kind names.
    ///
    /// `None` selects every registered kind. Unknown names are returned
    /// separately so callers can log them and carry on.
    pub fn select(&self, requested: Option<&[String]>) -> (Vec<&KindSpec>, Vec<String>) {
        match requested {
            None => (self.kinds.iter().collect(), Vec::new()),
            Some(names) => {
                let mut found = Vec::new();
                let mut unknown = Vec::new();
                for name in names {
                    match self.get(name) {
                        Some(kind) if !found.iter().any(|k: &&KindSpec| k.name == kind.name) => {
                            found.push(kind)
                        }
                        Some(_) => {}
                        None => unknown.push(name.clone()),
                    }
                }
                (found, unknown)
            }
        }
    }
}

impl Default for KindRegistry {
    /// Accounting, property management and procurement kinds.
    fn default() -> Self {
        Self {
            kinds: vec![
                KindSpec::new("invoice")
                    .with_table("invoices")
                    .with_heavy_fields(&["pdf_blob"])
                    .with_natural_key("number"),
                KindSpec::new("payment").with_table("payments"),
                KindSpec::new("budget").with_table("budgets"),
                KindSpec::new("contract")
                    .with_table("contracts")
                    .with_heavy_fields(&["document_blob"]),
                KindSpec::new("property").with_table("properties"),
                KindSpec::new("lease").with_table("leases"),
                KindSpec::new("purchase_order")
                    .with_table("purchase_orders")
                    .with_natural_key("reference"),
                KindSpec::new("supplier").with_table("suppliers"),
            ],
        }
    }
}

/// Parses a comma-separated list of kind names (`entities=a,b,c`).
pub fn parse_kind_list(list: &str) -> Vec<String> {
    list.split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect()
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_lowercase() || c == '_' => {}
        _ => return false,
    }
    name.len() <= 63
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_default_registry_is_valid() {
        let registry = KindRegistry::default();
        let rebuilt = KindRegistry::new(registry.iter().cloned().collect()).unwrap();
        assert_eq!(rebuilt.len(), registry.len());
        assert_eq!(registry.get("invoice").unwrap().table(), "invoices");
        assert_eq!(registry.get("INVOICE").unwrap().name, "invoice");
    }

    #[test]
    fn test_table_defaults_to_name() {
        assert_eq!(KindSpec::new("budget").table(), "budget");
    }

    #[test]
    fn test_invalid_table_rejected() {
        let result = KindRegistry::new(vec![KindSpec::new("x").with_table("bad; DROP TABLE")]);
        assert!(matches!(result, Err(KindError::InvalidTable(_))));

        let result = KindRegistry::new(vec![KindSpec::new("x").with_table("1abc")]);
        assert!(matches!(result, Err(KindError::InvalidTable(_))));
    }

    #[test]
    fn test_duplicate_kind_rejected() {
        let result = KindRegistry::new(vec![KindSpec::new("budget"), KindSpec::new("budget")]);
        assert_eq!(result.unwrap_err(), KindError::Duplicate("budget".to_string()));
    }

    #[test]
    fn test_select_reports_unknown_names() {
        let registry = KindRegistry::default();
        let requested = vec![
            "invoice".to_string(),
            "nope".to_string(),
            "invoice".to_string(),
        ];
        let (found, unknown) = registry.select(Some(&requested));
        assert_eq!(found.len(), 1);
        assert_eq!(unknown, vec!["nope".to_string()]);

        let (all, unknown) = registry.select(None);
        assert_eq!(all.len(), registry.len());
        assert!(unknown.is_empty());
    }

    #[test]
    fn test_natural_key_extraction() {
        let kind = KindSpec::new("invoice").with_natural_key("number");
        assert_eq!(kind.natural_key_of(&json!({"number": " A-7 "})), Some("A-7".to_string()));
        assert_eq!(kind.natural_key_of(&json!({"number": 42})), Some("42".to_string()));
        assert_eq!(kind.natural_key_of(&json!({"number": ""})), None);
        assert_eq!(kind.natural_key_of(&json!({})), None);
        assert_eq!(KindSpec::new("budget").natural_key_of(&json!({"number": "x"})), None);
    }

    #[test]
    fn test_parse_kind_list() {
        assert_eq!(
            parse_kind_list("invoice, budget,,lease "),
            vec!["invoice", "budget", "lease"]
        );
        assert!(parse_kind_list("").is_empty());
    }
}
