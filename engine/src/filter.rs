//! List filters and scopes.
//!
//! A [`ListScope`] names one logical collection: an entity kind plus a
//! [`ListFilter`]. Every canonical list, page request and change
//! subscription is bound to exactly one scope.

use crate::{EntityKind, Error, Record, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Equality predicates plus an optional free-text search.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListFilter {
    /// Field name -> required value
    #[serde(default)]
    pub equals: BTreeMap<String, serde_json::Value>,
    /// Case-insensitive substring match on the kind's search field
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub search: Option<String>,
}

impl ListFilter {
    /// A filter that matches everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder: require `field == value`.
    pub fn with_eq(mut self, field: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.equals.insert(field.into(), value.into());
        self
    }

    /// Builder: set the search term. Blank terms clear the search.
    pub fn with_search(mut self, term: impl Into<String>) -> Self {
        let term = term.into();
        let trimmed = term.trim();
        self.search = if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        };
        self
    }

    /// Parse a `field=value` pair. The value is read as JSON when it parses,
    /// otherwise it is taken as a plain string.
    pub fn parse_pair(pair: &str) -> Result<(String, serde_json::Value)> {
        let (field, raw) = pair
            .split_once('=')
            .ok_or_else(|| Error::InvalidFilter(format!("expected field=value, got '{pair}'")))?;
        let field = field.trim();
        if field.is_empty() {
            return Err(Error::InvalidFilter(format!("empty field name in '{pair}'")));
        }
        let value = serde_json::from_str(raw.trim())
            .unwrap_or_else(|_| serde_json::Value::String(raw.trim().to_string()));
        Ok((field.to_string(), value))
    }

    /// Check field names are usable.
    pub fn validate(&self) -> Result<()> {
        if let Some(field) = self.equals.keys().find(|f| f.trim().is_empty()) {
            return Err(Error::InvalidFilter(format!("empty field name '{field}'")));
        }
        Ok(())
    }

    /// The equality predicates as a JSON object (for containment queries).
    pub fn containment(&self) -> serde_json::Value {
        serde_json::Value::Object(
            self.equals
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        )
    }

    /// Whether a record belongs to the filtered collection.
    pub fn matches(&self, kind: EntityKind, record: &Record) -> bool {
        if record.kind != kind {
            return false;
        }

        let equal = self
            .equals
            .iter()
            .all(|(field, value)| record.field(field) == Some(value));
        if !equal {
            return false;
        }

        match &self.search {
            None => true,
            Some(term) => record
                .field(kind.search_field())
                .and_then(|v| v.as_str())
                .map(|text| text.to_lowercase().contains(&term.to_lowercase()))
                .unwrap_or(false),
        }
    }
}

impl fmt::Display for ListFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (field, value) in &self.equals {
            if !first {
                f.write_str(",")?;
            }
            first = false;
            match value {
                serde_json::Value::String(s) => write!(f, "{field}={s}")?,
                other => write!(f, "{field}={other}")?,
            }
        }
        if let Some(term) = &self.search {
            if !first {
                f.write_str(",")?;
            }
            write!(f, "search~{term}")?;
        }
        Ok(())
    }
}

/// One logical collection: an entity kind under a filter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListScope {
    /// Entity kind
    pub kind: EntityKind,
    /// Filter predicate
    pub filter: ListFilter,
}

impl ListScope {
    /// Create a new scope.
    pub fn new(kind: EntityKind, filter: ListFilter) -> Self {
        Self { kind, filter }
    }

    /// Whether a record belongs to this scope.
    pub fn matches(&self, record: &Record) -> bool {
        self.filter.matches(self.kind, record)
    }
}

impl fmt::Display for ListScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.kind, self.filter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn alice() -> Record {
        Record::contact(
            "c-1",
            100,
            json!({"name": "Alice Martin", "org_id": "A", "status": "lead"}),
        )
    }

    #[test]
    fn empty_filter_matches_kind() {
        let filter = ListFilter::new();
        assert!(filter.matches(EntityKind::Contact, &alice()));
        assert!(!filter.matches(EntityKind::Message, &alice()));
    }

    #[test]
    fn equality_predicates() {
        let org_a = ListFilter::new().with_eq("org_id", "A");
        let org_b = ListFilter::new().with_eq("org_id", "B");

        assert!(org_a.matches(EntityKind::Contact, &alice()));
        assert!(!org_b.matches(EntityKind::Contact, &alice()));
    }

    #[test]
    fn search_is_case_insensitive() {
        let filter = ListFilter::new().with_search("martin");
        assert!(filter.matches(EntityKind::Contact, &alice()));

        let filter = ListFilter::new().with_search("bob");
        assert!(!filter.matches(EntityKind::Contact, &alice()));
    }

    #[test]
    fn blank_search_is_cleared() {
        let filter = ListFilter::new().with_search("   ");
        assert!(filter.search.is_none());
    }

    #[test]
    fn parse_pairs() {
        let (field, value) = ListFilter::parse_pair("org_id=A").unwrap();
        assert_eq!(field, "org_id");
        assert_eq!(value, json!("A"));

        let (_, value) = ListFilter::parse_pair("archived=false").unwrap();
        assert_eq!(value, json!(false));

        assert!(ListFilter::parse_pair("no-equals").is_err());
        assert!(ListFilter::parse_pair("=x").is_err());
    }

    #[test]
    fn containment_object() {
        let filter = ListFilter::new().with_eq("org_id", "A").with_eq("status", "lead");
        assert_eq!(filter.containment(), json!({"org_id": "A", "status": "lead"}));
    }

    #[test]
    fn scope_display() {
        let scope = ListScope::new(
            EntityKind::Contact,
            ListFilter::new().with_eq("org_id", "A").with_search("al"),
        );
        assert_eq!(scope.to_string(), "contact[org_id=A,search~al]");
    }
}
