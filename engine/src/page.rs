//! Page requests and fetched pages.

use crate::{Error, Record, Result};
use serde::{Deserialize, Serialize};

/// An offset-based page request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageRequest {
    /// Number of records to skip
    pub offset: u64,
    /// Maximum number of records to return
    pub page_size: u32,
}

impl PageRequest {
    /// Create a page request. `page_size` must be positive.
    pub fn new(offset: u64, page_size: u32) -> Result<Self> {
        if page_size == 0 {
            return Err(Error::InvalidPage("page_size must be positive".into()));
        }
        Ok(Self { offset, page_size })
    }

    /// Number of rows to ask the store for when probing for an exact
    /// `has_more` signal.
    pub fn probe_limit(&self) -> u64 {
        u64::from(self.page_size) + 1
    }
}

/// A page of records, newest first, plus whether more may exist.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Page {
    /// Records in newest-first order
    pub records: Vec<Record>,
    /// Whether the remote collection has records past this page
    pub has_more: bool,
}

impl Page {
    /// Build a page from a result fetched with `limit = page_size + 1`.
    ///
    /// The extra row, if present, only signals that more exist and is
    /// dropped. This never reports `has_more` on an exhausted collection.
    pub fn from_probe(mut records: Vec<Record>, request: &PageRequest) -> Self {
        let page_size = request.page_size as usize;
        let has_more = records.len() > page_size;
        records.truncate(page_size);
        Self { records, has_more }
    }

    /// Build a page from a result fetched with `limit = page_size`, using
    /// page fullness as the `has_more` heuristic.
    pub fn from_full(records: Vec<Record>, request: &PageRequest) -> Self {
        let has_more = records.len() == request.page_size as usize;
        Self { records, has_more }
    }

    /// An empty, final page.
    pub fn empty() -> Self {
        Self {
            records: Vec::new(),
            has_more: false,
        }
    }

    /// Number of records in the page.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the page holds no records.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn records(n: usize) -> Vec<Record> {
        (0..n)
            .map(|i| Record::contact(format!("c-{i}"), 1000 - i as i64, json!({})))
            .collect()
    }

    #[test]
    fn zero_page_size_rejected() {
        assert!(matches!(PageRequest::new(0, 0), Err(Error::InvalidPage(_))));
        assert!(PageRequest::new(40, 20).is_ok());
    }

    #[test]
    fn probe_detects_exact_end() {
        let request = PageRequest::new(0, 3).unwrap();
        assert_eq!(request.probe_limit(), 4);

        // Exactly page_size remain: no more
        let page = Page::from_probe(records(3), &request);
        assert_eq!(page.len(), 3);
        assert!(!page.has_more);

        // One extra row came back: more exist, extra is dropped
        let page = Page::from_probe(records(4), &request);
        assert_eq!(page.len(), 3);
        assert!(page.has_more);
    }

    #[test]
    fn full_page_heuristic() {
        let request = PageRequest::new(0, 3).unwrap();
        assert!(Page::from_full(records(3), &request).has_more);
        assert!(!Page::from_full(records(2), &request).has_more);
    }
}
