//! Tree-structured request and response documents.
//!
//! Commands only need element lookup by qualified name and value coercion; the
//! byte encoding is the codec's business.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

use super::CodecError;

/// Namespaces of the elements the command family reads and writes.
pub mod ns {
    pub const AIRSYNC: &str = "AirSync";
    pub const AIRSYNC_BASE: &str = "AirSyncBase";
    pub const CALENDAR: &str = "Calendar";
    pub const COMPOSE_MAIL: &str = "ComposeMail";
    pub const FOLDER_HIERARCHY: &str = "FolderHierarchy";
    pub const GAL: &str = "GAL";
    pub const ITEM_OPERATIONS: &str = "ItemOperations";
    pub const MEETING_RESPONSE: &str = "MeetingResponse";
    pub const MOVE: &str = "Move";
    pub const PING: &str = "Ping";
    pub const PROVISION: &str = "Provision";
    pub const SEARCH: &str = "Search";
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Element {
    pub ns: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<Element>,
}

impl Element {
    pub fn new(ns: &str, name: &str) -> Self {
        Self {
            ns: ns.to_string(),
            name: name.to_string(),
            text: None,
            children: Vec::new(),
        }
    }

    pub fn leaf(ns: &str, name: &str, text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Self::new(ns, name)
        }
    }

    /// Append a text child.
    pub fn with_leaf(self, ns: &str, name: &str, text: impl Into<String>) -> Self {
        self.with(Element::leaf(ns, name, text))
    }

    /// Append a text child when `text` is present.
    pub fn with_optional_leaf(self, ns: &str, name: &str, text: Option<&str>) -> Self {
        match text {
            Some(text) => self.with_leaf(ns, name, text),
            None => self,
        }
    }

    pub fn with(mut self, child: Element) -> Self {
        self.children.push(child);
        self
    }

    pub fn is(&self, ns: &str, name: &str) -> bool {
        self.ns == ns && self.name == name
    }

    /// First child with this local name in the element's own namespace.
    pub fn child(&self, name: &str) -> Option<&Element> {
        self.child_in(&self.ns, name)
    }

    pub fn child_in(&self, ns: &str, name: &str) -> Option<&Element> {
        self.children.iter().find(|c| c.is(ns, name))
    }

    pub fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Element> + 'a {
        self.children
            .iter()
            .filter(move |c| c.ns == self.ns && c.name == name)
    }

    pub fn child_text(&self, name: &str) -> Option<&str> {
        self.child(name).and_then(|c| c.text.as_deref())
    }

    pub fn child_text_in(&self, ns: &str, name: &str) -> Option<&str> {
        self.child_in(ns, name).and_then(|c| c.text.as_deref())
    }

    pub fn as_u32(&self) -> Result<Option<u32>, CodecError> {
        match self.text.as_deref().map(str::trim) {
            None | Some("") => Ok(None),
            Some(text) => text
                .parse()
                .map(Some)
                .map_err(|_| CodecError::InvalidValue {
                    element: self.name.clone(),
                    value: text.to_string(),
                }),
        }
    }

    pub fn child_u32(&self, name: &str) -> Result<Option<u32>, CodecError> {
        match self.child(name) {
            Some(child) => child.as_u32(),
            None => Ok(None),
        }
    }

    /// Accepts RFC 3339 and the compact `20240102T030405Z` form.
    pub fn as_datetime(&self) -> Result<Option<DateTime<Utc>>, CodecError> {
        let Some(text) = self.text.as_deref().map(str::trim) else {
            return Ok(None);
        };
        if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
            return Ok(Some(dt.with_timezone(&Utc)));
        }
        NaiveDateTime::parse_from_str(text, "%Y%m%dT%H%M%SZ")
            .map(|naive| Some(naive.and_utc()))
            .map_err(|_| CodecError::InvalidValue {
                element: self.name.clone(),
                value: text.to_string(),
            })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    pub root: Element,
}

impl Document {
    pub fn new(root: Element) -> Self {
        Self { root }
    }

    /// The root `Status` element's value, if any.
    pub fn status(&self) -> Result<Option<u32>, CodecError> {
        self.root.child_u32("Status")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn folder_create_response() -> Document {
        Document::new(
            Element::new(ns::FOLDER_HIERARCHY, "FolderCreate")
                .with_leaf(ns::FOLDER_HIERARCHY, "Status", "1")
                .with_leaf(ns::FOLDER_HIERARCHY, "SyncKey", "7")
                .with_leaf(ns::FOLDER_HIERARCHY, "ServerId", "42"),
        )
    }

    #[test]
    fn test_lookup_by_qualified_name() {
        let doc = folder_create_response();
        assert_eq!(doc.status().unwrap(), Some(1));
        assert_eq!(doc.root.child_text("ServerId"), Some("42"));
        assert!(doc.root.child_in(ns::AIRSYNC, "ServerId").is_none());
    }

    #[test]
    fn test_invalid_number_is_an_error() {
        let doc = Document::new(
            Element::new(ns::PING, "Ping").with_leaf(ns::PING, "Status", "one"),
        );
        assert!(matches!(doc.status(), Err(CodecError::InvalidValue { .. })));
    }

    #[test]
    fn test_datetime_forms() {
        let compact = Element::leaf(ns::CALENDAR, "StartTime", "20240102T030405Z");
        let rfc = Element::leaf(ns::CALENDAR, "StartTime", "2024-01-02T03:04:05Z");
        assert_eq!(compact.as_datetime().unwrap(), rfc.as_datetime().unwrap());
        assert!(Element::leaf(ns::CALENDAR, "StartTime", "soon").as_datetime().is_err());
    }

    #[test]
    fn test_children_named() {
        let root = Element::new(ns::MOVE, "MoveItems")
            .with(Element::new(ns::MOVE, "Response"))
            .with(Element::new(ns::MOVE, "Response"))
            .with(Element::new(ns::AIRSYNC, "Response"));
        assert_eq!(root.children_named("Response").count(), 2);
    }
}
