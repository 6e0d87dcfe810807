//! Typed mutations recorded in the queue.
//!
//! On disk an action is a tag (`<namespace>.<verb>`) plus a JSON payload. In
//! memory it is an [`Action`], validated against a [`Catalog`] before it is
//! ever persisted, so malformed payloads never reach the queue.

use std::fmt;

use serde_json::{Map, Value};
use thiserror::Error;

use crate::catalog::{Catalog, ChildMode};

/// A JSON object: the payload of a single row.
pub type Document = Map<String, Value>;

/// Field carrying a row's primary id.
pub const ID_FIELD: &str = "id";

/// The four shapes of remote mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionKind {
    Insert,
    Upsert,
    Update,
    Delete,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::Insert => "insert",
            ActionKind::Upsert => "upsert",
            ActionKind::Update => "update",
            ActionKind::Delete => "delete",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "insert" => Some(ActionKind::Insert),
            "upsert" => Some(ActionKind::Upsert),
            "update" => Some(ActionKind::Update),
            "delete" => Some(ActionKind::Delete),
            _ => None,
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A validated mutation against one namespace.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Append a row. Only idempotent if the row carries a pre-generated id.
    Insert { namespace: String, document: Document },
    /// Write a row keyed by the namespace's conflict key, then its children.
    Upsert { namespace: String, document: Document },
    /// Apply a partial document to the row with `id`.
    Update {
        namespace: String,
        id: Value,
        patch: Document,
    },
    /// Remove the row with `id`. Removing a missing row succeeds.
    Delete { namespace: String, id: Value },
}

/// Reasons an action is rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ActionError {
    #[error("unknown action tag '{0}' (expected '<namespace>.insert|upsert|update|delete')")]
    UnknownTag(String),

    #[error("no collection registered for namespace '{0}'")]
    UnregisteredNamespace(String),

    #[error("payload for '{tag}' must be a JSON object")]
    NotAnObject { tag: String },

    #[error("payload for '{tag}' is missing required field '{field}'")]
    MissingField { tag: String, field: String },

    #[error("payload for '{tag}' has an invalid 'id' (expected a string or number)")]
    InvalidId { tag: String },

    #[error("payload field '{field}' for '{tag}' must be an array of objects")]
    InvalidChildren { tag: String, field: String },
}

impl Action {
    pub fn insert(namespace: impl Into<String>, document: Document) -> Self {
        Action::Insert {
            namespace: namespace.into(),
            document,
        }
    }

    pub fn upsert(namespace: impl Into<String>, document: Document) -> Self {
        Action::Upsert {
            namespace: namespace.into(),
            document,
        }
    }

    pub fn update(namespace: impl Into<String>, id: impl Into<Value>, patch: Document) -> Self {
        Action::Update {
            namespace: namespace.into(),
            id: id.into(),
            patch,
        }
    }

    pub fn delete(namespace: impl Into<String>, id: impl Into<Value>) -> Self {
        Action::Delete {
            namespace: namespace.into(),
            id: id.into(),
        }
    }

    /// Parses and validates a tagged payload.
    ///
    /// Checks that the tag has a known verb, that the namespace resolves in
    /// `catalog`, and that the payload has the fields its shape needs.
    pub fn parse(tag: &str, payload: Value, catalog: &Catalog) -> Result<Self, ActionError> {
        let (namespace, verb) = tag
            .rsplit_once('.')
            .filter(|(namespace, verb)| !namespace.is_empty() && !verb.is_empty())
            .ok_or_else(|| ActionError::UnknownTag(tag.to_string()))?;
        let kind = ActionKind::parse(verb).ok_or_else(|| ActionError::UnknownTag(tag.to_string()))?;

        let spec = catalog
            .resolve(namespace)
            .ok_or_else(|| ActionError::UnregisteredNamespace(namespace.to_string()))?;

        let Value::Object(mut document) = payload else {
            return Err(ActionError::NotAnObject {
                tag: tag.to_string(),
            });
        };

        let action = match kind {
            ActionKind::Insert => Action::insert(namespace, document),
            ActionKind::Upsert => {
                for column in &spec.conflict_key {
                    if document.get(column).map_or(true, Value::is_null) {
                        return Err(ActionError::MissingField {
                            tag: tag.to_string(),
                            field: column.clone(),
                        });
                    }
                }
                for child in &spec.children {
                    match document.get(&child.field) {
                        None | Some(Value::Null) => {}
                        Some(Value::Array(rows)) if rows.iter().all(Value::is_object) => {
                            if document.get(ID_FIELD).and_then(id_string).is_none() {
                                return Err(ActionError::MissingField {
                                    tag: tag.to_string(),
                                    field: ID_FIELD.to_string(),
                                });
                            }
                            // Rows without their own key would be appended on every replay
                            if let ChildMode::Upsert { conflict_key } = &child.mode {
                                let columns = conflict_key
                                    .iter()
                                    .filter(|column| **column != child.parent_field);
                                for column in columns {
                                    let missing = rows.iter().any(|row| {
                                        row.get(column.as_str()).map_or(true, Value::is_null)
                                    });
                                    if missing {
                                        return Err(ActionError::MissingField {
                                            tag: tag.to_string(),
                                            field: format!("{}[].{}", child.field, column),
                                        });
                                    }
                                }
                            }
                        }
                        Some(_) => {
                            return Err(ActionError::InvalidChildren {
                                tag: tag.to_string(),
                                field: child.field.clone(),
                            })
                        }
                    }
                }
                Action::upsert(namespace, document)
            }
            ActionKind::Update => {
                let id = take_id(tag, &mut document)?;
                Action::update(namespace, id, document)
            }
            ActionKind::Delete => {
                let id = take_id(tag, &mut document)?;
                Action::delete(namespace, id)
            }
        };

        Ok(action)
    }

    pub fn kind(&self) -> ActionKind {
        match self {
            Action::Insert { .. } => ActionKind::Insert,
            Action::Upsert { .. } => ActionKind::Upsert,
            Action::Update { .. } => ActionKind::Update,
            Action::Delete { .. } => ActionKind::Delete,
        }
    }

    pub fn namespace(&self) -> &str {
        match self {
            Action::Insert { namespace, .. }
            | Action::Upsert { namespace, .. }
            | Action::Update { namespace, .. }
            | Action::Delete { namespace, .. } => namespace,
        }
    }

    /// The tag stored alongside the payload, e.g. `diet.upsert`.
    pub fn tag(&self) -> String {
        format!("{}.{}", self.namespace(), self.kind())
    }

    /// The payload stored in the queue. [`Action::parse`] reads it back.
    pub fn payload(&self) -> Value {
        match self {
            Action::Insert { document, .. } | Action::Upsert { document, .. } => {
                Value::Object(document.clone())
            }
            Action::Update { id, patch, .. } => {
                let mut payload = patch.clone();
                payload.insert(ID_FIELD.to_string(), id.clone());
                Value::Object(payload)
            }
            Action::Delete { id, .. } => {
                let mut payload = Document::new();
                payload.insert(ID_FIELD.to_string(), id.clone());
                Value::Object(payload)
            }
        }
    }
}

/// Removes and validates the `id` field, keeping its JSON type.
fn take_id(tag: &str, document: &mut Document) -> Result<Value, ActionError> {
    match document.remove(ID_FIELD) {
        None | Some(Value::Null) => Err(ActionError::MissingField {
            tag: tag.to_string(),
            field: ID_FIELD.to_string(),
        }),
        Some(value) if id_string(&value).is_some() => Ok(value),
        Some(_) => Err(ActionError::InvalidId {
            tag: tag.to_string(),
        }),
    }
}

/// Renders a row id for filters. Strings (non-empty) and numbers are valid ids.
pub(crate) fn id_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
