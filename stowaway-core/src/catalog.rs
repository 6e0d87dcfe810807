//! Mapping from action namespaces to remote collections.
//!
//! An action tagged `diet.upsert` belongs to the `diet` namespace. The catalog
//! says which remote collection that namespace writes to (e.g. `dietas`), which
//! columns identify a row for upserts, and which payload fields carry child rows
//! that must be written after the parent.

use std::borrow::Cow;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::action::{id_string, Document, ID_FIELD};

fn default_conflict_key() -> Vec<String> {
    vec![ID_FIELD.to_string()]
}

/// How a namespace maps onto the remote side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionSpec {
    /// Remote collection (table) name
    pub collection: String,
    /// Columns that identify a row for upserts (default: `["id"]`)
    #[serde(default = "default_conflict_key")]
    pub conflict_key: Vec<String>,
    /// Child row groups carried inside upsert payloads, written in order
    #[serde(default)]
    pub children: Vec<ChildSpec>,
}

/// A group of child rows nested in a parent's upsert payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChildSpec {
    /// Payload field holding an array of child rows
    pub field: String,
    /// Remote collection the child rows are written to
    pub collection: String,
    /// Column in each child row that references the parent's `id`
    pub parent_field: String,
    #[serde(default)]
    pub mode: ChildMode,
}

/// How child rows are reconciled with what the remote already holds.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "lowercase")]
pub enum ChildMode {
    /// Delete every child of the parent, then insert the supplied rows.
    #[default]
    Replace,
    /// Upsert each supplied row by its own conflict key.
    Upsert {
        #[serde(default = "default_conflict_key")]
        conflict_key: Vec<String>,
    },
}

/// Child rows split out of an upsert payload, ready to write.
#[derive(Debug, Clone, PartialEq)]
pub struct ChildBatch<'a> {
    pub spec: &'a ChildSpec,
    /// The parent's id as it appears in the payload
    pub parent_id: Value,
    /// `parent_id` rendered for remote filters
    pub parent_key: String,
    pub rows: Vec<Document>,
}

impl CollectionSpec {
    /// A collection keyed by `id` with no children.
    pub fn new(collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            conflict_key: default_conflict_key(),
            children: Vec::new(),
        }
    }

    pub fn with_conflict_key<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.conflict_key = columns.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_child(mut self, child: ChildSpec) -> Self {
        self.children.push(child);
        self
    }

    /// Splits an upsert payload into the parent row and its child batches.
    ///
    /// Child fields absent from the payload (or null) produce no batch, so
    /// existing children are left untouched. Each child row gets
    /// `parent_field` set to the parent's id, with the same JSON type.
    pub fn split<'a>(&'a self, document: &Document) -> (Document, Vec<ChildBatch<'a>>) {
        let mut parent = document.clone();
        let parent_id = document
            .get(ID_FIELD)
            .and_then(|id| id_string(id).map(|key| (id.clone(), key)));
        let mut batches = Vec::new();

        for spec in &self.children {
            let Some(Value::Array(rows)) = parent.remove(&spec.field) else {
                continue;
            };
            let Some((parent_id, parent_key)) = parent_id.clone() else {
                continue;
            };

            let rows = rows
                .into_iter()
                .filter_map(|row| match row {
                    Value::Object(mut row) => {
                        row.insert(spec.parent_field.clone(), parent_id.clone());
                        Some(row)
                    }
                    _ => None,
                })
                .collect();

            batches.push(ChildBatch {
                spec,
                parent_id,
                parent_key,
                rows,
            });
        }

        (parent, batches)
    }
}

impl ChildSpec {
    pub fn new(
        field: impl Into<String>,
        collection: impl Into<String>,
        parent_field: impl Into<String>,
    ) -> Self {
        Self {
            field: field.into(),
            collection: collection.into(),
            parent_field: parent_field.into(),
            mode: ChildMode::Replace,
        }
    }

    pub fn with_mode(mut self, mode: ChildMode) -> Self {
        self.mode = mode;
        self
    }
}

/// Registry of collection specs by namespace.
///
/// A permissive catalog (the default) resolves unregistered namespaces to a
/// collection of the same name keyed by `id`. A strict catalog rejects them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Catalog {
    #[serde(default)]
    pub strict: bool,
    #[serde(default)]
    pub collections: BTreeMap<String, CollectionSpec>,
}

impl Catalog {
    pub fn permissive() -> Self {
        Self::default()
    }

    pub fn strict() -> Self {
        Self {
            strict: true,
            collections: BTreeMap::new(),
        }
    }

    pub fn register(mut self, namespace: impl Into<String>, spec: CollectionSpec) -> Self {
        self.collections.insert(namespace.into(), spec);
        self
    }

    /// Looks up the spec for `namespace`.
    pub fn resolve(&self, namespace: &str) -> Option<Cow<'_, CollectionSpec>> {
        match self.collections.get(namespace) {
            Some(spec) => Some(Cow::Borrowed(spec)),
            None if !self.strict => Some(Cow::Owned(CollectionSpec::new(namespace))),
            None => None,
        }
    }
}
