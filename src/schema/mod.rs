// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Schema Projection
//!
//! The recursive structural schema of a form, reduced to what tabular export
//! needs: a tagged tree of plain fields, nested structures, and repeat
//! groups, plus an explicit flattening function producing the ordered flat
//! field layout. Column and child-table order is fixed by the tree, never by
//! per-row structure.
//!
//! This module never parses form definitions; the tree is supplied by the
//! caller.

use serde::{Deserialize, Serialize};

/// Data type of a leaf field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    Text,
    Int,
    Decimal,
    Date,
    DateTime,
    Geopoint,
    Binary,
}

/// One node of a form's structural schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum FieldNode {
    /// A plain value-bearing field.
    Leaf { name: String, data_type: FieldType },
    /// A non-repeating group; flattens away into dashed column names.
    Structure { name: String, children: Vec<FieldNode> },
    /// A repeat group; projects into a child table, one row per instance.
    Repeat { name: String, children: Vec<FieldNode> },
}

impl FieldNode {
    pub fn name(&self) -> &str {
        match self {
            FieldNode::Leaf { name, .. }
            | FieldNode::Structure { name, .. }
            | FieldNode::Repeat { name, .. } => name,
        }
    }
}

/// One entry of the flattened field layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlatField {
    /// Element names from the root to this field.
    pub path: Vec<String>,
    /// `None` for repeat-group entries.
    pub data_type: Option<FieldType>,
    pub is_repeat: bool,
}

impl FlatField {
    /// Column (or child-table) name: path segments joined with dashes.
    pub fn column_name(&self) -> String {
        self.path.join("-")
    }
}

/// Flatten a schema into its ordered field layout.
///
/// Every leaf and every repeat group yields one entry, in document order;
/// structures contribute only their name to descendant paths.
pub fn flatten(fields: &[FieldNode]) -> Vec<FlatField> {
    let mut flat = Vec::new();
    flatten_into(fields, &mut Vec::new(), &mut flat);
    flat
}

fn flatten_into(fields: &[FieldNode], prefix: &mut Vec<String>, out: &mut Vec<FlatField>) {
    for field in fields {
        prefix.push(field.name().to_string());
        match field {
            FieldNode::Leaf { data_type, .. } => {
                out.push(FlatField {
                    path: prefix.clone(),
                    data_type: Some(*data_type),
                    is_repeat: false,
                });
            }
            FieldNode::Structure { children, .. } => {
                flatten_into(children, prefix, out);
            }
            FieldNode::Repeat { children, .. } => {
                out.push(FlatField {
                    path: prefix.clone(),
                    data_type: None,
                    is_repeat: true,
                });
                flatten_into(children, prefix, out);
            }
        }
        prefix.pop();
    }
}

/// Leaf columns of the main table: every leaf without a repeat ancestor.
pub fn main_columns(flat: &[FlatField]) -> Vec<&FlatField> {
    flat.iter()
        .filter(|f| !f.is_repeat && repeat_ancestor(flat, f).is_none())
        .collect()
}

/// Leaf columns of one repeat group's child table: every leaf whose deepest
/// repeat ancestor is that group.
pub fn repeat_columns<'a>(flat: &'a [FlatField], repeat: &FlatField) -> Vec<&'a FlatField> {
    flat.iter()
        .filter(|f| {
            !f.is_repeat
                && repeat_ancestor(flat, f).map(|r| r.path.as_slice()) == Some(repeat.path.as_slice())
        })
        .collect()
}

/// All repeat groups, in layout order.
pub fn repeat_groups(flat: &[FlatField]) -> Vec<&FlatField> {
    flat.iter().filter(|f| f.is_repeat).collect()
}

/// The deepest repeat entry whose path is a proper prefix of `field`'s path.
pub fn repeat_ancestor<'a>(flat: &'a [FlatField], field: &FlatField) -> Option<&'a FlatField> {
    flat.iter()
        .filter(|r| {
            r.is_repeat
                && r.path.len() < field.path.len()
                && field.path[..r.path.len()] == r.path[..]
        })
        .max_by_key(|r| r.path.len())
}
