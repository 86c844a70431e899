// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Tabular rendering: one CSV main table plus one CSV child table per
//! repeat group.
//!
//! ## Layout
//!
//! Main table header, fixed at export start from the flattened schema:
//! `SubmissionDate, meta-instanceID, <field columns…>, KEY, SubmitterID,
//! SubmitterName, Status`. One row per submission. Rows whose protecting key
//! the caller cannot unlock are emitted with empty field columns and a
//! [`STATUS_MISSING_ENCRYPTED`] marker — never with garbage.
//!
//! Each repeat-group instance adds one row to that group's child table,
//! carrying `PARENT_KEY` (the parent row's key — the submission instance id
//! for top-level repeats) and its own `KEY`
//! (`<parent>/<group>[<n>]`, 1-based).

use std::io::{self, Write};

use quick_xml::events::Event;
use quick_xml::Reader;

use crate::crypto::keyvault::Decryptor;
use crate::error::{Error, Result};
use crate::schema::{
    flatten, main_columns, repeat_ancestor, repeat_columns, repeat_groups, FieldNode, FlatField,
};
use crate::storage::blobs::BlobStore;
use crate::storage::repository::submissions::ExportRow;

use super::resolve_payload;

/// Status marker for rows the caller's key set cannot unlock.
pub const STATUS_MISSING_ENCRYPTED: &str = "missing encrypted form data";

/// What a tabular render produced.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct TabularSummary {
    /// Rows written to the main table, markers included.
    pub main_rows: usize,
    /// Rows written across all child tables.
    pub child_rows: usize,
    /// Main rows emitted as encrypted-no-data markers.
    pub undecryptable_rows: usize,
}

/// Stream export rows into CSV tables. `sink` is called once per table at
/// export start — `submissions.csv` for the main table, then
/// `submissions-<group>.csv` per repeat group, in layout order.
pub fn render<W, F, R>(
    blobs: &BlobStore,
    decryptor: &Decryptor,
    schema: &[FieldNode],
    rows: R,
    mut sink: F,
) -> Result<TabularSummary>
where
    W: Write,
    F: FnMut(&str) -> io::Result<W>,
    R: Iterator<Item = Result<ExportRow>>,
{
    let flat = flatten(schema);
    let main_cols = main_columns(&flat);
    let groups = repeat_groups(&flat);

    // Column order is fixed here, before the first row is pulled.
    let mut main_writer = csv::Writer::from_writer(sink("submissions.csv")?);
    let mut header: Vec<String> = vec!["SubmissionDate".to_string(), "meta-instanceID".to_string()];
    header.extend(main_cols.iter().map(|c| c.column_name()));
    header.extend(
        ["KEY", "SubmitterID", "SubmitterName", "Status"]
            .iter()
            .map(|s| s.to_string()),
    );
    main_writer.write_record(&header)?;

    let mut child_writers = Vec::with_capacity(groups.len());
    for group in &groups {
        let mut writer =
            csv::Writer::from_writer(sink(&format!("submissions-{}.csv", group.column_name()))?);
        let mut header: Vec<String> = repeat_columns(&flat, group)
            .iter()
            .map(|c| c.column_name())
            .collect();
        header.push("PARENT_KEY".to_string());
        header.push("KEY".to_string());
        writer.write_record(&header)?;
        child_writers.push(writer);
    }

    let mut summary = TabularSummary::default();

    for row in rows {
        let row = row?;
        let instance_id = row.submission.instance_id.clone();
        let date = row.submission.created_at.to_rfc3339();

        let Some(payload) = resolve_payload(blobs, decryptor, &row)? else {
            let mut record = vec![date, instance_id.clone()];
            record.extend(std::iter::repeat(String::new()).take(main_cols.len()));
            record.push(instance_id);
            record.push(row.submission.submitter_id.clone());
            record.push(row.submission.submitter_name.clone());
            record.push(STATUS_MISSING_ENCRYPTED.to_string());
            main_writer.write_record(&record)?;
            summary.main_rows += 1;
            summary.undecryptable_rows += 1;
            continue;
        };

        let text = String::from_utf8(payload).map_err(|_| {
            Error::Undecryptable("decrypted payload is not valid UTF-8".to_string())
        })?;
        let tree = parse_tree(&text)?;

        let mut record = vec![date, instance_id.clone()];
        for col in &main_cols {
            record.push(first_value(&tree, &col.path).unwrap_or_default());
        }
        record.push(instance_id.clone());
        record.push(row.submission.submitter_id.clone());
        record.push(row.submission.submitter_name.clone());
        record.push(String::new());
        main_writer.write_record(&record)?;
        summary.main_rows += 1;

        for (group_idx, group) in groups.iter().enumerate() {
            if repeat_ancestor(&flat, group).is_some() {
                continue; // reached through its parent group below
            }
            emit_group(
                &flat,
                &groups,
                &mut child_writers,
                group_idx,
                &tree,
                0,
                &instance_id,
                &mut summary,
            )?;
        }
    }

    main_writer.flush()?;
    for writer in &mut child_writers {
        writer.flush()?;
    }

    tracing::info!(
        main_rows = summary.main_rows,
        child_rows = summary.child_rows,
        undecryptable = summary.undecryptable_rows,
        "Tabular export rendered"
    );
    Ok(summary)
}

/// Emit every instance of one repeat group found under `scope`, recursing
/// into nested groups with the instance's KEY as their PARENT_KEY.
#[allow(clippy::too_many_arguments)]
fn emit_group<W: Write>(
    flat: &[FlatField],
    groups: &[&FlatField],
    writers: &mut [csv::Writer<W>],
    group_idx: usize,
    scope: &XmlNode,
    scope_depth: usize,
    parent_key: &str,
    summary: &mut TabularSummary,
) -> Result<()> {
    let group = groups[group_idx];
    let cols = repeat_columns(flat, group);
    let group_name = group.path.last().expect("repeat path is never empty");

    for (i, instance) in find_nodes(scope, &group.path[scope_depth..])
        .into_iter()
        .enumerate()
    {
        let key = format!("{parent_key}/{group_name}[{}]", i + 1);

        let mut record: Vec<String> = cols
            .iter()
            .map(|col| first_value(instance, &col.path[group.path.len()..]).unwrap_or_default())
            .collect();
        record.push(parent_key.to_string());
        record.push(key.clone());
        writers[group_idx].write_record(&record)?;
        summary.child_rows += 1;

        for (child_idx, child) in groups.iter().enumerate() {
            let parent_of_child = repeat_ancestor(flat, child);
            if parent_of_child.map(|p| p.path.as_slice()) == Some(group.path.as_slice()) {
                emit_group(
                    flat,
                    groups,
                    writers,
                    child_idx,
                    instance,
                    group.path.len(),
                    &key,
                    summary,
                )?;
            }
        }
    }
    Ok(())
}

// =============================================================================
// Payload value tree
// =============================================================================

/// A parsed payload element: name, concatenated text, children in order.
#[derive(Debug)]
struct XmlNode {
    name: String,
    text: String,
    children: Vec<XmlNode>,
}

/// Parse a payload into its element tree. Namespace prefixes are dropped so
/// paths from the schema match regardless of prefixing.
fn parse_tree(xml: &str) -> Result<XmlNode> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    // Sentinel root; the document element ends up as its first child.
    let mut stack = vec![XmlNode {
        name: String::new(),
        text: String::new(),
        children: Vec::new(),
    }];

    loop {
        match reader.read_event() {
            Err(e) => return Err(Error::Validation(format!("malformed payload XML: {e}"))),
            Ok(Event::Eof) => break,
            Ok(Event::Start(e)) => {
                stack.push(XmlNode {
                    name: String::from_utf8_lossy(e.local_name().as_ref()).into_owned(),
                    text: String::new(),
                    children: Vec::new(),
                });
            }
            Ok(Event::Empty(e)) => {
                let node = XmlNode {
                    name: String::from_utf8_lossy(e.local_name().as_ref()).into_owned(),
                    text: String::new(),
                    children: Vec::new(),
                };
                stack.last_mut().expect("sentinel never popped").children.push(node);
            }
            Ok(Event::Text(t)) => {
                let value = t
                    .unescape()
                    .map_err(|e| Error::Validation(format!("malformed payload text: {e}")))?;
                stack
                    .last_mut()
                    .expect("sentinel never popped")
                    .text
                    .push_str(&value);
            }
            Ok(Event::End(_)) => {
                let node = stack.pop().expect("balanced end tags");
                stack.last_mut().expect("sentinel never popped").children.push(node);
            }
            Ok(_) => {}
        }
    }

    let sentinel = stack.pop().expect("sentinel remains");
    sentinel
        .children
        .into_iter()
        .next()
        .ok_or_else(|| Error::Validation("payload has no document element".to_string()))
}

/// All nodes reached from `scope` along `path`, in document order.
fn find_nodes<'a>(scope: &'a XmlNode, path: &[String]) -> Vec<&'a XmlNode> {
    if path.is_empty() {
        return vec![scope];
    }
    let mut out = Vec::new();
    for child in &scope.children {
        if child.name == path[0] {
            out.extend(find_nodes(child, &path[1..]));
        }
    }
    out
}

/// Text of the first node along `path`, if any.
fn first_value(scope: &XmlNode, path: &[String]) -> Option<String> {
    find_nodes(scope, path)
        .first()
        .map(|node| node.text.trim().to_string())
}

// =============================================================================
// Tests
// =============================================================================
