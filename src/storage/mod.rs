// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Persistent Storage Module
//!
//! Relational state lives in an embedded redb database; attachment bodies
//! live in a content-addressed filesystem blob store next to it.
//!
//! ## Storage Layout
//!
//! ```text
//! /data/
//!   submissions.redb        # all relational tables (see database module)
//!   blobs/
//!     {aa}/{sha256}         # attachment content, addressed by digest
//!   audit/
//!     {date}/events.jsonl   # daily audit logs
//! ```
//!
//! ## Ownership
//!
//! - The submission repository exclusively owns Submission / SubmissionDef /
//!   SubmissionAttachment lifecycles.
//! - The key vault (in `crate::crypto`) exclusively owns Key lifecycle, on
//!   top of the same database.
//! - Blob content is shared by reference; deleting the last referencing
//!   attachment does not delete the blob (retention policy is external).

pub mod audit;
pub mod blobs;
pub mod database;
pub mod paths;
pub mod repository;

pub use audit::{AuditEvent, AuditEventType, AuditLog};
pub use blobs::{BlobMeta, BlobStore};
pub use database::{ExportEntry, ExportPage, SubmissionDatabase};
pub use paths::StoragePaths;
pub use repository::{
    AttachmentRow, CreateOutcome, ExportRow, Form, FormDef, FormRepository, NewAttachment,
    NewDef, NewSubmission, Paging, RowCrypto, Submission, SubmissionAttachment, SubmissionDef,
    SubmissionId, SubmissionRepository,
};
