// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Repository layer providing typed access to the submission database.

pub mod forms;
pub mod submissions;

pub use forms::{Form, FormDef, FormRepository};
pub use submissions::{
    AttachmentRow, CreateOutcome, ExportRow, NewAttachment, NewDef, NewSubmission, Paging,
    RowCrypto, Submission, SubmissionAttachment, SubmissionDef, SubmissionId,
    SubmissionRepository,
};
