// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Form records consumed by the submission pipeline.
//!
//! Form *content* (schema, rendering) is managed elsewhere; this repository
//! only persists what the pipeline needs: the current version of each form
//! and, per published version, the managed-encryption key that was active
//! when that version accepted submissions.

use serde::{Deserialize, Serialize};

use crate::crypto::keyvault::KeyId;
use crate::error::{Error, Result};
use crate::storage::database::SubmissionDatabase;

/// A form, reduced to the attributes the pipeline reads.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Form {
    pub project_id: String,
    pub form_id: String,
    /// Version string submissions must declare to be accepted.
    pub current_version: String,
}

/// One published version of a form.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FormDef {
    pub project_id: String,
    pub form_id: String,
    pub version: String,
    /// Key active when this version accepted submissions; `None` for
    /// unencrypted forms. Decides which Key protects a given submission def.
    pub key_id: Option<KeyId>,
}

/// Repository for form records.
pub struct FormRepository<'a> {
    db: &'a SubmissionDatabase,
}

impl<'a> FormRepository<'a> {
    pub fn new(db: &'a SubmissionDatabase) -> Self {
        Self { db }
    }

    /// Publish a version, making it the form's current version.
    pub fn publish(
        &self,
        project_id: &str,
        form_id: &str,
        version: &str,
        key_id: Option<KeyId>,
    ) -> Result<FormDef> {
        tracing::info!(project_id, form_id, version, encrypted = key_id.is_some(), "Form published");
        self.db.publish_form(project_id, form_id, version, key_id)
    }

    /// Look up a form; NotFound if it was never published.
    pub fn get(&self, project_id: &str, form_id: &str) -> Result<Form> {
        self.db
            .get_form(project_id, form_id)?
            .ok_or_else(|| Error::NotFound(format!("form {form_id}")))
    }

    /// Look up one published version of a form.
    pub fn get_def(&self, project_id: &str, form_id: &str, version: &str) -> Result<FormDef> {
        self.db
            .get_form_def(project_id, form_id, version)?
            .ok_or_else(|| Error::NotFound(format!("form {form_id} version {version:?}")))
    }
}
