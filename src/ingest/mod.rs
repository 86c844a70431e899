// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Submission Ingest
//!
//! Write path of the pipeline: parse an incoming envelope, validate its
//! declared form version, and hand the result to the submission repository
//! as one atomic create. Attachment slots are declared up front — from the
//! encryption envelope for encrypted submissions, from the form's media
//! expectations for plaintext ones — and their binary content arrives later
//! via [`SubmissionIngest::attach`].

pub mod envelope;

use crate::error::{Error, Result};
use crate::storage::audit::{AuditEvent, AuditEventType, AuditLog};
use crate::storage::blobs::BlobStore;
use crate::storage::database::SubmissionDatabase;
use crate::storage::repository::forms::FormRepository;
use crate::storage::repository::submissions::{
    CreateOutcome, NewAttachment, NewDef, NewSubmission, SubmissionAttachment,
    SubmissionRepository,
};

pub use envelope::{EncryptionEnvelope, ParsedSubmission};

/// The authenticated actor a submission is attributed to.
#[derive(Debug, Clone)]
pub struct Submitter {
    pub id: String,
    pub display_name: String,
}

/// Ingest facade over the submission and form repositories.
pub struct SubmissionIngest<'a> {
    submissions: SubmissionRepository<'a>,
    forms: FormRepository<'a>,
    audit: Option<&'a AuditLog>,
}

impl<'a> SubmissionIngest<'a> {
    pub fn new(db: &'a SubmissionDatabase, blobs: &'a BlobStore) -> Self {
        Self {
            submissions: SubmissionRepository::new(db, blobs),
            forms: FormRepository::new(db),
            audit: None,
        }
    }

    /// Record ingest operations in the audit log.
    pub fn with_audit(mut self, audit: &'a AuditLog) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Parse a raw envelope and atomically create the submission, its first
    /// def, and its attachment slots.
    ///
    /// `expected_media` is the form's declared media list (enumerated by the
    /// form layer); it shapes the attachment slots of plaintext submissions.
    /// Encrypted submissions declare their own media list in the envelope.
    pub fn create_all(
        &self,
        project_id: &str,
        form_id: &str,
        raw: &[u8],
        submitter: &Submitter,
        device_id: Option<&str>,
        expected_media: &[String],
    ) -> Result<CreateOutcome> {
        let parsed = envelope::parse(raw)?;

        if parsed.form_id != form_id {
            return Err(Error::Validation(format!(
                "envelope declares form {:?}, submitted to form {form_id:?}",
                parsed.form_id
            )));
        }

        let form = self.forms.get(project_id, form_id)?;
        if parsed.version != form.current_version {
            return Err(Error::VersionMismatch {
                expected: form.current_version,
                received: parsed.version,
            });
        }

        let new = NewSubmission {
            project_id: project_id.to_string(),
            form_id: form_id.to_string(),
            instance_id: parsed.instance_id.clone(),
            submitter_id: submitter.id.clone(),
            submitter_name: submitter.display_name.clone(),
            device_id: device_id.map(str::to_string),
        };

        let (def, slots) = match &parsed.encryption {
            Some(env) => {
                let def = NewDef {
                    form_version: parsed.version.clone(),
                    xml: None,
                    local_key: Some(env.local_key.clone()),
                    enc_data_attachment_name: Some(env.enc_data_attachment_name.clone()),
                    signature: env.signature.clone(),
                };
                // Media files take indices in envelope order; the encrypted
                // body is always the last file of the submission.
                let mut slots: Vec<NewAttachment> = env
                    .media_names
                    .iter()
                    .enumerate()
                    .map(|(i, name)| NewAttachment {
                        name: name.clone(),
                        index: i as u32,
                    })
                    .collect();
                slots.push(NewAttachment {
                    name: env.enc_data_attachment_name.clone(),
                    index: slots.len() as u32,
                });
                (def, slots)
            }
            None => {
                let def = NewDef {
                    form_version: parsed.version.clone(),
                    // Already validated as UTF-8 by the envelope parser.
                    xml: Some(String::from_utf8_lossy(raw).into_owned()),
                    local_key: None,
                    enc_data_attachment_name: None,
                    signature: None,
                };
                let slots = expected_media
                    .iter()
                    .enumerate()
                    .map(|(i, name)| NewAttachment {
                        name: name.clone(),
                        index: i as u32,
                    })
                    .collect();
                (def, slots)
            }
        };

        let outcome = self.submissions.create(&new, &def, &slots)?;

        if let CreateOutcome::Created { submission, .. } = &outcome {
            tracing::info!(
                project_id,
                form_id,
                instance_id = %submission.instance_id,
                encrypted = parsed.is_encrypted(),
                "Submission created"
            );
            self.audit_log(
                AuditEvent::new(AuditEventType::SubmissionCreated)
                    .with_actor(&submitter.id)
                    .with_resource(&submission.instance_id)
                    .with_details(serde_json::json!({
                        "form_id": form_id,
                        "encrypted": parsed.is_encrypted(),
                    })),
            );
        }

        Ok(outcome)
    }

    /// Store binary content for an attachment slot of a submission's current
    /// def.
    pub fn attach(
        &self,
        project_id: &str,
        form_id: &str,
        instance_id: &str,
        name: &str,
        content: &[u8],
        content_type: &str,
    ) -> Result<SubmissionAttachment> {
        let def = self
            .submissions
            .get_current_def_by_keys(project_id, form_id, instance_id)?;
        let attachment = self
            .submissions
            .attach_blob(def.id, name, content, content_type)?;

        self.audit_log(
            AuditEvent::new(AuditEventType::AttachmentSaved)
                .with_resource(instance_id)
                .with_details(serde_json::json!({ "name": name, "size": content.len() })),
        );
        Ok(attachment)
    }

    fn audit_log(&self, event: AuditEvent) {
        if let Some(audit) = self.audit {
            if let Err(e) = audit.log(&event) {
                tracing::warn!(error = %e, "Failed to write audit event");
            }
        }
    }
}
