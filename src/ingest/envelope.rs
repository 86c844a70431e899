// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Submission envelope parsing.
//!
//! Extracts the form-agnostic attributes of an incoming submission without
//! knowing anything about the form's schema: form id, instance id, declared
//! version, and — when present — the encryption envelope fields. Element
//! names are matched by local name, so namespace prefixes (`orx:meta`) parse
//! the same as unprefixed ones.

use quick_xml::events::Event;
use quick_xml::Reader;

use crate::error::{Error, Result};

/// The encryption envelope carried by an encrypted submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptionEnvelope {
    /// Base64 client-wrapped symmetric key (`base64EncryptedKey`).
    pub local_key: String,
    /// Name of the pseudo-attachment holding the encrypted payload body
    /// (`encryptedXmlFile`).
    pub enc_data_attachment_name: String,
    /// Integrity signature (`base64EncryptedElementSignature`), stored
    /// verbatim.
    pub signature: Option<String>,
    /// Encrypted media file names, in envelope order.
    pub media_names: Vec<String>,
}

/// A parsed submission envelope, independent of any form's schema.
#[derive(Debug, Clone)]
pub struct ParsedSubmission {
    pub form_id: String,
    pub instance_id: String,
    /// True when neither a meta instance id nor a root attribute was present
    /// and a fresh id was generated.
    pub generated_instance_id: bool,
    /// Declared form version; empty string when undeclared.
    pub version: String,
    pub encryption: Option<EncryptionEnvelope>,
}

impl ParsedSubmission {
    pub fn is_encrypted(&self) -> bool {
        self.encryption.is_some()
    }
}

/// Parse a raw submission payload into its envelope attributes.
pub fn parse(raw: &[u8]) -> Result<ParsedSubmission> {
    let text = std::str::from_utf8(raw)
        .map_err(|_| Error::Validation("submission payload is not valid UTF-8".to_string()))?;

    let mut reader = Reader::from_str(text);
    reader.config_mut().trim_text(true);

    let mut stack: Vec<String> = Vec::new();
    let mut root_seen = false;

    let mut form_id: Option<String> = None;
    let mut version = String::new();
    let mut attr_instance_id: Option<String> = None;
    let mut meta_instance_id: Option<String> = None;
    let mut local_key: Option<String> = None;
    let mut enc_file: Option<String> = None;
    let mut signature: Option<String> = None;
    let mut media_names: Vec<String> = Vec::new();

    loop {
        match reader.read_event() {
            Err(e) => return Err(Error::Validation(format!("malformed XML: {e}"))),
            Ok(Event::Eof) => break,
            Ok(Event::Start(e)) => {
                if !root_seen {
                    root_seen = true;
                    read_root_attributes(
                        &e,
                        &mut form_id,
                        &mut version,
                        &mut attr_instance_id,
                    )?;
                }
                let name = String::from_utf8_lossy(e.local_name().as_ref()).into_owned();
                stack.push(name);
            }
            Ok(Event::Empty(e)) => {
                if !root_seen {
                    root_seen = true;
                    read_root_attributes(
                        &e,
                        &mut form_id,
                        &mut version,
                        &mut attr_instance_id,
                    )?;
                }
            }
            Ok(Event::End(_)) => {
                stack.pop();
            }
            Ok(Event::Text(t)) => {
                let value = t
                    .unescape()
                    .map_err(|e| Error::Validation(format!("malformed XML text: {e}")))?
                    .trim()
                    .to_string();
                if value.is_empty() {
                    continue;
                }

                let current = stack.last().map(String::as_str).unwrap_or("");
                let parent = stack
                    .len()
                    .checked_sub(2)
                    .map(|i| stack[i].as_str())
                    .unwrap_or("");

                match current {
                    "instanceID" if parent == "meta" => meta_instance_id = Some(value),
                    "base64EncryptedKey" => local_key = Some(value),
                    "encryptedXmlFile" => enc_file = Some(value),
                    "base64EncryptedElementSignature" => signature = Some(value),
                    "file" if parent == "media" => media_names.push(value),
                    _ => {}
                }
            }
            Ok(_) => {}
        }
    }

    let form_id = form_id
        .ok_or_else(|| Error::Validation("submission root carries no form id".to_string()))?;

    // Preference order: nested meta instance id, root attribute, fresh id.
    let (instance_id, generated_instance_id) = match meta_instance_id.or(attr_instance_id) {
        Some(id) => (id, false),
        None => (format!("uuid:{}", uuid::Uuid::new_v4()), true),
    };

    let encryption = match (local_key, enc_file) {
        (Some(local_key), Some(enc_data_attachment_name)) => Some(EncryptionEnvelope {
            local_key,
            enc_data_attachment_name,
            signature,
            media_names,
        }),
        (None, None) => None,
        _ => {
            return Err(Error::Validation(
                "incomplete encryption envelope: need both wrapped key and payload name"
                    .to_string(),
            ))
        }
    };

    Ok(ParsedSubmission {
        form_id,
        instance_id,
        generated_instance_id,
        version,
        encryption,
    })
}

fn read_root_attributes(
    element: &quick_xml::events::BytesStart<'_>,
    form_id: &mut Option<String>,
    version: &mut String,
    attr_instance_id: &mut Option<String>,
) -> Result<()> {
    for attr in element.attributes().flatten() {
        let value = attr
            .unescape_value()
            .map_err(|e| Error::Validation(format!("malformed attribute: {e}")))?
            .into_owned();
        match attr.key.local_name().as_ref() {
            b"id" => *form_id = Some(value),
            b"version" => *version = value,
            b"instanceID" => *attr_instance_id = Some(value),
            _ => {}
        }
    }
    Ok(())
}
