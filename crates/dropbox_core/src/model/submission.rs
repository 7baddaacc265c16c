//! Submission payload and form schema.
//!
//! # Responsibility
//! - Represent the one-time payload accepted into a box.
//! - Validate payloads against the expected form fields, reporting every
//!   violation at once so the submitter can fix them in one retry.
//!
//! # Invariants
//! - Validation is pure: it never mutates the payload or any box.
//! - Field names are compared exactly (case-sensitive).

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::error::Error;
use std::fmt::{Display, Formatter};

static EMAIL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").expect("valid email regex")
});

const DEFAULT_MESSAGE_MAX_CHARS: usize = 10_000;
const DEFAULT_EMAIL_MAX_CHARS: usize = 254;

/// Named text fields submitted through a box form.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Submission {
    fields: BTreeMap<String, String>,
}

impl Submission {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style field insertion.
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }

    pub fn fields(&self) -> &BTreeMap<String, String> {
        &self.fields
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Serializes to the JSON object stored alongside the box.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(value: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(value)
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Submission {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            fields: iter
                .into_iter()
                .map(|(name, value)| (name.into(), value.into()))
                .collect(),
        }
    }
}

/// Value syntax accepted by a form field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Text,
    Email,
}

/// Rule for one form field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldRule {
    pub name: String,
    pub kind: FieldKind,
    pub required: bool,
    /// Upper bound in Unicode scalar values.
    pub max_chars: usize,
}

impl FieldRule {
    pub fn required(name: impl Into<String>, kind: FieldKind, max_chars: usize) -> Self {
        Self {
            name: name.into(),
            kind,
            required: true,
            max_chars,
        }
    }

    pub fn optional(name: impl Into<String>, kind: FieldKind, max_chars: usize) -> Self {
        Self {
            name: name.into(),
            kind,
            required: false,
            max_chars,
        }
    }
}

/// One violation found while validating a submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldError {
    Missing(String),
    Empty(String),
    TooLong { field: String, max_chars: usize },
    InvalidEmail(String),
    Unknown(String),
}

impl FieldError {
    /// Field the violation refers to.
    pub fn field(&self) -> &str {
        match self {
            Self::Missing(field)
            | Self::Empty(field)
            | Self::InvalidEmail(field)
            | Self::Unknown(field) => field,
            Self::TooLong { field, .. } => field,
        }
    }
}

impl Display for FieldError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Missing(field) => write!(f, "field `{field}` is required"),
            Self::Empty(field) => write!(f, "field `{field}` must not be empty"),
            Self::TooLong { field, max_chars } => {
                write!(f, "field `{field}` exceeds {max_chars} characters")
            }
            Self::InvalidEmail(field) => write!(f, "field `{field}` is not a valid email"),
            Self::Unknown(field) => write!(f, "field `{field}` is not part of this form"),
        }
    }
}

impl Error for FieldError {}

/// Expected structure of a box submission form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmissionSchema {
    rules: Vec<FieldRule>,
}

impl Default for SubmissionSchema {
    /// Required `message` text plus optional `reply_to` address.
    fn default() -> Self {
        Self::new(vec![
            FieldRule::required("message", FieldKind::Text, DEFAULT_MESSAGE_MAX_CHARS),
            FieldRule::optional("reply_to", FieldKind::Email, DEFAULT_EMAIL_MAX_CHARS),
        ])
    }
}

impl SubmissionSchema {
    pub fn new(rules: Vec<FieldRule>) -> Self {
        Self { rules }
    }

    pub fn rules(&self) -> &[FieldRule] {
        &self.rules
    }

    /// Validates `submission`, returning every violation in rule order
    /// followed by unknown fields in name order.
    pub fn validate(&self, submission: &Submission) -> Result<(), Vec<FieldError>> {
        let mut errors = Vec::new();

        for rule in &self.rules {
            match submission.field(rule.name.as_str()) {
                None if rule.required => errors.push(FieldError::Missing(rule.name.clone())),
                None => {}
                Some(value) => {
                    if let Some(err) = check_value(rule, value) {
                        errors.push(err);
                    }
                }
            }
        }

        for name in submission.fields().keys() {
            if !self.rules.iter().any(|rule| rule.name == *name) {
                errors.push(FieldError::Unknown(name.clone()));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

fn check_value(rule: &FieldRule, value: &str) -> Option<FieldError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        // Optional fields may be sent blank by HTML forms.
        return rule.required.then(|| FieldError::Empty(rule.name.clone()));
    }

    if value.chars().count() > rule.max_chars {
        return Some(FieldError::TooLong {
            field: rule.name.clone(),
            max_chars: rule.max_chars,
        });
    }

    match rule.kind {
        FieldKind::Text => None,
        FieldKind::Email if EMAIL_RE.is_match(trimmed) => None,
        FieldKind::Email => Some(FieldError::InvalidEmail(rule.name.clone())),
    }
}
