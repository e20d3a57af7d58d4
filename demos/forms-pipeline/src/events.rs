//! Events of the forms domain.

use eventline_core::event::Event;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Everything that can happen to a form submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FormEvent {
    /// An applicant submitted a form.
    FormSubmitted {
        /// Form identifier.
        form_id: String,
        /// Where to send the confirmation. May be empty.
        applicant_email: String,
        /// Submitted field values.
        fields: BTreeMap<String, String>,
    },
    /// A submission was copied to the document archive.
    DocumentArchived {
        /// Form identifier.
        form_id: String,
        /// Key of the archived document.
        archive_key: String,
    },
    /// A submission was refused by a reviewer.
    FormRejected {
        /// Form identifier.
        form_id: String,
        /// Reviewer's reason.
        reason: String,
    },
}

impl FormEvent {
    /// Kind of [`FormEvent::FormSubmitted`].
    pub const SUBMITTED: &'static str = "FormSubmitted.v1";
    /// Kind of [`FormEvent::DocumentArchived`].
    pub const ARCHIVED: &'static str = "DocumentArchived.v1";
    /// Kind of [`FormEvent::FormRejected`].
    pub const REJECTED: &'static str = "FormRejected.v1";

    /// Every kind, for handlers interested in all of them.
    pub const ALL_KINDS: [&'static str; 3] = [Self::SUBMITTED, Self::ARCHIVED, Self::REJECTED];

    /// The form this event is about.
    #[must_use]
    pub fn form_id(&self) -> &str {
        match self {
            Self::FormSubmitted { form_id, .. }
            | Self::DocumentArchived { form_id, .. }
            | Self::FormRejected { form_id, .. } => form_id,
        }
    }
}

impl Event for FormEvent {
    fn event_type(&self) -> &'static str {
        match self {
            Self::FormSubmitted { .. } => Self::SUBMITTED,
            Self::DocumentArchived { .. } => Self::ARCHIVED,
            Self::FormRejected { .. } => Self::REJECTED,
        }
    }
}
