//! Form submission pipeline built on Eventline.
//!
//! A submitted form is archived, confirmed to the applicant by mail and
//! audited. Archiving publishes a `DocumentArchived` follow-up in the same
//! transaction as its guard record. A projection keeps submission counters
//! from the log.

pub mod config;
pub mod events;
pub mod handlers;
pub mod projection;

pub use config::AppConfig;
pub use events::FormEvent;
pub use handlers::{ArchiveSubmission, Audit, LogMailer, Mailer, NotifyApplicant, registry};
pub use projection::{Stats, SubmissionStats};
