//! Handlers reacting to form events.
//!
//! | Kind | Handlers, in order |
//! |---|---|
//! | `FormSubmitted.v1` | `archive-submission`, `notify-applicant`, `audit` |
//! | `DocumentArchived.v1` | `audit` |
//! | `FormRejected.v1` | `audit` |

use crate::events::FormEvent;
use eventline_core::event::SerializedEvent;
use eventline_core::handler::{HandlerError, HandlerOutcome};
use eventline_runtime::{EventHandler, HandlerContext, HandlerRegistry, RegistryError};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

type HandlerFuture<'a> = Pin<Box<dyn Future<Output = Result<HandlerOutcome, HandlerError>> + Send + 'a>>;

/// Outgoing mail.
pub trait Mailer: Send + Sync {
    /// Send one message.
    ///
    /// # Errors
    ///
    /// Returns a description of the failure; callers retry later.
    fn send<'a>(
        &'a self,
        to: &'a str,
        subject: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<(), String>> + Send + 'a>>;
}

/// Mailer that only logs.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogMailer;

impl Mailer for LogMailer {
    fn send<'a>(
        &'a self,
        to: &'a str,
        subject: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<(), String>> + Send + 'a>> {
        Box::pin(async move {
            tracing::info!(to, subject, "Sending mail");
            Ok(())
        })
    }
}

/// Copies a submission to the archive and announces it.
///
/// The follow-up `DocumentArchived` event and the guard record commit
/// together, so a retry never archives twice.
#[derive(Debug, Clone, Copy, Default)]
pub struct ArchiveSubmission;

impl ArchiveSubmission {
    /// Sub-task guarding the archive write.
    pub const SUB_TASK: &'static str = "archive";
}

impl EventHandler<FormEvent> for ArchiveSubmission {
    fn id(&self) -> &str {
        "archive-submission"
    }

    fn handle<'a>(&'a self, ctx: &'a HandlerContext, event: &'a FormEvent) -> HandlerFuture<'a> {
        Box::pin(async move {
            let FormEvent::FormSubmitted { form_id, .. } = event else {
                return Ok(HandlerOutcome::Success);
            };

            // Nothing downstream can make sense of a submission without an id.
            if form_id.trim().is_empty() {
                return Ok(HandlerOutcome::FatalError(
                    "submission has no form id".to_string(),
                ));
            }

            if ctx.is_guarded(Self::SUB_TASK).await? {
                tracing::debug!(event_id = %ctx.event_id(), "Submission already archived");
                return Ok(HandlerOutcome::Success);
            }

            let archived = FormEvent::DocumentArchived {
                form_id: form_id.clone(),
                archive_key: format!("archive/{form_id}/{}", ctx.event_id()),
            };
            let serialized = SerializedEvent::from_event(
                &archived,
                Some(serde_json::json!({ "correlation_id": ctx.event_id().value() })),
            )
            .map_err(HandlerError::failed)?;

            let queued = ctx.publish_guarded(serialized, Self::SUB_TASK).await?;
            tracing::info!(
                event_id = %ctx.event_id(),
                follow_up = %queued.id,
                form_id = %form_id,
                "Submission archived"
            );
            Ok(HandlerOutcome::Success)
        })
    }
}

/// Mails a confirmation to the applicant.
pub struct NotifyApplicant {
    mailer: Arc<dyn Mailer>,
}

impl NotifyApplicant {
    /// Sub-task guarding the confirmation mail.
    pub const SUB_TASK: &'static str = "confirmation-mail";

    /// Create a notifier sending through `mailer`.
    #[must_use]
    pub fn new(mailer: Arc<dyn Mailer>) -> Self {
        Self { mailer }
    }
}

impl EventHandler<FormEvent> for NotifyApplicant {
    fn id(&self) -> &str {
        "notify-applicant"
    }

    fn handle<'a>(&'a self, ctx: &'a HandlerContext, event: &'a FormEvent) -> HandlerFuture<'a> {
        Box::pin(async move {
            let FormEvent::FormSubmitted {
                form_id,
                applicant_email,
                ..
            } = event
            else {
                return Ok(HandlerOutcome::Success);
            };

            if applicant_email.trim().is_empty() {
                return Ok(HandlerOutcome::UnrecoverableError(
                    "applicant has no email address".to_string(),
                ));
            }

            if ctx.is_guarded(Self::SUB_TASK).await? {
                return Ok(HandlerOutcome::Success);
            }

            let subject = format!("We received form {form_id}");
            if let Err(e) = self.mailer.send(applicant_email, &subject).await {
                tracing::warn!(
                    event_id = %ctx.event_id(),
                    attempt = ctx.attempt(),
                    error = %e,
                    "Confirmation mail failed"
                );
                return Ok(HandlerOutcome::TransientError(e));
            }

            ctx.guard(Self::SUB_TASK).await?;
            Ok(HandlerOutcome::Success)
        })
    }
}

/// Writes every form event to the audit log.
#[derive(Debug, Clone, Copy, Default)]
pub struct Audit;

impl EventHandler<FormEvent> for Audit {
    fn id(&self) -> &str {
        "audit"
    }

    fn handle<'a>(&'a self, ctx: &'a HandlerContext, event: &'a FormEvent) -> HandlerFuture<'a> {
        Box::pin(async move {
            tracing::info!(
                target: "audit",
                event_id = %ctx.event_id(),
                kind = ctx.event_kind(),
                form_id = event.form_id(),
                attempt = ctx.attempt(),
                "Form event"
            );
            Ok(HandlerOutcome::Success)
        })
    }
}

/// Registry wiring the handlers above to their kinds.
///
/// # Errors
///
/// Returns [`RegistryError`] if two handlers of one kind share an id.
pub fn registry(mailer: Arc<dyn Mailer>) -> Result<HandlerRegistry<FormEvent>, RegistryError> {
    FormEvent::ALL_KINDS.into_iter().fold(
        HandlerRegistry::builder()
            .register(FormEvent::SUBMITTED, ArchiveSubmission)
            .register(FormEvent::SUBMITTED, NotifyApplicant::new(mailer)),
        |builder, kind| builder.register(kind, Audit),
    )
    .build()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use eventline_core::handler::HandlerId;

    #[test]
    fn submitted_handlers_run_in_registration_order() {
        let registry = registry(Arc::new(LogMailer)).unwrap();

        assert_eq!(
            registry.handler_ids(FormEvent::SUBMITTED),
            vec![
                HandlerId::new("archive-submission"),
                HandlerId::new("notify-applicant"),
                HandlerId::new("audit"),
            ]
        );
        assert_eq!(registry.handler_ids(FormEvent::REJECTED), vec![HandlerId::new("audit")]);
    }
}
