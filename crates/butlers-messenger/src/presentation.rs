//! Outbound content presentation.
//!
//! Every outbound message carries a user-visible origin: email gets
//! `[origin]` in the subject, other channels get the message prefixed,
//! unless an equivalent identity surface already exists. Adapters may
//! normalize formatting but preserve semantics.

use butlers_core::NotifyV1;

/// The presented content of one delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresentedContent {
    /// Message body to hand to the provider.
    pub message: Option<String>,
    /// Subject line (email).
    pub subject: Option<String>,
}

/// Apply origin presentation to an envelope.
#[must_use]
pub fn present(envelope: &NotifyV1) -> PresentedContent {
    let origin = &envelope.origin_butler;
    let tag = format!("[{origin}]");

    if envelope.delivery.channel == "email" {
        let subject = match &envelope.delivery.subject {
            Some(subject) if subject.contains(&tag) => subject.clone(),
            Some(subject) => format!("{tag} {subject}"),
            None => tag,
        };
        return PresentedContent {
            message: envelope.delivery.message.clone(),
            subject: Some(subject),
        };
    }

    let message = envelope.delivery.message.as_ref().map(|m| {
        if m.starts_with(&tag) {
            m.clone()
        } else {
            format!("{tag} {m}")
        }
    });
    PresentedContent {
        message,
        subject: envelope.delivery.subject.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn telegram_messages_get_the_origin_prefix() {
        let envelope = NotifyV1::send("health", "telegram", "Your BP is logged");
        let presented = present(&envelope);
        assert_eq!(presented.message.as_deref(), Some("[health] Your BP is logged"));
    }

    #[test]
    fn email_gets_the_origin_in_the_subject() {
        let mut envelope = NotifyV1::send("finance", "email", "See attached");
        envelope.delivery.subject = Some("Monthly statement".to_owned());
        let presented = present(&envelope);
        assert_eq!(presented.subject.as_deref(), Some("[finance] Monthly statement"));
        assert_eq!(presented.message.as_deref(), Some("See attached"));
    }

    #[test]
    fn email_without_subject_gets_a_bare_tag() {
        let envelope = NotifyV1::send("finance", "email", "body");
        let presented = present(&envelope);
        assert_eq!(presented.subject.as_deref(), Some("[finance]"));
    }

    #[test]
    fn existing_tag_is_not_duplicated() {
        let envelope = NotifyV1::send("health", "telegram", "[health] already tagged");
        let presented = present(&envelope);
        assert_eq!(presented.message.as_deref(), Some("[health] already tagged"));
    }
}
