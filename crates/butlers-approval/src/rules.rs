//! Standing rule matching.

use chrono::{DateTime, Utc};

use crate::types::{ArgConstraint, StandingRule};

/// Whether one constraint is satisfied by the supplied arguments.
#[must_use]
pub fn constraint_matches(
    args: &serde_json::Value,
    arg_name: &str,
    constraint: &ArgConstraint,
) -> bool {
    let Some(value) = args.get(arg_name) else {
        return false;
    };
    match constraint {
        ArgConstraint::Exact(expected) => value == expected,
        ArgConstraint::Prefix(prefix) => value
            .as_str()
            .is_some_and(|s| s.starts_with(prefix.as_str())),
    }
}

/// Whether a rule pre-approves a call to `tool_name` with `args` at
/// `now`: the tool matches, every declared constraint holds, and the
/// rule is active, within its use limit, and unexpired.
#[must_use]
pub fn rule_matches(
    rule: &StandingRule,
    tool_name: &str,
    args: &serde_json::Value,
    now: DateTime<Utc>,
) -> bool {
    if !rule.active || rule.tool_name != tool_name {
        return false;
    }
    if rule
        .use_limit
        .is_some_and(|limit| rule.use_count >= limit)
    {
        return false;
    }
    if rule.expires_at.is_some_and(|expiry| now >= expiry) {
        return false;
    }
    rule.arg_constraints
        .iter()
        .all(|(name, constraint)| constraint_matches(args, name, constraint))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use uuid::Uuid;

    fn rule(constraints: BTreeMap<String, ArgConstraint>) -> StandingRule {
        StandingRule {
            rule_id: Uuid::new_v4(),
            tool_name: "user_telegram_send_message".to_owned(),
            arg_constraints: constraints,
            active: true,
            use_count: 0,
            use_limit: None,
            expires_at: None,
            owner: "owner".to_owned(),
            created_at: Utc::now(),
        }
    }

    fn args() -> serde_json::Value {
        serde_json::json!({"chat": "chat-5", "message": "hello"})
    }

    #[test]
    fn bare_rule_matches_tool_name() {
        let r = rule(BTreeMap::new());
        assert!(rule_matches(&r, "user_telegram_send_message", &args(), Utc::now()));
        assert!(!rule_matches(&r, "user_email_send", &args(), Utc::now()));
    }

    #[test]
    fn exact_constraint() {
        let mut constraints = BTreeMap::new();
        constraints.insert(
            "chat".to_owned(),
            ArgConstraint::Exact(serde_json::json!("chat-5")),
        );
        let r = rule(constraints);
        assert!(rule_matches(&r, "user_telegram_send_message", &args(), Utc::now()));

        let other = serde_json::json!({"chat": "chat-6", "message": "hello"});
        assert!(!rule_matches(&r, "user_telegram_send_message", &other, Utc::now()));
    }

    #[test]
    fn prefix_constraint() {
        let mut constraints = BTreeMap::new();
        constraints.insert(
            "message".to_owned(),
            ArgConstraint::Prefix("hel".to_owned()),
        );
        let r = rule(constraints);
        assert!(rule_matches(&r, "user_telegram_send_message", &args(), Utc::now()));

        let other = serde_json::json!({"chat": "chat-5", "message": "bye"});
        assert!(!rule_matches(&r, "user_telegram_send_message", &other, Utc::now()));
    }

    #[test]
    fn missing_argument_fails_the_constraint() {
        let mut constraints = BTreeMap::new();
        constraints.insert(
            "subject".to_owned(),
            ArgConstraint::Prefix("Re:".to_owned()),
        );
        let r = rule(constraints);
        assert!(!rule_matches(&r, "user_telegram_send_message", &args(), Utc::now()));
    }

    #[test]
    fn exhausted_use_limit_disables_the_rule() {
        let mut r = rule(BTreeMap::new());
        r.use_limit = Some(3);
        r.use_count = 3;
        assert!(!rule_matches(&r, "user_telegram_send_message", &args(), Utc::now()));
        r.use_count = 2;
        assert!(rule_matches(&r, "user_telegram_send_message", &args(), Utc::now()));
    }

    #[test]
    fn expired_rule_does_not_match() {
        let mut r = rule(BTreeMap::new());
        r.expires_at = Some(Utc::now() - chrono::Duration::seconds(1));
        assert!(!rule_matches(&r, "user_telegram_send_message", &args(), Utc::now()));
    }

    #[test]
    fn inactive_rule_does_not_match() {
        let mut r = rule(BTreeMap::new());
        r.active = false;
        assert!(!rule_matches(&r, "user_telegram_send_message", &args(), Utc::now()));
    }
}
