//! Built-in migration chains.
//!
//! The core chain creates the three tables every butler owns: `state`,
//! `scheduled_tasks`, and `sessions`. Plane-specific chains (switchboard
//! inbox/registry, messenger delivery audit, approvals, memory) live
//! here too so revision ids stay globally unique and reviewable in one
//! place.

use crate::migrate::{Migration, MigrationChain};

/// The shared core chain: `state`, `scheduled_tasks`, `sessions`.
#[must_use]
pub fn core_chain() -> MigrationChain {
    MigrationChain::new(
        "core",
        vec![Migration::new(
            "core_0001_initial",
            r"
            CREATE TABLE IF NOT EXISTS state (
                key TEXT PRIMARY KEY,
                value JSONB NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
            );

            CREATE TABLE IF NOT EXISTS scheduled_tasks (
                name TEXT PRIMARY KEY,
                cron TEXT NOT NULL,
                prompt TEXT,
                job_name TEXT,
                enabled BOOLEAN NOT NULL DEFAULT TRUE,
                source TEXT NOT NULL DEFAULT 'config',
                last_run_at TIMESTAMPTZ,
                last_result TEXT,
                next_run_at TIMESTAMPTZ,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
            );

            CREATE TABLE IF NOT EXISTS sessions (
                id UUID PRIMARY KEY,
                started_at TIMESTAMPTZ NOT NULL,
                trigger_source TEXT NOT NULL,
                prompt TEXT NOT NULL,
                model TEXT NOT NULL,
                parent_session_id UUID,
                request_id UUID,
                subrequest_id UUID,
                segment_id TEXT,
                completed_at TIMESTAMPTZ,
                success BOOLEAN,
                result TEXT,
                error TEXT,
                tool_calls BIGINT NOT NULL DEFAULT 0,
                input_tokens BIGINT NOT NULL DEFAULT 0,
                output_tokens BIGINT NOT NULL DEFAULT 0,
                duration_ms BIGINT,
                trace_id TEXT,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now()
            );
            CREATE INDEX IF NOT EXISTS sessions_started_at_idx
                ON sessions (started_at DESC);
            CREATE INDEX IF NOT EXISTS sessions_trigger_source_idx
                ON sessions (trigger_source);
            ",
        )],
    )
}

/// Switchboard-owned tables: registry, inbox (month-partitioned),
/// routing log, connector heartbeat log.
#[must_use]
pub fn switchboard_chain() -> MigrationChain {
    MigrationChain::new(
        "switchboard",
        vec![Migration::new(
            "switchboard_0001_initial",
            r"
            CREATE TABLE IF NOT EXISTS butler_registry (
                name TEXT PRIMARY KEY,
                endpoint_url TEXT NOT NULL,
                modules JSONB NOT NULL DEFAULT '[]'::jsonb,
                capabilities JSONB NOT NULL DEFAULT '[]'::jsonb,
                last_seen_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                route_contract_min INT NOT NULL DEFAULT 1,
                route_contract_max INT NOT NULL DEFAULT 1,
                advertise_flag BOOLEAN NOT NULL DEFAULT TRUE,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
            );

            CREATE TABLE IF NOT EXISTS message_inbox (
                request_id UUID NOT NULL,
                dedupe_key TEXT NOT NULL,
                request_context JSONB NOT NULL,
                raw_payload JSONB NOT NULL,
                normalized_text TEXT NOT NULL,
                classification_result JSONB,
                dispatch_outcomes JSONB NOT NULL DEFAULT '[]'::jsonb,
                response_summary TEXT,
                lifecycle_state TEXT NOT NULL DEFAULT 'PROGRESS',
                received_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                completed_at TIMESTAMPTZ,
                PRIMARY KEY (request_id, received_at)
            ) PARTITION BY RANGE (received_at);
            CREATE UNIQUE INDEX IF NOT EXISTS message_inbox_dedupe_idx
                ON message_inbox (dedupe_key, received_at);

            CREATE TABLE IF NOT EXISTS routing_log (
                id BIGINT GENERATED ALWAYS AS IDENTITY PRIMARY KEY,
                request_id UUID NOT NULL,
                subrequest_id UUID NOT NULL,
                segment_id TEXT,
                target_butler TEXT NOT NULL,
                tool TEXT NOT NULL,
                outcome TEXT NOT NULL,
                error_class TEXT,
                duration_ms BIGINT NOT NULL,
                started_at TIMESTAMPTZ NOT NULL
            );
            CREATE INDEX IF NOT EXISTS routing_log_request_idx
                ON routing_log (request_id);

            CREATE TABLE IF NOT EXISTS connector_heartbeat_log (
                id BIGINT GENERATED ALWAYS AS IDENTITY PRIMARY KEY,
                channel TEXT NOT NULL,
                endpoint_identity TEXT NOT NULL,
                emitted_at TIMESTAMPTZ NOT NULL,
                accepted_since_last BIGINT NOT NULL DEFAULT 0,
                received_at TIMESTAMPTZ NOT NULL DEFAULT now()
            );
            CREATE INDEX IF NOT EXISTS connector_heartbeat_endpoint_idx
                ON connector_heartbeat_log (endpoint_identity, emitted_at DESC);
            ",
        )],
    )
}

/// Messenger-owned delivery audit tables.
#[must_use]
pub fn messenger_chain() -> MigrationChain {
    MigrationChain::new(
        "messenger",
        vec![Migration::new(
            "messenger_0001_initial",
            r"
            CREATE TABLE IF NOT EXISTS delivery_requests (
                delivery_id UUID PRIMARY KEY,
                idempotency_key TEXT NOT NULL UNIQUE,
                origin_butler TEXT NOT NULL,
                channel TEXT NOT NULL,
                intent TEXT NOT NULL,
                resolved_target TEXT,
                content_hash TEXT NOT NULL,
                status TEXT NOT NULL,
                provider_delivery_id TEXT,
                error_class TEXT,
                error_message TEXT,
                request_id UUID,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                terminal_at TIMESTAMPTZ
            );

            CREATE TABLE IF NOT EXISTS delivery_attempts (
                id BIGINT GENERATED ALWAYS AS IDENTITY PRIMARY KEY,
                delivery_id UUID NOT NULL REFERENCES delivery_requests (delivery_id),
                attempted_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                outcome TEXT NOT NULL,
                latency_ms BIGINT NOT NULL,
                error_class TEXT,
                retryable BOOLEAN NOT NULL DEFAULT FALSE
            );
            CREATE INDEX IF NOT EXISTS delivery_attempts_delivery_idx
                ON delivery_attempts (delivery_id);

            CREATE TABLE IF NOT EXISTS delivery_receipts (
                id BIGINT GENERATED ALWAYS AS IDENTITY PRIMARY KEY,
                delivery_id UUID NOT NULL REFERENCES delivery_requests (delivery_id),
                provider_delivery_id TEXT,
                received_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                payload JSONB NOT NULL
            );

            CREATE TABLE IF NOT EXISTS delivery_dead_letter (
                id BIGINT GENERATED ALWAYS AS IDENTITY PRIMARY KEY,
                delivery_id UUID NOT NULL REFERENCES delivery_requests (delivery_id),
                idempotency_key TEXT NOT NULL,
                reason TEXT NOT NULL,
                replay_eligible BOOLEAN NOT NULL DEFAULT TRUE,
                quarantined_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                replayed_at TIMESTAMPTZ
            );

            CREATE TABLE IF NOT EXISTS contact_info (
                contact_id TEXT NOT NULL,
                channel TEXT NOT NULL,
                identifier TEXT NOT NULL,
                display_name TEXT,
                deleted BOOLEAN NOT NULL DEFAULT FALSE,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                PRIMARY KEY (contact_id, channel)
            );
            ",
        )],
    )
}

/// Approval gate tables.
#[must_use]
pub fn approvals_chain() -> MigrationChain {
    MigrationChain::new(
        "approvals",
        vec![Migration::new(
            "approvals_0001_initial",
            r"
            CREATE TABLE IF NOT EXISTS approval_actions (
                action_id UUID PRIMARY KEY,
                tool_name TEXT NOT NULL,
                args JSONB NOT NULL,
                requested_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                expires_at TIMESTAMPTZ NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                decided_by TEXT,
                decided_at TIMESTAMPTZ,
                result JSONB
            );
            CREATE INDEX IF NOT EXISTS approval_actions_status_idx
                ON approval_actions (status, requested_at);

            CREATE TABLE IF NOT EXISTS approval_standing_rules (
                rule_id UUID PRIMARY KEY,
                tool_name TEXT NOT NULL,
                arg_constraints JSONB NOT NULL DEFAULT '{}'::jsonb,
                active BOOLEAN NOT NULL DEFAULT TRUE,
                use_count BIGINT NOT NULL DEFAULT 0,
                use_limit BIGINT,
                expires_at TIMESTAMPTZ,
                owner TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
            );
            ",
        )],
    )
}

/// Memory module tables: episodes, facts, rules.
#[must_use]
pub fn memory_chain() -> MigrationChain {
    MigrationChain::new(
        "memory",
        vec![Migration::new(
            "memory_0001_initial",
            r"
            CREATE TABLE IF NOT EXISTS memory_episodes (
                id UUID PRIMARY KEY,
                tenant TEXT NOT NULL,
                content TEXT NOT NULL,
                consolidation_state TEXT NOT NULL DEFAULT 'pending',
                retry_count INT NOT NULL DEFAULT 0,
                last_error TEXT,
                expires_at TIMESTAMPTZ NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
            );
            CREATE INDEX IF NOT EXISTS memory_episodes_tenant_idx
                ON memory_episodes (tenant, created_at DESC);

            CREATE TABLE IF NOT EXISTS memory_facts (
                id UUID PRIMARY KEY,
                tenant TEXT NOT NULL,
                scope TEXT NOT NULL,
                subject TEXT NOT NULL,
                predicate TEXT NOT NULL,
                content TEXT NOT NULL,
                state TEXT NOT NULL DEFAULT 'active',
                confidence DOUBLE PRECISION NOT NULL DEFAULT 0.5,
                decay_rate DOUBLE PRECISION NOT NULL DEFAULT 0.01,
                importance DOUBLE PRECISION NOT NULL DEFAULT 0.5,
                last_confirmed_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
            );
            CREATE UNIQUE INDEX IF NOT EXISTS memory_facts_active_unique
                ON memory_facts (tenant, scope, subject, predicate)
                WHERE state = 'active';

            CREATE TABLE IF NOT EXISTS memory_rules (
                id UUID PRIMARY KEY,
                tenant TEXT NOT NULL,
                scope TEXT NOT NULL,
                content TEXT NOT NULL,
                maturity TEXT NOT NULL DEFAULT 'candidate',
                helpful_count BIGINT NOT NULL DEFAULT 0,
                harmful_count BIGINT NOT NULL DEFAULT 0,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
            );
            ",
        )],
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrate::MigrationPlan;

    #[test]
    fn all_builtin_chains_compose_without_revision_conflicts() {
        let plan = MigrationPlan::with_core()
            .then(switchboard_chain())
            .then(messenger_chain())
            .then(approvals_chain())
            .then(memory_chain());
        plan.validate().unwrap();
    }

    #[test]
    fn chain_names_match_their_owners() {
        assert_eq!(core_chain().name, "core");
        assert_eq!(switchboard_chain().name, "switchboard");
        assert_eq!(messenger_chain().name, "messenger");
        assert_eq!(approvals_chain().name, "approvals");
        assert_eq!(memory_chain().name, "memory");
    }
}
