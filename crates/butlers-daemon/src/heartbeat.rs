//! The Heartbeat butler's fleet tick.
//!
//! A single scheduled job: list every registered butler and drive its
//! scheduler tick. Targets are independent; one unreachable butler
//! never blocks the rest.

use tracing::{info, warn};

use butlers_rpc::ButlerClient;

/// Tick every registered butler once. Returns a human-readable
/// summary for `last_result`.
pub async fn run_fleet_tick(switchboard: &ButlerClient) -> String {
    let records = match switchboard.registry_list().await {
        Ok(records) => records,
        Err(e) => return format!("error: registry unavailable: {e}"),
    };

    let mut ticked: u32 = 0;
    let mut failed: u32 = 0;
    for record in records {
        let Some(name) = record.get("name").and_then(|v| v.as_str()) else {
            continue;
        };
        let Some(endpoint) = record.get("endpoint_url").and_then(|v| v.as_str()) else {
            continue;
        };
        match ButlerClient::connect(endpoint) {
            Ok(client) => match client.tick().await {
                Ok(_) => {
                    ticked = ticked.saturating_add(1);
                },
                Err(e) => {
                    failed = failed.saturating_add(1);
                    warn!(butler = name, error = %e, "fleet tick failed");
                },
            },
            Err(e) => {
                failed = failed.saturating_add(1);
                warn!(butler = name, error = %e, "fleet tick connect failed");
            },
        }
    }
    info!(ticked, failed, "fleet tick complete");
    format!("ticked {ticked} butlers ({failed} failed)")
}
