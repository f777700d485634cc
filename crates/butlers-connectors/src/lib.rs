//! Butlers Connectors - Transport-only channel adapters.
//!
//! A connector polls or receives push notifications from a provider,
//! normalizes events into `ingest.v1`, and submits them to
//! Switchboard's canonical ingest boundary. Connectors never classify,
//! never route, and never call specialist butlers directly.
//!
//! Resume cursors persist outside process memory and advance only
//! after Switchboard accepts an event, so at-least-once provider
//! delivery is tolerated (the dedupe key absorbs replays). Every
//! connector emits periodic `connector.heartbeat.v1` beacons.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]

mod cursor;
mod email;
mod error;
mod sink;
mod telegram;

pub use cursor::FileCursor;
pub use email::{EmailPoller, MailFetcher, MailMessage};
pub use error::{ConnectorError, ConnectorResult};
pub use sink::{IngestSink, RpcIngestSink};
pub use telegram::{TelegramConnector, TelegramEvent};
