//! SSE streaming of configuration changes.
//!
//! Converts the facade's change broadcast into an SSE stream, one
//! `config_change` event per change, optionally limited to a single key.

use axum::response::sse::Event;
use futures::stream::Stream;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tracing::warn;

use crate::cache::facade::{ChangeOrigin, ConfigChange};

/// Wire shape of one change event.
#[derive(Debug, Serialize)]
pub struct ChangeEvent {
    pub key: String,
    pub value: Value,
    pub previous: Value,
    pub origin: ChangeOrigin,
}

impl From<ConfigChange> for ChangeEvent {
    fn from(change: ConfigChange) -> Self {
        Self {
            key: change.key,
            value: change.new_value,
            previous: change.old_value,
            origin: change.origin,
        }
    }
}

/// Convert a change receiver into an SSE stream.
pub fn changes_to_sse_stream(
    rx: broadcast::Receiver<ConfigChange>,
    key: Option<String>,
) -> impl Stream<Item = Result<Event, std::convert::Infallible>> {
    BroadcastStream::new(rx).filter_map(move |item| {
        let change = match item {
            Ok(change) => change,
            Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                warn!(skipped, "SSE client lagged, changes dropped");
                return None;
            }
        };
        if key.as_deref().is_some_and(|k| k != change.key) {
            return None;
        }

        let data = serde_json::to_string(&ChangeEvent::from(change)).unwrap_or_default();
        Some(Ok(Event::default().event("config_change").data(data)))
    })
}
