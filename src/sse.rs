// Server-sent event transport.
//
// Opens the server's `/sse` stream and forwards decoded events to the engine
// over a channel, tagged with connection state transitions in arrival order.
// Reconnection is the transport's own job: `EventSource` retries dropped
// connections internally, so this module only reports the state change and
// keeps polling. The stream is opened once per engine lifetime and is never
// torn down by focus changes; only engine teardown stops it.

use std::fmt;

use futures_util::{Stream, StreamExt};
use reqwest_eventsource::{Event, RequestBuilderExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::events::{decode_event, StreamEvent};

/// Lifecycle of the event stream connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// First attempt in progress, nothing acknowledged yet.
    Connecting,
    /// Server acknowledged the stream.
    Open,
    /// Transport dropped; retries are underway.
    Reconnecting,
    /// Torn down for good. Only explicit shutdown produces this.
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Open => "open",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// What the transport reports to the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamUpdate {
    State(ConnectionState),
    Event(StreamEvent),
}

/// Open the stream and forward updates until the engine side goes away.
pub async fn run(sse_url: String, tx: mpsc::Sender<StreamUpdate>) -> anyhow::Result<()> {
    info!("Opening event stream at {}", sse_url);

    let client = reqwest::Client::new();
    let source = client.get(&sse_url).eventsource()?;

    let _ = process_event_source(source, &tx).await;
    info!("Event stream task finished");
    Ok(())
}

/// Forward one event source to the engine channel.
///
/// Returns `Err(())` when the engine's receiver is gone, the signal to stop.
/// Transport errors are not terminal here: the source retries on its own, so
/// an error surfaces once as `Reconnecting` and polling continues. Repeated
/// states are collapsed so the engine only sees transitions.
pub async fn process_event_source<St>(
    mut source: St,
    tx: &mpsc::Sender<StreamUpdate>,
) -> Result<(), ()>
where
    St: Stream<Item = Result<Event, reqwest_eventsource::Error>> + Unpin,
{
    let mut last_state = None;

    while let Some(item) = source.next().await {
        match item {
            Ok(Event::Open) => {
                forward_state(tx, &mut last_state, ConnectionState::Open).await?;
            }
            Ok(Event::Message(message)) => match decode_event(&message.event, &message.data) {
                Ok(event) => {
                    debug!("Stream event: {}", message.event);
                    if tx.send(StreamUpdate::Event(event)).await.is_err() {
                        return Err(());
                    }
                }
                Err(err) => {
                    // Malformed payloads are logged and dropped; the stream
                    // itself stays up.
                    warn!("Dropping undecodable {} event: {}", message.event, err);
                }
            },
            Err(err) => {
                warn!("Event stream interrupted: {}", err);
                forward_state(tx, &mut last_state, ConnectionState::Reconnecting).await?;
            }
        }
    }

    Ok(())
}

async fn forward_state(
    tx: &mpsc::Sender<StreamUpdate>,
    last: &mut Option<ConnectionState>,
    next: ConnectionState,
) -> Result<(), ()> {
    if *last == Some(next) {
        return Ok(());
    }
    *last = Some(next);
    tx.send(StreamUpdate::State(next)).await.map_err(|_| ())
}
