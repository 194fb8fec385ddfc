// Integration tests for the betting console.
//
// These exercise the full client end-to-end through the library crate's
// public API: a mock REST server answers snapshot and mutation requests, a
// mock SSE server feeds the event stream, and the engine is driven through
// the same handle the console binary uses.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};

use betting_console::api::ApiClient;
use betting_console::config::{Config, EngineConfig, ServerConfig};
use betting_console::engine::{self, EngineCommand, EngineUpdate, ViewSnapshot};
use betting_console::sse::ConnectionState;
use betting_console::store::BetStatus;

// ===========================================================================
// Mock servers
// ===========================================================================

/// Serve canned JSON responses keyed by "METHOD /path". Unknown routes get a
/// 404. Each connection answers one request and closes, so the client opens
/// a fresh connection per request.
async fn spawn_rest_mock(routes: HashMap<String, String>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let routes = Arc::new(routes);

    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                break;
            };
            let routes = Arc::clone(&routes);
            tokio::spawn(async move {
                let mut buf = vec![0u8; 4096];
                let Ok(n) = socket.read(&mut buf).await else {
                    return;
                };
                let request = String::from_utf8_lossy(&buf[..n]).to_string();
                let route = request
                    .lines()
                    .next()
                    .and_then(|line| line.rsplit_once(" HTTP/"))
                    .map(|(head, _)| head.to_string())
                    .unwrap_or_default();

                let (status, body) = match routes.get(&route) {
                    Some(body) => ("HTTP/1.1 200 OK", body.clone()),
                    None => (
                        "HTTP/1.1 404 Not Found",
                        r#"{"error": "not found"}"#.to_string(),
                    ),
                };
                let response = format!(
                    "{status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = socket.write_all(response.as_bytes()).await;
            });
        }
    });

    addr
}

/// Serve the SSE endpoint: every connection gets the immediate frames right
/// away and the delayed frames after a pause, then the stream is held open
/// so the client does not reconnect.
async fn spawn_sse_mock(
    immediate: Vec<(&'static str, String)>,
    delayed: Vec<(&'static str, String)>,
) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                break;
            };
            let mut buf = vec![0u8; 4096];
            let _ = socket.read(&mut buf).await;

            let mut response = String::from(
                "HTTP/1.1 200 OK\r\nContent-Type: text/event-stream\r\nCache-Control: no-cache\r\n\r\n",
            );
            for (event, data) in &immediate {
                response.push_str(&format!("event: {event}\ndata: {data}\n\n"));
            }
            if socket.write_all(response.as_bytes()).await.is_err() {
                continue;
            }

            if !delayed.is_empty() {
                sleep(Duration::from_millis(300)).await;
                let mut late = String::new();
                for (event, data) in &delayed {
                    late.push_str(&format!("event: {event}\ndata: {data}\n\n"));
                }
                if socket.write_all(late.as_bytes()).await.is_err() {
                    continue;
                }
            }

            // Hold the stream open until the client goes away.
            let mut idle = vec![0u8; 16];
            let _ = socket.read(&mut idle).await;
        }
    });

    addr
}

// ===========================================================================
// Fixtures and helpers
// ===========================================================================

/// Two accounts; account 1 has an active batch with one pending bet plus a
/// completed batch, account 2 has one active batch.
fn fixture_routes() -> HashMap<String, String> {
    let mut routes = HashMap::new();
    routes.insert(
        "GET /api/v1/accounts".to_string(),
        r#"[{"id": 1, "name": "A", "hostname": "rig-1"},
            {"id": 2, "name": "B", "hostname": "rig-2"}]"#
            .to_string(),
    );
    routes.insert(
        "GET /api/v1/accounts/1".to_string(),
        r#"{"id": 1, "name": "A", "hostname": "rig-1"}"#.to_string(),
    );
    routes.insert(
        "GET /api/v1/accounts/1/batches".to_string(),
        r#"[{"id": 10, "account_id": 1, "completed": false,
             "meta": {"market": "match_odds"},
             "bets": [{"pid": "p1", "id": 1, "selection": "Home", "stake": 10.0,
                       "cost": 9.5, "status": "pending", "batch_id": 10}]},
            {"id": 99, "account_id": 1, "completed": true, "meta": null, "bets": []}]"#
            .to_string(),
    );
    routes.insert(
        "GET /api/v1/accounts/2".to_string(),
        r#"{"id": 2, "name": "B", "hostname": "rig-2"}"#.to_string(),
    );
    routes.insert(
        "GET /api/v1/accounts/2/batches".to_string(),
        r#"[{"id": 20, "account_id": 2, "completed": false, "meta": null, "bets": []}]"#
            .to_string(),
    );
    routes
}

fn test_config(rest: SocketAddr, sse: SocketAddr) -> Config {
    Config {
        server: ServerConfig {
            base_url: format!("http://{rest}"),
            sse_url: format!("http://{sse}/sse"),
            request_timeout_secs: 5,
        },
        engine: EngineConfig {
            focus_new_accounts: true,
            stale_stream_secs: 30,
        },
    }
}

fn start_engine(config: &Config) -> engine::EngineHandle {
    let api = ApiClient::new(
        &config.server.base_url,
        Duration::from_secs(config.server.request_timeout_secs),
    )
    .unwrap();
    engine::start(config, Arc::new(api))
}

/// Drain updates until a snapshot satisfies the predicate, skipping other
/// update kinds along the way. Panics after two seconds.
async fn wait_for_snapshot<F>(
    updates: &mut mpsc::Receiver<EngineUpdate>,
    mut predicate: F,
) -> ViewSnapshot
where
    F: FnMut(&ViewSnapshot) -> bool,
{
    let wait = async {
        loop {
            match updates.recv().await {
                Some(EngineUpdate::Snapshot(snapshot)) if predicate(&snapshot) => {
                    return *snapshot;
                }
                Some(_) => continue,
                None => panic!("update channel closed while waiting for a snapshot"),
            }
        }
    };
    timeout(Duration::from_secs(2), wait)
        .await
        .expect("timed out waiting for a matching snapshot")
}

async fn wait_for_connection(updates: &mut mpsc::Receiver<EngineUpdate>, want: ConnectionState) {
    let wait = async {
        loop {
            match updates.recv().await {
                Some(EngineUpdate::Connection(state)) if state == want => return,
                Some(_) => continue,
                None => panic!("update channel closed while waiting for {want}"),
            }
        }
    };
    timeout(Duration::from_secs(2), wait)
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for connection state {want}"));
}

// ===========================================================================
// Test: startup and snapshot loading
// ===========================================================================

#[tokio::test]
async fn startup_loads_accounts_and_the_focused_view() {
    let rest = spawn_rest_mock(fixture_routes()).await;
    // A malformed frame on the way in must not disturb anything.
    let sse = spawn_sse_mock(
        vec![
            ("account_created", "{not json".to_string()),
            ("ping", String::new()),
        ],
        vec![],
    )
    .await;
    let config = test_config(rest, sse);
    let mut handle = start_engine(&config);

    let snapshot = wait_for_snapshot(&mut handle.updates, |s| {
        s.focused_account == Some(1) && !s.batches.is_empty()
    })
    .await;

    assert_eq!(snapshot.accounts.len(), 2);
    assert_eq!(snapshot.accounts[0].name, "A");
    assert_eq!(snapshot.batches.len(), 1, "completed batch stays out of the working set");
    assert_eq!(snapshot.batches[0].id, 10);
    assert_eq!(snapshot.selected_batch, Some(10));
    assert_eq!(snapshot.batches[0].bets[0].pid, "p1");
    assert_eq!(snapshot.batches[0].bets[0].status, BetStatus::Pending);

    handle.teardown().await;
}

#[tokio::test]
async fn connection_state_reaches_open_then_closed_on_shutdown() {
    let rest = spawn_rest_mock(fixture_routes()).await;
    let sse = spawn_sse_mock(vec![("ping", String::new())], vec![]).await;
    let config = test_config(rest, sse);
    let mut handle = start_engine(&config);

    wait_for_connection(&mut handle.updates, ConnectionState::Open).await;

    handle.commands.send(EngineCommand::Shutdown).await.unwrap();
    wait_for_connection(&mut handle.updates, ConnectionState::Closed).await;
}

// ===========================================================================
// Test: stream events flowing into the view
// ===========================================================================

#[tokio::test]
async fn stream_events_update_the_projection() {
    let mut routes = fixture_routes();
    // The server also knows about batch 11, matching the creation event.
    routes.insert(
        "GET /api/v1/accounts/1/batches".to_string(),
        r#"[{"id": 10, "account_id": 1, "completed": false,
             "meta": {"market": "match_odds"},
             "bets": [{"pid": "p1", "id": 1, "selection": "Home", "stake": 10.0,
                       "cost": 9.5, "status": "pending", "batch_id": 10}]},
            {"id": 11, "account_id": 1, "completed": false, "meta": null, "bets": []}]"#
            .to_string(),
    );
    let rest = spawn_rest_mock(routes).await;
    let sse = spawn_sse_mock(
        vec![(
            "batch_created",
            r#"{"id": 11, "account_id": 1, "completed": false}"#.to_string(),
        )],
        vec![(
            "bet_status_updated",
            r#"{"batch_id": 10, "pid": "p1", "status": "successful"}"#.to_string(),
        )],
    )
    .await;
    let config = test_config(rest, sse);
    let mut handle = start_engine(&config);

    let snapshot = wait_for_snapshot(&mut handle.updates, |s| {
        s.batches.len() == 2
            && s.batches
                .iter()
                .any(|b| b.bets.iter().any(|bet| bet.status == BetStatus::Successful))
    })
    .await;

    assert_eq!(snapshot.focused_account, Some(1));
    let mut ids: Vec<i64> = snapshot.batches.iter().map(|b| b.id).collect();
    ids.sort_unstable();
    assert_eq!(ids, vec![10, 11]);
    let bet = &snapshot.batches.iter().find(|b| b.id == 10).unwrap().bets[0];
    assert_eq!(bet.status, BetStatus::Successful);
    assert_eq!(bet.selection, "Home", "only the status changed");
    assert!(snapshot.selected_batch.is_some());

    handle.teardown().await;
}

#[tokio::test]
async fn account_deleted_refocuses_and_reloads_the_next_account() {
    let rest = spawn_rest_mock(fixture_routes()).await;
    let sse = spawn_sse_mock(
        vec![("ping", String::new())],
        vec![("account_deleted", r#"{"id": 1}"#.to_string())],
    )
    .await;
    let config = test_config(rest, sse);
    let mut handle = start_engine(&config);

    // Settle on account 1 first, then let the deletion arrive.
    wait_for_snapshot(&mut handle.updates, |s| {
        s.focused_account == Some(1) && !s.batches.is_empty()
    })
    .await;

    let snapshot = wait_for_snapshot(&mut handle.updates, |s| {
        s.focused_account == Some(2) && !s.batches.is_empty()
    })
    .await;

    assert_eq!(snapshot.accounts.len(), 1);
    assert_eq!(snapshot.accounts[0].id, 2);
    assert_eq!(snapshot.batches[0].id, 20);
    assert_eq!(snapshot.selected_batch, Some(20));

    handle.teardown().await;
}

// ===========================================================================
// Test: mutations through the engine handle
// ===========================================================================

#[tokio::test]
async fn submit_batch_round_trip_evicts_the_batch() {
    let mut routes = fixture_routes();
    routes.insert(
        "DELETE /api/v1/accounts/1/batches/10".to_string(),
        "{}".to_string(),
    );
    let rest = spawn_rest_mock(routes).await;
    let sse = spawn_sse_mock(vec![("ping", String::new())], vec![]).await;
    let config = test_config(rest, sse);
    let mut handle = start_engine(&config);

    wait_for_snapshot(&mut handle.updates, |s| s.selected_batch == Some(10)).await;

    handle
        .commands
        .send(EngineCommand::SubmitBatch { account_id: 1, batch_id: 10 })
        .await
        .unwrap();

    let snapshot = wait_for_snapshot(&mut handle.updates, |s| s.batches.is_empty()).await;
    assert_eq!(snapshot.selected_batch, None);
    assert_eq!(snapshot.focused_account, Some(1));

    handle.teardown().await;
}

#[tokio::test]
async fn set_bet_status_round_trip_merges_the_response() {
    let mut routes = fixture_routes();
    routes.insert(
        "PATCH /api/v1/accounts/1/batches/10/bets/p1".to_string(),
        r#"{"pid": "p1", "id": 1, "selection": "Home", "stake": 10.0,
            "cost": 9.5, "status": "failed", "batch_id": 10}"#
            .to_string(),
    );
    let rest = spawn_rest_mock(routes).await;
    let sse = spawn_sse_mock(vec![("ping", String::new())], vec![]).await;
    let config = test_config(rest, sse);
    let mut handle = start_engine(&config);

    wait_for_snapshot(&mut handle.updates, |s| s.selected_batch == Some(10)).await;

    handle
        .commands
        .send(EngineCommand::SetBetStatus {
            account_id: 1,
            batch_id: 10,
            pid: "p1".to_string(),
            status: BetStatus::Failed,
        })
        .await
        .unwrap();

    let snapshot = wait_for_snapshot(&mut handle.updates, |s| {
        s.batches
            .first()
            .is_some_and(|b| b.bets[0].status == BetStatus::Failed)
    })
    .await;
    assert_eq!(snapshot.batches[0].bets[0].stake, 10.0);

    handle.teardown().await;
}

#[tokio::test]
async fn rejected_mutation_surfaces_an_error_and_changes_nothing() {
    // No DELETE route: the submit gets a 404 from the mock.
    let rest = spawn_rest_mock(fixture_routes()).await;
    let sse = spawn_sse_mock(vec![("ping", String::new())], vec![]).await;
    let config = test_config(rest, sse);
    let mut handle = start_engine(&config);

    wait_for_snapshot(&mut handle.updates, |s| s.selected_batch == Some(10)).await;

    handle
        .commands
        .send(EngineCommand::SubmitBatch { account_id: 1, batch_id: 10 })
        .await
        .unwrap();

    let failure = timeout(Duration::from_secs(2), async {
        loop {
            match handle.updates.recv().await {
                Some(EngineUpdate::MutationFailed(message)) => return message,
                Some(_) => continue,
                None => panic!("update channel closed before the failure surfaced"),
            }
        }
    })
    .await
    .expect("timed out waiting for the mutation failure");
    assert!(failure.contains("batch submit"));

    // The batch is still there.
    handle.commands.send(EngineCommand::Refresh).await.unwrap();
    let snapshot =
        wait_for_snapshot(&mut handle.updates, |s| s.selected_batch == Some(10)).await;
    assert_eq!(snapshot.batches.len(), 1);

    handle.teardown().await;
}
