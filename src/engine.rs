// Reconciler: the single writer over the entity store.
//
// All state converges here. Stream events, snapshot load results, and
// operator commands arrive over channels and are applied one at a time by a
// single task, in arrival order. Focus is read at the instant something is
// applied, never captured earlier, so a response that raced a focus switch
// is judged against the focus of right now. Mutations call the server first
// and merge only its authoritative answer, through the same `apply_event`
// path the stream uses; a failed mutation merges nothing.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, Instant};
use tracing::{debug, error, info, warn};

use crate::api::{ApiError, BettingApi};
use crate::config::Config;
use crate::events::StreamEvent;
use crate::sse::{self, ConnectionState, StreamUpdate};
use crate::store::{Account, AccountId, Batch, BatchId, BetStatus, Store};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// How often the engine checks for a silent stream.
pub const STALE_CHECK_INTERVAL: Duration = Duration::from_secs(5);

/// How long teardown waits for the engine loop to drain.
const TEARDOWN_TIMEOUT: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Supporting types
// ---------------------------------------------------------------------------

/// Operator commands accepted by the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineCommand {
    /// Make the given account the focused one and load its view.
    FocusAccount(AccountId),
    /// Select a batch within the focused account's working set.
    SelectBatch(BatchId),
    /// Re-fetch the account list and the focused account's view.
    Refresh,
    SetBetStatus {
        account_id: AccountId,
        batch_id: BatchId,
        pid: String,
        status: BetStatus,
    },
    SubmitBatch {
        account_id: AccountId,
        batch_id: BatchId,
    },
    CancelBatch {
        account_id: AccountId,
        batch_id: BatchId,
    },
    CreateAccount {
        name: String,
        hostname: String,
    },
    DeleteAccount(AccountId),
    /// Stop the engine loop.
    Shutdown,
}

/// Updates the engine pushes to its consumer.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineUpdate {
    /// Fresh view projection after a state change.
    Snapshot(Box<ViewSnapshot>),
    Connection(ConnectionState),
    /// A snapshot load failed; existing state was left untouched.
    LoadFailed(String),
    /// A mutation was rejected or never reached the server; nothing merged.
    MutationFailed(String),
}

/// Read-only projection of the reconciled state for display.
#[derive(Debug, Clone, PartialEq)]
pub struct ViewSnapshot {
    pub accounts: Vec<Account>,
    pub focused_account: Option<AccountId>,
    /// Active batches of the focused account, in load order.
    pub batches: Vec<Batch>,
    pub selected_batch: Option<BatchId>,
    pub connection: ConnectionState,
}

/// Outcome of a background snapshot fetch, tagged with the generation that
/// requested it.
#[derive(Debug)]
pub struct LoadResult {
    generation: u64,
    account_id: Option<AccountId>,
    outcome: Result<LoadOutcome, ApiError>,
}

#[derive(Debug)]
enum LoadOutcome {
    Accounts(Vec<Account>),
    AccountView {
        account: Account,
        batches: Vec<Batch>,
    },
}

// ---------------------------------------------------------------------------
// EngineState
// ---------------------------------------------------------------------------

/// All engine-owned state. Only the engine task touches it.
pub struct EngineState {
    pub store: Store,
    /// Account whose batches the view follows.
    pub focused_account: Option<AccountId>,
    /// Batch whose bets the view shows. Always a member of the focused
    /// account's working set.
    pub selected_batch: Option<BatchId>,
    pub connection: ConnectionState,
    /// Bumped on every focus change. View load results carry the generation
    /// that spawned them; a mismatch means the response raced a focus
    /// switch and gets discarded. u64 overflow is not a practical concern.
    pub view_generation: u64,
    /// Same guard for account-list loads, bumped on refresh. List responses
    /// are focus-independent, so a focus switch alone does not stale them.
    pub accounts_generation: u64,
    /// When true, a newly created account immediately takes focus.
    pub focus_new_accounts: bool,
    /// Stream silence tolerated before a staleness warning.
    stale_after: Duration,
    last_stream_activity: Option<Instant>,
    stale_warned: bool,
    api: Arc<dyn BettingApi>,
    update_tx: mpsc::Sender<EngineUpdate>,
    load_tx: mpsc::Sender<LoadResult>,
}

impl EngineState {
    pub fn new(
        api: Arc<dyn BettingApi>,
        focus_new_accounts: bool,
        stale_after: Duration,
        update_tx: mpsc::Sender<EngineUpdate>,
        load_tx: mpsc::Sender<LoadResult>,
    ) -> Self {
        EngineState {
            store: Store::new(),
            focused_account: None,
            selected_batch: None,
            connection: ConnectionState::Connecting,
            view_generation: 0,
            accounts_generation: 0,
            focus_new_accounts,
            stale_after,
            last_stream_activity: None,
            stale_warned: false,
            api,
            update_tx,
            load_tx,
        }
    }

    /// Point the view at `next` and start loading its snapshot. Any change
    /// of focus invalidates responses still in flight.
    fn focus_account(&mut self, next: Option<AccountId>) {
        if self.focused_account != next {
            self.focused_account = next;
            self.selected_batch = None;
            self.view_generation += 1;
        }
        if let Some(id) = next {
            self.spawn_account_view_load(id);
        }
    }

    fn spawn_accounts_load(&self) {
        let api = Arc::clone(&self.api);
        let tx = self.load_tx.clone();
        let generation = self.accounts_generation;
        tokio::spawn(async move {
            let outcome = api.accounts().await.map(LoadOutcome::Accounts);
            let _ = tx
                .send(LoadResult { generation, account_id: None, outcome })
                .await;
        });
    }

    /// Fetch one account's record and batch list together; either failing
    /// fails the whole view load.
    fn spawn_account_view_load(&self, account_id: AccountId) {
        let api = Arc::clone(&self.api);
        let tx = self.load_tx.clone();
        let generation = self.view_generation;
        tokio::spawn(async move {
            let outcome =
                match tokio::try_join!(api.account(account_id), api.batches(account_id)) {
                    Ok((account, batches)) => Ok(LoadOutcome::AccountView { account, batches }),
                    Err(err) => Err(err),
                };
            let _ = tx
                .send(LoadResult { generation, account_id: Some(account_id), outcome })
                .await;
        });
    }

    /// First batch of the focused working set, for when a selection falls
    /// away.
    fn first_active_batch(&self) -> Option<BatchId> {
        let focus = self.focused_account?;
        self.store
            .batches_for(focus)
            .find(|b| !b.completed)
            .map(|b| b.id)
    }

    /// Build the display projection from current state.
    pub fn build_snapshot(&self) -> ViewSnapshot {
        let batches = match self.focused_account {
            Some(focus) => self
                .store
                .batches_for(focus)
                .filter(|b| !b.completed)
                .cloned()
                .collect(),
            None => Vec::new(),
        };
        ViewSnapshot {
            accounts: self.store.accounts.clone(),
            focused_account: self.focused_account,
            batches,
            selected_batch: self.selected_batch,
            connection: self.connection,
        }
    }

    async fn push_snapshot(&self) {
        let snapshot = Box::new(self.build_snapshot());
        let _ = self.update_tx.send(EngineUpdate::Snapshot(snapshot)).await;
    }
}

// ---------------------------------------------------------------------------
// Engine startup and teardown
// ---------------------------------------------------------------------------

/// A running engine: the command sender and update receiver the console
/// drives, plus the tasks behind them.
pub struct EngineHandle {
    pub commands: mpsc::Sender<EngineCommand>,
    pub updates: mpsc::Receiver<EngineUpdate>,
    engine_task: JoinHandle<()>,
    stream_task: JoinHandle<()>,
}

impl EngineHandle {
    /// Stop the engine: close the stream, stop the loop, and wait briefly
    /// for it to drain.
    pub async fn teardown(self) {
        let _ = self.commands.send(EngineCommand::Shutdown).await;
        self.stream_task.abort();
        if timeout(TEARDOWN_TIMEOUT, self.engine_task).await.is_err() {
            warn!("Engine task did not stop in time");
        }
    }
}

/// Start the engine: open the event stream, kick off the initial account
/// load, and hand back the channels to drive it with.
pub fn start(config: &Config, api: Arc<dyn BettingApi>) -> EngineHandle {
    let (stream_tx, stream_rx) = mpsc::channel(256);
    let (cmd_tx, cmd_rx) = mpsc::channel(64);
    let (load_tx, load_rx) = mpsc::channel(64);
    let (update_tx, update_rx) = mpsc::channel(256);

    let state = EngineState::new(
        api,
        config.engine.focus_new_accounts,
        Duration::from_secs(config.engine.stale_stream_secs),
        update_tx,
        load_tx,
    );

    let sse_url = config.server.sse_url.clone();
    let stream_task = tokio::spawn(async move {
        if let Err(err) = sse::run(sse_url, stream_tx).await {
            error!("Event stream task failed: {:#}", err);
        }
    });

    let engine_task = tokio::spawn(async move {
        if let Err(err) = run(stream_rx, cmd_rx, load_rx, state).await {
            error!("Engine loop failed: {:#}", err);
        }
    });

    EngineHandle {
        commands: cmd_tx,
        updates: update_rx,
        engine_task,
        stream_task,
    }
}

// ---------------------------------------------------------------------------
// Main event loop
// ---------------------------------------------------------------------------

/// Reconciliation loop: sole consumer of all three inbound channels, sole
/// writer of the state.
pub async fn run(
    mut stream_rx: mpsc::Receiver<StreamUpdate>,
    mut cmd_rx: mpsc::Receiver<EngineCommand>,
    mut load_rx: mpsc::Receiver<LoadResult>,
    mut state: EngineState,
) -> anyhow::Result<()> {
    info!("Engine loop started");

    let mut stale_check = interval(STALE_CHECK_INTERVAL);
    stale_check.tick().await; // first tick completes immediately

    let _ = state
        .update_tx
        .send(EngineUpdate::Connection(state.connection))
        .await;
    state.spawn_accounts_load();

    // When the stream task goes away its channel yields None forever; stop
    // polling it so the loop does not spin.
    let mut stream_open = true;

    loop {
        tokio::select! {
            // --- Stream updates: decoded events and connection state ---
            update = stream_rx.recv(), if stream_open => {
                match update {
                    Some(update) => handle_stream_update(&mut state, update).await,
                    None => {
                        info!("Stream channel closed");
                        stream_open = false;
                    }
                }
            }

            // --- Operator commands ---
            command = cmd_rx.recv() => {
                match command {
                    Some(EngineCommand::Shutdown) | None => {
                        info!("Engine loop stopping");
                        break;
                    }
                    Some(command) => handle_command(&mut state, command).await,
                }
            }

            // --- Snapshot load results ---
            result = load_rx.recv() => {
                if let Some(result) = result {
                    handle_load_result(&mut state, result).await;
                }
            }

            // --- Stream liveness check ---
            _ = stale_check.tick() => {
                check_stream_liveness(&mut state);
            }
        }
    }

    state.connection = ConnectionState::Closed;
    let _ = state
        .update_tx
        .send(EngineUpdate::Connection(ConnectionState::Closed))
        .await;
    Ok(())
}

async fn handle_stream_update(state: &mut EngineState, update: StreamUpdate) {
    match update {
        StreamUpdate::State(next) => {
            let previous = state.connection;
            state.connection = next;
            let _ = state.update_tx.send(EngineUpdate::Connection(next)).await;

            if next == ConnectionState::Open {
                state.last_stream_activity = Some(Instant::now());
                // Events may have been missed while the transport was down,
                // so a successful reconnect re-syncs from snapshots.
                if previous == ConnectionState::Reconnecting {
                    info!("Stream restored, refreshing snapshots");
                    state.accounts_generation += 1;
                    state.spawn_accounts_load();
                }
            }
        }
        StreamUpdate::Event(event) => {
            state.last_stream_activity = Some(Instant::now());
            if state.stale_warned {
                state.stale_warned = false;
                info!("Stream activity resumed");
            }
            if apply_event(state, event) {
                state.push_snapshot().await;
            }
        }
    }
}

/// Apply one canonical event to the store and the focus/selection state.
/// Focus is read here, at application time. Returns whether anything the
/// projection shows may have changed.
fn apply_event(state: &mut EngineState, event: StreamEvent) -> bool {
    match event {
        StreamEvent::AccountCreated(account) => {
            let id = account.id;
            let mut changed = state.store.upsert_account(account);
            // A new account takes focus when the policy says so, or when
            // nothing is focused yet.
            let should_focus = state.focus_new_accounts || state.focused_account.is_none();
            if should_focus && state.focused_account != Some(id) {
                state.focus_account(Some(id));
                changed = true;
            }
            changed
        }
        StreamEvent::AccountDeleted { id } => {
            let was_focused = state.focused_account == Some(id);
            let mut changed = state.store.remove_account(id);
            if was_focused {
                // Fall back to the first remaining account, if any.
                let next = state.store.accounts.first().map(|a| a.id);
                state.focus_account(next);
                changed = true;
            }
            changed
        }
        StreamEvent::BatchCreated(batch) => {
            if batch.completed {
                // Creation can arrive already completed during replays;
                // treat it as an eviction from the working set.
                return evict_batch(state, batch.id);
            }
            if state.focused_account != Some(batch.account_id) {
                // Inbound work on another account: follow it so it is not
                // silently missed.
                info!(
                    "New batch {} on account {}, switching focus",
                    batch.id, batch.account_id
                );
                state.focus_account(Some(batch.account_id));
            }
            let id = batch.id;
            let mut changed = state.store.upsert_batch(batch);
            if state.selected_batch.is_none() {
                state.selected_batch = Some(id);
                changed = true;
            }
            changed
        }
        StreamEvent::BatchCompleted { id } => evict_batch(state, id),
        StreamEvent::BetStatusUpdated { batch_id, pid, status } => {
            // Silent no-op when the batch is not loaded: it may belong to an
            // account whose view was never fetched, or raced its own
            // completion.
            state.store.patch_bet_status(batch_id, &pid, status)
        }
        StreamEvent::Ping => false,
    }
}

/// Take a batch out of the working set, moving the selection to the next
/// available batch when it pointed at the removed one.
fn evict_batch(state: &mut EngineState, id: BatchId) -> bool {
    let mut changed = state.store.remove_batch(id);
    if state.selected_batch == Some(id) {
        state.selected_batch = state.first_active_batch();
        changed = true;
    }
    changed
}

async fn handle_load_result(state: &mut EngineState, result: LoadResult) {
    let expected = match result.account_id {
        Some(_) => state.view_generation,
        None => state.accounts_generation,
    };
    if result.generation != expected {
        debug!(
            "Discarding stale load result (generation {} != {})",
            result.generation, expected
        );
        return;
    }

    match result.outcome {
        Ok(LoadOutcome::Accounts(accounts)) => {
            info!("Loaded {} accounts", accounts.len());
            state.store.replace_accounts(accounts);

            // Keep the focus when its account survived the refresh, else
            // fall back to the first account; either way reload the view.
            let focus = state
                .focused_account
                .filter(|id| state.store.account(*id).is_some())
                .or_else(|| state.store.accounts.first().map(|a| a.id));
            state.focus_account(focus);
            state.push_snapshot().await;
        }
        Ok(LoadOutcome::AccountView { account, batches }) => {
            let account_id = account.id;
            let total = batches.len();
            state.store.upsert_account(account);

            // The working set holds open batches only.
            let active: Vec<Batch> = batches.into_iter().filter(|b| !b.completed).collect();
            info!(
                "Loaded {} batches for account {} ({} active)",
                total,
                account_id,
                active.len()
            );
            state.store.replace_batches(account_id, active);

            // Keep the selection when its batch survived, else take the
            // first of the fresh working set.
            let selection_valid = state
                .selected_batch
                .and_then(|id| state.store.batch(id))
                .map_or(false, |b| b.account_id == account_id);
            if !selection_valid {
                state.selected_batch = state.first_active_batch();
            }
            state.push_snapshot().await;
        }
        Err(err) => {
            let what = match result.account_id {
                Some(id) => format!("account {id} view"),
                None => "account list".to_string(),
            };
            warn!("Failed to load {}: {}", what, err);
            let _ = state
                .update_tx
                .send(EngineUpdate::LoadFailed(format!("failed to load {what}: {err}")))
                .await;
        }
    }
}

/// Handle one operator command. Mutations call the server inline and merge
/// only its response; the loop stays suspended for the round trip, which
/// keeps every merge strictly ordered.
async fn handle_command(state: &mut EngineState, command: EngineCommand) {
    debug!("Command: {:?}", command);
    match command {
        EngineCommand::FocusAccount(id) => {
            state.focus_account(Some(id));
            state.push_snapshot().await;
        }
        EngineCommand::SelectBatch(id) => {
            // Selection must stay within the focused working set.
            let focus = state.focused_account;
            let valid = state
                .store
                .batch(id)
                .map_or(false, |b| Some(b.account_id) == focus && !b.completed);
            if valid {
                state.selected_batch = Some(id);
                state.push_snapshot().await;
            } else {
                warn!("Ignoring selection of unknown batch {}", id);
            }
        }
        EngineCommand::Refresh => {
            state.accounts_generation += 1;
            state.spawn_accounts_load();
        }
        EngineCommand::SetBetStatus { account_id, batch_id, pid, status } => {
            match state.api.set_bet_status(account_id, batch_id, &pid, status).await {
                Ok(bet) => {
                    // Merge the server's answer, not the request we sent.
                    let event = StreamEvent::BetStatusUpdated {
                        batch_id,
                        pid: bet.pid,
                        status: bet.status,
                    };
                    if apply_event(state, event) {
                        state.push_snapshot().await;
                    }
                }
                Err(err) => report_mutation_failure(state, "bet status update", err).await,
            }
        }
        EngineCommand::SubmitBatch { account_id, batch_id } => {
            match state.api.submit_batch(account_id, batch_id).await {
                Ok(()) => {
                    info!("Submitted batch {}", batch_id);
                    if apply_event(state, StreamEvent::BatchCompleted { id: batch_id }) {
                        state.push_snapshot().await;
                    }
                }
                Err(err) => report_mutation_failure(state, "batch submit", err).await,
            }
        }
        EngineCommand::CancelBatch { account_id, batch_id } => {
            // The server wants the bets being withdrawn; an unloaded batch
            // has nothing to cancel.
            let bets = match state.store.batch(batch_id) {
                Some(batch) => batch.bets.clone(),
                None => {
                    warn!("Cannot cancel batch {}: not loaded", batch_id);
                    let _ = state
                        .update_tx
                        .send(EngineUpdate::MutationFailed(format!(
                            "batch {batch_id} is not loaded"
                        )))
                        .await;
                    return;
                }
            };
            match state.api.cancel_batch(account_id, batch_id, &bets).await {
                Ok(()) => {
                    info!("Cancelled batch {}", batch_id);
                    // Cancellation takes the batch out of the working set,
                    // same as completion.
                    if apply_event(state, StreamEvent::BatchCompleted { id: batch_id }) {
                        state.push_snapshot().await;
                    }
                }
                Err(err) => report_mutation_failure(state, "batch cancel", err).await,
            }
        }
        EngineCommand::CreateAccount { name, hostname } => {
            match state.api.create_account(&name, &hostname).await {
                Ok(account) => {
                    info!("Created account {} ({})", account.id, account.name);
                    if apply_event(state, StreamEvent::AccountCreated(account)) {
                        state.push_snapshot().await;
                    }
                }
                Err(err) => report_mutation_failure(state, "account create", err).await,
            }
        }
        EngineCommand::DeleteAccount(id) => {
            match state.api.delete_account(id).await {
                Ok(()) => {
                    info!("Deleted account {}", id);
                    if apply_event(state, StreamEvent::AccountDeleted { id }) {
                        state.push_snapshot().await;
                    }
                }
                Err(err) => report_mutation_failure(state, "account delete", err).await,
            }
        }
        // Handled by the loop before dispatch.
        EngineCommand::Shutdown => {}
    }
}

async fn report_mutation_failure(state: &EngineState, what: &str, err: ApiError) {
    warn!("{} failed: {}", what, err);
    let _ = state
        .update_tx
        .send(EngineUpdate::MutationFailed(format!("{what} failed: {err}")))
        .await;
}

/// Warn once when an open stream has gone silent past the threshold. Pings
/// normally arrive well inside it.
fn check_stream_liveness(state: &mut EngineState) {
    if state.connection != ConnectionState::Open || state.stale_warned {
        return;
    }
    let Some(last) = state.last_stream_activity else {
        return;
    };
    if last.elapsed() > state.stale_after {
        warn!(
            "No stream activity for {:?} (threshold {:?})",
            last.elapsed(),
            state.stale_after
        );
        state.stale_warned = true;
    }
}
