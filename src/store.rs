// Entity store: accounts, bet batches, and the bets inside them.

use chrono::{DateTime, Utc};
use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Server-assigned account identifier.
pub type AccountId = i64;
/// Server-assigned batch identifier.
pub type BatchId = i64;

// ---------------------------------------------------------------------------
// Entities
// ---------------------------------------------------------------------------

/// A broker account as reported by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    /// Display name. Empty when the creating event carried no display fields.
    #[serde(default)]
    pub name: String,
    /// Host the account's broker session runs on.
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

/// A batch of bets placed through one account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    pub id: BatchId,
    pub account_id: AccountId,
    /// Open-ended metadata document attached by the server.
    #[serde(default)]
    pub meta: Value,
    #[serde(default)]
    pub completed: bool,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    /// Bets in placement order. Snapshot responses embed them; bare creation
    /// events leave this empty until the next snapshot fills it in.
    #[serde(default)]
    pub bets: Vec<Bet>,
}

/// A single bet within a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bet {
    /// Bet identity. Current payloads send a string, older ones a bare
    /// integer; both normalize to the string form here.
    #[serde(deserialize_with = "de_bet_id")]
    pub pid: String,
    /// Display index within the batch, distinct from identity.
    #[serde(default)]
    pub id: i64,
    #[serde(default)]
    pub selection: String,
    #[serde(default)]
    pub stake: f64,
    #[serde(default)]
    pub cost: f64,
    pub status: BetStatus,
    #[serde(default)]
    pub batch_id: BatchId,
}

/// Settlement state of a bet. Status is the only field that changes after
/// the bet is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BetStatus {
    Pending,
    Successful,
    Failed,
}

impl BetStatus {
    /// Parse the wire string used by both the REST and event payloads.
    pub fn from_wire(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(BetStatus::Pending),
            "successful" => Some(BetStatus::Successful),
            "failed" => Some(BetStatus::Failed),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BetStatus::Pending => "pending",
            BetStatus::Successful => "successful",
            BetStatus::Failed => "failed",
        }
    }
}

/// Accept a bet identity as either a JSON string or a bare integer.
fn de_bet_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(de::Error::custom(format!(
            "bet identity must be a string or number, got {other}"
        ))),
    }
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// In-memory view of the server-owned collections.
///
/// Accounts keep server fetch order. Batches from any number of accounts may
/// be loaded at once; the active working set for one account is the slice of
/// `batches` owned by it. Bets live inside their batch.
///
/// Every mutation is idempotent, and removing or patching an entity that is
/// not present is a silent no-op: the server is the source of truth, so local
/// absence just means "already consistent."
#[derive(Debug, Clone, Default)]
pub struct Store {
    pub accounts: Vec<Account>,
    pub batches: Vec<Batch>,
}

impl Store {
    pub fn new() -> Self {
        Store::default()
    }

    // --- Reads ---

    pub fn account(&self, id: AccountId) -> Option<&Account> {
        self.accounts.iter().find(|a| a.id == id)
    }

    pub fn batch(&self, id: BatchId) -> Option<&Batch> {
        self.batches.iter().find(|b| b.id == id)
    }

    /// Batches owned by one account, in load order.
    pub fn batches_for(&self, account_id: AccountId) -> impl Iterator<Item = &Batch> {
        self.batches.iter().filter(move |b| b.account_id == account_id)
    }

    /// Bets of one batch, or an empty slice when the batch is not loaded.
    pub fn bets(&self, batch_id: BatchId) -> &[Bet] {
        self.batch(batch_id).map(|b| b.bets.as_slice()).unwrap_or(&[])
    }

    // --- Mutations ---

    /// Insert the account, or update the existing record with the same id.
    ///
    /// Bare broker envelopes decode with empty display fields and no
    /// timestamps; an update never downgrades a populated field to that
    /// placeholder. Returns `true` when anything changed.
    pub fn upsert_account(&mut self, account: Account) -> bool {
        match self.accounts.iter_mut().find(|a| a.id == account.id) {
            Some(existing) => {
                let before = existing.clone();
                if !account.name.is_empty() {
                    existing.name = account.name;
                }
                if !account.hostname.is_empty() {
                    existing.hostname = account.hostname;
                }
                if account.created_at.is_some() {
                    existing.created_at = account.created_at;
                }
                if account.updated_at.is_some() {
                    existing.updated_at = account.updated_at;
                }
                *existing != before
            }
            None => {
                self.accounts.push(account);
                true
            }
        }
    }

    /// Remove the account and every batch it owns. No batch may outlive its
    /// account. Returns `true` when anything was removed.
    pub fn remove_account(&mut self, id: AccountId) -> bool {
        let had_account = self.accounts.iter().any(|a| a.id == id);
        self.accounts.retain(|a| a.id != id);

        let before = self.batches.len();
        self.batches.retain(|b| b.account_id != id);

        had_account || self.batches.len() != before
    }

    /// Replace the accounts collection wholesale with a fresh snapshot.
    /// Batches owned by accounts absent from the new list are purged with
    /// their owners.
    pub fn replace_accounts(&mut self, accounts: Vec<Account>) {
        self.accounts = accounts;
        self.batches
            .retain(|b| self.accounts.iter().any(|a| a.id == b.account_id));
    }

    /// Replace one account's loaded batches with a fresh snapshot slice,
    /// leaving other accounts' batches alone.
    pub fn replace_batches(&mut self, account_id: AccountId, batches: Vec<Batch>) {
        self.batches.retain(|b| b.account_id != account_id);
        self.batches.extend(batches);
    }

    /// Insert the batch, or update the existing record with the same id.
    ///
    /// Bare creation events carry no metadata or bets; as with accounts, an
    /// update never replaces populated fields with those defaults. Returns
    /// `true` when anything changed.
    pub fn upsert_batch(&mut self, batch: Batch) -> bool {
        match self.batches.iter_mut().find(|b| b.id == batch.id) {
            Some(existing) => {
                let before = existing.clone();
                existing.account_id = batch.account_id;
                existing.completed = batch.completed;
                if !batch.meta.is_null() {
                    existing.meta = batch.meta;
                }
                if !batch.bets.is_empty() {
                    existing.bets = batch.bets;
                }
                if batch.created_at.is_some() {
                    existing.created_at = batch.created_at;
                }
                if batch.updated_at.is_some() {
                    existing.updated_at = batch.updated_at;
                }
                *existing != before
            }
            None => {
                self.batches.push(batch);
                true
            }
        }
    }

    /// Remove one batch. Returns `true` when it was present.
    pub fn remove_batch(&mut self, id: BatchId) -> bool {
        let before = self.batches.len();
        self.batches.retain(|b| b.id != id);
        self.batches.len() != before
    }

    /// Set one bet's status, resolving the bet by identity within the given
    /// batch. A miss on either id is a silent no-op: the batch may belong to
    /// an account that is not loaded, or may already have been completed and
    /// evicted. Returns `true` when the status actually changed.
    pub fn patch_bet_status(&mut self, batch_id: BatchId, pid: &str, status: BetStatus) -> bool {
        let Some(batch) = self.batches.iter_mut().find(|b| b.id == batch_id) else {
            return false;
        };
        let Some(bet) = batch.bets.iter_mut().find(|b| b.pid == pid) else {
            return false;
        };
        if bet.status == status {
            return false;
        }
        bet.status = status;
        true
    }
}
