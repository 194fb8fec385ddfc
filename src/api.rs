// REST client for the betting server's snapshot and mutation endpoints.
//
// The engine talks to the server through the `BettingApi` trait so tests can
// substitute a scripted implementation. `ApiClient` is the real one, a thin
// reqwest wrapper over the `/api/v1` surface.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use thiserror::Error;

use crate::store::{Account, AccountId, Batch, BatchId, Bet, BetStatus};

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("server returned {status}: {body}")]
    Status {
        status: reqwest::StatusCode,
        body: String,
    },
}

/// Server operations the engine depends on.
#[async_trait]
pub trait BettingApi: Send + Sync {
    /// All accounts, in server order.
    async fn accounts(&self) -> Result<Vec<Account>, ApiError>;

    /// One account's current record.
    async fn account(&self, id: AccountId) -> Result<Account, ApiError>;

    /// All of one account's batches, active and completed alike. Callers
    /// filter for the working set they need.
    async fn batches(&self, account_id: AccountId) -> Result<Vec<Batch>, ApiError>;

    /// Register a new account; returns the server-assigned record.
    async fn create_account(&self, name: &str, hostname: &str) -> Result<Account, ApiError>;

    async fn delete_account(&self, id: AccountId) -> Result<(), ApiError>;

    /// Set one bet's status; returns the updated bet as the server sees it.
    async fn set_bet_status(
        &self,
        account_id: AccountId,
        batch_id: BatchId,
        pid: &str,
        status: BetStatus,
    ) -> Result<Bet, ApiError>;

    /// Submit the batch for settlement, completing it.
    async fn submit_batch(&self, account_id: AccountId, batch_id: BatchId) -> Result<(), ApiError>;

    /// Cancel the batch outright, withdrawing the given bets.
    async fn cancel_batch(
        &self,
        account_id: AccountId,
        batch_id: BatchId,
        bets: &[Bet],
    ) -> Result<(), ApiError>;
}

/// HTTP implementation of [`BettingApi`].
pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
}

impl ApiClient {
    /// Build a client for the given server, e.g. `http://localhost:3001`.
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, ApiError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(ApiClient {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/v1{}", self.base_url, path)
    }
}

/// Pass successful responses through; turn anything else into a status error
/// carrying whatever body text the server attached.
async fn check(response: reqwest::Response) -> Result<reqwest::Response, ApiError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(ApiError::Status { status, body })
}

#[async_trait]
impl BettingApi for ApiClient {
    async fn accounts(&self) -> Result<Vec<Account>, ApiError> {
        let response = self.http.get(self.url("/accounts")).send().await?;
        Ok(check(response).await?.json().await?)
    }

    async fn account(&self, id: AccountId) -> Result<Account, ApiError> {
        let response = self.http.get(self.url(&format!("/accounts/{id}"))).send().await?;
        Ok(check(response).await?.json().await?)
    }

    async fn batches(&self, account_id: AccountId) -> Result<Vec<Batch>, ApiError> {
        let response = self
            .http
            .get(self.url(&format!("/accounts/{account_id}/batches")))
            .send()
            .await?;
        Ok(check(response).await?.json().await?)
    }

    async fn create_account(&self, name: &str, hostname: &str) -> Result<Account, ApiError> {
        let response = self
            .http
            .post(self.url("/accounts"))
            .json(&json!({ "name": name, "hostname": hostname }))
            .send()
            .await?;
        Ok(check(response).await?.json().await?)
    }

    async fn delete_account(&self, id: AccountId) -> Result<(), ApiError> {
        let response = self.http.delete(self.url(&format!("/accounts/{id}"))).send().await?;
        check(response).await?;
        Ok(())
    }

    async fn set_bet_status(
        &self,
        account_id: AccountId,
        batch_id: BatchId,
        pid: &str,
        status: BetStatus,
    ) -> Result<Bet, ApiError> {
        let response = self
            .http
            .patch(self.url(&format!("/accounts/{account_id}/batches/{batch_id}/bets/{pid}")))
            .json(&json!({ "status": status }))
            .send()
            .await?;
        Ok(check(response).await?.json().await?)
    }

    async fn submit_batch(&self, account_id: AccountId, batch_id: BatchId) -> Result<(), ApiError> {
        let response = self
            .http
            .delete(self.url(&format!("/accounts/{account_id}/batches/{batch_id}")))
            .send()
            .await?;
        check(response).await?;
        Ok(())
    }

    async fn cancel_batch(
        &self,
        account_id: AccountId,
        batch_id: BatchId,
        bets: &[Bet],
    ) -> Result<(), ApiError> {
        let response = self
            .http
            .patch(self.url(&format!("/accounts/{account_id}/batches/{batch_id}/bets")))
            .json(&json!({ "bets": bets }))
            .send()
            .await?;
        check(response).await?;
        Ok(())
    }
}
