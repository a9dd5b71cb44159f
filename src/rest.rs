//! REST collaborator client.
//!
//! Read-only from the sync core's perspective: job, message, and ticket
//! snapshots are fetched here and merged by the owning state, never written
//! back.

use anyhow::{Context, Result};
use url::Url;

use crate::config::SyncConfig;
use crate::model::{AgentStep, ChatMessage, JobSnapshot, TicketRecord};

#[derive(Clone)]
pub struct RestClient {
    http: reqwest::Client,
    base: Url,
    token: String,
}

impl RestClient {
    pub fn new(cfg: &SyncConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            base: cfg.api_base.clone(),
            token: cfg.token.clone(),
        }
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.base.join(path).with_context(|| format!("bad endpoint path {path}"))
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = self.endpoint(path)?;
        self.http
            .get(url)
            .bearer_auth(&self.token)
            .send()
            .await
            .with_context(|| format!("request to {path} failed"))?
            .error_for_status()
            .with_context(|| format!("{path} returned an error status"))?
            .json::<T>()
            .await
            .with_context(|| format!("could not decode {path} response"))
    }

    /// Fetch a job by id, with optionally embedded messages and steps.
    pub async fn job(&self, job_id: &str) -> Result<JobSnapshot> {
        self.get_json(&format!("/api/jobs/{job_id}")).await
    }

    pub async fn messages(&self, job_id: &str) -> Result<Vec<ChatMessage>> {
        self.get_json(&format!("/api/jobs/{job_id}/messages")).await
    }

    pub async fn steps(&self, job_id: &str) -> Result<Vec<AgentStep>> {
        self.get_json(&format!("/api/jobs/{job_id}/steps")).await
    }

    pub async fn tickets(&self, job_id: &str) -> Result<Vec<TicketRecord>> {
        self.get_json(&format!("/api/jobs/{job_id}/tickets")).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_joins_against_base() {
        let cfg = SyncConfig::new("http://127.0.0.1:9999", None, "tok").unwrap();
        let client = RestClient::new(&cfg);
        let url = client.endpoint("/api/jobs/j-1/tickets").unwrap();
        assert_eq!(url.as_str(), "http://127.0.0.1:9999/api/jobs/j-1/tickets");
    }
}
