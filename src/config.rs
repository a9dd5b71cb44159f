//! Runtime configuration for the sync client.
//!
//! Values come from CLI flags with environment fallbacks (`PULSE_API_BASE`,
//! `PULSE_WS_BASE`, `PULSE_TOKEN`). The push-channel URL is derived from the
//! REST base by protocol upgrade; an explicit override wins but is itself
//! upgraded when it conflicts with a secure REST base.

use anyhow::{Context, Result, bail};
use url::Url;

use crate::connection::BackoffPolicy;

#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// REST collaborator base, e.g. `https://pulse.example.com`.
    pub api_base: Url,
    /// Optional explicit push-channel base; derived from `api_base` if unset.
    pub ws_base: Option<Url>,
    /// Connection-establishment credential. Never logged in clear text.
    pub token: String,
    pub backoff: BackoffPolicy,
}

impl SyncConfig {
    pub fn new(api_base: &str, ws_base: Option<&str>, token: impl Into<String>) -> Result<Self> {
        let api_base = Url::parse(api_base).context("invalid API base URL")?;
        if !matches!(api_base.scheme(), "http" | "https") {
            bail!("API base must be http(s), got '{}'", api_base.scheme());
        }
        let ws_base = match ws_base {
            Some(raw) => Some(Url::parse(raw).context("invalid push-channel base URL")?),
            None => None,
        };
        Ok(Self {
            api_base,
            ws_base,
            token: token.into(),
            backoff: BackoffPolicy::default(),
        })
    }

    /// Build from flag values, falling back to environment variables.
    pub fn resolve(
        api_base: Option<String>,
        ws_base: Option<String>,
        token: Option<String>,
    ) -> Result<Self> {
        let api_base = api_base
            .or_else(|| std::env::var("PULSE_API_BASE").ok())
            .context("no API base configured; pass --api-base or set PULSE_API_BASE")?;
        let ws_base = ws_base.or_else(|| std::env::var("PULSE_WS_BASE").ok());
        let token = token
            .or_else(|| std::env::var("PULSE_TOKEN").ok())
            .context("no auth token configured; pass --token or set PULSE_TOKEN")?;
        Self::new(&api_base, ws_base.as_deref(), token)
    }

    /// Derive the per-job push-channel URL.
    ///
    /// The REST base scheme is upgraded (`https` → `wss`, `http` → `ws`).
    /// An explicit ws base is used instead, but a `ws://` override against a
    /// secure REST base is auto-upgraded to `wss://` rather than allowed to
    /// downgrade the transport.
    pub fn ws_url(&self, job_id: &str) -> Result<Url> {
        let mut url = match &self.ws_base {
            Some(base) => base.clone(),
            None => self.api_base.clone(),
        };

        let rest_secure = self.api_base.scheme() == "https";
        let scheme = match url.scheme() {
            "https" => "wss",
            "http" => "ws",
            "wss" => "wss",
            "ws" if rest_secure => "wss",
            "ws" => "ws",
            other => bail!("cannot derive push-channel scheme from '{other}'"),
        };
        url.set_scheme(scheme)
            .map_err(|()| anyhow::anyhow!("cannot set scheme '{scheme}'"))?;

        url.set_path(&format!("/ws/jobs/{job_id}"));
        url.set_query(None);
        url.query_pairs_mut().append_pair("token", &self.token);
        Ok(url)
    }
}

/// Render a URL for logging with the token query value masked.
pub fn redacted_url(url: &Url) -> String {
    let mut safe = url.clone();
    if url.query_pairs().any(|(k, _)| k == "token") {
        let kept: Vec<(String, String)> = url
            .query_pairs()
            .map(|(k, v)| {
                if k == "token" {
                    (k.into_owned(), "***".to_string())
                } else {
                    (k.into_owned(), v.into_owned())
                }
            })
            .collect();
        safe.set_query(None);
        let mut pairs = safe.query_pairs_mut();
        for (k, v) in &kept {
            pairs.append_pair(k, v);
        }
        drop(pairs);
    }
    safe.to_string()
}
