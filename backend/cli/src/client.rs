//! HTTP client used by the `attack`, `recover` and `search` subcommands.

use anyhow::{bail, Context, Result};
use serde_json::Value;
use uuid::Uuid;

use havoc_core::{Experiment, StressCommand};

pub struct Client {
    http: reqwest::Client,
    base_url: String,
}

impl Client {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub async fn stress(&self, command: &StressCommand) -> Result<Uuid> {
        let resp = self
            .http
            .post(format!("{}/api/attack/stress", self.base_url))
            .json(command)
            .send()
            .await
            .with_context(|| self.unreachable())?;
        let body = check(resp).await?;
        serde_json::from_value(body["uid"].clone()).context("daemon returned no uid")
    }

    pub async fn recover(&self, uid: &Uuid) -> Result<()> {
        let resp = self
            .http
            .delete(format!("{}/api/attack/{}", self.base_url, uid))
            .send()
            .await
            .with_context(|| self.unreachable())?;
        check(resp).await?;
        Ok(())
    }

    pub async fn get(&self, uid: &Uuid) -> Result<Experiment> {
        let resp = self
            .http
            .get(format!("{}/api/experiments/{}", self.base_url, uid))
            .send()
            .await
            .with_context(|| self.unreachable())?;
        let body = check(resp).await?;
        serde_json::from_value(body).context("malformed experiment")
    }

    pub async fn list(&self, status: Option<&str>) -> Result<Vec<Experiment>> {
        let mut request = self.http.get(format!("{}/api/experiments", self.base_url));
        if let Some(status) = status {
            request = request.query(&[("status", status)]);
        }
        let resp = request.send().await.with_context(|| self.unreachable())?;
        let body = check(resp).await?;
        serde_json::from_value(body["experiments"].clone()).context("malformed experiment list")
    }

    fn unreachable(&self) -> String {
        format!("havoc is not running at {}", self.base_url)
    }
}

/// Turn a non-2xx response into an error carrying the daemon's message.
async fn check(resp: reqwest::Response) -> Result<Value> {
    let status = resp.status();
    let body: Value = resp.json().await.unwrap_or(Value::Null);
    if !status.is_success() {
        let message = body["error"].as_str().unwrap_or("no error message");
        bail!("request failed ({status}): {message}");
    }
    Ok(body)
}

/// Render experiments as a plain table.
pub fn format_experiments(experiments: &[Experiment]) -> String {
    let mut out = format!(
        "{:<36}  {:<7}  {:<6}  {:<9}  {:<20}  {}\n",
        "UID", "KIND", "ACTION", "STATUS", "CREATED", "ERROR"
    );
    for exp in experiments {
        out.push_str(&format!(
            "{:<36}  {:<7}  {:<6}  {:<9}  {:<20}  {}\n",
            exp.uid,
            exp.kind.as_str(),
            exp.action,
            exp.status.as_str(),
            exp.created_at.format("%Y-%m-%d %H:%M:%S").to_string(),
            exp.message
        ));
    }
    out
}
