pub mod error;

pub use error::{BrowserlessError, Result};

use std::time::Duration;

/// How long to wait for page settle before grabbing the DOM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitUntil {
    DomContentLoaded,
    NetworkIdle,
}

impl WaitUntil {
    /// Browserless gotoOptions value. NetworkIdle maps to networkidle2;
    /// networkidle0 stalls on pages with long-polling beacons.
    fn as_goto_value(&self) -> &'static str {
        match self {
            WaitUntil::DomContentLoaded => "domcontentloaded",
            WaitUntil::NetworkIdle => "networkidle2",
        }
    }
}

/// Options for a single /content render.
#[derive(Debug, Clone, Copy)]
pub struct ContentOptions {
    pub wait_until: WaitUntil,
    pub timeout_ms: u64,
}

impl Default for ContentOptions {
    fn default() -> Self {
        Self {
            wait_until: WaitUntil::DomContentLoaded,
            timeout_ms: 20_000,
        }
    }
}

pub struct BrowserlessClient {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl BrowserlessClient {
    pub fn new(base_url: &str, token: Option<&str>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.filter(|t| !t.is_empty()).map(String::from),
        })
    }

    /// Fetch fully-rendered HTML for a URL via the Browserless /content
    /// endpoint, waiting per `options` before the DOM is captured.
    pub async fn content(&self, url: &str, options: ContentOptions) -> Result<String> {
        let mut endpoint = format!("{}/content", self.base_url);
        if let Some(ref token) = self.token {
            endpoint.push_str(&format!("?token={token}"));
        }

        let body = serde_json::json!({
            "url": url,
            "gotoOptions": {
                "waitUntil": options.wait_until.as_goto_value(),
                "timeout": options.timeout_ms,
            },
        });

        let resp = self
            .client
            .post(&endpoint)
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let message = resp.text().await.unwrap_or_default();
            return Err(BrowserlessError::Api {
                status: status.as_u16(),
                message,
            });
        }

        Ok(resp.text().await?)
    }
}
