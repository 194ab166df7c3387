//! WebDriver-backed browser session for the pool.

use std::time::Duration;

use keymaster_core::config::BrowserConfig;
use serde_json::{json, Value};

use crate::pool::{AutomationSession, SessionError, SessionFactory, SessionHealth};
use crate::webdriver::{WebDriverClient, WebDriverError, WebDriverSession};

/// Navigation budget applied to every page load.
pub const PAGE_LOAD_TIMEOUT: Duration = Duration::from_secs(60);

/// URL prefixes that mean the browser is parked on an error page.
const ERROR_PAGE_INDICATORS: &[&str] = &["about:neterror", "chrome-error://", "about:certerror"];

impl From<WebDriverError> for SessionError {
    fn from(e: WebDriverError) -> Self {
        SessionError::Remote(e.to_string())
    }
}

/// A browser driven over WebDriver.
pub struct BrowserSession {
    driver: WebDriverSession,
}

impl BrowserSession {
    pub fn new(driver: WebDriverSession) -> Self {
        Self { driver }
    }

    /// The underlying protocol session, for workflows to drive.
    pub fn driver(&self) -> &WebDriverSession {
        &self.driver
    }
}

#[async_trait::async_trait]
impl AutomationSession for BrowserSession {
    async fn probe(&self) -> Result<SessionHealth, SessionError> {
        let url = self
            .driver
            .current_url()
            .await
            .map_err(|e| SessionError::Probe(e.to_string()))?;
        Ok(classify_url(&url))
    }

    async fn screenshot(&self) -> Result<Vec<u8>, SessionError> {
        Ok(self.driver.screenshot().await?)
    }

    async fn page_snapshot(&self) -> Result<String, SessionError> {
        Ok(self.driver.page_source().await?)
    }

    async fn close(self) {
        if let Err(e) = self.driver.close_window().await {
            tracing::debug!(session_id = %self.driver.id(), error = %e, "Failed to close browser window");
        }
        if let Err(e) = self.driver.delete().await {
            tracing::warn!(session_id = %self.driver.id(), error = %e, "Failed to delete WebDriver session");
        }
    }
}

fn classify_url(url: &str) -> SessionHealth {
    match ERROR_PAGE_INDICATORS.iter().find(|i| url.starts_with(*i)) {
        Some(indicator) => SessionHealth::ErrorPage((*indicator).to_string()),
        None => SessionHealth::Healthy,
    }
}

// ---------------------------------------------------------------------------
// Factory
// ---------------------------------------------------------------------------

/// Creates [`BrowserSession`]s from a fixed capabilities document.
pub struct WebDriverSessionFactory {
    client: WebDriverClient,
    capabilities: Value,
}

impl WebDriverSessionFactory {
    pub fn new(client: WebDriverClient, capabilities: Value) -> Self {
        Self { client, capabilities }
    }

    pub fn from_config(config: &BrowserConfig) -> Self {
        Self::new(
            WebDriverClient::new(&config.webdriver_url),
            capabilities_for(config),
        )
    }
}

#[async_trait::async_trait]
impl SessionFactory for WebDriverSessionFactory {
    type Session = BrowserSession;

    async fn create(&self) -> Result<BrowserSession, SessionError> {
        let driver = self
            .client
            .new_session(&self.capabilities)
            .await
            .map_err(|e| {
                SessionError::Create(format!(
                    "WebDriver at {} refused a new session: {e}",
                    self.client.base_url()
                ))
            })?;
        tracing::info!(session_id = %driver.id(), "Browser session started");
        Ok(BrowserSession::new(driver))
    }
}

/// Build the W3C capabilities document for `config`.
pub fn capabilities_for(config: &BrowserConfig) -> Value {
    let mut args = vec!["-width=1920".to_string(), "-height=1080".to_string()];
    if config.headless {
        args.push("-headless".to_string());
    }

    let mut always_match = json!({
        "browserName": "firefox",
        "acceptInsecureCerts": false,
        "pageLoadStrategy": "normal",
        "timeouts": {
            "pageLoad": PAGE_LOAD_TIMEOUT.as_millis() as u64,
            "script": 30_000,
            "implicit": 0,
        },
        "moz:firefoxOptions": {
            "args": args,
            "prefs": { "intl.accept_languages": "en-GB" },
        },
    });

    if let Some(proxy) = &config.proxy {
        let server = strip_scheme(&proxy.server);
        always_match["proxy"] = json!({
            "proxyType": "manual",
            "httpProxy": server,
            "sslProxy": server,
        });
        if proxy.username.is_some() {
            tracing::warn!(
                "Proxy credentials cannot be passed through WebDriver capabilities; \
                 configure authentication on the proxy or driver side",
            );
        }
    }

    json!({ "capabilities": { "alwaysMatch": always_match } })
}

fn strip_scheme(server: &str) -> &str {
    server
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(server)
        .trim_end_matches('/')
}
