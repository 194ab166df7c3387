//! REST client for a W3C WebDriver endpoint.
//!
//! Covers the subset of the protocol the upload workflow needs: session
//! lifecycle, navigation, element lookup and interaction, screenshots,
//! page source and cookies. Every response is the standard
//! `{"value": ...}` envelope; errors carry `{"error", "message"}` inside it.

use std::future::Future;
use std::time::Duration;

use base64::Engine;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};

/// JSON key identifying a web element reference.
const ELEMENT_KEY: &str = "element-6066-11e4-a52e-4f735466cecf";

/// Interval between polls in [`WebDriverSession::wait_for`].
const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// TCP connect budget for every driver request.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Whole-request budget for a single driver command. Must exceed the
/// browser's page-load timeout so navigation errors come from the driver.
pub const COMMAND_TIMEOUT: Duration = Duration::from_secs(90);

/// Errors from the WebDriver layer.
#[derive(Debug, thiserror::Error)]
pub enum WebDriverError {
    /// The HTTP request itself failed (network, DNS, TLS, etc.).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The driver answered with a protocol error.
    #[error("WebDriver error ({status}) {error}: {message}")]
    Api {
        status: u16,
        /// Protocol error code, e.g. `no such element`.
        error: String,
        message: String,
    },

    /// The response did not have the expected shape.
    #[error("Unexpected WebDriver response: {0}")]
    Decode(String),

    /// A [`WebDriverSession::wait_for`] condition never held.
    #[error("Timed out after {}s waiting for {what}", timeout.as_secs())]
    Timeout { what: String, timeout: Duration },
}

impl WebDriverError {
    /// True when the target element is absent or has gone stale, which
    /// polling loops treat as "not yet".
    pub fn is_missing_element(&self) -> bool {
        matches!(
            self,
            Self::Api { error, .. }
                if error == "no such element" || error == "stale element reference"
        )
    }
}

/// How to find an element.
#[derive(Debug, Clone)]
pub enum Locator {
    Css(String),
    XPath(String),
}

impl Locator {
    pub fn css(selector: impl Into<String>) -> Self {
        Self::Css(selector.into())
    }

    pub fn xpath(expr: impl Into<String>) -> Self {
        Self::XPath(expr.into())
    }

    fn to_body(&self) -> Value {
        match self {
            Self::Css(s) => json!({ "using": "css selector", "value": s }),
            Self::XPath(s) => json!({ "using": "xpath", "value": s }),
        }
    }
}

impl std::fmt::Display for Locator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Css(s) => write!(f, "css `{s}`"),
            Self::XPath(s) => write!(f, "xpath `{s}`"),
        }
    }
}

/// Reference to an element in the remote page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Element {
    id: String,
}

impl Element {
    fn from_value(value: &Value) -> Result<Self, WebDriverError> {
        value
            .get(ELEMENT_KEY)
            .and_then(Value::as_str)
            .map(|id| Self { id: id.to_string() })
            .ok_or_else(|| WebDriverError::Decode(format!("not an element reference: {value}")))
    }
}

/// A browser cookie as reported by the driver.
#[derive(Debug, Clone, Deserialize)]
pub struct Cookie {
    pub name: String,
    pub value: String,
    #[serde(default)]
    pub domain: Option<String>,
}

#[derive(Deserialize)]
struct Envelope<T> {
    value: T,
}

#[derive(Deserialize)]
struct ErrorBody {
    error: String,
    #[serde(default)]
    message: String,
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// HTTP client for a WebDriver server (geckodriver, chromedriver, grid).
#[derive(Clone)]
pub struct WebDriverClient {
    http: reqwest::Client,
    base_url: String,
}

impl WebDriverClient {
    /// * `base_url` - Driver root, e.g. `http://localhost:4444`.
    /// Client with [`CONNECT_TIMEOUT`] and [`COMMAND_TIMEOUT`] applied.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_timeouts(base_url, CONNECT_TIMEOUT, COMMAND_TIMEOUT)
    }

    pub fn with_timeouts(base_url: impl Into<String>, connect: Duration, command: Duration) -> Self {
        let http = reqwest::Client::builder()
            .connect_timeout(connect)
            .timeout(command)
            .build()
            .expect("Failed to build reqwest HTTP client");
        Self::with_client(http, base_url)
    }

    pub fn with_client(http: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// `POST /session` with the given capabilities document.
    pub async fn new_session(&self, capabilities: &Value) -> Result<WebDriverSession, WebDriverError> {
        let response = self
            .http
            .post(format!("{}/session", self.base_url))
            .json(capabilities)
            .send()
            .await?;
        let value: Value = parse_response(response).await?;
        let session_id = value
            .get("sessionId")
            .and_then(Value::as_str)
            .ok_or_else(|| WebDriverError::Decode(format!("missing sessionId in {value}")))?
            .to_string();

        tracing::debug!(session_id = %session_id, "WebDriver session created");
        Ok(WebDriverSession {
            http: self.http.clone(),
            session_url: format!("{}/session/{}", self.base_url, session_id),
            session_id,
        })
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// A live WebDriver session. Clones share the same remote session.
#[derive(Clone)]
pub struct WebDriverSession {
    http: reqwest::Client,
    session_id: String,
    session_url: String,
}

impl WebDriverSession {
    pub fn id(&self) -> &str {
        &self.session_id
    }

    pub async fn navigate(&self, url: &str) -> Result<(), WebDriverError> {
        self.post::<Value>("/url", json!({ "url": url })).await?;
        Ok(())
    }

    pub async fn current_url(&self) -> Result<String, WebDriverError> {
        self.get("/url").await
    }

    pub async fn find(&self, locator: &Locator) -> Result<Element, WebDriverError> {
        let value: Value = self.post("/element", locator.to_body()).await?;
        Element::from_value(&value)
    }

    pub async fn find_all(&self, locator: &Locator) -> Result<Vec<Element>, WebDriverError> {
        let values: Vec<Value> = self.post("/elements", locator.to_body()).await?;
        values.iter().map(Element::from_value).collect()
    }

    /// Find a descendant of `parent`.
    pub async fn find_in(&self, parent: &Element, locator: &Locator) -> Result<Element, WebDriverError> {
        let value: Value = self
            .post(&format!("/element/{}/element", parent.id), locator.to_body())
            .await?;
        Element::from_value(&value)
    }

    pub async fn is_displayed(&self, element: &Element) -> Result<bool, WebDriverError> {
        self.get(&format!("/element/{}/displayed", element.id)).await
    }

    pub async fn is_enabled(&self, element: &Element) -> Result<bool, WebDriverError> {
        self.get(&format!("/element/{}/enabled", element.id)).await
    }

    pub async fn click(&self, element: &Element) -> Result<(), WebDriverError> {
        self.post::<Value>(&format!("/element/{}/click", element.id), json!({}))
            .await?;
        Ok(())
    }

    pub async fn clear(&self, element: &Element) -> Result<(), WebDriverError> {
        self.post::<Value>(&format!("/element/{}/clear", element.id), json!({}))
            .await?;
        Ok(())
    }

    /// Type `text` into the element. For file inputs this sets the path.
    pub async fn send_keys(&self, element: &Element, text: &str) -> Result<(), WebDriverError> {
        self.post::<Value>(
            &format!("/element/{}/value", element.id),
            json!({ "text": text }),
        )
        .await?;
        Ok(())
    }

    pub async fn text(&self, element: &Element) -> Result<String, WebDriverError> {
        self.get(&format!("/element/{}/text", element.id)).await
    }

    pub async fn attribute(&self, element: &Element, name: &str) -> Result<Option<String>, WebDriverError> {
        self.get(&format!("/element/{}/attribute/{}", element.id, name))
            .await
    }

    /// PNG screenshot of the viewport.
    pub async fn screenshot(&self) -> Result<Vec<u8>, WebDriverError> {
        let encoded: String = self.get("/screenshot").await?;
        base64::engine::general_purpose::STANDARD
            .decode(encoded.as_bytes())
            .map_err(|e| WebDriverError::Decode(format!("screenshot is not base64: {e}")))
    }

    pub async fn page_source(&self) -> Result<String, WebDriverError> {
        self.get("/source").await
    }

    pub async fn cookies(&self) -> Result<Vec<Cookie>, WebDriverError> {
        self.get("/cookie").await
    }

    pub async fn close_window(&self) -> Result<(), WebDriverError> {
        let response = self
            .http
            .delete(format!("{}/window", self.session_url))
            .send()
            .await?;
        parse_response::<Value>(response).await?;
        Ok(())
    }

    /// End the session on the driver.
    pub async fn delete(&self) -> Result<(), WebDriverError> {
        let response = self.http.delete(&self.session_url).send().await?;
        parse_response::<Value>(response).await?;
        Ok(())
    }

    // ---- waiting ----

    /// Poll `check` until it yields `Some`, or fail with
    /// [`WebDriverError::Timeout`]. Missing or stale elements count as
    /// "not yet"; any other error aborts the wait.
    pub async fn wait_for<T, F, Fut>(
        &self,
        what: &str,
        timeout: Duration,
        mut check: F,
    ) -> Result<T, WebDriverError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Option<T>, WebDriverError>>,
    {
        let deadline = tokio::time::Instant::now() + timeout;
        let expired = || WebDriverError::Timeout {
            what: what.to_string(),
            timeout,
        };
        loop {
            // A single slow command must not outlive the wait's deadline.
            match tokio::time::timeout_at(deadline, check()).await {
                Err(_) => return Err(expired()),
                Ok(Ok(Some(value))) => return Ok(value),
                Ok(Ok(None)) => {}
                Ok(Err(e)) if e.is_missing_element() => {}
                Ok(Err(e)) => return Err(e),
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(expired());
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Wait until an element matching `locator` is displayed.
    pub async fn wait_visible(&self, locator: &Locator, timeout: Duration) -> Result<Element, WebDriverError> {
        self.wait_for(&locator.to_string(), timeout, move || async move {
            let element = self.find(locator).await?;
            Ok(self.is_displayed(&element).await?.then_some(element))
        })
        .await
    }

    /// Wait until an element matching `locator` is displayed and enabled.
    pub async fn wait_enabled(&self, locator: &Locator, timeout: Duration) -> Result<Element, WebDriverError> {
        self.wait_for(&format!("enabled {locator}"), timeout, move || async move {
            let element = self.find(locator).await?;
            let ready = self.is_displayed(&element).await? && self.is_enabled(&element).await?;
            Ok(ready.then_some(element))
        })
        .await
    }

    /// Wait until no displayed element matches `locator`.
    pub async fn wait_hidden(&self, locator: &Locator, timeout: Duration) -> Result<(), WebDriverError> {
        self.wait_for(&format!("{locator} to disappear"), timeout, move || async move {
            for element in self.find_all(locator).await? {
                match self.is_displayed(&element).await {
                    Ok(true) => return Ok(None),
                    Ok(false) => {}
                    Err(e) if e.is_missing_element() => {}
                    Err(e) => return Err(e),
                }
            }
            Ok(Some(()))
        })
        .await
    }

    // ---- private helpers ----

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, WebDriverError> {
        let response = self
            .http
            .get(format!("{}{}", self.session_url, path))
            .send()
            .await?;
        parse_response(response).await
    }

    async fn post<T: DeserializeOwned>(&self, path: &str, body: Value) -> Result<T, WebDriverError> {
        let response = self
            .http
            .post(format!("{}{}", self.session_url, path))
            .json(&body)
            .send()
            .await?;
        parse_response(response).await
    }
}

/// Unwrap the `value` envelope, mapping protocol errors to
/// [`WebDriverError::Api`].
async fn parse_response<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, WebDriverError> {
    let status = response.status();
    let text = response.text().await?;
    decode_body(status.as_u16(), status.is_success(), &text)
}

fn decode_body<T: DeserializeOwned>(status: u16, success: bool, text: &str) -> Result<T, WebDriverError> {
    if !success {
        let error = serde_json::from_str::<Envelope<ErrorBody>>(text)
            .map(|e| e.value)
            .unwrap_or_else(|_| ErrorBody {
                error: "unknown error".to_string(),
                message: text.to_string(),
            });
        return Err(WebDriverError::Api {
            status,
            error: error.error,
            message: error.message,
        });
    }

    serde_json::from_str::<Envelope<T>>(text)
        .map(|e| e.value)
        .map_err(|e| WebDriverError::Decode(format!("{e}: {text}")))
}
