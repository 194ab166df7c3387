//! Asset-escrow workflow against the creator portal.
//!
//! One pass: open the create-asset modal (logging in when the modal does
//! not appear), name the asset, attach the input archive, wait for the
//! upload to finish and for the asset row to offer a download, then fetch
//! the processed archive with the browser's cookies.
//!
//! Input paths are handed to the browser's file input, so the work
//! directory must be visible to the WebDriver host.

use std::path::Path;
use std::time::Duration;

use keymaster_core::config::PortalConfig;
use keymaster_pipeline::{Workflow, WorkflowError, WorkflowRun};
use keymaster_session::webdriver::{Cookie, Element, Locator, WebDriverError, WebDriverSession};
use keymaster_session::{BrowserSession, SessionLease};
use rand::Rng;

const CREATE_ASSET_PATH: &str = "/assets/created-assets?modal=create";

/// Wait budgets for each remote step.
#[derive(Debug, Clone)]
pub struct PortalTimeouts {
    /// How long to look for the modal before assuming a login is needed.
    pub login_detection: Duration,
    pub sign_in_button: Duration,
    pub post_login: Duration,
    pub control: Duration,
    pub upload: Duration,
    pub asset_row: Duration,
    pub download_ready: Duration,
    pub download: Duration,
}

impl Default for PortalTimeouts {
    fn default() -> Self {
        Self {
            login_detection: Duration::from_secs(7),
            sign_in_button: Duration::from_secs(15),
            post_login: Duration::from_secs(25),
            control: Duration::from_secs(10),
            upload: Duration::from_secs(90),
            asset_row: Duration::from_secs(30),
            download_ready: Duration::from_secs(120),
            download: Duration::from_secs(120),
        }
    }
}

impl PortalTimeouts {
    /// Upper bound on one pass, counting every wait at its full budget
    /// plus the initial page load.
    pub fn worst_case(&self) -> Duration {
        Duration::from_secs(60)
            + self.login_detection
            + self.sign_in_button
            + self.post_login
            + self.control * 3
            + self.upload
            + self.asset_row
            + self.download_ready
            + self.download
    }
}

pub struct PortalUploadWorkflow {
    config: PortalConfig,
    timeouts: PortalTimeouts,
    http: reqwest::Client,
}

impl PortalUploadWorkflow {
    pub fn new(config: PortalConfig) -> Self {
        Self::with_timeouts(config, PortalTimeouts::default())
    }

    pub fn with_timeouts(config: PortalConfig, timeouts: PortalTimeouts) -> Self {
        let http = reqwest::Client::builder()
            .timeout(timeouts.download)
            .build()
            .expect("Failed to build reqwest HTTP client");
        Self {
            config,
            timeouts,
            http,
        }
    }

    pub fn timeouts(&self) -> &PortalTimeouts {
        &self.timeouts
    }

    fn create_asset_url(&self) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), CREATE_ASSET_PATH)
    }

    /// Open the create modal, logging in when it does not show up.
    async fn open_create_modal(
        &self,
        driver: &WebDriverSession,
        lease: &mut SessionLease<'_, BrowserSession>,
    ) -> Result<Element, WorkflowError> {
        let name_field = Locator::css("input[placeholder='Enter asset name']");

        driver.navigate(&self.create_asset_url()).await?;
        human_delay(1.5, 3.0).await;

        match driver
            .wait_visible(&name_field, self.timeouts.login_detection)
            .await
        {
            Ok(field) => {
                tracing::debug!("Already signed in");
                lease.mark_authenticated();
                return Ok(field);
            }
            Err(WebDriverError::Timeout { .. }) => {
                tracing::info!(was_authenticated = lease.is_authenticated(), "Login required");
            }
            Err(e) => return Err(e.into()),
        }

        self.login(driver).await?;

        match driver.wait_visible(&name_field, self.timeouts.post_login).await {
            Ok(field) => {
                lease.mark_authenticated();
                tracing::info!("Signed in to portal");
                Ok(field)
            }
            Err(WebDriverError::Timeout { .. }) => Err(self.login_failure(driver).await),
            Err(e) => Err(e.into()),
        }
    }

    async fn login(&self, driver: &WebDriverSession) -> Result<(), WorkflowError> {
        let sign_in = driver
            .wait_visible(
                &Locator::xpath("//button[contains(normalize-space(.), 'Sign in with Cfx.re')]"),
                self.timeouts.sign_in_button,
            )
            .await?;
        driver.click(&sign_in).await?;
        human_delay(1.2, 2.6).await;

        let username = driver
            .wait_visible(&Locator::css("#login-account-name"), self.timeouts.control)
            .await?;
        type_like_human(driver, &username, &self.config.username).await?;

        let password = driver
            .wait_visible(&Locator::css("#login-account-password"), self.timeouts.control)
            .await?;
        type_like_human(driver, &password, &self.config.password).await?;

        let submit = driver
            .wait_enabled(&Locator::css("#login-button"), self.timeouts.control)
            .await?;
        driver.click(&submit).await?;
        tracing::debug!("Login submitted");
        Ok(())
    }

    /// Classify a login that never reached the modal.
    async fn login_failure(&self, driver: &WebDriverSession) -> WorkflowError {
        let alert = match driver.find(&Locator::css("#modal-alert, .alert-error")).await {
            Ok(el) => driver.text(&el).await.unwrap_or_default(),
            Err(_) => String::new(),
        };
        if alert.trim().is_empty() {
            WorkflowError::Transient("create-asset modal did not appear after login".into())
        } else {
            WorkflowError::Authentication(alert.trim().to_string())
        }
    }

    async fn attach_file(&self, driver: &WebDriverSession, input_path: &Path) -> Result<(), WorkflowError> {
        let absolute = tokio::fs::canonicalize(input_path)
            .await
            .map_err(|source| WorkflowError::Io {
                path: input_path.to_path_buf(),
                source,
            })?;

        let inputs = driver.find_all(&Locator::css("input[type='file']")).await?;
        let Some(input) = inputs.first() else {
            return Err(WorkflowError::Transient("upload modal has no file input".into()));
        };
        driver
            .send_keys(input, &absolute.to_string_lossy())
            .await?;
        Ok(())
    }

    /// Resolve the download link and fetch it with the session's cookies.
    async fn download(
        &self,
        driver: &WebDriverSession,
        button: &Element,
        output_path: &Path,
    ) -> Result<u64, WorkflowError> {
        let href = match driver.attribute(button, "href").await? {
            Some(href) => href,
            None => {
                let link = driver.find_in(button, &Locator::css("a[href]")).await?;
                driver.attribute(&link, "href").await?.ok_or_else(|| {
                    WorkflowError::Transient("download button exposes no link".into())
                })?
            }
        };
        let url = resolve_href(&self.config.base_url, &href);
        let cookies = driver.cookies().await?;

        let response = self
            .http
            .get(&url)
            .header(reqwest::header::COOKIE, cookie_header(&cookies))
            .send()
            .await
            .map_err(|e| WorkflowError::Transient(format!("download request failed: {e}")))?;
        if !response.status().is_success() {
            return Err(WorkflowError::Transient(format!(
                "download returned HTTP {}",
                response.status().as_u16()
            )));
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|e| WorkflowError::Transient(format!("download interrupted: {e}")))?;

        tokio::fs::write(output_path, &bytes)
            .await
            .map_err(|source| WorkflowError::Io {
                path: output_path.to_path_buf(),
                source,
            })?;
        Ok(bytes.len() as u64)
    }
}

#[async_trait::async_trait]
impl Workflow for PortalUploadWorkflow {
    type Session = BrowserSession;

    async fn run(
        &self,
        lease: &mut SessionLease<'_, BrowserSession>,
        run: &WorkflowRun,
    ) -> Result<(), WorkflowError> {
        // Clone the protocol handle so the lease stays free for auth marks.
        let driver = lease.session().driver().clone();
        let asset_name = asset_name(&self.config.base_asset_name, unix_now(), &run.run_id);
        tracing::info!(asset_name = %asset_name, attempt = run.attempt, "Starting portal upload");

        let name_field = self.open_create_modal(&driver, lease).await?;
        type_like_human(&driver, &name_field, &asset_name).await?;

        self.attach_file(&driver, &run.input_path).await?;
        human_delay(0.8, 1.6).await;

        let upload_button = Locator::xpath("//button[normalize-space(.)='Upload File']");
        let button = driver.wait_enabled(&upload_button, self.timeouts.control).await?;
        driver.click(&button).await?;
        tracing::debug!("Upload submitted, waiting for modal to close");

        driver.wait_hidden(&upload_button, self.timeouts.upload).await?;
        human_delay(1.2, 2.6).await;

        let row_locator = Locator::xpath(format!("//tr[contains(., {})]", xpath_literal(&asset_name)));
        let row = driver.wait_visible(&row_locator, self.timeouts.asset_row).await?;

        let download_locator = Locator::css("[data-sentry-component='DownloadButton']");
        let (d, row, locator) = (&driver, &row, &download_locator);
        let download_button = driver
            .wait_for("enabled download button", self.timeouts.download_ready, move || async move {
                let button = d.find_in(row, locator).await?;
                Ok(d.is_enabled(&button).await?.then_some(button))
            })
            .await?;
        tracing::info!(asset_name = %asset_name, "Asset processed, downloading");

        let bytes = self
            .download(&driver, &download_button, &run.output_path)
            .await?;
        tracing::info!(bytes, path = %run.output_path.display(), "Download complete");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// `<base>_<unix seconds>_<run id>`: unique per attempt.
fn asset_name(base: &str, unix_secs: u64, run_id: &str) -> String {
    format!("{base}_{unix_secs}_{run_id}")
}

fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

fn random_delay(min_secs: f64, max_secs: f64) -> Duration {
    Duration::from_secs_f64(rand::rng().random_range(min_secs..max_secs))
}

/// Pause for a random, human-looking interval.
async fn human_delay(min_secs: f64, max_secs: f64) {
    tokio::time::sleep(random_delay(min_secs, max_secs)).await;
}

/// Click the field and type `text` one character at a time.
async fn type_like_human(driver: &WebDriverSession, element: &Element, text: &str) -> Result<(), WebDriverError> {
    driver.click(element).await?;
    human_delay(0.3, 0.7).await;
    let mut buf = [0u8; 4];
    for ch in text.chars() {
        driver.send_keys(element, ch.encode_utf8(&mut buf)).await?;
        tokio::time::sleep(random_delay(0.07, 0.2)).await;
    }
    human_delay(0.3, 0.7).await;
    Ok(())
}

/// Quote `text` as an XPath 1.0 string literal. XPath has no escapes, so a
/// value holding both quote kinds is split into a `concat()`.
fn xpath_literal(text: &str) -> String {
    if !text.contains('\'') {
        return format!("'{text}'");
    }
    if !text.contains('"') {
        return format!("\"{text}\"");
    }
    let parts: Vec<String> = text.split('\'').map(|part| format!("'{part}'")).collect();
    format!("concat({})", parts.join(r#", "'", "#))
}

fn resolve_href(base_url: &str, href: &str) -> String {
    if href.starts_with("http://") || href.starts_with("https://") {
        href.to_string()
    } else if let Some(rest) = href.strip_prefix('/') {
        format!("{}/{}", base_url.trim_end_matches('/'), rest)
    } else {
        format!("{}/{}", base_url.trim_end_matches('/'), href)
    }
}

fn cookie_header(cookies: &[Cookie]) -> String {
    cookies
        .iter()
        .map(|c| format!("{}={}", c.name, c.value))
        .collect::<Vec<_>>()
        .join("; ")
}
