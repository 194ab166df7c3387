#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// A required setting is missing or unparseable. Fatal at startup.
    #[error("Configuration error: {0}")]
    Configuration(String),
}
