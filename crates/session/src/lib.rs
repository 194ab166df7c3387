//! Exclusive automation-session management.
//!
//! [`pool::SessionPool`] owns the single, expensive external session for
//! the whole process: it creates it lazily, probes it before every use,
//! restarts it after a fixed number of uses and hands it out under a lease
//! so that only one job drives it at a time.
//!
//! [`browser`] provides the production session: a WebDriver-controlled
//! browser reached through the REST client in [`webdriver`].

pub mod browser;
pub mod pool;
pub mod webdriver;

pub use browser::{BrowserSession, WebDriverSessionFactory};
pub use pool::{
    AutomationSession, PoolConfig, SessionError, SessionFactory, SessionHealth, SessionLease,
    SessionPool, SessionState,
};
