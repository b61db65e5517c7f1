//! An authenticating SMTP relay: accepts mail over SMTP/ESMTP,
//! applies admission policy, and forwards each accepted message to a
//! fixed smarthost.
pub mod authfile;
pub mod config;
pub mod logging;
pub mod metrics;
pub mod relay;
pub mod trace;
pub mod xoauth2;
