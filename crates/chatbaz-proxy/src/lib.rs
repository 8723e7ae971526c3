//! Core rewriting layer for the ChatBAZ Cursor proxy.
//!
//! Cursor talks to a fixed API host (`api.anthropic.com`). This crate decides
//! whether a proxied exchange targets that host and, when it does, rewrites
//! the destination, path, and authentication headers so the request lands on
//! the ChatBAZ upstream instead. The response travels back to Cursor
//! untouched.
//!
//! The crate is deliberately free of network I/O: a forwarding front end (the
//! `chatbaz-proxy-cli` binary, or anything else that owns sockets) constructs
//! a [`Flow`] per exchange and calls [`RewriteEngine::on_request`] and
//! [`RewriteEngine::on_response`] at the two observation points.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use chatbaz_proxy::{AuthPolicy, CredentialStore, ProxyConfig, RewriteEngine};
//!
//! # fn example() -> chatbaz_proxy::Result<()> {
//! let store = Arc::new(CredentialStore::open_default()?);
//! let engine = RewriteEngine::new(
//!     ProxyConfig::default(),
//!     AuthPolicy::Substitute { store },
//! );
//! # let _ = engine;
//! # Ok(())
//! # }
//! ```

mod config;
mod credentials;
mod error;
mod flow;
mod rewrite;

pub use config::ProxyConfig;
pub use credentials::{CredentialRecord, CredentialStore, storage_dir, validate_api_key};
pub use error::{ProxyError, Result};
pub use flow::{Flow, FlowResponse, Headers};
pub use rewrite::{AuthPolicy, METADATA_REQUEST_ID, METADATA_REWRITTEN, RewriteEngine};
