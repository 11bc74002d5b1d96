//! Whitelist enforcement shared by the SOCKS and HTTP proxy backends.
//!
//! Both proxies call [`AccessControl::check`] with the client address before
//! a single payload byte is relayed. An empty whitelist allows everyone (see
//! the fail-open note on [`Whitelist::enabled`]).

use std::net::IpAddr;
use std::sync::Arc;

use onedoor_whitelist::Whitelist;
use tracing::{trace, warn};

use crate::backend::BackendRole;

/// Outcome of an access check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// Whitelist is empty, so every source is allowed.
    Open,
    /// Source is listed.
    Listed,
    /// Whitelist is enabled and the source is not listed.
    Denied,
}

impl Access {
    pub fn is_allowed(self) -> bool {
        !matches!(self, Access::Denied)
    }
}

/// Shared handle used by backends to apply the whitelist.
#[derive(Debug, Clone)]
pub struct AccessControl {
    whitelist: Arc<Whitelist>,
}

impl AccessControl {
    pub fn new(whitelist: Arc<Whitelist>) -> Self {
        Self { whitelist }
    }

    pub fn whitelist(&self) -> &Arc<Whitelist> {
        &self.whitelist
    }

    /// Decide whether `client` may use the proxy.
    pub fn decide(&self, client: IpAddr) -> Access {
        if !self.whitelist.enabled() {
            return Access::Open;
        }

        let address = client.to_canonical().to_string();
        if self.whitelist.contains(&address) {
            Access::Listed
        } else {
            Access::Denied
        }
    }

    /// Decide and log. Denials are reported locally only.
    pub fn check(&self, role: BackendRole, client: IpAddr) -> Access {
        let access = self.decide(client);
        match access {
            Access::Denied => warn!(
                role = %role,
                client = %client,
                "Unauthorized access rejected"
            ),
            _ => trace!(role = %role, client = %client, access = ?access, "Access granted"),
        }
        access
    }
}
