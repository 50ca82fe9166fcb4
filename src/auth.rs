// Copyright 2020 Joyent, Inc.

//! Collaborators the session calls out to: the permission check run before
//! each file operation, and the notification sent when a file is closed.

use std::net::IpAddr;

use crate::backend::FileStat;
use crate::config::RfioConfig;
use crate::error::{serrno, RfioError};

pub const OPEN_TRUST: &str = "open-trust";
pub const READ_TRUST: &str = "read-trust";
pub const WRITE_TRUST: &str = "write-trust";
pub const STAT_TRUST: &str = "stat-trust";

pub const OPEN_READ_CAPABILITIES: &[&str] = &[OPEN_TRUST, READ_TRUST];
pub const OPEN_WRITE_CAPABILITIES: &[&str] = &[OPEN_TRUST, WRITE_TRUST];
pub const STAT_CAPABILITIES: &[&str] = &[STAT_TRUST, READ_TRUST];

/// Who is asking, as mapped from the request and the connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub uid: u32,
    pub gid: u32,
    pub user: String,
    pub host: IpAddr,
}

pub trait Authorizer: Send + Sync {
    fn is_granted(&self, identity: &Identity, capability: &str) -> bool;
}

/// Walk `capabilities` in order; the first one granted wins. Refusal of
/// every capability is reported as `SEHOSTREFUSED`.
pub fn authorize<'a>(
    authorizer: &dyn Authorizer,
    identity: &Identity,
    capabilities: &[&'a str],
) -> Result<&'a str, RfioError> {
    capabilities
        .iter()
        .copied()
        .find(|cap| authorizer.is_granted(identity, cap))
        .ok_or(RfioError::Backend(serrno::SEHOSTREFUSED))
}

/// Grants local peers everything, grants remote peers everything when
/// non-local direct access is allowed, and otherwise consults the
/// per-capability host lists of the configuration.
#[derive(Debug, Clone)]
pub struct HostAuthorizer {
    allow_nonlocal: bool,
    trust: std::collections::HashMap<String, Vec<String>>,
}

impl HostAuthorizer {
    pub fn from_config(config: &RfioConfig) -> HostAuthorizer {
        HostAuthorizer {
            allow_nonlocal: config.allow_nonlocal_direct,
            trust: config.trust.clone(),
        }
    }
}

impl Authorizer for HostAuthorizer {
    fn is_granted(&self, identity: &Identity, capability: &str) -> bool {
        if identity.host.is_loopback() || self.allow_nonlocal {
            return true;
        }
        let host = identity.host.to_string();
        self.trust
            .get(capability)
            .map(|hosts| hosts.iter().any(|h| h == &host || h == "*"))
            .unwrap_or(false)
    }
}

/// Told about every file closed by a session. An error returned here turns
/// an otherwise successful close into a failed one.
pub trait CloseNotifier: Send + Sync {
    fn file_closed(
        &self,
        path: &str,
        stat: &FileStat,
        pending_error: Option<i32>,
    ) -> Result<(), i32>;
}

#[derive(Debug, Default, Clone)]
pub struct NoopNotifier;

impl CloseNotifier for NoopNotifier {
    fn file_closed(
        &self,
        _path: &str,
        _stat: &FileStat,
        _pending_error: Option<i32>,
    ) -> Result<(), i32> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::HashMap;

    fn identity(host: &str) -> Identity {
        Identity {
            uid: 1000,
            gid: 100,
            user: "alice".into(),
            host: host.parse().unwrap(),
        }
    }

    struct Only(&'static str);

    impl Authorizer for Only {
        fn is_granted(&self, _identity: &Identity, capability: &str) -> bool {
            capability == self.0
        }
    }

    #[test]
    fn first_granted_capability_wins() {
        let id = identity("10.0.0.1");
        assert_eq!(
            authorize(&Only(READ_TRUST), &id, OPEN_READ_CAPABILITIES).unwrap(),
            READ_TRUST
        );
        assert_eq!(
            authorize(&Only(OPEN_TRUST), &id, OPEN_READ_CAPABILITIES).unwrap(),
            OPEN_TRUST
        );
    }

    #[test]
    fn all_denied_is_host_refused() {
        let id = identity("10.0.0.1");
        let err = authorize(&Only(WRITE_TRUST), &id, STAT_CAPABILITIES).unwrap_err();
        assert_eq!(err.errno(), serrno::SEHOSTREFUSED);
    }

    #[test]
    fn host_authorizer_policy() {
        let mut config = RfioConfig::default();
        let mut trust = HashMap::new();
        trust.insert(READ_TRUST.to_string(), vec!["10.0.0.2".to_string()]);
        config.trust = trust;

        let auth = HostAuthorizer::from_config(&config);
        assert!(auth.is_granted(&identity("127.0.0.1"), WRITE_TRUST));
        assert!(auth.is_granted(&identity("10.0.0.2"), READ_TRUST));
        assert!(!auth.is_granted(&identity("10.0.0.2"), WRITE_TRUST));
        assert!(!auth.is_granted(&identity("10.0.0.3"), READ_TRUST));

        config.allow_nonlocal_direct = true;
        let auth = HostAuthorizer::from_config(&config);
        assert!(auth.is_granted(&identity("10.0.0.3"), WRITE_TRUST));
    }
}
