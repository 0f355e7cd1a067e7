//! Collaborator interfaces the core depends on instead of reaching back
//! into an outer application object. Breaks the cyclic reference between
//! the core and whatever owns the operator console, credential store,
//! autorun list, and outbound broadcasters.

use crate::error::Result;

/// One parsed credential, handed to the outer application's credential
/// store. The core runs the heuristics (`TASK_CMD_WAIT`, mimikatz-shaped
/// `TASK_CMD_JOB` output) but never persists credentials itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    pub username: String,
    pub domain: String,
    pub secret: String,
    pub host: String,
    pub cred_type: CredentialType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialType {
    Plaintext,
    Ntlm,
}

pub trait CredentialStore: Send + Sync {
    fn upsert(&self, credential: Credential) -> Result<()>;
}

/// Commands to enqueue on an agent's first successful activation. The
/// core consults this after the configured global autorun (C10); it owns
/// no policy of its own, just the per-language command lists.
pub trait AutorunProvider: Send + Sync {
    fn commands_for(&self, language: crate::packet::Language) -> Vec<(u16, Vec<u8>)>;
}

/// Pushes raw bytes to whatever outbound channel the outer application
/// wires up — a websocket broadcaster, a Slack-style webhook, etc. The
/// core only ever calls this with already-formatted text.
pub trait Broadcaster: Send + Sync {
    fn broadcast(&self, channel: &str, message: &str);
}

/// No-op implementations, useful for tests and for embedders that don't
/// need one of the collaborators.
pub struct NullCredentialStore;
impl CredentialStore for NullCredentialStore {
    fn upsert(&self, _credential: Credential) -> Result<()> {
        Ok(())
    }
}

pub struct NullAutorunProvider;
impl AutorunProvider for NullAutorunProvider {
    fn commands_for(&self, _language: crate::packet::Language) -> Vec<(u16, Vec<u8>)> {
        Vec::new()
    }
}

pub struct NullBroadcaster;
impl Broadcaster for NullBroadcaster {
    fn broadcast(&self, _channel: &str, _message: &str) {}
}
