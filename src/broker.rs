//! Consumed rendezvous interface
//!
//! The broker itself (registration, challenge/response authentication) is
//! an external collaborator. This module only models what the peer
//! consumes from it: contact records, and a lookup keyed by peer id. A
//! JSON roster file under the root's sentinel directory stands in for a
//! live broker lookup.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::Path;
use thiserror::Error;

/// Name of the roster file inside the sentinel directory.
pub const ROSTER_FILE: &str = "contacts.json";

#[derive(Error, Debug)]
pub enum RosterError {
    #[error("invalid roster: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// What the broker knows about one peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    /// Transport address the peer listens on.
    #[serde(rename = "multiaddr")]
    pub addr: String,
    pub peer_id: String,
    #[serde(rename = "rsa_public_key")]
    pub public_key: String,
}

/// The set of contacts this peer may sync with.
#[derive(Debug, Clone, Default)]
pub struct Roster {
    contacts: Vec<Contact>,
}

impl Roster {
    pub fn new(contacts: Vec<Contact>) -> Self {
        Self { contacts }
    }

    /// Load a roster from a JSON array of contacts. A missing file is an
    /// empty roster.
    pub fn load(path: &Path) -> Result<Self, RosterError> {
        let raw = match fs::read(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(e.into()),
        };
        let contacts = serde_json::from_slice(&raw)?;
        Ok(Self { contacts })
    }

    pub fn lookup(&self, peer_id: &str) -> Option<&Contact> {
        self.contacts.iter().find(|c| c.peer_id == peer_id)
    }

    pub fn contacts(&self) -> &[Contact] {
        &self.contacts
    }
}
