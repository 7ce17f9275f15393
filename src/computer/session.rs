//! Session snapshot

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use super::handshake::MachineMetadata;

/// Connection lifecycle of a [`super::Computer`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Closed,
}

/// One logical connection to a remote computer
#[derive(Debug, Clone, Serialize)]
pub struct Session {
    pub created_at: DateTime<Utc>,
    /// Response timestamp of the last inbound frame
    pub updated_at: DateTime<Utc>,
    /// Issued by the remote side in the welcome frame
    pub session_id: Option<Uuid>,
    pub metadata: Option<MachineMetadata>,
    pub state: ConnectionState,
}

impl Session {
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            created_at: now,
            updated_at: now,
            session_id: None,
            metadata: None,
            state: ConnectionState::Disconnected,
        }
    }

    /// Forget everything learned from the previous physical connection
    pub(crate) fn reset_connection(&mut self) {
        self.session_id = None;
        self.metadata = None;
    }

    pub(crate) fn touch(&mut self, at: DateTime<Utc>) {
        if at > self.updated_at {
            self.updated_at = at;
        }
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}
