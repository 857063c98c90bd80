//! In-process authorised-key set.
//!
//! The embedded SSH server consults this set instead of an
//! `authorized_keys` file. Entries are tagged with the session that
//! created them so concurrent cleanups remove exactly their own rows;
//! the set is persisted to disk only on clean shutdown.

use std::path::Path;

use tokio::sync::Mutex;
use tracing::debug;

use np_core::SessionId;

/// Forced-command restriction applied to every entry: the key may only be
/// used to forward to the local sshd, and the forced command exits after
/// 20 seconds idle.
pub fn restricted_line(public_openssh: &str, sshd_port: u16) -> String {
    format!(
        "command=\"sleep 20\",no-agent-forwarding,no-X11-forwarding,no-pty,\
         permitopen=\"localhost:{sshd_port}\" {public_openssh}"
    )
}

#[derive(Debug, Clone)]
pub struct AuthorizedEntry {
    pub session_id: SessionId,
    pub line: String,
}

/// Mutex-guarded set shared by every concurrent session.
#[derive(Default)]
pub struct AuthorizedKeySet {
    entries: Mutex<Vec<AuthorizedEntry>>,
}

impl AuthorizedKeySet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a restricted entry for `session_id`. Returns the rendered line.
    pub async fn authorize(
        &self,
        session_id: SessionId,
        public_openssh: &str,
        sshd_port: u16,
    ) -> String {
        let line = restricted_line(public_openssh.trim_end(), sshd_port);
        self.entries.lock().await.push(AuthorizedEntry {
            session_id,
            line: line.clone(),
        });
        debug!(session = %session_id, "authorised-key entry added");
        line
    }

    /// Remove every entry tagged with `session_id`. Removing twice is a
    /// no-op; entries belonging to other sessions are untouched.
    pub async fn remove(&self, session_id: &SessionId) -> usize {
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|entry| entry.session_id != *session_id);
        let removed = before - entries.len();
        if removed > 0 {
            debug!(session = %session_id, removed, "authorised-key entries removed");
        }
        removed
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    /// Render the set in authorized_keys file format.
    pub async fn render(&self) -> String {
        let entries = self.entries.lock().await;
        let mut out = String::new();
        for entry in entries.iter() {
            out.push_str(&entry.line);
            out.push('\n');
        }
        out
    }

    /// Persist the current set; called only on clean shutdown.
    pub async fn persist(&self, path: &Path) -> std::io::Result<()> {
        tokio::fs::write(path, self.render().await).await
    }
}
