//! `/sys/sessions` bindings: trusted-root bootstrap from a local settings
//! file, and the quarantine bucket for sessions that arrive before their
//! signer is trusted (§3 "Session", §6 "Authorisation").

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::crypto::{PublicKey, Session};
use crate::error::Result;
use crate::merge::OwnedSessions;
use crate::repository::SessionResolver;

/// On-disk shape of `/sys/sessions/<orgId>/*.json` (§6): the root sessions
/// trusted a priori, this process's own session, and any sessions already
/// known to be trustworthy from a prior run.
#[derive(Debug, Serialize, Deserialize)]
struct LocalSettingsFile {
    #[serde(rename = "currentSession")]
    current_session: Session,
    roots: Vec<Session>,
    #[serde(rename = "trustedSessions")]
    trusted_sessions: Vec<Session>,
}

/// Tracks which sessions this process trusts (can verify commits from)
/// and which it owns (can sign commits with), plus a quarantine of
/// sessions that arrived signed by an as-yet-untrusted session.
pub struct SessionStore {
    current_id: String,
    trusted: RwLock<BTreeMap<String, Session>>,
    owned: RwLock<BTreeMap<String, Session>>,
    quarantine: RwLock<Vec<(Session, String)>>,
}

impl SessionStore {
    /// Loads the local settings file and seeds trust from its roots,
    /// current session, and previously-trusted sessions (§6).
    pub fn bootstrap(settings_path: impl AsRef<Path>, _org_id: impl Into<String>) -> Result<SessionStore> {
        let bytes = fs::read(settings_path.as_ref())?;
        let settings: LocalSettingsFile = serde_json::from_slice(&bytes)?;

        let current_id = settings.current_session.id.clone();
        let mut trusted = BTreeMap::new();
        let mut owned = BTreeMap::new();

        owned.insert(current_id.clone(), settings.current_session.clone());
        trusted.insert(current_id.clone(), settings.current_session);

        for root in settings.roots.into_iter().chain(settings.trusted_sessions) {
            if root.is_owned() {
                owned.insert(root.id.clone(), root.clone());
            }
            trusted.insert(root.id.clone(), root);
        }

        Ok(SessionStore {
            current_id,
            trusted: RwLock::new(trusted),
            owned: RwLock::new(owned),
            quarantine: RwLock::new(Vec::new()),
        })
    }

    /// Builds a store directly from an already-decoded root session, for
    /// tests and single-node bootstraps where no settings file exists yet.
    pub fn from_root(root: Session) -> SessionStore {
        let mut trusted = BTreeMap::new();
        let mut owned = BTreeMap::new();
        if root.is_owned() {
            owned.insert(root.id.clone(), root.clone());
        }
        trusted.insert(root.id.clone(), root.clone());
        SessionStore {
            current_id: root.id,
            trusted: RwLock::new(trusted),
            owned: RwLock::new(owned),
            quarantine: RwLock::new(Vec::new()),
        }
    }

    pub fn current_session(&self) -> Session {
        self.owned
            .read()
            .get(&self.current_id)
            .cloned()
            .expect("current session is always present once bootstrapped")
    }

    pub fn is_trusted(&self, session_id: &str) -> bool {
        self.trusted.read().contains_key(session_id)
    }

    /// A new session was observed (e.g. a `/sys/sessions` document commit
    /// materialised), signed by `signer_id`. If the signer is already
    /// trusted, `candidate` becomes trusted too and the quarantine is
    /// re-examined for anything that can now be admitted transitively.
    /// Otherwise `candidate` is quarantined alongside its signer id.
    pub fn ingest(&self, candidate: Session, signer_id: &str) -> bool {
        if self.is_trusted(signer_id) {
            self.admit(candidate);
            self.re_examine_quarantine();
            true
        } else {
            self.quarantine.write().push((candidate, signer_id.to_string()));
            false
        }
    }

    fn admit(&self, session: Session) {
        if session.is_owned() {
            self.owned.write().insert(session.id.clone(), session.clone());
        }
        self.trusted.write().insert(session.id.clone(), session);
    }

    fn re_examine_quarantine(&self) {
        loop {
            let pending = std::mem::take(&mut *self.quarantine.write());
            let mut still_pending = Vec::new();
            let mut admitted_any = false;
            for (session, signer_id) in pending {
                if self.is_trusted(&signer_id) {
                    self.admit(session);
                    admitted_any = true;
                } else {
                    still_pending.push((session, signer_id));
                }
            }
            *self.quarantine.write() = still_pending;
            if !admitted_any {
                break;
            }
        }
    }

    pub fn quarantine_len(&self) -> usize {
        self.quarantine.read().len()
    }

    pub fn trusted_ids(&self) -> Vec<String> {
        self.trusted.read().keys().cloned().collect()
    }
}

impl SessionResolver for SessionStore {
    fn public_key_for(&self, session_id: &str) -> Option<PublicKey> {
        self.trusted.read().get(session_id).and_then(|s| s.public_key().ok())
    }
}

impl OwnedSessions for SessionStore {
    fn session(&self, session_id: &str) -> Option<Session> {
        self.owned.read().get(session_id).cloned()
    }
}
