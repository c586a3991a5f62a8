//! Identity resolution
//!
//! An authenticated session always wins. Without one, the actor is anonymous:
//! the `anonymous_id` is generated once and persisted in the storage scope,
//! while the display nickname is freshly generated on every resolution. Only
//! the id is stable; a returning visitor gets a new nickname each session and
//! their past messages keep the nicknames they were sent under.

use std::fs;
use std::path::{Path, PathBuf};

use rand::Rng;
use tracing::debug;

use stadtchat_protocol::Actor;

use crate::ClientError;

const ANONYMOUS_ID_FILE: &str = "anonymous_id";
const STAY_ANONYMOUS_FILE: &str = "stay_anonymous";

const NICKNAME_ADJECTIVES: &[&str] = &[
    "Blauer", "Roter", "Gruener", "Gelber", "Stiller", "Schneller", "Kluger", "Wilder",
    "Heller", "Dunkler", "Froher", "Leiser",
];

const NICKNAME_ANIMALS: &[&str] = &[
    "Fuchs", "Adler", "Falke", "Igel", "Luchs", "Biber", "Reiher", "Dachs", "Marder",
    "Kranich", "Otter", "Habicht",
];

/// An authenticated session handed in by the surrounding app.
#[derive(Debug, Clone)]
pub struct AuthSession {
    pub user_id: String,
}

/// File-backed identity state scoped to one storage directory. Different
/// directories are independent scopes with independent anonymous ids.
#[derive(Debug, Clone)]
pub struct IdentityStore {
    dir: PathBuf,
}

impl IdentityStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Default storage scope under the platform data directory.
    pub fn default_scope() -> Result<Self, ClientError> {
        let base = dirs::data_dir().ok_or_else(|| {
            ClientError::Io(std::io::Error::other("no data directory available"))
        })?;
        Ok(Self::new(base.join("stadtchat")))
    }

    /// The persisted anonymous id for this scope, generated on first use.
    pub fn anonymous_id(&self) -> Result<String, ClientError> {
        let path = self.dir.join(ANONYMOUS_ID_FILE);
        if let Ok(existing) = fs::read_to_string(&path) {
            let trimmed = existing.trim();
            if !trimmed.is_empty() {
                return Ok(trimmed.to_string());
            }
        }

        let id = uuid::Uuid::new_v4().to_string();
        fs::create_dir_all(&self.dir)?;
        fs::write(&path, &id)?;
        debug!(
            component = "identity",
            event = "identity.anonymous_id_created",
            "Generated new anonymous id"
        );
        Ok(id)
    }

    /// Whether the user has opted to keep sending anonymously. Unset means
    /// the send path must surface the identity choice first.
    pub fn stay_anonymous(&self) -> bool {
        self.dir.join(STAY_ANONYMOUS_FILE).exists()
    }

    pub fn set_stay_anonymous(&self) -> Result<(), ClientError> {
        fs::create_dir_all(&self.dir)?;
        fs::write(self.dir.join(STAY_ANONYMOUS_FILE), "1")?;
        Ok(())
    }

    pub fn scope_path(&self) -> &Path {
        &self.dir
    }
}

/// Resolve the actor for a new connection.
pub fn resolve_actor(
    store: &IdentityStore,
    auth: Option<&AuthSession>,
) -> Result<Actor, ClientError> {
    if let Some(session) = auth {
        return Ok(Actor::Authenticated {
            user_id: session.user_id.clone(),
        });
    }

    Ok(Actor::Anonymous {
        anonymous_id: store.anonymous_id()?,
        nickname: generate_nickname(),
    })
}

/// A fresh human-readable handle, e.g. "BlauerFuchs42".
pub fn generate_nickname() -> String {
    let mut rng = rand::thread_rng();
    let adjective = NICKNAME_ADJECTIVES[rng.gen_range(0..NICKNAME_ADJECTIVES.len())];
    let animal = NICKNAME_ANIMALS[rng.gen_range(0..NICKNAME_ANIMALS.len())];
    let number: u8 = rng.gen_range(1..100);
    format!("{adjective}{animal}{number}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anonymous_id_is_stable_within_a_scope() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = IdentityStore::new(dir.path());

        let first = store.anonymous_id().expect("first");
        let second = store.anonymous_id().expect("second");
        assert_eq!(first, second);
    }

    #[test]
    fn anonymous_ids_differ_across_scopes() {
        let a = tempfile::tempdir().expect("tempdir a");
        let b = tempfile::tempdir().expect("tempdir b");

        let id_a = IdentityStore::new(a.path()).anonymous_id().expect("a");
        let id_b = IdentityStore::new(b.path()).anonymous_id().expect("b");
        assert_ne!(id_a, id_b);
    }

    #[test]
    fn nickname_is_fresh_per_resolution() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = IdentityStore::new(dir.path());

        let first = resolve_actor(&store, None).expect("first");
        let second = resolve_actor(&store, None).expect("second");

        match (&first, &second) {
            (
                Actor::Anonymous {
                    anonymous_id: id_a, ..
                },
                Actor::Anonymous {
                    anonymous_id: id_b, ..
                },
            ) => assert_eq!(id_a, id_b),
            other => panic!("expected anonymous actors, got {:?}", other),
        }
        // Ids persist; nicknames are rolled per call and only collide by
        // chance. Format is always adjective+animal+number.
        assert!(first.nickname().chars().any(|c| c.is_ascii_digit()));
        assert!(second.nickname().chars().any(|c| c.is_ascii_digit()));
    }

    #[test]
    fn authenticated_session_wins() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = IdentityStore::new(dir.path());
        let auth = AuthSession {
            user_id: "user-7".to_string(),
        };

        let actor = resolve_actor(&store, Some(&auth)).expect("resolve");
        assert_eq!(actor.user_id(), Some("user-7"));
        // No anonymous id file is created for authenticated sessions.
        assert!(!dir.path().join(ANONYMOUS_ID_FILE).exists());
    }

    #[test]
    fn stay_anonymous_preference_round_trips() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = IdentityStore::new(dir.path());

        assert!(!store.stay_anonymous());
        store.set_stay_anonymous().expect("set");
        assert!(store.stay_anonymous());
    }
}
