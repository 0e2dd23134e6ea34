//! Per-device identity and the local profile it lives in.

use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::engine::validation::validate_display_name;
use crate::error::{ProfileError, SessionResult};
use crate::store::path::is_valid_key;

const UID_PREFIX: &str = "uid_";
const UID_ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
const UID_SUFFIX_LEN: usize = 6;

/// What a device remembers between runs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalProfile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default)]
    pub saved_servers: Vec<String>,
}

impl LocalProfile {
    /// Add `server_id` to the saved list. Returns false if it was already there.
    pub fn remember_server(&mut self, server_id: &str) -> bool {
        if self.saved_servers.iter().any(|s| s == server_id) {
            return false;
        }
        self.saved_servers.push(server_id.to_string());
        true
    }
}

/// Where a profile is loaded from and saved to.
pub trait ProfileStore: Send {
    fn load(&self) -> Result<LocalProfile, ProfileError>;
    fn save(&self, profile: &LocalProfile) -> Result<(), ProfileError>;
}

/// Profile kept as a JSON file. A missing file reads as an empty profile.
#[derive(Debug, Clone)]
pub struct FileProfileStore {
    path: PathBuf,
}

impl FileProfileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl ProfileStore for FileProfileStore {
    fn load(&self) -> Result<LocalProfile, ProfileError> {
        if !self.path.exists() {
            debug!(path = %self.path.display(), "no profile file, starting fresh");
            return Ok(LocalProfile::default());
        }
        let contents = fs::read_to_string(&self.path)?;
        Ok(serde_json::from_str(&contents)?)
    }

    fn save(&self, profile: &LocalProfile) -> Result<(), ProfileError> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.path, serde_json::to_vec_pretty(profile)?)?;
        Ok(())
    }
}

/// Profile held in memory. Clones share the same profile.
#[derive(Debug, Clone, Default)]
pub struct MemoryProfileStore {
    profile: Arc<Mutex<LocalProfile>>,
}

impl MemoryProfileStore {
    pub fn new(profile: LocalProfile) -> Self {
        Self {
            profile: Arc::new(Mutex::new(profile)),
        }
    }

    /// The last saved profile.
    pub fn snapshot(&self) -> LocalProfile {
        self.profile
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl ProfileStore for MemoryProfileStore {
    fn load(&self) -> Result<LocalProfile, ProfileError> {
        Ok(self.snapshot())
    }

    fn save(&self, profile: &LocalProfile) -> Result<(), ProfileError> {
        *self.profile.lock().unwrap_or_else(PoisonError::into_inner) = profile.clone();
        Ok(())
    }
}

/// Generate an anonymous device id: `uid_` plus six base-36 characters.
pub fn generate_uid() -> String {
    let mut rng = rand::thread_rng();
    let suffix: String = (0..UID_SUFFIX_LEN)
        .map(|_| char::from(UID_ALPHABET[rng.gen_range(0..UID_ALPHABET.len())]))
        .collect();
    format!("{UID_PREFIX}{suffix}")
}

/// Default display name, `User0` through `User999`.
pub fn generate_display_name() -> String {
    format!("User{}", rand::thread_rng().gen_range(0..1000))
}

/// Supplies the session's uid and display name, backed by a [`ProfileStore`].
pub struct IdentityProvider {
    store: Box<dyn ProfileStore>,
    profile: LocalProfile,
    uid: String,
    display_name: String,
}

impl IdentityProvider {
    /// Load the profile, filling in and persisting whatever is missing or unusable.
    pub fn load(store: Box<dyn ProfileStore>) -> Result<Self, ProfileError> {
        let mut profile = store.load()?;
        let mut dirty = false;

        let uid = match profile.uid.clone() {
            Some(uid) if is_valid_key(&uid) => uid,
            _ => {
                let uid = generate_uid();
                info!(%uid, "generated device identity");
                profile.uid = Some(uid.clone());
                dirty = true;
                uid
            }
        };

        let display_name = match profile
            .username
            .as_deref()
            .map(validate_display_name)
        {
            Some(Ok(name)) => name,
            _ => {
                let name = generate_display_name();
                profile.username = Some(name.clone());
                dirty = true;
                name
            }
        };

        if dirty {
            store.save(&profile)?;
        }

        Ok(Self {
            store,
            profile,
            uid,
            display_name,
        })
    }

    pub fn uid(&self) -> &str {
        &self.uid
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub fn saved_servers(&self) -> &[String] {
        &self.profile.saved_servers
    }

    /// Validate and persist a new display name. Returns the stored form.
    pub fn set_display_name(&mut self, name: &str) -> SessionResult<String> {
        let name = validate_display_name(name)?;
        self.profile.username = Some(name.clone());
        self.store.save(&self.profile)?;
        self.display_name = name.clone();
        Ok(name)
    }

    /// Record a server in the saved list, persisting only when it is new.
    pub fn remember_server(&mut self, server_id: &str) -> Result<(), ProfileError> {
        if self.profile.remember_server(server_id) {
            self.store.save(&self.profile)?;
        }
        Ok(())
    }
}
