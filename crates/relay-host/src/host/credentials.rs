// Copyright (C) 2025 Ryan Daum <ryan.daum@gmail.com> This program is free
// software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, version
// 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//

//! Username/password store, populated from layered sources and verified with Argon2id.
//!
//! Sources are applied in order and later declarations of the same username replace earlier
//! ones. Within a dotenv file or the process environment, individual `USER<N>_NAME` /
//! `USER<N>_PASS` pairs are applied first and the combined `CLIPSYNC_USERS=user:pass,...` list
//! after them.
//!
//! Passwords that already look like an Argon2 PHC string (`$argon2...`) are stored as-is.
//! Everything else is hashed at load time; plaintext is not kept.

use argon2::{
    Algorithm, Argon2, Params, PasswordHash, PasswordHasher, PasswordVerifier, Version,
    password_hash::SaltString,
};
use std::{
    collections::{BTreeMap, HashMap},
    fmt::{Display, Formatter},
    path::{Path, PathBuf},
    sync::Arc,
};
use tracing::{debug, info, warn};

pub const COMBINED_USERS_VAR: &str = "CLIPSYNC_USERS";

const DEFAULT_USERS: &[(&str, &str)] = &[
    ("admin", "admin123"),
    ("user1", "password123"),
    ("user2", "password456"),
    ("guest", "guest789"),
];

/// Verified against for unknown usernames so that lookups of missing users cost the same.
const DUMMY_PASSWORD: &str = "clipsync-no-such-user";

#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("no user credentials could be loaded from any source")]
    NoUsers,
    #[error("invalid argon2 parameters: {0}")]
    Params(String),
    #[error("unable to hash password for {username:?}: {reason}")]
    Hash { username: String, reason: String },
}

/// Argon2id cost parameters used when hashing plaintext passwords.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HashingParams {
    pub memory_kib: u32,
    pub iterations: u32,
}

impl Default for HashingParams {
    fn default() -> Self {
        Self {
            memory_kib: Params::DEFAULT_M_COST,
            iterations: Params::DEFAULT_T_COST,
        }
    }
}

impl HashingParams {
    pub fn new(memory_kib: u32, iterations: u32) -> Self {
        Self {
            memory_kib,
            iterations,
        }
    }

    fn argon2(&self) -> Result<Argon2<'static>, CredentialError> {
        let params = Params::new(
            self.memory_kib,
            self.iterations,
            Params::DEFAULT_P_COST,
            None,
        )
        .map_err(|e| CredentialError::Params(e.to_string()))?;
        Ok(Argon2::new(Algorithm::Argon2id, Version::V0x13, params))
    }
}

/// One layer of user declarations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialSource {
    /// The fixed development accounts.
    BuiltinDefaults,
    /// A dotenv-style file. A missing file contributes nothing.
    File(PathBuf),
    /// The process environment.
    Environment,
    /// Explicit `(username, password)` pairs.
    Static(Vec<(String, String)>),
}

impl Display for CredentialSource {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            CredentialSource::BuiltinDefaults => write!(f, "built-in defaults"),
            CredentialSource::File(path) => write!(f, "file {}", path.display()),
            CredentialSource::Environment => write!(f, "environment"),
            CredentialSource::Static(_) => write!(f, "static list"),
        }
    }
}

impl CredentialSource {
    fn declarations(&self) -> Vec<(String, String)> {
        match self {
            CredentialSource::BuiltinDefaults => DEFAULT_USERS
                .iter()
                .map(|(u, p)| (u.to_string(), p.to_string()))
                .collect(),
            CredentialSource::File(path) => read_env_file(path)
                .map(parse_declarations)
                .unwrap_or_default(),
            CredentialSource::Environment => parse_declarations(std::env::vars()),
            CredentialSource::Static(pairs) => pairs.clone(),
        }
    }
}

fn read_env_file(path: &Path) -> Option<Vec<(String, String)>> {
    match dotenvy::from_path_iter(path) {
        Ok(iter) => Some(
            iter.filter_map(|item| match item {
                Ok(pair) => Some(pair),
                Err(e) => {
                    warn!(path = ?path, "Skipping unreadable credentials line: {e}");
                    None
                }
            })
            .collect(),
        ),
        Err(e) if e.not_found() => {
            debug!(path = ?path, "No credentials file");
            None
        }
        Err(e) => {
            warn!(path = ?path, "Unable to read credentials file: {e}");
            None
        }
    }
}

/// Extract user declarations from a set of environment-style variables.
///
/// Numbered pairs come out first, ordered by their index, followed by the combined list.
pub fn parse_declarations(
    vars: impl IntoIterator<Item = (String, String)>,
) -> Vec<(String, String)> {
    let mut numbered: BTreeMap<u32, (Option<String>, Option<String>)> = BTreeMap::new();
    let mut combined = None;
    for (key, value) in vars {
        if key == COMBINED_USERS_VAR {
            combined = Some(value);
            continue;
        }
        let Some(rest) = key.strip_prefix("USER") else {
            continue;
        };
        let (index, is_name) = if let Some(index) = rest.strip_suffix("_NAME") {
            (index, true)
        } else if let Some(index) = rest.strip_suffix("_PASS") {
            (index, false)
        } else {
            continue;
        };
        let Ok(index) = index.parse::<u32>() else {
            continue;
        };
        let slot = numbered.entry(index).or_default();
        let value = value.trim().to_string();
        if is_name {
            slot.0 = Some(value);
        } else {
            slot.1 = Some(value);
        }
    }

    let mut declarations = Vec::new();
    for (index, slot) in numbered {
        match slot {
            (Some(name), Some(pass)) if !name.is_empty() && !pass.is_empty() => {
                declarations.push((name, pass))
            }
            _ => warn!("Skipping USER{index}: name and password must both be set"),
        }
    }
    if let Some(combined) = combined {
        declarations.extend(parse_combined_list(&combined));
    }
    declarations
}

/// Parse `user:pass,user:pass`. Passwords may themselves contain `:`.
pub fn parse_combined_list(list: &str) -> Vec<(String, String)> {
    list.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .filter_map(|entry| {
            let Some((name, pass)) = entry.split_once(':') else {
                warn!("Skipping {COMBINED_USERS_VAR} entry without a ':' separator");
                return None;
            };
            let (name, pass) = (name.trim(), pass.trim());
            if name.is_empty() || pass.is_empty() {
                warn!("Skipping {COMBINED_USERS_VAR} entry with an empty name or password");
                return None;
            }
            Some((name.to_string(), pass.to_string()))
        })
        .collect()
}

pub struct CredentialStore {
    users: HashMap<String, String>,
    dummy_hash: String,
}

impl CredentialStore {
    /// Build the store from the given sources, applied in order.
    pub fn load(
        sources: &[CredentialSource],
        params: HashingParams,
    ) -> Result<Self, CredentialError> {
        let mut merged: HashMap<String, String> = HashMap::new();
        for source in sources {
            let declarations = source.declarations();
            debug!(source = %source, count = declarations.len(), "Read credential source");
            merged.extend(declarations);
        }
        if merged.is_empty() {
            return Err(CredentialError::NoUsers);
        }

        let argon2 = params.argon2()?;
        let mut users = HashMap::with_capacity(merged.len());
        for (username, secret) in merged {
            let hash = if secret.starts_with("$argon2") {
                if let Err(e) = PasswordHash::new(&secret) {
                    warn!(username = %username, "Skipping user with an unparseable password hash: {e}");
                    continue;
                }
                secret
            } else {
                hash_password(&argon2, &username, &secret)?
            };
            users.insert(username, hash);
        }
        if users.is_empty() {
            return Err(CredentialError::NoUsers);
        }
        let dummy_hash = hash_password(&argon2, "", DUMMY_PASSWORD)?;

        info!(users = users.len(), "Credential store ready");
        Ok(Self { users, dummy_hash })
    }

    /// Check a username/password pair. Unknown users go through a full hash verification too.
    pub fn verify(&self, username: &str, password: &str) -> bool {
        let (hash, known) = match self.users.get(username) {
            Some(hash) => (hash.as_str(), true),
            None => (self.dummy_hash.as_str(), false),
        };
        let Ok(parsed) = PasswordHash::new(hash) else {
            return false;
        };
        // Parameters come from the PHC string itself.
        let matched = Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok();
        matched && known
    }

    /// [`Self::verify`] on the blocking pool, keeping hash work off the async workers.
    pub async fn verify_blocking(self: &Arc<Self>, username: String, password: String) -> bool {
        let store = Arc::clone(self);
        tokio::task::spawn_blocking(move || store.verify(&username, &password))
            .await
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    pub fn contains(&self, username: &str) -> bool {
        self.users.contains_key(username)
    }

    pub fn usernames(&self) -> Vec<String> {
        let mut names: Vec<_> = self.users.keys().cloned().collect();
        names.sort();
        names
    }
}

fn hash_password(
    argon2: &Argon2<'_>,
    username: &str,
    password: &str,
) -> Result<String, CredentialError> {
    let salt: [u8; 16] = rand::random();
    let salt = SaltString::encode_b64(&salt).map_err(|e| CredentialError::Hash {
        username: username.to_string(),
        reason: e.to_string(),
    })?;
    argon2
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| CredentialError::Hash {
            username: username.to_string(),
            reason: e.to_string(),
        })
}
