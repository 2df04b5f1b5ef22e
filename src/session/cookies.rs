//! Cookie jar with JSON persistence.
//!
//! The jar is a flat name → value map, matching the on-disk cookie file
//! format (a JSON object, no attributes, domain implicit). Values are kept
//! byte-identical from `Set-Cookie` to `Cookie` header to file and back.
//!
//! Two locks: the jar mutex serializes map mutation (taken briefly, never
//! across an await), and a separate async mutex serializes file writes so
//! two save triggers cannot interleave a temp-file rename.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::{debug, instrument, warn};

/// Errors loading or persisting the cookie file.
#[derive(Debug, thiserror::Error)]
pub enum CookieStoreError {
    /// The cookie file could not be read or written.
    #[error("cookie file {}: {source}", .path.display())]
    Io {
        /// The cookie file path.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The cookie file is not a JSON object of string values.
    #[error("cookie file {} is not a JSON object of cookie name/value strings", .path.display())]
    InvalidFormat {
        /// The cookie file path.
        path: PathBuf,
    },
}

/// A mutable cookie jar bound to its persistence path.
pub struct CookieStore {
    path: PathBuf,
    jar: Mutex<BTreeMap<String, String>>,
    file_lock: tokio::sync::Mutex<()>,
}

// Cookie values are credentials; Debug shows names only.
impl fmt::Debug for CookieStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<String> = self
            .jar
            .lock()
            .map(|jar| jar.keys().cloned().collect())
            .unwrap_or_default();
        f.debug_struct("CookieStore")
            .field("path", &self.path)
            .field("cookies", &names)
            .finish()
    }
}

impl CookieStore {
    /// Loads the initial jar from a JSON cookie file.
    ///
    /// # Errors
    ///
    /// Returns [`CookieStoreError::Io`] when the file cannot be read, or
    /// [`CookieStoreError::InvalidFormat`] when it is not a flat JSON
    /// object of strings.
    #[instrument(level = "debug")]
    pub fn load(path: &Path) -> Result<Self, CookieStoreError> {
        let raw = std::fs::read_to_string(path).map_err(|source| CookieStoreError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let value: serde_json::Value =
            serde_json::from_str(&raw).map_err(|_| CookieStoreError::InvalidFormat {
                path: path.to_path_buf(),
            })?;

        let serde_json::Value::Object(object) = value else {
            return Err(CookieStoreError::InvalidFormat {
                path: path.to_path_buf(),
            });
        };

        let mut jar = BTreeMap::new();
        for (name, value) in object {
            match value {
                serde_json::Value::String(value) => {
                    jar.insert(name, value);
                }
                _ => {
                    return Err(CookieStoreError::InvalidFormat {
                        path: path.to_path_buf(),
                    });
                }
            }
        }

        debug!(count = jar.len(), "loaded cookie jar");
        Ok(Self {
            path: path.to_path_buf(),
            jar: Mutex::new(jar),
            file_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// Creates a store from an in-memory map, bound to `path` for saves.
    #[must_use]
    pub fn from_map(path: &Path, cookies: BTreeMap<String, String>) -> Self {
        Self {
            path: path.to_path_buf(),
            jar: Mutex::new(cookies),
            file_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Renders the current jar as a `Cookie` header value, or `None` when
    /// the jar is empty.
    #[must_use]
    pub fn cookie_header(&self) -> Option<String> {
        let jar = self.jar.lock().ok()?;
        if jar.is_empty() {
            return None;
        }
        Some(
            jar.iter()
                .map(|(name, value)| format!("{name}={value}"))
                .collect::<Vec<_>>()
                .join("; "),
        )
    }

    /// Merges one `Set-Cookie` header value into the jar.
    ///
    /// Only the leading `name=value` pair is used; attributes after the
    /// first `;` are ignored (the domain is implicit for this provider).
    /// Returns the merged name when the header was well-formed.
    pub fn merge_set_cookie(&self, header_value: &str) -> Option<String> {
        let first_pair = header_value.split(';').next()?.trim();
        let (name, value) = first_pair.split_once('=')?;
        let name = name.trim();
        if name.is_empty() {
            return None;
        }

        if let Ok(mut jar) = self.jar.lock() {
            jar.insert(name.to_string(), value.to_string());
        }
        Some(name.to_string())
    }

    /// Returns the current value of one cookie.
    #[must_use]
    pub fn value(&self, name: &str) -> Option<String> {
        self.jar.lock().ok()?.get(name).cloned()
    }

    /// Returns a snapshot of the jar contents.
    #[must_use]
    pub fn snapshot(&self) -> BTreeMap<String, String> {
        self.jar.lock().map(|jar| jar.clone()).unwrap_or_default()
    }

    /// Number of cookies currently in the jar.
    #[must_use]
    pub fn len(&self) -> usize {
        self.jar.lock().map(|jar| jar.len()).unwrap_or(0)
    }

    /// Whether the jar is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Persists the jar to its cookie file via temp-file + atomic rename.
    ///
    /// # Errors
    ///
    /// Returns [`CookieStoreError::Io`] when the write or rename fails.
    #[instrument(level = "debug", skip(self), fields(path = %self.path.display()))]
    pub async fn save(&self) -> Result<(), CookieStoreError> {
        let _guard = self.file_lock.lock().await;

        let snapshot = self.snapshot();
        let body = serde_json::to_vec_pretty(&snapshot).unwrap_or_else(|_| b"{}".to_vec());

        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| CookieStoreError::Io {
                    path: self.path.clone(),
                    source,
                })?;
        }

        let tmp_path = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp_path, &body)
            .await
            .map_err(|source| CookieStoreError::Io {
                path: tmp_path.clone(),
                source,
            })?;
        tokio::fs::rename(&tmp_path, &self.path)
            .await
            .map_err(|source| CookieStoreError::Io {
                path: self.path.clone(),
                source,
            })?;

        debug!(count = snapshot.len(), "save: cookie jar persisted");
        Ok(())
    }

    /// Warns when the jar lacks any cookie that looks like a session
    /// credential. Purely advisory.
    pub fn warn_if_unauthenticated(&self) {
        if self.is_empty() {
            warn!("cookie jar is empty; authenticated endpoints will fail");
        }
    }
}
