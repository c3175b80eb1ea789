//! Three-lifetime identity: device, tab and session.
//!
//! The three identifiers have deliberately different lifetimes:
//!
//! - `device_id` survives process restarts (persistent store),
//! - `tab_id` survives reloads within one logical connection,
//! - `session_id` is regenerated on every process start.
//!
//! The storage technology behind each lifetime is incidental; the
//! [`IdentityStore`] trait is the seam, and the lifetime semantics are the
//! contract.

use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Persistence seam for device- and tab-scoped identifiers.
///
/// Implementations decide where each lifetime lives (browser profile,
/// keychain, plain files, memory); the session id is never stored.
pub trait IdentityStore: Send + Sync {
    /// Load the restart-persistent device id, if one was stored.
    fn load_device_id(&self) -> Option<String>;
    /// Persist the device id.
    fn store_device_id(&self, id: &str);
    /// Load the connection-scoped tab id, if one was stored.
    fn load_tab_id(&self) -> Option<String>;
    /// Persist the tab id for the lifetime of this connection.
    fn store_tab_id(&self, id: &str);
    /// Wipe both persisted identifiers.
    fn clear(&self);
}

/// Persisted device record.
#[derive(Debug, Serialize, Deserialize)]
struct DeviceRecord {
    device_id: String,
}

/// Filesystem-backed identity store.
///
/// The device id lives in a JSON file under `data_dir` (restart lifetime);
/// the tab id is held in memory on this store instance (connection
/// lifetime). IO failures degrade to a fresh identity with a logged
/// warning rather than an error.
#[derive(Debug)]
pub struct FsIdentityStore {
    path: PathBuf,
    tab_id: RwLock<Option<String>>,
}

impl FsIdentityStore {
    /// Create a store rooted at `data_dir`, creating the directory if needed.
    ///
    /// # Errors
    ///
    /// Returns the underlying IO error if the directory cannot be created.
    pub fn new(data_dir: impl Into<PathBuf>) -> std::io::Result<Self> {
        let data_dir = data_dir.into();
        std::fs::create_dir_all(&data_dir)?;
        Ok(Self {
            path: data_dir.join("device.json"),
            tab_id: RwLock::new(None),
        })
    }
}

impl IdentityStore for FsIdentityStore {
    fn load_device_id(&self) -> Option<String> {
        let contents = std::fs::read_to_string(&self.path).ok()?;
        match serde_json::from_str::<DeviceRecord>(&contents) {
            Ok(record) => Some(record.device_id),
            Err(e) => {
                tracing::warn!("Corrupt device record at {}: {e}", self.path.display());
                None
            }
        }
    }

    fn store_device_id(&self, id: &str) {
        let record = DeviceRecord {
            device_id: id.to_string(),
        };
        match serde_json::to_string_pretty(&record) {
            Ok(json) => {
                if let Err(e) = std::fs::write(&self.path, json) {
                    tracing::warn!(
                        "Failed to persist device id to {}: {e}",
                        self.path.display()
                    );
                }
            }
            Err(e) => tracing::warn!("Failed to serialize device record: {e}"),
        }
    }

    fn load_tab_id(&self) -> Option<String> {
        self.tab_id
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    fn store_tab_id(&self, id: &str) {
        *self
            .tab_id
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(id.to_string());
    }

    fn clear(&self) {
        if self.path.exists() {
            if let Err(e) = std::fs::remove_file(&self.path) {
                tracing::warn!("Failed to remove device record: {e}");
            }
        }
        *self
            .tab_id
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = None;
    }
}

/// In-memory identity store for tests and embedded hosts.
#[derive(Debug, Default)]
pub struct MemoryIdentityStore {
    device_id: RwLock<Option<String>>,
    tab_id: RwLock<Option<String>>,
}

impl MemoryIdentityStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl IdentityStore for MemoryIdentityStore {
    fn load_device_id(&self) -> Option<String> {
        self.device_id
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    fn store_device_id(&self, id: &str) {
        *self
            .device_id
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(id.to_string());
    }

    fn load_tab_id(&self) -> Option<String> {
        self.tab_id
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    fn store_tab_id(&self, id: &str) {
        *self
            .tab_id
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(id.to_string());
    }

    fn clear(&self) {
        *self
            .device_id
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = None;
        *self
            .tab_id
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = None;
    }
}

/// A point-in-time view of another context's identifiers, as carried in
/// event metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentitySnapshot {
    /// Device identifier.
    pub device_id: String,
    /// Tab identifier.
    pub tab_id: String,
    /// Session identifier.
    pub session_id: String,
}

/// The three core identifiers plus mutable user/canvas context.
struct IdentityCore {
    device_id: String,
    tab_id: String,
    session_id: String,
}

/// The runtime's identity.
///
/// Constructed exactly once per process and passed by reference (`Arc`) to
/// everything that needs it; there is no hidden global instance.
pub struct Identity {
    store: Arc<dyn IdentityStore>,
    core: RwLock<IdentityCore>,
    user_id: RwLock<Option<String>>,
    canvas_id: RwLock<Option<String>>,
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("device_id", &self.device_id())
            .field("tab_id", &self.tab_id())
            .field("session_id", &self.session_id())
            .finish_non_exhaustive()
    }
}

fn new_id(prefix: &str) -> String {
    format!("{prefix}-{}", Uuid::new_v4())
}

impl Identity {
    /// Load or create the identity from `store`.
    ///
    /// Idempotent with respect to the store: the device and tab ids are
    /// loaded when present and created-and-stored otherwise; the session id
    /// is always freshly generated.
    #[must_use]
    pub fn initialize(store: Arc<dyn IdentityStore>) -> Self {
        let core = Self::load_core(store.as_ref());
        Self {
            store,
            core: RwLock::new(core),
            user_id: RwLock::new(None),
            canvas_id: RwLock::new(None),
        }
    }

    fn load_core(store: &dyn IdentityStore) -> IdentityCore {
        let device_id = store.load_device_id().unwrap_or_else(|| {
            let id = new_id("device");
            store.store_device_id(&id);
            id
        });
        let tab_id = store.load_tab_id().unwrap_or_else(|| {
            let id = new_id("tab");
            store.store_tab_id(&id);
            id
        });
        IdentityCore {
            device_id,
            tab_id,
            session_id: new_id("session"),
        }
    }

    /// The restart-persistent device id.
    #[must_use]
    pub fn device_id(&self) -> String {
        self.core
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .device_id
            .clone()
    }

    /// The connection-scoped tab id.
    #[must_use]
    pub fn tab_id(&self) -> String {
        self.core
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .tab_id
            .clone()
    }

    /// The per-process session id.
    #[must_use]
    pub fn session_id(&self) -> String {
        self.core
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .session_id
            .clone()
    }

    /// The current user context, if one has been set by the host.
    #[must_use]
    pub fn user_id(&self) -> Option<String> {
        self.user_id
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    /// The current canvas context, if one has been set by the host.
    #[must_use]
    pub fn canvas_id(&self) -> Option<String> {
        self.canvas_id
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    /// Set the user context without touching device/tab/session.
    pub fn set_user_id(&self, user_id: impl Into<String>) {
        *self
            .user_id
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(user_id.into());
    }

    /// Set the canvas context without touching device/tab/session.
    pub fn set_canvas_id(&self, canvas_id: impl Into<String>) {
        *self
            .canvas_id
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(canvas_id.into());
    }

    /// Snapshot the core identifiers for embedding in event metadata.
    #[must_use]
    pub fn snapshot(&self) -> IdentitySnapshot {
        let core = self
            .core
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        IdentitySnapshot {
            device_id: core.device_id.clone(),
            tab_id: core.tab_id.clone(),
            session_id: core.session_id.clone(),
        }
    }

    /// Whether `other` was taken in this tab.
    #[must_use]
    pub fn is_current_tab(&self, other: &IdentitySnapshot) -> bool {
        other.tab_id == self.tab_id()
    }

    /// Whether `other` was taken on this device.
    #[must_use]
    pub fn is_current_device(&self, other: &IdentitySnapshot) -> bool {
        other.device_id == self.device_id()
    }

    /// Whether `other` was taken in this session.
    #[must_use]
    pub fn is_current_session(&self, other: &IdentitySnapshot) -> bool {
        other.session_id == self.session_id()
    }

    /// Whether `other` is a different tab on the same device.
    ///
    /// This is the primitive behind the permission engine's same-device
    /// fast path.
    #[must_use]
    pub fn is_same_device_different_tab(&self, other: &IdentitySnapshot) -> bool {
        self.is_current_device(other) && !self.is_current_tab(other)
    }

    /// Wipe persisted identifiers and re-initialize in place.
    ///
    /// Destructive: this creates a *new* device identity. Intended for
    /// explicit logout/reset flows.
    pub fn clear_all(&self) {
        self.store.clear();
        let fresh = Self::load_core(self.store.as_ref());
        *self
            .core
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = fresh;
        *self
            .user_id
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = None;
        *self
            .canvas_id
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = None;
    }
}
