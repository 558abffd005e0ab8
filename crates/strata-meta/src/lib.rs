//! # strata-meta: meta-server table state
//!
//! The meta server owns the table registry: which tables exist, their
//! partition counts, lifecycle status and environment maps. This crate
//! implements the piece the replica core depends on - [`ServerState`] -
//! including the restore path that bootstraps a new table from backup
//! media under a fresh app id.
//!
//! Readers take the shared lock and snapshot what they need; writers
//! take the exclusive lock. The restore path holds the read lock only
//! long enough to snapshot the old table's metadata before generating
//! the new one.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use strata_types::{env_keys, AppId, AppInfo, AppStatus};
use tracing::info;


// ============================================================================
// Errors
// ============================================================================

/// Errors surfaced by meta-side table management.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MetaError {
    #[error("app not found")]
    AppNotFound,

    #[error("app already exists")]
    AppAlreadyExists,

    #[error("invalid parameters: {reason}")]
    InvalidParameters { reason: String },
}

pub type MetaResult<T> = Result<T, MetaError>;

// ============================================================================
// Restore request
// ============================================================================

/// `START_RESTORE` request from a client: bootstrap `new_app_name` from
/// the backup of `app_name` identified by `time_stamp`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreRequest {
    pub app_id: AppId,
    pub app_name: String,
    pub new_app_name: String,
    /// Backup id: the timestamp the backup was taken at.
    pub time_stamp: u64,
    pub cluster_name: String,
    pub backup_provider_name: String,
    /// User-specified path within the backup media, if any.
    pub restore_path: Option<String>,
}

// ============================================================================
// App state
// ============================================================================

/// One table's meta-side state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppState {
    pub app_id: AppId,
    pub app_name: String,
    pub app_type: String,
    pub partition_count: u32,
    pub status: AppStatus,
    pub envs: BTreeMap<String, String>,
}

impl AppState {
    /// The replica-facing view of this table.
    pub fn to_app_info(&self) -> AppInfo {
        AppInfo {
            app_id: self.app_id,
            app_name: self.app_name.clone(),
            app_type: self.app_type.clone(),
            partition_count: self.partition_count,
            envs: self.envs.clone(),
            duplicating: false,
        }
    }
}

// ============================================================================
// Server state
// ============================================================================

/// The table registry plus the monotone app-id allocator.
#[derive(Debug)]
pub struct ServerState {
    apps: RwLock<HashMap<String, Arc<AppState>>>,
    next_app_id: AtomicU32,
}

impl Default for ServerState {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerState {
    pub fn new() -> Self {
        Self {
            apps: RwLock::new(HashMap::new()),
            next_app_id: AtomicU32::new(1),
        }
    }

    /// Creates a table and makes it available.
    pub fn create_app(&self, app_name: &str, partition_count: u32) -> MetaResult<Arc<AppState>> {
        let mut apps = self.apps.write().expect("server state poisoned");
        if apps.contains_key(app_name) {
            return Err(MetaError::AppAlreadyExists);
        }
        let app = Arc::new(AppState {
            app_id: self.allocate_app_id(),
            app_name: app_name.to_string(),
            app_type: "strata".to_string(),
            partition_count,
            status: AppStatus::Available,
            envs: BTreeMap::new(),
        });
        apps.insert(app_name.to_string(), Arc::clone(&app));
        info!(app = app_name, app_id = %app.app_id, "app created");
        Ok(app)
    }

    pub fn get_app(&self, app_name: &str) -> Option<Arc<AppState>> {
        self.apps
            .read()
            .expect("server state poisoned")
            .get(app_name)
            .cloned()
    }

    /// The id the next created table will receive.
    pub fn next_app_id(&self) -> AppId {
        AppId::new(self.next_app_id.load(Ordering::SeqCst))
    }

    fn allocate_app_id(&self) -> AppId {
        AppId::new(self.next_app_id.fetch_add(1, Ordering::SeqCst))
    }

    /// Snapshots a table's metadata as a blob, under the read lock.
    ///
    /// This is the payload carried by the restore RPC.
    pub fn snapshot_app_info(&self, app_name: &str) -> MetaResult<Vec<u8>> {
        let apps = self.apps.read().expect("server state poisoned");
        let app = apps.get(app_name).ok_or(MetaError::AppNotFound)?;
        serde_json::to_vec(&app.to_app_info()).map_err(|e| MetaError::InvalidParameters {
            reason: e.to_string(),
        })
    }

    /// Creates the restore target table from a backed-up table's
    /// metadata snapshot.
    ///
    /// The new table takes the allocator's next id, the requested name,
    /// starts in [`AppStatus::Creating`], and carries the backup
    /// coordinates in its env map; replicas created for it will
    /// bootstrap from backup media.
    pub fn restore_app_info(
        &self,
        req: &RestoreRequest,
        app_info_blob: &[u8],
    ) -> MetaResult<Arc<AppState>> {
        let snapshot: AppInfo =
            serde_json::from_slice(app_info_blob).map_err(|e| MetaError::InvalidParameters {
                reason: format!("corrupt app info blob: {e}"),
            })?;

        let mut envs = BTreeMap::new();
        envs.insert(
            env_keys::BLOCK_SERVICE_PROVIDER.to_string(),
            req.backup_provider_name.clone(),
        );
        envs.insert(env_keys::CLUSTER_NAME.to_string(), req.cluster_name.clone());
        envs.insert(env_keys::APP_NAME.to_string(), req.app_name.clone());
        envs.insert(env_keys::APP_ID.to_string(), req.app_id.as_u32().to_string());
        envs.insert(env_keys::BACKUP_ID.to_string(), req.time_stamp.to_string());
        if let Some(path) = &req.restore_path {
            envs.insert(env_keys::RESTORE_PATH.to_string(), path.clone());
        }

        let mut apps = self.apps.write().expect("server state poisoned");
        if apps.contains_key(&req.new_app_name) {
            return Err(MetaError::AppAlreadyExists);
        }

        let app = Arc::new(AppState {
            app_id: self.allocate_app_id(),
            app_name: req.new_app_name.clone(),
            app_type: snapshot.app_type,
            partition_count: snapshot.partition_count,
            status: AppStatus::Creating,
            envs,
        });
        apps.insert(req.new_app_name.clone(), Arc::clone(&app));

        info!(
            from = %req.app_name,
            to = %req.new_app_name,
            backup_id = req.time_stamp,
            new_app_id = %app.app_id,
            "restore app created"
        );
        Ok(app)
    }
}
