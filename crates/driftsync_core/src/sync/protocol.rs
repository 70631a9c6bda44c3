//! Protocol version gate and local-storage migrations.
//!
//! The gate runs once per process: it compares the locally stored protocol
//! version with the server's and, when the server is ahead, runs the
//! registered stepwise `v -> v+1` migrations over local storage before any
//! sync traffic is allowed. There is no downgrade path. Validation fails
//! closed: an unparseable or out-of-range version blocks sync entirely.

use std::sync::{Arc, OnceLock};

use tokio::sync::OnceCell;

use super::transport::ReplicateClient;
use crate::error::{ReplicateError, Result};
use crate::storage::{LocalStore, StorageResult};

/// Protocol version this client speaks.
pub const PROTOCOL_VERSION: u32 = 1;

/// Valid protocol versions are integers in `[1, 99]`.
pub const MAX_PROTOCOL_VERSION: u32 = 99;

const PROTOCOL_VERSION_KEY: &str = "replicate:protocol:version";

/// A stepwise local-storage migration from version `v` to `v + 1`.
pub type Migration = fn(&dyn LocalStore) -> StorageResult<()>;

/// One-shot protocol initialization gate.
///
/// All mutation handlers and the sync engine await [`ensure_ready`]
/// before their first network call; the underlying check runs exactly
/// once per gate and its outcome is replayed to every later caller.
///
/// [`ensure_ready`]: ProtocolGate::ensure_ready
pub struct ProtocolGate {
    migrations: Vec<(u32, Migration)>,
    state: OnceCell<std::result::Result<u32, String>>,
}

impl ProtocolGate {
    /// Create a gate with no registered migrations.
    pub fn new() -> Self {
        Self::with_migrations(Vec::new())
    }

    /// Create a gate with stepwise migrations, each keyed by its source
    /// version.
    pub fn with_migrations(migrations: Vec<(u32, Migration)>) -> Self {
        Self {
            migrations,
            state: OnceCell::new(),
        }
    }

    /// The process-wide gate shared by all collections by default.
    pub fn global() -> Arc<ProtocolGate> {
        static GLOBAL: OnceLock<Arc<ProtocolGate>> = OnceLock::new();
        GLOBAL.get_or_init(|| Arc::new(ProtocolGate::new())).clone()
    }

    /// Run the protocol check once and replay its outcome afterwards.
    pub async fn ensure_ready(
        &self,
        storage: &dyn LocalStore,
        client: &dyn ReplicateClient,
    ) -> Result<u32> {
        let outcome = self
            .state
            .get_or_init(|| async {
                self.run(storage, client)
                    .await
                    .map_err(|e| e.to_string())
            })
            .await;

        match outcome {
            Ok(version) => Ok(*version),
            Err(message) => Err(ReplicateError::Protocol(message.clone())),
        }
    }

    async fn run(&self, storage: &dyn LocalStore, client: &dyn ReplicateClient) -> Result<u32> {
        let local = Self::load_local_version(storage)?;
        let remote = client.protocol_version().await.map_err(|e| {
            ReplicateError::Protocol(format!("Failed to query server protocol version: {}", e))
        })?;
        Self::validate(remote, "server")?;

        if remote <= local {
            log::debug!(
                "Protocol version up to date (local {}, server {})",
                local,
                remote
            );
            return Ok(local);
        }

        log::info!("Migrating protocol version {} -> {}", local, remote);
        for from in local..remote {
            let Some((_, migration)) = self.migrations.iter().find(|(v, _)| *v == from) else {
                return Err(ReplicateError::Protocol(format!(
                    "No migration registered for protocol version {} -> {}",
                    from,
                    from + 1
                )));
            };
            migration(storage).map_err(|e| {
                ReplicateError::Protocol(format!(
                    "Protocol migration {} -> {} failed: {}",
                    from,
                    from + 1,
                    e
                ))
            })?;
        }

        // Persist only after every step succeeded
        storage.put_meta(PROTOCOL_VERSION_KEY, &remote.to_string())?;
        Ok(remote)
    }

    fn load_local_version(storage: &dyn LocalStore) -> Result<u32> {
        let Some(raw) = storage.get_meta(PROTOCOL_VERSION_KEY)? else {
            return Ok(PROTOCOL_VERSION);
        };

        let version: u32 = raw.parse().map_err(|_| {
            ReplicateError::Protocol(format!("Stored protocol version '{}' is not an integer", raw))
        })?;
        Self::validate(version, "stored")?;
        Ok(version)
    }

    fn validate(version: u32, source: &str) -> Result<()> {
        if (1..=MAX_PROTOCOL_VERSION).contains(&version) {
            Ok(())
        } else {
            Err(ReplicateError::Protocol(format!(
                "Invalid {} protocol version {} (expected 1..={})",
                source, version, MAX_PROTOCOL_VERSION
            )))
        }
    }
}

impl Default for ProtocolGate {
    fn default() -> Self {
        Self::new()
    }
}
