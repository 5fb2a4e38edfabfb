//! Host-keyed connection pool shared by both SSH backends

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, instrument};

use crate::config::BackendKind;
use crate::error::ExecError;
use crate::resolve::{needs_resolution, resolve_remote, with_binary};
use crate::result::{CommandResult, Encoding};
use crate::traits::{Connection, Connector, RemotePool};

/// Per-host slot; its async lock serialises connection creation for that host
type Slot = Arc<tokio::sync::Mutex<Option<Arc<dyn Connection>>>>;

/// Pool of connections, at most one per host
///
/// The map lock is only held for lookups and inserts of slots. The
/// check/connect/insert sequence runs under the host's slot lock, so
/// concurrent first callers for one host share a single handshake while
/// different hosts connect in parallel.
pub struct ConnectionPool {
    connector: Arc<dyn Connector>,
    slots: Mutex<HashMap<String, Slot>>,
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("backend", &self.connector.backend())
            .field("hosts", &self.lock_slots().len())
            .finish_non_exhaustive()
    }
}

impl ConnectionPool {
    /// Create an empty pool that opens connections through `connector`
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self {
            connector,
            slots: Mutex::new(HashMap::new()),
        }
    }

    fn lock_slots(&self) -> std::sync::MutexGuard<'_, HashMap<String, Slot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn slot(&self, host: &str) -> Slot {
        self.lock_slots()
            .entry(host.to_string())
            .or_default()
            .clone()
    }

    /// Number of hosts with a pooled connection
    pub async fn len(&self) -> usize {
        let slots: Vec<Slot> = self.lock_slots().values().cloned().collect();
        let mut count = 0;
        for slot in slots {
            if slot.lock().await.is_some() {
                count += 1;
            }
        }
        count
    }

    /// Whether no connection is pooled
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Drop `conn` from the pool (if it is still the pooled one) and close it
    async fn evict(&self, host: &str, conn: &Arc<dyn Connection>) {
        let slot = self.lock_slots().get(host).cloned();
        if let Some(slot) = slot {
            let mut guard = slot.lock().await;
            if guard.as_ref().is_some_and(|pooled| same_connection(pooled, conn)) {
                guard.take();
            }
        }
        debug!(host, "evicting connection after transport error");
        conn.close().await;
    }

    /// `command -v` on the pooled connection, evicting it on transport errors
    async fn lookup(
        &self,
        conn: &Arc<dyn Connection>,
        command: &str,
        host: &str,
        timeout: Option<Duration>,
    ) -> Result<String, ExecError> {
        let target = self.connector.display_target(host);
        match resolve_remote(conn.as_ref(), command, &target, timeout).await {
            Ok(binary) => Ok(binary),
            Err(e) => {
                if e.is_connection_error() {
                    self.evict(host, conn).await;
                }
                Err(e)
            }
        }
    }
}

fn same_connection(a: &Arc<dyn Connection>, b: &Arc<dyn Connection>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

#[async_trait]
impl RemotePool for ConnectionPool {
    #[instrument(skip(self), fields(backend = %self.connector.backend()))]
    async fn get_or_create(&self, host: &str) -> Result<Arc<dyn Connection>, ExecError> {
        let slot = self.slot(host);
        let mut guard = slot.lock().await;

        if let Some(conn) = guard.as_ref() {
            if conn.is_connected() {
                debug!(host, reused = true, "reusing pooled connection");
                return Ok(Arc::clone(conn));
            }
            debug!(host, "removing stale connection");
            if let Some(stale) = guard.take() {
                stale.close().await;
            }
        }

        debug!(host, "opening new connection");
        let conn = self.connector.connect(host).await?;
        *guard = Some(Arc::clone(&conn));
        Ok(conn)
    }

    #[instrument(skip(self, argv, encoding), fields(command = %argv.join(" ")))]
    async fn execute_remote(
        &self,
        argv: &[String],
        host: &str,
        timeout: Option<Duration>,
        encoding: Encoding,
    ) -> Result<CommandResult, ExecError> {
        let Some(program) = argv.first() else {
            return Err(ExecError::ConfigError("empty command".to_string()));
        };

        let conn = self.get_or_create(host).await?;

        let resolved;
        let argv = if needs_resolution(program) {
            resolved = with_binary(argv, self.lookup(&conn, program, host, timeout).await?);
            &resolved[..]
        } else {
            argv
        };

        match conn.run(argv, timeout, encoding).await {
            Ok(result) => Ok(result),
            Err(e) => {
                if e.is_connection_error() {
                    self.evict(host, &conn).await;
                }
                Err(e)
            }
        }
    }

    async fn which(
        &self,
        command: &str,
        host: &str,
        timeout: Option<Duration>,
    ) -> Result<String, ExecError> {
        let conn = self.get_or_create(host).await?;
        self.lookup(&conn, command, host, timeout).await
    }

    #[instrument(skip(self), fields(backend = %self.connector.backend()))]
    async fn close_all(&self) {
        let slots: Vec<(String, Slot)> = self.lock_slots().drain().collect();

        let mut closed = 0usize;
        for (host, slot) in slots {
            let conn = slot.lock().await.take();
            if let Some(conn) = conn {
                debug!(host = %host, "closing connection");
                conn.close().await;
                closed += 1;
            }
        }

        self.connector.shutdown().await;
        info!(closed_connections = closed, "connection pool cleared");
    }

    fn backend(&self) -> BackendKind {
        self.connector.backend()
    }
}
