//! Single entry point routing commands to the local executor or the pool

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::FutureExt;
use tracing::{debug, info, instrument};

use crate::backend::build_pool;
use crate::command::CommandSpec;
use crate::config::{BackendKind, ExecConfig};
use crate::error::ExecError;
use crate::local::LocalExecutor;
use crate::resolve::resolve_local;
use crate::result::{CommandResult, Encoding};
use crate::traits::RemotePool;

/// Per-call execution options
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecOptions {
    /// `None` disables the timeout for this call
    pub timeout: Option<Duration>,
    pub encoding: Encoding,
}

/// Routes each command locally (no host) or through the remote pool
pub struct Dispatcher {
    local: LocalExecutor,
    remote: Arc<dyn RemotePool>,
    default_timeout: Option<Duration>,
    shut_down: AtomicBool,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("backend", &self.remote.backend())
            .field("default_timeout", &self.default_timeout)
            .field("shut_down", &self.shut_down.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    /// Dispatcher over an existing pool
    pub fn new(remote: Arc<dyn RemotePool>, config: &ExecConfig) -> Self {
        Self {
            local: LocalExecutor::new(),
            remote,
            default_timeout: config.command_timeout(),
            shut_down: AtomicBool::new(false),
        }
    }

    /// Dispatcher with the pool for the configured backend
    ///
    /// # Errors
    /// Returns the backend's setup error
    pub fn from_config(config: &ExecConfig) -> Result<Self, ExecError> {
        Ok(Self::new(build_pool(config)?, config))
    }

    /// Backend used for remote hosts
    #[must_use]
    pub fn backend(&self) -> BackendKind {
        self.remote.backend()
    }

    /// Options used by [`Dispatcher::execute`]
    #[must_use]
    pub fn default_options(&self) -> ExecOptions {
        ExecOptions {
            timeout: self.default_timeout,
            encoding: Encoding::Utf8,
        }
    }

    /// Run `argv` locally or on `host` with the default timeout
    ///
    /// # Errors
    /// Resolution, connection and timeout errors; a non-zero exit status is
    /// returned as a normal result
    pub async fn execute(
        &self,
        argv: &[String],
        host: Option<&str>,
    ) -> Result<CommandResult, ExecError> {
        self.execute_with_options(argv, host, self.default_options())
            .await
    }

    /// Run `argv` locally or on `host`
    ///
    /// # Errors
    /// See [`Dispatcher::execute`]
    #[instrument(skip(self, options), fields(command = %argv.join(" ")))]
    pub async fn execute_with_options(
        &self,
        argv: &[String],
        host: Option<&str>,
        options: ExecOptions,
    ) -> Result<CommandResult, ExecError> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(ExecError::ConfigError("dispatcher has been shut down".to_string()));
        }

        match host {
            None => {
                debug!(target_host = "localhost", "dispatching locally");
                self.local.run(argv, options.timeout, options.encoding).await
            }
            Some(host) => {
                debug!(target_host = host, backend = %self.remote.backend(), "dispatching remotely");
                self.remote
                    .execute_remote(argv, host, options.timeout, options.encoding)
                    .await
            }
        }
    }

    /// Run `argv`, retrying once with `fallback` if it fails
    ///
    /// The fallback runs when the primary exits non-zero or its binary cannot
    /// be found. The primary's output is discarded in that case.
    ///
    /// # Errors
    /// Errors from the command that produced the returned result; without a
    /// fallback, errors from the primary
    pub async fn execute_with_fallback(
        &self,
        argv: &[String],
        fallback: Option<&[String]>,
        host: Option<&str>,
    ) -> Result<CommandResult, ExecError> {
        self.execute_with_fallback_options(argv, fallback, host, self.default_options())
            .await
    }

    /// [`Dispatcher::execute_with_fallback`] with explicit options
    ///
    /// # Errors
    /// See [`Dispatcher::execute_with_fallback`]
    pub async fn execute_with_fallback_options(
        &self,
        argv: &[String],
        fallback: Option<&[String]>,
        host: Option<&str>,
        options: ExecOptions,
    ) -> Result<CommandResult, ExecError> {
        let Some(fallback) = fallback else {
            return self.execute_with_options(argv, host, options).await;
        };

        match self.execute_with_options(argv, host, options).await {
            Ok(result) if result.success() => Ok(result),
            Ok(result) => {
                debug!(
                    command = %argv.join(" "),
                    status = result.status,
                    fallback = %fallback.join(" "),
                    "primary command failed, running fallback"
                );
                self.execute_with_options(fallback, host, options).await
            }
            Err(e) if e.is_not_found() => {
                debug!(
                    command = %argv.join(" "),
                    fallback = %fallback.join(" "),
                    "primary command unavailable, running fallback"
                );
                self.execute_with_options(fallback, host, options).await
            }
            Err(e) => Err(e),
        }
    }

    /// Run a descriptor, honouring its fallback
    ///
    /// # Errors
    /// See [`Dispatcher::execute_with_fallback`]
    pub async fn run_spec(
        &self,
        spec: &CommandSpec,
        host: Option<&str>,
    ) -> Result<CommandResult, ExecError> {
        self.execute_with_fallback(spec.argv(), spec.fallback(), host)
            .await
    }

    /// Absolute path of `command` locally or on `host`
    ///
    /// # Errors
    /// `ExecError::NotFound` when missing, connection errors for remote hosts
    pub async fn which(&self, command: &str, host: Option<&str>) -> Result<String, ExecError> {
        match host {
            None => resolve_local(command).map(|path| path.display().to_string()),
            Some(host) => self.remote.which(command, host, self.default_timeout).await,
        }
    }

    /// Close every pooled connection; later calls are no-ops
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(backend = %self.remote.backend(), "shutting down dispatcher");
        self.remote.close_all().await;
    }

    /// Run `f` with this dispatcher, then shut it down whatever `f` returned
    ///
    /// Shutdown also runs when `f` panics; the panic is resumed afterwards.
    /// Dropping the returned future before it completes skips shutdown, so
    /// interruption (ctrl-c) belongs inside `f`.
    pub async fn scope<F, Fut, T>(self, f: F) -> T
    where
        F: FnOnce(Arc<Dispatcher>) -> Fut,
        Fut: Future<Output = T>,
    {
        let dispatcher = Arc::new(self);
        let output = AssertUnwindSafe(f(Arc::clone(&dispatcher)))
            .catch_unwind()
            .await;
        dispatcher.shutdown().await;
        match output {
            Ok(output) => output,
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }
}
