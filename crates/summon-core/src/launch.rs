use futures::executor::LocalSpawner;
use futures::future::LocalBoxFuture;
use futures::task::LocalSpawnExt;

use crate::error::RuntimeError;

/// Host task substrate for launched effects and lifecycle-bound work.
///
/// The runtime wraps every task in a [`CancellationToken`](crate::CancellationToken)
/// before handing it over, so a launcher only has to drive futures to
/// completion (or drop them).
pub trait Launcher {
    fn launch(&self, task: LocalBoxFuture<'static, ()>) -> Result<(), RuntimeError>;
}

impl Launcher for LocalSpawner {
    fn launch(&self, task: LocalBoxFuture<'static, ()>) -> Result<(), RuntimeError> {
        self.spawn_local(task)
            .map_err(|e| RuntimeError::Launch(e.to_string()))
    }
}

/// Launcher for hosts without an async substrate; every launch fails.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoLauncher;

impl Launcher for NoLauncher {
    fn launch(&self, _task: LocalBoxFuture<'static, ()>) -> Result<(), RuntimeError> {
        Err(RuntimeError::Launch("no launcher configured".to_string()))
    }
}
