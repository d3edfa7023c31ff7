use std::cell::RefCell;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::rc::Rc;

use futures::FutureExt;

use crate::cancel::CancellationToken;
use crate::effects::{Dispose, EffectFailure, EffectKind, EffectOutcome, EffectPhase, EffectResult};
use crate::error::{Cancelled, RuntimeError, panic_message};
use crate::runtime::{Composer, composer_for};
use crate::remember;

struct DisposableRecord<K> {
    keys: Option<K>,
    /// The group's disposable is in place; a failed first pass keeps it.
    registered: bool,
    cleanup: Option<Dispose>,
    phase: EffectPhase,
}

/// Setup/cleanup pair keyed by `keys`.
///
/// `setup` runs in the commit phase of the first composition and again after
/// the previous cleanup whenever `keys` change. The cleanup it returns runs
/// once more when the group leaves the composition.
pub fn disposable_effect<K: PartialEq + Clone + 'static>(
    keys: K,
    setup: impl FnOnce() -> Dispose + 'static,
) {
    let composer = composer_for("disposable_effect");
    let record = remember(|| {
        Rc::new(RefCell::new(DisposableRecord::<K> {
            keys: None,
            registered: false,
            cleanup: None,
            phase: EffectPhase::Unmounted,
        }))
    });

    let (fresh, unchanged) = {
        let mut r = record.borrow_mut();
        let fresh = !std::mem::replace(&mut r.registered, true);
        (fresh, r.keys.as_ref() == Some(&keys))
    };

    if fresh {
        let record = record.clone();
        register(&composer, move || {
            let cleanup = {
                let mut r = record.borrow_mut();
                if r.phase == EffectPhase::Disposed {
                    return;
                }
                r.phase = EffectPhase::Disposed;
                r.cleanup.take()
            };
            if let Some(cleanup) = cleanup {
                cleanup.run();
            }
        });
    }
    if unchanged {
        return;
    }

    queue(&composer, EffectKind::Disposable, move || {
        let previous = {
            let mut r = record.borrow_mut();
            if r.phase == EffectPhase::Disposed {
                return;
            }
            // Stays failed if setup panics; the next key change retries.
            r.phase = EffectPhase::Failed;
            r.keys = Some(keys);
            r.cleanup.take()
        };
        if let Some(previous) = previous {
            previous.run();
        }
        let cleanup = setup();
        let mut r = record.borrow_mut();
        r.cleanup = Some(cleanup);
        r.phase = EffectPhase::Mounted;
    });
}

/// Runs `effect` in the commit phase of every successful composition of the
/// enclosing group.
pub fn side_effect(effect: impl FnOnce() + 'static) {
    let composer = composer_for("side_effect");
    queue(&composer, EffectKind::Side, effect);
}

/// Handed to a launched effect's body.
#[derive(Clone, Debug)]
pub struct LaunchScope {
    token: CancellationToken,
}

impl LaunchScope {
    /// False once the effect was cancelled by a key change or disposal.
    pub fn is_active(&self) -> bool {
        !self.token.is_cancelled()
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Resolves when the effect is cancelled.
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }
}

struct LaunchedRecord<K> {
    keys: Option<K>,
    registered: bool,
    token: Option<CancellationToken>,
    phase: EffectPhase,
}

/// Asynchronous effect keyed by `keys`.
///
/// The body is launched on the composition's [`Launcher`](crate::Launcher)
/// in the commit phase. A key change cancels the running task before the
/// next one is launched; leaving the composition cancels it for good.
/// Cancellation is reported as [`EffectOutcome::Cancelled`], never as a
/// failure.
pub fn launched_effect<K, F, Fut>(keys: K, block: F)
where
    K: PartialEq + Clone + 'static,
    F: FnOnce(LaunchScope) -> Fut + 'static,
    Fut: Future + 'static,
    Fut::Output: EffectResult,
{
    let composer = composer_for("launched_effect");
    let record = remember(|| {
        Rc::new(RefCell::new(LaunchedRecord::<K> {
            keys: None,
            registered: false,
            token: None,
            phase: EffectPhase::Unmounted,
        }))
    });

    let (fresh, unchanged) = {
        let mut r = record.borrow_mut();
        let fresh = !std::mem::replace(&mut r.registered, true);
        (fresh, r.keys.as_ref() == Some(&keys))
    };

    if fresh {
        let record = record.clone();
        register(&composer, move || {
            let mut r = record.borrow_mut();
            r.phase = EffectPhase::Disposed;
            if let Some(token) = r.token.take() {
                token.cancel();
            }
        });
    }
    if unchanged {
        return;
    }

    let launcher = composer.launcher();
    let sink = composer.failure_sink();
    let group = composer.current_label();
    queue(&composer, EffectKind::Launched, move || {
        let token = CancellationToken::new();
        {
            let mut r = record.borrow_mut();
            if r.phase == EffectPhase::Disposed {
                return;
            }
            if let Some(previous) = r.token.replace(token.clone()) {
                previous.cancel();
            }
            r.keys = Some(keys);
            r.phase = EffectPhase::Mounted;
        }

        let scope = LaunchScope {
            token: token.clone(),
        };
        let task_group = group.clone();
        let task_sink = sink.clone();
        let task = async move {
            let body = AssertUnwindSafe(async move { block(scope).await.into_outcome() });
            let outcome = match token.run_until_cancelled(body.catch_unwind()).await {
                Err(Cancelled) => EffectOutcome::Cancelled,
                Ok(Ok(outcome)) => outcome,
                Ok(Err(payload)) => EffectOutcome::Failed(panic_message(&*payload)),
            };
            match outcome {
                EffectOutcome::Completed => log::trace!("launched effect in {task_group} completed"),
                EffectOutcome::Cancelled => log::debug!("launched effect in {task_group} cancelled"),
                EffectOutcome::Failed(message) => task_sink.report(EffectFailure {
                    group: task_group,
                    kind: EffectKind::Launched,
                    message,
                }),
            }
        };

        if let Err(err) = launcher.launch(task.boxed_local()) {
            record.borrow_mut().phase = EffectPhase::Failed;
            sink.report(EffectFailure {
                group,
                kind: EffectKind::Launched,
                message: err.to_string(),
            });
        }
    });
}

fn register(composer: &Composer, f: impl FnOnce() + 'static) {
    composer
        .register_disposable(f)
        .unwrap_or_else(|e: RuntimeError| e.raise());
}

fn queue(composer: &Composer, kind: EffectKind, f: impl FnOnce() + 'static) {
    composer
        .queue_effect(kind, f)
        .unwrap_or_else(|e: RuntimeError| e.raise());
}
