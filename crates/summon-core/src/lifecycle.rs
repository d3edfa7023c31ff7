//! Externally driven lifecycle and the cancellation scopes bound to it.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::rc::{Rc, Weak};

use futures::FutureExt;

use crate::cancel::CancellationToken;
use crate::effects::{Dispose, EffectOutcome, EffectResult};
use crate::error::{Cancelled, LifecycleError, RuntimeError, panic_message};
use crate::launch::Launcher;
use crate::locals::CompositionLocal;
use crate::state::State;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LifecycleState {
    Created,
    Started,
    Resumed,
    Paused,
    /// Terminal.
    Destroyed,
}

impl LifecycleState {
    /// Started or resumed: the range in which `when_active` blocks run.
    pub fn is_active(self) -> bool {
        matches!(self, LifecycleState::Started | LifecycleState::Resumed)
    }

    pub fn can_transition_to(self, to: LifecycleState) -> bool {
        use LifecycleState::*;
        matches!(
            (self, to),
            (Created, Started)
                | (Started, Resumed)
                | (Resumed, Paused)
                | (Paused, Resumed)
                | (Paused, Started)
                | (Created | Started | Resumed | Paused, Destroyed)
        )
    }
}

type ObserverFn = Rc<dyn Fn(LifecycleState, LifecycleState)>;
type BlockFn = Rc<dyn Fn(CancellationToken) -> futures::future::LocalBoxFuture<'static, EffectOutcome>>;

struct ActiveBlock {
    id: u64,
    key: String,
    start: BlockFn,
    /// Token of the running execution, if any.
    running: Option<CancellationToken>,
}

struct OwnerInner {
    state: State<LifecycleState>,
    observers: RefCell<Vec<(u64, ObserverFn)>>,
    blocks: RefCell<Vec<ActiveBlock>>,
    next_id: Cell<u64>,
    root: CancellationToken,
    launcher: Rc<dyn Launcher>,
}

/// Host-driven lifecycle: Created, Started, Resumed, Paused and Destroyed.
///
/// The owner never changes state on its own; the host calls
/// [`transition`](Self::transition). Work bound to the owner (its
/// [`LifecycleScope`] and `when_active` blocks) is cancelled when it is
/// destroyed.
#[derive(Clone)]
pub struct LifecycleOwner(Rc<OwnerInner>);

impl LifecycleOwner {
    pub fn new(launcher: impl Launcher + 'static) -> Self {
        Self(Rc::new(OwnerInner {
            state: State::new(LifecycleState::Created),
            observers: RefCell::new(Vec::new()),
            blocks: RefCell::new(Vec::new()),
            next_id: Cell::new(0),
            root: CancellationToken::new(),
            launcher: Rc::new(launcher),
        }))
    }

    pub fn state(&self) -> LifecycleState {
        self.0.state.get_untracked()
    }

    /// The current state as a tracked read, so composables reading it
    /// recompose on transitions.
    pub fn observed_state(&self) -> LifecycleState {
        self.0.state.get()
    }

    pub fn transition(&self, to: LifecycleState) -> Result<(), LifecycleError> {
        let from = self.state();
        if from == LifecycleState::Destroyed {
            return Err(LifecycleError::Destroyed);
        }
        if !from.can_transition_to(to) {
            return Err(LifecycleError::InvalidTransition { from, to });
        }
        log::debug!("lifecycle {from:?} -> {to:?}");

        if from.is_active() && !to.is_active() {
            self.stop_blocks();
        }
        if to == LifecycleState::Destroyed {
            self.0.root.cancel();
            self.0.blocks.borrow_mut().clear();
        }
        self.0.state.set(to);
        if !from.is_active() && to.is_active() {
            self.start_blocks();
        }

        let observers: Vec<ObserverFn> = self
            .0
            .observers
            .borrow()
            .iter()
            .map(|(_, f)| f.clone())
            .collect();
        for observer in observers {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| observer(from, to))) {
                log::error!(
                    "lifecycle observer failed on {from:?} -> {to:?}: {}",
                    panic_message(&*payload)
                );
            }
        }
        if to == LifecycleState::Destroyed {
            self.0.observers.borrow_mut().clear();
        }
        Ok(())
    }

    pub fn destroy(&self) -> Result<(), LifecycleError> {
        self.transition(LifecycleState::Destroyed)
    }

    /// Registers `f(from, to)` for every later transition, in registration
    /// order. Returns the guard that unregisters it.
    pub fn observe(&self, f: impl Fn(LifecycleState, LifecycleState) + 'static) -> Dispose {
        let id = self.next_id();
        self.0.observers.borrow_mut().push((id, Rc::new(f)));
        let weak = Rc::downgrade(&self.0);
        Dispose::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.observers.borrow_mut().retain(|(i, _)| *i != id);
            }
        })
    }

    /// A scope whose work is cancelled when the owner is destroyed.
    pub fn lifecycle_scope(&self) -> LifecycleScope {
        LifecycleScope {
            token: self.0.root.child_token(),
            launcher: self.0.launcher.clone(),
        }
    }

    /// Runs `block` while the owner is started or resumed.
    ///
    /// Leaving that range cancels the running execution; entering it again
    /// launches a fresh one. Registering a block under an existing `key`
    /// replaces (and cancels) the previous one. The returned guard cancels
    /// and unregisters the block.
    pub fn when_active<F, Fut>(&self, key: impl Into<String>, block: F) -> Dispose
    where
        F: Fn(CancellationToken) -> Fut + 'static,
        Fut: Future + 'static,
        Fut::Output: EffectResult,
    {
        let key = key.into();
        if self.state() == LifecycleState::Destroyed {
            log::warn!("when_active(\"{key}\") on a destroyed lifecycle owner is ignored");
            return Dispose::noop();
        }
        let start: BlockFn = Rc::new(move |token: CancellationToken| {
            let fut = block(token);
            async move { fut.await.into_outcome() }.boxed_local()
        });

        let id = self.next_id();
        let replaced = {
            let mut blocks = self.0.blocks.borrow_mut();
            let previous = blocks.iter().position(|b| b.key == key).map(|i| blocks.remove(i));
            blocks.push(ActiveBlock {
                id,
                key: key.clone(),
                start,
                running: None,
            });
            previous
        };
        if let Some(token) = replaced.and_then(|b| b.running) {
            token.cancel();
        }
        if self.state().is_active() {
            self.start_block(&key);
        }

        let weak: Weak<OwnerInner> = Rc::downgrade(&self.0);
        Dispose::new(move || {
            let Some(inner) = weak.upgrade() else { return };
            let removed = {
                let mut blocks = inner.blocks.borrow_mut();
                blocks.iter().position(|b| b.id == id).map(|i| blocks.remove(i))
            };
            if let Some(token) = removed.and_then(|b| b.running) {
                token.cancel();
            }
        })
    }

    fn next_id(&self) -> u64 {
        let id = self.0.next_id.get();
        self.0.next_id.set(id + 1);
        id
    }

    fn stop_blocks(&self) {
        let tokens: Vec<CancellationToken> = self
            .0
            .blocks
            .borrow_mut()
            .iter_mut()
            .filter_map(|b| b.running.take())
            .collect();
        for token in tokens {
            token.cancel();
        }
    }

    fn start_blocks(&self) {
        let keys: Vec<String> = self.0.blocks.borrow().iter().map(|b| b.key.clone()).collect();
        for key in keys {
            self.start_block(&key);
        }
    }

    fn start_block(&self, key: &str) {
        let token = self.0.root.child_token();
        let start = {
            let mut blocks = self.0.blocks.borrow_mut();
            let Some(block) = blocks.iter_mut().find(|b| b.key == key) else {
                return;
            };
            if let Some(previous) = block.running.replace(token.clone()) {
                previous.cancel();
            }
            block.start.clone()
        };
        let label = format!("when_active(\"{key}\")");
        let task = supervised(label.clone(), token.clone(), async move {
            start(token).await
        });
        if let Err(err) = self.0.launcher.launch(task.map(drop).boxed_local()) {
            log::error!("{label}: {err}");
        }
    }
}

impl PartialEq for LifecycleOwner {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for LifecycleOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LifecycleOwner")
            .field("state", &self.state())
            .finish()
    }
}

/// Cancellation scope bound to a [`LifecycleOwner`].
#[derive(Clone)]
pub struct LifecycleScope {
    token: CancellationToken,
    launcher: Rc<dyn Launcher>,
}

impl LifecycleScope {
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_active(&self) -> bool {
        !self.token.is_cancelled()
    }

    /// Launches `fut` under a child of this scope's token. The returned token
    /// cancels this task alone.
    pub fn launch<Fut>(&self, fut: Fut) -> Result<CancellationToken, RuntimeError>
    where
        Fut: Future + 'static,
        Fut::Output: EffectResult,
    {
        let token = self.token.child_token();
        if self.token.is_cancelled() {
            return Err(RuntimeError::Launch("lifecycle scope is cancelled".to_string()));
        }
        let task = supervised(
            "lifecycle scope task".to_string(),
            token.clone(),
            async move { fut.await.into_outcome() },
        );
        self.launcher.launch(task.map(drop).boxed_local())?;
        Ok(token)
    }

    /// Cancels every task launched from this scope.
    pub fn cancel(&self) {
        self.token.cancel();
    }
}

/// Drives `fut` under `token`, turning panics into failures and logging the
/// outcome.
async fn supervised(
    label: String,
    token: CancellationToken,
    fut: impl Future<Output = EffectOutcome>,
) -> EffectOutcome {
    let outcome = match token
        .run_until_cancelled(AssertUnwindSafe(fut).catch_unwind())
        .await
    {
        Err(Cancelled) => EffectOutcome::Cancelled,
        Ok(Ok(outcome)) => outcome,
        Ok(Err(payload)) => EffectOutcome::Failed(panic_message(&*payload)),
    };
    match &outcome {
        EffectOutcome::Completed => log::trace!("{label} completed"),
        EffectOutcome::Cancelled => log::debug!("{label} cancelled"),
        EffectOutcome::Failed(message) => log::error!("{label} failed: {message}"),
    }
    outcome
}

/// The lifecycle owner of the surrounding composition, if the host provides
/// one.
pub static LOCAL_LIFECYCLE_OWNER: CompositionLocal<LifecycleOwner> =
    CompositionLocal::new("LocalLifecycleOwner");

/// State of the provided lifecycle owner. The enclosing restartable group
/// recomposes on every transition.
pub fn lifecycle_state() -> LifecycleState {
    LOCAL_LIFECYCLE_OWNER.current().observed_state()
}
