pub use crate::cancel::CancellationToken;
pub use crate::effects::{Dispose, EffectOutcome, on_unmount};
pub use crate::effects_ext::{LaunchScope, disposable_effect, launched_effect, side_effect};
pub use crate::error::{Cancelled, LifecycleError, RuntimeError};
pub use crate::lifecycle::{LOCAL_LIFECYCLE_OWNER, LifecycleOwner, LifecycleState, lifecycle_state};
pub use crate::locals::CompositionLocal;
pub use crate::render_api::{Attrs, NodeHandle, Renderer};
pub use crate::runtime::{
    Composition, changed, group, keyed, node, remember, remember_keyed, restartable,
    restartable_keyed,
};
pub use crate::state::{
    DerivedState, State, derived_state_of, mutable_state_of, remember_derived, remember_state,
};
