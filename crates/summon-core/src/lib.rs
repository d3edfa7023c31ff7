//! # Composition runtime
//!
//! Summon builds UI trees from plain functions ("composables") and keeps them
//! up to date by re-running only the parts whose inputs changed. The core has
//! five pieces:
//!
//! - `State<T>` / `DerivedState<T>`: observable values whose reads are
//!   tracked per restartable group.
//! - The composer: groups, a positional slot table (`remember`, `changed`) and
//!   a dirty set processed by `Composition::recompose`.
//! - `CompositionLocal<T>`: ambient values with dynamic scope.
//! - Effects: `launched_effect`, `disposable_effect` and `side_effect`, run in
//!   the commit phase after the tree settles.
//! - `LifecycleOwner`: a host-driven lifecycle bound to cancellation.
//!
//! ## A counter
//!
//! ```rust
//! use futures::executor::LocalPool;
//! use summon_core::*;
//!
//! let pool = LocalPool::new();
//! let renderer = RecordingRenderer::new();
//! let composition = Composition::new(renderer.clone(), pool.spawner());
//! let count = mutable_state_of(0);
//!
//! let c = count.clone();
//! composition.set_content(move || {
//!     let c = c.clone();
//!     restartable(move || {
//!         node("text", Attrs::new().with("value", c.get()), || {});
//!     });
//! })?;
//!
//! count.set(1);
//! count.set(2);
//! count.set(3);
//! let report = composition.recompose()?;
//! assert_eq!(report.recomposed, 1);
//! assert_eq!(renderer.dump(), "text value=\"3\"\n");
//! # Ok::<(), RuntimeError>(())
//! ```
//!
//! Writes never recompose inline. They mark the reading groups dirty and the
//! host runs a pass, usually from the `Composition::on_invalidate` hook.
//!
//! ## Stable call sequences
//!
//! `remember` and the effect functions are positional: the Nth call in a
//! group refers to the Nth slot. Calling them conditionally breaks that
//! contract and fails fast with `RuntimeError::SlotTypeMismatch` or
//! `SlotCountMismatch`. Wrap conditional branches and loop items in `keyed`
//! so each gets its own group:
//!
//! ```rust,ignore
//! for item in items.iter() {
//!     keyed(item.id, || row(item));
//! }
//! ```

pub mod cancel;
pub mod config;
pub mod effects;
pub mod effects_ext;
pub mod error;
pub mod group;
pub mod launch;
pub mod lifecycle;
pub mod locals;
pub mod prelude;
mod reactive;
pub mod render_api;
pub mod runtime;
pub mod state;

pub use cancel::*;
pub use config::*;
pub use effects::*;
pub use effects_ext::*;
pub use error::*;
pub use group::{GroupId, GroupKey};
pub use launch::*;
pub use lifecycle::*;
pub use locals::*;
pub use reactive::{StateId, untracked};
pub use render_api::*;
pub use runtime::*;
pub use state::*;

#[cfg(test)]
mod tests;
