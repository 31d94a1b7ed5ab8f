//! Flow machine: compiled steps plus a pure transition function
//!
//! A flow document compiles once into an immutable [`Machine`] shared by
//! every session. Sessions advance through [`transition`], which returns the
//! new [`SessionState`] and the [`Effect`]s the runtime must carry out.

mod builder;
mod effect;
pub mod event;
pub mod state;
pub(crate) mod transition;

#[cfg(test)]
mod proptests;

pub use builder::{
    BuildDiagnostic, CompiledCondition, CompiledOption, CompiledStep, Completion, Machine,
};
pub use effect::Effect;
pub use event::{ClientEvent, Event};
pub use state::{ConversationContext, Phase, SessionState};
pub use transition::{transition, TransitionError, TransitionResult};
