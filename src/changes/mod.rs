//! Change events: model, action tokens, and the approval workflow.

pub mod model;
pub mod tokens;
pub mod workflow;

pub use model::{
    ActorType, ChangeEvent, ChangeEventBundle, ChangeEventEdit, ChangeEventQuery,
    ChangeEventSource, ChangeEventStatus, EntityType, NewChangeEvent, NewTransition,
    StateTransition,
};
pub use tokens::{ActionToken, ActionTokenService, TokenAction, hash_token};
pub use workflow::{ManualChangeDraft, Workflow};
