//! Service layer
//!
//! Contains business logic separated from HTTP handlers.
//! Services orchestrate the store, actor resolution and delivery.

mod account;
mod interaction;
mod post;

pub use account::AccountService;
pub use interaction::{Interaction, InteractionService, RemoteNote};
pub use post::{PostService, PublishedPost};
