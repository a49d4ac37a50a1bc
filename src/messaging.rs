//! Chat platform boundary. Per §1, the gateway connection itself is an
//! external collaborator; this module specifies the interface
//! (`PlatformClient`) and ships one concrete adapter (Discord, via
//! `serenity`) so the crate is runnable, following the teacher's own
//! "adapter behind a trait" shape (`messaging::traits::Messaging`).

pub mod discord;
pub mod traits;

pub use traits::{InboundEvent, OutboundMessage, PlatformClient, ReactionEvent};
