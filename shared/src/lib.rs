//! # Weft Shared
//! Patch algebra, wire protocol and schema interface shared between the
//! weft-server & weft-client crates.

#![deny(trivial_numeric_casts, unstable_features, unused_import_braces)]

mod component;
mod messages;
mod mutation;
mod timer;
mod value;

pub mod key;
pub mod patch;

pub use component::{ComponentDef, ComponentValue, Schema, SchemaSet, EXISTS_FIELD, VERSION_FIELD};
pub use messages::{ClientMessage, MessageError, ServerMessage, PROTOCOL_VERSION};
pub use mutation::{Mutation, Origin, SyncBehavior};
pub use patch::{apply, diff, merge, strip, subtract, Patch};
pub use timer::Timer;
pub use value::{FieldValue, Fields, ValueError};
