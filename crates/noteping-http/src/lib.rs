//! Noteping HTTP - backend collaborators over HTTP
//!
//! [`HttpBackend`] implements the engine's [`Registrar`] and [`NoteSource`]
//! seams against the notes backend using `reqwest`.
//!
//! [`Registrar`]: noteping_core::registration::Registrar
//! [`NoteSource`]: noteping_core::summary::NoteSource

#![warn(unreachable_pub)]

pub mod backend;
pub mod error;

pub use backend::{HttpBackend, NOTES_PATH, SUBSCRIBE_PATH};
pub use error::HttpError;
