#![forbid(unsafe_code)]

//! Event bus and event vocabulary for the weft streaming pipeline.
//!
//! Components receive a cloned [`EventBus`] and publish directly;
//! subscribers see all events from all components.

mod bus;
mod event;
mod player;

pub use bus::EventBus;
pub use event::{AbrEvent, Event};
pub use player::PlayerEvent;
