//! # Album Store Core
//!
//! Domain events, broker contracts and read-model types for the album store's
//! event-driven consistency layer.
//!
//! ## Data Flow
//!
//! ```text
//! command ──► write store (source of truth)
//!    │
//!    └──► EventPublisher ──► topic ──► queue ──► MessageQueue ──► handlers
//!                                                                   │
//!                                             ReviewRepository ◄────┘
//!                                             ImageProcessor   ◄────┘
//! ```
//!
//! ## Modules
//!
//! - [`event`]: the closed event vocabulary and its JSON wire format
//! - [`broker`]: publish and consume contracts
//! - [`review`]: the review aggregate and its repository contract
//! - [`album`]: write-side album model, validation and store contract
//! - [`image`]: the external image processing contract
//!
//! Delivery is at-least-once. Review increments are atomic and commutative but
//! not deduplicated by event id, so a redelivered event is counted again.

pub mod album;
pub mod broker;
pub mod event;
pub mod image;
pub mod review;

pub use chrono::{DateTime, Utc};
