//! Core traits and types for the revlay reverse-dial broker.
//!
//! This crate defines the vocabulary of the system. All other crates depend
//! on `revlay-domain` and speak its types. No implementations live here.
//!
//! # Structure
//!
//! - `error`:     [`RevlayError`] and [`Result<T>`] alias
//! - `peer`:      [`PeerId`] and the registration [`Generation`] counter
//! - `transport`: [`DataStream`], [`ReverseDialer`], [`Redial`], [`Upgrade`]

mod error;
mod peer;
mod transport;

// --- error
pub use error::{Result, RevlayError};

// --- peer
pub use peer::{Generation, PeerId};

// --- transport
pub use transport::{
    // ---
    DataConnPtr,
    DataStream,
    Redial,
    ReverseDialer,
    ReverseDialerPtr,
    Upgrade,
};
