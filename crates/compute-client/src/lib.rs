//! A client for clouds exposing the compute API: identity tokens, and creating, polling and
//! deleting servers.
#![cfg_attr(not(test), deny(missing_docs))]

pub mod client;
pub mod errors;
pub mod secrets;
mod token_cache;

#[doc(inline)]
pub use client::Client;
#[doc(inline)]
pub use errors::ComputeError;
