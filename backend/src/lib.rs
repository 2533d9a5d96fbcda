//! Proxima: privacy-preserving proximity and shared-interest service.
//!
//! Users release noise-perturbed coordinates (geo-indistinguishability),
//! discover nearby users within a distance bound, and run a server-mediated
//! Diffie-Hellman PSI over their interest sets. The binary in `main.rs`
//! wires this library to the network; `tools/client` drives it from the
//! command line.

pub mod auth;
pub mod error;
pub mod geo;
pub mod http;
pub mod noise;
pub mod psi;
pub mod store;
