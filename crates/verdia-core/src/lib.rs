//! verdia-core - Plant diagnosis pipeline components
//!
//! This library holds the domain logic behind the `/analyze` endpoint: every
//! stage of the request pipeline except transport concerns, which live in
//! `verdia-server`. Each stage fails fast with a typed error; the server is
//! the single point that translates error kinds into HTTP responses.
//!
//! # Pipeline
//!
//! ```text
//! usage gate -> imaging -> prompt -> inference -> diagnosis -> policy
//! ```
//!
//! # Modules
//!
//! - [`config`]: service configuration, assembled once in `main` and passed
//!   down explicitly (never read from ambient state inside the pipeline)
//! - [`usage`]: per-client fixed-window rate limiting
//! - [`imaging`]: image decoding, orientation correction, bounding, and
//!   re-encoding
//! - [`prompt`]: the fixed analysis instruction paired with a normalized
//!   image
//! - [`inference`]: the outbound call to the generative-inference provider,
//!   the pipeline's only suspension point
//! - [`diagnosis`]: extraction and validation of the structured diagnosis
//!   embedded in free-form model output
//! - [`policy`]: the organic-only treatment guarantee, enforced after
//!   validation regardless of model behavior

pub mod config;
pub mod diagnosis;
pub mod imaging;
pub mod inference;
pub mod policy;
pub mod prompt;
pub mod usage;
