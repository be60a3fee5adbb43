//! The embeddable governance/evidence kernel: wires `helm-canon` through
//! `helm-adversarial` into one request-processing pipeline, owns
//! configuration loading and the `ProblemDetails` wire contract.

pub mod auth;
pub mod config;
pub mod kernel;
pub mod problem;

pub use config::KernelConfig;
pub use kernel::{Kernel, KernelError, ToolCallOutcome, ToolCallRequest};
pub use problem::ProblemDetails;
