//! LLMSafeSpace control plane: Kubernetes custom controllers that turn
//! `Sandbox`/`WarmPool`/`WarmPod` objects into running, pooled, and torn-down
//! sandbox pods, plus the execution proxy and session layer that let a
//! client run code inside a live sandbox.

pub mod allocator;
pub mod cancel;
pub mod capabilities;
pub mod config;
pub mod crd;
pub mod error;
pub mod http;
pub mod leader;
pub mod metrics;
pub mod pod_spec;
pub mod podexec;
pub mod proxy;
pub mod reconcile;
pub mod session;
pub mod telemetry;
