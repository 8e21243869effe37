//! Employer/employee consistency controllers.
//!
//! An *employer* (e.g. a Service) is mirrored into an external backend
//! together with the *employees* it selects (e.g. Pods). A backend adapter
//! implements [`adapter::ReconcileAdapter`]; this crate diffs expected and
//! current backend state, drives the adapter's create/update/delete calls and
//! guards both sides with finalizers so nothing is deleted while the backend
//! still references it.

#![deny(missing_docs)]

pub mod adapter;
pub mod client;
pub mod cluster;
pub mod controller;
pub mod diff;
pub mod finalizer;
pub mod naming;
pub mod runner;
pub mod service;

#[cfg(test)]
mod testing;

pub use adapter::{AdapterOptions, ReconcileAdapter};
pub use controller::Context;
pub use runner::build_controller;
