//! Consist operator: the admission webhook and a demo adapter wiring the
//! controller to an in-memory load balancer.

#![deny(missing_docs)]

pub mod demo;
pub mod webhook;
