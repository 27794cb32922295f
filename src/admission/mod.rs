//! Priority admission control.

pub mod controller;

pub use controller::{AdmissionController, AdmissionPermit, AdmissionSnapshot};
