#![no_std]

// Shared logic for the OTA rollback guard.
//
// This crate stays portable across MCU firmware and host tooling by avoiding the
// Rust standard library and exposing the platform seams (storage, partitions,
// reset cause, network link, update service) as traits the other crates implement.

pub mod command;
pub mod config;
pub mod coordinator;
pub mod events;
pub mod link;
pub mod partition;
pub mod reset;
pub mod safe_mode;
pub mod status;
pub mod store;
pub mod supervisor;
pub mod telemetry;
pub mod transfer;
pub mod upload;
