//! Ephemera - provisions a proxy binary on a short-lived host
//!
//! This library drives a one-shot provisioning pipeline that:
//! - Picks the binary variant matching the host CPU architecture
//! - Streams the binaries into a working directory
//! - Writes a fresh proxy configuration (and an agent sidecar when telemetry is set)
//! - Launches the binaries detached, without a shell
//! - Publishes share links for the websocket ingresses as a base64 subscription
//! - Serves a liveness page and files from a sandboxed share directory
//! - Deletes every provisioned artifact after a fixed grace period

pub mod arch;
pub mod artifacts;
pub mod config;
pub mod error;
pub mod fetch;
pub mod identity;
pub mod launch;
pub mod links;
pub mod orchestrator;
pub mod reaper;
pub mod server;
pub mod synth;
pub mod uplink;
