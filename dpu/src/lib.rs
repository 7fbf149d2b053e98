/*!
# DPU Readout Controller

This crate implements the data processing unit (DPU) side of the camera
front-end readout: a controller that synchronises to the front-end sync
pulses, mirrors the front-end register map, collects housekeeping and image
data packets, and dispatches commands inside the safe commanding window of
each readout cycle.

## Architecture

The [`controller::ReadoutProcessor`] owns the link transport, the local
[`shared::RegisterMap`] mirror and the storage/monitoring sinks, and runs the
readout loop on its own thread. Clients talk to it exclusively through the
[`facade::DpuFacade`], which enqueues commands and blocks on the matching
response.

## Modules

- [`config`] - TOML configuration (camera setup, timings, FPGA defaults)
- [`transport`] - Link transport trait and the in-process channel transport
- [`storage`] - Packet and metadata persistence
- [`monitor`] - In-process monitoring topics and fan-out
- [`state`] - Front-end state tracking and per-cycle bookkeeping
- [`commands`] - The closed command set and its execution
- [`controller`] - The readout loop and the processor supervisor
- [`facade`] - Client-facing commanding verbs
- [`sim`] - A synthetic front-end for development and tests
*/

pub mod commands;
pub mod config;
pub mod controller;
pub mod error;
pub mod facade;
pub mod monitor;
pub mod sim;
pub mod state;
pub mod storage;
pub mod transport;

pub use commands::{Command, CommandEnvelope, CommandResponse, PrioCommand};
pub use config::DpuConfig;
pub use controller::{ProcessorHandle, ReadoutProcessor};
pub use error::ReadoutError;
pub use facade::DpuFacade;
pub use state::{CycleInternals, DumpTransition, FeeState, FeeStateTracker};
