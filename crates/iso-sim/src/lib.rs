//! Broadcast Isochronous Simulation Library
//!
//! This crate provides a simulation layer for testing the isochronous engine
//! without radio hardware. It includes:
//!
//! - **VirtualScheduler**: Reservation calendar with conflict detection
//! - **VirtualRadio**: Single-operation radio that puts packets on a shared air
//! - **BroadcastSimulation**: A broadcaster and a receiver controller driven
//!   on one discrete clock, with a configurable loss model
//!
//! # Example
//!
//! ```rust,ignore
//! use iso_sim::{BroadcastSimulation, LossModel, SimConfig};
//!
//! let mut sim = BroadcastSimulation::new(SimConfig::default());
//! sim.broadcaster_mut().create_big(&create_big, 0)?;
//! sim.run_until(5_000);
//!
//! sim.receiver_mut().big_create_sync(create_sync)?;
//! sim.deliver_biginfo(create_big.big_handle, create_sync.sync_handle)?;
//!
//! // the receiver stops hearing the broadcaster
//! sim.set_loss(LossModel::DropAll);
//! sim.run_for(200_000);
//! ```

pub mod radio;
pub mod scheduler;
pub mod simulation;

pub use radio::{AirPacket, PendingOp, RadioOp, VirtualRadio};
pub use scheduler::VirtualScheduler;
pub use simulation::{BroadcastSimulation, LossModel, Node, SimConfig, SimController};
