//! Isochronous Broadcast Engine
//!
//! This crate provides the controller side of LE Audio broadcast: the
//! Isochronous Adaptation Layer that maps application SDUs onto fixed-size
//! air payloads and back, the BIG broadcaster that transmits them on a
//! channel-hopping schedule, and the BIG sync receiver that follows such a
//! schedule from a BIGInfo.
//!
//! # Architecture
//!
//! [`IsoController`] owns both roles and is driven from three directions:
//!
//! - **Host commands**: `create_big`, `big_create_sync`, `enqueue_sdu`, ...
//! - **Scheduler callbacks**: [`IsoController::run_activity`] when a reserved
//!   slot of air time begins
//! - **Radio completions**: [`IsoController::radio_done`] after each subevent
//!
//! Everything reported toward the host comes out of one [`IsoEvent`] stream.
//! The scheduler, radio and cipher are traits in [`hal`] so the engine runs
//! unchanged against hardware or a simulation.
//!
//! # Example
//!
//! ```rust,ignore
//! use iso_mux::{ControllerConfig, CreateBig, IsoController};
//!
//! let mut controller = IsoController::new(ControllerConfig::default(), radio, scheduler);
//! controller.create_big(&create_big, now_us)?;
//!
//! // scheduler fires: controller.run_activity(activity);
//! // radio finishes:  controller.radio_done(done);
//! for event in controller.drain_events() {
//!     // forward to the host
//! }
//! ```

pub mod actor;
pub mod big;
pub mod big_sync;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod hal;
pub mod hci;
pub mod isoal;
pub mod layout;
pub mod pool;
pub mod state;

// Re-export actor types
pub use actor::{run_iso_actor, IsoActorCommand};

pub use big::{BigBroadcaster, BigParams};
pub use big_sync::BigSyncReceiver;
pub use config::ControllerConfig;
pub use engine::IsoController;
pub use error::IsoError;
pub use events::{BigCreatedInfo, BigSyncInfo, IsoEvent};
pub use hal::{
    Activity, CipherContext, GroupKey, IsoCipher, MicFailure, Radio, RadioDone, RadioError,
    RxError, RxPacket, RxRequest, SchedConflict, ScheduleItem, Scheduler, Transition, TxRequest,
};
pub use hci::{
    BigCreateSync, BigTerminateSync, CreateBig, CreateBigTest, DataPathDirection, HciStatus,
    Packing, RemoveIsoDataPath, SetupIsoDataPath, TerminateBig, TestCounters, TestPayloadType,
};
pub use isoal::{IsoalConfig, IsoalDemux, IsoalMux, ReceivedSdu, Sdu, SduStatus};
pub use layout::EventLayout;
pub use state::{BigSlot, BigState, BisHandle, BisRole, SyncSlot, SyncState};
