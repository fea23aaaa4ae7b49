//! Controller Actor
//!
//! Async front-end for an [`IsoController`]. Host commands, scheduler
//! callbacks and radio completions all arrive through one channel, so they
//! are serialized exactly as the controller requires. Every event the
//! controller raises is forwarded on the event channel in order.
//!
//! # Example
//!
//! ```rust,ignore
//! use iso_mux::actor::{run_iso_actor, IsoActorCommand};
//! use tokio::sync::mpsc;
//!
//! let (cmd_tx, cmd_rx) = mpsc::channel(256);
//! let (event_tx, mut event_rx) = mpsc::channel(256);
//!
//! tokio::spawn(run_iso_actor(controller, cmd_rx, event_tx));
//! ```

use iso_protocol::ChannelMap;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::engine::IsoController;
use crate::error::IsoError;
use crate::events::IsoEvent;
use crate::hal::{Activity, Radio, RadioDone, Scheduler};
use crate::hci::{
    BigCreateSync, BigTerminateSync, CreateBig, CreateBigTest, RemoveIsoDataPath,
    SetupIsoDataPath, TerminateBig, TestCounters, TestPayloadType,
};
use crate::state::BisHandle;

/// Reply channel of a host command
pub type Reply<T = ()> = oneshot::Sender<Result<T, IsoError>>;

/// Commands sent to the controller actor
#[derive(Debug)]
pub enum IsoActorCommand {
    /// LE Create BIG
    CreateBig {
        cmd: CreateBig,
        /// Controller time the command was received
        now_us: u64,
        response: Reply,
    },

    /// LE Create BIG Test
    CreateBigTest {
        cmd: CreateBigTest,
        now_us: u64,
        response: Reply,
    },

    /// LE Terminate BIG
    TerminateBig { cmd: TerminateBig, response: Reply },

    /// Fetch the BIGInfo for a periodic advertising packet
    GetBigInfo {
        big_handle: u8,
        pa_time_us: u64,
        response: Reply<Vec<u8>>,
    },

    /// LE Set Host Channel Classification
    SetHostChannelClassification { map: ChannelMap },

    /// LE BIG Create Sync
    BigCreateSync { cmd: BigCreateSync, response: Reply },

    /// LE BIG Terminate Sync
    BigTerminateSync {
        cmd: BigTerminateSync,
        response: Reply,
    },

    /// BIGInfo from a periodic advertising report
    BigInfoReceived {
        sync_handle: u16,
        data: Vec<u8>,
        pa_anchor_us: u64,
        sca: u8,
    },

    /// LE Setup ISO Data Path
    SetupIsoDataPath {
        cmd: SetupIsoDataPath,
        response: Reply,
    },

    /// LE Remove ISO Data Path
    RemoveIsoDataPath {
        cmd: RemoveIsoDataPath,
        response: Reply,
    },

    /// SDU from the host for a broadcast BIS
    SendSdu {
        handle: BisHandle,
        data: Vec<u8>,
        sequence: u16,
        timestamp_us: u64,
        response: Reply,
    },

    /// LE ISO Transmit Test
    TransmitTest {
        handle: BisHandle,
        payload: TestPayloadType,
        response: Reply,
    },

    /// LE ISO Receive Test
    ReceiveTest {
        handle: BisHandle,
        payload: TestPayloadType,
        response: Reply,
    },

    /// LE ISO Read Test Counters
    ReadTestCounters {
        handle: BisHandle,
        response: Reply<TestCounters>,
    },

    /// LE ISO Test End
    TestEnd {
        handle: BisHandle,
        response: Reply<TestCounters>,
    },

    /// The scheduler reached a reservation
    ActivityStart { activity: Activity },

    /// The outstanding radio operation finished
    RadioDone { done: RadioDone },

    /// Shutdown the actor
    Shutdown,
}

fn reply<T>(response: oneshot::Sender<Result<T, IsoError>>, result: Result<T, IsoError>) {
    if let Err(err) = &result {
        debug!("Command rejected: {}", err);
    }
    // the host may have stopped waiting
    let _ = response.send(result);
}

/// Run the controller actor
///
/// Returns the controller once the command channel closes or
/// [`IsoActorCommand::Shutdown`] is received.
pub async fn run_iso_actor<R, S>(
    mut controller: IsoController<R, S>,
    mut cmd_rx: mpsc::Receiver<IsoActorCommand>,
    event_tx: mpsc::Sender<IsoEvent>,
) -> IsoController<R, S>
where
    R: Radio,
    S: Scheduler,
{
    info!("Isochronous controller actor started");

    while let Some(cmd) = cmd_rx.recv().await {
        match cmd {
            IsoActorCommand::CreateBig {
                cmd,
                now_us,
                response,
            } => reply(response, controller.create_big(&cmd, now_us)),

            IsoActorCommand::CreateBigTest {
                cmd,
                now_us,
                response,
            } => reply(response, controller.create_big_test(&cmd, now_us)),

            IsoActorCommand::TerminateBig { cmd, response } => {
                reply(response, controller.terminate_big(&cmd))
            }

            IsoActorCommand::GetBigInfo {
                big_handle,
                pa_time_us,
                response,
            } => reply(response, controller.big_info(big_handle, pa_time_us)),

            IsoActorCommand::SetHostChannelClassification { map } => {
                controller.set_host_channel_classification(map)
            }

            IsoActorCommand::BigCreateSync { cmd, response } => {
                reply(response, controller.big_create_sync(cmd))
            }

            IsoActorCommand::BigTerminateSync { cmd, response } => {
                reply(response, controller.big_terminate_sync(&cmd))
            }

            IsoActorCommand::BigInfoReceived {
                sync_handle,
                data,
                pa_anchor_us,
                sca,
            } => {
                // failures are reported through LE BIG Sync Established
                if let Err(err) = controller.biginfo_received(sync_handle, &data, pa_anchor_us, sca)
                {
                    warn!("BIGInfo on sync {} rejected: {}", sync_handle, err);
                }
            }

            IsoActorCommand::SetupIsoDataPath { cmd, response } => {
                reply(response, controller.setup_iso_data_path(&cmd))
            }

            IsoActorCommand::RemoveIsoDataPath { cmd, response } => {
                reply(response, controller.remove_iso_data_path(&cmd))
            }

            IsoActorCommand::SendSdu {
                handle,
                data,
                sequence,
                timestamp_us,
                response,
            } => reply(
                response,
                controller.enqueue_sdu(handle, data, sequence, timestamp_us),
            ),

            IsoActorCommand::TransmitTest {
                handle,
                payload,
                response,
            } => reply(response, controller.iso_transmit_test(handle, payload)),

            IsoActorCommand::ReceiveTest {
                handle,
                payload,
                response,
            } => reply(response, controller.iso_receive_test(handle, payload)),

            IsoActorCommand::ReadTestCounters { handle, response } => {
                reply(response, controller.iso_read_test_counters(handle))
            }

            IsoActorCommand::TestEnd { handle, response } => {
                reply(response, controller.iso_test_end(handle))
            }

            IsoActorCommand::ActivityStart { activity } => controller.run_activity(activity),

            IsoActorCommand::RadioDone { done } => controller.radio_done(done),

            IsoActorCommand::Shutdown => {
                info!("Isochronous controller actor shutting down");
                break;
            }
        }

        for event in controller.drain_events() {
            if event_tx.send(event).await.is_err() {
                warn!("Event receiver dropped");
            }
        }
    }

    controller
}
