//! Isochronous controller engine
//!
//! [`IsoController`] owns both broadcast roles, the radio, the scheduler and
//! the event buffer. It is the single execution context every input runs
//! in: host commands, scheduler callbacks and radio completions are all
//! `&mut self` calls, and at most one radio operation is outstanding.

use iso_protocol::ChannelMap;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{debug, warn};

use crate::big::{BigBroadcaster, BigParams};
use crate::big_sync::BigSyncReceiver;
use crate::config::ControllerConfig;
use crate::error::IsoError;
use crate::events::IsoEvent;
use crate::hal::{Activity, IsoCipher, Radio, RadioDone, Scheduler};
use crate::hci::{
    BigCreateSync, BigTerminateSync, CreateBig, CreateBigTest, RemoveIsoDataPath,
    SetupIsoDataPath, TerminateBig, TestCounters, TestPayloadType,
};
use crate::isoal::Sdu;
use crate::state::{BigState, BisHandle, BisRole, SyncState};

/// HCI data path ID of the transport toward the host
pub const DATA_PATH_HCI: u8 = 0x00;

/// Whether a role left a radio operation outstanding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Progress {
    RadioBusy,
    Idle,
}

/// Shared resources lent to a role for one call
pub(crate) struct Ctx<'a> {
    pub radio: &'a mut dyn Radio,
    pub scheduler: &'a mut dyn Scheduler,
    pub events: &'a mut Vec<IsoEvent>,
    pub cipher: &'a mut Option<Box<dyn IsoCipher>>,
    pub config: &'a ControllerConfig,
    /// Channel classification from the host
    pub host_map: ChannelMap,
}

/// The isochronous broadcast controller
pub struct IsoController<R, S> {
    config: ControllerConfig,
    radio: R,
    scheduler: S,
    broadcaster: BigBroadcaster,
    receiver: BigSyncReceiver,
    cipher: Option<Box<dyn IsoCipher>>,
    rng: StdRng,
    host_map: ChannelMap,
    /// Activity whose radio operation is outstanding
    radio_owner: Option<Activity>,
    event_buffer: Vec<IsoEvent>,
}

impl<R, S> std::fmt::Debug for IsoController<R, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IsoController")
            .field("config", &self.config)
            .field("broadcaster", &self.broadcaster)
            .field("receiver", &self.receiver)
            .field("encrypted", &self.cipher.is_some())
            .field("host_map", &self.host_map)
            .field("radio_owner", &self.radio_owner)
            .field("pending_events", &self.event_buffer.len())
            .finish_non_exhaustive()
    }
}

impl<R: Radio, S: Scheduler> IsoController<R, S> {
    pub fn new(config: ControllerConfig, radio: R, scheduler: S) -> Self {
        Self::with_rng(config, radio, scheduler, StdRng::from_entropy())
    }

    /// Controller with a reproducible access address and CRC sequence
    pub fn with_seed(config: ControllerConfig, radio: R, scheduler: S, seed: u64) -> Self {
        Self::with_rng(config, radio, scheduler, StdRng::seed_from_u64(seed))
    }

    fn with_rng(config: ControllerConfig, radio: R, scheduler: S, rng: StdRng) -> Self {
        Self {
            broadcaster: BigBroadcaster::new(&config),
            receiver: BigSyncReceiver::new(&config),
            config,
            radio,
            scheduler,
            cipher: None,
            rng,
            host_map: ChannelMap::all(),
            radio_owner: None,
            event_buffer: Vec::new(),
        }
    }

    /// Install the payload encryption capability
    pub fn set_cipher(&mut self, cipher: Box<dyn IsoCipher>) {
        self.cipher = Some(cipher);
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn radio(&self) -> &R {
        &self.radio
    }

    pub fn radio_mut(&mut self) -> &mut R {
        &mut self.radio
    }

    pub fn scheduler(&self) -> &S {
        &self.scheduler
    }

    pub fn scheduler_mut(&mut self) -> &mut S {
        &mut self.scheduler
    }

    /// Activity currently holding the radio
    pub fn radio_owner(&self) -> Option<Activity> {
        self.radio_owner
    }

    /// Take all events raised since the last call
    pub fn drain_events(&mut self) -> Vec<IsoEvent> {
        std::mem::take(&mut self.event_buffer)
    }

    fn split(&mut self) -> (Ctx<'_>, &mut BigBroadcaster, &mut BigSyncReceiver, &mut StdRng) {
        (
            Ctx {
                radio: &mut self.radio,
                scheduler: &mut self.scheduler,
                events: &mut self.event_buffer,
                cipher: &mut self.cipher,
                config: &self.config,
                host_map: self.host_map,
            },
            &mut self.broadcaster,
            &mut self.receiver,
            &mut self.rng,
        )
    }

    // -------------------------------------------------------------------------
    // Broadcaster commands
    // -------------------------------------------------------------------------

    /// LE Create BIG; the first anchor follows `now_us` by one ISO interval
    pub fn create_big(&mut self, cmd: &CreateBig, now_us: u64) -> Result<(), IsoError> {
        let params = BigParams::from_create(cmd)?;
        let (mut ctx, broadcaster, _, rng) = self.split();
        broadcaster.create(cmd.big_handle, cmd.adv_handle, params, now_us, rng, &mut ctx)?;
        Ok(())
    }

    /// LE Create BIG Test
    pub fn create_big_test(&mut self, cmd: &CreateBigTest, now_us: u64) -> Result<(), IsoError> {
        let params = BigParams::from_test(cmd)?;
        let (mut ctx, broadcaster, _, rng) = self.split();
        broadcaster.create(cmd.big_handle, cmd.adv_handle, params, now_us, rng, &mut ctx)?;
        Ok(())
    }

    /// LE Terminate BIG
    pub fn terminate_big(&mut self, cmd: &TerminateBig) -> Result<(), IsoError> {
        let (mut ctx, broadcaster, _, _) = self.split();
        broadcaster.terminate(cmd.big_handle, cmd.reason, &mut ctx)
    }

    /// BIGInfo to place in the periodic advertising packet sent at `pa_time_us`
    pub fn big_info(&self, big_handle: u8, pa_time_us: u64) -> Result<Vec<u8>, IsoError> {
        self.broadcaster.big_info(big_handle, pa_time_us)
    }

    /// LE Set Host Channel Classification
    pub fn set_host_channel_classification(&mut self, map: ChannelMap) {
        debug!(used = map.used_count(), "host channel classification");
        self.host_map = map;
        self.broadcaster.set_channel_map(map, &self.config);
    }

    /// Queue an SDU on a broadcast BIS with an input data path
    pub fn enqueue_sdu(
        &mut self,
        handle: BisHandle,
        data: Vec<u8>,
        sequence: u16,
        timestamp_us: u64,
    ) -> Result<(), IsoError> {
        self.broadcaster
            .enqueue_sdu(handle, Sdu::new(data, sequence, timestamp_us))
    }

    pub fn big_state(&self, big_handle: u8) -> Option<BigState> {
        self.broadcaster.state(big_handle)
    }

    pub fn big_bis_handles(&self, big_handle: u8) -> Option<Vec<BisHandle>> {
        self.broadcaster.bis_handles(big_handle)
    }

    pub fn big_channel_map(&self, big_handle: u8) -> Option<ChannelMap> {
        self.broadcaster.channel_map(big_handle)
    }

    pub fn available_broadcast_bis(&self) -> usize {
        self.broadcaster.available_bis()
    }

    // -------------------------------------------------------------------------
    // Receiver commands
    // -------------------------------------------------------------------------

    /// LE BIG Create Sync
    pub fn big_create_sync(&mut self, cmd: BigCreateSync) -> Result<(), IsoError> {
        let (mut ctx, _, receiver, _) = self.split();
        receiver.create_sync(cmd, &mut ctx)?;
        Ok(())
    }

    /// LE BIG Terminate Sync
    pub fn big_terminate_sync(&mut self, cmd: &BigTerminateSync) -> Result<(), IsoError> {
        let (mut ctx, _, receiver, _) = self.split();
        let slot = receiver.terminate_sync(cmd.big_handle, &mut ctx)?;
        if self.radio_owner == Some(Activity::BigRx(slot)) {
            self.radio.disable();
            self.radio_owner = None;
        }
        Ok(())
    }

    /// A periodic advertising report on `sync_handle` carried a BIGInfo
    ///
    /// `pa_anchor_us` is the start of the periodic advertising packet and
    /// `sca` the advertiser's sleep clock accuracy field.
    pub fn biginfo_received(
        &mut self,
        sync_handle: u16,
        data: &[u8],
        pa_anchor_us: u64,
        sca: u8,
    ) -> Result<(), IsoError> {
        let (mut ctx, _, receiver, _) = self.split();
        receiver.biginfo_received(sync_handle, data, pa_anchor_us, sca, &mut ctx)
    }

    pub fn sync_state(&self, big_handle: u8) -> Option<SyncState> {
        self.receiver.state(big_handle)
    }

    pub fn sync_channel_map(&self, big_handle: u8) -> Option<ChannelMap> {
        self.receiver.channel_map(big_handle)
    }

    pub fn available_sync_bis(&self) -> usize {
        self.receiver.available_bis()
    }

    // -------------------------------------------------------------------------
    // Data paths and test mode
    // -------------------------------------------------------------------------

    /// LE Setup ISO Data Path
    pub fn setup_iso_data_path(&mut self, cmd: &SetupIsoDataPath) -> Result<(), IsoError> {
        if cmd.data_path_id != DATA_PATH_HCI {
            return Err(IsoError::UnsupportedFeature("vendor data path"));
        }
        match cmd.handle.role() {
            BisRole::Broadcast => self.broadcaster.setup_data_path(cmd.handle, cmd.direction),
            BisRole::Synchronized => self.receiver.setup_data_path(cmd.handle, cmd.direction),
        }
    }

    /// LE Remove ISO Data Path
    pub fn remove_iso_data_path(&mut self, cmd: &RemoveIsoDataPath) -> Result<(), IsoError> {
        match cmd.handle.role() {
            BisRole::Broadcast => self.broadcaster.remove_data_path(cmd.handle, cmd.direction),
            BisRole::Synchronized => self.receiver.remove_data_path(cmd.handle, cmd.direction),
        }
    }

    /// LE ISO Transmit Test
    pub fn iso_transmit_test(
        &mut self,
        handle: BisHandle,
        payload: TestPayloadType,
    ) -> Result<(), IsoError> {
        if handle.role() != BisRole::Broadcast {
            return Err(IsoError::CommandDisallowed("transmit test needs a broadcast BIS"));
        }
        self.broadcaster.transmit_test(handle, payload)
    }

    /// LE ISO Receive Test
    pub fn iso_receive_test(
        &mut self,
        handle: BisHandle,
        payload: TestPayloadType,
    ) -> Result<(), IsoError> {
        if handle.role() != BisRole::Synchronized {
            return Err(IsoError::CommandDisallowed("receive test needs a synchronized BIS"));
        }
        self.receiver.receive_test(handle, payload)
    }

    /// LE ISO Read Test Counters
    pub fn iso_read_test_counters(&mut self, handle: BisHandle) -> Result<TestCounters, IsoError> {
        if handle.role() != BisRole::Synchronized {
            return Err(IsoError::CommandDisallowed("counters exist on synchronized BISes"));
        }
        self.receiver.read_test_counters(handle)
    }

    /// LE ISO Test End
    pub fn iso_test_end(&mut self, handle: BisHandle) -> Result<TestCounters, IsoError> {
        match handle.role() {
            BisRole::Broadcast => self.broadcaster.test_end(handle),
            BisRole::Synchronized => self.receiver.test_end(handle),
        }
    }

    // -------------------------------------------------------------------------
    // Scheduler and radio callbacks
    // -------------------------------------------------------------------------

    /// The scheduler reached a reservation made by this controller
    pub fn run_activity(&mut self, activity: Activity) {
        if let Some(owner) = self.radio_owner {
            warn!(?activity, ?owner, "radio busy, event skipped");
            let (mut ctx, broadcaster, receiver, _) = self.split();
            match activity {
                Activity::BigTx(slot) => broadcaster.event_missed(slot, &mut ctx),
                Activity::BigRx(slot) => receiver.event_missed(slot, &mut ctx),
            }
            return;
        }

        let (mut ctx, broadcaster, receiver, _) = self.split();
        let progress = match activity {
            Activity::BigTx(slot) => broadcaster.event_start(slot, &mut ctx),
            Activity::BigRx(slot) => receiver.event_start(slot, &mut ctx),
        };
        if progress == Progress::RadioBusy {
            self.radio_owner = Some(activity);
        }
    }

    /// The outstanding radio operation finished
    pub fn radio_done(&mut self, done: RadioDone) {
        let Some(owner) = self.radio_owner.take() else {
            warn!("radio completion without an outstanding operation");
            return;
        };
        let (mut ctx, broadcaster, receiver, _) = self.split();
        let progress = match owner {
            Activity::BigTx(slot) => broadcaster.radio_done(slot, done, &mut ctx),
            Activity::BigRx(slot) => receiver.radio_done(slot, done, &mut ctx),
        };
        if progress == Progress::RadioBusy {
            self.radio_owner = Some(owner);
        }
    }
}
