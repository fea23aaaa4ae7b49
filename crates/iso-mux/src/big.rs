//! BIG broadcaster
//!
//! Owns the broadcast BIGs and their BISes. Each event starts when the
//! scheduler runs the BIG's activity, then walks every subevent in air order
//! with one radio operation outstanding at a time, finishing with the BIG
//! control subevent when a control procedure is running.

use iso_protocol::pdu::{build_pdu, instant_reached, BisPduHeader};
use iso_protocol::{
    bis_access_address, channel_identifier, control_access_address, generate_seed_access_address,
    next_event_channel, next_subevent_channel, BigControlPdu, BigInfo, BigInfoEncryption,
    ChannelHop, ChannelMap, EncodePdu, Framing, FramingMode, Llid, OffsetUnits, Phy,
    PAYLOAD_COUNTER_MASK,
};
use rand::{Rng, RngCore};
use tracing::{debug, info, trace, warn};

use crate::config::ControllerConfig;
use crate::engine::{Ctx, Progress};
use crate::error::IsoError;
use crate::events::{BigCreatedInfo, IsoEvent};
use crate::hal::{Activity, CipherContext, GroupKey, RadioDone, ScheduleItem, Transition, TxRequest};
use crate::hci::{
    CreateBig, CreateBigTest, DataPathDirection, HciStatus, Packing, TestCounters,
    TestPayloadType,
};
use crate::isoal::{IsoalConfig, IsoalMux, Sdu};
use crate::layout::EventLayout;
use crate::pool::Pool;
use crate::state::{BigSlot, BigState, BisHandle, BisRole};

/// Largest BIG handle
pub const MAX_BIG_HANDLE: u8 = 0xEF;

/// Resolved parameters of a broadcast BIG
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BigParams {
    pub num_bis: u8,
    pub sdu_interval_us: u32,
    /// ISO interval in units of 1.25 ms
    pub iso_interval: u16,
    pub max_sdu: u16,
    pub max_pdu: u8,
    pub nse: u8,
    pub bn: u8,
    pub irc: u8,
    pub pto: u8,
    pub phy: Phy,
    pub packing: Packing,
    pub framing: Framing,
    pub framing_mode: FramingMode,
    pub encryption: bool,
    pub broadcast_code: [u8; 16],
}

fn invalid(msg: impl Into<String>) -> IsoError {
    IsoError::InvalidParameters(msg.into())
}

fn check(ok: bool, msg: &str) -> Result<(), IsoError> {
    if ok {
        Ok(())
    } else {
        Err(invalid(msg))
    }
}

impl BigParams {
    /// Derive the BIG layout from LE Create BIG
    pub fn from_create(cmd: &CreateBig) -> Result<Self, IsoError> {
        check((1..=31).contains(&cmd.num_bis), "Num_BIS out of range")?;
        check(
            (0xFF..=0xF_FFFF).contains(&cmd.sdu_interval_us),
            "SDU_Interval out of range",
        )?;
        check((1..=0x0FFF).contains(&cmd.max_sdu), "Max_SDU out of range")?;
        check(
            (5..=4000).contains(&cmd.max_transport_latency_ms),
            "Max_Transport_Latency out of range",
        )?;
        check(cmd.rtn <= 0x1E, "RTN out of range")?;

        let sdu_us = cmd.sdu_interval_us;
        let max_sdu = u32::from(cmd.max_sdu);
        let framed = cmd.framing == Framing::Framed || sdu_us % 1250 != 0;

        let (iso_interval_us, max_pdu, bn) = if framed {
            let iso_us = sdu_us.div_ceil(1250).max(4) * 1250;
            let sdus_per_event = iso_us.div_ceil(sdu_us);
            let max_pdu = (max_sdu + 5).min(251);
            let bn = (sdus_per_event * (max_sdu + 5)).div_ceil(max_pdu);
            (iso_us, max_pdu, bn)
        } else {
            let sdus_per_event = 5000u32.div_ceil(sdu_us).max(1);
            let fragments = max_sdu.div_ceil(251);
            let max_pdu = max_sdu.div_ceil(fragments);
            (sdu_us * sdus_per_event, max_pdu, sdus_per_event * fragments)
        };
        if bn > 7 {
            return Err(IsoError::UnsupportedFeature(
                "SDU rate needs more than 7 payloads per event",
            ));
        }
        let bn = bn as u8;
        let irc = (cmd.rtn + 1).min(15).min(31 / bn);

        let params = Self {
            num_bis: cmd.num_bis,
            sdu_interval_us: sdu_us,
            iso_interval: (iso_interval_us / 1250) as u16,
            max_sdu: cmd.max_sdu,
            max_pdu: max_pdu as u8,
            nse: bn * irc,
            bn,
            irc,
            pto: 0,
            phy: cmd.phy,
            packing: cmd.packing,
            framing: if framed {
                Framing::Framed
            } else {
                Framing::Unframed
            },
            framing_mode: FramingMode::Segmentable,
            encryption: cmd.encryption,
            broadcast_code: cmd.broadcast_code,
        };
        params.validate()?;
        Ok(params)
    }

    /// Take the BIG layout from LE Create BIG Test
    pub fn from_test(cmd: &CreateBigTest) -> Result<Self, IsoError> {
        let params = Self {
            num_bis: cmd.num_bis,
            sdu_interval_us: cmd.sdu_interval_us,
            iso_interval: cmd.iso_interval,
            max_sdu: cmd.max_sdu,
            max_pdu: cmd.max_pdu,
            nse: cmd.nse,
            bn: cmd.bn,
            irc: cmd.irc,
            pto: cmd.pto,
            phy: cmd.phy,
            packing: cmd.packing,
            framing: cmd.framing,
            framing_mode: FramingMode::Segmentable,
            encryption: cmd.encryption,
            broadcast_code: cmd.broadcast_code,
        };
        params.validate()?;
        Ok(params)
    }

    fn validate(&self) -> Result<(), IsoError> {
        check((1..=31).contains(&self.num_bis), "Num_BIS out of range")?;
        check((1..=7).contains(&self.bn), "BN out of range")?;
        check((1..=15).contains(&self.irc), "IRC out of range")?;
        check((1..=31).contains(&self.nse), "NSE out of range")?;
        check(self.nse % self.bn == 0, "NSE is not a multiple of BN")?;
        check(self.irc <= self.nse / self.bn, "IRC exceeds NSE / BN")?;
        check(self.pto <= 15, "PTO out of range")?;
        check(
            self.pto > 0 || self.irc == self.nse / self.bn,
            "IRC must equal NSE / BN without pre-transmission",
        )?;
        check((1..=251).contains(&self.max_pdu), "Max_PDU out of range")?;
        check(self.max_sdu <= 0x0FFF, "Max_SDU out of range")?;
        check((4..=3200).contains(&self.iso_interval), "ISO_Interval out of range")?;
        check(
            (0xFF..=0xF_FFFF).contains(&self.sdu_interval_us),
            "SDU_Interval out of range",
        )?;

        let layout = self.layout();
        let needed = layout.event_duration_us(true);
        if needed > layout.iso_interval_us() {
            return Err(invalid(format!(
                "event needs {needed}us but ISO interval is {}us",
                layout.iso_interval_us()
            )));
        }
        Ok(())
    }

    pub fn layout(&self) -> EventLayout {
        let mic = if self.encryption {
            iso_protocol::timing::MIC_LEN
        } else {
            0
        };
        EventLayout::for_packing(
            self.num_bis,
            self.nse,
            self.bn,
            self.irc,
            self.pto,
            self.phy,
            self.iso_interval,
            self.max_pdu,
            mic,
            self.packing,
        )
    }

    fn isoal_config(&self, config: &ControllerConfig) -> IsoalConfig {
        IsoalConfig {
            max_pdu: self.max_pdu,
            iso_interval_us: iso_protocol::timing::iso_interval_us(self.iso_interval),
            sdu_interval_us: self.sdu_interval_us,
            bn: self.bn,
            pto: self.pto,
            framing: self.framing,
            framing_mode: self.framing_mode,
            max_sdu_queue: config.max_sdu_queue,
        }
    }
}

#[derive(Debug)]
struct TxTest {
    payload: TestPayloadType,
    counter: u32,
}

/// One broadcast BIS
#[derive(Debug)]
pub(crate) struct BisTx {
    big: BigSlot,
    /// BIS number, 1-based
    number: u8,
    access_address: u32,
    crc_init: u32,
    channel_id: u16,
    event_channel: u8,
    hop: ChannelHop,
    mux: IsoalMux,
    data_path: bool,
    test: Option<TxTest>,
}

/// One broadcast BIG
#[derive(Debug)]
pub(crate) struct Big {
    handle: u8,
    adv_handle: u8,
    params: BigParams,
    layout: EventLayout,
    /// Subevents in air order as (BIS position, subevent)
    order: Vec<(usize, u8)>,
    seed_access_address: u32,
    control_access_address: u32,
    control_channel_id: u16,
    base_crc_init: u16,
    key: Option<GroupKey>,
    chan_map: ChannelMap,
    big_counter: u64,
    bis_counter: u64,
    anchor_us: u64,
    bis: Vec<BisHandle>,
    cursor: usize,
    in_event: bool,
    established: bool,
    control: Option<BigControlPdu>,
    control_this_event: bool,
    pending_map: Option<ChannelMap>,
    cssn: u8,
    terminate: Option<u8>,
    final_event: bool,
    stop_after_event: bool,
    sched_failures: u8,
}

impl Big {
    fn state(&self) -> BigState {
        if self.terminate.is_some() {
            BigState::Terminating
        } else if self.established {
            BigState::Active
        } else {
            BigState::Pending
        }
    }

    fn start_control(&mut self, pdu: BigControlPdu) {
        self.control = Some(pdu);
        self.cssn = (self.cssn + 1) & 0x07;
        debug!(big_handle = self.handle, cssn = self.cssn, ?pdu, "control procedure started");
    }

    fn created_info(&self) -> BigCreatedInfo {
        BigCreatedInfo {
            big_sync_delay_us: self.layout.sync_delay_us(),
            transport_latency_us: self
                .layout
                .transport_latency_us(self.params.framing, self.params.sdu_interval_us),
            phy: self.params.phy,
            nse: self.params.nse,
            bn: self.params.bn,
            pto: self.params.pto,
            irc: self.params.irc,
            max_pdu: self.params.max_pdu,
            iso_interval: self.params.iso_interval,
            bis_handles: self.bis.clone(),
        }
    }

    fn advance(&mut self) {
        self.big_counter = (self.big_counter + 1) & PAYLOAD_COUNTER_MASK;
        self.bis_counter = (self.bis_counter + u64::from(self.params.bn)) & PAYLOAD_COUNTER_MASK;
        self.anchor_us += u64::from(self.layout.iso_interval_us());
    }
}

/// Broadcast side of the controller
#[derive(Debug)]
pub struct BigBroadcaster {
    bigs: Pool<Big>,
    bis: Pool<BisTx>,
}

impl BigBroadcaster {
    pub fn new(config: &ControllerConfig) -> Self {
        Self {
            bigs: Pool::with_capacity(config.max_bigs),
            bis: Pool::with_capacity(config.max_bis),
        }
    }

    /// Free BIS slots
    pub fn available_bis(&self) -> usize {
        self.bis.available()
    }

    pub fn big_count(&self) -> usize {
        self.bigs.len()
    }

    fn find(&self, big_handle: u8) -> Option<BigSlot> {
        self.bigs.find(|b| b.handle == big_handle).map(BigSlot)
    }

    pub fn state(&self, big_handle: u8) -> Option<BigState> {
        let slot = self.find(big_handle)?;
        self.bigs.get(slot.0).map(Big::state)
    }

    /// BIS handles of a BIG, in BIS number order
    pub fn bis_handles(&self, big_handle: u8) -> Option<Vec<BisHandle>> {
        let slot = self.find(big_handle)?;
        self.bigs.get(slot.0).map(|b| b.bis.clone())
    }

    /// Current channel map of a BIG
    pub fn channel_map(&self, big_handle: u8) -> Option<ChannelMap> {
        let slot = self.find(big_handle)?;
        self.bigs.get(slot.0).map(|b| b.chan_map)
    }

    pub(crate) fn create(
        &mut self,
        big_handle: u8,
        adv_handle: u8,
        params: BigParams,
        now_us: u64,
        rng: &mut dyn RngCore,
        ctx: &mut Ctx<'_>,
    ) -> Result<BigSlot, IsoError> {
        if big_handle > MAX_BIG_HANDLE {
            return Err(invalid("BIG_Handle out of range"));
        }
        if self.find(big_handle).is_some() {
            return Err(IsoError::CommandDisallowed("BIG handle already in use"));
        }
        if self.bigs.iter().any(|(_, b)| b.adv_handle == adv_handle) {
            return Err(IsoError::CommandDisallowed(
                "advertising set already has a BIG",
            ));
        }
        if self.bigs.iter().any(|(_, b)| b.state() == BigState::Pending) {
            return Err(IsoError::CommandDisallowed("another BIG is pending"));
        }
        if params.encryption && ctx.cipher.is_none() {
            return Err(IsoError::UnsupportedFeature("encryption"));
        }
        if self.bigs.available() == 0 {
            return Err(IsoError::ResourcesExhausted("BIG"));
        }
        if self.bis.available() < usize::from(params.num_bis) {
            return Err(IsoError::ResourcesExhausted("BIS"));
        }

        let isoal = params.isoal_config(ctx.config);
        let muxes = (0..params.num_bis)
            .map(|_| IsoalMux::new(isoal))
            .collect::<Result<Vec<_>, _>>()?;

        let seed = generate_seed_access_address(rng, params.num_bis);
        let base_crc_init: u16 = rng.gen();
        let key = params.encryption.then(|| {
            let mut giv = [0u8; 8];
            let mut gskd = [0u8; 16];
            rng.fill_bytes(&mut giv);
            rng.fill_bytes(&mut gskd);
            GroupKey {
                broadcast_code: params.broadcast_code,
                giv,
                gskd,
            }
        });
        let layout = params.layout();
        let positions: Vec<usize> = (0..usize::from(params.num_bis)).collect();
        let order = layout.subevent_order(&positions);
        let control_aa = control_access_address(seed);
        let anchor_us =
            now_us + u64::from(ctx.config.event_lead_us) + u64::from(layout.iso_interval_us());

        let big = Big {
            handle: big_handle,
            adv_handle,
            params,
            layout,
            order,
            seed_access_address: seed,
            control_access_address: control_aa,
            control_channel_id: channel_identifier(control_aa),
            base_crc_init,
            key,
            chan_map: ctx.host_map,
            big_counter: 0,
            bis_counter: 0,
            anchor_us,
            bis: Vec::new(),
            cursor: 0,
            in_event: false,
            established: false,
            control: None,
            control_this_event: false,
            pending_map: None,
            cssn: 0,
            terminate: None,
            final_event: false,
            stop_after_event: false,
            sched_failures: 0,
        };
        let slot = BigSlot(
            self.bigs
                .insert(big)
                .map_err(|_| IsoError::ResourcesExhausted("BIG"))?,
        );

        let mut handles = Vec::with_capacity(muxes.len());
        for (i, mux) in muxes.into_iter().enumerate() {
            let number = i as u8 + 1;
            let access_address = bis_access_address(seed, number);
            let bis = BisTx {
                big: slot,
                number,
                access_address,
                crc_init: u32::from(base_crc_init) << 8 | u32::from(number),
                channel_id: channel_identifier(access_address),
                event_channel: 0,
                hop: ChannelHop::default(),
                mux,
                data_path: false,
                test: None,
            };
            match self.bis.insert(bis) {
                Ok(h) => handles.push(BisHandle {
                    role: BisRole::Broadcast,
                    slot: h,
                }),
                Err(_) => {
                    // capacity was checked above
                    for h in handles {
                        self.bis.remove(h.slot);
                    }
                    self.bigs.remove(slot.0);
                    return Err(IsoError::ResourcesExhausted("BIS"));
                }
            }
        }
        if let Some(big) = self.bigs.get_mut(slot.0) {
            big.bis = handles;
            info!(
                big_handle,
                num_bis = big.params.num_bis,
                nse = big.params.nse,
                bn = big.params.bn,
                irc = big.params.irc,
                pto = big.params.pto,
                iso_interval = big.params.iso_interval,
                framing = ?big.params.framing,
                "BIG created"
            );
        }
        self.schedule_next(slot, ctx);
        Ok(slot)
    }

    pub(crate) fn terminate(
        &mut self,
        big_handle: u8,
        reason: u8,
        ctx: &mut Ctx<'_>,
    ) -> Result<(), IsoError> {
        let slot = self
            .find(big_handle)
            .ok_or(IsoError::UnknownBig(big_handle))?;
        let Some(big) = self.bigs.get_mut(slot.0) else {
            return Err(IsoError::UnknownBig(big_handle));
        };
        if big.terminate.is_some() {
            return Err(IsoError::CommandDisallowed("BIG is already terminating"));
        }
        if !big.established && !big.in_event {
            self.free(slot, HciStatus::LocalHostTerminated, ctx);
            return Ok(());
        }
        big.terminate = Some(reason);
        big.stop_after_event = big.in_event;
        info!(big_handle, reason, "BIG terminating");
        Ok(())
    }

    /// Start a channel map update on every BIG
    pub(crate) fn set_channel_map(&mut self, map: ChannelMap, config: &ControllerConfig) {
        for (_, big) in self.bigs.iter_mut() {
            if big.terminate.is_some() {
                continue;
            }
            if big.control.is_some() {
                big.pending_map = Some(map);
                continue;
            }
            if map == big.chan_map {
                continue;
            }
            let instant = big.big_counter.wrapping_add(config.control_instant_offset.into()) as u16;
            big.start_control(BigControlPdu::ChannelMapInd {
                channel_map: map,
                instant,
            });
        }
    }

    pub(crate) fn enqueue_sdu(&mut self, handle: BisHandle, sdu: Sdu) -> Result<(), IsoError> {
        let unknown = IsoError::UnknownBis(handle.conn_handle());
        if handle.role != BisRole::Broadcast {
            return Err(unknown);
        }
        let bis = self.bis.get_mut(handle.slot).ok_or(unknown)?;
        if !bis.data_path {
            return Err(IsoError::CommandDisallowed("no input data path"));
        }
        let max_sdu = self
            .bigs
            .get(bis.big.0)
            .map(|b| usize::from(b.params.max_sdu))
            .unwrap_or(0);
        if sdu.data.len() > max_sdu {
            return Err(invalid(format!(
                "SDU of {} bytes exceeds Max_SDU {max_sdu}",
                sdu.data.len()
            )));
        }
        bis.mux.enqueue_sdu(sdu)
    }

    fn bis_mut(&mut self, handle: BisHandle) -> Result<&mut BisTx, IsoError> {
        if handle.role != BisRole::Broadcast {
            return Err(IsoError::UnknownBis(handle.conn_handle()));
        }
        self.bis
            .get_mut(handle.slot)
            .ok_or(IsoError::UnknownBis(handle.conn_handle()))
    }

    pub(crate) fn setup_data_path(
        &mut self,
        handle: BisHandle,
        direction: DataPathDirection,
    ) -> Result<(), IsoError> {
        let bis = self.bis_mut(handle)?;
        if direction != DataPathDirection::Input {
            return Err(invalid("broadcast BIS only has an input path"));
        }
        if bis.data_path || bis.test.is_some() {
            return Err(IsoError::CommandDisallowed("data path already in use"));
        }
        bis.data_path = true;
        Ok(())
    }

    pub(crate) fn remove_data_path(
        &mut self,
        handle: BisHandle,
        direction: DataPathDirection,
    ) -> Result<(), IsoError> {
        let bis = self.bis_mut(handle)?;
        if direction != DataPathDirection::Input || !bis.data_path {
            return Err(IsoError::CommandDisallowed("no such data path"));
        }
        bis.data_path = false;
        Ok(())
    }

    pub(crate) fn transmit_test(
        &mut self,
        handle: BisHandle,
        payload: TestPayloadType,
    ) -> Result<(), IsoError> {
        let bis = self.bis_mut(handle)?;
        if bis.data_path || bis.test.is_some() {
            return Err(IsoError::CommandDisallowed("BIS is carrying host data"));
        }
        bis.test = Some(TxTest {
            payload,
            counter: 0,
        });
        Ok(())
    }

    pub(crate) fn test_end(&mut self, handle: BisHandle) -> Result<TestCounters, IsoError> {
        let bis = self.bis_mut(handle)?;
        if bis.test.take().is_none() {
            return Err(IsoError::CommandDisallowed("BIS is not in test mode"));
        }
        Ok(TestCounters::default())
    }

    /// BIGInfo describing the first event after `pa_time_us`
    pub fn big_info(&self, big_handle: u8, pa_time_us: u64) -> Result<Vec<u8>, IsoError> {
        let slot = self
            .find(big_handle)
            .ok_or(IsoError::UnknownBig(big_handle))?;
        let big = self
            .bigs
            .get(slot.0)
            .ok_or(IsoError::UnknownBig(big_handle))?;

        let iso = u64::from(big.layout.iso_interval_us());
        let mut ahead = u64::from(big.in_event);
        if big.anchor_us + ahead * iso <= pa_time_us {
            ahead = (pa_time_us - big.anchor_us) / iso + 1;
        }
        let anchor = big.anchor_us + ahead * iso;
        let offset = u32::try_from(anchor - pa_time_us).unwrap_or(u32::MAX);
        let (big_offset, offset_units) = OffsetUnits::encode_offset(offset);

        let info = BigInfo {
            big_offset,
            offset_units,
            iso_interval: big.params.iso_interval,
            num_bis: big.params.num_bis,
            nse: big.params.nse,
            bn: big.params.bn,
            sub_interval_us: big.layout.sub_interval_us,
            pto: big.params.pto,
            bis_spacing_us: big.layout.bis_spacing_us,
            irc: big.params.irc,
            max_pdu: big.params.max_pdu,
            framing_mode: big.params.framing_mode,
            seed_access_address: big.seed_access_address,
            sdu_interval_us: big.params.sdu_interval_us,
            max_sdu: big.params.max_sdu,
            base_crc_init: big.base_crc_init,
            channel_map: big.chan_map,
            phy: big.params.phy,
            payload_count: (big.bis_counter + ahead * u64::from(big.params.bn))
                & PAYLOAD_COUNTER_MASK,
            framing: big.params.framing,
            encryption: big.key.map(|k| BigInfoEncryption {
                giv: k.giv,
                gskd: k.gskd,
            }),
        };
        Ok(info.encode())
    }

    /// Scheduler reached the BIG's reservation
    pub(crate) fn event_start(&mut self, slot: BigSlot, ctx: &mut Ctx<'_>) -> Progress {
        let Some(big) = self.bigs.get_mut(slot.0) else {
            warn!(?slot, "event for a freed BIG");
            return Progress::Idle;
        };

        if let Some(control) = big.control {
            if instant_reached(big.big_counter, control.instant()) {
                if let BigControlPdu::ChannelMapInd { channel_map, .. } = control {
                    big.chan_map = channel_map;
                    info!(
                        big_handle = big.handle,
                        used = channel_map.used_count(),
                        "channel map applied"
                    );
                }
                big.control = None;
            }
        }
        if big.control.is_none() && big.terminate.is_none() {
            if let Some(map) = big.pending_map.take() {
                if map != big.chan_map {
                    let instant = big
                        .big_counter
                        .wrapping_add(ctx.config.control_instant_offset.into())
                        as u16;
                    big.start_control(BigControlPdu::ChannelMapInd {
                        channel_map: map,
                        instant,
                    });
                }
            }
        }
        if let Some(reason) = big.terminate {
            if !big.final_event && !big.stop_after_event {
                let instant = big.big_counter.wrapping_add(1) as u16;
                big.start_control(BigControlPdu::TerminateInd { reason, instant });
                big.final_event = true;
            }
        }
        big.control_this_event = big.control.is_some();

        let counter = big.big_counter as u16;
        let iso_us = big.layout.iso_interval_us();
        for handle in &big.bis {
            let Some(bis) = self.bis.get_mut(handle.slot) else {
                continue;
            };
            if let Some(test) = bis.test.as_mut() {
                generate_test_sdus(test, &mut bis.mux, &big.params, iso_us, big.anchor_us);
            }
            bis.mux.event_start(big.anchor_us);
            let ev = next_event_channel(counter, bis.channel_id, &big.chan_map);
            bis.event_channel = ev.channel_index;
            bis.hop = ev.hop();
        }

        debug!(
            big_handle = big.handle,
            counter = big.big_counter,
            anchor_us = big.anchor_us,
            control = big.control_this_event,
            "BIG event start"
        );
        big.cursor = 0;
        big.in_event = true;
        self.transmit_next(slot, ctx)
    }

    pub(crate) fn radio_done(
        &mut self,
        slot: BigSlot,
        done: RadioDone,
        ctx: &mut Ctx<'_>,
    ) -> Progress {
        let Some(big) = self.bigs.get_mut(slot.0) else {
            return Progress::Idle;
        };
        if let RadioDone::Rx(_) = done {
            warn!(big_handle = big.handle, "receive completion on a broadcast BIG");
        }
        big.cursor += 1;
        self.transmit_next(slot, ctx)
    }

    /// The event could not run; flush it and move on to the next one
    pub(crate) fn event_missed(&mut self, slot: BigSlot, ctx: &mut Ctx<'_>) {
        if self.bigs.get(slot.0).is_some_and(|b| b.terminate.is_some()) {
            self.free(slot, HciStatus::LocalHostTerminated, ctx);
            return;
        }
        self.skip_event(slot, ctx);
        self.schedule_next(slot, ctx);
    }

    fn transmit_next(&mut self, slot: BigSlot, ctx: &mut Ctx<'_>) -> Progress {
        loop {
            let Some(big) = self.bigs.get_mut(slot.0) else {
                return Progress::Idle;
            };
            let total = big.order.len();

            if big.cursor < total {
                let (position, se) = big.order[big.cursor];
                let Some(bis) = big
                    .bis
                    .get(position)
                    .and_then(|h| self.bis.get_mut(h.slot))
                else {
                    big.cursor += 1;
                    continue;
                };

                let channel = if se == 0 {
                    bis.event_channel
                } else {
                    next_subevent_channel(bis.channel_id, &mut bis.hop, &big.chan_map)
                };
                let index = big.layout.pdu_index(se);
                let pdu = bis.mux.get_pdu(index);
                let mut payload = pdu.payload;
                if let (Some(key), Some(cipher)) = (&big.key, ctx.cipher.as_mut()) {
                    if !payload.is_empty() {
                        let header = header_byte(pdu.llid, big.cssn, big.control_this_event);
                        let cipher_ctx = CipherContext {
                            key,
                            payload_counter: (big.bis_counter + index as u64)
                                & PAYLOAD_COUNTER_MASK,
                            bis_number: bis.number,
                            header,
                        };
                        cipher.encrypt(&cipher_ctx, &mut payload);
                    }
                }
                let bytes = build_pdu(pdu.llid, big.cssn, big.control_this_event, &payload);

                ctx.radio
                    .set_channel(channel, bis.access_address, bis.crc_init);
                let start_us =
                    big.anchor_us + u64::from(big.layout.subevent_offset_us(position, se));
                let transition = if big.cursor + 1 < total || big.control_this_event {
                    Transition::ToTx
                } else {
                    Transition::None
                };
                trace!(
                    bis = bis.number,
                    se,
                    channel,
                    index,
                    len = payload.len(),
                    "BIS subevent"
                );
                match ctx.radio.transmit(TxRequest {
                    start_us,
                    pdu: bytes,
                    transition,
                }) {
                    Ok(()) => return Progress::RadioBusy,
                    Err(err) => {
                        warn!(bis = bis.number, se, %err, "subevent transmit failed");
                        big.cursor += 1;
                    }
                }
            } else if big.cursor == total && big.control_this_event {
                let Some(control) = big.control else {
                    big.cursor += 1;
                    continue;
                };
                let ev = next_event_channel(
                    big.big_counter as u16,
                    big.control_channel_id,
                    &big.chan_map,
                );
                let mut payload = control.encode();
                if let (Some(key), Some(cipher)) = (&big.key, ctx.cipher.as_mut()) {
                    let cipher_ctx = CipherContext {
                        key,
                        payload_counter: big.big_counter,
                        bis_number: 0,
                        header: header_byte(Llid::Control, big.cssn, false),
                    };
                    cipher.encrypt(&cipher_ctx, &mut payload);
                }
                let bytes = build_pdu(Llid::Control, big.cssn, false, &payload);
                ctx.radio.set_channel(
                    ev.channel_index,
                    big.control_access_address,
                    u32::from(big.base_crc_init) << 8,
                );
                let start_us = big.anchor_us + u64::from(big.layout.control_offset_us());
                trace!(channel = ev.channel_index, ?control, "BIG control subevent");
                match ctx.radio.transmit(TxRequest {
                    start_us,
                    pdu: bytes,
                    transition: Transition::None,
                }) {
                    Ok(()) => return Progress::RadioBusy,
                    Err(err) => {
                        warn!(%err, "control subevent transmit failed");
                        big.cursor += 1;
                    }
                }
            } else {
                self.event_done(slot, ctx);
                return Progress::Idle;
            }
        }
    }

    fn event_done(&mut self, slot: BigSlot, ctx: &mut Ctx<'_>) {
        let Some(big) = self.bigs.get_mut(slot.0) else {
            return;
        };
        big.in_event = false;

        if !big.established {
            big.established = true;
            info!(
                big_handle = big.handle,
                sync_delay_us = big.layout.sync_delay_us(),
                "BIG established"
            );
            ctx.events.push(IsoEvent::CreateBigComplete {
                status: HciStatus::Success,
                big_handle: big.handle,
                info: Some(big.created_info()),
            });
        }

        for handle in &big.bis {
            let Some(bis) = self.bis.get_mut(handle.slot) else {
                continue;
            };
            let done = bis.mux.event_done();
            if done.sdus_completed > 0 && bis.test.is_none() {
                ctx.events.push(IsoEvent::NumberOfCompletedPackets {
                    handle: *handle,
                    count: done.sdus_completed as u16,
                });
            }
        }

        if big.terminate.is_some() && (big.final_event || big.stop_after_event) {
            self.free(slot, HciStatus::LocalHostTerminated, ctx);
            return;
        }

        big.advance();
        self.schedule_next(slot, ctx);
    }

    fn skip_event(&mut self, slot: BigSlot, ctx: &mut Ctx<'_>) {
        let Some(big) = self.bigs.get_mut(slot.0) else {
            return;
        };
        for handle in &big.bis {
            let Some(bis) = self.bis.get_mut(handle.slot) else {
                continue;
            };
            let done = bis.mux.event_skipped(big.anchor_us);
            if done.sdus_completed > 0 && bis.test.is_none() {
                ctx.events.push(IsoEvent::NumberOfCompletedPackets {
                    handle: *handle,
                    count: done.sdus_completed as u16,
                });
            }
        }
        big.in_event = false;
        big.advance();
    }

    fn schedule_next(&mut self, slot: BigSlot, ctx: &mut Ctx<'_>) {
        loop {
            let Some(big) = self.bigs.get_mut(slot.0) else {
                return;
            };
            let with_control = big.control.is_some() || big.terminate.is_some();
            let item = ScheduleItem {
                start_us: big
                    .anchor_us
                    .saturating_sub(u64::from(ctx.config.event_lead_us)),
                end_us: big.anchor_us + u64::from(big.layout.event_duration_us(with_control)),
                activity: Activity::BigTx(slot),
            };
            if ctx.scheduler.schedule(item).is_ok() {
                big.sched_failures = 0;
                return;
            }

            big.sched_failures = big.sched_failures.saturating_add(1);
            warn!(
                big_handle = big.handle,
                counter = big.big_counter,
                failures = big.sched_failures,
                "BIG event could not be scheduled, skipping"
            );
            if big.sched_failures >= ctx.config.max_sched_retries {
                self.free(slot, HciStatus::UnspecifiedError, ctx);
                return;
            }
            if big.terminate.is_some() {
                self.free(slot, HciStatus::LocalHostTerminated, ctx);
                return;
            }
            self.skip_event(slot, ctx);
        }
    }

    /// Release a BIG and its BISes and report it to the host
    fn free(&mut self, slot: BigSlot, reason: HciStatus, ctx: &mut Ctx<'_>) {
        ctx.scheduler.cancel(Activity::BigTx(slot));
        let Some(big) = self.bigs.remove(slot.0) else {
            return;
        };
        for handle in &big.bis {
            self.bis.remove(handle.slot);
        }

        if !big.established {
            let status = if reason == HciStatus::LocalHostTerminated {
                HciStatus::OperationCancelledByHost
            } else {
                reason
            };
            ctx.events.push(IsoEvent::CreateBigComplete {
                status,
                big_handle: big.handle,
                info: None,
            });
            if reason != HciStatus::LocalHostTerminated {
                warn!(big_handle = big.handle, ?reason, "BIG creation failed");
                return;
            }
        }
        info!(big_handle = big.handle, ?reason, "BIG terminated");
        ctx.events.push(IsoEvent::TerminateBigComplete {
            big_handle: big.handle,
            reason: reason.code(),
        });
    }
}

fn header_byte(llid: Llid, cssn: u8, cstf: bool) -> u8 {
    BisPduHeader {
        llid,
        cssn,
        cstf,
        length: 0,
    }
    .encode()[0]
}

/// Queue the SDUs a BIS in transmit test mode sends this event
fn generate_test_sdus(
    test: &mut TxTest,
    mux: &mut IsoalMux,
    params: &BigParams,
    iso_us: u32,
    anchor_us: u64,
) {
    let per_event = iso_us.div_ceil(params.sdu_interval_us).max(1);
    let max_sdu = usize::from(params.max_sdu);
    for _ in 0..per_event {
        let len = match test.payload {
            TestPayloadType::ZeroLength => 0,
            TestPayloadType::Maximum => max_sdu,
            TestPayloadType::Variable if max_sdu <= 4 => max_sdu,
            TestPayloadType::Variable => 4 + test.counter as usize % (max_sdu - 3),
        };
        let mut data = vec![0u8; len];
        let counter = test.counter.to_le_bytes();
        let n = len.min(4);
        data[..n].copy_from_slice(&counter[..n]);
        if mux
            .enqueue_sdu(Sdu::new(data, test.counter as u16, anchor_us))
            .is_err()
        {
            trace!(counter = test.counter, "test SDU dropped, queue full");
        }
        test.counter = test.counter.wrapping_add(1);
    }
}
