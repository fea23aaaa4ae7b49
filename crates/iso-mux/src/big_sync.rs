//! BIG sync receiver
//!
//! A sync is requested by the host against a periodic advertising train and
//! waits there for a BIGInfo. Once one arrives the receiver derives the same
//! timing, access addresses and hop sequences as the broadcaster and listens
//! to every subevent of the selected BISes whose payload it still lacks.
//! Receive windows are widened by the combined clock drift since the last
//! anchor confirmed by a received packet.

use iso_protocol::pdu::{instant_reached, split_pdu};
use iso_protocol::timing::{sca_ppm, window_widening_us, MIC_LEN};
use iso_protocol::{
    bis_access_address, channel_identifier, control_access_address, next_event_channel,
    next_subevent_channel, BigControlPdu, BigInfo, ChannelHop, ChannelMap, DecodePdu, Llid,
    PAYLOAD_COUNTER_MASK,
};
use tracing::{debug, info, trace, warn};

use crate::engine::{Ctx, Progress};
use crate::error::IsoError;
use crate::events::{BigSyncInfo, IsoEvent};
use crate::hal::{
    Activity, CipherContext, GroupKey, RadioDone, RxPacket, RxRequest, ScheduleItem, Transition,
};
use crate::hci::{
    BigCreateSync, DataPathDirection, HciStatus, TestCounters, TestPayloadType,
};
use crate::isoal::{IsoalConfig, IsoalDemux, ReceivedSdu, SduStatus};
use crate::layout::EventLayout;
use crate::pool::Pool;
use crate::state::{BisHandle, BisRole, SyncSlot, SyncState};

/// Sync timeout range in units of 10 ms
const SYNC_TIMEOUT_RANGE: std::ops::RangeInclusive<u16> = 0x000A..=0x4000;

#[derive(Debug)]
struct RxTest {
    payload: TestPayloadType,
    counters: TestCounters,
    /// A payload of this event failed its MIC check
    mic_failed: bool,
}

/// One synchronized BIS
#[derive(Debug)]
pub(crate) struct BisRx {
    /// BIS number, 1-based
    number: u8,
    access_address: u32,
    crc_init: u32,
    channel_id: u16,
    event_channel: u8,
    hop: ChannelHop,
    demux: IsoalDemux,
    data_path: bool,
    test: Option<RxTest>,
}

/// Everything learned from the BIGInfo
#[derive(Debug)]
struct Established {
    info: BigInfo,
    layout: EventLayout,
    /// Subevents in air order as (index into `bis`, subevent)
    order: Vec<(usize, u8)>,
    bis: Vec<BisHandle>,
    control_access_address: u32,
    control_channel_id: u16,
    key: Option<GroupKey>,
    chan_map: ChannelMap,
    big_counter: u64,
    bis_counter: u64,
    anchor_us: u64,
    /// Last anchor confirmed by a received packet
    last_anchor_us: u64,
    remote_ppm: u32,
    timeout_us: u64,
    /// Extra window for the first event, the BIGInfo offset is floored
    first_window_us: u32,
    widening_us: u32,
    window_us: u32,
    cursor: usize,
    in_event: bool,
    /// A packet with a valid CRC arrived this event
    received: bool,
    listen_control: bool,
    last_cssn: Option<u8>,
    pending_control: Option<BigControlPdu>,
}

/// One BIG sync
#[derive(Debug)]
pub(crate) struct BigSync {
    handle: u8,
    request: BigCreateSync,
    state: SyncState,
    est: Option<Established>,
}

impl BigSync {
    fn sync_info(&self) -> Option<BigSyncInfo> {
        let est = self.est.as_ref()?;
        Some(BigSyncInfo {
            transport_latency_us: est
                .layout
                .transport_latency_us(est.info.framing, est.info.sdu_interval_us),
            nse: est.info.nse,
            bn: est.info.bn,
            pto: est.info.pto,
            irc: est.info.irc,
            max_pdu: est.info.max_pdu,
            iso_interval: est.info.iso_interval,
            bis_handles: est.bis.clone(),
        })
    }
}

impl Established {
    fn advance(&mut self) {
        self.big_counter = (self.big_counter + 1) & PAYLOAD_COUNTER_MASK;
        self.bis_counter = (self.bis_counter + u64::from(self.info.bn)) & PAYLOAD_COUNTER_MASK;
        self.anchor_us += u64::from(self.layout.iso_interval_us());
    }

    /// Largest acceptable window widening
    fn widening_limit_us(&self) -> u32 {
        if self.info.nse <= 1 {
            self.layout.iso_interval_us() / 2
        } else {
            self.info.sub_interval_us
        }
    }

    /// Widening for the current anchor, capped at half the limit once synchronized
    fn event_widening_us(&self, local_ppm: u32) -> u32 {
        let elapsed = self.anchor_us.saturating_sub(self.last_anchor_us);
        // Windows of adjacent subevents must not overlap
        window_widening_us(elapsed, self.remote_ppm + local_ppm).min(self.widening_limit_us() / 2)
    }
}

/// Receive side of the controller
#[derive(Debug)]
pub struct BigSyncReceiver {
    syncs: Pool<BigSync>,
    bis: Pool<BisRx>,
}

impl BigSyncReceiver {
    pub fn new(config: &crate::config::ControllerConfig) -> Self {
        Self {
            syncs: Pool::with_capacity(config.max_big_syncs),
            bis: Pool::with_capacity(config.max_sync_bis),
        }
    }

    pub fn available_bis(&self) -> usize {
        self.bis.available()
    }

    pub fn sync_count(&self) -> usize {
        self.syncs.len()
    }

    fn find(&self, big_handle: u8) -> Option<SyncSlot> {
        self.syncs.find(|s| s.handle == big_handle).map(SyncSlot)
    }

    pub fn state(&self, big_handle: u8) -> Option<SyncState> {
        let slot = self.find(big_handle)?;
        self.syncs.get(slot.0).map(|s| s.state)
    }

    pub fn slot(&self, big_handle: u8) -> Option<SyncSlot> {
        self.find(big_handle)
    }

    /// Channel map the sync currently follows
    pub fn channel_map(&self, big_handle: u8) -> Option<ChannelMap> {
        let slot = self.find(big_handle)?;
        self.syncs
            .get(slot.0)
            .and_then(|s| s.est.as_ref())
            .map(|e| e.chan_map)
    }

    pub(crate) fn create_sync(
        &mut self,
        cmd: BigCreateSync,
        ctx: &mut Ctx<'_>,
    ) -> Result<SyncSlot, IsoError> {
        if cmd.big_handle > crate::big::MAX_BIG_HANDLE {
            return Err(IsoError::InvalidParameters("BIG_Handle out of range".into()));
        }
        if cmd.bis.is_empty() || cmd.bis.iter().any(|&n| !(1..=31).contains(&n)) {
            return Err(IsoError::InvalidParameters("BIS indices out of range".into()));
        }
        if cmd.mse > 0x1F {
            return Err(IsoError::InvalidParameters("MSE out of range".into()));
        }
        if !SYNC_TIMEOUT_RANGE.contains(&cmd.sync_timeout) {
            return Err(IsoError::InvalidParameters(
                "BIG_Sync_Timeout out of range".into(),
            ));
        }
        if self.find(cmd.big_handle).is_some() {
            return Err(IsoError::CommandDisallowed("BIG handle already in use"));
        }
        if self
            .syncs
            .iter()
            .any(|(_, s)| s.request.sync_handle == cmd.sync_handle)
        {
            return Err(IsoError::CommandDisallowed(
                "periodic sync already has a BIG sync",
            ));
        }
        if self.syncs.iter().any(|(_, s)| {
            matches!(s.state, SyncState::AwaitingBigInfo | SyncState::Syncing)
        }) {
            return Err(IsoError::CommandDisallowed("another BIG sync is pending"));
        }
        if cmd.encryption && ctx.cipher.is_none() {
            return Err(IsoError::UnsupportedFeature("encryption"));
        }
        if self.syncs.available() == 0 {
            return Err(IsoError::ResourcesExhausted("BIG sync"));
        }
        if self.bis.available() < cmd.bis.len() {
            return Err(IsoError::ResourcesExhausted("BIS"));
        }

        let big_handle = cmd.big_handle;
        let sync_handle = cmd.sync_handle;
        let slot = self
            .syncs
            .insert(BigSync {
                handle: big_handle,
                request: cmd,
                state: SyncState::AwaitingBigInfo,
                est: None,
            })
            .map_err(|_| IsoError::ResourcesExhausted("BIG sync"))?;
        info!(big_handle, sync_handle, "BIG sync requested");
        Ok(SyncSlot(slot))
    }

    /// A BIGInfo arrived on periodic sync `sync_handle`
    ///
    /// Only a sync still waiting for its BIGInfo takes it. Any failure ends
    /// that sync attempt with an `LE_BIG_Sync_Established` error event.
    pub(crate) fn biginfo_received(
        &mut self,
        sync_handle: u16,
        data: &[u8],
        pa_anchor_us: u64,
        sca: u8,
        ctx: &mut Ctx<'_>,
    ) -> Result<(), IsoError> {
        let Some(slot) = self
            .syncs
            .find(|s| s.request.sync_handle == sync_handle && s.state == SyncState::AwaitingBigInfo)
            .map(SyncSlot)
        else {
            trace!(sync_handle, "BIGInfo ignored, no sync waiting");
            return Ok(());
        };

        match self.accept_biginfo(slot, data, pa_anchor_us, sca, ctx) {
            Ok(()) => {
                self.schedule_next(slot, ctx);
                Ok(())
            }
            Err(err) => {
                let big_handle = self.syncs.get(slot.0).map(|s| s.handle).unwrap_or(0);
                warn!(big_handle, %err, "BIG sync failed");
                ctx.events.push(IsoEvent::BigSyncEstablished {
                    status: err.status(),
                    big_handle,
                    info: None,
                });
                self.free(slot, ctx);
                Err(err)
            }
        }
    }

    fn accept_biginfo(
        &mut self,
        slot: SyncSlot,
        data: &[u8],
        pa_anchor_us: u64,
        sca: u8,
        ctx: &mut Ctx<'_>,
    ) -> Result<(), IsoError> {
        let Some(sync) = self.syncs.get_mut(slot.0) else {
            return Err(IsoError::UnknownSync(0));
        };
        let requested = sync.request.encryption;
        let advertised = data.len() == iso_protocol::biginfo::BIGINFO_ENCRYPTED_LEN;
        let known_len = advertised || data.len() == iso_protocol::biginfo::BIGINFO_LEN;
        if known_len && requested != advertised {
            return Err(IsoError::EncryptionModeError {
                requested,
                advertised,
            });
        }
        let info = BigInfo::decode(data)?;
        if info.nse % info.bn != 0 || info.irc * info.bn > info.nse {
            return Err(IsoError::InvalidParameters(format!(
                "inconsistent BIGInfo NSE {} BN {} IRC {}",
                info.nse, info.bn, info.irc
            )));
        }

        let mut numbers: Vec<u8> = Vec::with_capacity(sync.request.bis.len());
        for &n in &sync.request.bis {
            if n <= info.num_bis && !numbers.contains(&n) {
                numbers.push(n);
            }
        }
        if numbers.is_empty() {
            return Err(IsoError::InvalidParameters(
                "none of the requested BISes are in the BIG".into(),
            ));
        }
        if self.bis.available() < numbers.len() {
            return Err(IsoError::ResourcesExhausted("BIS"));
        }

        let mic = if info.is_encrypted() { MIC_LEN } else { 0 };
        let layout = EventLayout {
            num_bis: info.num_bis,
            nse: info.nse,
            bn: info.bn,
            irc: info.irc,
            pto: info.pto,
            phy: info.phy,
            iso_interval: info.iso_interval,
            sub_interval_us: info.sub_interval_us,
            bis_spacing_us: info.bis_spacing_us,
            mpt_us: info.phy.pdu_air_time_us(usize::from(info.max_pdu) + mic),
            payload_overhead: mic,
        };
        let isoal = IsoalConfig {
            max_pdu: info.max_pdu,
            iso_interval_us: layout.iso_interval_us(),
            sdu_interval_us: info.sdu_interval_us,
            bn: info.bn,
            pto: info.pto,
            framing: info.framing,
            framing_mode: info.framing_mode,
            max_sdu_queue: ctx.config.max_sdu_queue,
        };
        let demuxes = numbers
            .iter()
            .map(|_| IsoalDemux::new(isoal, info.nse))
            .collect::<Result<Vec<_>, _>>()?;

        let remote_ppm = sca_ppm(sca);
        let offset_us = info.offset_us();
        let iso_us = u64::from(layout.iso_interval_us());
        let timeout_us = (u64::from(sync.request.sync_timeout) * 10_000).max(6 * iso_us);

        let control_aa = control_access_address(info.seed_access_address);
        let key = info.encryption.map(|e| GroupKey {
            broadcast_code: sync.request.broadcast_code,
            giv: e.giv,
            gskd: e.gskd,
        });
        let mut est = Established {
            layout,
            order: Vec::new(),
            bis: Vec::with_capacity(numbers.len()),
            control_access_address: control_aa,
            control_channel_id: channel_identifier(control_aa),
            key,
            chan_map: info.channel_map,
            big_counter: info.payload_count / u64::from(info.bn),
            bis_counter: info.payload_count,
            anchor_us: pa_anchor_us + u64::from(offset_us),
            last_anchor_us: pa_anchor_us,
            remote_ppm,
            timeout_us,
            first_window_us: info.offset_units.us(),
            widening_us: 0,
            window_us: 0,
            cursor: 0,
            in_event: false,
            received: false,
            listen_control: false,
            last_cssn: None,
            pending_control: None,
            info,
        };

        let widening = window_widening_us(
            u64::from(offset_us),
            est.remote_ppm + ctx.config.local_sca_ppm,
        );
        let limit = est.widening_limit_us();
        if 2 * widening > limit {
            return Err(IsoError::WindowTooWide {
                widening_us: widening,
                limit_us: limit,
            });
        }

        let positions: Vec<usize> = numbers.iter().map(|&n| usize::from(n) - 1).collect();
        est.order = est
            .layout
            .subevent_order(&positions)
            .into_iter()
            .filter_map(|(pos, se)| positions.iter().position(|&p| p == pos).map(|i| (i, se)))
            .collect();

        let base_crc_init = u32::from(est.info.base_crc_init) << 8;
        for (&number, demux) in numbers.iter().zip(demuxes) {
            let access_address = bis_access_address(est.info.seed_access_address, number);
            let bis = BisRx {
                number,
                access_address,
                crc_init: base_crc_init | u32::from(number),
                channel_id: channel_identifier(access_address),
                event_channel: 0,
                hop: ChannelHop::default(),
                demux,
                data_path: false,
                test: None,
            };
            match self.bis.insert(bis) {
                Ok(h) => est.bis.push(BisHandle {
                    role: BisRole::Synchronized,
                    slot: h,
                }),
                Err(_) => {
                    for h in &est.bis {
                        self.bis.remove(h.slot);
                    }
                    return Err(IsoError::ResourcesExhausted("BIS"));
                }
            }
        }

        info!(
            big_handle = sync.handle,
            bis = ?numbers,
            counter = est.big_counter,
            anchor_us = est.anchor_us,
            encrypted = est.key.is_some(),
            "BIGInfo accepted, syncing"
        );
        sync.est = Some(est);
        sync.state = SyncState::Syncing;
        Ok(())
    }

    pub(crate) fn terminate_sync(&mut self, big_handle: u8, ctx: &mut Ctx<'_>) -> Result<SyncSlot, IsoError> {
        let slot = self
            .find(big_handle)
            .ok_or(IsoError::UnknownSync(big_handle))?;
        if let Some(sync) = self.syncs.get(slot.0) {
            if matches!(sync.state, SyncState::AwaitingBigInfo | SyncState::Syncing) {
                ctx.events.push(IsoEvent::BigSyncEstablished {
                    status: HciStatus::OperationCancelledByHost,
                    big_handle,
                    info: None,
                });
            }
            info!(big_handle, state = ?sync.state, "BIG sync terminated by host");
        }
        self.free(slot, ctx);
        Ok(slot)
    }

    fn bis_mut(&mut self, handle: BisHandle) -> Result<&mut BisRx, IsoError> {
        if handle.role != BisRole::Synchronized {
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
        if direction != DataPathDirection::Output {
            return Err(IsoError::InvalidParameters(
                "synchronized BIS only has an output path".into(),
            ));
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
        if direction != DataPathDirection::Output || !bis.data_path {
            return Err(IsoError::CommandDisallowed("no such data path"));
        }
        bis.data_path = false;
        Ok(())
    }

    pub(crate) fn receive_test(
        &mut self,
        handle: BisHandle,
        payload: TestPayloadType,
    ) -> Result<(), IsoError> {
        let bis = self.bis_mut(handle)?;
        if bis.data_path || bis.test.is_some() {
            return Err(IsoError::CommandDisallowed("BIS is carrying host data"));
        }
        bis.test = Some(RxTest {
            payload,
            counters: TestCounters::default(),
            mic_failed: false,
        });
        Ok(())
    }

    pub(crate) fn read_test_counters(&mut self, handle: BisHandle) -> Result<TestCounters, IsoError> {
        let bis = self.bis_mut(handle)?;
        bis.test
            .as_ref()
            .map(|t| t.counters)
            .ok_or(IsoError::CommandDisallowed("BIS is not in test mode"))
    }

    pub(crate) fn test_end(&mut self, handle: BisHandle) -> Result<TestCounters, IsoError> {
        let bis = self.bis_mut(handle)?;
        bis.test
            .take()
            .map(|t| t.counters)
            .ok_or(IsoError::CommandDisallowed("BIS is not in test mode"))
    }

    /// Scheduler reached the sync's reservation
    pub(crate) fn event_start(&mut self, slot: SyncSlot, ctx: &mut Ctx<'_>) -> Progress {
        let Some(sync) = self.syncs.get_mut(slot.0) else {
            warn!(?slot, "event for a freed BIG sync");
            return Progress::Idle;
        };
        let Some(est) = sync.est.as_mut() else {
            return Progress::Idle;
        };

        if let Some(control) = est.pending_control {
            if instant_reached(est.big_counter, control.instant()) {
                est.pending_control = None;
                match control {
                    BigControlPdu::ChannelMapInd { channel_map, .. } => {
                        est.chan_map = channel_map;
                        info!(
                            big_handle = sync.handle,
                            used = channel_map.used_count(),
                            "channel map applied"
                        );
                    }
                    BigControlPdu::TerminateInd { reason, .. } => {
                        info!(big_handle = sync.handle, reason, "BIG terminated by broadcaster");
                        self.lose(slot, reason, ctx);
                        return Progress::Idle;
                    }
                }
            }
        }

        est.widening_us = est.event_widening_us(ctx.config.local_sca_ppm);
        est.window_us = 2 * est.widening_us + est.first_window_us + ctx.config.rx_window_margin_us;

        let counter = est.big_counter as u16;
        for handle in &est.bis {
            let Some(bis) = self.bis.get_mut(handle.slot) else {
                continue;
            };
            bis.demux.event_start(est.anchor_us);
            if let Some(test) = bis.test.as_mut() {
                test.mic_failed = false;
            }
            let ev = next_event_channel(counter, bis.channel_id, &est.chan_map);
            bis.event_channel = ev.channel_index;
            bis.hop = ev.hop();
        }

        debug!(
            big_handle = sync.handle,
            counter = est.big_counter,
            anchor_us = est.anchor_us,
            widening_us = est.widening_us,
            "BIG sync event start"
        );
        est.cursor = 0;
        est.in_event = true;
        est.received = false;
        est.listen_control = false;
        self.receive_next(slot, ctx)
    }

    pub(crate) fn radio_done(
        &mut self,
        slot: SyncSlot,
        done: RadioDone,
        ctx: &mut Ctx<'_>,
    ) -> Progress {
        match done {
            RadioDone::Rx(Ok(packet)) => self.packet_received(slot, packet, ctx),
            RadioDone::Rx(Err(err)) => trace!(?slot, %err, "subevent missed"),
            RadioDone::Tx { .. } => warn!(?slot, "transmit completion on a BIG sync"),
        }
        let Some(est) = self.syncs.get_mut(slot.0).and_then(|s| s.est.as_mut()) else {
            return Progress::Idle;
        };
        est.cursor += 1;
        self.receive_next(slot, ctx)
    }

    /// The event could not run; close it as if nothing was received
    pub(crate) fn event_missed(&mut self, slot: SyncSlot, ctx: &mut Ctx<'_>) {
        if self.close_event(slot, ctx) {
            self.schedule_next(slot, ctx);
        }
    }

    fn receive_next(&mut self, slot: SyncSlot, ctx: &mut Ctx<'_>) -> Progress {
        loop {
            let Some(sync) = self.syncs.get_mut(slot.0) else {
                return Progress::Idle;
            };
            let mse = sync.request.mse;
            let Some(est) = sync.est.as_mut() else {
                return Progress::Idle;
            };
            let total = est.order.len();

            let (channel, access_address, crc_init, offset_us) = if est.cursor < total {
                let (i, se) = est.order[est.cursor];
                let Some(bis) = est.bis.get(i).and_then(|h| self.bis.get_mut(h.slot)) else {
                    est.cursor += 1;
                    continue;
                };
                // the hop state advances even when the subevent is skipped
                let channel = if se == 0 {
                    bis.event_channel
                } else {
                    next_subevent_channel(bis.channel_id, &mut bis.hop, &est.chan_map)
                };
                let index = est.layout.pdu_index(se);
                if (mse != 0 && se >= mse) || bis.demux.has_pdu(index) {
                    est.cursor += 1;
                    continue;
                }
                let offset = est
                    .layout
                    .subevent_offset_us(usize::from(bis.number) - 1, se);
                (channel, bis.access_address, bis.crc_init, offset)
            } else if est.cursor == total && est.listen_control {
                let ev = next_event_channel(
                    est.big_counter as u16,
                    est.control_channel_id,
                    &est.chan_map,
                );
                (
                    ev.channel_index,
                    est.control_access_address,
                    u32::from(est.info.base_crc_init) << 8,
                    est.layout.control_offset_us(),
                )
            } else {
                self.event_done(slot, ctx);
                return Progress::Idle;
            };

            ctx.radio.set_channel(channel, access_address, crc_init);
            ctx.radio.enable_wait_for_response(est.window_us);
            let request = RxRequest {
                start_us: (est.anchor_us + u64::from(offset_us))
                    .saturating_sub(u64::from(est.widening_us)),
                window_us: est.window_us,
                transition: if est.cursor + 1 < total {
                    Transition::ToRx
                } else {
                    Transition::None
                },
            };
            trace!(cursor = est.cursor, channel, "BIS receive window");
            match ctx.radio.receive(request) {
                Ok(()) => return Progress::RadioBusy,
                Err(err) => {
                    warn!(cursor = est.cursor, %err, "subevent receive failed");
                    est.cursor += 1;
                }
            }
        }
    }

    fn packet_received(&mut self, slot: SyncSlot, packet: RxPacket, ctx: &mut Ctx<'_>) {
        let Some(sync) = self.syncs.get_mut(slot.0) else {
            return;
        };
        let big_handle = sync.handle;
        let Some(est) = sync.est.as_mut() else {
            return;
        };
        if !packet.crc_ok {
            trace!(big_handle, cursor = est.cursor, "CRC error");
            return;
        }

        let total = est.order.len();
        let control = est.cursor >= total;
        let expected_offset = if control {
            est.layout.control_offset_us()
        } else {
            let (i, se) = est.order[est.cursor];
            let number = est
                .bis
                .get(i)
                .and_then(|h| self.bis.get(h.slot))
                .map_or(1, |b| b.number);
            est.layout.subevent_offset_us(usize::from(number) - 1, se)
        };
        if !est.received {
            est.received = true;
            let anchor = packet.timestamp_us.saturating_sub(u64::from(expected_offset));
            if anchor != est.anchor_us {
                trace!(
                    big_handle,
                    expected = est.anchor_us,
                    actual = anchor,
                    "anchor corrected"
                );
            }
            est.anchor_us = anchor;
            est.last_anchor_us = anchor;
            est.first_window_us = 0;
        }

        let (header, payload) = match split_pdu(&packet.pdu) {
            Ok(parts) => parts,
            Err(err) => {
                warn!(big_handle, %err, "malformed BIS PDU");
                return;
            }
        };
        let header_byte = packet.pdu[0];
        let mut payload = payload.to_vec();

        if control {
            if header.llid != Llid::Control {
                warn!(big_handle, llid = ?header.llid, "data PDU on the control link");
                return;
            }
            if let (Some(key), Some(cipher)) = (&est.key, ctx.cipher.as_mut()) {
                let cipher_ctx = CipherContext {
                    key,
                    payload_counter: est.big_counter,
                    bis_number: 0,
                    header: header_byte,
                };
                if cipher.decrypt(&cipher_ctx, &mut payload).is_err() {
                    warn!(big_handle, "MIC failure on control PDU");
                    return;
                }
            }
            match BigControlPdu::decode(&payload) {
                Ok(pdu) => {
                    debug!(big_handle, cssn = header.cssn, ?pdu, "control PDU received");
                    est.pending_control = Some(pdu);
                    est.last_cssn = Some(header.cssn);
                }
                Err(err) => warn!(big_handle, %err, "malformed control PDU"),
            }
            return;
        }

        if header.cstf && est.last_cssn != Some(header.cssn) {
            est.listen_control = true;
        }
        if header.llid == Llid::Control {
            warn!(big_handle, "control PDU on a BIS");
            return;
        }

        let (i, se) = est.order[est.cursor];
        let index = est.layout.pdu_index(se);
        let Some(bis) = est.bis.get(i).and_then(|h| self.bis.get_mut(h.slot)) else {
            return;
        };
        if !payload.is_empty() {
            if let (Some(key), Some(cipher)) = (&est.key, ctx.cipher.as_mut()) {
                let cipher_ctx = CipherContext {
                    key,
                    payload_counter: (est.bis_counter + index as u64) & PAYLOAD_COUNTER_MASK,
                    bis_number: bis.number,
                    header: header_byte,
                };
                if cipher.decrypt(&cipher_ctx, &mut payload).is_err() {
                    warn!(big_handle, bis = bis.number, index, "MIC failure");
                    if let Some(test) = bis.test.as_mut() {
                        test.mic_failed = true;
                    }
                    return;
                }
            }
        }
        trace!(bis = bis.number, se, index, len = payload.len(), "BIS PDU received");
        if let Err(err) = bis.demux.put_pdu(index, &payload, header.llid) {
            warn!(big_handle, bis = bis.number, %err, "PDU rejected by ISOAL");
        }
    }

    fn event_done(&mut self, slot: SyncSlot, ctx: &mut Ctx<'_>) {
        if self.close_event(slot, ctx) {
            self.schedule_next(slot, ctx);
        }
    }

    /// Reassemble the event, advance to the next one and check the sync
    /// timeout; false if the sync was lost
    fn close_event(&mut self, slot: SyncSlot, ctx: &mut Ctx<'_>) -> bool {
        let Some(sync) = self.syncs.get_mut(slot.0) else {
            return false;
        };
        let Some(est) = sync.est.as_mut() else {
            return false;
        };
        let was_in_event = std::mem::replace(&mut est.in_event, false);
        let received = was_in_event && est.received;

        if received && sync.state == SyncState::Syncing {
            sync.state = SyncState::Synchronized;
            let info = sync.sync_info();
            info!(big_handle = sync.handle, "BIG sync established");
            ctx.events.push(IsoEvent::BigSyncEstablished {
                status: HciStatus::Success,
                big_handle: sync.handle,
                info,
            });
        }
        let synchronized = sync.state == SyncState::Synchronized;
        let Some(est) = sync.est.as_mut() else {
            return false;
        };

        for handle in &est.bis {
            let Some(bis) = self.bis.get_mut(handle.slot) else {
                continue;
            };
            if !was_in_event {
                bis.demux.event_start(est.anchor_us);
            }
            let sdus = bis.demux.event_done();
            if let Some(test) = bis.test.as_mut() {
                count_test_sdus(test, &sdus, est.info.max_sdu);
            } else if bis.data_path && synchronized {
                ctx.events.extend(sdus.into_iter().map(|sdu| IsoEvent::SduReceived {
                    handle: *handle,
                    sdu,
                }));
            }
        }

        est.advance();
        if est.anchor_us.saturating_sub(est.last_anchor_us) >= est.timeout_us {
            warn!(
                big_handle = sync.handle,
                last_anchor_us = est.last_anchor_us,
                "BIG sync timeout"
            );
            self.lose(slot, HciStatus::ConnectionTimeout.code(), ctx);
            return false;
        }
        true
    }

    fn schedule_next(&mut self, slot: SyncSlot, ctx: &mut Ctx<'_>) {
        loop {
            let Some(est) = self.syncs.get_mut(slot.0).and_then(|s| s.est.as_mut()) else {
                return;
            };
            let widening = u64::from(est.event_widening_us(ctx.config.local_sca_ppm));
            let item = ScheduleItem {
                start_us: est
                    .anchor_us
                    .saturating_sub(widening + u64::from(ctx.config.event_lead_us)),
                end_us: est.anchor_us
                    + u64::from(est.layout.event_duration_us(true))
                    + widening
                    + u64::from(est.first_window_us),
                activity: Activity::BigRx(slot),
            };
            if ctx.scheduler.schedule(item).is_ok() {
                return;
            }
            warn!(
                ?slot,
                counter = est.big_counter,
                "BIG sync event could not be scheduled, skipping"
            );
            if !self.close_event(slot, ctx) {
                return;
            }
        }
    }

    /// End a sync that stopped on its own
    fn lose(&mut self, slot: SyncSlot, reason: u8, ctx: &mut Ctx<'_>) {
        let Some(sync) = self.syncs.get_mut(slot.0) else {
            return;
        };
        if sync.state == SyncState::Synchronized {
            info!(big_handle = sync.handle, reason, "BIG sync lost");
            ctx.events.push(IsoEvent::BigSyncLost {
                big_handle: sync.handle,
                reason,
            });
        } else {
            info!(big_handle = sync.handle, "BIG sync could not be established");
            ctx.events.push(IsoEvent::BigSyncEstablished {
                status: HciStatus::ConnectionFailedToBeEstablished,
                big_handle: sync.handle,
                info: None,
            });
        }
        sync.state = SyncState::Lost;
        self.free(slot, ctx);
    }

    fn free(&mut self, slot: SyncSlot, ctx: &mut Ctx<'_>) {
        ctx.scheduler.cancel(Activity::BigRx(slot));
        let Some(sync) = self.syncs.remove(slot.0) else {
            return;
        };
        if let Some(est) = sync.est {
            for handle in &est.bis {
                self.bis.remove(handle.slot);
            }
        }
        debug!(big_handle = sync.handle, "BIG sync freed");
    }
}

/// Update receive test counters with the SDUs of one event
fn count_test_sdus(test: &mut RxTest, sdus: &[ReceivedSdu], max_sdu: u16) {
    let max_sdu = usize::from(max_sdu);
    for sdu in sdus {
        let counters = &mut test.counters;
        match sdu.status {
            SduStatus::Valid => {
                let len_ok = match test.payload {
                    TestPayloadType::ZeroLength => sdu.data.is_empty(),
                    TestPayloadType::Maximum => sdu.data.len() == max_sdu,
                    TestPayloadType::Variable => sdu.data.len() >= 4.min(max_sdu),
                };
                if len_ok {
                    counters.received += 1;
                } else {
                    counters.failed += 1;
                }
            }
            SduStatus::Lost if test.mic_failed => counters.failed += 1,
            SduStatus::Lost => counters.missed += 1,
            SduStatus::Errors => counters.failed += 1,
        }
    }
}
