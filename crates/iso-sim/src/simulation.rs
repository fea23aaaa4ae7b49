//! Two-controller broadcast simulation
//!
//! A broadcaster and a receiver controller share one simulated air. Time
//! advances from one occurrence to the next: a reservation starting, a
//! transmission ending or a receive window closing. Transmissions are
//! resolved before receptions that fall on the same instant, so a packet is
//! always on the air before anyone listens for it.
//!
//! # Example
//!
//! ```rust,ignore
//! use iso_sim::{BroadcastSimulation, SimConfig};
//!
//! let mut sim = BroadcastSimulation::new(SimConfig::default());
//! sim.broadcaster_mut().create_big(&create_big, sim.now_us())?;
//! sim.run_until(5_000);
//! sim.receiver_mut().big_create_sync(create_sync)?;
//! sim.deliver_biginfo(1, 1)?;
//! sim.run_until(100_000);
//! for event in sim.take_receiver_events() {
//!     println!("{event:?}");
//! }
//! ```

use iso_mux::{
    ControllerConfig, IsoController, IsoError, IsoEvent, RadioDone, RxError, RxPacket,
};
use iso_protocol::Phy;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::radio::{AirPacket, PendingOp, VirtualRadio};
use crate::scheduler::VirtualScheduler;

/// Controller type used on both sides of the simulation
pub type SimController = IsoController<VirtualRadio, VirtualScheduler>;

/// Packets older than this are dropped from the air
const AIR_RETENTION_US: u64 = 1_000_000;

/// Which packets the receiver fails to catch
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub enum LossModel {
    /// Every packet arrives
    #[default]
    None,
    /// Nothing arrives
    DropAll,
    /// Packets starting inside `[start_us, end_us)` are lost
    Window { start_us: u64, end_us: u64 },
    /// Each packet is lost with this probability
    Probability(f64),
}

/// Configuration of a [`BroadcastSimulation`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimConfig {
    /// PHY of both virtual radios
    pub phy: Phy,
    pub broadcaster: ControllerConfig,
    pub receiver: ControllerConfig,
    /// Broadcaster sleep clock accuracy field reported with each BIGInfo
    pub broadcaster_sca: u8,
    /// Seed of both controllers and the loss model
    pub seed: u64,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            phy: Phy::Le2M,
            broadcaster: ControllerConfig::default(),
            receiver: ControllerConfig::default(),
            broadcaster_sca: 0,
            seed: 1,
        }
    }
}

/// Side of the simulation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Node {
    Broadcaster,
    Receiver,
}

#[derive(Debug)]
struct SimNode {
    controller: SimController,
    events: Vec<IsoEvent>,
}

impl SimNode {
    fn new(config: ControllerConfig, phy: Phy, seed: u64) -> Self {
        Self {
            controller: IsoController::with_seed(
                config,
                VirtualRadio::new(phy),
                VirtualScheduler::new(),
                seed,
            ),
            events: Vec::new(),
        }
    }
}

/// What happens next, in resolution order for equal times
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Occurrence {
    TxDone,
    Reservation,
    RxDone,
}

/// A broadcaster and a receiver on a shared simulated air
#[derive(Debug)]
pub struct BroadcastSimulation {
    now_us: u64,
    broadcaster: SimNode,
    receiver: SimNode,
    air: Vec<AirPacket>,
    loss: LossModel,
    rng: StdRng,
    broadcaster_sca: u8,
    lost_packets: usize,
}

impl BroadcastSimulation {
    pub fn new(config: SimConfig) -> Self {
        Self {
            now_us: 0,
            broadcaster: SimNode::new(config.broadcaster, config.phy, config.seed),
            receiver: SimNode::new(config.receiver, config.phy, config.seed.wrapping_add(1)),
            air: Vec::new(),
            loss: LossModel::None,
            rng: StdRng::seed_from_u64(config.seed),
            broadcaster_sca: config.broadcaster_sca,
            lost_packets: 0,
        }
    }

    pub fn now_us(&self) -> u64 {
        self.now_us
    }

    pub fn broadcaster(&self) -> &SimController {
        &self.broadcaster.controller
    }

    pub fn broadcaster_mut(&mut self) -> &mut SimController {
        &mut self.broadcaster.controller
    }

    pub fn receiver(&self) -> &SimController {
        &self.receiver.controller
    }

    pub fn receiver_mut(&mut self) -> &mut SimController {
        &mut self.receiver.controller
    }

    pub fn set_loss(&mut self, loss: LossModel) {
        self.loss = loss;
    }

    /// Packets the loss model has dropped so far
    pub fn lost_packets(&self) -> usize {
        self.lost_packets
    }

    /// Packets currently on the air log
    pub fn air(&self) -> &[AirPacket] {
        &self.air
    }

    /// Events raised by one side since the last call
    pub fn take_events(&mut self, node: Node) -> Vec<IsoEvent> {
        self.collect();
        std::mem::take(&mut self.node_mut(node).events)
    }

    pub fn take_broadcaster_events(&mut self) -> Vec<IsoEvent> {
        self.take_events(Node::Broadcaster)
    }

    pub fn take_receiver_events(&mut self) -> Vec<IsoEvent> {
        self.take_events(Node::Receiver)
    }

    /// Carry the BIGInfo of `big_handle` to the receiver's periodic sync
    /// `sync_handle`, as if a periodic advertising packet started now
    pub fn deliver_biginfo(&mut self, big_handle: u8, sync_handle: u16) -> Result<(), IsoError> {
        let pa_time_us = self.now_us;
        let data = self.broadcaster.controller.big_info(big_handle, pa_time_us)?;
        debug!(big_handle, sync_handle, pa_time_us, "BIGInfo delivered");
        let sca = self.broadcaster_sca;
        let receiver = &mut self.receiver.controller;
        receiver.radio_mut().set_time(pa_time_us);
        let result = receiver.biginfo_received(sync_handle, &data, pa_time_us, sca);
        self.collect();
        result
    }

    /// Run every occurrence up to and including `time_us`
    pub fn run_until(&mut self, time_us: u64) {
        while let Some((at, _, _)) = self.next_occurrence() {
            if at > time_us {
                break;
            }
            self.step();
        }
        self.now_us = self.now_us.max(time_us);
        self.collect();
    }

    /// Advance by `duration_us`
    pub fn run_for(&mut self, duration_us: u64) {
        self.run_until(self.now_us + duration_us);
    }

    /// Resolve the next occurrence; false when nothing is left to do
    pub fn step(&mut self) -> bool {
        let Some((at, occurrence, node)) = self.next_occurrence() else {
            return false;
        };
        self.now_us = at;
        trace!(at, ?occurrence, ?node, "simulation step");

        match occurrence {
            Occurrence::TxDone => {
                let controller = &mut self.node_mut(node).controller;
                controller.radio_mut().set_time(at);
                if let Some(PendingOp::Tx { end_us }) = controller.radio_mut().take_pending() {
                    controller.radio_done(RadioDone::Tx { end_us });
                }
            }
            Occurrence::Reservation => {
                let controller = &mut self.node_mut(node).controller;
                controller.radio_mut().set_time(at);
                if let Some(item) = controller.scheduler_mut().pop_next() {
                    controller.run_activity(item.activity);
                }
            }
            Occurrence::RxDone => {
                let result = self.resolve_rx(node);
                let controller = &mut self.node_mut(node).controller;
                controller.radio_mut().set_time(at);
                controller.radio_done(RadioDone::Rx(result));
            }
        }
        self.collect();
        true
    }

    fn node(&self, node: Node) -> &SimNode {
        match node {
            Node::Broadcaster => &self.broadcaster,
            Node::Receiver => &self.receiver,
        }
    }

    fn node_mut(&mut self, node: Node) -> &mut SimNode {
        match node {
            Node::Broadcaster => &mut self.broadcaster,
            Node::Receiver => &mut self.receiver,
        }
    }

    /// Move transmitted packets onto the air and gather raised events
    fn collect(&mut self) {
        for node in [&mut self.broadcaster, &mut self.receiver] {
            let sent = node.controller.radio_mut().take_transmitted();
            self.air.extend(sent);
            let events = node.controller.drain_events();
            node.events.extend(events);
        }
        let horizon = self.now_us.saturating_sub(AIR_RETENTION_US);
        self.air.retain(|p| p.end_us >= horizon);
    }

    fn next_occurrence(&self) -> Option<(u64, Occurrence, Node)> {
        let mut best: Option<(u64, Occurrence, Node)> = None;
        for node in [Node::Broadcaster, Node::Receiver] {
            let controller = &self.node(node).controller;
            let mut candidates = Vec::with_capacity(2);
            if let Some(op) = controller.radio().pending() {
                candidates.push(match op {
                    PendingOp::Tx { end_us } => (*end_us, Occurrence::TxDone),
                    PendingOp::Rx { .. } => (self.rx_due_us(op), Occurrence::RxDone),
                });
            }
            if let Some(start_us) = controller.scheduler().next_start() {
                candidates.push((start_us, Occurrence::Reservation));
            }
            for (at, occurrence) in candidates {
                let candidate = (at.max(self.now_us), occurrence, node);
                let earlier = best.map_or(true, |(b_at, b_occ, _)| {
                    (candidate.0, candidate.1) < (b_at, b_occ)
                });
                if earlier {
                    best = Some(candidate);
                }
            }
        }
        best
    }

    /// Packet a pending receive would catch, ignoring losses
    fn caught(&self, rx: &PendingOp) -> Option<&AirPacket> {
        let PendingOp::Rx {
            channel,
            access_address,
            start_us,
            ..
        } = rx
        else {
            return None;
        };
        let window_end = rx.window_end_us()?;
        self.air
            .iter()
            .filter(|p| p.channel == *channel && p.access_address == *access_address)
            .filter(|p| p.start_us >= *start_us && p.start_us <= window_end)
            .min_by_key(|p| p.start_us)
    }

    /// When a pending receive completes: at the end of the caught packet or
    /// when its window closes, whichever is later
    fn rx_due_us(&self, rx: &PendingOp) -> u64 {
        let window_end = rx.window_end_us().unwrap_or(self.now_us);
        match self.caught(rx) {
            Some(packet) => packet.end_us.max(window_end),
            None => window_end,
        }
    }

    fn resolve_rx(&mut self, node: Node) -> Result<RxPacket, RxError> {
        let Some(rx) = self.node_mut(node).controller.radio_mut().take_pending() else {
            return Err(RxError::Aborted);
        };
        let PendingOp::Rx { crc_init, .. } = rx else {
            return Err(RxError::Aborted);
        };
        let Some(packet) = self.caught(&rx).cloned() else {
            return Err(RxError::Timeout);
        };
        if self.dropped(&packet) {
            self.lost_packets += 1;
            trace!(channel = packet.channel, start_us = packet.start_us, "packet lost");
            return Err(RxError::Timeout);
        }
        Ok(RxPacket {
            crc_ok: packet.crc_init == crc_init,
            timestamp_us: packet.start_us,
            pdu: packet.pdu,
        })
    }

    fn dropped(&mut self, packet: &AirPacket) -> bool {
        match self.loss {
            LossModel::None => false,
            LossModel::DropAll => true,
            LossModel::Window { start_us, end_us } => {
                packet.start_us >= start_us && packet.start_us < end_us
            }
            LossModel::Probability(p) => self.rng.gen_bool(p.clamp(0.0, 1.0)),
        }
    }
}
