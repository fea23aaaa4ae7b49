//! End-to-end broadcast tests
//!
//! A broadcaster and a receiver run against each other on the simulated
//! air. These tests verify:
//! - SDU delivery for unframed, framed and pre-transmitted BIGs
//! - Sync loss and re-synchronization
//! - Channel map updates at their instant
//! - BIG termination seen by the receiver
//! - Scheduling conflicts and ISO test mode
//! - Encrypted BIGs

use std::ops::Range;

use iso_mux::{
    BigCreateSync, BigState, BisHandle, CipherContext, CreateBig, CreateBigTest, DataPathDirection,
    HciStatus, IsoCipher, IsoEvent, MicFailure, Packing, ReceivedSdu, SduStatus,
    SetupIsoDataPath, SyncState, TerminateBig, TestCounters, TestPayloadType,
};
use iso_protocol::{
    bis_access_address, channel_identifier, next_event_channel, BigInfo, ChannelMap, DecodePdu,
    Framing, Phy,
};
use iso_sim::{BroadcastSimulation, LossModel, RadioOp, SimConfig};

// ============================================================================
// Helper Functions
// ============================================================================

mod helpers {
    use super::*;

    pub const BIG_HANDLE: u8 = 1;
    pub const SYNC_HANDLE: u16 = 0x0040;
    /// How far ahead of an anchor each SDU is handed to the broadcaster
    pub const SDU_LEAD_US: u64 = 5_250;

    pub fn create_big(num_bis: u8, sdu_interval_us: u32) -> CreateBig {
        CreateBig {
            big_handle: BIG_HANDLE,
            adv_handle: 0,
            num_bis,
            sdu_interval_us,
            max_sdu: 40,
            max_transport_latency_ms: 40,
            rtn: 1,
            phy: Phy::Le2M,
            packing: Packing::Sequential,
            framing: Framing::Unframed,
            encryption: false,
            broadcast_code: [0; 16],
        }
    }

    /// One BIS, two subevents: the second carries the next event's payload
    pub fn create_big_pretransmitted() -> CreateBigTest {
        CreateBigTest {
            big_handle: BIG_HANDLE,
            adv_handle: 0,
            num_bis: 1,
            sdu_interval_us: 10_000,
            iso_interval: 8,
            nse: 2,
            max_sdu: 40,
            max_pdu: 40,
            phy: Phy::Le2M,
            packing: Packing::Sequential,
            framing: Framing::Unframed,
            bn: 1,
            irc: 1,
            pto: 1,
            encryption: false,
            broadcast_code: [0; 16],
        }
    }

    pub fn create_sync(bis: Vec<u8>) -> BigCreateSync {
        BigCreateSync {
            big_handle: BIG_HANDLE,
            sync_handle: SYNC_HANDLE,
            encryption: false,
            broadcast_code: [0; 16],
            mse: 0,
            sync_timeout: 0x0A,
            bis,
        }
    }

    pub fn payload(event: u64, bis: usize) -> Vec<u8> {
        (0..40u8)
            .map(|i| i ^ (event as u8).wrapping_mul(31) ^ ((bis as u8) << 6))
            .collect()
    }

    /// A broadcaster and a receiver synchronized to it
    pub struct Link {
        pub sim: BroadcastSimulation,
        pub tx: Vec<BisHandle>,
        pub rx: Vec<BisHandle>,
        pub iso_us: u64,
        pub first_anchor_us: u64,
    }

    impl Link {
        pub fn anchor(&self, event: u64) -> u64 {
            self.first_anchor_us + event * self.iso_us
        }

        /// Hand SDU `k` to every broadcast BIS ahead of event `k`, then run
        /// until the last event of the range has closed
        pub fn stream(&mut self, events: Range<u64>) {
            let last = events.end.saturating_sub(1);
            for k in events {
                self.sim.run_until(self.anchor(k) - SDU_LEAD_US);
                let now = self.sim.now_us();
                for (i, handle) in self.tx.clone().into_iter().enumerate() {
                    self.sim
                        .broadcaster_mut()
                        .enqueue_sdu(handle, payload(k, i), k as u16, now)
                        .unwrap();
                }
            }
            self.sim.run_until(self.anchor(last) + 4_000);
        }

        /// Run until event `k` has closed on both sides
        pub fn run_through(&mut self, event: u64) {
            self.sim.run_until(self.anchor(event) + 4_000);
        }

        /// Event index an SDU timestamp belongs to
        pub fn event_of(&self, timestamp_us: u64) -> u64 {
            (timestamp_us - self.first_anchor_us) / self.iso_us
        }
    }

    pub fn received_sdus(events: &[IsoEvent]) -> Vec<(BisHandle, ReceivedSdu)> {
        events
            .iter()
            .filter_map(|e| match e {
                IsoEvent::SduReceived { handle, sdu } => Some((*handle, sdu.clone())),
                _ => None,
            })
            .collect()
    }

    /// Wait for the receiver to synchronize to a BIG the caller created at
    /// time 0 with the given ISO interval
    pub fn establish_on(
        mut sim: BroadcastSimulation,
        iso_us: u64,
        sync: BigCreateSync,
        data_paths: bool,
    ) -> Link {
        let tx = sim.broadcaster().big_bis_handles(BIG_HANDLE).unwrap();
        if data_paths {
            for &handle in &tx {
                sim.broadcaster_mut()
                    .setup_iso_data_path(&SetupIsoDataPath {
                        handle,
                        direction: DataPathDirection::Input,
                        data_path_id: 0,
                    })
                    .unwrap();
            }
        }

        sim.run_until(5_000);
        sim.receiver_mut().big_create_sync(sync).unwrap();
        sim.deliver_biginfo(BIG_HANDLE, SYNC_HANDLE).unwrap();

        let first_anchor_us = 250 + iso_us;
        sim.run_until(first_anchor_us + 4_000);
        let rx = sim
            .take_receiver_events()
            .into_iter()
            .find_map(|e| match e {
                IsoEvent::BigSyncEstablished {
                    status: HciStatus::Success,
                    info: Some(info),
                    ..
                } => Some(info.bis_handles),
                _ => None,
            })
            .expect("receiver did not synchronize");
        if data_paths {
            for &handle in &rx {
                sim.receiver_mut()
                    .setup_iso_data_path(&SetupIsoDataPath {
                        handle,
                        direction: DataPathDirection::Output,
                        data_path_id: 0,
                    })
                    .unwrap();
            }
        }
        sim.take_broadcaster_events();

        Link {
            sim,
            tx,
            rx,
            iso_us,
            first_anchor_us,
        }
    }

    pub fn establish(cmd: CreateBig) -> Link {
        let mut sim = BroadcastSimulation::new(SimConfig::default());
        let iso_us = u64::from(cmd.sdu_interval_us);
        let bis = (1..=cmd.num_bis).collect();
        sim.broadcaster_mut().create_big(&cmd, 0).unwrap();
        establish_on(sim, iso_us, create_sync(bis), true)
    }

    /// Check every valid SDU against what was sent in its event
    pub fn assert_payloads(link: &Link, sdus: &[(BisHandle, ReceivedSdu)]) {
        for (handle, sdu) in sdus {
            if sdu.status != SduStatus::Valid {
                continue;
            }
            let bis = link.rx.iter().position(|h| h == handle).unwrap();
            let event = link.event_of(sdu.timestamp_us);
            assert_eq!(sdu.data, payload(event, bis), "event {event} BIS {bis}");
        }
    }

    /// Toy payload cipher: XOR keystream plus an additive MIC
    pub struct XorCipher;

    fn keystream(ctx: &CipherContext<'_>) -> [u8; 4] {
        let k = ctx.key;
        let counter = ctx.payload_counter.to_le_bytes();
        [
            k.broadcast_code[0] ^ k.gskd[0] ^ counter[0],
            k.broadcast_code[1] ^ k.gskd[1] ^ counter[1] ^ ctx.bis_number,
            k.broadcast_code[2] ^ k.giv[0] ^ counter[2],
            k.broadcast_code[3] ^ k.giv[1] ^ counter[3],
        ]
    }

    fn mic(ctx: &CipherContext<'_>, plain: &[u8]) -> [u8; 4] {
        let seed = u32::from_le_bytes(keystream(ctx)) ^ u32::from(ctx.header);
        plain
            .iter()
            .fold(seed, |acc, &b| acc.rotate_left(5) ^ u32::from(b))
            .to_le_bytes()
    }

    impl IsoCipher for XorCipher {
        fn encrypt(&mut self, ctx: &CipherContext<'_>, payload: &mut Vec<u8>) {
            let tag = mic(ctx, payload);
            let ks = keystream(ctx);
            for (i, b) in payload.iter_mut().enumerate() {
                *b ^= ks[i % 4];
            }
            payload.extend_from_slice(&tag);
        }

        fn decrypt(
            &mut self,
            ctx: &CipherContext<'_>,
            payload: &mut Vec<u8>,
        ) -> Result<(), MicFailure> {
            if payload.len() < 4 {
                return Err(MicFailure);
            }
            let tag = payload.split_off(payload.len() - 4);
            let ks = keystream(ctx);
            for (i, b) in payload.iter_mut().enumerate() {
                *b ^= ks[i % 4];
            }
            if mic(ctx, payload)[..] != tag[..] {
                return Err(MicFailure);
            }
            Ok(())
        }
    }
}

use helpers::*;

// ============================================================================
// Data Transfer Tests
// ============================================================================

mod data_tests {
    use super::*;

    #[test]
    fn unframed_sdus_reach_receiver() {
        let mut link = establish(create_big(2, 10_000));
        assert_eq!(link.rx.len(), 2);

        link.stream(1..9);
        let sdus = received_sdus(&link.sim.take_receiver_events());

        // one SDU per BIS per event
        assert_eq!(sdus.len(), 16);
        assert!(sdus.iter().all(|(_, sdu)| sdu.status == SduStatus::Valid));
        assert_payloads(&link, &sdus);
        let events: Vec<u64> = sdus
            .iter()
            .filter(|(h, _)| *h == link.rx[1])
            .map(|(_, sdu)| link.event_of(sdu.timestamp_us))
            .collect();
        assert_eq!(events, (1..9).collect::<Vec<_>>());

        // every SDU is reported complete on the broadcaster
        let completed: u16 = link
            .sim
            .take_broadcaster_events()
            .iter()
            .map(|e| match e {
                IsoEvent::NumberOfCompletedPackets { count, .. } => *count,
                _ => 0,
            })
            .sum();
        assert_eq!(completed, 16);
    }

    #[test]
    fn receiver_follows_selected_bis_only() {
        let mut sim = BroadcastSimulation::new(SimConfig::default());
        sim.broadcaster_mut()
            .create_big(&create_big(3, 10_000), 0)
            .unwrap();
        let mut link = establish_on(sim, 10_000, create_sync(vec![2]), true);
        assert_eq!(link.rx.len(), 1);

        link.stream(1..4);
        let sdus = received_sdus(&link.sim.take_receiver_events());
        assert_eq!(sdus.len(), 3);
        for (_, sdu) in &sdus {
            assert_eq!(sdu.data, payload(link.event_of(sdu.timestamp_us), 1));
        }
    }

    #[test]
    fn framed_sdus_keep_timestamps() {
        let cmd = CreateBig {
            framing: Framing::Framed,
            ..create_big(1, 10_000)
        };
        let mut link = establish(cmd);

        link.stream(1..6);
        let sdus = received_sdus(&link.sim.take_receiver_events());
        assert_eq!(sdus.len(), 5);
        for (k, (_, sdu)) in (1u64..).zip(&sdus) {
            assert_eq!(sdu.status, SduStatus::Valid);
            assert_eq!(sdu.data, payload(k, 0));
            // the time offset carries the SDU's own timestamp across
            assert_eq!(sdu.timestamp_us, link.anchor(k) - SDU_LEAD_US);
        }
    }

    #[test]
    fn just_in_time_sdus_survive_pretransmission() {
        let mut sim = BroadcastSimulation::new(SimConfig::default());
        sim.broadcaster_mut()
            .create_big_test(&create_big_pretransmitted(), 0)
            .unwrap();
        let mut link = establish_on(sim, 10_000, create_sync(vec![1]), true);

        // each SDU arrives after the previous event already sent its slot
        link.stream(1..6);
        let sdus = received_sdus(&link.sim.take_receiver_events());
        assert_eq!(sdus.len(), 5);
        for (k, (_, sdu)) in (1u64..).zip(&sdus) {
            assert_eq!(sdu.status, SduStatus::Valid, "event {k}");
            assert_eq!(sdu.data, payload(k, 0));
            assert_eq!(link.event_of(sdu.timestamp_us), k);
        }
    }

    #[test]
    fn pretransmission_fills_next_event_early() {
        let mut sim = BroadcastSimulation::new(SimConfig::default());
        sim.broadcaster_mut()
            .create_big_test(&create_big_pretransmitted(), 0)
            .unwrap();
        let tx = sim.broadcaster().big_bis_handles(BIG_HANDLE).unwrap()[0];
        sim.broadcaster_mut()
            .setup_iso_data_path(&SetupIsoDataPath {
                handle: tx,
                direction: DataPathDirection::Input,
                data_path_id: 0,
            })
            .unwrap();
        // one SDU ahead of the event that owns it
        for k in 0..2 {
            sim.broadcaster_mut()
                .enqueue_sdu(tx, payload(k, 0), k as u16, 0)
                .unwrap();
        }

        let mut link = establish_on(sim, 10_000, create_sync(vec![1]), false);
        let rx = link.rx[0];
        link.sim
            .receiver_mut()
            .setup_iso_data_path(&SetupIsoDataPath {
                handle: rx,
                direction: DataPathDirection::Output,
                data_path_id: 0,
            })
            .unwrap();

        let rx_ops_before = link.sim.receiver().radio().history().len();
        for k in 1..6u64 {
            link.sim.run_until(link.anchor(k) - SDU_LEAD_US);
            link.sim
                .broadcaster_mut()
                .enqueue_sdu(tx, payload(k + 1, 0), (k + 1) as u16, 0)
                .unwrap();
        }
        link.run_through(5);

        // the payload of each event already arrived in the previous one, so
        // only the pre-transmission subevent is received
        let rx_ops = link.sim.receiver().radio().history().len() - rx_ops_before;
        assert_eq!(rx_ops, 5);
        let sdus = received_sdus(&link.sim.take_receiver_events());
        assert_eq!(sdus.len(), 5);
        for (_, sdu) in &sdus {
            assert_eq!(sdu.status, SduStatus::Valid);
            assert_eq!(sdu.data, payload(link.event_of(sdu.timestamp_us), 0));
        }
    }
}

// ============================================================================
// Sync Loss Tests
// ============================================================================

mod loss_tests {
    use super::*;

    #[test]
    fn one_lost_event_does_not_break_sync() {
        let mut link = establish(create_big(2, 10_000));
        let lost_anchor = link.anchor(3);
        link.sim.set_loss(LossModel::Window {
            start_us: lost_anchor - 100,
            end_us: lost_anchor + 5_000,
        });

        link.stream(1..7);
        let events = link.sim.take_receiver_events();
        assert!(!events
            .iter()
            .any(|e| matches!(e, IsoEvent::BigSyncLost { .. })));
        let sdus = received_sdus(&events);
        assert_eq!(sdus.len(), 12);

        let lost: Vec<u64> = sdus
            .iter()
            .filter(|(_, sdu)| sdu.status == SduStatus::Lost)
            .map(|(_, sdu)| link.event_of(sdu.timestamp_us))
            .collect();
        assert_eq!(lost, vec![3, 3]);
        assert_payloads(&link, &sdus);
        assert!(link.sim.lost_packets() > 0);
        assert_eq!(
            link.sim.receiver().sync_state(BIG_HANDLE),
            Some(SyncState::Synchronized)
        );
    }

    #[test]
    fn long_outage_caps_receive_window() {
        let mut sim = BroadcastSimulation::new(SimConfig::default());
        sim.broadcaster_mut()
            .create_big(&create_big(2, 10_000), 0)
            .unwrap();
        let sync = BigCreateSync {
            sync_timeout: 0x0100,
            ..create_sync(vec![1, 2])
        };
        let mut link = establish_on(sim, 10_000, sync, true);

        // 2M, 40 byte payloads: sub-interval 204 + 150, widening capped at half of it
        let max_window = 2 * (354 / 2) + SimConfig::default().receiver.rx_window_margin_us;

        link.sim.set_loss(LossModel::DropAll);
        link.stream(1..60);
        let windows: Vec<u32> = link
            .sim
            .receiver()
            .radio()
            .history()
            .iter()
            .filter_map(|op| match op {
                RadioOp::Rx { window_us, .. } => Some(*window_us),
                RadioOp::Tx(_) => None,
            })
            .collect();
        assert!(windows.iter().all(|w| *w <= max_window));
        assert_eq!(windows.last(), Some(&max_window));

        link.sim.set_loss(LossModel::None);
        link.sim.take_receiver_events();
        link.stream(60..63);
        let sdus = received_sdus(&link.sim.take_receiver_events());
        assert!(sdus.iter().all(|(_, s)| s.status == SduStatus::Valid));
        assert_payloads(&link, &sdus);
        assert_eq!(
            link.sim.receiver().sync_state(BIG_HANDLE),
            Some(SyncState::Synchronized)
        );
    }

    #[test]
    fn silent_broadcaster_loses_sync_after_six_intervals() {
        // 6 x 20 ms outlasts the 100 ms sync timeout
        let mut link = establish(create_big(2, 20_000));
        link.stream(1..3);
        link.sim.take_receiver_events();

        link.sim.set_loss(LossModel::DropAll);
        link.run_through(6);
        let events = link.sim.take_receiver_events();
        assert!(!events
            .iter()
            .any(|e| matches!(e, IsoEvent::BigSyncLost { .. })));
        assert_eq!(
            received_sdus(&events)
                .iter()
                .filter(|(_, s)| s.status == SduStatus::Lost)
                .count(),
            8
        );

        // 120 ms after the anchor of event 2
        link.run_through(7);
        let lost: Vec<IsoEvent> = link
            .sim
            .take_receiver_events()
            .into_iter()
            .filter(|e| matches!(e, IsoEvent::BigSyncLost { .. }))
            .collect();
        assert_eq!(
            lost,
            vec![IsoEvent::BigSyncLost {
                big_handle: BIG_HANDLE,
                reason: HciStatus::ConnectionTimeout.code(),
            }]
        );
        assert_eq!(link.sim.receiver().sync_state(BIG_HANDLE), None);
        assert_eq!(
            link.sim.receiver().available_sync_bis(),
            SimConfig::default().receiver.max_sync_bis
        );

        // nothing more is reported once the sync is gone
        link.run_through(12);
        assert!(link.sim.take_receiver_events().is_empty());

        // resources are free for a new sync
        link.sim.set_loss(LossModel::None);
        link.sim
            .receiver_mut()
            .big_create_sync(create_sync(vec![1, 2]))
            .unwrap();
        link.sim.deliver_biginfo(BIG_HANDLE, SYNC_HANDLE).unwrap();
        link.run_through(14);
        assert!(link.sim.take_receiver_events().iter().any(|e| matches!(
            e,
            IsoEvent::BigSyncEstablished {
                status: HciStatus::Success,
                ..
            }
        )));
    }
}

// ============================================================================
// Control Procedure Tests
// ============================================================================

mod control_tests {
    use super::*;

    #[test]
    fn channel_map_switches_at_instant() {
        let mut link = establish(create_big(2, 10_000));
        let info = BigInfo::decode(
            &link
                .sim
                .broadcaster()
                .big_info(BIG_HANDLE, link.sim.now_us())
                .unwrap(),
        )
        .unwrap();
        let bis1 = bis_access_address(info.seed_access_address, 1);
        let chid = channel_identifier(bis1);

        link.stream(1..2);
        // counter 2 is next, so the instant is 2 + 6
        let map = ChannelMap::from_channels(&[1, 5, 9, 13, 17, 21, 25, 29, 33]).unwrap();
        link.sim.broadcaster_mut().set_host_channel_classification(map);
        link.stream(2..12);

        let events = link.sim.take_receiver_events();
        assert!(!events
            .iter()
            .any(|e| matches!(e, IsoEvent::BigSyncLost { .. })));
        let sdus = received_sdus(&events);
        assert_eq!(sdus.len(), 22);
        assert!(sdus.iter().all(|(_, sdu)| sdu.status == SduStatus::Valid));
        assert_eq!(link.sim.receiver().sync_channel_map(BIG_HANDLE), Some(map));
        assert_eq!(link.sim.broadcaster().big_channel_map(BIG_HANDLE), Some(map));

        for k in 0..12u64 {
            let used = if k < 8 { ChannelMap::all() } else { map };
            let first = link
                .sim
                .broadcaster()
                .radio()
                .sent_on(bis1)
                .find(|p| p.start_us == link.anchor(k))
                .unwrap();
            assert_eq!(
                first.channel,
                next_event_channel(k as u16, chid, &used).channel_index,
                "event {k}"
            );
        }
    }

    #[test]
    fn terminate_reaches_receiver() {
        let mut link = establish(create_big(1, 10_000));
        link.stream(1..3);
        link.sim.take_receiver_events();

        link.sim
            .broadcaster_mut()
            .terminate_big(&TerminateBig {
                big_handle: BIG_HANDLE,
                reason: 0x13,
            })
            .unwrap();
        link.run_through(4);

        assert!(link
            .sim
            .take_broadcaster_events()
            .contains(&IsoEvent::TerminateBigComplete {
                big_handle: BIG_HANDLE,
                reason: 0x16,
            }));
        assert_eq!(link.sim.broadcaster().big_state(BIG_HANDLE), None);

        let events = link.sim.take_receiver_events();
        let lost: Vec<&IsoEvent> = events
            .iter()
            .filter(|e| matches!(e, IsoEvent::BigSyncLost { .. }))
            .collect();
        assert_eq!(
            lost,
            vec![&IsoEvent::BigSyncLost {
                big_handle: BIG_HANDLE,
                reason: 0x13,
            }]
        );
        assert_eq!(link.sim.receiver().sync_state(BIG_HANDLE), None);
    }

    #[test]
    fn skipped_event_delays_stream() {
        let mut link = establish(create_big(1, 10_000));
        link.stream(1..2);
        // taken by something else when event 3 comes round
        let blocked = link.anchor(3);
        link.sim
            .broadcaster_mut()
            .scheduler_mut()
            .block(blocked - 1_000, blocked + 1_000);

        link.stream(2..8);
        assert_eq!(link.sim.broadcaster().scheduler().conflicts(), 1);
        assert_eq!(link.sim.broadcaster().big_state(BIG_HANDLE), Some(BigState::Active));

        let sdus = received_sdus(&link.sim.take_receiver_events());
        let statuses: Vec<SduStatus> = sdus.iter().map(|(_, s)| s.status).collect();
        assert_eq!(statuses.iter().filter(|s| **s == SduStatus::Lost).count(), 1);
        assert_eq!(
            link.event_of(sdus[2].1.timestamp_us),
            3,
            "event 3 was never sent"
        );
        assert_eq!(sdus[2].1.status, SduStatus::Lost);

        // SDUs queue up behind the skipped event instead of being dropped
        let delivered: Vec<Vec<u8>> = sdus
            .iter()
            .filter(|(_, s)| s.status == SduStatus::Valid)
            .map(|(_, s)| s.data.clone())
            .collect();
        let expected: Vec<Vec<u8>> = (1..7).map(|k| payload(k, 0)).collect();
        assert_eq!(delivered, expected);
    }
}

// ============================================================================
// Test Mode Tests
// ============================================================================

mod test_mode_tests {
    use super::*;

    #[test]
    fn receive_test_counts_generated_sdus() {
        let mut sim = BroadcastSimulation::new(SimConfig::default());
        sim.broadcaster_mut()
            .create_big(&create_big(1, 10_000), 0)
            .unwrap();
        let mut link = establish_on(sim, 10_000, create_sync(vec![1]), false);
        let (tx, rx) = (link.tx[0], link.rx[0]);

        link.sim
            .broadcaster_mut()
            .iso_transmit_test(tx, TestPayloadType::Maximum)
            .unwrap();
        link.sim
            .receiver_mut()
            .iso_receive_test(rx, TestPayloadType::Maximum)
            .unwrap();
        link.run_through(5);
        assert_eq!(
            link.sim.receiver_mut().iso_read_test_counters(rx).unwrap(),
            TestCounters {
                received: 5,
                missed: 0,
                failed: 0,
            }
        );

        let lost_anchor = link.anchor(6);
        link.sim.set_loss(LossModel::Window {
            start_us: lost_anchor - 100,
            end_us: lost_anchor + 5_000,
        });
        link.run_through(8);
        assert_eq!(
            link.sim.receiver_mut().iso_test_end(rx).unwrap(),
            TestCounters {
                received: 7,
                missed: 1,
                failed: 0,
            }
        );
        assert!(link.sim.receiver_mut().iso_read_test_counters(rx).is_err());
        // test traffic is never delivered to the host
        assert!(received_sdus(&link.sim.take_receiver_events()).is_empty());
    }
}

// ============================================================================
// Encryption Tests
// ============================================================================

mod encryption_tests {
    use super::*;

    fn encrypted_link(receiver_code: [u8; 16]) -> Link {
        let mut sim = BroadcastSimulation::new(SimConfig::default());
        sim.broadcaster_mut().set_cipher(Box::new(XorCipher));
        sim.receiver_mut().set_cipher(Box::new(XorCipher));
        let cmd = CreateBig {
            encryption: true,
            broadcast_code: [0x5A; 16],
            ..create_big(1, 10_000)
        };
        sim.broadcaster_mut().create_big(&cmd, 0).unwrap();
        let sync = BigCreateSync {
            encryption: true,
            broadcast_code: receiver_code,
            ..create_sync(vec![1])
        };
        establish_on(sim, 10_000, sync, true)
    }

    #[test]
    fn encrypted_payloads_decrypt_with_broadcast_code() {
        let mut link = encrypted_link([0x5A; 16]);
        link.stream(1..5);

        // payloads on air carry the MIC and are not plaintext
        let on_air = link
            .sim
            .air()
            .iter()
            .rev()
            .find(|p| p.pdu.len() > 2)
            .unwrap();
        assert_eq!(on_air.pdu.len(), 2 + 40 + 4);
        assert_ne!(on_air.pdu[2..42], payload(4, 0)[..]);

        let sdus = received_sdus(&link.sim.take_receiver_events());
        assert_eq!(sdus.len(), 4);
        assert!(sdus.iter().all(|(_, s)| s.status == SduStatus::Valid));
        assert_payloads(&link, &sdus);
    }

    #[test]
    fn wrong_broadcast_code_fails_every_payload() {
        let mut link = encrypted_link([0xA5; 16]);
        link.stream(1..5);

        let sdus = received_sdus(&link.sim.take_receiver_events());
        assert_eq!(sdus.len(), 4);
        assert!(sdus.iter().all(|(_, s)| s.status == SduStatus::Lost));
    }
}

// ============================================================================
// Property Tests
// ============================================================================

mod property_tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(8))]

        #[test]
        fn valid_sdus_always_match_what_was_sent(
            loss in 0.0f64..0.6,
            seed in any::<u64>(),
        ) {
            let mut sim = BroadcastSimulation::new(SimConfig { seed, ..SimConfig::default() });
            sim.broadcaster_mut().create_big(&create_big(2, 10_000), 0).unwrap();
            let mut link = establish_on(sim, 10_000, create_sync(vec![1, 2]), true);

            link.sim.set_loss(LossModel::Probability(loss));
            link.stream(1..15);
            let sdus = received_sdus(&link.sim.take_receiver_events());
            prop_assert!(sdus.len() <= 28);
            for (handle, sdu) in &sdus {
                let bis = link.rx.iter().position(|h| h == handle).unwrap();
                let event = link.event_of(sdu.timestamp_us);
                prop_assert!((1..15).contains(&event));
                match sdu.status {
                    SduStatus::Valid => prop_assert_eq!(&sdu.data, &payload(event, bis)),
                    SduStatus::Lost => prop_assert!(sdu.data.is_empty()),
                    SduStatus::Errors => {}
                }
            }
        }
    }
}
