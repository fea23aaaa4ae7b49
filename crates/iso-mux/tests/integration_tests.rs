//! Integration tests for the isochronous engine
//!
//! These tests drive an `IsoController` through in-file fakes of the radio
//! and scheduler and verify:
//! - BIG creation, establishment and parameter derivation
//! - Subevent channels against an independent channel selection
//! - SDU transport, completion reporting and ISO test mode
//! - Control procedures (channel map update, termination)
//! - Scheduling conflicts and resource limits
//! - BIG sync validation, BIGInfo handling and sync timeout

use iso_mux::{
    Activity, BigCreateSync, ControllerConfig, CreateBig, CreateBigTest, DataPathDirection,
    HciStatus, IsoController, IsoError, IsoEvent, Packing, Radio, RadioDone, RadioError, RxError,
    RxRequest, SchedConflict, ScheduleItem, Scheduler, SetupIsoDataPath, TerminateBig,
    TestPayloadType, TxRequest,
};
use iso_protocol::pdu::split_pdu;
use iso_protocol::{
    channel_identifier, next_event_channel, next_subevent_channel, BigControlPdu, BigInfo,
    ChannelMap, DecodePdu, EncodePdu, Framing, Llid, OffsetUnits, Phy,
};

// ============================================================================
// Helper Functions
// ============================================================================

mod helpers {
    use super::*;

    /// One transmitted PDU with the link settings it went out on
    #[derive(Debug, Clone)]
    pub struct Sent {
        pub channel: u8,
        pub access_address: u32,
        pub crc_init: u32,
        pub request: TxRequest,
    }

    #[derive(Debug, Default)]
    pub struct FakeRadio {
        link: (u8, u32, u32),
        pub sent: Vec<Sent>,
        pub received: Vec<(u8, RxRequest)>,
        pub wfr_timeout_us: Option<u32>,
        /// Outstanding operation: Some(true) for transmit
        pub pending: Option<bool>,
    }

    impl Radio for FakeRadio {
        fn set_channel(&mut self, channel_index: u8, access_address: u32, crc_init: u32) {
            self.link = (channel_index, access_address, crc_init);
        }

        fn transmit(&mut self, request: TxRequest) -> Result<(), RadioError> {
            if self.pending.is_some() {
                return Err(RadioError::Busy);
            }
            self.sent.push(Sent {
                channel: self.link.0,
                access_address: self.link.1,
                crc_init: self.link.2,
                request,
            });
            self.pending = Some(true);
            Ok(())
        }

        fn receive(&mut self, request: RxRequest) -> Result<(), RadioError> {
            if self.pending.is_some() {
                return Err(RadioError::Busy);
            }
            self.received.push((self.link.0, request));
            self.pending = Some(false);
            Ok(())
        }

        fn enable_wait_for_response(&mut self, timeout_us: u32) {
            self.wfr_timeout_us = Some(timeout_us);
        }

        fn disable(&mut self) {
            self.pending = None;
        }
    }

    #[derive(Debug, Default)]
    pub struct FakeScheduler {
        pub items: Vec<ScheduleItem>,
        /// Reject this many upcoming requests
        pub reject: usize,
        pub rejected: usize,
    }

    impl Scheduler for FakeScheduler {
        fn schedule(&mut self, item: ScheduleItem) -> Result<(), SchedConflict> {
            if self.reject > 0 {
                self.reject -= 1;
                self.rejected += 1;
                return Err(SchedConflict);
            }
            self.items.push(item);
            Ok(())
        }

        fn cancel(&mut self, activity: Activity) {
            self.items.retain(|i| i.activity != activity);
        }
    }

    pub type Controller = IsoController<FakeRadio, FakeScheduler>;

    pub fn controller() -> Controller {
        controller_with(ControllerConfig::default())
    }

    pub fn controller_with(config: ControllerConfig) -> Controller {
        IsoController::with_seed(config, FakeRadio::default(), FakeScheduler::default(), 42)
    }

    /// Two BISes, 10 ms SDUs of 40 bytes, one retransmission
    pub fn create_big(big_handle: u8) -> CreateBig {
        CreateBig {
            big_handle,
            adv_handle: big_handle,
            num_bis: 2,
            sdu_interval_us: 10_000,
            max_sdu: 40,
            max_transport_latency_ms: 20,
            rtn: 1,
            phy: Phy::Le2M,
            packing: Packing::Sequential,
            framing: Framing::Unframed,
            encryption: false,
            broadcast_code: [0; 16],
        }
    }

    pub fn create_sync(big_handle: u8, sync_handle: u16, bis: Vec<u8>) -> BigCreateSync {
        BigCreateSync {
            big_handle,
            sync_handle,
            encryption: false,
            broadcast_code: [0; 16],
            mse: 0,
            sync_timeout: 10,
            bis,
        }
    }

    /// Run the earliest reservation to completion; every transmit succeeds
    /// and every receive times out. Returns the radio operations it used.
    pub fn run_next_event(c: &mut Controller) -> usize {
        let sched = c.scheduler_mut();
        let Some(pos) = sched
            .items
            .iter()
            .enumerate()
            .min_by_key(|(_, i)| i.start_us)
            .map(|(pos, _)| pos)
        else {
            return 0;
        };
        let item = sched.items.remove(pos);

        c.run_activity(item.activity);
        let mut ops = 0;
        while let Some(tx) = c.radio_mut().pending.take() {
            ops += 1;
            let done = if tx {
                RadioDone::Tx { end_us: 0 }
            } else {
                RadioDone::Rx(Err(RxError::Timeout))
            };
            c.radio_done(done);
        }
        ops
    }

    pub fn created_handles(events: &[IsoEvent]) -> Option<Vec<iso_mux::BisHandle>> {
        events.iter().find_map(|e| match e {
            IsoEvent::CreateBigComplete {
                info: Some(info), ..
            } => Some(info.bis_handles.clone()),
            _ => None,
        })
    }

    pub fn status_of_create(events: &[IsoEvent], handle: u8) -> Option<HciStatus> {
        events.iter().find_map(|e| match e {
            IsoEvent::CreateBigComplete {
                status, big_handle, ..
            } if *big_handle == handle => Some(*status),
            _ => None,
        })
    }
}

use helpers::*;

// ============================================================================
// BIG Lifecycle Tests
// ============================================================================

mod lifecycle_tests {
    use super::*;

    #[test]
    fn create_big_completes_after_first_event() {
        let mut c = controller();
        c.create_big(&create_big(1), 0).unwrap();

        assert_eq!(c.big_state(1), Some(iso_mux::BigState::Pending));
        assert!(c.drain_events().is_empty());
        assert_eq!(c.scheduler().items.len(), 1);

        // 2 BIS x NSE 2
        assert_eq!(run_next_event(&mut c), 4);
        let events = c.drain_events();
        assert_eq!(events.len(), 1);
        match &events[0] {
            IsoEvent::CreateBigComplete {
                status,
                big_handle,
                info: Some(info),
            } => {
                assert_eq!(*status, HciStatus::Success);
                assert_eq!(*big_handle, 1);
                assert_eq!(info.bis_handles.len(), 2);
                assert_eq!((info.nse, info.bn, info.irc, info.pto), (2, 1, 2, 0));
                assert_eq!(info.iso_interval, 8);
                assert_eq!(info.max_pdu, 40);
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(c.big_state(1), Some(iso_mux::BigState::Active));
    }

    #[test]
    fn first_anchor_follows_one_iso_interval() {
        let mut c = controller();
        c.create_big(&create_big(1), 1_000).unwrap();
        let config = ControllerConfig::default();

        let item = c.scheduler().items[0];
        assert_eq!(item.start_us, 1_000 + 10_000);
        run_next_event(&mut c);
        let first = &c.radio().sent[0];
        assert_eq!(
            first.request.start_us,
            1_000 + u64::from(config.event_lead_us) + 10_000
        );
    }

    #[test]
    fn subevent_channels_follow_channel_selection() {
        let mut c = controller();
        c.create_big(&create_big(1), 0).unwrap();
        for _ in 0..3 {
            run_next_event(&mut c);
        }

        let sent = &c.radio().sent;
        assert_eq!(sent.len(), 12);
        let map = ChannelMap::all();
        for (event, chunk) in sent.chunks(4).enumerate() {
            // sequential packing: BIS 1 se 0, se 1, then BIS 2
            for bis in chunk.chunks(2) {
                let chid = channel_identifier(bis[0].access_address);
                let ev = next_event_channel(event as u16, chid, &map);
                let mut hop = ev.hop();
                assert_eq!(bis[0].channel, ev.channel_index);
                assert_eq!(bis[1].channel, next_subevent_channel(chid, &mut hop, &map));
                assert_eq!(bis[0].access_address, bis[1].access_address);
            }
        }
        assert_ne!(sent[0].access_address, sent[2].access_address);
        assert_eq!(sent[0].crc_init & 0xFF, 1);
        assert_eq!(sent[2].crc_init & 0xFF, 2);
    }

    #[test]
    fn terminate_pending_big_cancels_creation() {
        let mut c = controller();
        c.create_big(&create_big(1), 0).unwrap();
        c.terminate_big(&TerminateBig {
            big_handle: 1,
            reason: 0x13,
        })
        .unwrap();

        let events = c.drain_events();
        assert_eq!(
            events,
            vec![
                IsoEvent::CreateBigComplete {
                    status: HciStatus::OperationCancelledByHost,
                    big_handle: 1,
                    info: None,
                },
                IsoEvent::TerminateBigComplete {
                    big_handle: 1,
                    reason: 0x16,
                },
            ]
        );
        assert_eq!(c.big_state(1), None);
        assert!(c.scheduler().items.is_empty());
        assert_eq!(c.available_broadcast_bis(), ControllerConfig::default().max_bis);
    }

    #[test]
    fn terminate_sends_term_ind_in_final_event() {
        let mut c = controller();
        c.create_big(&create_big(1), 0).unwrap();
        run_next_event(&mut c);
        let info = BigInfo::decode(&c.big_info(1, 0).unwrap()).unwrap();
        c.drain_events();

        c.terminate_big(&TerminateBig {
            big_handle: 1,
            reason: 0x13,
        })
        .unwrap();
        assert_eq!(c.big_state(1), Some(iso_mux::BigState::Terminating));
        assert!(c.terminate_big(&TerminateBig { big_handle: 1, reason: 0x13 }).is_err());

        // data subevents plus the control subevent
        assert_eq!(run_next_event(&mut c), 5);
        let sent = &c.radio().sent[4..];
        for data in &sent[..4] {
            let (header, _) = split_pdu(&data.request.pdu).unwrap();
            assert!(header.cstf);
            assert_eq!(header.cssn, 1);
        }
        let control = &sent[4];
        assert_eq!(
            control.access_address,
            iso_protocol::control_access_address(info.seed_access_address)
        );
        assert_eq!(control.crc_init, u32::from(info.base_crc_init) << 8);
        let (header, payload) = split_pdu(&control.request.pdu).unwrap();
        assert_eq!(header.llid, Llid::Control);
        assert_eq!(
            BigControlPdu::decode(payload).unwrap(),
            BigControlPdu::TerminateInd {
                reason: 0x13,
                instant: 2,
            }
        );

        assert_eq!(
            c.drain_events(),
            vec![IsoEvent::TerminateBigComplete {
                big_handle: 1,
                reason: 0x16,
            }]
        );
        assert_eq!(c.big_state(1), None);
        assert!(c.scheduler().items.is_empty());
    }

    #[test]
    fn create_big_test_uses_given_layout() {
        let mut c = controller();
        let cmd = CreateBigTest {
            big_handle: 4,
            adv_handle: 0,
            num_bis: 1,
            sdu_interval_us: 10_000,
            iso_interval: 8,
            nse: 4,
            max_sdu: 40,
            max_pdu: 40,
            phy: Phy::Le1M,
            packing: Packing::Interleaved,
            framing: Framing::Unframed,
            bn: 2,
            irc: 1,
            pto: 1,
            encryption: false,
            broadcast_code: [0; 16],
        };
        c.create_big_test(&cmd, 0).unwrap();
        assert_eq!(run_next_event(&mut c), 4);
        let events = c.drain_events();
        match &events[0] {
            IsoEvent::CreateBigComplete {
                info: Some(info), ..
            } => {
                assert_eq!((info.nse, info.bn, info.irc, info.pto), (4, 2, 1, 1));
                // one extra ISO interval for pre-transmission
                assert!(info.transport_latency_us > 10_000);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }
}

// ============================================================================
// Validation Tests
// ============================================================================

mod validation_tests {
    use super::*;

    #[test]
    fn rejects_out_of_range_handle() {
        let mut c = controller();
        let err = c.create_big(&create_big(0xF0), 0).unwrap_err();
        assert_eq!(err.status(), HciStatus::InvalidParameters);
    }

    #[test]
    fn rejects_duplicate_and_second_pending_big() {
        let mut c = controller();
        c.create_big(&create_big(1), 0).unwrap();
        assert_eq!(
            c.create_big(&create_big(1), 0).unwrap_err().status(),
            HciStatus::CommandDisallowed
        );
        // a different BIG may not start while the first is pending
        assert_eq!(
            c.create_big(&create_big(2), 0).unwrap_err().status(),
            HciStatus::CommandDisallowed
        );
        run_next_event(&mut c);
        c.create_big(&create_big(2), 0).unwrap();
    }

    #[test]
    fn rejects_encryption_without_cipher() {
        let mut c = controller();
        let cmd = CreateBig {
            encryption: true,
            ..create_big(1)
        };
        assert_eq!(
            c.create_big(&cmd, 0).unwrap_err(),
            IsoError::UnsupportedFeature("encryption")
        );
    }

    #[test]
    fn rejects_when_bis_pool_exhausted() {
        let mut c = controller_with(ControllerConfig {
            max_bis: 1,
            ..Default::default()
        });
        let err = c.create_big(&create_big(1), 0).unwrap_err();
        assert_eq!(err, IsoError::ResourcesExhausted("BIS"));
        assert_eq!(err.status(), HciStatus::ConnectionRejectedLimitedResources);
        assert!(c.scheduler().items.is_empty());
    }

    #[test]
    fn rejects_event_longer_than_interval() {
        let mut c = controller();
        let cmd = CreateBig {
            num_bis: 20,
            max_sdu: 200,
            rtn: 4,
            phy: Phy::Le1M,
            ..create_big(1)
        };
        assert_eq!(
            c.create_big(&cmd, 0).unwrap_err().status(),
            HciStatus::InvalidParameters
        );
    }

    #[test]
    fn enqueue_requires_input_path_and_size() {
        let mut c = controller();
        c.create_big(&create_big(1), 0).unwrap();
        let bis = c.big_bis_handles(1).unwrap()[0];

        assert_eq!(
            c.enqueue_sdu(bis, vec![0; 10], 0, 0).unwrap_err().status(),
            HciStatus::CommandDisallowed
        );
        c.setup_iso_data_path(&SetupIsoDataPath {
            handle: bis,
            direction: DataPathDirection::Input,
            data_path_id: 0,
        })
        .unwrap();
        assert_eq!(
            c.enqueue_sdu(bis, vec![0; 41], 0, 0).unwrap_err().status(),
            HciStatus::InvalidParameters
        );
        c.enqueue_sdu(bis, vec![0; 40], 0, 0).unwrap();

        // output path does not exist on a broadcast BIS
        assert!(c
            .setup_iso_data_path(&SetupIsoDataPath {
                handle: bis,
                direction: DataPathDirection::Output,
                data_path_id: 0,
            })
            .is_err());
    }
}

// ============================================================================
// Data Path Tests
// ============================================================================

mod data_tests {
    use super::*;

    #[test]
    fn sdu_is_sent_and_completed() {
        let mut c = controller();
        c.create_big(&create_big(1), 0).unwrap();
        let bis = c.big_bis_handles(1).unwrap()[0];
        c.setup_iso_data_path(&SetupIsoDataPath {
            handle: bis,
            direction: DataPathDirection::Input,
            data_path_id: 0,
        })
        .unwrap();
        let data: Vec<u8> = (0..40).collect();
        c.enqueue_sdu(bis, data.clone(), 0, 0).unwrap();

        run_next_event(&mut c);

        // both subevents of BIS 1 carry the SDU, BIS 2 pads
        let sent = &c.radio().sent;
        for pdu in &sent[..2] {
            let (header, payload) = split_pdu(&pdu.request.pdu).unwrap();
            assert_eq!(header.llid, Llid::UnframedEnd);
            assert_eq!(payload, &data[..]);
        }
        let (header, payload) = split_pdu(&sent[2].request.pdu).unwrap();
        assert_eq!(header.llid, Llid::UnframedContinuation);
        assert!(payload.is_empty());

        let events = c.drain_events();
        assert!(matches!(events[0], IsoEvent::CreateBigComplete { .. }));
        assert_eq!(
            events[1],
            IsoEvent::NumberOfCompletedPackets {
                handle: bis,
                count: 1,
            }
        );
        assert_eq!(created_handles(&events).unwrap()[0], bis);
    }

    #[test]
    fn transmit_test_generates_counter_payloads() {
        let mut c = controller();
        c.create_big(&create_big(1), 0).unwrap();
        let bis = c.big_bis_handles(1).unwrap()[1];
        c.iso_transmit_test(bis, TestPayloadType::Maximum).unwrap();

        run_next_event(&mut c);
        run_next_event(&mut c);

        // BIS 2 subevents of both events
        let sent = &c.radio().sent;
        let (_, first) = split_pdu(&sent[2].request.pdu).unwrap();
        let (_, second) = split_pdu(&sent[6].request.pdu).unwrap();
        assert_eq!(first.len(), 40);
        assert_eq!(&first[..4], &0u32.to_le_bytes());
        assert_eq!(&second[..4], &1u32.to_le_bytes());

        // test traffic does not produce completion events
        assert!(!c
            .drain_events()
            .iter()
            .any(|e| matches!(e, IsoEvent::NumberOfCompletedPackets { .. })));
        c.iso_test_end(bis).unwrap();
        assert!(c.iso_test_end(bis).is_err());
    }
}

// ============================================================================
// Control Procedure Tests
// ============================================================================

mod control_tests {
    use super::*;

    #[test]
    fn channel_map_changes_at_instant() {
        let mut c = controller();
        c.create_big(&create_big(1), 0).unwrap();
        run_next_event(&mut c);

        let map = ChannelMap::from_channels(&[9, 10, 21, 22, 23, 33, 34, 35, 36]).unwrap();
        c.set_host_channel_classification(map);

        // counters 1..=6 announce the update with a control subevent
        for _ in 1..=6 {
            let before = c.radio().sent.len();
            assert_eq!(run_next_event(&mut c), 5);
            assert_eq!(c.big_channel_map(1), Some(ChannelMap::all()));
            let control = &c.radio().sent[before + 4];
            let (_, payload) = split_pdu(&control.request.pdu).unwrap();
            assert_eq!(
                BigControlPdu::decode(payload).unwrap(),
                BigControlPdu::ChannelMapInd {
                    channel_map: map,
                    instant: 7,
                }
            );
        }

        // counter 7 is the instant
        let before = c.radio().sent.len();
        assert_eq!(run_next_event(&mut c), 4);
        assert_eq!(c.big_channel_map(1), Some(map));
        for pdu in &c.radio().sent[before..] {
            assert!(map.is_used(pdu.channel));
        }
        let first = &c.radio().sent[before];
        let chid = channel_identifier(first.access_address);
        assert_eq!(first.channel, next_event_channel(7, chid, &map).channel_index);
    }

    #[test]
    fn scheduling_conflicts_skip_events() {
        let mut c = controller();
        c.scheduler_mut().reject = 2;
        c.create_big(&create_big(1), 0).unwrap();

        let item = c.scheduler().items[0];
        // two skipped events push the first anchor two intervals out
        assert_eq!(item.start_us, 30_000);
        run_next_event(&mut c);
        assert_eq!(
            status_of_create(&c.drain_events(), 1),
            Some(HciStatus::Success)
        );
        let info = BigInfo::decode(&c.big_info(1, 0).unwrap()).unwrap();
        // counter 3 after the first transmitted event
        assert_eq!(info.payload_count, 3);
    }

    #[test]
    fn persistent_conflicts_tear_down_big() {
        let mut c = controller();
        c.scheduler_mut().reject = 100;
        c.create_big(&create_big(1), 0).unwrap();

        assert_eq!(c.scheduler().rejected, 6);
        assert_eq!(
            c.drain_events(),
            vec![IsoEvent::CreateBigComplete {
                status: HciStatus::UnspecifiedError,
                big_handle: 1,
                info: None,
            }]
        );
        assert_eq!(c.big_state(1), None);
    }

    #[test]
    fn big_info_describes_next_anchor() {
        let mut c = controller();
        c.create_big(&create_big(1), 0).unwrap();

        // anchor at 10_250
        let info = BigInfo::decode(&c.big_info(1, 5_000).unwrap()).unwrap();
        assert_eq!(info.offset_us(), 5_250);
        assert_eq!(info.payload_count, 0);
        assert_eq!((info.num_bis, info.nse, info.bn, info.irc), (2, 2, 1, 2));
        assert_eq!(info.max_pdu, 40);
        assert_eq!(info.max_sdu, 40);
        assert_eq!(info.sdu_interval_us, 10_000);
        assert_eq!(info.phy, Phy::Le2M);
        assert!(!info.is_encrypted());

        let later = BigInfo::decode(&c.big_info(1, 25_000).unwrap()).unwrap();
        assert_eq!(later.offset_us(), 5_250);
        assert_eq!(later.payload_count, 2);
        assert_eq!(later.seed_access_address, info.seed_access_address);

        assert_eq!(c.big_info(9, 0).unwrap_err(), IsoError::UnknownBig(9));
    }
}

// ============================================================================
// BIG Sync Tests
// ============================================================================

mod sync_tests {
    use super::*;

    fn broadcaster_biginfo(pa_time_us: u64) -> Vec<u8> {
        let mut tx = controller();
        tx.create_big(&create_big(1), 0).unwrap();
        tx.big_info(1, pa_time_us).unwrap()
    }

    #[test]
    fn create_sync_validation() {
        let mut c = controller();
        assert_eq!(
            c.big_create_sync(create_sync(1, 1, vec![])).unwrap_err().status(),
            HciStatus::InvalidParameters
        );
        assert_eq!(
            c.big_create_sync(create_sync(1, 1, vec![32])).unwrap_err().status(),
            HciStatus::InvalidParameters
        );
        let mut bad_timeout = create_sync(1, 1, vec![1]);
        bad_timeout.sync_timeout = 5;
        assert!(c.big_create_sync(bad_timeout).is_err());

        c.big_create_sync(create_sync(1, 1, vec![1])).unwrap();
        assert_eq!(c.sync_state(1), Some(iso_mux::SyncState::AwaitingBigInfo));
        assert_eq!(
            c.big_create_sync(create_sync(1, 2, vec![1])).unwrap_err().status(),
            HciStatus::CommandDisallowed
        );
        assert_eq!(
            c.big_create_sync(create_sync(2, 2, vec![1])).unwrap_err().status(),
            HciStatus::CommandDisallowed
        );
    }

    #[test]
    fn encryption_mismatch_fails_sync() {
        let mut c = controller();
        c.big_create_sync(create_sync(1, 7, vec![1])).unwrap();

        let err = c.biginfo_received(7, &[0; 57], 0, 0).unwrap_err();
        assert_eq!(err.status(), HciStatus::EncryptionModeNotAcceptable);
        assert_eq!(
            c.drain_events(),
            vec![IsoEvent::BigSyncEstablished {
                status: HciStatus::EncryptionModeNotAcceptable,
                big_handle: 1,
                info: None,
            }]
        );
        assert_eq!(c.sync_state(1), None);
    }

    #[test]
    fn biginfo_for_other_train_is_ignored() {
        let mut c = controller();
        c.big_create_sync(create_sync(1, 7, vec![1])).unwrap();
        c.biginfo_received(8, &broadcaster_biginfo(0), 0, 0).unwrap();
        assert_eq!(c.sync_state(1), Some(iso_mux::SyncState::AwaitingBigInfo));
    }

    #[test]
    fn bis_outside_big_fails_sync() {
        let mut c = controller();
        c.big_create_sync(create_sync(1, 7, vec![3, 4])).unwrap();
        let err = c
            .biginfo_received(7, &broadcaster_biginfo(0), 0, 0)
            .unwrap_err();
        assert_eq!(err.status(), HciStatus::InvalidParameters);
        assert_eq!(c.sync_state(1), None);
    }

    #[test]
    fn distant_anchor_fails_sync_with_window_too_wide() {
        let mut info = BigInfo::decode(&broadcaster_biginfo(0)).unwrap();
        info.big_offset = 0x3FFF;
        info.offset_units = OffsetUnits::Us300;

        let mut c = controller();
        c.big_create_sync(create_sync(1, 7, vec![1])).unwrap();
        let err = c.biginfo_received(7, &info.encode(), 0, 0).unwrap_err();
        assert!(matches!(err, IsoError::WindowTooWide { .. }));
        assert_eq!(
            c.drain_events(),
            vec![IsoEvent::BigSyncEstablished {
                status: HciStatus::UnacceptableConnectionParameters,
                big_handle: 1,
                info: None,
            }]
        );
        assert_eq!(c.sync_state(1), None);
        assert_eq!(
            c.available_sync_bis(),
            ControllerConfig::default().max_sync_bis
        );
        assert!(c.radio().received.is_empty());
    }

    #[test]
    fn first_window_is_widened_and_extended() {
        let mut c = controller();
        c.big_create_sync(create_sync(1, 7, vec![1])).unwrap();
        c.biginfo_received(7, &broadcaster_biginfo(0), 0, 0).unwrap();
        assert_eq!(c.sync_state(1), Some(iso_mux::SyncState::Syncing));

        assert_eq!(run_next_event(&mut c), 2);
        let first = c.radio().received[0].1;
        // offset 10_250 floors to 10_230; 550 ppm over 10_230 us widens by 6 us
        assert_eq!(first.start_us, 10_230 - 6);
        assert_eq!(first.window_us, 2 * 6 + 30 + 32);
        assert_eq!(c.radio().wfr_timeout_us, Some(first.window_us));
    }

    #[test]
    fn unanswered_sync_times_out() {
        let mut c = controller();
        c.big_create_sync(create_sync(1, 7, vec![1])).unwrap();
        c.biginfo_received(7, &broadcaster_biginfo(0), 0, 0).unwrap();

        let mut events_run = 0;
        while c.sync_state(1).is_some() {
            assert!(run_next_event(&mut c) > 0);
            events_run += 1;
            assert!(events_run < 20);
        }
        // 100 ms timeout from the PA anchor, anchors at 10.23 ms + k * 10 ms
        assert_eq!(events_run, 9);
        assert_eq!(
            c.drain_events(),
            vec![IsoEvent::BigSyncEstablished {
                status: HciStatus::ConnectionFailedToBeEstablished,
                big_handle: 1,
                info: None,
            }]
        );
        assert_eq!(
            c.available_sync_bis(),
            ControllerConfig::default().max_sync_bis
        );
    }

    #[test]
    fn terminate_pending_sync_reports_cancel() {
        let mut c = controller();
        c.big_create_sync(create_sync(1, 7, vec![1])).unwrap();
        c.big_terminate_sync(&iso_mux::BigTerminateSync { big_handle: 1 })
            .unwrap();
        assert_eq!(
            c.drain_events(),
            vec![IsoEvent::BigSyncEstablished {
                status: HciStatus::OperationCancelledByHost,
                big_handle: 1,
                info: None,
            }]
        );
        assert_eq!(
            c.big_terminate_sync(&iso_mux::BigTerminateSync { big_handle: 1 })
                .unwrap_err(),
            IsoError::UnknownSync(1)
        );
    }
}

// ============================================================================
// Property Tests
// ============================================================================

mod property_tests {
    use super::*;
    use iso_mux::BigParams;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn derived_parameters_are_consistent(
            sdu_interval_us in 0xFFu32..=200_000,
            max_sdu in 1u16..=600,
            rtn in 0u8..=0x1E,
            framed in any::<bool>(),
        ) {
            let cmd = CreateBig {
                sdu_interval_us,
                max_sdu,
                rtn,
                num_bis: 1,
                framing: if framed { Framing::Framed } else { Framing::Unframed },
                ..create_big(1)
            };
            if let Ok(params) = BigParams::from_create(&cmd) {
                prop_assert!((1..=7).contains(&params.bn));
                prop_assert_eq!(params.nse % params.bn, 0);
                prop_assert!(params.irc <= params.nse / params.bn);
                prop_assert!(params.max_pdu <= 251);
                let layout = params.layout();
                prop_assert!(layout.event_duration_us(true) <= layout.iso_interval_us());
                if params.framing == Framing::Unframed {
                    prop_assert_eq!(layout.iso_interval_us() % sdu_interval_us, 0);
                }
            }
        }
    }
}
