//! Driver scenarios against the software model of the controller

use crate::bus::{Can, ConfigurationError, Error};
use crate::config::{BitTiming, CanConfig, Loopback, Mode, OverflowPolicy, StbMode, WorkMode};
use crate::config::SLOW_BIT_TIMING_RANGES;
use crate::error::{ErrorType, NodeState};
use crate::filter::{AcceptanceFilter, FilterSet};
use crate::message::TxFrame;
use crate::reg::{CanRegisters, Command, FastTiming, SlowTiming};
use crate::rx_fifo::{RxStatus, RX_SLOTS};
use crate::sim::{Controller, Role, SimCan};
use crate::status::{StatusFlag, StatusSet};
use crate::ttc::{TriggerType, TtcConfig};
use crate::tx_buffers::{BufferType, StbPolicy, StbStatus};
use canctrl_core::Duration;
use embedded_can::{Frame, Id, StandardId};
use fugit::RateExtU32;
use proptest::prelude::*;

type SimBus<'a> = Can<SimCan, &'a Controller, &'a Controller, &'a Controller>;

/// 500 kbit/s at 40 MHz
const NOMINAL: BitTiming = BitTiming::new(16, 4, 1, 4);

fn std_id(raw: u16) -> StandardId {
    StandardId::new(raw).unwrap()
}

fn frame(raw: u16) -> TxFrame {
    TxFrame::new_classic(std_id(raw), &[raw as u8]).unwrap()
}

fn raw_id(frame: &impl Frame) -> u16 {
    match frame.id() {
        Id::Standard(id) => id.as_raw(),
        Id::Extended(_) => panic!("unexpected extended frame"),
    }
}

fn open(sim: &Controller, config: CanConfig) -> SimBus<'_> {
    Can::<SimCan, _, _, _>::init(sim, sim, sim, config).unwrap()
}

fn no_wait() -> Duration {
    Duration::from_ticks(0)
}

fn single(flag: StatusFlag) -> StatusSet {
    flag.into()
}

fn slow_timing() -> impl Strategy<Value = BitTiming> {
    (1_u8..=32, 1_u16..=256).prop_flat_map(|(segment2, prescaler)| {
        (segment2 + 1..=65, 1..=segment2.min(16)).prop_map(move |(segment1, sjw)| {
            BitTiming::new(segment1, segment2, sjw, prescaler)
        })
    })
}

fn invalid_slow_timing() -> impl Strategy<Value = BitTiming> {
    (0_u8..=70, 0_u8..=36, 0_u8..=20, 0_u16..=300)
        .prop_map(|(segment1, segment2, sjw, prescaler)| {
            BitTiming::new(segment1, segment2, sjw, prescaler)
        })
        .prop_filter("timing must be invalid", |t| {
            t.check(&SLOW_BIT_TIMING_RANGES).is_err()
        })
}

/// Puts `frame` in the next free STB slot without requesting it
fn fill_stb(sim: &Controller, frame: &TxFrame) {
    let mut regs = sim;
    regs.modify_reg::<Command, _>(|w| w.set_tbsel(true));
    frame.0.write_to(&mut regs);
    regs.modify_reg::<Command, _>(|w| w.set_tsnext(true));
}

fn sent(sim: &Controller) -> Vec<u16> {
    core::iter::from_fn(|| sim.pop_transmitted())
        .map(|f| raw_id(&f))
        .collect()
}

/// TTC running with `slot` filled, the cycle timer restarted now
fn ttc_with_slot<'a>(sim: &'a Controller, config: &TtcConfig, slot: u8, id: u16) -> SimBus<'a> {
    let mut can = open(sim, CanConfig::new(NOMINAL));
    can.configure_ttc(config).unwrap();
    can.enable_ttc(true);
    can.ttc().write_slot(slot, &frame(id)).unwrap();
    can
}

proptest! {
    #[test]
    fn invalid_slow_timing_is_never_programmed(timing in invalid_slow_timing()) {
        let sim = Controller::new(40.MHz());
        let before: SlowTiming = (&sim).read_reg();
        let result = Can::<SimCan, _, _, _>::init(&sim, &sim, &sim, CanConfig::new(timing));
        prop_assert!(matches!(result, Err(ConfigurationError::BitTiming(_))));
        prop_assert_eq!((&sim).read_reg::<SlowTiming>(), before);
        prop_assert!((&sim).read_reg::<Command>().reset());
    }

    #[test]
    fn valid_slow_timing_reads_back(timing in slow_timing()) {
        let sim = Controller::new(40.MHz());
        let can = open(&sim, CanConfig::new(timing));
        prop_assert_eq!(can.slow_timing(), timing);
    }

    #[test]
    fn fifo_keeps_arrival_order(ids in prop::collection::vec(0_u16..0x800, 1..=RX_SLOTS)) {
        let sim = Controller::new(40.MHz());
        let mut can = open(&sim, CanConfig::new(NOMINAL));
        for &id in &ids {
            prop_assert!(sim.deliver(&frame(id)));
        }
        let received: Vec<u16> = can.receive(RX_SLOTS).map(|f| raw_id(&f)).collect();
        prop_assert_eq!(received, ids);
        prop_assert!(can.rx().is_empty());
    }
}

#[test]
fn five_hundred_kbit_end_to_end() {
    let sim = Controller::new(40.MHz());
    let can = open(&sim, CanConfig::new(NOMINAL));
    assert_eq!(can.bitrate(), 500.kHz::<1, 1>());
    assert_eq!(can.slow_timing(), NOMINAL);
    assert!(!(&sim).read_reg::<Command>().reset());
}

#[test]
fn fd_timing_and_compensation_are_programmed() {
    let sim = Controller::new(40.MHz());
    let mut config = CanConfig::new(NOMINAL);
    let fast = BitTiming::new(15, 4, 4, 1);
    config.mode = Mode::Fd {
        fast_timing: fast,
        iso: true,
        tdc: Some(15),
    };
    let can = open(&sim, config);
    assert_eq!(can.fast_timing(), fast);
    assert!((&sim).read_reg::<Command>().fd_iso());
}

#[test]
fn invalid_timing_leaves_registers_untouched() {
    let sim = Controller::new(40.MHz());
    let before: SlowTiming = (&sim).read_reg();
    let config = CanConfig::new(BitTiming::new(4, 4, 1, 1));
    let result = Can::<SimCan, _, _, _>::init(&sim, &sim, &sim, config);
    assert!(matches!(result, Err(ConfigurationError::BitTiming(_))));
    assert_eq!((&sim).read_reg::<SlowTiming>(), before);
    assert_eq!((&sim).read_reg::<FastTiming>(), FastTiming::default());
    assert!((&sim).read_reg::<Command>().reset());
}

#[test]
fn out_of_range_limits_are_rejected() {
    let sim = Controller::new(40.MHz());
    let mut config = CanConfig::new(NOMINAL);
    config.rx.almost_full_limit = 0;
    let result = Can::<SimCan, _, _, _>::init(&sim, &sim, &sim, config);
    assert!(matches!(result, Err(ConfigurationError::InvalidAlmostFullLimit)));

    let mut config = CanConfig::new(NOMINAL);
    config.error_warning_limit = 16;
    let result = Can::<SimCan, _, _, _>::init(&sim, &sim, &sim, config);
    assert!(matches!(result, Err(ConfigurationError::InvalidErrorWarningLimit)));
}

#[test]
fn filters_select_frames_and_enable_is_idempotent() {
    let sim = Controller::new(40.MHz());
    let mut can = open(&sim, CanConfig::new(NOMINAL));
    let selection: FilterSet = [1].into_iter().collect();
    let filter = AcceptanceFilter::standard(std_id(0x100), 0x00F);
    can.configure_filters(selection, &[filter]).unwrap();
    assert_eq!(can.filters().read(1), Some(filter));

    can.enable_filters(selection, true);
    let once = can.filters().enabled();
    can.enable_filters(selection, true);
    assert_eq!(can.filters().enabled(), once);

    can.enable_filters([0].into_iter().collect(), false);
    assert_eq!(can.filters().enabled(), selection);
    assert!(sim.deliver(&frame(0x105)));
    assert!(!sim.deliver(&frame(0x200)));

    can.enable_filters(selection, false);
    assert!(can.filters().enabled().is_empty());
    assert!(!sim.deliver(&frame(0x105)));
}

#[test]
fn filter_configuration_checks_selection() {
    let sim = Controller::new(40.MHz());
    let mut can = open(&sim, CanConfig::new(NOMINAL));
    let two: FilterSet = [2, 3].into_iter().collect();
    assert_eq!(
        can.configure_filters(two, &[AcceptanceFilter::accept_all()]),
        Err(ConfigurationError::FilterCountMismatch)
    );
    let outside: FilterSet = [16].into_iter().collect();
    assert_eq!(
        can.configure_filters(outside, &[AcceptanceFilter::accept_all()]),
        Err(ConfigurationError::FilterIndex)
    );
    // Outside of reset the bank is read-only
    assert_eq!(
        can.filters().configure(two, &[AcceptanceFilter::accept_all(); 2]),
        Err(ConfigurationError::NotInReset)
    );
}

#[test]
fn discard_new_keeps_buffer_contents() {
    let sim = Controller::new(40.MHz());
    let mut config = CanConfig::new(NOMINAL);
    config.rx.overflow = OverflowPolicy::DiscardNew;
    let mut can = open(&sim, config);
    for id in 0..RX_SLOTS as u16 {
        assert!(sim.deliver(&frame(id)));
    }
    assert_eq!(can.rx().status(), RxStatus::Full);
    let checksum = sim.rx_checksum();

    assert!(!sim.deliver(&frame(0x7FF)));
    assert_eq!(sim.rx_checksum(), checksum);
    assert!(can.rx().overflowed());
    assert!(can.get_status(single(StatusFlag::RxOverrun)));

    let first = can.receive_one().unwrap();
    assert_eq!(raw_id(&first), 0);
}

#[test]
fn save_new_overwrites_oldest_frame() {
    let sim = Controller::new(40.MHz());
    let mut can = open(&sim, CanConfig::new(NOMINAL));
    for id in 0..=RX_SLOTS as u16 {
        assert!(sim.deliver(&frame(id)));
    }
    assert!(can.get_status(single(StatusFlag::RxOverflow)));
    let received: Vec<u16> = can.receive(RX_SLOTS).map(|f| raw_id(&f)).collect();
    assert_eq!(received, (1..=RX_SLOTS as u16).collect::<Vec<_>>());
    assert!(!can.get_status(single(StatusFlag::RxOverflow)));
}

#[test]
fn receive_stops_at_requested_count() {
    let sim = Controller::new(40.MHz());
    let mut can = open(&sim, CanConfig::new(NOMINAL));
    for id in 0..3 {
        sim.deliver(&frame(id));
    }
    assert_eq!(can.receive(2).count(), 2);
    assert_eq!(can.receive(8).count(), 1);
    assert!(can.receive_one().is_err());
}

#[test]
fn priority_mode_sends_lowest_identifier_first() {
    let sim = Controller::new(40.MHz());
    let mut config = CanConfig::new(NOMINAL);
    config.tx.stb_mode = StbMode::Priority;
    let mut can = open(&sim, config);
    for id in [0x100, 0x050, 0x200] {
        can.transmit(&frame(id), BufferType::Secondary, StbPolicy::All, no_wait())
            .unwrap();
    }
    assert_eq!(can.transmit_status().stb, StbStatus::LessOrEqualHalf);

    sim.run_until_idle();
    let sent: Vec<u16> = core::iter::from_fn(|| sim.pop_transmitted())
        .map(|f| raw_id(&f))
        .collect();
    assert_eq!(sent, [0x050, 0x100, 0x200]);
    assert_eq!(can.transmit_status().stb, StbStatus::Empty);
}

#[test]
fn fifo_mode_keeps_enqueue_order() {
    let sim = Controller::new(40.MHz());
    let mut can = open(&sim, CanConfig::new(NOMINAL));
    for id in [0x100, 0x050, 0x200] {
        can.transmit(&frame(id), BufferType::Secondary, StbPolicy::All, no_wait())
            .unwrap();
    }
    sim.run_until_idle();
    let sent: Vec<u16> = core::iter::from_fn(|| sim.pop_transmitted())
        .map(|f| raw_id(&f))
        .collect();
    assert_eq!(sent, [0x100, 0x050, 0x200]);
}

#[test]
fn primary_buffer_preempts_secondary() {
    let sim = Controller::new(40.MHz());
    let mut can = open(&sim, CanConfig::new(NOMINAL));
    for id in [0x001, 0x002] {
        can.transmit(&frame(id), BufferType::Secondary, StbPolicy::All, no_wait())
            .unwrap();
    }
    can.transmit(&frame(0x7FF), BufferType::Primary, StbPolicy::All, no_wait())
        .unwrap();
    assert!(can.transmit_status().ptb_busy);
    assert_eq!(
        can.transmit(&frame(0x7FE), BufferType::Primary, StbPolicy::All, no_wait()),
        Err(Error::BufferFull)
    );

    sim.run_until_idle();
    let sent: Vec<u16> = core::iter::from_fn(|| sim.pop_transmitted())
        .map(|f| raw_id(&f))
        .collect();
    assert_eq!(sent, [0x7FF, 0x001, 0x002]);
    assert!(can.get_status(single(StatusFlag::PtbComplete)));
    assert!(can.get_status(single(StatusFlag::StbComplete)));
}

#[test]
fn stb_full_rejects_another_frame() {
    let sim = Controller::new(40.MHz());
    let mut can = open(&sim, CanConfig::new(NOMINAL));
    for id in 0..16 {
        can.transmit(&frame(id), BufferType::Secondary, StbPolicy::All, no_wait())
            .unwrap();
    }
    assert_eq!(can.transmit_status().stb, StbStatus::Full);
    assert!(can.get_status(single(StatusFlag::StbFull)));
    assert_eq!(
        can.transmit(&frame(0x10), BufferType::Secondary, StbPolicy::All, no_wait()),
        Err(Error::BufferFull)
    );
}

#[test]
fn waiting_transmit_completes() {
    let sim = Controller::new(40.MHz());
    let mut can = open(&sim, CanConfig::new(NOMINAL));
    can.transmit(
        &frame(0x123),
        BufferType::Primary,
        StbPolicy::All,
        Duration::millis(10),
    )
    .unwrap();
    assert_eq!(sim.pop_transmitted().map(|f| raw_id(&f)), Some(0x123));
    assert!(!can.transmit_status().ptb_busy);
}

#[test]
fn unacknowledged_transmit_times_out_and_stays_queued() {
    let sim = Controller::new(40.MHz());
    let mut can = open(&sim, CanConfig::new(NOMINAL));
    sim.set_peer_ack(false);
    assert_eq!(
        can.transmit(
            &frame(0x123),
            BufferType::Primary,
            StbPolicy::All,
            Duration::millis(1),
        ),
        Err(Error::Timeout)
    );
    assert!(can.transmit_status().ptb_busy);
    assert!(can.error_state().tx_error_count > 0);
    assert!(sim.pop_transmitted().is_none());

    sim.set_peer_ack(true);
    sim.run_until_idle();
    assert_eq!(sim.pop_transmitted().map(|f| raw_id(&f)), Some(0x123));
}

#[test]
fn abort_empties_pending_buffers() {
    let sim = Controller::new(40.MHz());
    let mut can = open(&sim, CanConfig::new(NOMINAL));
    for id in [0x10, 0x11] {
        can.transmit(&frame(id), BufferType::Secondary, StbPolicy::All, no_wait())
            .unwrap();
    }
    can.transmit(&frame(0x12), BufferType::Primary, StbPolicy::All, no_wait())
        .unwrap();
    assert_eq!(
        can.abort_transmit([BufferType::Primary, BufferType::Secondary].into_iter().collect()),
        Ok(())
    );
    assert!(can.get_status(single(StatusFlag::AbortComplete)));
    let status = can.transmit_status();
    assert!(!status.ptb_busy);
    assert_eq!(status.stb, StbStatus::Empty);
    sim.run_until_idle();
    assert!(sim.pop_transmitted().is_none());
}

#[test]
fn fd_frame_needs_fd_mode() {
    let sim = Controller::new(40.MHz());
    let mut can = open(&sim, CanConfig::new(NOMINAL));
    let fd = TxFrame::new_fd(std_id(0x10), &[0; 12], false).unwrap();
    assert_eq!(
        can.transmit(&fd, BufferType::Primary, StbPolicy::All, no_wait()),
        Err(Error::Configuration(ConfigurationError::FdDisabled))
    );
}

#[test]
fn internal_loopback_receives_own_frames() {
    let sim = Controller::new(40.MHz());
    let mut can = open(&sim, CanConfig::new(NOMINAL)).into_test_mode(Loopback::Internal);
    can.transmit(
        &frame(0x321),
        BufferType::Primary,
        StbPolicy::All,
        Duration::millis(10),
    )
    .unwrap();
    let received = can.receive_one().unwrap();
    assert_eq!(raw_id(&received), 0x321);
    assert!(received.is_loopback());
    assert_eq!(received.data(), &[0x21]);
    // Internal loopback keeps the bus untouched
    assert!(sim.pop_transmitted().is_none());
}

#[test]
fn test_mode_controls_error_counters() {
    let sim = Controller::new(40.MHz());
    let mut can = open(&sim, CanConfig::new(NOMINAL))
        .into_test_mode(Loopback::External { self_ack: true });
    can.force_bus_off();
    let state = can.error_state();
    assert_eq!(state.node_state(), NodeState::BusOff);
    assert!(can.get_status(single(StatusFlag::BusOff)));

    can.clear_error_counters();
    let state = can.error_state();
    assert_eq!(state.node_state(), NodeState::ErrorActive);
    assert_eq!((state.tx_error_count, state.rx_error_count), (0, 0));

    let can = can.into_production(Default::default());
    let command: Command = (&sim).read_reg();
    assert!(!command.lbmi() && !command.lbme() && !command.sack());
    assert!(!can.error_state().bus_off);
}

#[test]
fn error_counters_walk_through_fault_states() {
    let sim = Controller::new(40.MHz());
    let mut can = open(&sim, CanConfig::new(NOMINAL));
    for _ in 0..12 {
        sim.inject_error(ErrorType::Bit, Role::Transmitter);
    }
    let state = can.error_state();
    assert_eq!(state.tx_error_count, 96);
    assert!(state.error_warning);
    assert_eq!(state.last_error_type, ErrorType::Bit);
    assert!(can.get_status(single(StatusFlag::ErrorWarning)));

    for _ in 0..4 {
        sim.inject_error(ErrorType::Form, Role::Transmitter);
    }
    assert_eq!(can.error_state().node_state(), NodeState::ErrorPassive);
    assert!(can.get_status(single(StatusFlag::ErrorPassiveChanged)));

    for _ in 0..16 {
        sim.inject_error(ErrorType::Crc, Role::Transmitter);
    }
    assert_eq!(can.error_state().node_state(), NodeState::BusOff);

    // 128 * 11 bit times of 80 ticks
    sim.advance(128 * 11 * 80);
    let state = can.error_state();
    assert_eq!(state.node_state(), NodeState::ErrorActive);
    assert_eq!(state.tx_error_count, 0);
}

#[test]
fn interrupts_are_reported_when_enabled() {
    let sim = Controller::new(40.MHz());
    let mut can = open(&sim, CanConfig::new(NOMINAL));
    sim.deliver(&frame(0x42));
    assert!(can.get_status(single(StatusFlag::RxComplete)));
    assert!(can.pending_interrupts().is_empty());

    can.int_cmd(single(StatusFlag::RxComplete), true);
    assert!(can.pending_interrupts().contains(StatusFlag::RxComplete));
    assert!(can.status().enabled().contains(StatusFlag::RxComplete));

    can.clear_status(single(StatusFlag::RxComplete));
    assert!(!can.get_status(single(StatusFlag::RxComplete)));
    assert!(can.pending_interrupts().is_empty());
    // The frame itself is still buffered
    assert!(!can.rx().is_empty());
}

#[test]
fn state_flags_ignore_clear() {
    let sim = Controller::new(40.MHz());
    let mut can = open(&sim, CanConfig::new(NOMINAL)).into_test_mode(Loopback::Internal);
    can.force_bus_off();
    can.clear_status(StatusSet::all());
    assert!(can.get_status(single(StatusFlag::BusOff)));
}

#[test]
fn time_trigger_fires_at_configured_cycle_time() {
    const TRIGGER_TIME: u16 = 1000;

    let sim = Controller::new(40.MHz());
    let mut can = open(&sim, CanConfig::new(NOMINAL));
    let mut config = TtcConfig::new(StandardId::MAX);
    config.trigger_type = TriggerType::Time;
    config.trigger_time = TRIGGER_TIME;
    can.configure_ttc(&config).unwrap();
    assert_eq!(can.ttc().config(), Ok(config));

    can.enable_ttc(true);
    assert!(sim.deliver(&TxFrame::new_classic(StandardId::MAX, &[]).unwrap()));
    assert_eq!(can.ttc_timer(), 0);

    sim.advance(u64::from(TRIGGER_TIME) - 1);
    assert!(!can.get_status(single(StatusFlag::TimeTrigger)));
    sim.advance(1);
    assert!(can.get_status(single(StatusFlag::TimeTrigger)));
    assert_eq!(can.ttc_timer(), TRIGGER_TIME);
}

#[test]
fn transmit_start_trigger_sends_slot() {
    let sim = Controller::new(40.MHz());
    let mut can = open(&sim, CanConfig::new(NOMINAL));
    let mut config = TtcConfig::new(StandardId::MAX);
    config.trigger_type = TriggerType::TransmitStart;
    config.transmit_slot = 3;
    config.trigger_time = 500;
    can.configure_ttc(&config).unwrap();
    can.enable_ttc(true);

    can.ttc().write_slot(3, &frame(0x0AA)).unwrap();
    assert_eq!(can.ttc().is_slot_filled(3), Ok(true));
    assert_eq!(
        can.transmit(&frame(0x0AB), BufferType::Primary, StbPolicy::All, no_wait()),
        Err(Error::Configuration(ConfigurationError::NotOperational))
    );

    sim.deliver(&TxFrame::new_classic(StandardId::MAX, &[]).unwrap());
    sim.advance(499);
    assert!(sim.pop_transmitted().is_none());
    sim.advance(1);
    sim.run_until_idle();
    assert_eq!(sim.pop_transmitted().map(|f| raw_id(&f)), Some(0x0AA));
    assert_eq!(can.ttc().is_slot_filled(3), Ok(false));
}

#[test]
fn trigger_in_the_past_is_an_error() {
    let sim = Controller::new(40.MHz());
    let mut can = open(&sim, CanConfig::new(NOMINAL));
    let mut config = TtcConfig::new(StandardId::MAX);
    config.trigger_time = u16::MAX;
    can.configure_ttc(&config).unwrap();
    can.enable_ttc(true);
    sim.advance(200);
    can.ttc().set_trigger(TriggerType::Time, 0, 100).unwrap();
    assert!(can.get_status(single(StatusFlag::TriggerError)));
    assert!(!can.get_status(single(StatusFlag::TimeTrigger)));
}

#[test]
fn missing_reference_raises_watch_trigger() {
    let sim = Controller::new(40.MHz());
    let mut can = open(&sim, CanConfig::new(NOMINAL));
    let mut config = TtcConfig::new(StandardId::MAX);
    config.trigger_time = u16::MAX;
    config.watch_trigger_time = 2000;
    can.configure_ttc(&config).unwrap();
    can.enable_ttc(true);

    sim.advance(1999);
    assert!(!can.get_status(single(StatusFlag::WatchTrigger)));
    sim.advance(1);
    assert!(can.get_status(single(StatusFlag::WatchTrigger)));
}

#[test]
fn reconfigure_round_trip() {
    let sim = Controller::new(40.MHz());
    let can = open(&sim, CanConfig::new(NOMINAL));
    let mut configurable = can.configure();
    assert!((&sim).read_reg::<Command>().reset());
    configurable.config().slow_timing = BitTiming::new(32, 8, 2, 4);
    let can = configurable.finalize().unwrap();
    assert_eq!(can.bitrate(), 250.kHz::<1, 1>());

    let (_, regs, _) = can.deinit();
    assert!(regs.read_reg::<Command>().reset());
}

#[test]
fn embedded_can_interface() {
    let sim = Controller::new(40.MHz());
    let mut can = open(&sim, CanConfig::new(NOMINAL));
    assert_eq!(embedded_can::nb::Can::transmit(&mut can, &frame(0x55)), Ok(None));
    sim.run_until_idle();
    assert_eq!(sim.pop_transmitted().map(|f| raw_id(&f)), Some(0x55));

    assert!(matches!(
        embedded_can::nb::Can::receive(&mut can),
        Err(nb::Error::WouldBlock)
    ));
    sim.deliver(&frame(0x56));
    let received = embedded_can::nb::Can::receive(&mut can).unwrap();
    assert_eq!(raw_id(&received), 0x56);
}

#[test]
fn drain_holds_only_frames_buffered_at_call_time() {
    let sim = Controller::new(40.MHz());
    let mut can = open(&sim, CanConfig::new(NOMINAL));
    sim.deliver(&frame(0x10));
    let mut drain = can.receive(RX_SLOTS);
    assert_eq!(drain.len(), 1);
    assert_eq!(drain.next().map(|f| raw_id(&f)), Some(0x10));
    sim.deliver(&frame(0x20));
    assert!(drain.next().is_none());
    assert_eq!(can.receive_one().map(|f| raw_id(&f)), Ok(0x20));
}

#[test]
fn rejected_transmit_keeps_completion_flag() {
    let sim = Controller::new(40.MHz());
    let mut can = open(&sim, CanConfig::new(NOMINAL));
    can.transmit(&frame(0x1), BufferType::Primary, StbPolicy::All, no_wait())
        .unwrap();
    sim.run_until_idle();
    assert!(can.get_status(single(StatusFlag::PtbComplete)));

    sim.set_peer_ack(false);
    can.transmit(&frame(0x2), BufferType::Primary, StbPolicy::All, no_wait())
        .unwrap();
    assert_eq!(
        can.transmit(
            &frame(0x3),
            BufferType::Primary,
            StbPolicy::All,
            Duration::millis(1),
        ),
        Err(Error::BufferFull)
    );
    assert!(can.get_status(single(StatusFlag::PtbComplete)));
}

#[test]
fn stb_one_policy_sends_a_single_slot() {
    let sim = Controller::new(40.MHz());
    let mut can = open(&sim, CanConfig::new(NOMINAL));
    fill_stb(&sim, &frame(0x0A));
    can.transmit(&frame(0x0B), BufferType::Secondary, StbPolicy::One, no_wait())
        .unwrap();
    sim.run_until_idle();
    assert_eq!(sent(&sim), [0x0A]);
    assert_eq!(can.transmit_status().stb, StbStatus::LessOrEqualHalf);

    can.transmit(&frame(0x0C), BufferType::Secondary, StbPolicy::All, no_wait())
        .unwrap();
    sim.run_until_idle();
    assert_eq!(sent(&sim), [0x0B, 0x0C]);
    assert_eq!(can.transmit_status().stb, StbStatus::Empty);
}

#[test]
fn single_shot_transmit_is_not_repeated() {
    let sim = Controller::new(40.MHz());
    let mut config = CanConfig::new(NOMINAL);
    config.tx.single_shot = true;
    let mut can = open(&sim, config);
    sim.set_peer_ack(false);
    can.transmit(&frame(0x44), BufferType::Primary, StbPolicy::All, no_wait())
        .unwrap();
    sim.run_until_idle();
    assert!(!can.transmit_status().ptb_busy);
    assert!(!can.get_status(single(StatusFlag::PtbComplete)));
    assert_eq!(can.error_state().tx_error_count, 8);

    sim.set_peer_ack(true);
    sim.run_until_idle();
    assert!(sim.pop_transmitted().is_none());
}

#[test]
fn listen_only_refuses_transmit() {
    let sim = Controller::new(40.MHz());
    let mut config = CanConfig::new(NOMINAL);
    config.work_mode = WorkMode::ListenOnly;
    let mut can = open(&sim, config);
    assert_eq!(
        can.transmit(&frame(0x10), BufferType::Secondary, StbPolicy::All, no_wait()),
        Err(Error::Configuration(ConfigurationError::NotOperational))
    );
    assert!(sim.deliver(&frame(0x11)));

    can.set_work_mode(WorkMode::Normal);
    can.transmit(&frame(0x10), BufferType::Primary, StbPolicy::All, no_wait())
        .unwrap();
    can.set_work_mode(WorkMode::ListenOnly);
    assert_eq!(
        can.transmit(&frame(0x12), BufferType::Secondary, StbPolicy::All, no_wait()),
        Err(Error::Configuration(ConfigurationError::NotOperational))
    );
    // Nothing goes out while listening
    sim.run_until_idle();
    assert!(sim.pop_transmitted().is_none());
    can.set_work_mode(WorkMode::Normal);
    sim.run_until_idle();
    assert_eq!(sent(&sim), [0x10]);
}

#[test]
fn lost_arbitration_is_captured() {
    let sim = Controller::new(40.MHz());
    let mut can = open(&sim, CanConfig::new(NOMINAL));
    can.transmit(&frame(0x300), BufferType::Primary, StbPolicy::All, no_wait())
        .unwrap();
    sim.advance(1);
    sim.lose_arbitration(7);
    assert_eq!(can.error_state().arbitration_lost_position, 7);
    assert!(can.get_status(single(StatusFlag::ArbitrationLost)));
    assert!(can.transmit_status().ptb_busy);

    sim.run_until_idle();
    assert_eq!(sent(&sim), [0x300]);
}

#[test]
fn receive_all_tags_erroneous_frames() {
    let sim = Controller::new(40.MHz());
    let mut can = open(&sim, CanConfig::new(NOMINAL));
    assert!(!sim.deliver_with_error(&frame(0x61), ErrorType::Crc));
    assert!(can.rx().is_empty());
    assert_eq!(can.error_state().rx_error_count, 1);

    let mut configurable = can.configure();
    configurable.config().rx.receive_all = true;
    let mut can = configurable.finalize().unwrap();
    assert!(sim.deliver_with_error(&frame(0x62), ErrorType::Stuff));
    assert!(sim.deliver(&frame(0x63)));
    let received: Vec<(u16, ErrorType)> = can
        .receive(RX_SLOTS)
        .map(|f| (raw_id(&f), f.error_type()))
        .collect();
    assert_eq!(received, [(0x62, ErrorType::Stuff), (0x63, ErrorType::None)]);
}

#[test]
fn clearing_overflow_releases_one_slot() {
    let sim = Controller::new(40.MHz());
    let mut can = open(&sim, CanConfig::new(NOMINAL));
    for id in 0..=RX_SLOTS as u16 {
        sim.deliver(&frame(id));
    }
    assert!(can.get_status(single(StatusFlag::RxOverflow)));
    can.clear_status(single(StatusFlag::RxOverflow));
    assert!(!can.get_status(single(StatusFlag::RxOverflow)));
    let received: Vec<u16> = can.receive(RX_SLOTS).map(|f| raw_id(&f)).collect();
    assert_eq!(received, (2..=RX_SLOTS as u16).collect::<Vec<_>>());
}

#[test]
fn immediate_trigger_sends_without_waiting() {
    let sim = Controller::new(40.MHz());
    let mut config = TtcConfig::new(StandardId::MAX);
    config.trigger_type = TriggerType::Immediate;
    config.transmit_slot = 1;
    let mut can = ttc_with_slot(&sim, &config, 1, 0x0B1);
    sim.run_until_idle();
    assert!(sim.pop_transmitted().is_none());

    can.clear_status(single(StatusFlag::TimeTrigger));
    can.ttc().set_trigger(TriggerType::Immediate, 1, 0).unwrap();
    assert!(can.get_status(single(StatusFlag::TimeTrigger)));
    sim.run_until_idle();
    assert_eq!(sent(&sim), [0x0B1]);
}

#[test]
fn transmit_stop_disarms_waiting_slot() {
    let sim = Controller::new(40.MHz());
    let mut config = TtcConfig::new(StandardId::MAX);
    config.trigger_type = TriggerType::TransmitStart;
    config.transmit_slot = 1;
    config.trigger_time = 100;
    let mut can = ttc_with_slot(&sim, &config, 1, 0x0A1);
    can.ttc().write_slot(2, &frame(0x0A2)).unwrap();

    // Slot 1 occupies the bus while slot 2 becomes ready
    sim.advance(100);
    can.ttc().set_trigger(TriggerType::TransmitStart, 2, 200).unwrap();
    sim.advance(100);
    can.ttc().set_trigger(TriggerType::TransmitStop, 2, 300).unwrap();
    sim.advance(100);

    sim.run_until_idle();
    assert_eq!(sent(&sim), [0x0A1]);
    assert_eq!(can.ttc().is_slot_filled(2), Ok(true));
}

#[test]
fn single_shot_trigger_drops_unacknowledged_frame() {
    let sim = Controller::new(40.MHz());
    let mut config = TtcConfig::new(StandardId::MAX);
    config.trigger_type = TriggerType::SingleShotTransmit;
    config.transmit_slot = 1;
    config.trigger_time = 100;
    config.transmit_enable_window = 16;
    let mut can = ttc_with_slot(&sim, &config, 1, 0x0C1);
    sim.set_peer_ack(false);

    sim.advance(100);
    sim.run_until_idle();
    assert_eq!(can.ttc().is_slot_filled(1), Ok(false));
    assert_eq!(can.error_state().tx_error_count, 8);
    assert!(sim.pop_transmitted().is_none());
}

#[test]
fn single_shot_trigger_expires_after_enable_window() {
    let sim = Controller::new(40.MHz());
    let mut config = TtcConfig::new(StandardId::MAX);
    config.trigger_type = TriggerType::TransmitStart;
    config.transmit_slot = 1;
    config.trigger_time = 100;
    let mut can = ttc_with_slot(&sim, &config, 1, 0x0D1);
    can.ttc().write_slot(2, &frame(0x0D2)).unwrap();

    sim.advance(100);
    can.ttc()
        .set_trigger(TriggerType::SingleShotTransmit, 2, 200)
        .unwrap();
    sim.advance(100);
    assert_eq!(can.ttc().is_slot_filled(2), Ok(true));

    sim.run_until_idle();
    assert_eq!(sent(&sim), [0x0D1]);
    assert_eq!(can.ttc().is_slot_filled(2), Ok(false));
}
