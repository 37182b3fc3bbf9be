//! Software model of the controller
//!
//! [`Controller`] implements [`CanRegisters`] and [`Monotonic`], so the driver
//! runs unchanged on a host. Buffers, acceptance filters, fault confinement
//! and TTC are modelled at register level. The bus is reduced to a peer that
//! acknowledges (or ignores) the frames sent by the node and injects frames
//! through [`Controller::deliver`].
//!
//! Time is counted in CAN kernel clock ticks. It moves forward with
//! [`Controller::advance`] and by one microsecond on every
//! [`Monotonic::now`] call, which lets the waits of the driver make progress
//! deterministically.

use crate::config::{BitTiming, StbMode};
use crate::error::{error_warning_threshold, ErrorType, ERROR_PASSIVE_THRESHOLD};
use crate::filter::{AcceptanceFilter, FILTER_COUNT};
use crate::message::{dlc_to_len, raw_to_id, RxFrame, TxFrame};
use crate::reg::{Acceptance, CanRegisters, Command, CycleTime, ErrorCapture, FastTiming};
use crate::reg::{FilterControl, FrameControl, FrameId, Interrupts, ReferenceMessage, Register};
use crate::reg::{SlowTiming, TimeTrigger, TriggerConfig, WatchTrigger};
use crate::reg::{RBUF, RBUF_WORDS, RTS_WORD, TBUF, TBUF_WORDS};
use crate::rx_fifo::RX_SLOTS;
use crate::ttc::TriggerType;
use crate::tx_buffers::{select_next, Queued, Selection, STB_SLOTS};
use canctrl_core::{CanId, Dependencies, Instant, Monotonic};
use core::cell::RefCell;
use fugit::HertzU32;

/// Identity of the simulated peripheral
pub enum SimCan {}

// Safety: the simulated register block is never accessed through `ADDRESS`,
// only through `&Controller`.
unsafe impl CanId for SimCan {
    const ADDRESS: *const () = core::ptr::null();
}

/// Side of a transfer an injected error is detected on
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Role {
    /// The node was sending; the transmit error counter grows by 8
    Transmitter,
    /// The node was receiving; the receive error counter grows by 1
    Receiver,
}

const SLOTS: usize = 1 + STB_SLOTS;
const LOG_DEPTH: usize = 32;
const MAX_IDLE_EVENTS: usize = 1024;
/// 128 occurrences of 11 recessive bits
const BUS_OFF_RECOVERY_BITS: u64 = 128 * 11;
const VERSION: u32 = 0x0100;

const COMMAND: usize = Command::OFFSET;
const INTERRUPTS: usize = Interrupts::OFFSET;
const SLOW_TIMING: usize = SlowTiming::OFFSET;
const FAST_TIMING: usize = FastTiming::OFFSET;
const ERROR_CAPTURE: usize = ErrorCapture::OFFSET;
const FILTER_CONTROL: usize = FilterControl::OFFSET;
const ACCEPTANCE: usize = Acceptance::OFFSET;
const TIME_TRIGGER: usize = TimeTrigger::OFFSET;
const REFERENCE: usize = ReferenceMessage::OFFSET;
const TRIGGER: usize = TriggerConfig::OFFSET;
const WATCH: usize = WatchTrigger::OFFSET;
const CYCLE_TIME: usize = CycleTime::OFFSET;

/// Command bits that hold state; everything else is a command or status
const COMMAND_STATE: u32 = 0xC8B0_E0F8;
/// Interrupt enables and limits
const INTERRUPT_STATE: u32 = 0xFF2A_00FE;
/// Writable bits of `TimeTrigger` that hold state
const TIME_TRIGGER_STATE: u32 = 0x973F_0000;
/// `sspoff` and `tdcen`
const TDC_STATE: u32 = 0xFF00;
const ID_BITS: u32 = 0x1FFF_FFFF;
const MASK_STATE: u32 = 0x7FFF_FFFF;

#[derive(Copy, Clone, PartialEq, Eq)]
enum SlotState {
    Empty,
    /// Holds a frame that is not requested yet
    Filled,
    /// Competes for the bus
    Ready,
}

#[derive(Copy, Clone)]
struct Slot {
    words: [u32; TBUF_WORDS],
    state: SlotState,
    order: u32,
    single_shot: bool,
}

const EMPTY_SLOT: Slot = Slot {
    words: [0; TBUF_WORDS],
    state: SlotState::Empty,
    order: 0,
    single_shot: false,
};

#[derive(Copy, Clone)]
struct Active {
    slot: usize,
    done_at: u64,
}

#[derive(Copy, Clone)]
enum Event {
    TransmissionDone,
    Trigger,
    Watch,
    WindowClosed,
    Recovery,
}

/// Transmit enable window of a single shot trigger that is still open
#[derive(Copy, Clone)]
struct Window {
    slot: usize,
    closes_at: u64,
}

/// Image of a frame in buffer window layout
struct Image([u32; RBUF_WORDS]);

impl CanRegisters for Image {
    fn read(&self, offset: usize) -> u32 {
        self.0.get(offset / 4).copied().unwrap_or(0)
    }

    fn write(&mut self, offset: usize, value: u32) {
        let word = offset.checked_sub(TBUF).map(|o| o / 4);
        if let Some(w) = word.and_then(|i| self.0.get_mut(i)) {
            *w = value;
        }
    }
}

fn flag(set: bool, bit: u32) -> u32 {
    u32::from(set) << bit
}

struct State {
    clock_hz: u32,
    ticks: u64,
    poll_step: u64,

    command: Command,
    interrupts: Interrupts,
    slow: SlowTiming,
    fast: FastTiming,
    tdc: ErrorCapture,
    filter_control: FilterControl,
    filters: [(u32, u32); FILTER_COUNT],
    time_trigger: TimeTrigger,
    reference: ReferenceMessage,
    trigger: TriggerConfig,
    watch: WatchTrigger,

    slots: [Slot; SLOTS],
    next_order: u32,
    active: Option<Active>,

    rx: [[u32; RBUF_WORDS]; RX_SLOTS],
    rx_head: usize,
    rx_len: usize,
    rov: bool,

    log: [[u32; TBUF_WORDS]; LOG_DEPTH],
    log_head: usize,
    log_len: usize,
    peer_ack: bool,

    tec: u16,
    rec: u16,
    koer: u8,
    alc: u8,
    bus_off: bool,
    bus_off_until: Option<u64>,
    error_passive: bool,
    error_warning: bool,

    epoch: u64,
    armed: bool,
    watch_fired: bool,
    window: Option<Window>,
}

impl State {
    fn new(can_clock: HertzU32) -> Self {
        let clock_hz = can_clock.raw().max(1);
        let mut command = Command::default();
        command.set_reset(true);
        let mut interrupts = Interrupts::default();
        interrupts.set_afwl(6);
        interrupts.set_ewl(0xB);
        let mut filter_control = FilterControl::default();
        filter_control.set_acf_en(1);
        let mut filters = [(0, 0); FILTER_COUNT];
        filters[0] = (0, ID_BITS);
        let mut watch = WatchTrigger::default();
        watch.set_wt_trig(u16::MAX);
        Self {
            clock_hz,
            ticks: 0,
            poll_step: u64::from(clock_hz / 1_000_000).max(1),
            command,
            interrupts,
            slow: SlowTiming::default(),
            fast: FastTiming::default(),
            tdc: ErrorCapture::default(),
            filter_control,
            filters,
            time_trigger: TimeTrigger::default(),
            reference: ReferenceMessage::default(),
            trigger: TriggerConfig::default(),
            watch,
            slots: [EMPTY_SLOT; SLOTS],
            next_order: 0,
            active: None,
            rx: [[0; RBUF_WORDS]; RX_SLOTS],
            rx_head: 0,
            rx_len: 0,
            rov: false,
            log: [[0; TBUF_WORDS]; LOG_DEPTH],
            log_head: 0,
            log_len: 0,
            peer_ack: true,
            tec: 0,
            rec: 0,
            koer: 0,
            alc: 0,
            bus_off: false,
            bus_off_until: None,
            error_passive: false,
            error_warning: false,
            epoch: 0,
            armed: false,
            watch_fired: false,
            window: None,
        }
    }

    fn in_reset(&self) -> bool {
        self.command.reset()
    }

    fn micros(&self) -> u64 {
        (u128::from(self.ticks) * 1_000_000 / u128::from(self.clock_hz)) as u64
    }

    // Register access

    fn read(&self, offset: usize) -> u32 {
        match offset {
            o if o < RBUF + 4 * RBUF_WORDS => self.rx_word((o - RBUF) / 4),
            o if (TBUF..TBUF + 4 * TBUF_WORDS).contains(&o) => 0,
            COMMAND => self.command_bits(),
            INTERRUPTS => {
                self.interrupts.bits()
                    | flag(self.stb_count() == STB_SLOTS, 0)
                    | flag(self.error_passive, 22)
                    | flag(self.error_warning, 23)
            }
            SLOW_TIMING => self.slow.bits(),
            FAST_TIMING => self.fast.bits(),
            ERROR_CAPTURE => {
                self.tdc.bits()
                    | u32::from(self.alc & 0x1F)
                    | u32::from(self.koer & 0x7) << 5
                    | u32::from(self.rec.min(255)) << 16
                    | u32::from(self.tec.min(255)) << 24
            }
            FILTER_CONTROL => self.filter_control.bits(),
            ACCEPTANCE => {
                let (code, mask) = self.filters[self.addressed_filter()];
                if self.filter_control.selmask() {
                    mask
                } else {
                    code
                }
            }
            TIME_TRIGGER => {
                let mut w = self.time_trigger;
                w.set_tbf(self.slots[self.addressed_slot()].state != SlotState::Empty);
                w.bits() | VERSION
            }
            REFERENCE => self.reference.bits(),
            TRIGGER => self.trigger.bits(),
            WATCH => self.watch.bits(),
            CYCLE_TIME => u32::from(self.cycle_time()),
            _ => 0,
        }
    }

    fn write(&mut self, offset: usize, value: u32) {
        match offset {
            o if (TBUF..TBUF + 4 * TBUF_WORDS).contains(&o) => {
                self.write_tbuf((o - TBUF) / 4, value)
            }
            COMMAND => self.write_command(Command::from_bits(value)),
            INTERRUPTS => {
                let flags = self.interrupts.bits() & Interrupts::ACTION_MASK & !value;
                self.interrupts = Interrupts::from_bits(flags | (value & INTERRUPT_STATE));
                self.update_fault_state();
            }
            SLOW_TIMING if self.in_reset() => self.slow = SlowTiming::from_bits(value),
            FAST_TIMING if self.in_reset() => self.fast = FastTiming::from_bits(value),
            ERROR_CAPTURE => self.tdc = ErrorCapture::from_bits(value & TDC_STATE),
            FILTER_CONTROL => self.filter_control = FilterControl::from_bits(value),
            ACCEPTANCE if self.in_reset() => {
                let index = self.addressed_filter();
                let selmask = self.filter_control.selmask();
                let filter = &mut self.filters[index];
                if selmask {
                    filter.1 = value & MASK_STATE;
                } else {
                    filter.0 = value & ID_BITS;
                }
            }
            TIME_TRIGGER => self.write_time_trigger(TimeTrigger::from_bits(value)),
            REFERENCE => self.reference = ReferenceMessage::from_bits(value),
            TRIGGER => {
                self.trigger = TriggerConfig::from_bits(value);
                self.arm();
            }
            WATCH => self.watch = WatchTrigger::from_bits(value),
            _ => {}
        }
    }

    fn command_bits(&self) -> u32 {
        let mut w = self.command;
        w.set_busoff(self.bus_off);
        w.set_tpe(self.slots[0].state != SlotState::Empty);
        w.set_tsall(self.stb().any(|s| s.state == SlotState::Ready));
        w.bits()
            | flag(self.active.is_some(), 1)
            | u32::from(self.stb_status()) << 16
            | u32::from(self.rx_status()) << 24
            | flag(self.rov, 29)
    }

    fn write_command(&mut self, w: Command) {
        let was_in_reset = self.in_reset();
        self.command = Command::from_bits(w.bits() & COMMAND_STATE);
        if w.reset() && !was_in_reset {
            self.flush();
        }
        if w.busoff() {
            self.bus_off_command();
        }
        if w.tpa() {
            self.abort(0..1);
        }
        if w.tsa() {
            self.abort(1..SLOTS);
        }
        if w.rrel() {
            self.release();
        }
        if self.in_reset() || self.command.tttbm() {
            return;
        }
        if w.tpe() && self.slots[0].state == SlotState::Empty {
            let single_shot = self.command.tpss();
            let ptb = &mut self.slots[0];
            ptb.state = SlotState::Ready;
            ptb.single_shot = single_shot;
        }
        if w.tsnext() {
            if let Some(index) = self.fill_slot() {
                self.slots[index].state = SlotState::Filled;
                self.slots[index].order = self.take_order();
            }
        }
        if w.tsone() {
            let next = (1..SLOTS)
                .filter(|&i| self.slots[i].state == SlotState::Filled)
                .min_by_key(|&i| self.slots[i].order);
            if let Some(index) = next {
                self.request(index);
            }
        }
        if w.tsall() {
            for index in 1..SLOTS {
                if self.slots[index].state == SlotState::Filled {
                    self.request(index);
                }
            }
        }
    }

    fn write_tbuf(&mut self, index: usize, value: u32) {
        let target = if self.command.tttbm() {
            Some(self.addressed_slot())
        } else if self.command.tbsel() {
            self.fill_slot()
        } else {
            Some(0)
        };
        if let Some(slot) = target.map(|i| &mut self.slots[i]) {
            if slot.state == SlotState::Empty {
                slot.words[index] = value;
            }
        }
    }

    fn write_time_trigger(&mut self, w: TimeTrigger) {
        let was_enabled = self.time_trigger.tten();
        let flags = self.time_trigger.bits() & TimeTrigger::ACTION_MASK & !w.bits();
        self.time_trigger = TimeTrigger::from_bits(flags | (w.bits() & TIME_TRIGGER_STATE));

        let index = self.addressed_slot();
        if w.tbe() && !self.is_active(index) {
            self.slots[index].state = SlotState::Empty;
        }
        if w.tbf() && self.command.tttbm() && self.slots[index].state == SlotState::Empty {
            self.slots[index].state = SlotState::Filled;
            self.slots[index].order = self.take_order();
        }

        match (was_enabled, w.tten()) {
            (false, true) => self.synchronize(),
            (true, false) => self.armed = false,
            _ => {}
        }
    }

    // Buffers

    fn stb(&self) -> impl Iterator<Item = &Slot> {
        self.slots[1..].iter()
    }

    fn stb_count(&self) -> usize {
        self.stb().filter(|s| s.state != SlotState::Empty).count()
    }

    fn stb_status(&self) -> u8 {
        match self.stb_count() {
            0 => 0,
            n if n <= STB_SLOTS / 2 => 1,
            n if n < STB_SLOTS => 2,
            _ => 3,
        }
    }

    fn rx_status(&self) -> u8 {
        match self.rx_len {
            0 => 0,
            RX_SLOTS => 3,
            n if n >= usize::from(self.interrupts.afwl()) => 2,
            _ => 1,
        }
    }

    fn rx_word(&self, index: usize) -> u32 {
        if self.rx_len == 0 {
            0
        } else {
            self.rx[self.rx_head][index]
        }
    }

    fn addressed_slot(&self) -> usize {
        usize::from(self.time_trigger.tbptr()).min(STB_SLOTS)
    }

    fn addressed_filter(&self) -> usize {
        usize::from(self.filter_control.acfadr()) % FILTER_COUNT
    }

    fn fill_slot(&self) -> Option<usize> {
        (1..SLOTS).find(|&i| self.slots[i].state == SlotState::Empty)
    }

    fn take_order(&mut self) -> u32 {
        let order = self.next_order;
        self.next_order = self.next_order.wrapping_add(1);
        order
    }

    fn request(&mut self, index: usize) {
        let single_shot = if index == 0 {
            self.command.tpss()
        } else {
            self.command.tsss()
        };
        let slot = &mut self.slots[index];
        slot.state = SlotState::Ready;
        slot.single_shot = single_shot;
    }

    fn is_active(&self, index: usize) -> bool {
        self.active.is_some_and(|a| a.slot == index)
    }

    fn abort(&mut self, range: core::ops::Range<usize>) {
        for index in range {
            if !self.is_active(index) {
                self.slots[index].state = SlotState::Empty;
            }
        }
        self.interrupts.set_aif(true);
    }

    fn release(&mut self) {
        if self.rx_len > 0 {
            self.rx_head = (self.rx_head + 1) % RX_SLOTS;
            self.rx_len -= 1;
        }
        self.rov = false;
    }

    fn flush(&mut self) {
        self.slots = [EMPTY_SLOT; SLOTS];
        self.active = None;
        self.window = None;
        self.rx_head = 0;
        self.rx_len = 0;
        self.rov = false;
    }

    fn slot_id(&self, index: usize) -> embedded_can::Id {
        let words = &self.slots[index].words;
        raw_to_id(FrameId(words[0]).id(), FrameControl(words[1]).ide())
    }

    // Timing

    fn bit_ticks(timing: BitTiming) -> u64 {
        u64::from(timing.prescaler) * u64::from(timing.time_quanta_per_bit())
    }

    fn frame_ticks(&self, words: &[u32; TBUF_WORDS]) -> u64 {
        let control = FrameControl(words[1]);
        let len = if control.rtr() {
            0
        } else {
            dlc_to_len(control.dlc(), control.fdf()) as u64
        };
        let slow = Self::bit_ticks(BitTiming::from_slow(self.slow));
        let data = if control.fdf() && control.brs() {
            Self::bit_ticks(BitTiming::from_fast(self.fast))
        } else {
            slow
        };
        let overhead = if control.ide() { 67 } else { 47 };
        (overhead * slow + 8 * len * data).max(1)
    }

    fn cycle_time(&self) -> u16 {
        if !self.time_trigger.tten() {
            return 0;
        }
        ((self.ticks - self.epoch) / self.timer_prescaler()) as u16
    }

    fn timer_prescaler(&self) -> u64 {
        1 << self.time_trigger.t_presc()
    }

    fn next_event(&self) -> Option<(u64, Event)> {
        let tten = self.time_trigger.tten();
        let presc = self.timer_prescaler();
        [
            self.active.map(|a| (a.done_at, Event::TransmissionDone)),
            (tten && self.armed).then(|| {
                let at = self.epoch + u64::from(self.trigger.tt_trig()) * presc;
                (at, Event::Trigger)
            }),
            (tten && !self.watch_fired).then(|| {
                let at = self.epoch + u64::from(self.watch.wt_trig()) * presc;
                (at, Event::Watch)
            }),
            self.window.map(|w| (w.closes_at, Event::WindowClosed)),
            self.bus_off_until.map(|at| (at, Event::Recovery)),
        ]
        .into_iter()
        .flatten()
        .min_by_key(|(at, _)| *at)
    }

    fn advance(&mut self, ticks: u64) {
        let target = self.ticks.saturating_add(ticks);
        self.kick();
        while let Some((at, event)) = self.next_event() {
            if at > target {
                break;
            }
            self.ticks = self.ticks.max(at);
            match event {
                Event::TransmissionDone => self.complete_transmission(),
                Event::Trigger => self.fire_trigger(),
                Event::Watch => {
                    self.watch_fired = true;
                    self.time_trigger.set_wtif(true);
                }
                Event::WindowClosed => self.close_window(),
                Event::Recovery => {
                    self.bus_off_until = None;
                    self.bus_off = false;
                    self.tec = 0;
                    self.rec = 0;
                    self.update_fault_state();
                }
            }
            self.kick();
        }
        self.ticks = target;
    }

    // Transmission

    /// Starts the next transmission if the bus is free
    fn kick(&mut self) {
        if self.active.is_some() || self.in_reset() || self.command.lom() || self.bus_off {
            return;
        }
        let ptb = (self.slots[0].state == SlotState::Ready).then(|| self.slot_id(0));
        let mut stb = [None; STB_SLOTS];
        for (i, queued) in stb.iter_mut().enumerate() {
            let slot = &self.slots[i + 1];
            if slot.state == SlotState::Ready {
                *queued = Some(Queued {
                    id: self.slot_id(i + 1),
                    order: slot.order,
                });
            }
        }
        let mode = if self.command.tsmode() {
            StbMode::Priority
        } else {
            StbMode::Fifo
        };
        let slot = match select_next(ptb, &stb, mode) {
            Some(Selection::Primary) => 0,
            Some(Selection::Secondary(i)) => i + 1,
            None => return,
        };
        if self.window.is_some_and(|w| w.slot == slot) {
            self.window = None;
        }
        self.active = Some(Active {
            slot,
            done_at: self.ticks + self.frame_ticks(&self.slots[slot].words),
        });
    }

    fn complete_transmission(&mut self) {
        let Some(active) = self.active.take() else {
            return;
        };
        let internal = self.command.lbmi();
        let external = self.command.lbme();
        let acknowledged = internal || self.peer_ack || (external && self.command.sack());
        let words = self.slots[active.slot].words;

        if acknowledged {
            self.slots[active.slot].state = SlotState::Empty;
            if active.slot == 0 {
                self.interrupts.set_tpif(true);
            } else {
                self.interrupts.set_tsif(true);
            }
            self.tec = self.tec.saturating_sub(1);
            if !internal {
                self.log_push(words);
            }
            if self.is_reference(words[0], words[1]) {
                self.synchronize();
            }
            if internal || external {
                let mut image = [0; RBUF_WORDS];
                image[..TBUF_WORDS].copy_from_slice(&words);
                self.store(image, ErrorType::None, true);
            }
        } else {
            self.tec = self.tec.saturating_add(8);
            self.koer = ErrorType::Ack.into();
            self.interrupts.set_beif(true);
            if self.slots[active.slot].single_shot {
                self.slots[active.slot].state = SlotState::Empty;
            }
        }
        self.update_fault_state();
    }

    fn log_push(&mut self, words: [u32; TBUF_WORDS]) {
        if self.log_len == LOG_DEPTH {
            self.log_head = (self.log_head + 1) % LOG_DEPTH;
            self.log_len -= 1;
        }
        self.log[(self.log_head + self.log_len) % LOG_DEPTH] = words;
        self.log_len += 1;
    }

    fn log_pop(&mut self) -> Option<[u32; TBUF_WORDS]> {
        if self.log_len == 0 {
            return None;
        }
        let words = self.log[self.log_head];
        self.log_head = (self.log_head + 1) % LOG_DEPTH;
        self.log_len -= 1;
        Some(words)
    }

    // Reception

    fn accepted(&self, id: embedded_can::Id) -> bool {
        let enabled = self.filter_control.acf_en();
        (0..FILTER_COUNT)
            .filter(|&i| enabled & (1 << i) != 0)
            .any(|i| {
                let (code, mask) = self.filters[i];
                AcceptanceFilter::from_words(Acceptance::from_bits(code), Acceptance::from_bits(mask))
                    .matches(id)
            })
    }

    /// Runs a frame through error accounting, filters and the receive FIFO.
    /// Returns `true` if it was stored.
    fn store(&mut self, mut image: [u32; RBUF_WORDS], error: ErrorType, own: bool) -> bool {
        if self.in_reset() {
            return false;
        }
        let id = FrameId(image[0]);
        let mut control = FrameControl(image[1]);

        if error != ErrorType::None {
            self.rec = self.rec.saturating_add(1);
            self.koer = error.into();
            self.interrupts.set_beif(true);
            self.update_fault_state();
            if !self.command.rball() {
                return false;
            }
        } else if !own {
            self.rec = self.rec.saturating_sub(1);
            self.update_fault_state();
            if self.is_reference(image[0], image[1]) {
                self.synchronize();
            }
        }

        if !self.accepted(raw_to_id(id.id(), control.ide())) {
            return false;
        }

        control.set_tx(own);
        control.set_koer(error.into());
        control.set_cycle_time(self.cycle_time());
        image[1] = control.0;
        if self.filter_control.timeen() {
            image[RTS_WORD] = self.ticks as u32;
            image[RTS_WORD + 1] = (self.ticks >> 32) as u32;
        }

        if self.rx_len == RX_SLOTS {
            self.rov = true;
            self.interrupts.set_roif(true);
            if self.command.rom() {
                return false;
            }
            self.rx_head = (self.rx_head + 1) % RX_SLOTS;
            self.rx_len -= 1;
        }
        self.rx[(self.rx_head + self.rx_len) % RX_SLOTS] = image;
        self.rx_len += 1;

        self.interrupts.set_rif(true);
        if self.rx_len >= usize::from(self.interrupts.afwl()) {
            self.interrupts.set_rafif(true);
        }
        if self.rx_len == RX_SLOTS {
            self.interrupts.set_rfif(true);
        }
        true
    }

    fn checksum(&self) -> u32 {
        (0..self.rx_len)
            .flat_map(|i| self.rx[(self.rx_head + i) % RX_SLOTS])
            .fold(0_u32, |sum, word| sum.wrapping_mul(31).wrapping_add(word))
    }

    // Fault confinement

    fn bus_off_command(&mut self) {
        if !(self.command.lbmi() || self.command.lbme()) {
            return;
        }
        if self.bus_off {
            self.bus_off = false;
            self.bus_off_until = None;
            self.tec = 0;
            self.rec = 0;
        } else {
            self.tec = 256;
        }
        self.update_fault_state();
    }

    fn update_fault_state(&mut self) {
        let reported_bus_off = self.bus_off;
        if self.tec > 255 && !self.bus_off {
            self.bus_off = true;
            self.active = None;
            let recovery = BUS_OFF_RECOVERY_BITS * Self::bit_ticks(BitTiming::from_slow(self.slow));
            self.bus_off_until = Some(self.ticks + recovery);
        }
        let limit = error_warning_threshold(self.interrupts.ewl());
        let warning = self.tec >= limit || self.rec >= limit;
        let threshold = u16::from(ERROR_PASSIVE_THRESHOLD);
        let passive = !self.bus_off && (self.tec >= threshold || self.rec >= threshold);
        if warning != self.error_warning || reported_bus_off != self.bus_off {
            self.interrupts.set_eif(true);
        }
        if passive != self.error_passive {
            self.interrupts.set_epif(true);
        }
        self.error_warning = warning;
        self.error_passive = passive;
    }

    // Time-triggered communication

    fn is_reference(&self, id: u32, control: u32) -> bool {
        self.time_trigger.tten()
            && FrameId(id).id() == self.reference.ref_id()
            && FrameControl(control).ide() == self.reference.ref_ide()
    }

    /// Restarts the cycle timer
    fn synchronize(&mut self) {
        self.epoch = self.ticks;
        self.watch_fired = false;
        self.arm();
    }

    fn arm(&mut self) {
        if !self.time_trigger.tten() {
            self.armed = false;
            return;
        }
        let trigger = self.trigger;
        if trigger.ttype() == u8::from(TriggerType::Immediate) {
            self.fire_trigger();
        } else if trigger.tt_trig() < self.cycle_time() {
            self.armed = false;
            self.time_trigger.set_teif(true);
        } else {
            self.armed = true;
        }
    }

    fn fire_trigger(&mut self) {
        self.armed = false;
        let index = usize::from(self.trigger.ttptr()).min(STB_SLOTS);
        let active = self.is_active(index);
        let closes_at = self.ticks + (u64::from(self.trigger.tew()) + 1) * self.timer_prescaler();
        let slot = &mut self.slots[index];
        match TriggerType::try_from(self.trigger.ttype()) {
            Ok(TriggerType::Immediate | TriggerType::TransmitStart) => {
                if slot.state == SlotState::Filled {
                    slot.state = SlotState::Ready;
                    slot.single_shot = false;
                }
            }
            Ok(TriggerType::SingleShotTransmit) => {
                if slot.state == SlotState::Filled {
                    slot.state = SlotState::Ready;
                    slot.single_shot = true;
                    self.window = Some(Window {
                        slot: index,
                        closes_at,
                    });
                }
            }
            Ok(TriggerType::TransmitStop) => {
                if slot.state == SlotState::Ready && !active {
                    slot.state = SlotState::Filled;
                }
            }
            Ok(TriggerType::Time) | Err(_) => {}
        }
        self.time_trigger.set_ttif(true);
    }

    /// A single shot slot that did not start inside its transmit enable
    /// window is dropped
    fn close_window(&mut self) {
        let Some(window) = self.window.take() else {
            return;
        };
        let slot = &mut self.slots[window.slot];
        if slot.state == SlotState::Ready && !self.active.is_some_and(|a| a.slot == window.slot) {
            slot.state = SlotState::Empty;
        }
    }
}

/// Simulated CAN-CTRL peripheral
///
/// Register accesses go through `&Controller`, so the same instance can be
/// handed to the driver as registers, clock and dependencies while the test
/// keeps a reference to drive the bus.
pub struct Controller {
    state: RefCell<State>,
}

impl Controller {
    /// Controller held in reset, running at `can_clock`
    pub fn new(can_clock: HertzU32) -> Self {
        Self {
            state: RefCell::new(State::new(can_clock)),
        }
    }

    /// Another node sends `frame`. Returns `true` if the frame was stored
    /// in the receive buffer.
    pub fn deliver(&self, frame: &TxFrame) -> bool {
        self.deliver_with_error(frame, ErrorType::None)
    }

    /// Another node sends `frame` and the node detects `error` while
    /// receiving it. The frame is only stored if the controller is set up to
    /// receive all frames.
    pub fn deliver_with_error(&self, frame: &TxFrame, error: ErrorType) -> bool {
        let mut image = Image([0; RBUF_WORDS]);
        frame.0.write_to(&mut image);
        self.state.borrow_mut().store(image.0, error, false)
    }

    /// A bus error of kind `error` is detected in `role`
    pub fn inject_error(&self, error: ErrorType, role: Role) {
        let mut state = self.state.borrow_mut();
        match role {
            Role::Transmitter => state.tec = state.tec.saturating_add(8),
            Role::Receiver => state.rec = state.rec.saturating_add(1),
        }
        state.koer = error.into();
        state.interrupts.set_beif(true);
        state.update_fault_state();
    }

    /// The frame currently on the bus loses arbitration at bit `position`.
    /// It stays queued and competes again.
    pub fn lose_arbitration(&self, position: u8) {
        let mut state = self.state.borrow_mut();
        if state.active.take().is_some() {
            state.alc = position & 0x1F;
            state.interrupts.set_alif(true);
        }
    }

    /// Whether another node acknowledges the frames sent by this node
    pub fn set_peer_ack(&self, ack: bool) {
        self.state.borrow_mut().peer_ack = ack;
    }

    /// Moves time forward by `ticks` kernel clock ticks
    pub fn advance(&self, ticks: u64) {
        self.state.borrow_mut().advance(ticks)
    }

    /// Runs the bus until no frame can be sent anymore
    pub fn run_until_idle(&self) {
        for _ in 0..MAX_IDLE_EVENTS {
            let mut state = self.state.borrow_mut();
            state.kick();
            match state.active {
                Some(active) => {
                    let remaining = active.done_at - state.ticks;
                    state.advance(remaining);
                }
                None => return,
            }
        }
    }

    /// Oldest frame sent on the bus by this node that was not popped yet
    pub fn pop_transmitted(&self) -> Option<RxFrame> {
        let words = self.state.borrow_mut().log_pop()?;
        Some(RxFrame::decode(|i| words.get(i).copied().unwrap_or(0)))
    }

    /// Kernel clock ticks since creation
    pub fn ticks(&self) -> u64 {
        self.state.borrow().ticks
    }

    /// Checksum over the frames in the receive buffer, oldest first
    pub fn rx_checksum(&self) -> u32 {
        self.state.borrow().checksum()
    }
}

impl CanRegisters for &Controller {
    fn read(&self, offset: usize) -> u32 {
        self.state.borrow().read(offset)
    }

    fn write(&mut self, offset: usize, value: u32) {
        self.state.borrow_mut().write(offset, value)
    }
}

impl Monotonic for Controller {
    fn now(&self) -> Instant {
        let mut state = self.state.borrow_mut();
        let step = state.poll_step;
        state.advance(step);
        Instant::from_ticks(state.micros())
    }
}

// Safety: the controller models its own kernel clock and has no pins.
unsafe impl Dependencies<SimCan> for &Controller {
    fn can_clock(&self) -> HertzU32 {
        HertzU32::from_raw(self.state.borrow().clock_hz)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use embedded_can::{Frame, StandardId};
    use fugit::RateExtU32;

    fn frame(id: u16) -> TxFrame {
        TxFrame::new(StandardId::new(id).unwrap(), &[id as u8]).unwrap()
    }

    #[test]
    fn starts_in_reset_with_filter_zero_open() {
        let sim = Controller::new(40.MHz());
        let regs = &sim;
        assert!(regs.read_reg::<Command>().reset());
        assert_eq!(regs.read_reg::<FilterControl>().acf_en(), 1);
        // Nothing is stored while in reset
        assert!(!sim.deliver(&frame(0x10)));
    }

    #[test]
    fn timing_is_locked_outside_of_reset() {
        let sim = Controller::new(40.MHz());
        let mut regs = &sim;
        regs.write(SLOW_TIMING, 0x0300_030E);
        regs.modify_reg::<Command, _>(|w| w.set_reset(false));
        regs.write(SLOW_TIMING, 0);
        assert_eq!(regs.read(SLOW_TIMING), 0x0300_030E);
    }

    #[test]
    fn release_pops_oldest_frame() {
        let sim = Controller::new(40.MHz());
        let mut regs = &sim;
        regs.modify_reg::<Command, _>(|w| w.set_reset(false));
        assert!(sim.deliver(&frame(1)));
        assert!(sim.deliver(&frame(2)));
        assert_eq!(FrameId(regs.read_rbuf(0)).id(), 1);
        regs.modify_reg::<Command, _>(|w| w.set_rrel(true));
        assert_eq!(FrameId(regs.read_rbuf(0)).id(), 2);
        regs.modify_reg::<Command, _>(|w| w.set_rrel(true));
        assert_eq!(regs.read_reg::<Command>().rstat(), 0);
    }

    #[test]
    fn now_advances_one_microsecond_per_call() {
        let sim = Controller::new(40.MHz());
        let first = sim.now();
        let second = sim.now();
        assert_eq!((second - first).ticks(), 1);
        assert_eq!(sim.ticks(), 80);
    }
}
