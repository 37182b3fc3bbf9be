//! Status and interrupt flags
//!
//! The controller spreads its status and interrupt bits over several
//! registers. [`StatusSet`] flattens them into one set so they can be
//! queried, cleared and enabled uniformly.

use crate::reg::{CanRegisters, Command, Interrupts, Register, TimeTrigger};
use bitfield::bitfield;

bitfield! {
    /// A set of status flags.
    #[derive(Copy, Clone, Default, PartialEq, Eq)]
    #[cfg_attr(feature = "defmt", derive(defmt::Format))]
    pub struct StatusSet(u32);

    /// Frame received
    pub rx_complete, set_rx_complete: 0;
    /// Receive overrun
    pub rx_overrun, set_rx_overrun: 1;
    /// Receive buffer full
    pub rx_full, set_rx_full: 2;
    /// Receive buffer almost full
    pub rx_almost_full, set_rx_almost_full: 3;
    /// PTB transmission completed
    pub ptb_complete, set_ptb_complete: 4;
    /// STB transmission completed
    pub stb_complete, set_stb_complete: 5;
    /// Error status or counters changed
    pub error, set_error: 6;
    /// Abort completed
    pub abort_complete, set_abort_complete: 7;
    /// Bus error
    pub bus_error, set_bus_error: 8;
    /// Arbitration lost
    pub arbitration_lost, set_arbitration_lost: 9;
    /// Error passive state changed
    pub error_passive_changed, set_error_passive_changed: 10;
    /// Node is error passive
    pub error_passive, set_error_passive: 11;
    /// An error counter reached the warning limit
    pub error_warning, set_error_warning: 12;
    /// STB full
    pub stb_full, set_stb_full: 13;
    /// Node is bus off
    pub bus_off, set_bus_off: 14;
    /// Transmission in progress
    pub tx_active, set_tx_active: 15;
    /// Reception in progress
    pub rx_active, set_rx_active: 16;
    /// Receive buffer overflow
    pub rx_overflow, set_rx_overflow: 17;
    /// Trigger time reached
    pub time_trigger, set_time_trigger: 18;
    /// Trigger time programmed behind the cycle time
    pub trigger_error, set_trigger_error: 19;
    /// Watch trigger time reached
    pub watch_trigger, set_watch_trigger: 20;
}

/// A single status flag.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum StatusFlag {
    /// RIF
    RxComplete = 0,
    /// ROIF
    RxOverrun = 1,
    /// RFIF
    RxFull = 2,
    /// RAFIF
    RxAlmostFull = 3,
    /// TPIF
    PtbComplete = 4,
    /// TSIF
    StbComplete = 5,
    /// EIF
    Error = 6,
    /// AIF
    AbortComplete = 7,
    /// BEIF
    BusError = 8,
    /// ALIF
    ArbitrationLost = 9,
    /// EPIF
    ErrorPassiveChanged = 10,
    /// EPASS
    ErrorPassive = 11,
    /// EWARN
    ErrorWarning = 12,
    /// TSFF
    StbFull = 13,
    /// BUSOFF
    BusOff = 14,
    /// TACTIVE
    TxActive = 15,
    /// RACTIVE
    RxActive = 16,
    /// ROV, cleared by releasing a receive slot
    RxOverflow = 17,
    /// TTIF
    TimeTrigger = 18,
    /// TEIF
    TriggerError = 19,
    /// WTIF
    WatchTrigger = 20,
}

const FLAGS: [StatusFlag; 21] = [
    StatusFlag::RxComplete,
    StatusFlag::RxOverrun,
    StatusFlag::RxFull,
    StatusFlag::RxAlmostFull,
    StatusFlag::PtbComplete,
    StatusFlag::StbComplete,
    StatusFlag::Error,
    StatusFlag::AbortComplete,
    StatusFlag::BusError,
    StatusFlag::ArbitrationLost,
    StatusFlag::ErrorPassiveChanged,
    StatusFlag::ErrorPassive,
    StatusFlag::ErrorWarning,
    StatusFlag::StbFull,
    StatusFlag::BusOff,
    StatusFlag::TxActive,
    StatusFlag::RxActive,
    StatusFlag::RxOverflow,
    StatusFlag::TimeTrigger,
    StatusFlag::TriggerError,
    StatusFlag::WatchTrigger,
];

const ALL_FLAGS: u32 = (1 << FLAGS.len()) - 1;

impl From<StatusFlag> for u32 {
    fn from(x: StatusFlag) -> Self {
        1 << x as u32
    }
}

impl From<StatusFlag> for StatusSet {
    fn from(x: StatusFlag) -> Self {
        StatusSet(x.into())
    }
}

impl FromIterator<StatusFlag> for StatusSet {
    fn from_iter<T: IntoIterator<Item = StatusFlag>>(iter: T) -> Self {
        let mut set = 0_u32;
        for flag in iter.into_iter() {
            set |= u32::from(flag);
        }
        StatusSet(set)
    }
}

impl core::fmt::Debug for StatusSet {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

impl StatusSet {
    /// Every flag
    pub fn all() -> Self {
        Self(ALL_FLAGS)
    }

    /// `true` if no flag is in the set
    pub fn is_empty(&self) -> bool {
        self.0 & ALL_FLAGS == 0
    }

    /// `true` if `flag` is in the set
    pub fn contains(&self, flag: StatusFlag) -> bool {
        self.0 & u32::from(flag) != 0
    }

    /// An iterator visiting all elements in ascending order.
    pub fn iter(&self) -> Iter {
        Iter {
            flags: *self,
            index: 0,
        }
    }
}

impl core::ops::BitOr for StatusSet {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// An iterator over the items of a [`StatusSet`].
///
/// This `struct` is created by [`StatusSet::iter`].
pub struct Iter {
    flags: StatusSet,
    index: u8,
}

impl Iterator for Iter {
    type Item = StatusFlag;

    fn next(&mut self) -> Option<Self::Item> {
        while let Some(&flag) = FLAGS.get(self.index as usize) {
            self.index += 1;
            if self.flags.contains(flag) {
                return Some(flag);
            }
        }
        None
    }
}

/// Register word a flag lives in
#[derive(Copy, Clone, PartialEq, Eq)]
enum Word {
    Interrupts,
    Command,
    TimeTrigger,
}

/// How to reach a flag: word, status bit, enable bit and whether writing `1`
/// clears it
#[derive(Copy, Clone)]
struct Location {
    word: Word,
    bit: u8,
    enable: Option<u8>,
    clear_by_write: bool,
}

const fn at(word: Word, bit: u8, enable: Option<u8>, clear_by_write: bool) -> Location {
    Location {
        word,
        bit,
        enable,
        clear_by_write,
    }
}

fn location(flag: StatusFlag) -> Location {
    use StatusFlag::*;
    match flag {
        RxComplete => at(Word::Interrupts, 15, Some(7), true),
        RxOverrun => at(Word::Interrupts, 14, Some(6), true),
        RxFull => at(Word::Interrupts, 13, Some(5), true),
        RxAlmostFull => at(Word::Interrupts, 12, Some(4), true),
        PtbComplete => at(Word::Interrupts, 11, Some(3), true),
        StbComplete => at(Word::Interrupts, 10, Some(2), true),
        Error => at(Word::Interrupts, 9, Some(1), true),
        AbortComplete => at(Word::Interrupts, 8, None, true),
        BusError => at(Word::Interrupts, 16, Some(17), true),
        ArbitrationLost => at(Word::Interrupts, 18, Some(19), true),
        ErrorPassiveChanged => at(Word::Interrupts, 20, Some(21), true),
        ErrorPassive => at(Word::Interrupts, 22, None, false),
        ErrorWarning => at(Word::Interrupts, 23, None, false),
        StbFull => at(Word::Interrupts, 0, None, false),
        BusOff => at(Word::Command, 0, None, false),
        TxActive => at(Word::Command, 1, None, false),
        RxActive => at(Word::Command, 2, None, false),
        RxOverflow => at(Word::Command, 29, None, false),
        StatusFlag::TimeTrigger => at(Word::TimeTrigger, 27, Some(28), true),
        TriggerError => at(Word::TimeTrigger, 29, None, true),
        WatchTrigger => at(Word::TimeTrigger, 30, Some(31), true),
    }
}

/// The three words holding status flags, read once per query
struct Snapshot {
    interrupts: u32,
    command: u32,
    time_trigger: u32,
}

impl Snapshot {
    fn read<R: CanRegisters>(regs: &R) -> Self {
        Self {
            interrupts: regs.read(Interrupts::OFFSET),
            command: regs.read(Command::OFFSET),
            time_trigger: regs.read(TimeTrigger::OFFSET),
        }
    }

    fn word(&self, word: Word) -> u32 {
        match word {
            Word::Interrupts => self.interrupts,
            Word::Command => self.command,
            Word::TimeTrigger => self.time_trigger,
        }
    }

    fn flags(&self) -> StatusSet {
        FLAGS
            .iter()
            .copied()
            .filter(|&flag| {
                let loc = location(flag);
                self.word(loc.word) & (1 << loc.bit) != 0
            })
            .collect()
    }

    fn enabled(&self) -> StatusSet {
        FLAGS
            .iter()
            .copied()
            .filter(|&flag| {
                let loc = location(flag);
                loc.enable
                    .is_some_and(|bit| self.word(loc.word) & (1 << bit) != 0)
            })
            .collect()
    }
}

/// Flat view of the status and interrupt flags
pub struct Status<'a, R> {
    regs: &'a mut R,
}

impl<'a, R: CanRegisters> Status<'a, R> {
    pub(crate) fn new(regs: &'a mut R) -> Self {
        Self { regs }
    }

    /// All flags currently set
    pub fn flags(&self) -> StatusSet {
        Snapshot::read(&*self.regs).flags()
    }

    /// `true` if any flag of `flags` is set
    pub fn get(&self, flags: StatusSet) -> bool {
        self.flags().0 & flags.0 != 0
    }

    /// Clears `flags`. Flags that only mirror a state (bus off, error
    /// passive, ...) are left alone. Clearing [`StatusFlag::RxOverflow`]
    /// releases the oldest receive slot, dropping that frame.
    pub fn clear(&mut self, flags: StatusSet) {
        let mut interrupts = 0;
        let mut time_trigger = 0;
        for flag in flags.iter() {
            let loc = location(flag);
            if !loc.clear_by_write {
                continue;
            }
            match loc.word {
                Word::Interrupts => interrupts |= 1 << loc.bit,
                Word::TimeTrigger => time_trigger |= 1 << loc.bit,
                Word::Command => {}
            }
        }
        if interrupts != 0 {
            self.regs.modify_reg::<Interrupts, _>(|w| {
                *w = Interrupts::from_bits(w.bits() | interrupts)
            });
        }
        if time_trigger != 0 {
            self.regs.modify_reg::<TimeTrigger, _>(|w| {
                *w = TimeTrigger::from_bits(w.bits() | time_trigger)
            });
        }
        if flags.contains(StatusFlag::RxOverflow) && self.regs.read_reg::<Command>().rov() {
            self.regs.modify_reg::<Command, _>(|w| w.set_rrel(true));
        }
    }

    /// Enables or disables the interrupt sources in `flags`. Flags without
    /// an enable bit are ignored.
    pub fn int_cmd(&mut self, flags: StatusSet, enabled: bool) {
        let mut interrupts = 0;
        let mut time_trigger = 0;
        for flag in flags.iter() {
            let loc = location(flag);
            let Some(bit) = loc.enable else { continue };
            match loc.word {
                Word::Interrupts => interrupts |= 1 << bit,
                Word::TimeTrigger => time_trigger |= 1 << bit,
                Word::Command => {}
            }
        }
        let apply = |value: u32, mask: u32| {
            if enabled {
                value | mask
            } else {
                value & !mask
            }
        };
        if interrupts != 0 {
            self.regs.modify_reg::<Interrupts, _>(|w| {
                *w = Interrupts::from_bits(apply(w.bits(), interrupts))
            });
        }
        if time_trigger != 0 {
            self.regs.modify_reg::<TimeTrigger, _>(|w| {
                *w = TimeTrigger::from_bits(apply(w.bits(), time_trigger))
            });
        }
    }

    /// Interrupt sources currently enabled
    pub fn enabled(&self) -> StatusSet {
        Snapshot::read(&*self.regs).enabled()
    }

    /// Flags that are set and whose interrupt source is enabled
    pub fn pending_interrupts(&self) -> StatusSet {
        let snapshot = Snapshot::read(&*self.regs);
        StatusSet(snapshot.flags().0 & snapshot.enabled().0)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn iter_preserves_length() {
        assert_eq!(StatusSet(0).iter().count(), 0);
        assert_eq!(StatusSet(1).iter().count(), 1);
        assert_eq!(StatusSet::all().iter().count(), 21);
        assert_eq!(StatusSet(0xffff_ffff).iter().count(), 21);
    }

    fn iter_collect(flags: u32) -> u32 {
        StatusSet::from_iter(StatusSet(flags).iter()).0
    }

    #[test]
    fn iter_collect_preserves_flags() {
        assert_eq!(iter_collect(0), 0);
        assert_eq!(iter_collect(0x0015_5555), 0x0015_5555);
        assert_eq!(iter_collect(0xffff_ffff), ALL_FLAGS);
    }

    #[test]
    fn flags_map_to_their_register_bits() {
        let mut interrupts = Interrupts::default();
        interrupts.set_rif(true);
        interrupts.set_alif(true);
        let mut time_trigger = TimeTrigger::default();
        time_trigger.set_wtif(true);
        let snapshot = Snapshot {
            interrupts: interrupts.bits(),
            command: 1 << 29,
            time_trigger: time_trigger.bits(),
        };
        let expected: StatusSet = [
            StatusFlag::RxComplete,
            StatusFlag::ArbitrationLost,
            StatusFlag::RxOverflow,
            StatusFlag::WatchTrigger,
        ]
        .into_iter()
        .collect();
        assert_eq!(snapshot.flags(), expected);
    }

    #[test]
    fn time_trigger_flags_are_distinct() {
        let trigger = location(StatusFlag::TimeTrigger);
        let error = location(StatusFlag::TriggerError);
        let watch = location(StatusFlag::WatchTrigger);
        assert!(trigger.word == Word::TimeTrigger && trigger.bit == 27);
        assert!(error.word == Word::TimeTrigger && error.bit == 29);
        assert!(watch.word == Word::TimeTrigger && watch.bit == 30);
        assert_eq!(watch.enable, Some(31));
        assert_eq!(error.enable, None);
    }

    #[test]
    fn enable_bits_follow_their_flags() {
        let mut interrupts = Interrupts::default();
        interrupts.set_rie(true);
        interrupts.set_beie(true);
        let snapshot = Snapshot {
            interrupts: interrupts.bits(),
            command: 0,
            time_trigger: 0,
        };
        assert_eq!(
            snapshot.enabled(),
            StatusSet::from(StatusFlag::RxComplete) | StatusSet::from(StatusFlag::BusError)
        );
    }
}
