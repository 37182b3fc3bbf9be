//! Register map of the CAN-CTRL peripheral
//!
//! The controller packs most of its control and status bytes into shared
//! 32-bit words. Every word is described by a [`bitfield`] type implementing
//! [`Register`], which lets the rest of the crate go through the narrow
//! [`CanRegisters`] interface with typed per-field getters and setters instead
//! of raw masks.
//!
//! Offsets below describe the common layout of the IP. A platform with a
//! different arrangement only needs its own [`CanRegisters`] implementation.

use bitfield::bitfield;
use core::marker::PhantomData;
use vcell::VolatileCell;

/// Start of the receive buffer window (slot currently pointed to by the FIFO)
pub const RBUF: usize = 0x00;
/// Number of words in the receive buffer window
pub const RBUF_WORDS: usize = 20;
/// Start of the transmit buffer window (slot selected by `TBSEL` / `TBPTR`)
pub const TBUF: usize = 0x50;
/// Number of words in the transmit buffer window
pub const TBUF_WORDS: usize = 18;
/// Size of the register block in bytes
pub const REGISTER_BLOCK_SIZE: usize = 0xD0;

/// Word index of the first payload word in both buffer windows
pub(crate) const DATA_WORD: usize = 2;
/// Index of the low receive time stamp word in the receive window
pub(crate) const RTS_WORD: usize = 18;

/// Typed view of a 32-bit register word
pub trait Register: Copy {
    /// Byte offset of the word within the register block
    const OFFSET: usize;
    /// Bits that act when written as `1`: write-1-to-clear flags and
    /// self-clearing command bits. Read-modify-write cycles mask these out so
    /// that pending flags are not acknowledged and commands are not repeated
    /// by accident.
    const ACTION_MASK: u32 = 0;

    /// Wraps raw bits
    fn from_bits(bits: u32) -> Self;
    /// Raw bits
    fn bits(&self) -> u32;
}

/// Narrow access interface to the controller registers
///
/// This is the only place where the crate touches hardware. Implementations
/// exist for memory mapped peripherals ([`Mmio`]) and for the software model
/// of the controller (`sim::Controller`).
///
/// Writes may have side effects (command bits, write-1-to-clear flags), just
/// like on the real peripheral.
pub trait CanRegisters {
    /// Reads the word at byte `offset`
    fn read(&self, offset: usize) -> u32;

    /// Writes the word at byte `offset`
    fn write(&mut self, offset: usize, value: u32);

    /// Reads a typed register
    fn read_reg<R: Register>(&self) -> R {
        R::from_bits(self.read(R::OFFSET))
    }

    /// Writes a typed register
    fn write_reg<R: Register>(&mut self, value: R) {
        self.write(R::OFFSET, value.bits())
    }

    /// Read-modify-write of a typed register. Action bits read as set are
    /// dropped from the written value; set them explicitly in `f` to
    /// acknowledge a flag or issue a command.
    fn modify_reg<R: Register, F: FnOnce(&mut R)>(&mut self, f: F) {
        let mut value = R::from_bits(self.read(R::OFFSET) & !R::ACTION_MASK);
        f(&mut value);
        self.write(R::OFFSET, value.bits())
    }

    /// Reads word `index` of the receive buffer window
    fn read_rbuf(&self, index: usize) -> u32 {
        debug_assert!(index < RBUF_WORDS);
        self.read(RBUF + 4 * index)
    }

    /// Writes word `index` of the transmit buffer window
    fn write_tbuf(&mut self, index: usize, value: u32) {
        debug_assert!(index < TBUF_WORDS);
        self.write(TBUF + 4 * index, value)
    }
}

impl<T: CanRegisters + ?Sized> CanRegisters for &mut T {
    fn read(&self, offset: usize) -> u32 {
        (**self).read(offset)
    }

    fn write(&mut self, offset: usize, value: u32) {
        (**self).write(offset, value)
    }
}

macro_rules! register {
    ($name:ident, $offset:literal) => {
        register!($name, $offset, 0);
    };
    ($name:ident, $offset:literal, $action:literal) => {
        impl Register for $name {
            const OFFSET: usize = $offset;
            const ACTION_MASK: u32 = $action;

            fn from_bits(bits: u32) -> Self {
                Self(bits)
            }

            fn bits(&self) -> u32 {
                self.0
            }
        }
    };
}

bitfield! {
    /// `CFG_STAT`, `TCMD`, `TCTRL` and `RCTRL` bytes
    #[derive(Copy, Clone, Default, PartialEq, Eq)]
    pub struct Command(u32);
    impl Debug;

    /// Bus off status. Writing `1` in loopback mode forces bus off, or resets
    /// the error counters when already bus off.
    pub busoff, set_busoff: 0;
    /// Transmission in progress
    pub tactive, _: 1;
    /// Reception in progress
    pub ractive, _: 2;
    /// STB single shot (no retransmission)
    pub tsss, set_tsss: 3;
    /// PTB single shot (no retransmission)
    pub tpss, set_tpss: 4;
    /// Internal loopback
    pub lbmi, set_lbmi: 5;
    /// External loopback
    pub lbme, set_lbme: 6;
    /// Controller held in reset (configuration state)
    pub reset, set_reset: 7;
    /// STB abort request
    pub tsa, set_tsa: 8;
    /// Transmit all filled STB slots
    pub tsall, set_tsall: 9;
    /// Transmit one STB slot
    pub tsone, set_tsone: 10;
    /// PTB abort request
    pub tpa, set_tpa: 11;
    /// PTB transmit enable
    pub tpe, set_tpe: 12;
    /// Transceiver standby
    pub stby, set_stby: 13;
    /// Listen only mode
    pub lom, set_lom: 14;
    /// Transmit buffer window selects the STB (`0` selects the PTB)
    pub tbsel, set_tbsel: 15;
    /// STB fill status
    pub u8, tsstat, _: 17, 16;
    /// TTC transmit buffer mode: the window is addressed by `TBPTR`
    pub tttbm, set_tttbm: 20;
    /// STB priority mode (`0` FIFO)
    pub tsmode, set_tsmode: 21;
    /// STB slot filled, advance the fill pointer
    pub tsnext, set_tsnext: 22;
    /// ISO CAN FD
    pub fd_iso, set_fd_iso: 23;
    /// Receive buffer status
    pub u8, rstat, _: 25, 24;
    /// Store frames received with errors
    pub rball, set_rball: 27;
    /// Release the oldest receive slot
    pub rrel, set_rrel: 28;
    /// Receive buffer overflow
    pub rov, _: 29;
    /// Receive overflow mode (`1` drops new frames)
    pub rom, set_rom: 30;
    /// Self acknowledge in external loopback
    pub sack, set_sack: 31;
}
register!(Command, 0xA0, 0x1040_1F01);

bitfield! {
    /// `RTIE`, `RTIF`, `ERRINT` and `LIMIT` bytes
    #[derive(Copy, Clone, Default, PartialEq, Eq)]
    pub struct Interrupts(u32);
    impl Debug;

    /// STB full
    pub tsff, _: 0;
    /// Error interrupt enable
    pub eie, set_eie: 1;
    /// STB transmission completed interrupt enable
    pub tsie, set_tsie: 2;
    /// PTB transmission completed interrupt enable
    pub tpie, set_tpie: 3;
    /// Receive buffer almost full interrupt enable
    pub rafie, set_rafie: 4;
    /// Receive buffer full interrupt enable
    pub rfie, set_rfie: 5;
    /// Receive overrun interrupt enable
    pub roie, set_roie: 6;
    /// Receive interrupt enable
    pub rie, set_rie: 7;
    /// Abort completed
    pub aif, set_aif: 8;
    /// Error status or counters changed
    pub eif, set_eif: 9;
    /// STB transmission completed
    pub tsif, set_tsif: 10;
    /// PTB transmission completed
    pub tpif, set_tpif: 11;
    /// Receive buffer almost full
    pub rafif, set_rafif: 12;
    /// Receive buffer full
    pub rfif, set_rfif: 13;
    /// Receive overrun
    pub roif, set_roif: 14;
    /// Frame received
    pub rif, set_rif: 15;
    /// Bus error
    pub beif, set_beif: 16;
    /// Bus error interrupt enable
    pub beie, set_beie: 17;
    /// Arbitration lost
    pub alif, set_alif: 18;
    /// Arbitration lost interrupt enable
    pub alie, set_alie: 19;
    /// Error passive status changed
    pub epif, set_epif: 20;
    /// Error passive interrupt enable
    pub epie, set_epie: 21;
    /// Node is error passive
    pub epass, _: 22;
    /// An error counter reached the warning limit
    pub ewarn, _: 23;
    /// Receive buffer almost full warning limit
    pub u8, afwl, set_afwl: 27, 24;
    /// Error warning limit, `(EWL + 1) * 8`
    pub u8, ewl, set_ewl: 31, 28;
}
register!(Interrupts, 0xA4, 0x0015_FF00);

bitfield! {
    /// Slow (nominal) bit timing
    #[derive(Copy, Clone, Default, PartialEq, Eq)]
    pub struct SlowTiming(u32);
    impl Debug;

    /// Segment 1 minus 2
    pub u8, seg1, set_seg1: 7, 0;
    /// Segment 2 minus 1
    pub u8, seg2, set_seg2: 14, 8;
    /// Synchronization jump width minus 1
    pub u8, sjw, set_sjw: 22, 16;
    /// Prescaler minus 1
    pub u8, presc, set_presc: 31, 24;
}
register!(SlowTiming, 0xA8);

bitfield! {
    /// Fast (data phase) bit timing
    #[derive(Copy, Clone, Default, PartialEq, Eq)]
    pub struct FastTiming(u32);
    impl Debug;

    /// Segment 1 minus 2
    pub u8, seg1, set_seg1: 3, 0;
    /// Segment 2 minus 1
    pub u8, seg2, set_seg2: 11, 8;
    /// Synchronization jump width minus 1
    pub u8, sjw, set_sjw: 19, 16;
    /// Prescaler minus 1
    pub u8, presc, set_presc: 31, 24;
}
register!(FastTiming, 0xAC);

bitfield! {
    /// `EALCAP`, `TDC`, `RECNT` and `TECNT` bytes
    #[derive(Copy, Clone, Default, PartialEq, Eq)]
    pub struct ErrorCapture(u32);
    impl Debug;

    /// Bit position of the last arbitration loss
    pub u8, alc, _: 4, 0;
    /// Kind of the last error
    pub u8, koer, _: 7, 5;
    /// Secondary sample point offset
    pub u8, sspoff, set_sspoff: 14, 8;
    /// Transmitter delay compensation enable
    pub tdcen, set_tdcen: 15;
    /// Receive error counter
    pub u8, recnt, _: 23, 16;
    /// Transmit error counter
    pub u8, tecnt, _: 31, 24;
}
register!(ErrorCapture, 0xB0);

bitfield! {
    /// `ACFCTRL`, `TIMECFG` and `ACF_EN` bytes
    #[derive(Copy, Clone, Default, PartialEq, Eq)]
    pub struct FilterControl(u32);
    impl Debug;

    /// Filter addressed by the `ACF` window
    pub u8, acfadr, set_acfadr: 3, 0;
    /// `ACF` window addresses the mask (`0` the code)
    pub selmask, set_selmask: 5;
    /// Time stamping enable
    pub timeen, set_timeen: 8;
    /// Time stamp taken at end of frame (`0` start of frame)
    pub timepos, set_timepos: 9;
    /// Filter enable bits
    pub u16, acf_en, set_acf_en: 31, 16;
}
register!(FilterControl, 0xB4);

bitfield! {
    /// Acceptance code or mask of the filter selected in [`FilterControl`]
    #[derive(Copy, Clone, Default, PartialEq, Eq)]
    pub struct Acceptance(u32);
    impl Debug;

    /// Identifier bits (code) or don't-care bits (mask)
    pub u32, code_or_mask, set_code_or_mask: 28, 0;
    /// Expected IDE value (mask only)
    pub aide, set_aide: 29;
    /// Check IDE against [`Self::aide`] (mask only)
    pub aidee, set_aidee: 30;
}
register!(Acceptance, 0xB8);

bitfield! {
    /// `VER`, `TBSLOT` and `TTCFG` bytes
    #[derive(Copy, Clone, Default, PartialEq, Eq)]
    pub struct TimeTrigger(u32);
    impl Debug;

    /// IP version
    pub u16, version, _: 15, 0;
    /// Transmit buffer slot addressed in TTC buffer mode
    pub u8, tbptr, set_tbptr: 21, 16;
    /// Mark the addressed slot filled
    pub tbf, set_tbf: 22;
    /// Mark the addressed slot empty
    pub tbe, set_tbe: 23;
    /// Time-triggered communication enable
    pub tten, set_tten: 24;
    /// TTC timer prescaler, `1 << T_PRESC`
    pub u8, t_presc, set_t_presc: 26, 25;
    /// Trigger time reached
    pub ttif, set_ttif: 27;
    /// Trigger interrupt enable
    pub ttie, set_ttie: 28;
    /// Trigger error
    pub teif, set_teif: 29;
    /// Watch trigger reached
    pub wtif, set_wtif: 30;
    /// Watch trigger interrupt enable
    pub wtie, set_wtie: 31;
}
register!(TimeTrigger, 0xBC, 0x68C0_0000);

bitfield! {
    /// Reference message identifier
    #[derive(Copy, Clone, Default, PartialEq, Eq)]
    pub struct ReferenceMessage(u32);
    impl Debug;

    /// Identifier
    pub u32, ref_id, set_ref_id: 28, 0;
    /// Identifier is extended
    pub ref_ide, set_ref_ide: 31;
}
register!(ReferenceMessage, 0xC0);

bitfield! {
    /// Transmit trigger configuration
    #[derive(Copy, Clone, Default, PartialEq, Eq)]
    pub struct TriggerConfig(u32);
    impl Debug;

    /// Slot started by the trigger
    pub u8, ttptr, set_ttptr: 5, 0;
    /// Trigger type
    pub u8, ttype, set_ttype: 10, 8;
    /// Transmit enable window, `TEW + 1` timer ticks
    pub u8, tew, set_tew: 15, 12;
    /// Trigger time
    pub u16, tt_trig, set_tt_trig: 31, 16;
}
register!(TriggerConfig, 0xC4);

bitfield! {
    /// Watch trigger time
    #[derive(Copy, Clone, Default, PartialEq, Eq)]
    pub struct WatchTrigger(u32);
    impl Debug;

    /// Watch trigger time
    pub u16, wt_trig, set_wt_trig: 15, 0;
}
register!(WatchTrigger, 0xC8);

bitfield! {
    /// Local TTC timer
    #[derive(Copy, Clone, Default, PartialEq, Eq)]
    pub struct CycleTime(u32);
    impl Debug;

    /// Timer value since the last reference message
    pub u16, cycle_time, _: 15, 0;
}
register!(CycleTime, 0xCC);

bitfield! {
    /// First header word of a frame in either buffer window
    #[derive(Copy, Clone, Default, PartialEq, Eq)]
    pub struct FrameId(u32);
    impl Debug;

    /// Identifier, right aligned for both formats
    pub u32, id, set_id: 28, 0;
    /// Error state indicator of the transmitter
    pub esi, set_esi: 31;
}

bitfield! {
    /// Second header word of a frame in either buffer window
    #[derive(Copy, Clone, Default, PartialEq, Eq)]
    pub struct FrameControl(u32);
    impl Debug;

    /// Data length code
    pub u8, dlc, set_dlc: 3, 0;
    /// Bit rate switch
    pub brs, set_brs: 4;
    /// FD format
    pub fdf, set_fdf: 5;
    /// Remote transmission request
    pub rtr, set_rtr: 6;
    /// Extended identifier
    pub ide, set_ide: 7;
    /// Frame was transmitted by this node (loopback)
    pub tx, set_tx: 12;
    /// Kind of error the frame was received with
    pub u8, koer, set_koer: 15, 13;
    /// TTC timer value at reception
    pub u16, cycle_time, set_cycle_time: 31, 16;
}

/// Memory mapped register block of the peripheral identified by `Id`
pub struct Mmio<Id> {
    _id: PhantomData<Id>,
}

impl<Id: canctrl_core::CanId> Mmio<Id> {
    /// # Safety
    /// The caller must own the peripheral referenced by `Id`; the returned
    /// value accesses its register block without synchronization. Do not keep
    /// multiple instances for the same peripheral.
    pub unsafe fn new() -> Self {
        Self { _id: PhantomData }
    }

    fn cell(&self, offset: usize) -> &VolatileCell<u32> {
        debug_assert!(offset < REGISTER_BLOCK_SIZE && offset % 4 == 0);
        // Safety: `Id::ADDRESS` points at a valid register block by the `CanId`
        // contract, and the offset stays within it.
        unsafe { &*((Id::ADDRESS as *const u8).add(offset) as *const VolatileCell<u32>) }
    }
}

impl<Id: canctrl_core::CanId> CanRegisters for Mmio<Id> {
    fn read(&self, offset: usize) -> u32 {
        self.cell(offset).get()
    }

    fn write(&mut self, offset: usize, value: u32) {
        self.cell(offset).set(value)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn frame_header_words_wrap_raw_values() {
        let id = FrameId(0x8000_07FF);
        assert_eq!(id.id(), 0x7FF);
        assert!(id.esi());
        let mut control = FrameControl::default();
        control.set_ide(true);
        control.set_dlc(8);
        assert_eq!(control.0, 0x88);
        assert_eq!(FrameControl(control.0), control);
    }

    #[test]
    fn timing_fields_do_not_overlap() {
        let mut t = SlowTiming(0);
        t.set_seg1(0xff);
        t.set_seg2(0x7f);
        t.set_sjw(0x7f);
        t.set_presc(0xff);
        assert_eq!(t.bits(), 0xff7f_7fff);
        assert_eq!(t.seg1(), 0xff);
        assert_eq!(t.presc(), 0xff);
    }

    /// Single word returning `.0` on reads and capturing writes in `.1`
    struct Word(u32, u32);

    impl CanRegisters for Word {
        fn read(&self, _: usize) -> u32 {
            self.0
        }
        fn write(&mut self, _: usize, value: u32) {
            self.1 = value;
        }
    }

    #[test]
    fn modify_does_not_acknowledge_pending_flags() {
        let mut flags = Interrupts(0);
        flags.set_rif(true);
        flags.set_alif(true);
        let mut regs = Word(flags.bits(), 0);
        regs.modify_reg::<Interrupts, _>(|w| w.set_rie(true));
        let written = Interrupts(regs.1);
        assert!(written.rie());
        assert!(!written.rif());
        assert!(!written.alif());
    }

    #[test]
    fn modify_does_not_repeat_commands() {
        let mut command = Command(0);
        command.set_tpe(true);
        command.set_tsall(true);
        command.set_busoff(true);
        command.set_lbmi(true);
        let mut regs = Word(command.bits(), 0);
        regs.modify_reg::<Command, _>(|w| w.set_tbsel(true));
        let written = Command(regs.1);
        assert!(written.tbsel());
        assert!(written.lbmi());
        assert!(!written.tpe());
        assert!(!written.tsall());
        assert!(!written.busoff());
    }
}
