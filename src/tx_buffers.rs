//! Transmit buffers
//!
//! The controller has one Primary Transmit Buffer (PTB) and a Secondary
//! Transmit Buffer (STB) of [`STB_SLOTS`] slots. A pending PTB frame always
//! goes out before any STB frame; the STB is emptied in FIFO or identifier
//! order depending on [`StbMode`]. A frame that already took part in
//! arbitration cannot be cancelled.

use crate::bus::{ConfigurationError, Error};
use crate::config::StbMode;
use crate::message::TxFrame;
use crate::reg::{CanRegisters, Command, Interrupts};
use canctrl_core::{Duration, Monotonic};
use embedded_can::Id;
use void::Void;

/// Number of slots in the secondary transmit buffer
pub const STB_SLOTS: usize = 16;

/// Transmit buffer class
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BufferType {
    /// Primary Transmit Buffer, one slot, highest priority
    Primary,
    /// Secondary Transmit Buffer
    Secondary,
}

/// What to start after a frame was put in the secondary buffer
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum StbPolicy {
    /// Every filled slot
    #[default]
    All,
    /// A single slot, the next one in STB order
    One,
}

/// Fill state of the secondary buffer
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum StbStatus {
    /// No slot filled
    Empty,
    /// At most half of the slots filled
    LessOrEqualHalf,
    /// More than half of the slots filled
    MoreThanHalf,
    /// Every slot filled
    Full,
}

impl From<u8> for StbStatus {
    fn from(tsstat: u8) -> Self {
        match tsstat & 0b11 {
            0 => Self::Empty,
            1 => Self::LessOrEqualHalf,
            2 => Self::MoreThanHalf,
            _ => Self::Full,
        }
    }
}

/// Snapshot of both transmit buffers
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TransmitStatus {
    /// Fill state of the secondary buffer
    pub stb: StbStatus,
    /// The primary buffer holds a frame that is not sent yet
    pub ptb_busy: bool,
    /// A transmission of secondary buffer slots is requested
    pub stb_busy: bool,
}

/// A set of transmit buffer classes
#[derive(Copy, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TxBufferSet(pub u8);

impl TxBufferSet {
    /// Both buffers
    pub fn all() -> Self {
        Self(0b11)
    }

    /// `true` if `buffer` is part of the set
    pub fn contains(&self, buffer: BufferType) -> bool {
        self.0 & bit(buffer) != 0
    }

    /// An iterator visiting the buffers in the set, primary first.
    pub fn iter(&self) -> Iter {
        Iter {
            flags: *self,
            index: 0,
        }
    }
}

fn bit(buffer: BufferType) -> u8 {
    match buffer {
        BufferType::Primary => 0b01,
        BufferType::Secondary => 0b10,
    }
}

impl FromIterator<BufferType> for TxBufferSet {
    fn from_iter<T: IntoIterator<Item = BufferType>>(iter: T) -> Self {
        TxBufferSet(iter.into_iter().fold(0, |set, b| set | bit(b)))
    }
}

impl From<BufferType> for TxBufferSet {
    fn from(buffer: BufferType) -> Self {
        Self(bit(buffer))
    }
}

impl core::fmt::Debug for TxBufferSet {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

/// An iterator over the buffers in a [`TxBufferSet`].
///
/// This `struct` is created by [`TxBufferSet::iter`].
pub struct Iter {
    flags: TxBufferSet,
    index: u8,
}

impl Iterator for Iter {
    type Item = BufferType;

    fn next(&mut self) -> Option<Self::Item> {
        while self.index < 2 {
            let buffer = [BufferType::Primary, BufferType::Secondary][self.index as usize];
            self.index += 1;
            if self.flags.contains(buffer) {
                return Some(buffer);
            }
        }
        None
    }
}

/// Secondary buffer slot competing for the next transmission
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Queued {
    /// Identifier of the frame in the slot
    pub id: Id,
    /// Position in fill order, lower was filled earlier
    pub order: u32,
}

#[cfg(feature = "defmt")]
impl defmt::Format for Queued {
    fn format(&self, f: defmt::Formatter<'_>) {
        defmt::write!(
            f,
            "Queued(id: {}, order: {=u32})",
            crate::message::FormatId(self.id),
            self.order
        )
    }
}

/// Outcome of [`select_next`]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Selection {
    /// The primary buffer
    Primary,
    /// Secondary buffer slot with the given index
    Secondary(usize),
}

/// Picks the buffer the controller sends next.
///
/// `ptb` is the identifier of a ready PTB frame, `stb` holds the ready
/// secondary slots. The PTB always wins. In [`StbMode::Fifo`] the earliest
/// filled slot follows, in [`StbMode::Priority`] the slot with the highest
/// priority identifier, ties broken by fill order.
pub fn select_next(ptb: Option<Id>, stb: &[Option<Queued>], mode: StbMode) -> Option<Selection> {
    if ptb.is_some() {
        return Some(Selection::Primary);
    }
    let ready = stb
        .iter()
        .enumerate()
        .filter_map(|(i, slot)| slot.map(|q| (i, q)));
    let best = match mode {
        StbMode::Fifo => ready.min_by_key(|(_, q)| q.order),
        StbMode::Priority => ready.min_by_key(|(_, q)| (arbitration_key(q.id), q.order)),
    };
    best.map(|(i, _)| Selection::Secondary(i))
}

/// Bus arbitration order: base identifier, then IDE (standard wins), then
/// the extension bits. Lower keys win.
fn arbitration_key(id: Id) -> (u32, bool, u32) {
    match id {
        Id::Standard(id) => (id.as_raw().into(), false, 0),
        Id::Extended(id) => (id.as_raw() >> 18, true, id.as_raw() & 0x3_FFFF),
    }
}

/// Transmit side of the controller
pub struct Tx<'a, R, C> {
    regs: &'a mut R,
    clock: &'a C,
    fd_enabled: bool,
}

impl<'a, R: CanRegisters, C: Monotonic> Tx<'a, R, C> {
    pub(crate) fn new(regs: &'a mut R, clock: &'a C, fd_enabled: bool) -> Self {
        Self {
            regs,
            clock,
            fd_enabled,
        }
    }

    /// Validates `frame` and makes sure `buffer` has a free slot
    fn check(&self, frame: &TxFrame, buffer: BufferType) -> Result<(), Error> {
        if frame.fd_format() && !self.fd_enabled {
            return Err(ConfigurationError::FdDisabled.into());
        }
        let command: Command = self.regs.read_reg();
        if command.reset() || command.lom() || command.tttbm() {
            return Err(ConfigurationError::NotOperational.into());
        }
        let full = match buffer {
            BufferType::Primary => command.tpe(),
            BufferType::Secondary => StbStatus::from(command.tsstat()) == StbStatus::Full,
        };
        if full {
            return Err(Error::BufferFull);
        }
        Ok(())
    }

    /// Copies `frame` into `buffer` and starts the transmission without
    /// waiting for it. Fails with [`Error::BufferFull`] if the buffer has no
    /// free slot.
    pub fn enqueue(
        &mut self,
        frame: &TxFrame,
        buffer: BufferType,
        policy: StbPolicy,
    ) -> Result<(), Error> {
        self.check(frame, buffer)?;
        match buffer {
            BufferType::Primary => {
                self.regs.modify_reg::<Command, _>(|w| w.set_tbsel(false));
                frame.0.write_to(&mut *self.regs);
                self.regs.modify_reg::<Command, _>(|w| w.set_tpe(true));
            }
            BufferType::Secondary => {
                self.regs.modify_reg::<Command, _>(|w| w.set_tbsel(true));
                frame.0.write_to(&mut *self.regs);
                self.regs.modify_reg::<Command, _>(|w| w.set_tsnext(true));
                self.regs.modify_reg::<Command, _>(|w| match policy {
                    StbPolicy::All => w.set_tsall(true),
                    StbPolicy::One => w.set_tsone(true),
                });
            }
        }
        Ok(())
    }

    /// Copies `frame` into `buffer` and starts the transmission.
    ///
    /// A zero `timeout` returns right after the frame was handed over.
    /// Otherwise the completion flag of the buffer is polled until the
    /// deadline; losing arbitration repeatedly looks the same as a slow bus
    /// and ends in [`Error::Timeout`]. The frame stays queued after a
    /// timeout.
    pub fn transmit(
        &mut self,
        frame: &TxFrame,
        buffer: BufferType,
        policy: StbPolicy,
        timeout: Duration,
    ) -> Result<(), Error> {
        if timeout.ticks() == 0 {
            return self.enqueue(frame, buffer, policy);
        }
        // A stale flag would end the wait right away. It is only cleared
        // once the frame is known to be accepted.
        self.check(frame, buffer)?;
        self.acknowledge(buffer);
        self.enqueue(frame, buffer, policy)?;

        let deadline = self.clock.deadline(timeout);
        loop {
            match self.poll_transmission(buffer) {
                Ok(()) => return Ok(()),
                Err(nb::Error::WouldBlock) if self.clock.expired(deadline) => {
                    #[cfg(feature = "defmt")]
                    defmt::warn!("transmit timeout on {}", buffer);
                    return Err(Error::Timeout);
                }
                Err(nb::Error::WouldBlock) => {}
                Err(nb::Error::Other(never)) => match never {},
            }
        }
    }

    fn acknowledge(&mut self, buffer: BufferType) {
        self.regs.modify_reg::<Interrupts, _>(|w| match buffer {
            BufferType::Primary => w.set_tpif(true),
            BufferType::Secondary => w.set_tsif(true),
        });
    }

    /// Returns `Ok` once a transmission from `buffer` completed since the
    /// last call, acknowledging the completion flag.
    pub fn poll_transmission(&mut self, buffer: BufferType) -> nb::Result<(), Void> {
        let flags: Interrupts = self.regs.read_reg();
        let done = match buffer {
            BufferType::Primary => flags.tpif(),
            BufferType::Secondary => flags.tsif(),
        };
        if done {
            self.acknowledge(buffer);
            Ok(())
        } else {
            Err(nb::Error::WouldBlock)
        }
    }

    fn poll_aborted(&self, selection: TxBufferSet) -> nb::Result<(), Void> {
        let command: Command = self.regs.read_reg();
        let ptb_pending = selection.contains(BufferType::Primary) && command.tpe();
        let stb_pending = selection.contains(BufferType::Secondary)
            && StbStatus::from(command.tsstat()) != StbStatus::Empty;
        if ptb_pending || stb_pending {
            Err(nb::Error::WouldBlock)
        } else {
            Ok(())
        }
    }

    /// Requests cancellation of the frames in `selection`. Returns
    /// [`nb::Error::WouldBlock`] until the selected buffers are empty.
    ///
    /// A frame that is already being transmitted is not cancelled; it may
    /// still complete successfully, after which the buffer reads as empty.
    pub fn abort(&mut self, selection: TxBufferSet) -> nb::Result<(), Void> {
        self.poll_aborted(selection).or_else(|_| {
            self.regs.modify_reg::<Command, _>(|w| {
                w.set_tpa(selection.contains(BufferType::Primary));
                w.set_tsa(selection.contains(BufferType::Secondary));
            });
            self.poll_aborted(selection)
        })
    }

    /// Fill state of both buffers
    pub fn status(&self) -> TransmitStatus {
        let command: Command = self.regs.read_reg();
        TransmitStatus {
            stb: command.tsstat().into(),
            ptb_busy: command.tpe(),
            stb_busy: command.tsall() || command.tsone(),
        }
    }
}
