//! Receive buffer
//!
//! Received frames are stored in a FIFO of [`RX_SLOTS`] slots. The oldest
//! frame is presented in the receive buffer window; releasing it advances the
//! FIFO. What happens on overflow is selected by
//! [`OverflowPolicy`](crate::config::OverflowPolicy).

use crate::message::rx::RxFrame;
use crate::reg::{CanRegisters, Command};
use void::Void;

/// Number of slots in the receive FIFO
pub const RX_SLOTS: usize = 8;

/// Fill state of the receive FIFO
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RxStatus {
    /// No frame buffered
    Empty,
    /// Some frames buffered, below the almost full limit
    LessThanWarnLimit,
    /// At or above the almost full limit, not full
    MoreThanWarnLimit,
    /// Every slot holds a frame
    Full,
}

impl From<u8> for RxStatus {
    fn from(rstat: u8) -> Self {
        match rstat & 0b11 {
            0 => Self::Empty,
            1 => Self::LessThanWarnLimit,
            2 => Self::MoreThanWarnLimit,
            _ => Self::Full,
        }
    }
}

/// Receive side of the controller
pub struct RxFifo<'a, R> {
    regs: &'a mut R,
}

impl<'a, R: CanRegisters> RxFifo<'a, R> {
    pub(crate) fn new(regs: &'a mut R) -> Self {
        Self { regs }
    }

    /// Fill state
    pub fn status(&self) -> RxStatus {
        self.regs.read_reg::<Command>().rstat().into()
    }

    /// Returns `true` if the queue is empty
    pub fn is_empty(&self) -> bool {
        self.status() == RxStatus::Empty
    }

    /// Returns the number of frames the queue can hold
    pub fn capacity(&self) -> usize {
        RX_SLOTS
    }

    /// `true` if a frame was lost or overwritten since the flag was last
    /// cleared through
    /// [`StatusFlag::RxOverflow`](crate::status::StatusFlag::RxOverflow)
    pub fn overflowed(&self) -> bool {
        self.regs.read_reg::<Command>().rov()
    }

    /// Returns the oldest frame if available and releases its slot. Note that
    /// the FIFO also implements [`Iterator`] to receive frames until the
    /// queue is empty.
    pub fn receive(&mut self) -> nb::Result<RxFrame, Void> {
        if self.is_empty() {
            return Err(nb::Error::WouldBlock);
        }
        let frame = RxFrame::read_from(&*self.regs);
        self.regs.modify_reg::<Command, _>(|w| w.set_rrel(true));
        Ok(frame)
    }

    /// Receives up to `max_frames` frames.
    ///
    /// The frames are read out and released before this returns, so the
    /// iterator only yields what was buffered at call time. Frames not
    /// consumed from the iterator are lost.
    pub fn drain(mut self, max_frames: usize) -> Drain {
        let mut frames = [None; RX_SLOTS];
        for slot in frames.iter_mut().take(max_frames) {
            match self.receive() {
                Ok(frame) => *slot = Some(frame),
                Err(_) => break,
            }
        }
        Drain { frames, next: 0 }
    }
}

impl<R: CanRegisters> Iterator for RxFifo<'_, R> {
    type Item = RxFrame;

    fn next(&mut self) -> Option<Self::Item> {
        self.receive().ok()
    }
}

/// Frames taken out of the receive FIFO by [`RxFifo::drain`]
///
/// Once it returned `None` it keeps returning `None`.
pub struct Drain {
    frames: [Option<RxFrame>; RX_SLOTS],
    next: usize,
}

impl Iterator for Drain {
    type Item = RxFrame;

    fn next(&mut self) -> Option<Self::Item> {
        let frame = self.frames.get_mut(self.next)?.take();
        self.next = if frame.is_some() { self.next + 1 } else { RX_SLOTS };
        frame
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = self
            .frames
            .get(self.next..)
            .map_or(0, |rest| rest.iter().filter(|f| f.is_some()).count());
        (left, Some(left))
    }
}

impl ExactSizeIterator for Drain {}

impl core::iter::FusedIterator for Drain {}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn status_decoding() {
        assert_eq!(RxStatus::from(0), RxStatus::Empty);
        assert_eq!(RxStatus::from(1), RxStatus::LessThanWarnLimit);
        assert_eq!(RxStatus::from(2), RxStatus::MoreThanWarnLimit);
        assert_eq!(RxStatus::from(3), RxStatus::Full);
    }
}
