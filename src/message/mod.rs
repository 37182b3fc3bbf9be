//! Handling of messages/frames

pub mod rx;
pub mod tx;

pub use rx::RxFrame;
pub use tx::TxFrame;

use crate::reg::{CanRegisters, FrameControl, FrameId, DATA_WORD};
use core::cmp::min;
use embedded_can::{ExtendedId, Id, StandardId};

/// Largest payload of a CAN FD frame
pub const MAX_DATA_LEN: usize = 64;

/// Data does not fit in a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TooMuchData;

/// Frame contents shared by both directions
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) struct RawFrame {
    pub(crate) id: Id,
    pub(crate) rtr: bool,
    pub(crate) fdf: bool,
    pub(crate) brs: bool,
    pub(crate) dlc: u8,
    pub(crate) data: [u8; MAX_DATA_LEN],
}

#[cfg(feature = "defmt")]
impl defmt::Format for RawFrame {
    fn format(&self, f: defmt::Formatter<'_>) {
        defmt::write!(
            f,
            "RawFrame(id: {}, rtr: {}, fdf: {}, brs: {}, dlc: {=u8}, data: {=[u8]})",
            FormatId(self.id),
            self.rtr,
            self.fdf,
            self.brs,
            self.dlc,
            self.data(),
        )
    }
}

/// Identifier as logged: raw value, extended ones tagged with `IDE`
#[cfg(feature = "defmt")]
pub(crate) struct FormatId(pub(crate) Id);

#[cfg(feature = "defmt")]
impl defmt::Format for FormatId {
    fn format(&self, f: defmt::Formatter<'_>) {
        match self.0 {
            Id::Standard(id) => defmt::write!(f, "{=u16:#x}", id.as_raw()),
            Id::Extended(id) => defmt::write!(f, "{=u32:#x} IDE", id.as_raw()),
        }
    }
}

impl RawFrame {
    pub(crate) fn is_extended(&self) -> bool {
        matches!(self.id, Id::Extended(_))
    }

    /// Data length in bytes
    pub(crate) fn decoded_dlc(&self) -> usize {
        dlc_to_len(self.dlc, self.fdf)
    }

    pub(crate) fn data(&self) -> &[u8] {
        if self.rtr {
            &[]
        } else {
            &self.data[..min(self.decoded_dlc(), MAX_DATA_LEN)]
        }
    }

    fn id_word(&self) -> FrameId {
        let mut w = FrameId::default();
        w.set_id(id_to_raw(self.id));
        w
    }

    fn control_word(&self) -> FrameControl {
        let mut w = FrameControl::default();
        w.set_dlc(self.dlc);
        w.set_brs(self.brs);
        w.set_fdf(self.fdf);
        w.set_rtr(self.rtr);
        w.set_ide(self.is_extended());
        w
    }

    /// Copies the frame into the transmit buffer window. Only the words
    /// covered by the data length are written.
    pub(crate) fn write_to<R: CanRegisters>(&self, regs: &mut R) {
        regs.write_tbuf(0, self.id_word().0);
        regs.write_tbuf(1, self.control_word().0);
        let words = self.data().len().div_ceil(4);
        for (i, chunk) in self.data.chunks_exact(4).take(words).enumerate() {
            let word = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
            regs.write_tbuf(DATA_WORD + i, word);
        }
    }

    /// Decodes the header words and the payload read through `word`
    pub(crate) fn decode(
        id: FrameId,
        control: FrameControl,
        mut word: impl FnMut(usize) -> u32,
    ) -> Self {
        let rtr = control.rtr();
        let fdf = control.fdf();
        let mut frame = Self {
            id: raw_to_id(id.id(), control.ide()),
            rtr,
            fdf,
            brs: fdf && control.brs(),
            dlc: control.dlc(),
            data: [0; MAX_DATA_LEN],
        };
        let words = frame.data().len().div_ceil(4);
        for (i, chunk) in frame.data.chunks_exact_mut(4).take(words).enumerate() {
            chunk.copy_from_slice(&word(DATA_WORD + i).to_le_bytes());
        }
        frame
    }
}

pub(crate) fn id_to_raw(id: Id) -> u32 {
    match id {
        Id::Standard(id) => id.as_raw().into(),
        Id::Extended(id) => id.as_raw(),
    }
}

pub(crate) fn raw_to_id(raw: u32, extended: bool) -> Id {
    if extended {
        // The mask ensures the ID is in range for a 29-bit integer
        Id::Extended(unsafe { ExtendedId::new_unchecked(raw & ExtendedId::MAX.as_raw()) })
    } else {
        // The mask ensures the ID is in range for a 11-bit integer
        Id::Standard(unsafe { StandardId::new_unchecked(raw as u16 & StandardId::MAX.as_raw()) })
    }
}

/// Finds the smallest data length code that encodes at least len bytes
pub(crate) fn len_to_dlc(len: usize, fd_format: bool) -> Result<u8, TooMuchData> {
    if len > MAX_DATA_LEN {
        return Err(TooMuchData);
    }
    if fd_format {
        match len as u8 {
            0..=8 => Ok(len as u8),
            9..=12 => Ok(9),
            13..=16 => Ok(10),
            17..=20 => Ok(11),
            21..=24 => Ok(12),
            25..=32 => Ok(13),
            33..=48 => Ok(14),
            _ => Ok(15),
        }
    } else {
        match len as u8 {
            0..=8 => Ok(len as u8),
            9.. => Err(TooMuchData),
        }
    }
}

/// Converts data length code to a length in bytes
pub(crate) fn dlc_to_len(dlc: u8, fd_format: bool) -> usize {
    if fd_format {
        match dlc {
            0..=8 => dlc.into(),
            9 => 12,
            10 => 16,
            11 => 20,
            12 => 24,
            13 => 32,
            14 => 48,
            15.. => 64,
        }
    } else {
        match dlc {
            0..=8 => dlc.into(),
            9.. => 8,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[cfg(feature = "defmt")]
    #[test]
    fn identifier_carrying_types_are_loggable() {
        fn loggable<T: defmt::Format>() {}
        loggable::<RawFrame>();
        loggable::<TxFrame>();
        loggable::<RxFrame>();
        loggable::<crate::tx_buffers::Queued>();
        loggable::<crate::ttc::TtcConfig>();
    }

    #[test]
    fn fd_lengths_round_up_to_the_next_step() {
        assert_eq!(len_to_dlc(10, true), Ok(9));
        assert_eq!(dlc_to_len(9, true), 12);
        assert_eq!(len_to_dlc(64, true), Ok(15));
        assert_eq!(len_to_dlc(65, true), Err(TooMuchData));
        assert_eq!(len_to_dlc(9, false), Err(TooMuchData));
    }

    #[test]
    fn classic_dlc_above_eight_means_eight_bytes() {
        assert_eq!(dlc_to_len(15, false), 8);
    }
}
