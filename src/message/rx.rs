//! Frames received from the bus.

use super::*;
use crate::error::ErrorType;
use crate::reg::RTS_WORD;
use embedded_can::Frame;

/// Frame copied out of the receive buffer. Owned by the caller.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct RxFrame {
    pub(crate) raw: RawFrame,
    pub(crate) esi: bool,
    pub(crate) error_type: ErrorType,
    pub(crate) cycle_time: u16,
    pub(crate) loopback: bool,
    pub(crate) timestamp: u64,
}

impl RxFrame {
    /// Copies the slot currently presented in the receive buffer window.
    pub(crate) fn read_from<R: CanRegisters>(regs: &R) -> Self {
        Self::decode(|i| regs.read_rbuf(i))
    }

    /// Decodes a receive slot image accessed word by word
    pub(crate) fn decode(mut word: impl FnMut(usize) -> u32) -> Self {
        let id = FrameId(word(0));
        let control = FrameControl(word(1));
        let raw = RawFrame::decode(id, control, &mut word);
        let timestamp = u64::from(word(RTS_WORD)) | u64::from(word(RTS_WORD + 1)) << 32;
        Self {
            raw,
            esi: id.esi(),
            error_type: control.koer().into(),
            cycle_time: control.cycle_time(),
            loopback: control.tx(),
            timestamp,
        }
    }

    /// `true` for CAN FD frames
    pub fn fd_format(&self) -> bool {
        self.raw.fdf
    }

    /// `true` if the data phase used the fast bit timing
    pub fn bit_rate_switching(&self) -> bool {
        self.raw.brs
    }

    /// `true` if the sender of the frame indicated that it is in "error
    /// passive" state.
    pub fn is_transmitter_error_passive(&self) -> bool {
        self.esi
    }

    /// Data length code
    pub fn raw_dlc(&self) -> u8 {
        self.raw.dlc
    }

    /// Kind of error the frame was received with. Only frames stored with
    /// `receive_all` enabled carry something other than [`ErrorType::None`].
    pub fn error_type(&self) -> ErrorType {
        self.error_type
    }

    /// Local TTC timer value at reception
    pub fn cycle_time(&self) -> u16 {
        self.cycle_time
    }

    /// `true` if the frame was transmitted by this node (loopback modes)
    pub fn is_loopback(&self) -> bool {
        self.loopback
    }

    /// Receive time stamp; zero unless time stamping is enabled
    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }
}

impl Frame for RxFrame {
    fn new(id: impl Into<Id>, data: &[u8]) -> Option<Self> {
        TxFrame::new(id, data).map(Self::from)
    }

    fn new_remote(id: impl Into<Id>, dlc: usize) -> Option<Self> {
        TxFrame::new_remote(id, dlc).map(Self::from)
    }

    fn is_extended(&self) -> bool {
        self.raw.is_extended()
    }

    fn is_remote_frame(&self) -> bool {
        self.raw.rtr
    }

    fn id(&self) -> Id {
        self.raw.id
    }

    fn dlc(&self) -> usize {
        self.raw.decoded_dlc()
    }

    fn data(&self) -> &[u8] {
        self.raw.data()
    }
}

impl From<TxFrame> for RxFrame {
    fn from(frame: TxFrame) -> Self {
        Self {
            raw: frame.0,
            esi: false,
            error_type: ErrorType::None,
            cycle_time: 0,
            loopback: false,
            timestamp: 0,
        }
    }
}

impl From<RxFrame> for TxFrame {
    /// Turns a received frame back into one that can be sent, dropping the
    /// reception metadata.
    fn from(frame: RxFrame) -> Self {
        TxFrame(frame.raw)
    }
}
