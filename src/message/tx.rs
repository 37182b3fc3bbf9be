//! Frames to be sent on the bus

use super::*;
use embedded_can::Frame;

/// Frame owned by the caller until it is copied into a transmit slot
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TxFrame(pub(crate) RawFrame);

/// Selects the type of the Classic CAN frame.
pub enum ClassicFrameType<'a> {
    /// 0-8 byte message payload
    Data(&'a [u8]),
    /// Requests transmission of the identified frame
    Remote {
        /// Length, in bytes, of the requested frame
        desired_len: usize,
    },
}

/// Selects frame type along with the valid payload type and configuration
/// specific to the chosen format.
pub enum FrameType<'a> {
    /// Classic CAN
    Classic(ClassicFrameType<'a>),
    /// CAN FD frame. Note that the controller must be configured in
    /// [`Mode::Fd`](crate::config::Mode::Fd) to transmit this format.
    FlexibleDatarate {
        /// 0-64 byte message payload
        payload: &'a [u8],
        /// The data phase is transmitted with the fast bit timing
        bit_rate_switching: bool,
    },
}

/// Describes a CAN frame that is not yet converted to the representation
/// the peripheral understands.
pub struct MessageBuilder<'a> {
    /// CAN identifier for the frame
    pub id: Id,
    /// Frame type with a payload
    pub frame_type: FrameType<'a>,
}

impl<'a> MessageBuilder<'a> {
    /// Create the frame
    pub fn build(self) -> Result<TxFrame, TooMuchData> {
        let mut data = [0; MAX_DATA_LEN];

        let mut copy_payload = |d: &[u8]| {
            if d.len() > MAX_DATA_LEN {
                return Err(TooMuchData);
            }
            data[..d.len()].copy_from_slice(d);
            Ok(())
        };

        let (fdf, brs, rtr, len) = match self.frame_type {
            FrameType::Classic(payload) => {
                let (rtr, len) = match payload {
                    ClassicFrameType::Data(payload) => {
                        copy_payload(payload)?;
                        (false, payload.len())
                    }
                    ClassicFrameType::Remote { desired_len } => (true, desired_len),
                };
                (false, false, rtr, len)
            }
            FrameType::FlexibleDatarate {
                payload,
                bit_rate_switching,
            } => {
                copy_payload(payload)?;
                (true, bit_rate_switching, false, payload.len())
            }
        };
        let dlc = len_to_dlc(len, fdf)?;

        Ok(TxFrame(RawFrame {
            id: self.id,
            rtr,
            fdf,
            brs,
            dlc,
            data,
        }))
    }
}

impl TxFrame {
    /// Classic data frame
    pub fn new_classic(id: impl Into<Id>, data: &[u8]) -> Result<Self, TooMuchData> {
        MessageBuilder {
            id: id.into(),
            frame_type: FrameType::Classic(ClassicFrameType::Data(data)),
        }
        .build()
    }

    /// CAN FD data frame
    pub fn new_fd(
        id: impl Into<Id>,
        data: &[u8],
        bit_rate_switching: bool,
    ) -> Result<Self, TooMuchData> {
        MessageBuilder {
            id: id.into(),
            frame_type: FrameType::FlexibleDatarate {
                payload: data,
                bit_rate_switching,
            },
        }
        .build()
    }

    /// `true` for CAN FD frames
    pub fn fd_format(&self) -> bool {
        self.0.fdf
    }

    /// `true` if the data phase uses the fast bit timing
    pub fn bit_rate_switching(&self) -> bool {
        self.0.brs
    }

    /// Data length code
    pub fn raw_dlc(&self) -> u8 {
        self.0.dlc
    }
}

impl Frame for TxFrame {
    fn new(id: impl Into<Id>, data: &[u8]) -> Option<Self> {
        Self::new_classic(id, data).ok()
    }

    fn new_remote(id: impl Into<Id>, dlc: usize) -> Option<Self> {
        if dlc > 8 {
            return None;
        }
        MessageBuilder {
            id: id.into(),
            frame_type: FrameType::Classic(ClassicFrameType::Remote { desired_len: dlc }),
        }
        .build()
        .ok()
    }

    fn is_extended(&self) -> bool {
        self.0.is_extended()
    }

    fn is_remote_frame(&self) -> bool {
        self.0.rtr
    }

    fn id(&self) -> Id {
        self.0.id
    }

    fn dlc(&self) -> usize {
        self.0.decoded_dlc()
    }

    fn data(&self) -> &[u8] {
        self.0.data()
    }
}
