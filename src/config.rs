//! CAN bus configuration

use crate::reg::{FastTiming, SlowTiming};
use core::ops::RangeInclusive;
use fugit::HertzU32;

/// Configuration for the CAN bus
#[derive(Copy, Clone, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CanConfig {
    /// Classic CAN or CAN FD
    pub mode: Mode,
    /// Participation on the bus once configuration is finished
    pub work_mode: WorkMode,
    /// Bit timing of the arbitration phase and of all classic frames
    pub slow_timing: BitTiming,
    /// Receive buffer configuration
    pub rx: RxConfig,
    /// Transmit buffer configuration
    pub tx: TxConfig,
    /// Error warning limit `EWL`, valid values are `0..=15`. The warning flag
    /// is raised once an error counter reaches `(EWL + 1) * 8`.
    pub error_warning_limit: u8,
    /// Time stamping of received frames
    pub timestamp: Option<TimestampPosition>,
}

impl CanConfig {
    /// Create an instance
    ///
    /// Slow bit timing must be provided, all other settings come
    /// pre-populated with default values.
    pub fn new(slow_timing: BitTiming) -> Self {
        Self {
            mode: Default::default(),
            work_mode: Default::default(),
            slow_timing,
            rx: Default::default(),
            tx: Default::default(),
            // Reset value, warning at 96 errors
            error_warning_limit: 0xB,
            timestamp: None,
        }
    }
}

/// Bit-timing parameters
///
/// The bit time is determined by
/// - the time quantum `t_q = prescaler / f_can`
/// - the number of time quanta in a bit, `segment1 + segment2`, where
///   `segment1` includes the synchronization segment
///
/// This struct expects *real* values, the offsets the registers expect are
/// handled within the HAL. No search for a valid setting is performed; the
/// values are checked and programmed as given.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct BitTiming {
    /// Time quanta before the sample point, including the synchronization
    /// segment
    pub segment1: u8,
    /// Time quanta after the sample point
    pub segment2: u8,
    /// Synchronization jump width
    pub sync_jump_width: u8,
    /// Divider of the CAN kernel clock
    pub prescaler: u16,
}

impl BitTiming {
    /// Create an instance
    pub const fn new(segment1: u8, segment2: u8, sync_jump_width: u8, prescaler: u16) -> Self {
        Self {
            segment1,
            segment2,
            sync_jump_width,
            prescaler,
        }
    }

    /// Returns the number of time quanta that make up one bit time, `t_bit /
    /// t_q`
    pub fn time_quanta_per_bit(&self) -> u32 {
        u32::from(self.segment1) + u32::from(self.segment2)
    }

    /// Bit rate resulting from these settings when the peripheral runs at
    /// `can_clock`
    pub fn bitrate(&self, can_clock: HertzU32) -> HertzU32 {
        let divider = u32::from(self.prescaler.max(1)) * self.time_quanta_per_bit().max(1);
        can_clock / divider
    }
}

/// Misconfigurations of [`BitTiming`].
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BitTimingError {
    /// SJW is outside the wrapped `RangeInclusive`
    SynchronizationJumpWidthOutOfRange(RangeInclusive<u32>),
    /// Segment 1 is outside the wrapped `RangeInclusive`
    Segment1OutOfRange(RangeInclusive<u32>),
    /// Segment 2 is outside the wrapped `RangeInclusive`
    Segment2OutOfRange(RangeInclusive<u32>),
    /// Prescaler is outside the wrapped `RangeInclusive`
    PrescalerOutOfRange(RangeInclusive<u32>),
    /// Segment 1 must be longer than segment 2
    Segment1NotAboveSegment2,
    /// SJW must not exceed segment 2
    JumpWidthAboveSegment2,
}

/// Valid values of a BitTiming struct
#[derive(Clone)]
pub(crate) struct BitTimingRanges {
    segment1: RangeInclusive<u32>,
    segment2: RangeInclusive<u32>,
    sync_jump_width: RangeInclusive<u32>,
    prescaler: RangeInclusive<u32>,
}

pub(crate) const SLOW_BIT_TIMING_RANGES: BitTimingRanges = BitTimingRanges {
    segment1: 2..=65,
    segment2: 1..=32,
    sync_jump_width: 1..=16,
    prescaler: 1..=256,
};

pub(crate) const FAST_BIT_TIMING_RANGES: BitTimingRanges = BitTimingRanges {
    segment1: 2..=17,
    segment2: 1..=9,
    sync_jump_width: 1..=8,
    prescaler: 1..=256,
};

impl BitTiming {
    pub(crate) fn check(&self, valid: &BitTimingRanges) -> Result<(), BitTimingError> {
        if !valid.segment1.contains(&self.segment1.into()) {
            Err(BitTimingError::Segment1OutOfRange(valid.segment1.clone()))
        } else if !valid.segment2.contains(&self.segment2.into()) {
            Err(BitTimingError::Segment2OutOfRange(valid.segment2.clone()))
        } else if !valid.sync_jump_width.contains(&self.sync_jump_width.into()) {
            Err(BitTimingError::SynchronizationJumpWidthOutOfRange(
                valid.sync_jump_width.clone(),
            ))
        } else if !valid.prescaler.contains(&self.prescaler.into()) {
            Err(BitTimingError::PrescalerOutOfRange(valid.prescaler.clone()))
        } else if self.segment1 < self.segment2 + 1 {
            Err(BitTimingError::Segment1NotAboveSegment2)
        } else if self.segment2 < self.sync_jump_width {
            Err(BitTimingError::JumpWidthAboveSegment2)
        } else {
            Ok(())
        }
    }

    /// Register image of a checked slow timing
    pub(crate) fn to_slow(self) -> SlowTiming {
        let mut w = SlowTiming::default();
        w.set_seg1(self.segment1 - 2);
        w.set_seg2(self.segment2 - 1);
        w.set_sjw(self.sync_jump_width - 1);
        w.set_presc((self.prescaler - 1) as u8);
        w
    }

    pub(crate) fn from_slow(r: SlowTiming) -> Self {
        Self {
            segment1: r.seg1() + 2,
            segment2: r.seg2() + 1,
            sync_jump_width: r.sjw() + 1,
            prescaler: u16::from(r.presc()) + 1,
        }
    }

    /// Register image of a checked fast timing
    pub(crate) fn to_fast(self) -> FastTiming {
        let mut w = FastTiming::default();
        w.set_seg1(self.segment1 - 2);
        w.set_seg2(self.segment2 - 1);
        w.set_sjw(self.sync_jump_width - 1);
        w.set_presc((self.prescaler - 1) as u8);
        w
    }

    pub(crate) fn from_fast(r: FastTiming) -> Self {
        Self {
            segment1: r.seg1() + 2,
            segment2: r.seg2() + 1,
            sync_jump_width: r.sjw() + 1,
            prescaler: u16::from(r.presc()) + 1,
        }
    }
}

/// Enable/disable CAN-FD and related features
#[derive(Default, Copy, Clone, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Mode {
    /// Classic mode with 8-bytes data
    #[default]
    Classic,
    /// Transmission and reception of CAN FD frames (with up to 64 bytes of
    /// data) is enabled. This does not prevent use of classic CAN frames.
    Fd {
        /// Bit timing parameters for the data phase of bit rate switched FD
        /// frames.
        fast_timing: BitTiming,
        /// ISO 11898-1:2015 frame format (`false` selects Bosch non-ISO)
        iso: bool,
        /// Transmitter delay compensation: secondary sample point offset in
        /// `0..=127` time quanta, `None` disables compensation
        tdc: Option<u8>,
    },
}

/// Bus participation of an operational controller
#[derive(Default, Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum WorkMode {
    /// Regular transmission and reception
    #[default]
    Normal,
    /// Receive only; the node neither acknowledges nor transmits
    ListenOnly,
}

/// Loopback setups, only available to a controller in test mode
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Loopback {
    /// Transmitted frames are routed back internally, the bus is untouched
    Internal,
    /// Transmitted frames go out on the bus and are received back
    External {
        /// Acknowledge own frames instead of waiting for another node
        self_ack: bool,
    },
}

/// Denotes a receive buffer configuration
#[derive(Copy, Clone, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct RxConfig {
    /// What happens to an incoming frame when the buffer is full
    pub overflow: OverflowPolicy,
    /// Fill level raising the almost full flag, valid values are `1..=8`
    pub almost_full_limit: u8,
    /// Store frames received with errors as well, tagged with their error
    /// kind
    pub receive_all: bool,
}

impl Default for RxConfig {
    fn default() -> Self {
        Self {
            overflow: OverflowPolicy::default(),
            almost_full_limit: 6,
            receive_all: false,
        }
    }
}

/// Receive buffer overflow handling
#[derive(Default, Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum OverflowPolicy {
    /// The oldest frame is overwritten by the new one
    #[default]
    SaveNew,
    /// The new frame is dropped
    DiscardNew,
}

impl From<OverflowPolicy> for bool {
    fn from(val: OverflowPolicy) -> Self {
        match val {
            OverflowPolicy::DiscardNew => true,
            OverflowPolicy::SaveNew => false,
        }
    }
}

/// Denotes a TX related configuration
#[derive(Default, Copy, Clone, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TxConfig {
    /// Order in which the secondary buffer is emptied
    pub stb_mode: StbMode,
    /// Disable automatic retransmission for both buffers
    pub single_shot: bool,
}

/// Mode of operation for the secondary transmit buffer
#[derive(Default, Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum StbMode {
    /// Frames are sent according to the order they are enqueued
    #[default]
    Fifo,
    /// Frames are sent according to their priority
    ///
    /// Lower ID means higher priority. This is the same order as arbitration
    /// on the bus would give.
    Priority,
}

impl From<StbMode> for bool {
    fn from(val: StbMode) -> Self {
        match val {
            StbMode::Priority => true,
            StbMode::Fifo => false,
        }
    }
}

/// Point of the frame at which the receive time stamp is taken
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TimestampPosition {
    /// Start of frame
    StartOfFrame,
    /// End of frame
    EndOfFrame,
}
