//! Bus lifecycle
//!
//! A controller is created as a [`CanConfigurable`], held in reset, and turned
//! into an operational [`Can`] with [`CanConfigurable::finalize`]. The
//! operating state ([`mode::Production`] or [`mode::Test`]) is tracked in the
//! type of [`Can`]; only a controller in test mode can tamper with the error
//! counters.

pub mod mode;

use crate::config::{
    BitTiming, BitTimingError, CanConfig, Loopback, Mode, TimestampPosition, WorkMode,
    FAST_BIT_TIMING_RANGES, SLOW_BIT_TIMING_RANGES,
};
use crate::error::{check_error_warning_limit, ErrorState};
use crate::filter::{AcceptanceFilter, FilterSet, Filters};
use crate::message::{RxFrame, TooMuchData, TxFrame};
use crate::reg::{CanRegisters, Command, ErrorCapture, FastTiming, FilterControl, Interrupts};
use crate::reg::{SlowTiming, TimeTrigger};
use crate::rx_fifo::{Drain, RxFifo, RX_SLOTS};
use crate::status::{Status, StatusSet};
use crate::ttc::{Ttc, TtcConfig, TtcError};
use crate::tx_buffers::{BufferType, StbPolicy, TransmitStatus, Tx, TxBufferSet};
use canctrl_core::{CanId, Dependencies, Duration, Monotonic};
use core::marker::PhantomData;
use core::ops::{Deref, DerefMut};
use fugit::HertzU32;
use mode::{OperatingMode, Production, Test};
use void::Void;

/// Largest secondary sample point offset for transmitter delay compensation
const MAX_TDC_OFFSET: u8 = 127;

/// Errors that may occur during configuration
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ConfigurationError {
    /// Problems with the bit timing configuration
    BitTiming(BitTimingError),
    /// Receive almost full limit is not in the range [1, 8]
    InvalidAlmostFullLimit,
    /// Error warning limit is not in the range [0, 15]
    InvalidErrorWarningLimit,
    /// Transmitter delay compensation offset is not in the range [0, 127]
    InvalidTdcOffset,
    /// Filter selection names a filter outside of the bank
    FilterIndex,
    /// Number of filters differs from the number of selected indices
    FilterCountMismatch,
    /// Filter code or mask does not fit in 29 bits
    FilterId,
    /// Problems with the TTC configuration
    InvalidTtcConfig(TtcError),
    /// FD frame while the controller is configured for classic CAN
    FdDisabled,
    /// Payload does not fit in a frame
    TooMuchData,
    /// The operation requires the controller to be held in reset
    NotInReset,
    /// The operation requires normal communication (not in reset, not
    /// listen only, TTC buffer mode off)
    NotOperational,
}

impl From<BitTimingError> for ConfigurationError {
    fn from(value: BitTimingError) -> Self {
        Self::BitTiming(value)
    }
}

impl From<TtcError> for ConfigurationError {
    fn from(value: TtcError) -> Self {
        Self::InvalidTtcConfig(value)
    }
}

impl From<TooMuchData> for ConfigurationError {
    fn from(_: TooMuchData) -> Self {
        Self::TooMuchData
    }
}

/// Errors of bus operations
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    /// The deadline passed before the operation completed
    Timeout,
    /// The selected transmit buffer has no free slot
    BufferFull,
    /// The request is invalid for the current configuration or state
    Configuration(ConfigurationError),
}

impl From<ConfigurationError> for Error {
    fn from(value: ConfigurationError) -> Self {
        Self::Configuration(value)
    }
}

impl From<TooMuchData> for Error {
    fn from(value: TooMuchData) -> Self {
        Self::Configuration(value.into())
    }
}

impl embedded_can::Error for Error {
    fn kind(&self) -> embedded_can::ErrorKind {
        embedded_can::ErrorKind::Other
    }
}

/// Holds the controller in reset for its lifetime
///
/// Timing and filter registers are only writable in reset. The guard enters
/// reset if needed and restores the previous state when dropped. Entering
/// reset flushes the transmit and receive buffers.
pub struct ResetGuard<'a, R: CanRegisters> {
    regs: &'a mut R,
    was_in_reset: bool,
}

impl<'a, R: CanRegisters> ResetGuard<'a, R> {
    /// Enters reset unless already there
    pub fn new(regs: &'a mut R) -> Self {
        let was_in_reset = regs.read_reg::<Command>().reset();
        if !was_in_reset {
            regs.modify_reg::<Command, _>(|w| w.set_reset(true));
        }
        Self { regs, was_in_reset }
    }
}

impl<R: CanRegisters> Deref for ResetGuard<'_, R> {
    type Target = R;

    fn deref(&self) -> &R {
        &*self.regs
    }
}

impl<R: CanRegisters> DerefMut for ResetGuard<'_, R> {
    fn deref_mut(&mut self) -> &mut R {
        &mut *self.regs
    }
}

impl<R: CanRegisters> Drop for ResetGuard<'_, R> {
    fn drop(&mut self) {
        if !self.was_in_reset {
            self.regs.modify_reg::<Command, _>(|w| w.set_reset(false));
        }
    }
}

/// An operational CAN bus. Bus off stops bus operation until the controller
/// recovers on its own; [`Can::error_state`] reports it.
pub struct Can<Id, D, R, C, M = Production> {
    /// Implementation details. The field is public to allow destructuring.
    pub internals: Internals<Id, D, R, C>,
    _mode: PhantomData<M>,
}

/// Implementation details.
pub struct Internals<Id, D, R, C> {
    regs: R,
    clock: C,
    dependencies: D,
    config: CanConfig,
    _id: PhantomData<Id>,
}

impl<Id, D, R: CanRegisters, C> Internals<Id, D, R, C> {
    fn set_reset(&mut self, reset: bool) {
        self.regs.modify_reg::<Command, _>(|w| w.set_reset(reset));
    }

    fn fd_enabled(&self) -> bool {
        matches!(self.config.mode, Mode::Fd { .. })
    }
}

/// A CAN bus held in reset. Before frames can be sent and received, it needs
/// to be [`Self::finalize`]d.
pub struct CanConfigurable<Id, D, R, C>(
    /// The controller is in reset while this is wrapped.
    Can<Id, D, R, C, Production>,
);

impl<Id: CanId, D: Dependencies<Id>, R: CanRegisters, C: Monotonic> CanConfigurable<Id, D, R, C> {
    /// Create new can peripheral.
    ///
    /// The controller enters reset right away; nothing else is written until
    /// [`Self::finalize`].
    pub fn new(dependencies: D, regs: R, clock: C, config: CanConfig) -> Self {
        let mut internals = Internals {
            regs,
            clock,
            dependencies,
            config,
            _id: PhantomData,
        };
        internals.set_reset(true);
        Self(Can {
            internals,
            _mode: PhantomData,
        })
    }

    /// Allows changing the configuration before it is applied
    pub fn config(&mut self) -> &mut CanConfig {
        &mut self.0.internals.config
    }

    /// Allows reconfiguring the acceptance filters.
    pub fn filters(&mut self) -> Filters<'_, R> {
        Filters::new(&mut self.0.internals.regs)
    }

    /// Allows reconfiguring interrupts.
    pub fn status(&mut self) -> Status<'_, R> {
        Status::new(&mut self.0.internals.regs)
    }

    /// Validates the whole configuration; nothing is written if any part is
    /// invalid.
    fn check_config(&self) -> Result<(), ConfigurationError> {
        let config = &self.0.internals.config;
        config.slow_timing.check(&SLOW_BIT_TIMING_RANGES)?;
        if let Mode::Fd {
            fast_timing, tdc, ..
        } = config.mode
        {
            fast_timing.check(&FAST_BIT_TIMING_RANGES)?;
            if tdc.is_some_and(|offset| offset > MAX_TDC_OFFSET) {
                return Err(ConfigurationError::InvalidTdcOffset);
            }
        }
        if !(1..=RX_SLOTS as u8).contains(&config.rx.almost_full_limit) {
            return Err(ConfigurationError::InvalidAlmostFullLimit);
        }
        check_error_warning_limit(config.error_warning_limit)
    }

    /// Apply parameters from a bus config struct
    fn apply_bus_config(&mut self) {
        let Internals { regs, config, .. } = &mut self.0.internals;

        regs.write_reg(config.slow_timing.to_slow());

        match config.mode {
            Mode::Classic => {
                regs.modify_reg::<Command, _>(|w| w.set_fd_iso(false));
                regs.modify_reg::<ErrorCapture, _>(|w| w.set_tdcen(false));
            }
            Mode::Fd {
                fast_timing,
                iso,
                tdc,
            } => {
                regs.write_reg(fast_timing.to_fast());
                regs.modify_reg::<Command, _>(|w| w.set_fd_iso(iso));
                regs.modify_reg::<ErrorCapture, _>(|w| {
                    w.set_sspoff(tdc.unwrap_or(0));
                    w.set_tdcen(tdc.is_some());
                });
            }
        }

        regs.modify_reg::<Interrupts, _>(|w| {
            w.set_afwl(config.rx.almost_full_limit);
            w.set_ewl(config.error_warning_limit);
        });

        regs.modify_reg::<Command, _>(|w| {
            w.set_rom(config.rx.overflow.into());
            w.set_rball(config.rx.receive_all);
            w.set_tsmode(config.tx.stb_mode.into());
            w.set_tsss(config.tx.single_shot);
            w.set_tpss(config.tx.single_shot);
            w.set_lbmi(false);
            w.set_lbme(false);
            w.set_sack(false);
            w.set_lom(config.work_mode == WorkMode::ListenOnly);
        });

        regs.modify_reg::<FilterControl, _>(|w| {
            w.set_timeen(config.timestamp.is_some());
            w.set_timepos(config.timestamp == Some(TimestampPosition::EndOfFrame));
        });
    }

    /// Locks the configuration and enters normal operation.
    pub fn finalize(mut self) -> Result<Can<Id, D, R, C>, ConfigurationError> {
        if let Err(e) = self.check_config() {
            #[cfg(feature = "defmt")]
            defmt::warn!("invalid configuration: {}", e);
            return Err(e);
        }
        self.apply_bus_config();

        let mut can = self.0;
        can.internals.set_reset(false);
        #[cfg(feature = "defmt")]
        defmt::debug!("controller operational");
        Ok(can)
    }
}

impl<Id: CanId, D: Dependencies<Id>, R: CanRegisters, C: Monotonic> Can<Id, D, R, C> {
    /// Creates the peripheral and applies `config` in one step
    pub fn init(
        dependencies: D,
        regs: R,
        clock: C,
        config: CanConfig,
    ) -> Result<Self, ConfigurationError> {
        CanConfigurable::new(dependencies, regs, clock, config).finalize()
    }

    /// Switches between regular and listen only operation
    pub fn set_work_mode(&mut self, work_mode: WorkMode) {
        self.internals.config.work_mode = work_mode;
        self.internals
            .regs
            .modify_reg::<Command, _>(|w| w.set_lom(work_mode == WorkMode::ListenOnly));
    }

    /// Enters test mode with the given loopback setup
    pub fn into_test_mode(mut self, loopback: Loopback) -> Can<Id, D, R, C, Test> {
        set_loopback(&mut self.internals.regs, Some(loopback));
        #[cfg(feature = "defmt")]
        defmt::debug!("test mode: {}", loopback);
        Can {
            internals: self.internals,
            _mode: PhantomData,
        }
    }
}

impl<Id: CanId, D: Dependencies<Id>, R: CanRegisters, C: Monotonic> Can<Id, D, R, C, Test> {
    /// Changes the loopback setup
    pub fn set_loopback(&mut self, loopback: Loopback) {
        set_loopback(&mut self.internals.regs, Some(loopback));
    }

    /// Forces the node into bus off
    pub fn force_bus_off(&mut self) {
        if !self.internals.regs.read_reg::<Command>().busoff() {
            self.internals
                .regs
                .modify_reg::<Command, _>(|w| w.set_busoff(true));
        }
    }

    /// Resets both error counters. The controller only accepts this while
    /// bus off, so bus off is forced first if needed.
    pub fn clear_error_counters(&mut self) {
        self.force_bus_off();
        self.internals
            .regs
            .modify_reg::<Command, _>(|w| w.set_busoff(true));
    }

    /// Leaves test mode
    pub fn into_production(mut self, work_mode: WorkMode) -> Can<Id, D, R, C> {
        set_loopback(&mut self.internals.regs, None);
        let mut can = Can {
            internals: self.internals,
            _mode: PhantomData,
        };
        can.set_work_mode(work_mode);
        can
    }
}

/// Loopback bits are only changed in reset
fn set_loopback<R: CanRegisters>(regs: &mut R, loopback: Option<Loopback>) {
    let mut regs = ResetGuard::new(regs);
    regs.modify_reg::<Command, _>(|w| {
        w.set_lbmi(loopback == Some(Loopback::Internal));
        w.set_lbme(matches!(loopback, Some(Loopback::External { .. })));
        w.set_sack(loopback == Some(Loopback::External { self_ack: true }));
        if loopback.is_some() {
            w.set_lom(false);
        }
    });
}

impl<Id: CanId, D: Dependencies<Id>, R: CanRegisters, C: Monotonic, M: OperatingMode>
    Can<Id, D, R, C, M>
{
    /// Puts the controller back in reset for reconfiguration. Pending frames
    /// are dropped.
    pub fn configure(self) -> CanConfigurable<Id, D, R, C> {
        let mut internals = self.internals;
        internals.set_reset(true);
        set_loopback(&mut internals.regs, None);
        #[cfg(feature = "defmt")]
        defmt::debug!("controller in reset");
        CanConfigurable(Can {
            internals,
            _mode: PhantomData,
        })
    }

    /// Disables all interrupt sources and TTC, enters reset and releases the
    /// resources.
    pub fn deinit(mut self) -> (D, R, C) {
        self.status().int_cmd(StatusSet::all(), false);
        self.internals
            .regs
            .modify_reg::<TimeTrigger, _>(|w| w.set_tten(false));
        self.internals
            .regs
            .modify_reg::<Command, _>(|w| w.set_tttbm(false));
        self.internals.set_reset(true);
        #[cfg(feature = "defmt")]
        defmt::debug!("controller released");
        let Internals {
            regs,
            clock,
            dependencies,
            ..
        } = self.internals;
        (dependencies, regs, clock)
    }

    /// Applied configuration
    pub fn config(&self) -> &CanConfig {
        &self.internals.config
    }

    /// Dependencies the bus was created with
    pub fn dependencies(&self) -> &D {
        &self.internals.dependencies
    }

    /// Transmit side
    pub fn tx(&mut self) -> Tx<'_, R, C> {
        let fd_enabled = self.internals.fd_enabled();
        Tx::new(&mut self.internals.regs, &self.internals.clock, fd_enabled)
    }

    /// Receive side
    pub fn rx(&mut self) -> RxFifo<'_, R> {
        RxFifo::new(&mut self.internals.regs)
    }

    /// Acceptance filters. Use [`Self::configure_filters`] to rewrite them
    /// without managing reset yourself.
    pub fn filters(&mut self) -> Filters<'_, R> {
        Filters::new(&mut self.internals.regs)
    }

    /// Status and interrupt flags
    pub fn status(&mut self) -> Status<'_, R> {
        Status::new(&mut self.internals.regs)
    }

    /// Time-triggered communication
    pub fn ttc(&mut self) -> Ttc<'_, R> {
        let fd_enabled = self.internals.fd_enabled();
        Ttc::new(&mut self.internals.regs, fd_enabled)
    }

    /// Copies `frame` into `buffer` and starts the transmission, see
    /// [`Tx::transmit`].
    pub fn transmit(
        &mut self,
        frame: &TxFrame,
        buffer: BufferType,
        policy: StbPolicy,
        timeout: Duration,
    ) -> Result<(), Error> {
        self.tx().transmit(frame, buffer, policy, timeout)
    }

    /// Requests cancellation of the frames in `selection`, see [`Tx::abort`].
    pub fn abort_transmit(&mut self, selection: TxBufferSet) -> nb::Result<(), Void> {
        self.tx().abort(selection)
    }

    /// Fill state of the transmit buffers
    pub fn transmit_status(&mut self) -> TransmitStatus {
        self.tx().status()
    }

    /// Receives up to `max_frames` frames buffered at the time of the call
    pub fn receive(&mut self, max_frames: usize) -> Drain {
        let rx = self.rx();
        #[cfg(feature = "defmt")]
        if rx.overflowed() {
            defmt::warn!("receive buffer overflowed");
        }
        rx.drain(max_frames)
    }

    /// Receives the oldest buffered frame
    pub fn receive_one(&mut self) -> nb::Result<RxFrame, Void> {
        self.rx().receive()
    }

    /// Rewrites the filters in `selection`, holding the controller in reset
    /// meanwhile. The filters are left disabled; see [`Self::enable_filters`].
    /// Entering reset drops pending frames.
    pub fn configure_filters(
        &mut self,
        selection: FilterSet,
        filters: &[AcceptanceFilter],
    ) -> Result<(), ConfigurationError> {
        let mut regs = ResetGuard::new(&mut self.internals.regs);
        Filters::new(&mut *regs).configure(selection, filters)?;
        Ok(())
    }

    /// Enables or disables the filters in `selection`
    pub fn enable_filters(&mut self, selection: FilterSet, enabled: bool) {
        self.filters().enable(selection, enabled)
    }

    /// `true` if any of `flags` is set
    pub fn get_status(&mut self, flags: StatusSet) -> bool {
        self.status().get(flags)
    }

    /// Clears `flags`, see [`Status::clear`]
    pub fn clear_status(&mut self, flags: StatusSet) {
        self.status().clear(flags)
    }

    /// Enables or disables the interrupt sources in `flags`
    pub fn int_cmd(&mut self, flags: StatusSet, enabled: bool) {
        self.status().int_cmd(flags, enabled)
    }

    /// Asserted flags whose interrupt source is enabled
    pub fn pending_interrupts(&mut self) -> StatusSet {
        self.status().pending_interrupts()
    }

    /// Programs the TTC unit
    pub fn configure_ttc(&mut self, config: &TtcConfig) -> Result<(), ConfigurationError> {
        self.ttc().configure(config)
    }

    /// Enables or disables TTC
    pub fn enable_ttc(&mut self, enabled: bool) {
        self.ttc().enable(enabled)
    }

    /// Local TTC cycle time
    pub fn ttc_timer(&mut self) -> u16 {
        self.ttc().timer()
    }

    /// Error counters and fault confinement state
    pub fn error_state(&self) -> ErrorState {
        let state = ErrorState::read(&self.internals.regs);
        #[cfg(feature = "defmt")]
        if state.bus_off {
            defmt::warn!("bus off: {}", state);
        }
        state
    }

    /// Slow bit timing as programmed
    pub fn slow_timing(&self) -> BitTiming {
        BitTiming::from_slow(self.internals.regs.read_reg::<SlowTiming>())
    }

    /// Fast bit timing as programmed
    pub fn fast_timing(&self) -> BitTiming {
        BitTiming::from_fast(self.internals.regs.read_reg::<FastTiming>())
    }

    /// Nominal bit rate resulting from the programmed slow timing
    pub fn bitrate(&self) -> HertzU32 {
        self.slow_timing()
            .bitrate(self.internals.dependencies.can_clock())
    }
}

impl<Id: CanId, D: Dependencies<Id>, R: CanRegisters, C: Monotonic, M: OperatingMode>
    embedded_can::nb::Can for Can<Id, D, R, C, M>
{
    type Frame = TxFrame;
    type Error = Error;

    /// Puts the frame in the secondary buffer and requests its transmission.
    /// Never replaces a pending frame.
    fn transmit(&mut self, frame: &TxFrame) -> nb::Result<Option<TxFrame>, Error> {
        match self.tx().enqueue(frame, BufferType::Secondary, StbPolicy::All) {
            Ok(()) => Ok(None),
            Err(Error::BufferFull) => Err(nb::Error::WouldBlock),
            Err(e) => Err(nb::Error::Other(e)),
        }
    }

    fn receive(&mut self) -> nb::Result<TxFrame, Error> {
        self.rx()
            .receive()
            .map(TxFrame::from)
            .map_err(|e| e.map(|never| match never {}))
    }
}
