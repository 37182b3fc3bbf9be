#![cfg_attr(not(test), no_std)]
#![warn(missing_docs)]

//! `canctrl-core` provides a set of essential abstractions that serve as a thin
//! integration layer between the platform independent [`canctrl`] crate and
//! platform specific HAL crates (in documentation also referred to as _target
//! HALs_).
//!
//! Traits from this crate are not supposed to be implemented by the
//! application developer; implementations should be provided by target HALs.
//!
//! Integrators of this crate into any given target HAL are responsible for
//! soundness of trait implementations and conforming to their respective safety
//! prerequisites.
//!
//! [`canctrl`]: <https://docs.rs/crate/canctrl/>

pub use fugit;

use core::marker::PhantomData;

/// Point in time as seen by a [`Monotonic`] time source (microsecond ticks)
pub type Instant = fugit::TimerInstantU64<1_000_000>;

/// Span of time as seen by a [`Monotonic`] time source (microsecond ticks)
pub type Duration = fugit::TimerDurationU64<1_000_000>;

/// Trait representing CAN peripheral identity
///
/// Types implementing this trait are expected to be used as marker types that
/// identify a specific instance of the CAN-CTRL peripheral available on the
/// platform (as there might be more than one). It only conveys *where* the
/// peripheral register block is located, not that it can be accessed. The
/// latter is expressed by the [`Dependencies`] trait.
///
/// # Safety
/// `CanId::ADDRESS` points to the start of a valid register block of a
/// CAN-CTRL peripheral
///
/// # Examples
/// ```no_run
/// use canctrl_core::CanId;
///
/// pub enum Can0 {}
///
/// unsafe impl CanId for Can0 {
///     const ADDRESS: *const () = 0xF008_0000 as *const _;
/// }
/// ```
pub unsafe trait CanId {
    /// Static address of the register block controlling the peripheral
    const ADDRESS: *const ();
}

/// Trait representing CAN peripheral dependencies
///
/// Structs implementing [`Dependencies`] should
/// - enclose all object representable dependencies of [`CanId`] (pins, clock
///   tokens) and release them upon destruction
/// - be constructible only when it is safe and sound to interact with the
///   peripheral, that is after the kernel clock has been gated on and the pins
///   have been claimed
/// - be a singleton for a given [`CanId`]
///
/// # Safety
/// While a [`Dependencies`] instance exists
/// - the CAN kernel clock must not change or be gated off
/// - CAN related pin functions must not change
/// - the register block must not be accessed by other parts of the target HAL
pub unsafe trait Dependencies<Id: CanId> {
    /// Frequency of the CAN kernel clock that the bit timing prescalers
    /// divide.
    fn can_clock(&self) -> fugit::HertzU32;
}

/// Peripheral clock gating service
///
/// Must be used to enable the CAN kernel clock before any register access.
pub trait ClockGate {
    /// Platform specific identifier of a clock consumer
    type Peripheral: Copy;

    /// Ungates the clock feeding `peripheral`.
    fn enable_clock(&mut self, peripheral: Self::Peripheral);

    /// Gates the clock feeding `peripheral`.
    fn disable_clock(&mut self, peripheral: Self::Peripheral);

    /// Current frequency of the clock feeding `peripheral`.
    fn frequency(&self, peripheral: Self::Peripheral) -> fugit::HertzU32;
}

/// Pin multiplexing service
///
/// Claims physical pins for the CAN TX / RX functions.
pub trait PinMux {
    /// Platform specific pin identifier
    type Pin: Copy;
    /// Platform specific alternate function selector
    type Function: Copy;

    /// Routes `function` to `pin`.
    fn configure_pin(&mut self, pin: Self::Pin, function: Self::Function);
}

/// Monotonic time source used to bound every wait of the driver
///
/// The driver never spins on an iteration count; instead it computes a
/// deadline from [`Monotonic::now`] and polls until that deadline passes. A
/// simulated implementation may advance its notion of time on every call,
/// which lets tests fast-forward deterministically.
pub trait Monotonic {
    /// Current time. Consecutive calls must never go backwards.
    fn now(&self) -> Instant;

    /// Deadline `timeout` from now.
    fn deadline(&self, timeout: Duration) -> Instant {
        self.now() + timeout
    }

    /// `true` once `deadline` has passed.
    fn expired(&self, deadline: Instant) -> bool {
        self.now() >= deadline
    }
}

impl<T: Monotonic + ?Sized> Monotonic for &T {
    fn now(&self) -> Instant {
        (**self).now()
    }
}

/// Generic [`Dependencies`] implementation built from the platform clock and
/// pin services
///
/// Construction ungates the kernel clock and then routes the TX and RX pins;
/// [`Attached::release`] gates the clock again and hands the services back.
pub struct Attached<Id, G: ClockGate, P: PinMux> {
    gate: G,
    pins: P,
    peripheral: G::Peripheral,
    _id: PhantomData<Id>,
}

impl<Id: CanId, G: ClockGate, P: PinMux> Attached<Id, G, P> {
    /// Enables the clock of `peripheral` and configures the `tx` and `rx`
    /// pins.
    ///
    /// # Safety
    /// `peripheral` and the pins must belong to the controller identified by
    /// `Id`, and no other [`Dependencies`] instance for `Id` may exist. `gate`
    /// and `pins` must not be used to change the clock or the pin functions
    /// while the returned value exists.
    pub unsafe fn new(
        mut gate: G,
        peripheral: G::Peripheral,
        mut pins: P,
        tx: (P::Pin, P::Function),
        rx: (P::Pin, P::Function),
    ) -> Self {
        gate.enable_clock(peripheral);
        pins.configure_pin(tx.0, tx.1);
        pins.configure_pin(rx.0, rx.1);
        Self {
            gate,
            pins,
            peripheral,
            _id: PhantomData,
        }
    }

    /// Gates the clock off and returns the services
    pub fn release(mut self) -> (G, P) {
        self.gate.disable_clock(self.peripheral);
        (self.gate, self.pins)
    }
}

// Safety: the clock is enabled and the pins are routed for as long as the
// value lives, which the constructor's contract makes exclusive.
unsafe impl<Id: CanId, G: ClockGate, P: PinMux> Dependencies<Id> for Attached<Id, G, P> {
    fn can_clock(&self) -> fugit::HertzU32 {
        self.gate.frequency(self.peripheral)
    }
}
