//! Module containing types and traits representing [`Can`] type states
//!
//! [`Can`]: super::Can

mod private {
    /// Super trait used to mark traits with an exhaustive set of
    /// implementations
    pub trait Sealed {}
}
use private::Sealed;

/// Production state
///
/// The controller takes part in regular bus traffic. Error counters can only
/// be observed.
pub enum Production {}

/// Test state
///
/// The controller runs in one of the loopback setups. Bus off can be forced
/// and the error counters can be cleared.
pub enum Test {}

/// Operating state of a [`Can`](super::Can), known in compile-time.
pub trait OperatingMode: Sealed {}

impl Sealed for Production {}
impl Sealed for Test {}

impl OperatingMode for Production {}
impl OperatingMode for Test {}
