//! Traits needed to call the methods of the driver types
pub use crate::reg::CanRegisters as _;
pub use canctrl_core::Monotonic as _;
pub use embedded_can::Frame as _;
