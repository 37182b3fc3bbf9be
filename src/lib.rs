#![cfg_attr(not(test), no_std)]
#![warn(missing_docs)]
//! # CAN-CTRL
//!
//! ## Overview
//! This crate provides a platform-agnostic driver for the CAN-CTRL
//! controller IP.
//!
//! It provides the following features:
//!
//! - classical CAN and CAN FD with bitrate switching support
//! - a Primary Transmit Buffer and a 16 slot Secondary Transmit Buffer,
//!   emptied in FIFO or identifier priority order
//! - an 8 slot receive FIFO with configurable overflow handling
//! - 16 code/mask acceptance filters
//! - error counter and fault confinement observation
//! - time-triggered communication (TTC): reference message synchronisation,
//!   transmit triggers and a watch trigger
//! - a flat view of the status and interrupt flags
//!
//! The controller is reached through the [`CanRegisters`] interface. On a
//! target, [`reg::Mmio`] accesses the memory mapped register block of the
//! peripheral identified by a [`CanId`]. On a host, the `sim` feature
//! provides a software model of the controller.
//!
//! In order to use the controller, one has to instantiate
//! [`CanConfigurable`] and [`finalize`] it (or use [`Can::init`]). Its
//! constructor requires an instance of a [`Dependencies`] implementing struct
//! and holds onto it until the bus is [`deinit`]ialized. Safety requirements
//! of the `Dependencies` trait guarantee a correct state of the clock and
//! the pins during operation. Every wait of the driver is bounded by a
//! deadline on the injected [`Monotonic`] clock.
//!
//! The driver does no internal locking. If it is used from interrupt and
//! main-line context, the caller provides mutual exclusion.
//!
//! ## General usage example
//!
//! ```no_run
//! use canctrl::bus::{Can, Error};
//! use canctrl::config::{BitTiming, CanConfig, StbMode};
//! use canctrl::core::{CanId, Dependencies, Duration, Monotonic};
//! use canctrl::embedded_can::{Frame, StandardId};
//! use canctrl::filter::{AcceptanceFilter, FilterSet};
//! use canctrl::message::TxFrame;
//! use canctrl::reg::CanRegisters;
//! use canctrl::status::StatusFlag;
//! use canctrl::tx_buffers::{BufferType, StbPolicy};
//!
//! fn run<Id, D, R, C>(dependencies: D, regs: R, clock: C) -> Result<(), Error>
//! where
//!     Id: CanId,
//!     D: Dependencies<Id>,
//!     R: CanRegisters,
//!     C: Monotonic,
//! {
//!     // 500 kbit/s with a 40 MHz kernel clock
//!     let mut config = CanConfig::new(BitTiming::new(16, 4, 1, 4));
//!     config.tx.stb_mode = StbMode::Priority;
//!     let mut can = Can::<Id, _, _, _>::init(dependencies, regs, clock, config)?;
//!
//!     // Only accept standard frames 0x100..=0x10F
//!     let filter = AcceptanceFilter::standard(StandardId::new(0x100).unwrap(), 0x00F);
//!     let selection: FilterSet = [1].into_iter().collect();
//!     can.configure_filters(selection, &[filter])?;
//!     can.enable_filters(selection, true);
//!     can.enable_filters([0].into_iter().collect(), false);
//!
//!     can.int_cmd(StatusFlag::RxComplete.into(), true);
//!
//!     let frame = TxFrame::new_classic(StandardId::new(0x123).unwrap(), &[1, 2, 3])?;
//!     can.transmit(&frame, BufferType::Primary, StbPolicy::All, Duration::millis(10))?;
//!
//!     for frame in can.receive(8) {
//!         let _ = (frame.id(), frame.data());
//!     }
//!     Ok(())
//! }
//! ```
//!
//! [`CanRegisters`]: crate::reg::CanRegisters
//! [`CanId`]: canctrl_core::CanId
//! [`CanConfigurable`]: crate::bus::CanConfigurable
//! [`finalize`]: crate::bus::CanConfigurable::finalize
//! [`Can::init`]: crate::bus::Can::init
//! [`deinit`]: crate::bus::Can::deinit
//! [`Dependencies`]: canctrl_core::Dependencies
//! [`Monotonic`]: canctrl_core::Monotonic

pub mod bus;
pub mod config;
pub mod error;
pub mod filter;
pub mod message;
pub mod prelude;
pub mod reg;
pub mod rx_fifo;
#[cfg(any(test, feature = "sim"))]
pub mod sim;
pub mod status;
pub mod ttc;
pub mod tx_buffers;

#[cfg(test)]
mod tests;

pub use canctrl_core as core;
pub use embedded_can;
pub use fugit;
