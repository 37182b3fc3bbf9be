//! Bus error tracking
//!
//! Error counters and fault captures are maintained by the controller; the
//! driver only observes them. Bus faults are never reported as `Err` values,
//! callers poll [`ErrorState`] (or the status flags) and react, for example by
//! reinitializing after bus off.

use crate::bus::ConfigurationError;
use crate::reg::{CanRegisters, Command, ErrorCapture, Interrupts};
use core::fmt::{self, Debug};

/// Largest valid `EWL` value
pub(crate) const MAX_ERROR_WARNING_LIMIT: u8 = 15;

/// Counter value at which a node becomes error passive
pub const ERROR_PASSIVE_THRESHOLD: u8 = 128;

/// Kind of the last detected bus error
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ErrorType {
    /// No error
    #[default]
    None,
    /// Monitored bit differs from the transmitted one
    Bit,
    /// Fixed-form field contains an illegal bit
    Form,
    /// Six consecutive equal bits
    Stuff,
    /// Transmitted frame was not acknowledged
    Ack,
    /// CRC mismatch
    Crc,
    /// Any other error
    Other,
}

impl From<u8> for ErrorType {
    fn from(koer: u8) -> Self {
        match koer {
            0 => Self::None,
            1 => Self::Bit,
            2 => Self::Form,
            3 => Self::Stuff,
            4 => Self::Ack,
            5 => Self::Crc,
            _ => Self::Other,
        }
    }
}

impl From<ErrorType> for u8 {
    fn from(val: ErrorType) -> Self {
        match val {
            ErrorType::None => 0,
            ErrorType::Bit => 1,
            ErrorType::Form => 2,
            ErrorType::Stuff => 3,
            ErrorType::Ack => 4,
            ErrorType::Crc => 5,
            ErrorType::Other => 6,
        }
    }
}

/// Fault confinement state of the node
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum NodeState {
    /// Both counters below 128
    ErrorActive,
    /// A counter reached 128; the node sends passive error flags
    ErrorPassive,
    /// Transmit counter exceeded 255; the node does not take part in bus
    /// traffic until the controller recovers
    BusOff,
}

/// Snapshot of the error related state of the controller
#[derive(Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ErrorState {
    /// Receive error counter
    pub rx_error_count: u8,
    /// Transmit error counter
    pub tx_error_count: u8,
    /// Node is bus off
    pub bus_off: bool,
    /// Node is error passive
    pub error_passive: bool,
    /// A counter reached the configured warning limit
    pub error_warning: bool,
    /// Kind of the last bus error
    pub last_error_type: ErrorType,
    /// Bit position at which arbitration was last lost
    pub arbitration_lost_position: u8,
}

impl ErrorState {
    pub(crate) fn read<R: CanRegisters>(regs: &R) -> Self {
        let capture: ErrorCapture = regs.read_reg();
        let interrupts: Interrupts = regs.read_reg();
        let command: Command = regs.read_reg();
        Self {
            rx_error_count: capture.recnt(),
            tx_error_count: capture.tecnt(),
            bus_off: command.busoff(),
            error_passive: interrupts.epass(),
            error_warning: interrupts.ewarn(),
            last_error_type: capture.koer().into(),
            arbitration_lost_position: capture.alc(),
        }
    }

    /// Fault confinement state derived from the flags
    pub fn node_state(&self) -> NodeState {
        if self.bus_off {
            NodeState::BusOff
        } else if self.error_passive {
            NodeState::ErrorPassive
        } else {
            NodeState::ErrorActive
        }
    }
}

impl Debug for ErrorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErrorState")
            .field("rec", &self.rx_error_count)
            .field("tec", &self.tx_error_count)
            .field("busoff", &self.bus_off)
            .field("epass", &self.error_passive)
            .field("ewarn", &self.error_warning)
            .field("koer", &self.last_error_type)
            .field("alc", &self.arbitration_lost_position)
            .finish()
    }
}

/// Number of errors at which the warning flag is raised for `ewl`
pub fn error_warning_threshold(ewl: u8) -> u16 {
    (u16::from(ewl) + 1) * 8
}

pub(crate) fn check_error_warning_limit(ewl: u8) -> Result<(), ConfigurationError> {
    if ewl > MAX_ERROR_WARNING_LIMIT {
        Err(ConfigurationError::InvalidErrorWarningLimit)
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn koer_decoding() {
        assert_eq!(ErrorType::from(0), ErrorType::None);
        assert_eq!(ErrorType::from(4), ErrorType::Ack);
        assert_eq!(ErrorType::from(7), ErrorType::Other);
        for kind in [ErrorType::Bit, ErrorType::Crc, ErrorType::Form] {
            assert_eq!(ErrorType::from(u8::from(kind)), kind);
        }
    }

    #[test]
    fn warning_limit_range() {
        assert!(check_error_warning_limit(15).is_ok());
        assert!(check_error_warning_limit(16).is_err());
        assert_eq!(error_warning_threshold(0), 8);
        assert_eq!(error_warning_threshold(11), 96);
        assert_eq!(error_warning_threshold(15), 128);
    }

    #[test]
    fn bus_off_wins_over_error_passive() {
        let state = ErrorState {
            rx_error_count: 0,
            tx_error_count: 255,
            bus_off: true,
            error_passive: true,
            error_warning: true,
            last_error_type: ErrorType::Bit,
            arbitration_lost_position: 0,
        };
        assert_eq!(state.node_state(), NodeState::BusOff);
    }
}
