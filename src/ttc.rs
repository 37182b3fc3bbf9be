//! Time-triggered communication (TTC)
//!
//! A free running timer, prescaled from the CAN kernel clock, counts the
//! cycle time since the last reference message. Reception (or transmission)
//! of the reference message restarts it. Two comparisons run against the
//! timer:
//! - the trigger time, at which the action selected by [`TriggerType`] is
//!   taken for one transmit slot
//! - the watch trigger time, which flags a missing reference message
//!
//! While TTC is enabled the transmit buffers are addressed slot by slot
//! ([`Ttc::write_slot`]); slot `0` is the PTB, slots `1..=16` are the STB.
//! The regular transmit path is unavailable until TTC is disabled again.

use crate::bus::{ConfigurationError, Error};
use crate::message::{id_to_raw, raw_to_id, TxFrame};
use crate::reg::{CanRegisters, Command, CycleTime, ReferenceMessage, TimeTrigger};
use crate::reg::{TriggerConfig, WatchTrigger};
use crate::tx_buffers::STB_SLOTS;
use embedded_can::Id;

/// Highest transmit slot number, slot `0` is the PTB
pub const MAX_SLOT: u8 = STB_SLOTS as u8;

/// Action taken when the cycle time reaches the trigger time
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TriggerType {
    /// The slot is sent as soon as possible, no time comparison
    #[default]
    Immediate,
    /// Only raises the trigger flag, nothing is sent
    Time,
    /// Exclusive window: the slot is sent once, without retransmission
    SingleShotTransmit,
    /// Opens an arbitrating window: the slot becomes ready
    TransmitStart,
    /// Closes an arbitrating window: an unsent slot is disarmed
    TransmitStop,
}

impl From<TriggerType> for u8 {
    fn from(val: TriggerType) -> Self {
        match val {
            TriggerType::Immediate => 0,
            TriggerType::Time => 1,
            TriggerType::SingleShotTransmit => 2,
            TriggerType::TransmitStart => 3,
            TriggerType::TransmitStop => 4,
        }
    }
}

impl TryFrom<u8> for TriggerType {
    type Error = TtcError;

    fn try_from(ttype: u8) -> Result<Self, Self::Error> {
        Ok(match ttype {
            0 => Self::Immediate,
            1 => Self::Time,
            2 => Self::SingleShotTransmit,
            3 => Self::TransmitStart,
            4 => Self::TransmitStop,
            _ => Err(TtcError::TriggerType)?,
        })
    }
}

/// Misconfigurations of [`TtcConfig`] and TTC requests
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TtcError {
    /// Timer prescaler is not one of 1, 2, 4 or 8
    Prescaler,
    /// Transmit slot above [`MAX_SLOT`]
    TransmitSlot,
    /// Transmit enable window outside of `1..=16`
    TransmitEnableWindow,
    /// Unknown trigger type encoding
    TriggerType,
    /// The request needs TTC to be enabled
    Disabled,
}

/// TTC setup
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct TtcConfig {
    /// Identifier (and format) of the reference message
    pub reference: Id,
    /// Divider from the CAN kernel clock to the cycle timer: 1, 2, 4 or 8
    pub timer_prescaler: u8,
    /// Slot the trigger acts on
    pub transmit_slot: u8,
    /// Action taken at the trigger time
    pub trigger_type: TriggerType,
    /// Number of timer ticks, `1..=16`, during which a single shot
    /// transmission may start
    pub transmit_enable_window: u8,
    /// Cycle time at which the trigger fires
    pub trigger_time: u16,
    /// Cycle time after which a missing reference message is flagged
    pub watch_trigger_time: u16,
}

#[cfg(feature = "defmt")]
impl defmt::Format for TtcConfig {
    fn format(&self, f: defmt::Formatter<'_>) {
        defmt::write!(
            f,
            "TtcConfig(reference: {}, prescaler: {=u8}, slot: {=u8}, trigger: {}, window: {=u8}, trigger_time: {=u16}, watch_trigger_time: {=u16})",
            crate::message::FormatId(self.reference),
            self.timer_prescaler,
            self.transmit_slot,
            self.trigger_type,
            self.transmit_enable_window,
            self.trigger_time,
            self.watch_trigger_time,
        )
    }
}

impl TtcConfig {
    /// Create an instance
    ///
    /// The reference message must be provided, all other settings come
    /// pre-populated with default values.
    pub fn new(reference: impl Into<Id>) -> Self {
        Self {
            reference: reference.into(),
            timer_prescaler: 1,
            transmit_slot: 0,
            trigger_type: TriggerType::Time,
            transmit_enable_window: 1,
            trigger_time: 0,
            watch_trigger_time: u16::MAX,
        }
    }

    fn check(&self) -> Result<u8, TtcError> {
        let presc = prescaler_bits(self.timer_prescaler)?;
        check_slot(self.transmit_slot)?;
        if !(1..=16).contains(&self.transmit_enable_window) {
            return Err(TtcError::TransmitEnableWindow);
        }
        Ok(presc)
    }
}

fn prescaler_bits(prescaler: u8) -> Result<u8, TtcError> {
    match prescaler {
        1 => Ok(0),
        2 => Ok(1),
        4 => Ok(2),
        8 => Ok(3),
        _ => Err(TtcError::Prescaler),
    }
}

fn check_slot(slot: u8) -> Result<(), TtcError> {
    if slot > MAX_SLOT {
        Err(TtcError::TransmitSlot)
    } else {
        Ok(())
    }
}

/// Time-triggered communication unit
pub struct Ttc<'a, R> {
    regs: &'a mut R,
    fd_enabled: bool,
}

impl<'a, R: CanRegisters> Ttc<'a, R> {
    pub(crate) fn new(regs: &'a mut R, fd_enabled: bool) -> Self {
        Self { regs, fd_enabled }
    }

    /// Programs reference message, timer prescaler, watch trigger and the
    /// trigger. The configuration is validated before the first register
    /// write. If TTC is enabled the trigger is armed right away, otherwise
    /// when TTC gets enabled.
    pub fn configure(&mut self, config: &TtcConfig) -> Result<(), ConfigurationError> {
        let presc = config.check()?;

        let mut reference = ReferenceMessage::default();
        reference.set_ref_id(id_to_raw(config.reference));
        reference.set_ref_ide(matches!(config.reference, Id::Extended(_)));
        self.regs.write_reg(reference);

        self.regs
            .modify_reg::<TimeTrigger, _>(|w| w.set_t_presc(presc));

        let mut watch = WatchTrigger::default();
        watch.set_wt_trig(config.watch_trigger_time);
        self.regs.write_reg(watch);

        let mut trigger = TriggerConfig::default();
        trigger.set_ttptr(config.transmit_slot);
        trigger.set_ttype(config.trigger_type.into());
        trigger.set_tew(config.transmit_enable_window - 1);
        trigger.set_tt_trig(config.trigger_time);
        self.regs.write_reg(trigger);
        Ok(())
    }

    /// Reads back the configuration
    pub fn config(&self) -> Result<TtcConfig, TtcError> {
        let reference: ReferenceMessage = self.regs.read_reg();
        let time: TimeTrigger = self.regs.read_reg();
        let trigger: TriggerConfig = self.regs.read_reg();
        let watch: WatchTrigger = self.regs.read_reg();
        Ok(TtcConfig {
            reference: raw_to_id(reference.ref_id(), reference.ref_ide()),
            timer_prescaler: 1 << time.t_presc(),
            transmit_slot: trigger.ttptr(),
            trigger_type: trigger.ttype().try_into()?,
            transmit_enable_window: trigger.tew() + 1,
            trigger_time: trigger.tt_trig(),
            watch_trigger_time: watch.wt_trig(),
        })
    }

    /// Enables or disables TTC. Enabling restarts the cycle timer and
    /// switches the transmit buffers to slot addressing; disabling returns
    /// them to the regular PTB/STB interface.
    pub fn enable(&mut self, enabled: bool) {
        self.regs.modify_reg::<Command, _>(|w| w.set_tttbm(enabled));
        self.regs.modify_reg::<TimeTrigger, _>(|w| w.set_tten(enabled));
        #[cfg(feature = "defmt")]
        defmt::debug!("TTC enabled: {}", enabled);
    }

    /// `true` if TTC is enabled
    pub fn is_enabled(&self) -> bool {
        self.regs.read_reg::<TimeTrigger>().tten()
    }

    /// Re-arms the trigger for `slot` at cycle time `time`. A time behind
    /// the current cycle time raises the trigger error flag instead.
    pub fn set_trigger(
        &mut self,
        trigger_type: TriggerType,
        slot: u8,
        time: u16,
    ) -> Result<(), ConfigurationError> {
        check_slot(slot)?;
        self.regs.modify_reg::<TriggerConfig, _>(|w| {
            w.set_ttptr(slot);
            w.set_ttype(trigger_type.into());
            w.set_tt_trig(time);
        });
        Ok(())
    }

    /// Cycle time since the last reference message
    pub fn timer(&self) -> u16 {
        self.regs.read_reg::<CycleTime>().cycle_time()
    }

    fn address(&mut self, slot: u8) {
        self.regs.modify_reg::<TimeTrigger, _>(|w| w.set_tbptr(slot));
    }

    /// `true` if `slot` holds a frame
    pub fn is_slot_filled(&mut self, slot: u8) -> Result<bool, ConfigurationError> {
        check_slot(slot)?;
        self.address(slot);
        Ok(self.regs.read_reg::<TimeTrigger>().tbf())
    }

    /// Copies `frame` into `slot` and marks it filled. Nothing is sent until
    /// a trigger selects the slot.
    pub fn write_slot(&mut self, slot: u8, frame: &TxFrame) -> Result<(), Error> {
        if !self.is_enabled() {
            return Err(ConfigurationError::from(TtcError::Disabled).into());
        }
        if frame.fd_format() && !self.fd_enabled {
            return Err(ConfigurationError::FdDisabled.into());
        }
        if self.is_slot_filled(slot)? {
            return Err(Error::BufferFull);
        }
        frame.0.write_to(&mut *self.regs);
        self.regs.modify_reg::<TimeTrigger, _>(|w| w.set_tbf(true));
        Ok(())
    }

    /// Marks `slot` empty unless it is being transmitted
    pub fn clear_slot(&mut self, slot: u8) -> Result<(), ConfigurationError> {
        check_slot(slot)?;
        self.address(slot);
        self.regs.modify_reg::<TimeTrigger, _>(|w| w.set_tbe(true));
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use embedded_can::StandardId;

    #[test]
    fn prescaler_must_be_power_of_two() {
        assert_eq!(prescaler_bits(1), Ok(0));
        assert_eq!(prescaler_bits(8), Ok(3));
        for invalid in [0, 3, 5, 16] {
            assert_eq!(prescaler_bits(invalid), Err(TtcError::Prescaler));
        }
    }

    #[test]
    fn config_checks() {
        let config = TtcConfig::new(StandardId::MAX);
        assert_eq!(config.check(), Ok(0));
        let slot = TtcConfig {
            transmit_slot: MAX_SLOT + 1,
            ..config
        };
        assert_eq!(slot.check(), Err(TtcError::TransmitSlot));
        let window = TtcConfig {
            transmit_enable_window: 0,
            ..config
        };
        assert_eq!(window.check(), Err(TtcError::TransmitEnableWindow));
    }

    #[test]
    fn trigger_type_encoding() {
        for ttype in [
            TriggerType::Immediate,
            TriggerType::Time,
            TriggerType::SingleShotTransmit,
            TriggerType::TransmitStart,
            TriggerType::TransmitStop,
        ] {
            assert_eq!(TriggerType::try_from(u8::from(ttype)), Ok(ttype));
        }
        assert_eq!(TriggerType::try_from(5), Err(TtcError::TriggerType));
    }
}
