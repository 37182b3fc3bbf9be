//! Acceptance filters
//!
//! The controller has a bank of [`FILTER_COUNT`] code/mask filters. A frame
//! enters the receive buffer if at least one enabled filter matches it; with
//! no filter enabled every frame is rejected. After reset filter 0 is enabled
//! and accepts everything.
//!
//! Filters are written in two phases. [`Filters::configure`] writes code, mask
//! and mask type of the selected filters and leaves them disabled;
//! [`Filters::enable`] activates them. The controller therefore never matches
//! against a half written filter.

use crate::bus::ConfigurationError;
use crate::message::id_to_raw;
use crate::reg::{Acceptance, CanRegisters, Command, FilterControl};
use embedded_can::{ExtendedId, Id, StandardId};

/// Number of filters in the bank
pub const FILTER_COUNT: usize = 16;

const ID_BITS: u32 = 0x1FFF_FFFF;
const STANDARD_ID_BITS: u32 = 0x7FF;

/// Frame formats a filter applies to
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum MaskType {
    /// Only frames with an 11-bit identifier
    StandardOnly,
    /// Only frames with a 29-bit identifier
    ExtendedOnly,
    /// Both formats
    #[default]
    Both,
}

/// Code/mask filter
///
/// Identifier bits set in `mask` are "don't care"; the remaining bits have to
/// equal the corresponding bits of `id`. For standard frames only the low 11
/// bits take part in the comparison.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct AcceptanceFilter {
    /// Acceptance code, right aligned
    pub id: u32,
    /// Don't care bits, right aligned
    pub mask: u32,
    /// Frame formats the filter applies to
    pub mask_type: MaskType,
}

impl AcceptanceFilter {
    /// Matches every frame
    pub const fn accept_all() -> Self {
        Self {
            id: 0,
            mask: ID_BITS,
            mask_type: MaskType::Both,
        }
    }

    /// Matches exactly `id`, in its own format
    pub fn exact(id: impl Into<Id>) -> Self {
        let id = id.into();
        Self {
            id: id_to_raw(id),
            mask: 0,
            mask_type: match id {
                Id::Standard(_) => MaskType::StandardOnly,
                Id::Extended(_) => MaskType::ExtendedOnly,
            },
        }
    }

    /// Matches standard frames whose identifier equals `id` in every bit not
    /// set in `mask`
    pub fn standard(id: StandardId, mask: u16) -> Self {
        Self {
            id: id.as_raw().into(),
            mask: u32::from(mask) & STANDARD_ID_BITS,
            mask_type: MaskType::StandardOnly,
        }
    }

    /// Matches extended frames whose identifier equals `id` in every bit not
    /// set in `mask`
    pub fn extended(id: ExtendedId, mask: u32) -> Self {
        Self {
            id: id.as_raw(),
            mask: mask & ID_BITS,
            mask_type: MaskType::ExtendedOnly,
        }
    }

    /// `true` if a frame with identifier `id` passes this filter
    pub fn matches(&self, id: Id) -> bool {
        let (width, format_ok) = match id {
            Id::Standard(_) => (STANDARD_ID_BITS, self.mask_type != MaskType::ExtendedOnly),
            Id::Extended(_) => (ID_BITS, self.mask_type != MaskType::StandardOnly),
        };
        format_ok && (id_to_raw(id) ^ self.id) & !self.mask & width == 0
    }

    fn check(&self) -> Result<(), ConfigurationError> {
        if self.id & !ID_BITS != 0 || self.mask & !ID_BITS != 0 {
            Err(ConfigurationError::FilterId)
        } else {
            Ok(())
        }
    }

    pub(crate) fn code_word(&self) -> Acceptance {
        let mut w = Acceptance::default();
        w.set_code_or_mask(self.id);
        w
    }

    pub(crate) fn mask_word(&self) -> Acceptance {
        let mut w = Acceptance::default();
        w.set_code_or_mask(self.mask);
        match self.mask_type {
            MaskType::Both => w.set_aidee(false),
            MaskType::StandardOnly => {
                w.set_aidee(true);
                w.set_aide(false);
            }
            MaskType::ExtendedOnly => {
                w.set_aidee(true);
                w.set_aide(true);
            }
        }
        w
    }

    pub(crate) fn from_words(code: Acceptance, mask: Acceptance) -> Self {
        Self {
            id: code.code_or_mask(),
            mask: mask.code_or_mask(),
            mask_type: match (mask.aidee(), mask.aide()) {
                (false, _) => MaskType::Both,
                (true, false) => MaskType::StandardOnly,
                (true, true) => MaskType::ExtendedOnly,
            },
        }
    }
}

impl Default for AcceptanceFilter {
    fn default() -> Self {
        Self::accept_all()
    }
}

impl From<Id> for AcceptanceFilter {
    fn from(id: Id) -> Self {
        Self::exact(id)
    }
}

/// A set of filter indices. Indices above 15 are carried along but rejected
/// by [`Filters::configure`] and ignored by [`Filters::enable`].
#[derive(Copy, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct FilterSet(pub u32);

const VALID_FILTERS: u32 = (1 << FILTER_COUNT) - 1;

impl FromIterator<usize> for FilterSet {
    fn from_iter<T: IntoIterator<Item = usize>>(iter: T) -> Self {
        let mut set = 0_u32;
        for i in iter.into_iter() {
            set |= u32::try_from(i)
                .ok()
                .and_then(|i| 1_u32.checked_shl(i))
                .unwrap_or(1 << 31);
        }
        FilterSet(set)
    }
}

impl FilterSet {
    /// Returns the set of all filters
    pub fn all() -> Self {
        Self(VALID_FILTERS)
    }

    /// Number of filters in the set
    pub fn len(&self) -> usize {
        self.0.count_ones() as usize
    }

    /// `true` if no filter is selected
    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// `true` if filter `index` is selected
    pub fn contains(&self, index: usize) -> bool {
        index < 32 && self.0 & (1 << index) != 0
    }

    /// An iterator visiting the selected indices in ascending order.
    pub fn iter(&self) -> Iter {
        Iter {
            flags: *self,
            index: 0,
        }
    }
}

impl core::fmt::Debug for FilterSet {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

/// An iterator over the indices in a [`FilterSet`].
///
/// This `struct` is created by [`FilterSet::iter`].
pub struct Iter {
    flags: FilterSet,
    index: u8,
}

impl Iterator for Iter {
    type Item = usize;

    fn next(&mut self) -> Option<Self::Item> {
        while self.index < 32 {
            let i = self.index;
            self.index += 1;
            if self.flags.0 & (1 << i) != 0 {
                return Some(i as usize);
            }
        }
        None
    }
}

/// Access to the filter bank
pub struct Filters<'a, R> {
    regs: &'a mut R,
}

impl<'a, R: CanRegisters> Filters<'a, R> {
    pub(crate) fn new(regs: &'a mut R) -> Self {
        Self { regs }
    }

    /// Writes `filters` into the `selection`, lowest index first. The
    /// selected filters are disabled and stay disabled until passed to
    /// [`Self::enable`].
    ///
    /// The controller has to be held in reset. Every filter is validated
    /// before the first register is written.
    pub fn configure(
        &mut self,
        selection: FilterSet,
        filters: &[AcceptanceFilter],
    ) -> Result<(), ConfigurationError> {
        if !self.regs.read_reg::<Command>().reset() {
            return Err(ConfigurationError::NotInReset);
        }
        if selection.0 & !VALID_FILTERS != 0 {
            return Err(ConfigurationError::FilterIndex);
        }
        if selection.len() != filters.len() {
            return Err(ConfigurationError::FilterCountMismatch);
        }
        filters.iter().try_for_each(AcceptanceFilter::check)?;

        self.enable(selection, false);
        for (index, filter) in selection.iter().zip(filters) {
            self.write(index, filter);
        }
        Ok(())
    }

    fn select(&mut self, index: usize, mask: bool) {
        self.regs.modify_reg::<FilterControl, _>(|w| {
            w.set_acfadr(index as u8);
            w.set_selmask(mask);
        });
    }

    fn write(&mut self, index: usize, filter: &AcceptanceFilter) {
        self.select(index, false);
        self.regs.write_reg(filter.code_word());
        self.select(index, true);
        self.regs.write_reg(filter.mask_word());
    }

    /// Reads back filter `index`
    pub fn read(&mut self, index: usize) -> Option<AcceptanceFilter> {
        if index >= FILTER_COUNT {
            return None;
        }
        self.select(index, false);
        let code = self.regs.read_reg();
        self.select(index, true);
        let mask = self.regs.read_reg();
        Some(AcceptanceFilter::from_words(code, mask))
    }

    /// Enables or disables the `selection`; filters outside of it keep their
    /// state. Works in any controller state.
    pub fn enable(&mut self, selection: FilterSet, enabled: bool) {
        let selection = (selection.0 & VALID_FILTERS) as u16;
        self.regs.modify_reg::<FilterControl, _>(|w| {
            let current = w.acf_en();
            w.set_acf_en(if enabled {
                current | selection
            } else {
                current & !selection
            });
        });
    }

    /// Set of enabled filters
    pub fn enabled(&self) -> FilterSet {
        FilterSet(self.regs.read_reg::<FilterControl>().acf_en().into())
    }
}
