//! Bluetooth SIG-assigned company identifiers.
//!
//! Used in `LL_VERSION_IND` (to name the implementer of the Link Layer) and in manufacturer
//! specific advertising data. Only a newtype over the raw 16-bit value is provided; the full
//! assigned-numbers table changes too often to vendor in, so callers that need a human-readable
//! name look it up externally.

/// A company identifier as assigned by the Bluetooth SIG.
///
/// <https://www.bluetooth.com/specifications/assigned-numbers/company-identifiers>
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct CompanyId(u16);

impl CompanyId {
    /// The identifier reserved for internal use, testing and example code not affiliated with a
    /// registered company.
    pub const INTERNAL: Self = CompanyId(0xFFFF);

    /// Creates a `CompanyId` from its raw 16-bit value.
    pub const fn from_u16(raw: u16) -> Self {
        CompanyId(raw)
    }

    /// Returns the raw 16-bit value of this identifier.
    pub fn as_u16(&self) -> u16 {
        self.0
    }
}

impl From<u16> for CompanyId {
    fn from(raw: u16) -> Self {
        CompanyId(raw)
    }
}
