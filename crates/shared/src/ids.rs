/// Largest valid OMEMO device id (31 bits, top bit cleared).
pub const MAX_DEVICE_ID: u32 = 0x7FFF_FFFF;

/// Identifier of one OMEMO-capable installation of an account.
///
/// Device ids are announced in the account's device list and are unique per
/// installation. Valid ids are in `1..=MAX_DEVICE_ID`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[serde(try_from = "u32", into = "u32")]
pub struct DeviceId(u32);

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("invalid device id: {0}")]
pub struct InvalidDeviceId(pub u32);

impl DeviceId {
    /// Wrap a raw id, rejecting zero and ids with the top bit set.
    pub fn new(id: u32) -> Result<Self, InvalidDeviceId> {
        if id == 0 || id > MAX_DEVICE_ID {
            return Err(InvalidDeviceId(id));
        }
        Ok(Self(id))
    }

    pub fn get(self) -> u32 {
        self.0
    }
}

impl TryFrom<u32> for DeviceId {
    type Error = InvalidDeviceId;

    fn try_from(id: u32) -> Result<Self, Self::Error> {
        Self::new(id)
    }
}

impl From<DeviceId> for u32 {
    fn from(id: DeviceId) -> Self {
        id.0
    }
}

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for DeviceId {
    type Err = InvalidDeviceId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw: u32 = s.trim().parse().map_err(|_| InvalidDeviceId(0))?;
        Self::new(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn new_rejects_zero_and_high_bit() {
        assert!(DeviceId::new(0).is_err());
        assert!(DeviceId::new(0x8000_0000).is_err());
        assert!(DeviceId::new(u32::MAX).is_err());
        assert_eq!(DeviceId::new(MAX_DEVICE_ID).unwrap().get(), MAX_DEVICE_ID);
    }

    #[test]
    fn device_id_serializes_as_plain_integer() {
        let id = DeviceId::new(111).unwrap();
        assert_eq!(serde_json::to_string(&id).unwrap(), "111");
        let back: DeviceId = serde_json::from_str("111").unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn device_id_deserialize_rejects_out_of_range() {
        let result = serde_json::from_str::<DeviceId>("0");
        assert!(result.is_err());
        let result = serde_json::from_str::<DeviceId>("4294967295");
        assert!(result.is_err());
    }

    #[test]
    fn device_id_from_str() {
        assert_eq!(DeviceId::from_str("222").unwrap().get(), 222);
        assert!(DeviceId::from_str("abc").is_err());
        assert!(DeviceId::from_str("-1").is_err());
    }

    #[test]
    fn device_id_display_is_decimal() {
        assert_eq!(DeviceId::new(42).unwrap().to_string(), "42");
    }
}
