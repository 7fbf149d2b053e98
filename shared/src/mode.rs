/*!
Front-end electronics operating modes and CCD side constants.

The mode values are the `ccd_mode_config` register values as reported by the
FPGA. DUMP is not listed here because it is not an FPGA mode; it is a derived
condition (full image mode with digitisation disabled).
*/

use crate::error::SharedError;

/// Operating modes of the front-end electronics FPGA
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FeeMode {
    On = 0,
    FullImagePattern = 1,
    WindowingPattern = 2,
    StandBy = 4,
    FullImage = 5,
    Windowing = 6,
    PerformanceTest = 7,
    ImmediateOn = 8,
}

impl TryFrom<u8> for FeeMode {
    type Error = SharedError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(FeeMode::On),
            1 => Ok(FeeMode::FullImagePattern),
            2 => Ok(FeeMode::WindowingPattern),
            4 => Ok(FeeMode::StandBy),
            5 => Ok(FeeMode::FullImage),
            6 => Ok(FeeMode::Windowing),
            7 => Ok(FeeMode::PerformanceTest),
            8 => Ok(FeeMode::ImmediateOn),
            other => Err(SharedError::new(format!("unknown FEE mode: {other}"))),
        }
    }
}

impl FeeMode {
    /// True when image or pattern data can be expected in this mode
    pub fn produces_data(self) -> bool {
        matches!(
            self,
            FeeMode::FullImagePattern | FeeMode::WindowingPattern | FeeMode::FullImage
        )
    }
}

/// The two readout sides of a CCD
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CcdSide {
    E = 0,
    F = 1,
}

impl From<u8> for CcdSide {
    fn from(value: u8) -> Self {
        if value == 0 {
            CcdSide::E
        } else {
            CcdSide::F
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_values_roundtrip() {
        for value in [0u8, 1, 2, 4, 5, 6, 7, 8] {
            let mode = FeeMode::try_from(value).unwrap();
            assert_eq!(mode as u8, value);
        }
        assert!(FeeMode::try_from(3).is_err());
        assert!(FeeMode::try_from(15).is_err());
    }

    #[test]
    fn test_data_producing_modes() {
        assert!(FeeMode::FullImage.produces_data());
        assert!(FeeMode::FullImagePattern.produces_data());
        assert!(!FeeMode::On.produces_data());
        assert!(!FeeMode::StandBy.produces_data());
    }
}
