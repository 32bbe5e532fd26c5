use std::fmt;
use std::path::{Path, PathBuf};

use crate::transport::Endpoint;

pub const TELNET_PORT: u16 = 23;
pub const DEFAULT_BAUD: u32 = 2_000_000;

/// Known readout boards. Each one fixes the network host, the serial port it
/// shows up on and the calibration tables to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum DeviceProfile {
    Pico3,
    Pico4,
    #[default]
    Pico5,
}

impl DeviceProfile {
    pub fn name(self) -> &'static str {
        match self {
            DeviceProfile::Pico3 => "pico3",
            DeviceProfile::Pico4 => "pico4",
            DeviceProfile::Pico5 => "pico5",
        }
    }

    pub fn host(self) -> &'static str {
        match self {
            DeviceProfile::Pico3 => "picouart03.na.infn.it",
            DeviceProfile::Pico4 => "picouart04.na.infn.it",
            DeviceProfile::Pico5 => "picouart05.na.infn.it",
        }
    }

    pub fn serial_port(self) -> &'static str {
        match self {
            DeviceProfile::Pico3 | DeviceProfile::Pico4 => "COM7",
            DeviceProfile::Pico5 => "COM8",
        }
    }

    pub fn endpoint(self, serial: bool) -> Endpoint {
        if serial {
            Endpoint::Serial {
                path: self.serial_port().to_string(),
                baud: DEFAULT_BAUD,
            }
        } else {
            Endpoint::Tcp {
                host: self.host().to_string(),
                port: TELNET_PORT,
            }
        }
    }

    /// Board whose calibration tables apply. pico3 has none of its own and
    /// runs on the pico5 tables.
    pub fn calibration_source(self) -> DeviceProfile {
        match self {
            DeviceProfile::Pico3 => DeviceProfile::Pico5,
            other => other,
        }
    }

    /// Voltage and current table paths under `dir`.
    pub fn calibration_files(self, dir: &Path) -> (PathBuf, PathBuf) {
        let name = self.calibration_source().name();
        let base = dir.join(name);
        (
            base.join(format!("{name}_Calibration_Voltage.json")),
            base.join(format!("{name}_Calibration_Current.json")),
        )
    }
}

impl fmt::Display for DeviceProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn network_endpoints() {
        assert_eq!(
            DeviceProfile::Pico4.endpoint(false),
            Endpoint::Tcp {
                host: "picouart04.na.infn.it".into(),
                port: 23
            }
        );
        assert_eq!(
            DeviceProfile::Pico5.endpoint(true),
            Endpoint::Serial {
                path: "COM8".into(),
                baud: 2_000_000
            }
        );
        assert_eq!(DeviceProfile::Pico3.serial_port(), "COM7");
    }

    #[test]
    fn pico3_uses_pico5_tables() {
        let (voltage, current) = DeviceProfile::Pico3.calibration_files(Path::new("calibrations"));
        assert_eq!(
            voltage,
            Path::new("calibrations/pico5/pico5_Calibration_Voltage.json")
        );
        assert_eq!(
            current,
            Path::new("calibrations/pico5/pico5_Calibration_Current.json")
        );
        let (voltage, _) = DeviceProfile::Pico4.calibration_files(Path::new("cal"));
        assert_eq!(voltage, Path::new("cal/pico4/pico4_Calibration_Voltage.json"));
    }
}
