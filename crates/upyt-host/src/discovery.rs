//! Locating boards by USB serial number.

use serialport::SerialPortType;

use crate::error::LinkError;

/// A USB serial port as reported by the OS.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortInfo {
    /// OS port name.
    pub port_name: String,
    /// USB serial number, when the device reports one.
    pub serial_number: Option<String>,
    /// USB manufacturer string.
    pub manufacturer: Option<String>,
    /// USB product string.
    pub product: Option<String>,
}

/// All USB serial ports currently attached.
pub fn usb_ports() -> Result<Vec<PortInfo>, LinkError> {
    let ports = serialport::available_ports()?;
    Ok(ports
        .into_iter()
        .filter_map(|port| match port.port_type {
            SerialPortType::UsbPort(usb) => Some(PortInfo {
                port_name: port.port_name,
                serial_number: usb.serial_number,
                manufacturer: usb.manufacturer,
                product: usb.product,
            }),
            _ => None,
        })
        .collect())
}

/// Serial numbers of all attached USB serial devices, sorted and unique.
pub fn connected_serial_numbers() -> Result<Vec<String>, LinkError> {
    Ok(serial_numbers(&usb_ports()?))
}

/// Port name of the attached device with this serial number.
pub fn find_port(serial: &str) -> Result<String, LinkError> {
    select_port(&usb_ports()?, serial)
}

fn serial_numbers(ports: &[PortInfo]) -> Vec<String> {
    let mut serials: Vec<String> = ports
        .iter()
        .filter_map(|p| p.serial_number.clone())
        .collect();
    serials.sort();
    serials.dedup();
    serials
}

fn select_port(ports: &[PortInfo], serial: &str) -> Result<String, LinkError> {
    let matches: Vec<&PortInfo> = ports
        .iter()
        .filter(|p| p.serial_number.as_deref() == Some(serial))
        .collect();
    match matches.as_slice() {
        [] => Err(LinkError::NotFound(serial.to_string())),
        [port] => Ok(port.port_name.clone()),
        many => Err(LinkError::Ambiguous {
            serial: serial.to_string(),
            ports: many.iter().map(|p| p.port_name.clone()).collect(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn port(name: &str, serial: Option<&str>) -> PortInfo {
        PortInfo {
            port_name: name.to_string(),
            serial_number: serial.map(str::to_string),
            manufacturer: None,
            product: None,
        }
    }

    #[test]
    fn test_select_port() {
        let ports = vec![
            port("/dev/ttyACM0", Some("AAA")),
            port("/dev/ttyACM1", Some("BBB")),
            port("/dev/ttyUSB0", None),
        ];
        assert_eq!(select_port(&ports, "BBB").unwrap(), "/dev/ttyACM1");
        assert!(matches!(select_port(&ports, "CCC"), Err(LinkError::NotFound(_))));
    }

    #[test]
    fn test_ambiguous_serial() {
        let ports = vec![port("COM3", Some("AAA")), port("COM4", Some("AAA"))];
        match select_port(&ports, "AAA") {
            Err(LinkError::Ambiguous { ports, .. }) => assert_eq!(ports, vec!["COM3", "COM4"]),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_serial_numbers_sorted_unique() {
        let ports = vec![
            port("a", Some("ZZZ")),
            port("b", Some("AAA")),
            port("c", None),
            port("d", Some("AAA")),
        ];
        assert_eq!(serial_numbers(&ports), vec!["AAA", "ZZZ"]);
    }
}
