use super::{structs::{DataSet, DeviceIdentification, MeterIdentity}, MeterError};
use log::debug;

pub const SOH: u8 = 0x01;
pub const STX: u8 = 0x02;
pub const ETX: u8 = 0x03;
pub const ACK: u8 = 0x06;
pub const NAK: u8 = 0x15;

/// Block check character as calculated by Energomera meters: an 8-bit sum of
/// the bytes following the leading SOH/STX up to and including ETX, with the
/// top bit cleared. Plain IEC 1155 would XOR instead.
pub fn calculate_bcc(data: &[u8]) -> u8 {
    let mut bcc: u8 = 0;
    for byte in data {
        bcc = bcc.wrapping_add(*byte);
    }
    bcc & 0x7F
}

/// Builds `SOH <command> STX <data> ETX <BCC>`, or `SOH <command> ETX <BCC>`
/// when there is no data block (break).
pub fn command_frame(command: &str, data: Option<&str>) -> Vec<u8> {
    let mut frame = vec![SOH];
    frame.extend_from_slice(command.as_bytes());
    if let Some(data) = data {
        frame.push(STX);
        frame.extend_from_slice(data.as_bytes());
    }
    frame.push(ETX);
    let bcc = calculate_bcc(&frame[1..]);
    frame.push(bcc);
    return frame;
}

/// Read command for a single parameter, `ADDRESS(additional data)`.
pub fn read_frame(address: &str, additional_data: Option<&str>) -> Vec<u8> {
    let data = format!("{}({})", address, additional_data.unwrap_or(""));
    command_frame("R1", Some(&data))
}

pub fn parse_identification_line(line: &str) -> Result<DeviceIdentification, MeterError> {
    // Example formats:
    // /EKT5CE301v12
    // /EKT5CE303v11
    let line = line.trim_end();

    let content = line.strip_prefix('/')
        .ok_or_else(|| MeterError::Protocol(format!("identification '{line}' misses leading '/'")))?;

    let mut chars = content.chars();
    let manufacturer: String = chars.by_ref().take(3).collect();
    let baud_char = chars.next()
        .ok_or_else(|| MeterError::Protocol(format!("identification '{line}' is too short")))?;
    let identification: String = chars.collect();

    if manufacturer.len() != 3 || baud_rate_from_char(baud_char).is_none() {
        return Err(MeterError::Protocol(format!("identification '{line}' is malformed")));
    }

    debug!("Parsed identification - Manufacturer: {}, baud char: {}, ID: {}",
           manufacturer, baud_char, identification);

    Ok(DeviceIdentification {
        manufacturer,
        baud_char,
        identification,
    })
}

/// Mode C baud rates
pub fn baud_rate_from_char(c: char) -> Option<u32> {
    match c {
        '0' => Some(300),
        '1' => Some(600),
        '2' => Some(1200),
        '3' => Some(2400),
        '4' => Some(4800),
        '5' => Some(9600),
        '6' => Some(19200),
        _ => None,
    }
}

/// Splits the data block of an answer into data sets. Sets are usually one
/// per line, but `A(1)B(2)` on a single line is accepted as well.
pub fn parse_data_sets(block: &str) -> Result<Vec<DataSet>, MeterError> {
    let mut sets = Vec::new();

    for line in block.split(|c: char| c == '\r' || c == '\n') {
        let mut rest = line.trim();
        while !rest.is_empty() {
            let open = rest.find('(')
                .ok_or_else(|| MeterError::Protocol(format!("data set '{rest}' misses '('")))?;
            let close = rest[open..].find(')')
                .map(|pos| pos + open)
                .ok_or_else(|| MeterError::Protocol(format!("data set '{rest}' misses ')'")))?;

            let address = rest[..open].trim();
            let value = &rest[open + 1..close];

            // Meter reports failures as a bare `(ERRnn)`
            if address.is_empty() && value.starts_with("ERR") {
                return Err(MeterError::Protocol(format!("meter responded with {value}")));
            }

            sets.push(DataSet::new(address, value));
            rest = rest[close + 1..].trim_start();
        }
    }

    return Ok(sets);
}

/// Parses the answer to `HELLO`, which is a single data set holding
/// `<type>,<model>,<sw version>,<serial number>,...`.
pub fn parse_meter_identity(reading: &[DataSet]) -> Result<MeterIdentity, MeterError> {
    if reading.len() != 1 {
        return Err(MeterError::Identification(format!(
            "expected exactly one entry in identification response, got {}", reading.len()
        )));
    }

    let fields: Vec<&str> = reading[0].value.split(',').map(|f| f.trim()).collect();
    if fields.len() < 4 {
        return Err(MeterError::Identification(format!(
            "identification '{}' has {} fields, at least 4 expected", reading[0].value, fields.len()
        )));
    }

    let identity = MeterIdentity {
        model: fields[1].to_string(),
        sw_version: fields[2].to_string(),
        serial_number: fields[3].to_string(),
    };

    if identity.model.is_empty() || identity.sw_version.is_empty() || identity.serial_number.is_empty() {
        return Err(MeterError::Identification(format!(
            "identification '{}' has empty fields", reading[0].value
        )));
    }

    return Ok(identity);
}
