/// Identification line sent by the meter right after the sign-on request,
/// e.g. `/EKT5CE301v12`.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceIdentification {
    pub manufacturer: String,
    /// Mode C baud rate character announced by the meter
    pub baud_char: char,
    pub identification: String,
}

/// One `ADDRESS(value)` entry of a meter answer.
#[derive(Debug, Clone, PartialEq)]
pub struct DataSet {
    pub address: String,
    pub value: String,
}

impl DataSet {
    pub fn new(address: &str, value: &str) -> Self {
        return DataSet {
            address: address.to_string(),
            value: value.to_string(),
        }
    }
}

/// Everything returned for a single parameter read, in meter order.
pub type Reading = Vec<DataSet>;

#[derive(Debug, Clone, PartialEq)]
pub struct MeterIdentity {
    pub model: String,
    pub sw_version: String,
    pub serial_number: String,
}

impl MeterIdentity {
    /// Device id shared by every entity of the meter, `{model}_{serial}`.
    pub fn device_id(&self) -> String {
        format!("{}_{}", self.model, self.serial_number)
    }
}
