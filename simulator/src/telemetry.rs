use serde::{Deserialize, Serialize};

/// Wire format consumed by the ingestor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensorEvent {
    pub device: Device,
    pub data: Data,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Data {
    pub value: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}
