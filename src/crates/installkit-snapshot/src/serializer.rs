//! Serialization protocol for cache snapshots

use crate::error::Result;
use serde::{Deserialize, Serialize};

/// Protocol for serializing and deserializing snapshot payloads
///
/// Implementations can provide custom on-disk formats for the data cache
/// (binary, JSON, compressed, etc.)
pub trait SerializerProtocol: Send + Sync {
    /// Serialize a value to bytes
    fn dumps<T: Serialize>(&self, value: &T) -> Result<Vec<u8>>;

    /// Deserialize a value from bytes
    fn loads<T: for<'de> Deserialize<'de>>(&self, data: &[u8]) -> Result<T>;
}

/// Binary serializer using bincode (default for snapshot files)
#[derive(Debug, Clone, Default)]
pub struct BincodeSerializer;

impl BincodeSerializer {
    pub fn new() -> Self {
        Self
    }
}

impl SerializerProtocol for BincodeSerializer {
    fn dumps<T: Serialize>(&self, value: &T) -> Result<Vec<u8>> {
        Ok(bincode::serialize(value)?)
    }

    fn loads<T: for<'de> Deserialize<'de>>(&self, data: &[u8]) -> Result<T> {
        Ok(bincode::deserialize(data)?)
    }
}

/// JSON serializer (human-readable snapshots for debugging)
#[derive(Debug, Clone, Default)]
pub struct JsonSerializer;

impl JsonSerializer {
    pub fn new() -> Self {
        Self
    }
}

impl SerializerProtocol for JsonSerializer {
    fn dumps<T: Serialize>(&self, value: &T) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(value)?)
    }

    fn loads<T: for<'de> Deserialize<'de>>(&self, data: &[u8]) -> Result<T> {
        Ok(serde_json::from_slice(data)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct TestPayload {
        node: String,
        value: i64,
    }

    #[test]
    fn test_bincode_serializer() {
        let serializer = BincodeSerializer::new();
        let data = TestPayload {
            node: "target.disk".to_string(),
            value: 42,
        };

        let bytes = serializer.dumps(&data).unwrap();
        let restored: TestPayload = serializer.loads(&bytes).unwrap();

        assert_eq!(data, restored);
    }

    #[test]
    fn test_json_serializer() {
        let serializer = JsonSerializer::new();
        let data = TestPayload {
            node: "target.disk".to_string(),
            value: 42,
        };

        let bytes = serializer.dumps(&data).unwrap();
        let restored: TestPayload = serializer.loads(&bytes).unwrap();

        assert_eq!(data, restored);
    }
}
