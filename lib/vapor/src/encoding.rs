/// Base64 helpers for binary fields in JSON config files.
pub mod base64 {
    use serde::Serializer;

    #[inline]
    pub fn encode(data: &[u8]) -> String {
        ::base64::encode(data)
    }

    #[inline]
    pub fn decode(data: &str) -> Result<Vec<u8>, ::base64::DecodeError> {
        ::base64::decode(data)
    }

    /// `serialize_with` adapter for byte fields.
    #[inline]
    pub fn serialize<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&encode(data))
    }
}
