//! Pluggable JSON backend.
//!
//! The broker treats payloads as opaque JSON; the concrete
//! serializer/deserializer pair is selected once at startup. The default is
//! serde_json. The json5 backend accepts the lenient JSON5 superset on
//! decode, which is convenient for hand-typed terminal peers; both backends
//! emit strict JSON so every frame the broker writes is readable by any
//! peer.

use serde_json::Value;

use crate::Error;

/// Environment variable consulted by [`Backend::from_env`].
pub const BACKEND_ENV: &str = "BROKER_JSON";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Backend {
    #[default]
    Standard,
    Json5,
}

impl Backend {
    /// Select the backend from the `BROKER_JSON` environment variable.
    ///
    /// Unknown names fall back to the default backend with a warning rather
    /// than refusing to start.
    pub fn from_env() -> Self {
        match std::env::var(BACKEND_ENV) {
            Err(_) => Self::Standard,
            Ok(name) => match name.to_ascii_lowercase().as_str() {
                "" | "builtin" | "standard" | "json" => Self::Standard,
                "json5" => Self::Json5,
                _ => {
                    log::warn!("unknown json backend: name={:?}, using builtin", name);
                    Self::Standard
                }
            },
        }
    }

    pub fn encode(&self, value: &Value) -> Result<Vec<u8>, Error> {
        Ok(serde_json::to_vec(value)?)
    }

    pub fn decode(&self, bytes: &[u8]) -> Result<Value, Error> {
        match self {
            Self::Standard => Ok(serde_json::from_slice(bytes)?),
            Self::Json5 => Ok(serde_json5::from_str(std::str::from_utf8(bytes)?)?),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_is_encode_inverse() {
        let value = serde_json::json!({"result": [1, 2, 3], "requester": "a:1", "uid": "u"});

        for backend in [Backend::Standard, Backend::Json5] {
            let bytes = backend.encode(&value).unwrap();
            assert_eq!(backend.decode(&bytes).unwrap(), value);
        }
    }

    #[test]
    fn json5_accepts_lenient_input() {
        let decoded = Backend::Json5.decode(b"{uid: 'u1', error: false}").unwrap();
        assert_eq!(decoded["uid"], "u1");
        assert_eq!(decoded["error"], false);
    }

    #[test]
    fn standard_rejects_lenient_input() {
        assert!(Backend::Standard.decode(b"{uid: 'u1'}").is_err());
    }
}
