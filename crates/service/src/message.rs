//! Wire message shapes.
//!
//! Five shapes share the stream: requests, replies, error replies,
//! notifications, and the handshake prompts the manager itself emits. A
//! frame is classified by its keys, never by position, and forwarding keeps
//! the original JSON object untouched apart from the injected `requester`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

/// Requests addressed to this name are handled by the manager itself.
pub const MANAGER_SERVICE: &str = "Manager";

/// Reserved uid marking a broadcast notification. Never valid for requests.
pub const NOTIFICATION_UID: &str = "notification";

#[derive(Debug, Clone)]
pub enum Message {
    Request(Request),
    Reply(Reply),
    Notification(Notification),
}

/// `{error, service, attribute, args, kwargs, uid}`
#[derive(Debug, Clone)]
pub struct Request {
    pub service: String,
    pub attribute: String,
    pub args: Vec<Value>,
    pub kwargs: Map<String, Value>,
    pub uid: String,
}

/// `{error, result | message+traceback, requester, uid}`
///
/// Success replies and error replies route identically, so they classify to
/// one variant distinguished by the `error` flag.
#[derive(Debug, Clone)]
pub struct Reply {
    pub requester: String,
    pub uid: String,
    pub error: bool,
}

/// `{error:false, service, result, uid:"notification"}`
#[derive(Debug, Clone)]
pub struct Notification {
    pub service: String,
}

impl Message {
    /// Classify a decoded frame by shape.
    ///
    /// Returns the human-readable defect on failure; the caller wraps it in
    /// a protocol-error frame.
    pub fn classify(value: &Value) -> Result<Self, String> {
        let Some(object) = value.as_object() else {
            return Err("frame is not a JSON object".to_string());
        };

        let error = object.get("error").and_then(Value::as_bool).unwrap_or(false);

        // Requests are the only shape carrying an attribute. This branch
        // also catches a request abusing the reserved uid, which the router
        // rejects after classification.
        if let Some(attribute) = object.get("attribute").and_then(Value::as_str) {
            let Some(service) = object.get("service").and_then(Value::as_str) else {
                return Err("request frame is missing the service field".to_string());
            };

            return Ok(Self::Request(Request {
                service: service.to_string(),
                attribute: attribute.to_string(),
                args: object
                    .get("args")
                    .and_then(Value::as_array)
                    .cloned()
                    .unwrap_or_default(),
                kwargs: object
                    .get("kwargs")
                    .and_then(Value::as_object)
                    .cloned()
                    .unwrap_or_default(),
                uid: object
                    .get("uid")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
            }));
        }

        if error {
            let (Some(requester), Some(uid)) = (
                object.get("requester").and_then(Value::as_str),
                object.get("uid").and_then(Value::as_str),
            ) else {
                return Err("error frame is missing requester or uid".to_string());
            };

            return Ok(Self::Reply(Reply {
                requester: requester.to_string(),
                uid: uid.to_string(),
                error: true,
            }));
        }

        if object.get("uid").and_then(Value::as_str) == Some(NOTIFICATION_UID) {
            let Some(service) = object.get("service").and_then(Value::as_str) else {
                return Err("notification frame is missing the service field".to_string());
            };

            return Ok(Self::Notification(Notification {
                service: service.to_string(),
            }));
        }

        if object.contains_key("result") {
            let (Some(requester), Some(uid)) = (
                object.get("requester").and_then(Value::as_str),
                object.get("uid").and_then(Value::as_str),
            ) else {
                return Err("reply frame is missing requester or uid".to_string());
            };

            return Ok(Self::Reply(Reply {
                requester: requester.to_string(),
                uid: uid.to_string(),
                error: false,
            }));
        }

        Err("frame matches no known message shape".to_string())
    }
}

/// The identity every peer advertises during the handshake.
///
/// The JSON shape is a plain object tagged by `type`; unknown extra keys are
/// ignored so peers may advertise more than the broker needs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Identity {
    Manager {
        language: String,
        os: String,
        #[serde(default)]
        attributes: Map<String, Value>,
    },
    Client {
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        language: Option<String>,
        #[serde(default)]
        os: Option<String>,
    },
    Service {
        name: String,
        #[serde(default)]
        language: Option<String>,
        #[serde(default)]
        os: Option<String>,
        #[serde(default)]
        attributes: Map<String, Value>,
        #[serde(default = "Identity::unbounded")]
        max_clients: i64,
    },
}

impl Identity {
    fn unbounded() -> i64 {
        -1
    }
}

/// A manager-originated prompt: the identity request and the login prompts
/// share this shape.
pub fn prompt_frame(attribute: &str, requester: &str) -> Value {
    json!({
        "error": false,
        "attribute": attribute,
        "args": [],
        "kwargs": {},
        "requester": requester,
        "uid": "",
    })
}

pub fn reply_frame(result: Value, requester: &str, uid: &str) -> Value {
    json!({
        "error": false,
        "result": result,
        "requester": requester,
        "uid": uid,
    })
}

pub fn error_frame(message: &str, requester: &str, uid: &str) -> Value {
    json!({
        "error": true,
        "message": message,
        "traceback": [],
        "result": null,
        "requester": requester,
        "uid": uid,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_request() {
        let value = json!({
            "error": false,
            "service": "Echo",
            "attribute": "echo",
            "args": [1],
            "kwargs": {"k": "v"},
            "uid": "u1",
        });

        match Message::classify(&value).unwrap() {
            Message::Request(request) => {
                assert_eq!(request.service, "Echo");
                assert_eq!(request.attribute, "echo");
                assert_eq!(request.args, vec![json!(1)]);
                assert_eq!(request.kwargs.get("k"), Some(&json!("v")));
                assert_eq!(request.uid, "u1");
            }
            other => panic!("classified as {:?}", other),
        }
    }

    #[test]
    fn classifies_reply_and_error() {
        let reply = json!({"error": false, "result": 7, "requester": "127.0.0.1:1", "uid": "u"});
        let error = json!({
            "error": true,
            "message": "boom",
            "traceback": [],
            "result": null,
            "requester": "127.0.0.1:1",
            "uid": "u",
        });

        assert!(matches!(
            Message::classify(&reply).unwrap(),
            Message::Reply(Reply { error: false, .. })
        ));
        assert!(matches!(
            Message::classify(&error).unwrap(),
            Message::Reply(Reply { error: true, .. })
        ));
    }

    #[test]
    fn classifies_notification() {
        let value = json!({
            "error": false,
            "service": "Ticker",
            "result": [[1], {}],
            "uid": "notification",
        });

        assert!(matches!(
            Message::classify(&value).unwrap(),
            Message::Notification(Notification { service }) if service == "Ticker"
        ));
    }

    #[test]
    fn reserved_uid_still_classifies_as_request() {
        // The router must see the request shape to reject the uid at ingress.
        let value = json!({
            "error": false,
            "service": "Echo",
            "attribute": "echo",
            "args": [],
            "kwargs": {},
            "uid": "notification",
        });

        assert!(matches!(
            Message::classify(&value).unwrap(),
            Message::Request(Request { uid, .. }) if uid == NOTIFICATION_UID
        ));
    }

    #[test]
    fn rejects_unknown_shapes() {
        assert!(Message::classify(&json!(42)).is_err());
        assert!(Message::classify(&json!({"error": false})).is_err());
        assert!(Message::classify(&json!({"uid": "u1"})).is_err());
    }

    #[test]
    fn identity_round_trip() {
        let value = json!({
            "type": "service",
            "name": "Echo",
            "language": "rust",
            "os": "linux",
            "attributes": {"echo": "(*args, **kwargs)"},
        });

        match serde_json::from_value::<Identity>(value).unwrap() {
            Identity::Service { name, max_clients, .. } => {
                assert_eq!(name, "Echo");
                assert_eq!(max_clients, -1);
            }
            other => panic!("parsed as {:?}", other),
        }
    }
}
