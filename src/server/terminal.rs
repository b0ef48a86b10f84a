//! The terminal shortcut grammar.
//!
//! A terminal peer types plain lines instead of JSON. Request lines take
//! the form `<service> <attribute> [positional args] [k=v ...]`; `identity`
//! queries the manager, `Manager <attr> ...` is the admin shortcut, and
//! `disconnect` / `exit` closes the session. Values parse as JSON scalars
//! where possible and fall back to strings, so `Echo echo 1 true k=2` sends
//! the number 1, the boolean true, and `{"k": 2}`.

use serde_json::{Map, Value, json};

pub enum Translation {
    /// A full JSON request frame ready for the router.
    Request(Value),
    /// The line was not a valid shortcut; the detail goes back as an error.
    Invalid(String),
    /// Close the session.
    Disconnect,
    /// Nothing to do (blank line).
    Empty,
}

/// Translate one terminal line into the JSON request form.
///
/// `counter` numbers the generated uids so replies stay distinguishable on
/// a hand-driven session.
pub fn translate(line: &str, counter: &mut u64) -> Translation {
    let line = line.trim();
    if line.is_empty() {
        return Translation::Empty;
    }

    if line == "disconnect" || line == "exit" {
        return Translation::Disconnect;
    }

    *counter += 1;
    let uid = format!("terminal-{}", counter);

    if line == "identity" {
        return Translation::Request(json!({
            "error": false,
            "service": "Manager",
            "attribute": "identity",
            "args": [],
            "kwargs": {},
            "uid": uid,
        }));
    }

    let mut tokens = line.split_whitespace();
    let service = tokens.next().unwrap_or_default();
    let Some(attribute) = tokens.next() else {
        return Translation::Invalid(format!(
            "expected \"<service> <attribute> [args] [k=v ...]\", got {:?}",
            line
        ));
    };

    let mut args = Vec::new();
    let mut kwargs = Map::new();
    for token in tokens {
        match token.split_once('=') {
            Some((key, value)) if !key.is_empty() => {
                kwargs.insert(key.to_string(), scalar(value));
            }
            _ => args.push(scalar(token)),
        }
    }

    Translation::Request(json!({
        "error": false,
        "service": service,
        "attribute": attribute,
        "args": args,
        "kwargs": kwargs,
        "uid": uid,
    }))
}

/// Parse a token as a JSON scalar, falling back to a plain string.
fn scalar(token: &str) -> Value {
    serde_json::from_str(token).unwrap_or_else(|_| Value::String(token.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(line: &str) -> Value {
        let mut counter = 0;
        match translate(line, &mut counter) {
            Translation::Request(value) => value,
            _ => panic!("line {:?} did not translate to a request", line),
        }
    }

    #[test]
    fn request_line() {
        let value = request("Echo echo hello 1 true k=2 s=abc");
        assert_eq!(value["service"], "Echo");
        assert_eq!(value["attribute"], "echo");
        assert_eq!(value["args"], json!(["hello", 1, true]));
        assert_eq!(value["kwargs"], json!({"k": 2, "s": "abc"}));
        assert_eq!(value["uid"], "terminal-1");
    }

    #[test]
    fn identity_and_admin_shortcuts() {
        let value = request("identity");
        assert_eq!(value["service"], "Manager");
        assert_eq!(value["attribute"], "identity");

        let value = request("Manager list_services");
        assert_eq!(value["service"], "Manager");
        assert_eq!(value["attribute"], "list_services");
    }

    #[test]
    fn disconnect_forms() {
        let mut counter = 0;
        assert!(matches!(translate("disconnect", &mut counter), Translation::Disconnect));
        assert!(matches!(translate("exit", &mut counter), Translation::Disconnect));
        assert!(matches!(translate("  ", &mut counter), Translation::Empty));
        assert!(matches!(translate("Echo", &mut counter), Translation::Invalid(_)));
    }

    #[test]
    fn uids_count_up() {
        let mut counter = 0;
        let first = translate("Echo echo", &mut counter);
        let second = translate("Echo echo", &mut counter);

        match (first, second) {
            (Translation::Request(a), Translation::Request(b)) => {
                assert_eq!(a["uid"], "terminal-1");
                assert_eq!(b["uid"], "terminal-2");
            }
            _ => panic!("expected two requests"),
        }
    }
}
