//! Session upgrade URL construction. Both the client shim (dialing the
//! manager) and the manager (dialing a sandbox host) build the same
//! `/ws?path=...&proc=...` endpoint.

/// Percent-encodes a query component. Everything outside the unreserved set
/// is escaped so library paths survive the query string.
pub fn encode_component(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            _ => {
                out.push('%');
                out.push_str(&format!("{byte:02X}"));
            }
        }
    }
    out
}

/// Builds the websocket upgrade URL for a session against `authority`
/// (`host:port`), carrying the library path and entry-point symbol.
pub fn session_url(scheme: &str, authority: &str, lib_path: &str, proc: &str) -> String {
    format!(
        "{}://{}/ws?path={}&proc={}",
        scheme,
        authority,
        encode_component(lib_path),
        encode_component(proc)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_reserved_characters() {
        assert_eq!(encode_component("discon.dll"), "discon.dll");
        assert_eq!(
            encode_component("/opt/controllers/discon.so"),
            "%2Fopt%2Fcontrollers%2Fdiscon.so"
        );
        assert_eq!(encode_component("a b&c"), "a%20b%26c");
    }

    #[test]
    fn builds_session_url() {
        assert_eq!(
            session_url("ws", "10.0.0.2:8080", "/lib/discon.so", "DISCON"),
            "ws://10.0.0.2:8080/ws?path=%2Flib%2Fdiscon.so&proc=DISCON"
        );
    }
}
