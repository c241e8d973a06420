//! OpenVPN directive parsing and patching
//!
//! All line-level patterns for `server.conf`, the client template and client
//! profiles live here. Edits are line oriented: a directive is recognised
//! only at the start of a line, comment lines (`#`, `;`) are never touched
//! and every other byte of the file, line endings included, is preserved.

use once_cell::sync::Lazy;
use regex::Regex;

/// `keyword [args...]` at the start of a line
static DIRECTIVE_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^([A-Za-z][A-Za-z0-9_-]*)(?:[ \t]+(.*?))?[ \t]*$").expect("static regex")
});

/// IPv4 addresses in `ip addr show` output
static INET_ADDR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"inet\s+(\d+\.\d+\.\d+\.\d+)").expect("static regex"));

/// Directives the editor manages
pub const LOCAL: &str = "local";
pub const PORT: &str = "port";
pub const PROTO: &str = "proto";
pub const DEV: &str = "dev";
pub const REMOTE: &str = "remote";

/// What a file says about one directive
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirectiveState {
    /// No line carries the directive
    Absent,
    /// The keyword is present without a value
    Empty,
    /// First value found
    Value(Vec<String>),
}

impl DirectiveState {
    /// True when the directive has no usable value
    pub fn is_missing(&self) -> bool {
        !matches!(self, DirectiveState::Value(_))
    }

    pub fn first_arg(&self) -> Option<&str> {
        match self {
            DirectiveState::Value(args) => args.first().map(String::as_str),
            _ => None,
        }
    }
}

/// Target of a `remote` line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Remote {
    pub host: Option<String>,
    pub port: Option<u16>,
}

/// Split `text` into (line body, line ending) pairs
fn lines(text: &str) -> impl Iterator<Item = (&str, &str)> {
    text.split_inclusive('\n').map(|line| {
        if let Some(body) = line.strip_suffix("\r\n") {
            (body, "\r\n")
        } else if let Some(body) = line.strip_suffix('\n') {
            (body, "\n")
        } else {
            (line, "")
        }
    })
}

/// Keyword and argument list of a directive line
fn parse_line(body: &str) -> Option<(&str, Vec<&str>)> {
    let caps = DIRECTIVE_LINE.captures(body)?;
    let keyword = caps.get(1)?.as_str();
    let args = caps
        .get(2)
        .map(|m| m.as_str().split_whitespace().collect())
        .unwrap_or_default();
    Some((keyword, args))
}

/// State of the first line carrying `keyword`
pub fn state(text: &str, keyword: &str) -> DirectiveState {
    for (body, _) in lines(text) {
        if let Some((kw, args)) = parse_line(body) {
            if kw == keyword {
                return if args.is_empty() {
                    DirectiveState::Empty
                } else {
                    DirectiveState::Value(args.into_iter().map(String::from).collect())
                };
            }
        }
    }
    DirectiveState::Absent
}

/// True if some line carries `keyword` with no value
pub fn has_empty(text: &str, keyword: &str) -> bool {
    lines(text).any(|(body, _)| matches!(parse_line(body), Some((kw, args)) if kw == keyword && args.is_empty()))
}

/// Fill every valueless `keyword` line with `value`.
///
/// Returns None when there was nothing to fill.
pub fn fill_empty(text: &str, keyword: &str, value: &str) -> Option<String> {
    let mut changed = false;
    let mut out = String::with_capacity(text.len() + value.len() + 1);
    for (body, ending) in lines(text) {
        match parse_line(body) {
            Some((kw, args)) if kw == keyword && args.is_empty() => {
                out.push_str(&format!("{} {}", keyword, value));
                changed = true;
            }
            _ => out.push_str(body),
        }
        out.push_str(ending);
    }
    changed.then_some(out)
}

/// Set `keyword` to `value` on every line carrying it, or append the
/// directive when no line does.
pub fn set(text: &str, keyword: &str, value: &str) -> String {
    let mut found = false;
    let mut out = String::with_capacity(text.len() + value.len() + keyword.len() + 2);
    for (body, ending) in lines(text) {
        match parse_line(body) {
            Some((kw, _)) if kw == keyword => {
                out.push_str(&format!("{} {}", keyword, value));
                found = true;
            }
            _ => out.push_str(body),
        }
        out.push_str(ending);
    }
    if !found {
        append_line(&mut out, &format!("{} {}", keyword, value));
    }
    out
}

/// Set `keyword` only when it is absent or empty; valid values are kept.
/// Returns None when nothing changed.
pub fn ensure(text: &str, keyword: &str, value: &str) -> Option<String> {
    match state(text, keyword) {
        DirectiveState::Value(_) => None,
        DirectiveState::Empty => fill_empty(text, keyword, value),
        DirectiveState::Absent => {
            let mut out = text.to_string();
            append_line(&mut out, &format!("{} {}", keyword, value));
            Some(out)
        }
    }
}

fn append_line(out: &mut String, line: &str) {
    if !out.is_empty() && !out.ends_with('\n') {
        out.push('\n');
    }
    out.push_str(line);
    out.push('\n');
}

/// Configured listening port, if parseable
pub fn port(text: &str) -> Option<u16> {
    state(text, PORT).first_arg().and_then(|p| p.parse().ok())
}

/// Configured protocol, if present
pub fn proto(text: &str) -> Option<String> {
    state(text, PROTO).first_arg().map(str::to_string)
}

fn parse_remote(args: &[&str]) -> Remote {
    match args {
        [] => Remote { host: None, port: None },
        // `remote 1194` is a port with the address left out
        [only] if only.chars().all(|c| c.is_ascii_digit()) => Remote {
            host: None,
            port: only.parse().ok(),
        },
        [host] => Remote {
            host: Some(host.to_string()),
            port: None,
        },
        [host, port, ..] => Remote {
            host: Some(host.to_string()),
            port: port.parse().ok(),
        },
    }
}

/// First `remote` line, if any
pub fn remote(text: &str) -> Option<Remote> {
    lines(text).find_map(|(body, _)| match parse_line(body) {
        Some((kw, args)) if kw == REMOTE => Some(parse_remote(&args)),
        _ => None,
    })
}

/// Rewrite `remote` lines.
///
/// `rewrite` receives the parsed target and returns the new `host port`
/// pair, or None to leave the line as it is. Returns None when no line
/// changed.
pub fn rewrite_remote<F>(text: &str, mut rewrite: F) -> Option<String>
where
    F: FnMut(&Remote) -> Option<(String, u16)>,
{
    let mut changed = false;
    let mut out = String::with_capacity(text.len() + 16);
    for (body, ending) in lines(text) {
        match parse_line(body) {
            Some((kw, args)) if kw == REMOTE => {
                let current = parse_remote(&args);
                match rewrite(&current) {
                    Some((host, port)) => {
                        let line = format!("{} {} {}", REMOTE, host, port);
                        changed |= line != body;
                        out.push_str(&line);
                    }
                    None => out.push_str(body),
                }
            }
            _ => out.push_str(body),
        }
        out.push_str(ending);
    }
    changed.then_some(out)
}

/// IPv4 addresses listed by `ip addr show`, in order of appearance
pub fn inet_addresses(ip_output: &str) -> Vec<String> {
    INET_ADDR
        .captures_iter(ip_output)
        .filter_map(|caps| caps.get(1).map(|m| m.as_str().to_string()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SERVER_CONF: &str = "\
local 192.0.2.10
port 1194
proto udp
dev tun
# port 999
;proto tcp
server 10.8.0.0 255.255.255.0
";

    #[test]
    fn test_state_reads_first_directive() {
        assert_eq!(state(SERVER_CONF, PORT), DirectiveState::Value(vec!["1194".into()]));
        assert_eq!(state(SERVER_CONF, PROTO).first_arg(), Some("udp"));
        assert_eq!(state(SERVER_CONF, "cipher"), DirectiveState::Absent);
        assert_eq!(state("local  \t\nport 1\n", LOCAL), DirectiveState::Empty);
    }

    #[test]
    fn test_comments_ignored() {
        let text = "# local\n;port\n";
        assert_eq!(state(text, LOCAL), DirectiveState::Absent);
        assert!(!has_empty(text, PORT));
    }

    #[test]
    fn test_local_fill_empty() {
        let text = "port 1194\nlocal\nproto udp\n";
        assert!(has_empty(text, LOCAL));
        assert_eq!(
            fill_empty(text, LOCAL, "192.0.2.10").unwrap(),
            "port 1194\nlocal 192.0.2.10\nproto udp\n"
        );
        assert_eq!(fill_empty(SERVER_CONF, LOCAL, "192.0.2.99"), None);
    }

    #[test]
    fn test_local_keyword_is_exact() {
        // `localhost` is not the `local` directive
        assert!(!has_empty("localhost\n", LOCAL));
        assert!(!has_empty("  local\n", LOCAL));
    }

    #[test]
    fn test_crlf_preserved() {
        let text = "local\r\nport 1194\r\n";
        assert_eq!(fill_empty(text, LOCAL, "192.0.2.1").unwrap(), "local 192.0.2.1\r\nport 1194\r\n");
    }

    #[test]
    fn test_port_set_and_append() {
        assert_eq!(set("port 1194\nproto udp\n", PORT, "1195"), "port 1195\nproto udp\n");
        assert_eq!(set("proto udp", PORT, "1195"), "proto udp\nport 1195\n");
        assert_eq!(port("port 1195\n"), Some(1195));
        assert_eq!(port("port abc\n"), None);
        assert_eq!(port("proto udp\n"), None);
    }

    #[test]
    fn test_proto_ensure_keeps_valid_value() {
        assert_eq!(ensure("proto tcp\n", PROTO, "udp"), None);
        assert_eq!(ensure("proto\n", PROTO, "udp").unwrap(), "proto udp\n");
        assert_eq!(ensure("port 1\n", PROTO, "udp").unwrap(), "port 1\nproto udp\n");
        assert_eq!(proto("proto tcp\n").as_deref(), Some("tcp"));
    }

    #[test]
    fn test_dev_ensure() {
        assert_eq!(ensure("dev tun0\n", DEV, "tun"), None);
        assert_eq!(ensure("", DEV, "tun").unwrap(), "dev tun\n");
    }

    #[test]
    fn test_remote_parsing() {
        assert_eq!(
            remote("client\nremote 10.0.0.5 1194\n"),
            Some(Remote { host: Some("10.0.0.5".into()), port: Some(1194) })
        );
        assert_eq!(remote("remote  1194\n"), Some(Remote { host: None, port: Some(1194) }));
        assert_eq!(remote("remote\n"), Some(Remote { host: None, port: None }));
        assert_eq!(remote("client\n"), None);
    }

    #[test]
    fn test_rewrite_remote() {
        let text = "client\nremote  1194\nproto udp\n";
        let out = rewrite_remote(text, |r| match &r.host {
            None => Some(("203.0.113.7".to_string(), r.port.unwrap_or(1194))),
            Some(_) => None,
        })
        .unwrap();
        assert_eq!(out, "client\nremote 203.0.113.7 1194\nproto udp\n");

        // Rewriting to the same text is not a change
        assert_eq!(rewrite_remote("remote 1.2.3.4 1194\n", |_| Some(("1.2.3.4".into(), 1194))), None);
    }

    #[test]
    fn test_inet_addresses() {
        let output = "\
1: lo: <LOOPBACK,UP>\n    inet 127.0.0.1/8 scope host lo\n\
2: eth0: <BROADCAST>\n    inet 192.0.2.10/24 brd 192.0.2.255 scope global eth0\n    inet6 fe80::1/64 scope link\n\
3: tun0: <POINTOPOINT>\n    inet 10.8.0.1/24 scope global tun0\n";
        assert_eq!(inet_addresses(output), vec!["127.0.0.1", "192.0.2.10", "10.8.0.1"]);
    }
}
