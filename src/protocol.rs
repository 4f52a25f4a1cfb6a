//! Control-plane wire format
//!
//! One command per connection: the command name is the first
//! whitespace-separated token (hierarchical, e.g. `/list/service`), further
//! tokens are arguments. The reply is a decimal status line that mirrors
//! HTTP conventions, followed by a UTF-8 body: JSON for list replies,
//! status text for mutations.

use serde::{Deserialize, Serialize};

pub const OK: u16 = 200;
pub const BAD_REQUEST: u16 = 400;
pub const NOT_FOUND: u16 = 404;
pub const NOT_ACCEPTABLE: u16 = 406;
pub const INTERNAL: u16 = 500;

pub fn status_text(code: u16) -> &'static str {
    match code {
        OK => "OK",
        BAD_REQUEST => "Bad Request",
        NOT_FOUND => "Not Found",
        NOT_ACCEPTABLE => "Not Acceptable",
        INTERNAL => "Internal Server Error",
        _ => "Unknown",
    }
}

/// A parsed command line.
#[derive(Debug, PartialEq, Eq)]
pub struct Command<'a> {
    pub route: &'a str,
    pub args: Vec<&'a str>,
}

impl Command<'_> {
    pub fn arg(&self, i: usize) -> Option<&str> {
        self.args.get(i).copied()
    }
}

/// Split a command line into route and arguments; `None` on a blank line.
pub fn parse_command(line: &str) -> Option<Command<'_>> {
    let mut parts = line.split_whitespace();
    let route = parts.next()?;
    Some(Command {
        route,
        args: parts.collect(),
    })
}

/// A reply on its way back to the operator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub code: u16,
    pub body: String,
}

impl Reply {
    pub fn ok(body: impl Into<String>) -> Reply {
        Reply {
            code: OK,
            body: body.into(),
        }
    }

    /// A bare status reply; the body is the status text.
    pub fn status(code: u16) -> Reply {
        Reply {
            code,
            body: status_text(code).to_string(),
        }
    }

    pub fn status_with(code: u16, detail: impl AsRef<str>) -> Reply {
        Reply {
            code,
            body: format!("{}, {}", status_text(code), detail.as_ref()),
        }
    }

    pub fn render(&self) -> String {
        format!("{}\n{}\n", self.code, self.body)
    }

    /// Inverse of [`Reply::render`], used by the client.
    pub fn parse(text: &str) -> Option<Reply> {
        let (code, body) = text.split_once('\n')?;
        Some(Reply {
            code: code.trim().parse().ok()?,
            body: body.trim_end_matches('\n').to_string(),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListMachine {
    pub machine: String,
    pub actual: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListMachines {
    pub machines: Vec<ListMachine>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListService {
    pub service: String,
    pub hash: String,
    pub state: String,
    pub info: String,
    pub change: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListServices {
    pub services: Vec<ListService>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_parsing() {
        let cmd = parse_command("/state/rollback app deadbeef").unwrap();
        assert_eq!(cmd.route, "/state/rollback");
        assert_eq!(cmd.arg(0), Some("app"));
        assert_eq!(cmd.arg(1), Some("deadbeef"));
        assert_eq!(cmd.arg(2), None);

        assert!(parse_command("").is_none());
        assert!(parse_command("   \t ").is_none());
    }

    #[test]
    fn reply_roundtrip() {
        for reply in [
            Reply::ok("{\"machines\":[]}"),
            Reply::status(NOT_FOUND),
            Reply::status_with(NOT_ACCEPTABLE, "not a valid git hash: xyz"),
        ] {
            let parsed = Reply::parse(&reply.render()).unwrap();
            assert_eq!(parsed, reply);
        }
    }

    #[test]
    fn list_roundtrip() {
        let ls = ListServices {
            services: vec![ListService {
                service: "etc/app".into(),
                hash: "0123456789abcdef0123456789abcdef01234567".into(),
                state: "OK".into(),
                info: String::new(),
                change: "Thu, 01 Jan 2026 00:00:00 +0000".into(),
            }],
        };
        let encoded = serde_json::to_string(&ls).unwrap();
        let decoded: ListServices = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.services[0].service, "etc/app");
        assert_eq!(decoded.services[0].state, "OK");
    }
}
