//! The command verb table.
//!
//! Every verb the backend understands is a [`Verb`]; a request's positional
//! arguments are checked into a typed [`Command`] before anything touches a
//! session. The client builds its requests from the same [`Command`] type.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::endpoint::Endpoint;
use crate::wire::Request;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Verb {
    Keepalive,
    Resize,
    Write,
    Dump,
    Bury,
    BuryAll,
    IsAlive,
    Pid,
    LastChange,
    Platform,
    Sessions,
    SetupChannel,
}

impl Verb {
    pub const ALL: [Verb; 12] = [
        Verb::Keepalive,
        Verb::Resize,
        Verb::Write,
        Verb::Dump,
        Verb::Bury,
        Verb::BuryAll,
        Verb::IsAlive,
        Verb::Pid,
        Verb::LastChange,
        Verb::Platform,
        Verb::Sessions,
        Verb::SetupChannel,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Verb::Keepalive => "keepalive",
            Verb::Resize => "resize",
            Verb::Write => "write",
            Verb::Dump => "dump",
            Verb::Bury => "bury",
            Verb::BuryAll => "bury_all",
            Verb::IsAlive => "is_alive",
            Verb::Pid => "pid",
            Verb::LastChange => "last_change",
            Verb::Platform => "platform",
            Verb::Sessions => "sessions",
            Verb::SetupChannel => "setup_channel",
        }
    }
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Returned for a verb name outside the table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownVerb(pub String);

impl FromStr for Verb {
    type Err = UnknownVerb;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Verb::ALL
            .into_iter()
            .find(|verb| verb.name() == s)
            .ok_or_else(|| UnknownVerb(s.to_string()))
    }
}

/// Bytes for `write`: a JSON string or an array of byte values.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Payload {
    Text(String),
    Bytes(Vec<u8>),
}

impl Payload {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Payload::Text(text) => text.as_bytes(),
            Payload::Bytes(bytes) => bytes,
        }
    }
}

/// A positional argument did not fit the verb's signature.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ArgError {
    #[error("{verb}: missing argument {index} ({name})")]
    Missing {
        verb: Verb,
        index: usize,
        name: &'static str,
    },
    #[error("{verb}: argument {index} ({name}) must be {expected}")]
    Invalid {
        verb: Verb,
        index: usize,
        name: &'static str,
        expected: &'static str,
    },
    #[error("{verb}: expected at most {max} arguments, got {got}")]
    TooMany { verb: Verb, max: usize, got: usize },
}

/// A request checked against the verb table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    Keepalive {
        id: String,
        cols: u16,
        rows: u16,
        command: Option<String>,
    },
    Resize {
        id: String,
        cols: u16,
        rows: u16,
    },
    Write {
        id: String,
        data: Payload,
    },
    Dump {
        id: String,
    },
    Bury {
        id: String,
    },
    BuryAll,
    IsAlive {
        id: String,
    },
    Pid {
        id: String,
    },
    LastChange {
        id: String,
    },
    Platform,
    Sessions,
    SetupChannel {
        address: Endpoint,
    },
}

struct Args<'a> {
    verb: Verb,
    values: &'a [Value],
}

impl<'a> Args<'a> {
    fn check_len(&self, max: usize) -> Result<(), ArgError> {
        if self.values.len() > max {
            return Err(ArgError::TooMany {
                verb: self.verb,
                max,
                got: self.values.len(),
            });
        }
        Ok(())
    }

    fn get(&self, index: usize, name: &'static str) -> Result<&'a Value, ArgError> {
        self.values.get(index).ok_or(ArgError::Missing {
            verb: self.verb,
            index,
            name,
        })
    }

    fn invalid(&self, index: usize, name: &'static str, expected: &'static str) -> ArgError {
        ArgError::Invalid {
            verb: self.verb,
            index,
            name,
            expected,
        }
    }

    fn string(&self, index: usize, name: &'static str) -> Result<String, ArgError> {
        self.get(index, name)?
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| self.invalid(index, name, "a string"))
    }

    fn opt_string(&self, index: usize, name: &'static str) -> Result<Option<String>, ArgError> {
        match self.values.get(index) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(s)) => Ok(Some(s.clone())),
            Some(_) => Err(self.invalid(index, name, "a string or null")),
        }
    }

    fn dimension(&self, index: usize, name: &'static str) -> Result<u16, ArgError> {
        self.get(index, name)?
            .as_u64()
            .and_then(|n| u16::try_from(n).ok())
            .filter(|n| *n > 0)
            .ok_or_else(|| self.invalid(index, name, "an integer in 1..=65535"))
    }

    fn payload(&self, index: usize, name: &'static str) -> Result<Payload, ArgError> {
        serde_json::from_value(self.get(index, name)?.clone())
            .map_err(|_| self.invalid(index, name, "a string or an array of bytes"))
    }

    fn endpoint(&self, index: usize, name: &'static str) -> Result<Endpoint, ArgError> {
        self.string(index, name)?
            .parse()
            .map_err(|_| self.invalid(index, name, "an ipc:// or tcp:// address"))
    }
}

impl Command {
    /// Check positional `args` against `verb`'s signature.
    pub fn parse(verb: Verb, args: &[Value]) -> Result<Self, ArgError> {
        let a = Args { verb, values: args };
        let command = match verb {
            Verb::Keepalive => {
                a.check_len(4)?;
                Command::Keepalive {
                    id: a.string(0, "id")?,
                    cols: a.dimension(1, "width")?,
                    rows: a.dimension(2, "height")?,
                    command: a.opt_string(3, "cmd")?,
                }
            }
            Verb::Resize => {
                a.check_len(3)?;
                Command::Resize {
                    id: a.string(0, "id")?,
                    cols: a.dimension(1, "width")?,
                    rows: a.dimension(2, "height")?,
                }
            }
            Verb::Write => {
                a.check_len(2)?;
                Command::Write {
                    id: a.string(0, "id")?,
                    data: a.payload(1, "bytes")?,
                }
            }
            Verb::Dump | Verb::Bury | Verb::IsAlive | Verb::Pid | Verb::LastChange => {
                a.check_len(1)?;
                let id = a.string(0, "id")?;
                match verb {
                    Verb::Dump => Command::Dump { id },
                    Verb::Bury => Command::Bury { id },
                    Verb::IsAlive => Command::IsAlive { id },
                    Verb::Pid => Command::Pid { id },
                    _ => Command::LastChange { id },
                }
            }
            Verb::BuryAll => {
                a.check_len(0)?;
                Command::BuryAll
            }
            Verb::Platform => {
                a.check_len(0)?;
                Command::Platform
            }
            Verb::Sessions => {
                a.check_len(0)?;
                Command::Sessions
            }
            Verb::SetupChannel => {
                a.check_len(1)?;
                Command::SetupChannel {
                    address: a.endpoint(0, "address")?,
                }
            }
        };
        Ok(command)
    }

    pub fn verb(&self) -> Verb {
        match self {
            Command::Keepalive { .. } => Verb::Keepalive,
            Command::Resize { .. } => Verb::Resize,
            Command::Write { .. } => Verb::Write,
            Command::Dump { .. } => Verb::Dump,
            Command::Bury { .. } => Verb::Bury,
            Command::BuryAll => Verb::BuryAll,
            Command::IsAlive { .. } => Verb::IsAlive,
            Command::Pid { .. } => Verb::Pid,
            Command::LastChange { .. } => Verb::LastChange,
            Command::Platform => Verb::Platform,
            Command::Sessions => Verb::Sessions,
            Command::SetupChannel { .. } => Verb::SetupChannel,
        }
    }

    /// The positional request document for this command.
    pub fn to_request(&self) -> Request {
        let args = match self {
            Command::Keepalive {
                id,
                cols,
                rows,
                command,
            } => vec![json!(id), json!(cols), json!(rows), json!(command)],
            Command::Resize { id, cols, rows } => vec![json!(id), json!(cols), json!(rows)],
            Command::Write { id, data } => vec![json!(id), json!(data)],
            Command::Dump { id }
            | Command::Bury { id }
            | Command::IsAlive { id }
            | Command::Pid { id }
            | Command::LastChange { id } => vec![json!(id)],
            Command::BuryAll | Command::Platform | Command::Sessions => Vec::new(),
            Command::SetupChannel { address } => vec![json!(address.to_string())],
        };
        Request {
            command: self.verb().name().to_string(),
            args,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verb_names_round_trip() {
        for verb in Verb::ALL {
            assert_eq!(verb.name().parse::<Verb>(), Ok(verb));
        }
        assert_eq!(
            "proc_keepalive".parse::<Verb>(),
            Err(UnknownVerb("proc_keepalive".into()))
        );
    }

    #[test]
    fn test_keepalive_optional_command() {
        let cmd = Command::parse(Verb::Keepalive, &[json!("s1"), json!(80), json!(24)]).unwrap();
        assert_eq!(
            cmd,
            Command::Keepalive {
                id: "s1".into(),
                cols: 80,
                rows: 24,
                command: None,
            }
        );

        let cmd = Command::parse(
            Verb::Keepalive,
            &[json!("s1"), json!(80), json!(24), json!("/bin/sh -i")],
        )
        .unwrap();
        assert!(matches!(cmd, Command::Keepalive { command: Some(ref c), .. } if c == "/bin/sh -i"));
    }

    #[test]
    fn test_bad_dimensions_rejected() {
        let err = Command::parse(Verb::Resize, &[json!("s1"), json!(0), json!(24)]).unwrap_err();
        assert!(matches!(err, ArgError::Invalid { index: 1, .. }));

        let err = Command::parse(Verb::Resize, &[json!("s1"), json!(70000), json!(24)]).unwrap_err();
        assert!(matches!(err, ArgError::Invalid { index: 1, .. }));

        let err = Command::parse(Verb::Resize, &[json!("s1"), json!(80)]).unwrap_err();
        assert!(matches!(err, ArgError::Missing { index: 2, .. }));
    }

    #[test]
    fn test_write_accepts_text_or_bytes() {
        let cmd = Command::parse(Verb::Write, &[json!("s1"), json!("ls\n")]).unwrap();
        let Command::Write { data, .. } = cmd else {
            panic!("expected write");
        };
        assert_eq!(data.as_bytes(), b"ls\n");

        let cmd = Command::parse(Verb::Write, &[json!("s1"), json!([3, 4])]).unwrap();
        let Command::Write { data, .. } = cmd else {
            panic!("expected write");
        };
        assert_eq!(data.as_bytes(), &[3, 4]);

        assert!(Command::parse(Verb::Write, &[json!("s1"), json!({"x": 1})]).is_err());
    }

    #[test]
    fn test_too_many_arguments() {
        let err = Command::parse(Verb::Platform, &[json!(1)]).unwrap_err();
        assert_eq!(
            err,
            ArgError::TooMany {
                verb: Verb::Platform,
                max: 0,
                got: 1
            }
        );
    }

    #[test]
    fn test_to_request_parses_back() {
        let commands = [
            Command::Keepalive {
                id: "a".into(),
                cols: 100,
                rows: 30,
                command: None,
            },
            Command::Write {
                id: "a".into(),
                data: Payload::Text("x".into()),
            },
            Command::SetupChannel {
                address: "ipc:///tmp/n.sock".parse().unwrap(),
            },
            Command::BuryAll,
        ];
        for command in commands {
            let req = command.to_request();
            let verb: Verb = req.command.parse().unwrap();
            assert_eq!(Command::parse(verb, &req.args).unwrap(), command);
        }
    }
}
