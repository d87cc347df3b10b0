use std::fmt::{Display, Formatter};
use std::str::FromStr;
use anyhow::{anyhow, bail};
use crate::engine::Role;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientMessage {
    /// introduces a peer of the transfer identified by `group`
    Hello { group: u32, role: Role },
    Finished,
    Checksum(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerMessage {
    Challenge(u32),
    Result { success: bool },
}

/// splits a line into its keyword and arguments
fn split_line(line: &str) -> anyhow::Result<(&str, Vec<&str>)> {
    let mut parts = line.split_whitespace();
    let keyword = parts.next()
        .ok_or_else(|| anyhow!("empty message"))?;
    Ok((keyword, parts.collect()))
}

fn parse_u32(argument: &str, line: &str) -> anyhow::Result<u32> {
    argument.parse()
        .map_err(|e| anyhow!("invalid number {:?} in message {:?}: {}", argument, line, e))
}

impl FromStr for ClientMessage {
    type Err = anyhow::Error;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let (keyword, arguments) = split_line(line)?;
        match (keyword, arguments.as_slice()) {
            ("HELLO", [group, role]) => Ok(ClientMessage::Hello {
                group: parse_u32(group, line)?,
                role: role.parse()?,
            }),
            ("FINISHED", []) => Ok(ClientMessage::Finished),
            ("CHECKSUM", [checksum]) => Ok(ClientMessage::Checksum(parse_u32(checksum, line)?)),
            _ => bail!("invalid client message {:?}", line),
        }
    }
}

impl Display for ClientMessage {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientMessage::Hello { group, role } => write!(f, "HELLO {} {}", group, role),
            ClientMessage::Finished => write!(f, "FINISHED"),
            ClientMessage::Checksum(checksum) => write!(f, "CHECKSUM {}", checksum),
        }
    }
}

impl FromStr for ServerMessage {
    type Err = anyhow::Error;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let (keyword, arguments) = split_line(line)?;
        match (keyword, arguments.as_slice()) {
            ("CHALLENGE", [challenge]) => Ok(ServerMessage::Challenge(parse_u32(challenge, line)?)),
            ("RESULT", ["SUCCESS"]) => Ok(ServerMessage::Result { success: true }),
            ("RESULT", ["FAILURE"]) => Ok(ServerMessage::Result { success: false }),
            _ => bail!("invalid server message {:?}", line),
        }
    }
}

impl Display for ServerMessage {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerMessage::Challenge(challenge) => write!(f, "CHALLENGE {}", challenge),
            ServerMessage::Result { success: true } => write!(f, "RESULT SUCCESS"),
            ServerMessage::Result { success: false } => write!(f, "RESULT FAILURE"),
        }
    }
}
