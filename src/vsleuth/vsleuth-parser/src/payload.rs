/*
 * vSleuth mail log forensics
 * Copyright (C) 2022 viridIT SAS
 *
 * This program is free software: you can redistribute it and/or modify it under
 * the terms of the GNU General Public License as published by the Free Software
 * Foundation, either version 3 of the License, or any later version.
 *
 * This program is distributed in the hope that it will be useful, but WITHOUT
 * ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
 * FOR A PARTICULAR PURPOSE.  See the GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License along with
 * this program. If not, see https://www.gnu.org/licenses/.
 *
*/
use crate::{Header, ParseError, SmtpStatus};

/// Where a queue entered the system from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueOrigin {
    /// locally submitted via the maildrop (sendmail/pickup).
    Pickup,
    /// received over SMTP by `smtpd`.
    Smtpd,
}

/// The next hop Postfix handed a message to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Relay {
    /// relay hostname, or `local` / `none` sentinels.
    pub hostname: String,
    /// relay port, absent for local transports.
    pub port: Option<u16>,
}

/// Which delivery agent produced a delivery attempt line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveredTo {
    /// `smtp` client, outbound to a remote host.
    RemoteSmtp,
    /// `pipe` transport, outbound through a command.
    Pipe,
    /// `local` delivery agent.
    Local,
    /// `virtual` delivery agent.
    Virtual,
    /// `lmtp` client.
    Lmtp,
}

impl DeliveredTo {
    fn from_daemon(daemon: &str) -> Option<Self> {
        Some(match daemon {
            "smtp" => Self::RemoteSmtp,
            "pipe" => Self::Pipe,
            "local" => Self::Local,
            "virtual" => Self::Virtual,
            "lmtp" => Self::Lmtp,
            _ => return None,
        })
    }

    /// Local agents mark the message as having arrived at this node.
    #[must_use]
    pub const fn is_local_agent(self) -> bool {
        matches!(self, Self::Local | Self::Virtual | Self::Lmtp)
    }
}

/// The structured content of a log line, keyed by Postfix event kind.
#[derive(Debug, Clone, PartialEq)]
#[allow(clippy::large_enum_variant)]
pub enum Payload {
    /// a new queue was created.
    QueueNew {
        /// Postfix queue id.
        queue: String,
        /// how the message entered the system.
        origin: QueueOrigin,
    },

    /// `cleanup` attached the message-id to a queue.
    CleanupMessageId {
        /// Postfix queue id.
        queue: String,
        /// RFC 5322 message-id, without angle brackets.
        message_id: String,
    },

    /// `cleanup` logged a reply-related header (via `header_checks` INFO rules).
    CleanupReplyHeader {
        /// Postfix queue id.
        queue: String,
        /// `In-Reply-To` value, if this was an `In-Reply-To` header.
        in_reply_to: Option<String>,
        /// `References` values, if this was a `References` header.
        references: Vec<String>,
    },

    /// `qmgr` accepted the message into the active queue.
    QmgrMessageAccepted {
        /// Postfix queue id.
        queue: String,
        /// envelope sender, empty for bounces.
        sender: String,
        /// message size in bytes.
        size: u64,
        /// number of envelope recipients.
        nrcpt: u64,
    },

    /// `qmgr` dropped the queue entry, the lifecycle is over.
    QmgrRemoved {
        /// Postfix queue id.
        queue: String,
    },

    /// `qmgr` gave up on the message after the maximal queue lifetime.
    QmgrExpired {
        /// Postfix queue id.
        queue: String,
        /// envelope sender.
        sender: String,
    },

    /// one delivery attempt for one recipient.
    SmtpDelivery {
        /// Postfix queue id.
        queue: String,
        /// envelope recipient.
        recipient: String,
        /// original recipient before rewriting, when logged.
        orig_recipient: Option<String>,
        /// next hop, absent when the agent logged `relay=none`.
        relay: Option<Relay>,
        /// total delay in seconds.
        delay: f64,
        /// delivery status notification code, e.g. `2.0.0`.
        dsn: String,
        /// outcome of this attempt.
        status: SmtpStatus,
        /// which agent performed the attempt.
        agent: DeliveredTo,
    },

    /// `bounce` created a child queue carrying the non-delivery report.
    BounceCreated {
        /// parent (failed) queue id.
        queue: String,
        /// child queue id carrying the notification.
        child_queue: String,
    },
}

impl Payload {
    /// The queue id this event belongs to.
    #[must_use]
    pub fn queue(&self) -> &str {
        match self {
            Self::QueueNew { queue, .. }
            | Self::CleanupMessageId { queue, .. }
            | Self::CleanupReplyHeader { queue, .. }
            | Self::QmgrMessageAccepted { queue, .. }
            | Self::QmgrRemoved { queue }
            | Self::QmgrExpired { queue, .. }
            | Self::SmtpDelivery { queue, .. }
            | Self::BounceCreated { queue, .. } => queue,
        }
    }
}

fn is_queue_id(s: &str) -> bool {
    // short format: uppercase hex. long format adds lowercase time digits.
    !s.is_empty()
        && s.len() >= 6
        && s.bytes().all(|c| c.is_ascii_digit() || c.is_ascii_uppercase() || c.is_ascii_lowercase())
        && s != "NOQUEUE"
        && s != "warning"
        && s != "statistics"
}

fn split_queue_prefix(payload: &str) -> Option<(&str, &str)> {
    let (queue, rest) = payload.split_once(": ")?;

    if !is_queue_id(queue) {
        return None;
    }

    Some((queue, rest))
}

fn angle_bracketed(s: &str) -> Option<&str> {
    s.strip_prefix('<').and_then(|s| s.strip_suffix('>'))
}

/// Extract a `key=value` pair from a comma-separated attribute list.
fn attribute<'a>(rest: &'a str, key: &str) -> Option<&'a str> {
    for part in rest.split(", ") {
        if let Some(value) = part.strip_prefix(key).and_then(|p| p.strip_prefix('=')) {
            return Some(value);
        }
    }

    None
}

fn parse_relay(value: &str) -> Option<Relay> {
    if value == "none" {
        return None;
    }

    // `host.example.com[11.22.33.44]:25`, or bare `local`
    let without_port = match value.rsplit_once(':') {
        Some((head, port)) if port.bytes().all(|c| c.is_ascii_digit()) => {
            return Some(Relay {
                hostname: head.split_once('[').map_or(head, |(h, _)| h).to_string(),
                port: port.parse().ok(),
            });
        }
        _ => value,
    };

    Some(Relay {
        hostname: without_port
            .split_once('[')
            .map_or(without_port, |(h, _)| h)
            .to_string(),
        port: None,
    })
}

fn parse_pickup(rest: &str) -> Result<Payload, ParseError> {
    let (queue, attributes) = split_queue_prefix(rest).ok_or(ParseError::UnsupportedPayload)?;

    if attribute(attributes, "uid").is_none() {
        return Err(ParseError::UnsupportedPayload);
    }

    Ok(Payload::QueueNew {
        queue: queue.to_string(),
        origin: QueueOrigin::Pickup,
    })
}

fn parse_smtpd(rest: &str) -> Result<Payload, ParseError> {
    let (queue, attributes) = split_queue_prefix(rest).ok_or(ParseError::UnsupportedPayload)?;

    if !attributes.starts_with("client=") {
        return Err(ParseError::UnsupportedPayload);
    }

    Ok(Payload::QueueNew {
        queue: queue.to_string(),
        origin: QueueOrigin::Smtpd,
    })
}

fn parse_cleanup(rest: &str) -> Result<Payload, ParseError> {
    let (queue, attributes) = split_queue_prefix(rest).ok_or(ParseError::UnsupportedPayload)?;

    if let Some(value) = attributes.strip_prefix("message-id=") {
        return Ok(Payload::CleanupMessageId {
            queue: queue.to_string(),
            message_id: angle_bracketed(value).unwrap_or(value).to_string(),
        });
    }

    if let Some(value) = attributes.strip_prefix("info: header In-Reply-To: ") {
        let value = value.split(" from ").next().unwrap_or(value).trim();
        return Ok(Payload::CleanupReplyHeader {
            queue: queue.to_string(),
            in_reply_to: Some(angle_bracketed(value).unwrap_or(value).to_string()),
            references: vec![],
        });
    }

    if let Some(value) = attributes.strip_prefix("info: header References: ") {
        let value = value.split(" from ").next().unwrap_or(value).trim();
        let references = value
            .split_whitespace()
            .map(|r| angle_bracketed(r).unwrap_or(r).to_string())
            .collect();

        return Ok(Payload::CleanupReplyHeader {
            queue: queue.to_string(),
            in_reply_to: None,
            references,
        });
    }

    Err(ParseError::UnsupportedPayload)
}

fn parse_qmgr(rest: &str) -> Result<Payload, ParseError> {
    let (queue, attributes) = split_queue_prefix(rest).ok_or(ParseError::UnsupportedPayload)?;

    if attributes == "removed" {
        return Ok(Payload::QmgrRemoved {
            queue: queue.to_string(),
        });
    }

    let sender = attribute(attributes, "from")
        .and_then(angle_bracketed)
        .ok_or(ParseError::UnsupportedPayload)?;

    if attributes.contains("status=expired") {
        return Ok(Payload::QmgrExpired {
            queue: queue.to_string(),
            sender: sender.to_string(),
        });
    }

    let size = attribute(attributes, "size")
        .and_then(|v| v.parse().ok())
        .ok_or(ParseError::UnsupportedPayload)?;

    let nrcpt = attribute(attributes, "nrcpt")
        .and_then(|v| v.split(' ').next())
        .and_then(|v| v.parse().ok())
        .ok_or(ParseError::UnsupportedPayload)?;

    Ok(Payload::QmgrMessageAccepted {
        queue: queue.to_string(),
        sender: sender.to_string(),
        size,
        nrcpt,
    })
}

fn parse_delivery(rest: &str, agent: DeliveredTo) -> Result<Payload, ParseError> {
    let (queue, attributes) = split_queue_prefix(rest).ok_or(ParseError::UnsupportedPayload)?;

    let recipient = attribute(attributes, "to")
        .and_then(angle_bracketed)
        .ok_or(ParseError::UnsupportedPayload)?;

    let orig_recipient = attribute(attributes, "orig_to")
        .and_then(angle_bracketed)
        .map(str::to_string);

    let relay = attribute(attributes, "relay")
        .ok_or(ParseError::UnsupportedPayload)
        .map(parse_relay)?;

    let delay = attribute(attributes, "delay")
        .and_then(|v| v.parse().ok())
        .ok_or(ParseError::UnsupportedPayload)?;

    let dsn = attribute(attributes, "dsn")
        .ok_or(ParseError::UnsupportedPayload)?
        .to_string();

    let status = attribute(attributes, "status")
        .and_then(|v| v.split(' ').next())
        .and_then(|v| v.parse::<SmtpStatus>().ok())
        .filter(|s| matches!(s, SmtpStatus::Sent | SmtpStatus::Deferred | SmtpStatus::Bounced))
        .ok_or(ParseError::UnsupportedPayload)?;

    Ok(Payload::SmtpDelivery {
        queue: queue.to_string(),
        recipient: recipient.to_string(),
        orig_recipient,
        relay,
        delay,
        dsn,
        status,
        agent,
    })
}

fn parse_bounce(rest: &str) -> Result<Payload, ParseError> {
    let (queue, attributes) = split_queue_prefix(rest).ok_or(ParseError::UnsupportedPayload)?;

    let child = attributes
        .strip_prefix("sender non-delivery notification: ")
        .filter(|c| is_queue_id(c))
        .ok_or(ParseError::UnsupportedPayload)?;

    Ok(Payload::BounceCreated {
        queue: queue.to_string(),
        child_queue: child.to_string(),
    })
}

/// Parse the payload of a line whose header was already parsed.
///
/// `rest` is the line content past the header, i.e. `line[payload_offset..]`.
///
/// # Errors
///
/// [`ParseError::UnsupportedProcess`] / [`ParseError::UnsupportedPayload`]
/// for lines we deliberately do not track. Both are recoverable.
pub fn parse_payload(header: &Header, rest: &str) -> Result<Payload, ParseError> {
    if header.process != "postfix" {
        return Err(ParseError::UnsupportedProcess {
            process: header.process.clone(),
        });
    }

    let daemon = header.daemon.as_deref().ok_or(ParseError::UnsupportedPayload)?;

    match daemon {
        "pickup" => parse_pickup(rest),
        "smtpd" => parse_smtpd(rest),
        "cleanup" => parse_cleanup(rest),
        "qmgr" => parse_qmgr(rest),
        "bounce" => parse_bounce(rest),
        _ => DeliveredTo::from_daemon(daemon)
            .ok_or(ParseError::UnsupportedPayload)
            .and_then(|agent| parse_delivery(rest, agent)),
    }
}
