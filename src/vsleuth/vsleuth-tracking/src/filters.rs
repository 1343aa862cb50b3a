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
use anyhow::Context;
use vsleuth_common::delivery::{MessageDirection, TrackedDelivery};

/// Settings key the filter rules are stored under.
pub const SETTINGS_KEY: &str = "tracking";

/// Tracker settings as stored in the settings store.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct Settings {
    /// the filter rule set, applied in order.
    #[serde(default)]
    pub filters: FiltersDescription,
}

/// Uncompiled rule set, as configured by the operator.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct FiltersDescription(pub Vec<FilterDescription>);

/// One rule. Exactly one of the fields is expected to be set; a rule with
/// several set applies them all.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FilterDescription {
    /// outbound rows whose full sender matches are accepted; outbound
    /// rows that do not match are rejected.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accept_outbound_sender: Option<String>,

    /// inbound rows whose full recipient matches are accepted; inbound
    /// rows that do not match are rejected.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accept_inbound_recipient: Option<String>,

    /// inbound rows whose full recipient matches are rejected.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reject_inbound_recipient: Option<String>,

    /// outbound rows whose message-id matches are accepted; outbound rows
    /// without a matching (or any) message-id are rejected.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accept_outbound_message_id: Option<String>,

    /// inbound replies whose `In-Reply-To`/`References` match are
    /// accepted; inbound replies pointing elsewhere are rejected.
    /// Non-replies pass.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accept_in_reply_to: Option<String>,
}

enum Verdict {
    Accept,
    Reject,
    Pass,
}

enum CompiledRule {
    AcceptOutboundSender(regex::Regex),
    AcceptInboundRecipient(regex::Regex),
    RejectInboundRecipient(regex::Regex),
    AcceptOutboundMessageId(regex::Regex),
    AcceptInReplyTo(regex::Regex),
}

fn full_address(local: &str, domain: &str) -> String {
    format!("{local}@{domain}")
}

impl CompiledRule {
    fn evaluate(&self, delivery: &TrackedDelivery) -> Verdict {
        match self {
            Self::AcceptOutboundSender(re) => {
                if delivery.direction != MessageDirection::Outbound {
                    return Verdict::Pass;
                }

                if re.is_match(&full_address(&delivery.sender_local, &delivery.sender_domain)) {
                    Verdict::Accept
                } else {
                    Verdict::Reject
                }
            }
            Self::AcceptInboundRecipient(re) => {
                if delivery.direction != MessageDirection::Incoming {
                    return Verdict::Pass;
                }

                if re.is_match(&full_address(
                    &delivery.recipient_local,
                    &delivery.recipient_domain,
                )) {
                    Verdict::Accept
                } else {
                    Verdict::Reject
                }
            }
            Self::RejectInboundRecipient(re) => {
                if delivery.direction == MessageDirection::Incoming
                    && re.is_match(&full_address(
                        &delivery.recipient_local,
                        &delivery.recipient_domain,
                    ))
                {
                    Verdict::Reject
                } else {
                    Verdict::Pass
                }
            }
            Self::AcceptOutboundMessageId(re) => {
                if delivery.direction != MessageDirection::Outbound {
                    return Verdict::Pass;
                }

                if !delivery.message_id.is_empty() && re.is_match(&delivery.message_id) {
                    Verdict::Accept
                } else {
                    Verdict::Reject
                }
            }
            Self::AcceptInReplyTo(re) => {
                if delivery.direction != MessageDirection::Incoming {
                    return Verdict::Pass;
                }

                let mut referenced = delivery
                    .in_reply_to
                    .iter()
                    .chain(delivery.references.iter())
                    .peekable();

                if referenced.peek().is_none() {
                    // not a reply at all, nothing to decide
                    return Verdict::Pass;
                }

                if referenced.any(|value| re.is_match(value)) {
                    Verdict::Accept
                } else {
                    Verdict::Reject
                }
            }
        }
    }
}

/// A compiled, ordered rule set over tracked delivery rows.
///
/// The first decisive rule wins; a row no rule decides on is accepted.
#[derive(Default)]
pub struct Filters(Vec<CompiledRule>);

impl Filters {
    /// The rule set that accepts everything.
    #[must_use]
    pub const fn none() -> Self {
        Self(Vec::new())
    }

    /// Compile a rule description.
    ///
    /// # Errors
    ///
    /// * a rule carries an invalid regular expression
    pub fn build(description: &FiltersDescription) -> anyhow::Result<Self> {
        let mut rules = Vec::new();

        let compile = |pattern: &str| {
            regex::Regex::new(pattern).context(format!("invalid filter pattern '{pattern}'"))
        };

        for rule in &description.0 {
            if let Some(pattern) = &rule.accept_outbound_sender {
                rules.push(CompiledRule::AcceptOutboundSender(compile(pattern)?));
            }
            if let Some(pattern) = &rule.accept_inbound_recipient {
                rules.push(CompiledRule::AcceptInboundRecipient(compile(pattern)?));
            }
            if let Some(pattern) = &rule.reject_inbound_recipient {
                rules.push(CompiledRule::RejectInboundRecipient(compile(pattern)?));
            }
            if let Some(pattern) = &rule.accept_outbound_message_id {
                rules.push(CompiledRule::AcceptOutboundMessageId(compile(pattern)?));
            }
            if let Some(pattern) = &rule.accept_in_reply_to {
                rules.push(CompiledRule::AcceptInReplyTo(compile(pattern)?));
            }
        }

        Ok(Self(rules))
    }

    /// Should this row be kept out of the store?
    #[must_use]
    pub fn reject(&self, delivery: &TrackedDelivery) -> bool {
        for rule in &self.0 {
            match rule.evaluate(delivery) {
                Verdict::Accept => return false,
                Verdict::Reject => return true,
                Verdict::Pass => {}
            }
        }

        false
    }
}
