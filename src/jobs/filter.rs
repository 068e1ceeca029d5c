//! Composable filter predicates over raw chain items.
//!
//! A [`FilterSpec`] is evaluated per transaction together with the logs that
//! transaction emitted. The topic form can also be lowered to the
//! `eth_getLogs` wire filter so the node does the first pass.

use std::collections::BTreeSet;

use alloy::primitives::{Address, B256};
use serde::{Deserialize, Serialize};

use crate::domain::{LogRecord, TransactionRecord};
use crate::rpc::LogFilterWire;

/// Matches logs by emitting address and topic0.
///
/// An empty list matches anything in that position.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicFilter {
    /// Emitting contracts
    pub addresses: Vec<Address>,
    /// Accepted topic0 values (event signatures)
    pub topics: Vec<B256>,
}

impl TopicFilter {
    /// Whether a single log matches.
    #[must_use]
    pub fn matches_log(&self, log: &LogRecord) -> bool {
        let address_ok = self.addresses.is_empty() || self.addresses.contains(&log.address);
        let topic_ok = self.topics.is_empty()
            || log
                .topics
                .first()
                .is_some_and(|topic0| self.topics.contains(topic0));
        address_ok && topic_ok
    }
}

/// Matches transactions by sender and recipient.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionFilter {
    /// Accepted senders; empty means any
    pub from: Vec<Address>,
    /// Accepted recipients; empty means any
    pub to: Vec<Address>,
}

impl TransactionFilter {
    /// Whether a transaction matches.
    #[must_use]
    pub fn matches_transaction(&self, tx: &TransactionRecord) -> bool {
        let from_ok = self.from.is_empty() || self.from.contains(&tx.from);
        let to_ok = self.to.is_empty() || tx.to.is_some_and(|to| self.to.contains(&to));
        from_ok && to_ok
    }
}

/// Boolean filter over (transaction, emitted logs).
///
/// # Example
///
/// ```
/// use alloy::primitives::{Address, B256};
/// use eth_stream_etl::jobs::filter::{FilterSpec, TopicFilter};
///
/// let pool = Address::repeat_byte(0x11);
/// let swap = B256::repeat_byte(0x22);
/// let spec = FilterSpec::Topics(TopicFilter { addresses: vec![pool], topics: vec![swap] });
///
/// let wire = spec.to_wire().unwrap();
/// assert_eq!(wire.address, vec![pool]);
/// assert_eq!(wire.topics, vec![vec![swap]]);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterSpec {
    /// The transaction emitted at least one matching log
    Topics(TopicFilter),
    /// The transaction's sender/recipient match
    Transactions(TransactionFilter),
    /// All inner specs match
    And(Vec<FilterSpec>),
    /// Any inner spec matches
    Or(Vec<FilterSpec>),
    /// The inner spec does not match
    Not(Box<FilterSpec>),
}

impl FilterSpec {
    /// Evaluate against a transaction and the logs it emitted.
    #[must_use]
    pub fn matches(&self, tx: &TransactionRecord, logs: &[LogRecord]) -> bool {
        match self {
            Self::Topics(filter) => logs.iter().any(|log| filter.matches_log(log)),
            Self::Transactions(filter) => filter.matches_transaction(tx),
            Self::And(specs) => specs.iter().all(|s| s.matches(tx, logs)),
            Self::Or(specs) => specs.iter().any(|s| s.matches(tx, logs)),
            Self::Not(spec) => !spec.matches(tx, logs),
        }
    }

    /// Evaluate against a single log, without its transaction.
    ///
    /// Transaction-level parts cannot be decided from a log alone and are
    /// treated as matching, so the result is a superset.
    #[must_use]
    pub fn matches_log(&self, log: &LogRecord) -> bool {
        match self {
            Self::Topics(filter) => filter.matches_log(log),
            Self::Transactions(_) | Self::Not(_) => true,
            Self::And(specs) => specs.iter().all(|s| s.matches_log(log)),
            Self::Or(specs) => specs.iter().any(|s| s.matches_log(log)),
        }
    }

    /// OR-combine several specs, flattening nested `Or`s.
    #[must_use]
    pub fn any_of(specs: Vec<Self>) -> Option<Self> {
        let mut flat = Vec::with_capacity(specs.len());
        for spec in specs {
            match spec {
                Self::Or(inner) => flat.extend(inner),
                other => flat.push(other),
            }
        }
        match flat.len() {
            0 => None,
            1 => flat.pop(),
            _ => Some(Self::Or(flat)),
        }
    }

    /// Lower to the `eth_getLogs` wire filter, if expressible.
    ///
    /// The wire form may match more than the spec (unions lose the pairing
    /// between address and topic); callers re-check with
    /// [`matches`](Self::matches). Returns `None` when the node cannot
    /// pre-filter, e.g. for transaction-level or negated specs.
    #[must_use]
    pub fn to_wire(&self) -> Option<LogFilterWire> {
        let mut addresses = BTreeSet::new();
        let mut topics = BTreeSet::new();
        let mut any_address = false;
        let mut any_topic = false;

        let parts: Vec<&TopicFilter> = match self {
            Self::Topics(filter) => vec![filter],
            Self::Or(specs) => specs
                .iter()
                .map(|spec| match spec {
                    Self::Topics(filter) => Some(filter),
                    _ => None,
                })
                .collect::<Option<Vec<_>>>()?,
            _ => return None,
        };

        for part in parts {
            any_address |= part.addresses.is_empty();
            any_topic |= part.topics.is_empty();
            addresses.extend(part.addresses.iter().copied());
            topics.extend(part.topics.iter().copied());
        }

        Some(LogFilterWire {
            address: if any_address {
                Vec::new()
            } else {
                addresses.into_iter().collect()
            },
            topics: if any_topic {
                Vec::new()
            } else {
                vec![topics.into_iter().collect()]
            },
        })
    }
}
