//! Rule-based event filter (C6, spec §4.6).
//!
//! Rules are stored in an unordered map keyed by rule id so
//! add/replace/remove are O(1) and replacing an existing id is naturally
//! atomic. Evaluation walks every enabled rule once per event; no
//! indexing by condition kind, since spec §4.6 expects rule counts in
//! the dozens-to-hundreds range, not the kind of scale that would need a
//! secondary index. Field shapes echo
//! `alert-runtime-common::evaluation_context::EvaluationTxV1` (the
//! closest thing the corpus has to "fields an event-matching rule reads
//! off a transaction"), generalized from one fixed struct into a
//! kind-driven getter.

use std::str::FromStr;

use dashmap::DashMap;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::amount::Amount;
use crate::error::FilterError;
use crate::model::{BlockHeader, Transaction, TransactionReceipt};

/// What part of an event a condition reads.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum ConditionKind {
    Address,
    Value,
    GasPrice,
    GasUsed,
    BlockNumber,
    Topic,
    Method,
    Contract,
}

impl FromStr for ConditionKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "address" => Ok(Self::Address),
            "value" => Ok(Self::Value),
            "gasPrice" => Ok(Self::GasPrice),
            "gasUsed" => Ok(Self::GasUsed),
            "blockNumber" => Ok(Self::BlockNumber),
            "topic" => Ok(Self::Topic),
            "method" => Ok(Self::Method),
            "contract" => Ok(Self::Contract),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum Operator {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    Contains,
    StartsWith,
    EndsWith,
    Regex,
    In,
    NotIn,
}

impl FromStr for Operator {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "eq" => Ok(Self::Eq),
            "ne" => Ok(Self::Ne),
            "gt" => Ok(Self::Gt),
            "gte" => Ok(Self::Gte),
            "lt" => Ok(Self::Lt),
            "lte" => Ok(Self::Lte),
            "contains" => Ok(Self::Contains),
            "startsWith" => Ok(Self::StartsWith),
            "endsWith" => Ok(Self::EndsWith),
            "regex" => Ok(Self::Regex),
            "in" => Ok(Self::In),
            "notIn" => Ok(Self::NotIn),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum RuleLogic {
    And,
    Or,
}

/// One condition within a rule: a field to read, an operator, and a
/// literal to compare against. Literals are always strings, per spec
/// §4.6, so numeric comparisons preserve arbitrary precision.
#[derive(Debug, Clone)]
pub struct Condition {
    pub kind: ConditionKind,
    pub operator: Operator,
    pub value: String,
}

/// A named, prioritized, mutable filter rule.
#[derive(Debug, Clone)]
pub struct FilterRule {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub enabled: bool,
    pub priority: i64,
    pub logic: RuleLogic,
    pub conditions: Vec<Condition>,
}

impl FilterRule {
    fn validate(&self) -> Result<(), FilterError> {
        if self.id.is_empty() {
            return Err(FilterError::InvalidRule {
                rule_id: self.id.clone(),
                reason: "rule id must not be empty".to_string(),
            });
        }
        if self.conditions.is_empty() {
            return Err(FilterError::InvalidRule {
                rule_id: self.id.clone(),
                reason: "rule must have at least one condition".to_string(),
            });
        }
        Ok(())
    }
}

/// Wire shape of a rule, as consumed from external rule loaders (spec §6).
#[derive(Debug, Clone, Deserialize)]
pub struct RawCondition {
    #[serde(rename = "type")]
    pub kind: String,
    pub operator: String,
    pub value: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawFilterRule {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub enabled: bool,
    pub priority: i64,
    pub logic: String,
    pub conditions: Vec<RawCondition>,
}

impl TryFrom<RawFilterRule> for FilterRule {
    type Error = FilterError;

    fn try_from(raw: RawFilterRule) -> Result<Self, Self::Error> {
        let logic = match raw.logic.as_str() {
            "AND" => RuleLogic::And,
            "OR" => RuleLogic::Or,
            other => {
                return Err(FilterError::InvalidRule {
                    rule_id: raw.id.clone(),
                    reason: format!("unknown logic {}", other),
                })
            }
        };
        let conditions = raw
            .conditions
            .into_iter()
            .map(|c| {
                let kind = ConditionKind::from_str(&c.kind).map_err(|_| {
                    FilterError::UnknownConditionKind {
                        rule_id: raw.id.clone(),
                        kind: c.kind.clone(),
                    }
                })?;
                let operator = Operator::from_str(&c.operator).map_err(|_| {
                    FilterError::UnknownOperator {
                        rule_id: raw.id.clone(),
                        operator: c.operator.clone(),
                    }
                })?;
                Ok(Condition {
                    kind,
                    operator,
                    value: c.value,
                })
            })
            .collect::<Result<Vec<_>, FilterError>>()?;

        let rule = FilterRule {
            id: raw.id,
            name: raw.name,
            description: raw.description,
            enabled: raw.enabled,
            priority: raw.priority,
            logic,
            conditions,
        };
        rule.validate()?;
        Ok(rule)
    }
}

/// Which conditions within a matched rule actually fired; useful for
/// diagnostics and for handlers that want to know why they were called.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchedCondition {
    pub kind: String,
    pub operator: String,
}

/// A rule that matched an event (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterMatch {
    pub rule_id: String,
    pub rule_name: String,
    pub priority: i64,
    pub matched_conditions: Vec<MatchedCondition>,
}

/// Field values a single event exposes to condition evaluation. Built
/// once per event, reused across every rule, since pulling effective gas
/// price etc. can be mildly expensive (spec §4.6 getters).
struct EventFields<'a> {
    address: Option<&'a str>,
    value: Option<Amount>,
    gas_price: Option<Amount>,
    gas_used: Option<Amount>,
    block_number: Option<u64>,
    topics: Vec<String>,
    method: Option<String>,
    contract: Option<&'a str>,
}

impl<'a> EventFields<'a> {
    fn from_block(header: &'a BlockHeader) -> Self {
        Self {
            address: header.miner.as_deref(),
            value: None,
            gas_price: None,
            gas_used: header.gas_used.map(Amount::from_u64),
            block_number: Some(header.number),
            topics: Vec::new(),
            method: None,
            contract: None,
        }
    }

    fn from_transaction(
        tx: &'a Transaction,
        receipt: Option<&'a TransactionReceipt>,
        base_fee_per_gas: Option<&Amount>,
    ) -> Self {
        let gas_price = effective_gas_price(tx, base_fee_per_gas);
        let gas_used = receipt
            .map(|r| Amount::from_u64(r.gas_used))
            .or_else(|| Some(Amount::zero()));
        let topics = receipt
            .map(|r| r.logs.iter().flat_map(|l| l.topics.clone()).collect())
            .unwrap_or_default();
        Self {
            address: tx.to.as_deref(),
            value: Some(tx.value.clone()),
            gas_price,
            gas_used,
            block_number: tx.block_number,
            topics,
            method: tx.method_selector(),
            contract: tx.to.as_deref(),
        }
    }
}

/// `gasPrice` getter per spec §4.6: for dynamic-fee transactions,
/// `min(maxFeePerGas, baseFee + maxPriorityFeePerGas)`. `Transaction`
/// doesn't carry its enclosing block's base fee, so callers with block
/// context (§4.6: `gasPrice` is evaluated against a transaction within a
/// block) thread it through here; with no base fee in context this
/// falls back to `min(maxFeePerGas, maxPriorityFeePerGas)` rather than
/// the fee cap alone, since the cap is the one value `baseFee + tip` is
/// never greater than. Legacy transactions use `gas_price` directly.
fn effective_gas_price(tx: &Transaction, base_fee_per_gas: Option<&Amount>) -> Option<Amount> {
    if let Some(fee) = &tx.dynamic_fee {
        let tip = fee.max_priority_fee_per_gas.clone();
        let capped_tip = match base_fee_per_gas {
            Some(base) => base.add(&tip),
            None => tip,
        };
        Some(
            if fee.max_fee_per_gas.cmp_amount(&capped_tip) == std::cmp::Ordering::Less {
                fee.max_fee_per_gas.clone()
            } else {
                capped_tip
            },
        )
    } else {
        tx.gas_price.clone()
    }
}

fn matches_numeric(amount: Option<&Amount>, op: Operator, literal: &str) -> bool {
    let Some(amount) = amount else { return false };
    let Ok(literal) = Amount::from_str_flexible(literal) else {
        return false;
    };
    use std::cmp::Ordering::*;
    let ord = amount.cmp_amount(&literal);
    match op {
        Operator::Eq => ord == Equal,
        Operator::Ne => ord != Equal,
        Operator::Gt => ord == Greater,
        Operator::Gte => ord != Less,
        Operator::Lt => ord == Less,
        Operator::Lte => ord != Greater,
        _ => false,
    }
}

fn matches_string(field: Option<&str>, op: Operator, literal: &str) -> bool {
    let Some(field) = field else { return false };
    let field_lc = field.to_lowercase();
    let literal_lc = literal.to_lowercase();
    match op {
        Operator::Eq => field_lc == literal_lc,
        Operator::Ne => field_lc != literal_lc,
        Operator::Contains => field_lc.contains(&literal_lc),
        Operator::StartsWith => field_lc.starts_with(&literal_lc),
        Operator::EndsWith => field_lc.ends_with(&literal_lc),
        Operator::Regex => Regex::new(literal)
            .map(|re| re.is_match(field))
            .unwrap_or(false),
        Operator::In => literal.split(',').any(|v| v.trim().to_lowercase() == field_lc),
        Operator::NotIn => !literal.split(',').any(|v| v.trim().to_lowercase() == field_lc),
        _ => false,
    }
}

fn matches_topics(topics: &[String], op: Operator, literal: &str) -> bool {
    let literal_lc = literal.to_lowercase();
    match op {
        Operator::Eq | Operator::Contains | Operator::In => {
            topics.iter().any(|t| t.to_lowercase() == literal_lc)
        }
        Operator::Ne | Operator::NotIn => topics.iter().all(|t| t.to_lowercase() != literal_lc),
        _ => false,
    }
}

fn evaluate_condition(fields: &EventFields<'_>, cond: &Condition) -> bool {
    match cond.kind {
        ConditionKind::Address => matches_string(fields.address, cond.operator, &cond.value),
        ConditionKind::Value => matches_numeric(fields.value.as_ref(), cond.operator, &cond.value),
        ConditionKind::GasPrice => {
            matches_numeric(fields.gas_price.as_ref(), cond.operator, &cond.value)
        }
        ConditionKind::GasUsed => {
            matches_numeric(fields.gas_used.as_ref(), cond.operator, &cond.value)
        }
        ConditionKind::BlockNumber => match fields.block_number {
            Some(n) => matches_numeric(Some(&Amount::from_u64(n)), cond.operator, &cond.value),
            None => false,
        },
        ConditionKind::Topic => matches_topics(&fields.topics, cond.operator, &cond.value),
        ConditionKind::Method => matches_string(fields.method.as_deref(), cond.operator, &cond.value),
        ConditionKind::Contract => matches_string(fields.contract, cond.operator, &cond.value),
    }
}

fn evaluate_rule(rule: &FilterRule, fields: &EventFields<'_>) -> Option<FilterMatch> {
    if !rule.enabled {
        return None;
    }
    let mut matched = Vec::new();
    for cond in &rule.conditions {
        if evaluate_condition(fields, cond) {
            matched.push(MatchedCondition {
                kind: format!("{:?}", cond.kind),
                operator: format!("{:?}", cond.operator),
            });
        }
    }

    let fires = match rule.logic {
        RuleLogic::And => matched.len() == rule.conditions.len(),
        RuleLogic::Or => !matched.is_empty(),
    };

    fires.then(|| FilterMatch {
        rule_id: rule.id.clone(),
        rule_name: rule.name.clone(),
        priority: rule.priority,
        matched_conditions: matched,
    })
}

/// The rule store plus evaluation entry points (spec §4.6).
pub struct EventFilter {
    rules: DashMap<String, FilterRule>,
}

impl EventFilter {
    pub fn new() -> Self {
        Self {
            rules: DashMap::new(),
        }
    }

    /// Add or atomically replace a rule by id.
    pub fn add_rule(&self, rule: FilterRule) -> Result<(), FilterError> {
        rule.validate()?;
        self.rules.insert(rule.id.clone(), rule);
        Ok(())
    }

    pub fn remove_rule(&self, rule_id: &str) -> bool {
        self.rules.remove(rule_id).is_some()
    }

    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }

    fn sort_matches(mut matches: Vec<FilterMatch>) -> Vec<FilterMatch> {
        matches.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.rule_id.cmp(&b.rule_id)));
        matches
    }

    pub fn filter_block(&self, header: &BlockHeader) -> Vec<FilterMatch> {
        let fields = EventFields::from_block(header);
        let matches = self
            .rules
            .iter()
            .filter_map(|entry| evaluate_rule(entry.value(), &fields))
            .collect();
        Self::sort_matches(matches)
    }

    pub fn filter_transaction(
        &self,
        tx: &Transaction,
        receipt: Option<&TransactionReceipt>,
        base_fee_per_gas: Option<&Amount>,
    ) -> Vec<FilterMatch> {
        let fields = EventFields::from_transaction(tx, receipt, base_fee_per_gas);
        let matches = self
            .rules
            .iter()
            .filter_map(|entry| evaluate_rule(entry.value(), &fields))
            .collect();
        Self::sort_matches(matches)
    }
}

impl Default for EventFilter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(id: &str, priority: i64, logic: RuleLogic, conditions: Vec<Condition>) -> FilterRule {
        FilterRule {
            id: id.to_string(),
            name: id.to_string(),
            description: None,
            enabled: true,
            priority,
            logic,
            conditions,
        }
    }

    fn sample_tx(value: u64) -> Transaction {
        Transaction {
            hash: "0x1".to_string(),
            from: "0xfrom".to_string(),
            to: Some("0xDeaDBeef".to_string()),
            value: Amount::from_u64(value),
            gas: 21000,
            gas_price: Some(Amount::from_u64(1_000_000_000)),
            dynamic_fee: None,
            input: "0xa9059cbb0000".to_string(),
            nonce: 0,
            block_number: Some(10),
            block_hash: None,
        }
    }

    #[test]
    fn add_rule_rejects_empty_conditions() {
        let filter = EventFilter::new();
        let result = filter.add_rule(rule("r1", 1, RuleLogic::And, vec![]));
        assert!(result.is_err());
    }

    #[test]
    fn replacing_existing_id_is_atomic_overwrite() {
        let filter = EventFilter::new();
        filter
            .add_rule(rule(
                "r1",
                1,
                RuleLogic::And,
                vec![Condition {
                    kind: ConditionKind::Value,
                    operator: Operator::Gte,
                    value: "0".to_string(),
                }],
            ))
            .unwrap();
        assert_eq!(filter.rule_count(), 1);
        filter
            .add_rule(rule(
                "r1",
                5,
                RuleLogic::And,
                vec![Condition {
                    kind: ConditionKind::Value,
                    operator: Operator::Gte,
                    value: "0".to_string(),
                }],
            ))
            .unwrap();
        assert_eq!(filter.rule_count(), 1);
    }

    #[test]
    fn and_logic_requires_every_condition() {
        let filter = EventFilter::new();
        filter
            .add_rule(rule(
                "big-transfer-to-addr",
                10,
                RuleLogic::And,
                vec![
                    Condition {
                        kind: ConditionKind::Value,
                        operator: Operator::Gt,
                        value: "100".to_string(),
                    },
                    Condition {
                        kind: ConditionKind::Address,
                        operator: Operator::Eq,
                        value: "0xdeadbeef".to_string(),
                    },
                ],
            ))
            .unwrap();

        let matches = filter.filter_transaction(&sample_tx(50), None, None);
        assert!(matches.is_empty());

        let matches = filter.filter_transaction(&sample_tx(500), None, None);
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].rule_id, "big-transfer-to-addr");
    }

    #[test]
    fn matches_sorted_by_priority_then_rule_id() {
        let filter = EventFilter::new();
        for (id, priority) in [("z", 5), ("a", 1), ("b", 1)] {
            filter
                .add_rule(rule(
                    id,
                    priority,
                    RuleLogic::Or,
                    vec![Condition {
                        kind: ConditionKind::Value,
                        operator: Operator::Gte,
                        value: "0".to_string(),
                    }],
                ))
                .unwrap();
        }
        let matches = filter.filter_transaction(&sample_tx(1), None, None);
        let ids: Vec<&str> = matches.iter().map(|m| m.rule_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "z"]);
    }

    #[test]
    fn missing_field_evaluates_false_not_error() {
        let filter = EventFilter::new();
        filter
            .add_rule(rule(
                "topic-rule",
                1,
                RuleLogic::And,
                vec![Condition {
                    kind: ConditionKind::Topic,
                    operator: Operator::Eq,
                    value: "0xsometopic".to_string(),
                }],
            ))
            .unwrap();
        let matches = filter.filter_transaction(&sample_tx(1), None, None);
        assert!(matches.is_empty());
    }

    #[test]
    fn raw_rule_rejects_unknown_operator() {
        let raw = RawFilterRule {
            id: "r1".to_string(),
            name: "r1".to_string(),
            description: None,
            enabled: true,
            priority: 1,
            logic: "AND".to_string(),
            conditions: vec![RawCondition {
                kind: "value".to_string(),
                operator: "fuzzy".to_string(),
                value: "1".to_string(),
            }],
        };
        let result = FilterRule::try_from(raw);
        assert!(matches!(result, Err(FilterError::UnknownOperator { .. })));
    }

    fn dynamic_fee_tx(max_fee: u64, max_priority_fee: u64) -> Transaction {
        Transaction {
            dynamic_fee: Some(crate::model::DynamicFee {
                max_fee_per_gas: Amount::from_u64(max_fee),
                max_priority_fee_per_gas: Amount::from_u64(max_priority_fee),
            }),
            gas_price: None,
            ..sample_tx(1)
        }
    }

    #[test]
    fn effective_gas_price_uses_base_fee_plus_tip_when_below_cap() {
        let tx = dynamic_fee_tx(100, 5);
        let base_fee = Amount::from_u64(50);
        let gas_price = effective_gas_price(&tx, Some(&base_fee)).unwrap();
        assert_eq!(gas_price, Amount::from_u64(55));
    }

    #[test]
    fn effective_gas_price_caps_at_fee_cap() {
        let tx = dynamic_fee_tx(60, 5);
        let base_fee = Amount::from_u64(100);
        let gas_price = effective_gas_price(&tx, Some(&base_fee)).unwrap();
        assert_eq!(gas_price, Amount::from_u64(60));
    }

    #[test]
    fn effective_gas_price_without_base_fee_falls_back_to_tip_not_cap() {
        let tx = dynamic_fee_tx(100, 5);
        let gas_price = effective_gas_price(&tx, None).unwrap();
        assert_eq!(gas_price, Amount::from_u64(5));
    }

    #[test]
    fn effective_gas_price_legacy_tx_uses_gas_price() {
        let tx = sample_tx(1);
        let gas_price = effective_gas_price(&tx, None).unwrap();
        assert_eq!(gas_price, Amount::from_u64(1_000_000_000));
    }
}
