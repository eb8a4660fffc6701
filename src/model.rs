//! Data model (spec §3): block headers, transactions, receipts, logs,
//! and the ingest-side event wrappers the subscribers produce.
//!
//! Field shapes follow the wire conventions of
//! `newheads-evm-provider::ethereum::EthBlockHeader` (hex-string
//! quantities, optional fields for chain features that not every
//! EVM chain carries).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::amount::{parse_hex_u64, Amount};

/// Block header as delivered by `eth_subscribe(["newHeads"])` or
/// `eth_getBlockByNumber`/`eth_getBlockByHash`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BlockHeader {
    pub number: u64,
    pub hash: String,
    pub parent_hash: String,
    pub timestamp: u64,
    pub miner: Option<String>,
    pub difficulty: Option<String>,
    pub gas_limit: Option<u64>,
    pub gas_used: Option<u64>,
    pub base_fee_per_gas: Option<String>,
    pub extra_data: Option<String>,
}

/// Raw wire shape of a block header, as it arrives from the node
/// (everything numeric is a hex string). Kept distinct from
/// [`BlockHeader`] so parsing failures are localized to one
/// `TryFrom` conversion.
#[derive(Debug, Clone, Deserialize)]
pub struct RawBlockHeader {
    pub number: String,
    pub hash: String,
    #[serde(rename = "parentHash")]
    pub parent_hash: String,
    pub timestamp: String,
    pub miner: Option<String>,
    pub difficulty: Option<String>,
    #[serde(rename = "gasLimit")]
    pub gas_limit: Option<String>,
    #[serde(rename = "gasUsed")]
    pub gas_used: Option<String>,
    #[serde(rename = "baseFeePerGas")]
    pub base_fee_per_gas: Option<String>,
    #[serde(rename = "extraData")]
    pub extra_data: Option<String>,
}

impl TryFrom<RawBlockHeader> for BlockHeader {
    type Error = crate::amount::ParseAmountError;

    fn try_from(raw: RawBlockHeader) -> Result<Self, Self::Error> {
        Ok(BlockHeader {
            number: parse_hex_u64(&raw.number)?,
            hash: raw.hash,
            parent_hash: raw.parent_hash,
            timestamp: parse_hex_u64(&raw.timestamp)?,
            miner: raw.miner,
            difficulty: raw.difficulty,
            gas_limit: raw
                .gas_limit
                .as_deref()
                .map(parse_hex_u64)
                .transpose()?,
            gas_used: raw.gas_used.as_deref().map(parse_hex_u64).transpose()?,
            base_fee_per_gas: raw.base_fee_per_gas,
            extra_data: raw.extra_data,
        })
    }
}

/// Dynamic-fee (EIP-1559) gas parameters; `None` for legacy transactions.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DynamicFee {
    pub max_fee_per_gas: Amount,
    pub max_priority_fee_per_gas: Amount,
}

/// Full transaction body.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Transaction {
    pub hash: String,
    pub from: String,
    /// `None` for contract-creation transactions.
    pub to: Option<String>,
    pub value: Amount,
    pub gas: u64,
    pub gas_price: Option<Amount>,
    pub dynamic_fee: Option<DynamicFee>,
    pub input: String,
    pub nonce: u64,
    pub block_number: Option<u64>,
    pub block_hash: Option<String>,
}

impl Transaction {
    /// The first four bytes of the input data, used for method-selector
    /// filter conditions. `None` for plain value transfers with empty
    /// input.
    pub fn method_selector(&self) -> Option<String> {
        let data = self.input.strip_prefix("0x").unwrap_or(&self.input);
        if data.len() >= 8 {
            Some(format!("0x{}", &data[..8]))
        } else {
            None
        }
    }
}

/// Raw wire shape of a transaction (everything numeric is hex).
#[derive(Debug, Clone, Deserialize)]
pub struct RawTransaction {
    pub hash: String,
    pub from: String,
    pub to: Option<String>,
    pub value: String,
    pub gas: String,
    #[serde(rename = "gasPrice")]
    pub gas_price: Option<String>,
    #[serde(rename = "maxFeePerGas")]
    pub max_fee_per_gas: Option<String>,
    #[serde(rename = "maxPriorityFeePerGas")]
    pub max_priority_fee_per_gas: Option<String>,
    pub input: String,
    pub nonce: String,
    #[serde(rename = "blockNumber")]
    pub block_number: Option<String>,
    #[serde(rename = "blockHash")]
    pub block_hash: Option<String>,
}

impl TryFrom<RawTransaction> for Transaction {
    type Error = crate::amount::ParseAmountError;

    fn try_from(raw: RawTransaction) -> Result<Self, Self::Error> {
        let dynamic_fee = match (raw.max_fee_per_gas, raw.max_priority_fee_per_gas) {
            (Some(max_fee), Some(max_priority)) => Some(DynamicFee {
                max_fee_per_gas: Amount::from_hex(&max_fee)?,
                max_priority_fee_per_gas: Amount::from_hex(&max_priority)?,
            }),
            _ => None,
        };
        Ok(Transaction {
            hash: raw.hash,
            from: raw.from,
            to: raw.to,
            value: Amount::from_hex(&raw.value)?,
            gas: parse_hex_u64(&raw.gas)?,
            gas_price: raw.gas_price.as_deref().map(Amount::from_hex).transpose()?,
            dynamic_fee,
            input: raw.input,
            nonce: parse_hex_u64(&raw.nonce)?,
            block_number: raw
                .block_number
                .as_deref()
                .map(parse_hex_u64)
                .transpose()?,
            block_hash: raw.block_hash,
        })
    }
}

/// Transaction receipt, fetched separately via `eth_getTransactionReceipt`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransactionReceipt {
    pub transaction_hash: String,
    pub block_number: u64,
    pub gas_used: u64,
    pub status: Option<bool>,
    pub logs: Vec<Log>,
}

/// Raw wire shape of a transaction receipt.
#[derive(Debug, Clone, Deserialize)]
pub struct RawTransactionReceipt {
    #[serde(rename = "transactionHash")]
    pub transaction_hash: String,
    #[serde(rename = "blockNumber")]
    pub block_number: String,
    #[serde(rename = "gasUsed")]
    pub gas_used: String,
    pub status: Option<String>,
    pub logs: Vec<RawLog>,
}

impl TryFrom<RawTransactionReceipt> for TransactionReceipt {
    type Error = crate::amount::ParseAmountError;

    fn try_from(raw: RawTransactionReceipt) -> Result<Self, Self::Error> {
        let status = raw
            .status
            .as_deref()
            .map(parse_hex_u64)
            .transpose()?
            .map(|v| v != 0);
        let logs = raw
            .logs
            .into_iter()
            .map(Log::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(TransactionReceipt {
            transaction_hash: raw.transaction_hash,
            block_number: parse_hex_u64(&raw.block_number)?,
            gas_used: parse_hex_u64(&raw.gas_used)?,
            status,
            logs,
        })
    }
}

/// An EVM log entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Log {
    pub address: String,
    pub topics: Vec<String>,
    pub data: String,
    pub block_number: Option<u64>,
    pub transaction_hash: Option<String>,
    pub log_index: Option<u64>,
}

/// Raw wire shape of a log entry.
#[derive(Debug, Clone, Deserialize)]
pub struct RawLog {
    pub address: String,
    pub topics: Vec<String>,
    pub data: String,
    #[serde(rename = "blockNumber")]
    pub block_number: Option<String>,
    #[serde(rename = "transactionHash")]
    pub transaction_hash: Option<String>,
    #[serde(rename = "logIndex")]
    pub log_index: Option<String>,
}

impl TryFrom<RawLog> for Log {
    type Error = crate::amount::ParseAmountError;

    fn try_from(raw: RawLog) -> Result<Self, Self::Error> {
        Ok(Log {
            address: raw.address,
            topics: raw.topics,
            data: raw.data,
            block_number: raw.block_number.as_deref().map(parse_hex_u64).transpose()?,
            transaction_hash: raw.transaction_hash,
            log_index: raw.log_index.as_deref().map(parse_hex_u64).transpose()?,
        })
    }
}

/// Source of a block event: always the live subscription for C7.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum BlockEventSource {
    Subscription,
}

/// Block event produced by the Block Subscriber (C7), carrying any
/// filter matches alongside the header.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockEvent {
    pub header: BlockHeader,
    pub matches: Vec<crate::filter::FilterMatch>,
    pub ingest_timestamp: DateTime<Utc>,
    pub source: BlockEventSource,
    pub processed: bool,
}

/// Where a transaction event originated (spec §3).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum TxEventSource {
    /// Delivered directly by a full-body subscription (Mode B).
    Subscription,
    /// Hash delivered by subscription, body fetched via the pool (Mode A).
    Fetch,
}

/// Transaction event produced by the Tx Subscriber (C8).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionEvent {
    pub hash: String,
    pub body: Option<Transaction>,
    pub matches: Vec<crate::filter::FilterMatch>,
    pub ingest_timestamp: DateTime<Utc>,
    pub source: TxEventSource,
    pub processed: bool,
    pub pending: bool,
}
