// Copyright (C) 2025 Bilinear Labs - All Rights Reserved

//! Bindings of the VouchieVault contract.
//!
//! # Description
//!
//! Raw logs are decoded once, at the boundary of the indexer, into an [IndexedEvent]. The rest of the crate only
//! deals with these typed objects, never with topics or ABI encoded data.

use crate::model::ActivityType;
use alloy::{
    primitives::{Address, Bytes, U256},
    providers::Provider,
    rpc::types::{Log, TransactionInput, TransactionRequest},
    sol,
    sol_types::{SolCall, SolEvent},
};
use anyhow::{Context, Result};
use std::{future::Future, sync::Arc};
use tracing::warn;

sol! {
    #[sol(rpc)]
    contract VouchieVault {
        struct GoalInfo {
            address creator;
            uint256 stakeAmount;
            uint256 deadline;
            string description;
            bool isSolo;
            bool resolved;
            bool successful;
        }

        event GoalCreated(uint256 indexed goalId, address indexed creator, uint256 stakeAmount, uint256 deadline, bool isSolo);
        event GoalResolved(uint256 indexed goalId, bool successful, bool isSolo);
        event VoteCast(uint256 indexed goalId, address indexed voter, bool isValid);
        event FundsClaimed(uint256 indexed goalId, address indexed claimant, uint256 amount);
        event StreakFrozen(uint256 indexed goalId, uint256 newDeadline, uint256 feePaid);
        event BadgeClaimed(uint256 indexed goalId, address indexed creator);
        event GoalCanceled(uint256 indexed goalId, address indexed creator, uint256 refundAmount);

        function getGoal(uint256 goalId) external view returns (GoalInfo memory);
    }
}

/// Errors found while turning a log into an [IndexedEvent].
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("failed to decode {event}: {source}")]
    Abi {
        event: &'static str,
        #[source]
        source: alloy::sol_types::Error,
    },
    #[error("{field} of {event} does not fit in 64 bits: {value}")]
    Overflow {
        event: &'static str,
        field: &'static str,
        value: U256,
    },
}

/// Typed events of the VouchieVault contract.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContractEvent {
    GoalCreated {
        goal_id: u64,
        creator: Address,
        stake_amount: U256,
        deadline: u64,
        is_solo: bool,
    },
    GoalResolved {
        goal_id: u64,
        successful: bool,
        is_solo: bool,
    },
    VoteCast {
        goal_id: u64,
        voter: Address,
        is_valid: bool,
    },
    FundsClaimed {
        goal_id: u64,
        claimant: Address,
        amount: U256,
    },
    StreakFrozen {
        goal_id: u64,
        new_deadline: u64,
        fee_paid: U256,
    },
    BadgeClaimed {
        goal_id: u64,
        creator: Address,
    },
    GoalCanceled {
        goal_id: u64,
        creator: Address,
        refund_amount: U256,
    },
}

impl ContractEvent {
    /// Decodes the data of a log. Returns `None` when the log wasn't emitted by one of the known events.
    pub fn decode(log: &Log) -> Result<Option<Self>, DecodeError> {
        let Some(topic0) = log.topic0() else {
            return Ok(None);
        };
        let data = log.data();

        let selector = *topic0;

        let event = if selector == VouchieVault::GoalCreated::SIGNATURE_HASH {
            let event = VouchieVault::GoalCreated::decode_log_data(data)
                .map_err(|source| abi_error("GoalCreated", source))?;
            ContractEvent::GoalCreated {
                goal_id: narrow("GoalCreated", "goalId", event.goalId)?,
                creator: event.creator,
                stake_amount: event.stakeAmount,
                deadline: narrow("GoalCreated", "deadline", event.deadline)?,
                is_solo: event.isSolo,
            }
        } else if selector == VouchieVault::GoalResolved::SIGNATURE_HASH {
            let event = VouchieVault::GoalResolved::decode_log_data(data)
                .map_err(|source| abi_error("GoalResolved", source))?;
            ContractEvent::GoalResolved {
                goal_id: narrow("GoalResolved", "goalId", event.goalId)?,
                successful: event.successful,
                is_solo: event.isSolo,
            }
        } else if selector == VouchieVault::VoteCast::SIGNATURE_HASH {
            let event = VouchieVault::VoteCast::decode_log_data(data)
                .map_err(|source| abi_error("VoteCast", source))?;
            ContractEvent::VoteCast {
                goal_id: narrow("VoteCast", "goalId", event.goalId)?,
                voter: event.voter,
                is_valid: event.isValid,
            }
        } else if selector == VouchieVault::FundsClaimed::SIGNATURE_HASH {
            let event = VouchieVault::FundsClaimed::decode_log_data(data)
                .map_err(|source| abi_error("FundsClaimed", source))?;
            ContractEvent::FundsClaimed {
                goal_id: narrow("FundsClaimed", "goalId", event.goalId)?,
                claimant: event.claimant,
                amount: event.amount,
            }
        } else if selector == VouchieVault::StreakFrozen::SIGNATURE_HASH {
            let event = VouchieVault::StreakFrozen::decode_log_data(data)
                .map_err(|source| abi_error("StreakFrozen", source))?;
            ContractEvent::StreakFrozen {
                goal_id: narrow("StreakFrozen", "goalId", event.goalId)?,
                new_deadline: narrow("StreakFrozen", "newDeadline", event.newDeadline)?,
                fee_paid: event.feePaid,
            }
        } else if selector == VouchieVault::BadgeClaimed::SIGNATURE_HASH {
            let event = VouchieVault::BadgeClaimed::decode_log_data(data)
                .map_err(|source| abi_error("BadgeClaimed", source))?;
            ContractEvent::BadgeClaimed {
                goal_id: narrow("BadgeClaimed", "goalId", event.goalId)?,
                creator: event.creator,
            }
        } else if selector == VouchieVault::GoalCanceled::SIGNATURE_HASH {
            let event = VouchieVault::GoalCanceled::decode_log_data(data)
                .map_err(|source| abi_error("GoalCanceled", source))?;
            ContractEvent::GoalCanceled {
                goal_id: narrow("GoalCanceled", "goalId", event.goalId)?,
                creator: event.creator,
                refund_amount: event.refundAmount,
            }
        } else {
            return Ok(None);
        };

        Ok(Some(event))
    }

    pub fn goal_id(&self) -> u64 {
        match self {
            ContractEvent::GoalCreated { goal_id, .. }
            | ContractEvent::GoalResolved { goal_id, .. }
            | ContractEvent::VoteCast { goal_id, .. }
            | ContractEvent::FundsClaimed { goal_id, .. }
            | ContractEvent::StreakFrozen { goal_id, .. }
            | ContractEvent::BadgeClaimed { goal_id, .. }
            | ContractEvent::GoalCanceled { goal_id, .. } => *goal_id,
        }
    }

    pub fn activity_type(&self) -> ActivityType {
        match self {
            ContractEvent::GoalCreated { .. } => ActivityType::GoalCreated,
            ContractEvent::GoalResolved { .. } => ActivityType::GoalResolved,
            ContractEvent::VoteCast { .. } => ActivityType::VoteCast,
            ContractEvent::FundsClaimed { .. } => ActivityType::FundsClaimed,
            ContractEvent::StreakFrozen { .. } => ActivityType::StreakFrozen,
            ContractEvent::BadgeClaimed { .. } => ActivityType::BadgeClaimed,
            ContractEvent::GoalCanceled { .. } => ActivityType::GoalCanceled,
        }
    }
}

fn abi_error(event: &'static str, source: alloy::sol_types::Error) -> DecodeError {
    DecodeError::Abi { event, source }
}

fn narrow(event: &'static str, field: &'static str, value: U256) -> Result<u64, DecodeError> {
    if value > U256::from(u64::MAX) {
        return Err(DecodeError::Overflow {
            event,
            field,
            value,
        });
    }
    Ok(value.to::<u64>())
}

/// Position of an event occurrence in the chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventMeta {
    pub transaction_hash: String,
    pub log_index: u64,
    pub block_number: u64,
    pub block_timestamp: u64,
}

impl EventMeta {
    /// Extracts the metadata of a log. Pending logs don't carry it, and those are not indexed.
    pub fn from_log(log: &Log) -> Option<Self> {
        Some(Self {
            transaction_hash: log.transaction_hash?.to_string(),
            log_index: log.log_index?,
            block_number: log.block_number?,
            block_timestamp: log.block_timestamp?,
        })
    }
}

/// A decoded event along its position in the chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexedEvent {
    pub event: ContractEvent,
    pub meta: EventMeta,
}

impl IndexedEvent {
    /// Turns a raw log into an indexed event.
    ///
    /// # Description
    ///
    /// Removed logs, logs of unknown events and logs without block metadata are skipped, returning `None`.
    pub fn from_log(log: &Log) -> Result<Option<Self>, DecodeError> {
        if log.removed {
            warn!(
                "Skipping removed log {:?}-{:?}",
                log.transaction_hash, log.log_index
            );
            return Ok(None);
        }

        let Some(event) = ContractEvent::decode(log)? else {
            warn!(
                "Skipping log with unknown topic {:?} (tx: {:?})",
                log.topic0(),
                log.transaction_hash
            );
            return Ok(None);
        };

        let Some(meta) = EventMeta::from_log(log) else {
            warn!(
                "Skipping {} log without block metadata (tx: {:?})",
                event.activity_type(),
                log.transaction_hash
            );
            return Ok(None);
        };

        Ok(Some(Self { event, meta }))
    }
}

/// Source of the free-text description of a goal.
///
/// The creation event doesn't carry the description, so it is read from the contract state when the event is
/// handled.
pub trait GoalDescriptionSource: Send + Sync + 'static {
    fn goal_description(&self, goal_id: u64) -> impl Future<Output = Result<String>> + Send;
}

/// Reads descriptions through the `getGoal` view of the contract.
#[derive(Clone)]
pub struct ContractDescriptionSource {
    provider: Arc<dyn Provider + Send + Sync>,
    contract_address: Address,
}

impl ContractDescriptionSource {
    pub fn new(provider: Arc<dyn Provider + Send + Sync>, contract_address: Address) -> Self {
        Self {
            provider,
            contract_address,
        }
    }
}

impl GoalDescriptionSource for ContractDescriptionSource {
    async fn goal_description(&self, goal_id: u64) -> Result<String> {
        let call = VouchieVault::getGoalCall {
            goalId: U256::from(goal_id),
        };
        let request = TransactionRequest::default()
            .to(self.contract_address)
            .input(TransactionInput::new(Bytes::from(call.abi_encode())));

        let output = self
            .provider
            .call(request)
            .await
            .with_context(|| format!("getGoal({goal_id}) call failed"))?;
        let goal = VouchieVault::getGoalCall::abi_decode_returns(&output)
            .with_context(|| format!("Failed to decode the getGoal({goal_id}) output"))?;

        Ok(goal.description)
    }
}
