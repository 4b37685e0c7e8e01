// Copyright (C) 2025 Bilinear Labs - All Rights Reserved

//! Module with utilities for testing.

use crate::contract::{ContractEvent, GoalDescriptionSource, IndexedEvent, VouchieVault};
use alloy::{
    primitives::{Address, B256, LogData, U256},
    rpc::types::Log,
    sol_types::SolEvent,
};
use anyhow::Result;
use fake::{Fake, Faker};
use std::{collections::HashMap, str::FromStr};

/// Address of the contract that emits the test logs.
pub const VAULT_ADDRESS: &str = "0x00000000000000000000000000000000000c0de5";

/// Generates a random Ethereum address (20 bytes, 0x-prefixed)
pub fn fake_address() -> String {
    let bytes: [u8; 20] = Faker.fake();
    format!("0x{}", hex::encode(bytes))
}

/// Builds a mined log for the given event data. The block timestamp is derived from the block number.
pub fn log_for(data: LogData, block_number: u64, log_index: u64) -> Log {
    mined_log(
        data,
        block_number,
        1_700_000_000 + block_number,
        log_index,
        B256::left_padding_from(&(block_number * 1_000 + log_index).to_be_bytes()),
    )
}

fn mined_log(
    data: LogData,
    block_number: u64,
    block_timestamp: u64,
    log_index: u64,
    transaction_hash: B256,
) -> Log {
    Log {
        inner: alloy::primitives::Log {
            address: Address::from_str(VAULT_ADDRESS).expect("valid vault address"),
            data,
        },
        block_hash: Some(B256::left_padding_from(&block_number.to_be_bytes())),
        block_number: Some(block_number),
        block_timestamp: Some(block_timestamp),
        transaction_hash: Some(transaction_hash),
        transaction_index: Some(0),
        log_index: Some(log_index),
        removed: false,
    }
}

/// Encodes a typed event back into the log data the contract would emit.
pub fn encode_event(event: &ContractEvent) -> LogData {
    match event.clone() {
        ContractEvent::GoalCreated {
            goal_id,
            creator,
            stake_amount,
            deadline,
            is_solo,
        } => VouchieVault::GoalCreated {
            goalId: U256::from(goal_id),
            creator,
            stakeAmount: stake_amount,
            deadline: U256::from(deadline),
            isSolo: is_solo,
        }
        .encode_log_data(),
        ContractEvent::GoalResolved {
            goal_id,
            successful,
            is_solo,
        } => VouchieVault::GoalResolved {
            goalId: U256::from(goal_id),
            successful,
            isSolo: is_solo,
        }
        .encode_log_data(),
        ContractEvent::VoteCast {
            goal_id,
            voter,
            is_valid,
        } => VouchieVault::VoteCast {
            goalId: U256::from(goal_id),
            voter,
            isValid: is_valid,
        }
        .encode_log_data(),
        ContractEvent::FundsClaimed {
            goal_id,
            claimant,
            amount,
        } => VouchieVault::FundsClaimed {
            goalId: U256::from(goal_id),
            claimant,
            amount,
        }
        .encode_log_data(),
        ContractEvent::StreakFrozen {
            goal_id,
            new_deadline,
            fee_paid,
        } => VouchieVault::StreakFrozen {
            goalId: U256::from(goal_id),
            newDeadline: U256::from(new_deadline),
            feePaid: fee_paid,
        }
        .encode_log_data(),
        ContractEvent::BadgeClaimed { goal_id, creator } => VouchieVault::BadgeClaimed {
            goalId: U256::from(goal_id),
            creator,
        }
        .encode_log_data(),
        ContractEvent::GoalCanceled {
            goal_id,
            creator,
            refund_amount,
        } => VouchieVault::GoalCanceled {
            goalId: U256::from(goal_id),
            creator,
            refundAmount: refund_amount,
        }
        .encode_log_data(),
    }
}

/// Turns an indexed event back into the raw log it was decoded from.
pub fn to_log(event: &IndexedEvent) -> Log {
    let transaction_hash =
        B256::from_str(&event.meta.transaction_hash).expect("valid transaction hash");
    mined_log(
        encode_event(&event.event),
        event.meta.block_number,
        event.meta.block_timestamp,
        event.meta.log_index,
        transaction_hash,
    )
}

/// Produces a sequence of events, one per block, with increasing timestamps.
///
/// # Description
///
/// Every call mines a new block 12 seconds after the previous one, so the events are ordered the same way they
/// are generated.
pub struct EventBuilder {
    start_timestamp: u64,
    counter: u64,
}

impl EventBuilder {
    pub fn new(start_timestamp: u64) -> Self {
        Self {
            start_timestamp,
            counter: 0,
        }
    }

    /// Block number of the next event.
    pub fn next_block(&self) -> u64 {
        self.counter + 1
    }

    fn mine(&mut self, event: ContractEvent) -> IndexedEvent {
        let block_number = self.next_block();
        let block_timestamp = self.start_timestamp + self.counter * 12;
        self.counter += 1;

        let log = mined_log(
            encode_event(&event),
            block_number,
            block_timestamp,
            0,
            B256::left_padding_from(&block_number.to_be_bytes()),
        );
        IndexedEvent::from_log(&log)
            .expect("test events decode")
            .expect("test events are known")
    }

    pub fn goal_created(
        &mut self,
        goal_id: u64,
        creator: &str,
        stake_amount: u64,
        deadline: u64,
        is_solo: bool,
    ) -> IndexedEvent {
        self.mine(ContractEvent::GoalCreated {
            goal_id,
            creator: address(creator),
            stake_amount: U256::from(stake_amount),
            deadline,
            is_solo,
        })
    }

    pub fn goal_resolved(&mut self, goal_id: u64, successful: bool) -> IndexedEvent {
        self.mine(ContractEvent::GoalResolved {
            goal_id,
            successful,
            is_solo: true,
        })
    }

    pub fn vote_cast(&mut self, goal_id: u64, voter: &str, is_valid: bool) -> IndexedEvent {
        self.mine(ContractEvent::VoteCast {
            goal_id,
            voter: address(voter),
            is_valid,
        })
    }

    pub fn funds_claimed(&mut self, goal_id: u64, claimant: &str, amount: u64) -> IndexedEvent {
        self.mine(ContractEvent::FundsClaimed {
            goal_id,
            claimant: address(claimant),
            amount: U256::from(amount),
        })
    }

    pub fn streak_frozen(&mut self, goal_id: u64, new_deadline: u64, fee_paid: u64) -> IndexedEvent {
        self.mine(ContractEvent::StreakFrozen {
            goal_id,
            new_deadline,
            fee_paid: U256::from(fee_paid),
        })
    }

    pub fn badge_claimed(&mut self, goal_id: u64, creator: &str) -> IndexedEvent {
        self.mine(ContractEvent::BadgeClaimed {
            goal_id,
            creator: address(creator),
        })
    }

    pub fn goal_canceled(&mut self, goal_id: u64, creator: &str, refund_amount: u64) -> IndexedEvent {
        self.mine(ContractEvent::GoalCanceled {
            goal_id,
            creator: address(creator),
            refund_amount: U256::from(refund_amount),
        })
    }
}

fn address(address: &str) -> Address {
    Address::from_str(address).expect("valid test address")
}

/// Description source backed by a map. Unknown goals fail the lookup.
#[derive(Default)]
pub struct StaticDescriptions(pub HashMap<u64, String>);

impl StaticDescriptions {
    pub fn with(mut self, goal_id: u64, description: &str) -> Self {
        self.0.insert(goal_id, description.to_string());
        self
    }
}

impl GoalDescriptionSource for StaticDescriptions {
    async fn goal_description(&self, goal_id: u64) -> Result<String> {
        self.0
            .get(&goal_id)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("getGoal({goal_id}) reverted"))
    }
}
