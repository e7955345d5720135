// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

use crate::token::holder;
use contract_committer::{
    native::encode_u64,
    types::{Address, ExecutionRequest, FunctionSelector},
};
use rand::{rngs::StdRng, Rng, SeedableRng};

/// Generates random token transfers between the minted holders.
///
/// With `hotspot_ratio` > 0 that share of transfers is sent to holder 1, which makes
/// conflicts between neighbouring requests far more likely.
pub struct TransferGenerator {
    rng: StdRng,
    contract: Address,
    transfer: FunctionSelector,
    num_holders: u64,
    max_amount: u64,
    hotspot_ratio: f64,
    next_user_id: u64,
}

impl TransferGenerator {
    pub fn new(contract: Address, num_holders: u64, max_amount: u64, seed: u64) -> Self {
        assert!(num_holders > 0, "at least one holder is required");
        Self {
            rng: StdRng::seed_from_u64(seed),
            contract,
            transfer: FunctionSelector::from_name("transfer"),
            num_holders,
            max_amount: max_amount.max(1),
            hotspot_ratio: 0.0,
            next_user_id: 0,
        }
    }

    pub fn with_hotspot_ratio(mut self, hotspot_ratio: f64) -> Self {
        self.hotspot_ratio = hotspot_ratio.clamp(0.0, 1.0);
        self
    }

    pub fn gen_transfer(&mut self) -> ExecutionRequest {
        let from = self.rng.gen_range(1, self.num_holders + 1);
        let to = if self.rng.gen::<f64>() < self.hotspot_ratio {
            1
        } else {
            self.rng.gen_range(1, self.num_holders + 1)
        };
        let amount = self.rng.gen_range(1, self.max_amount + 1);

        let user_id = self.next_user_id;
        self.next_user_id += 1;
        ExecutionRequest::new(holder(from), self.contract, self.transfer, vec![
            holder(to).to_vec(),
            encode_u64(amount),
        ])
        .with_user_id(user_id)
    }

    pub fn gen_block(&mut self, block_size: usize) -> Vec<ExecutionRequest> {
        (0..block_size).map(|_| self.gen_transfer()).collect()
    }
}
