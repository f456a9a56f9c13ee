//! Block-level post-processing of transaction responses.
//!
//! Each transfer builds its response in isolation and cannot know its
//! neighbours' logs or gas. Once the block is final, this pass stamps the
//! block-wide positions in.

use crate::transfer::TxResponse;

/// Stamps transaction indices, block-global log indices and cumulative gas
/// into `responses`, which must be in block order.
pub fn patch_tx_responses(responses: &mut [TxResponse]) {
    let mut log_index = 0u64;
    let mut cumulative_gas = 0u64;

    for (tx_index, response) in responses.iter_mut().enumerate() {
        cumulative_gas = cumulative_gas.saturating_add(response.gas_used);
        response.cumulative_gas_used = cumulative_gas;

        for log in &mut response.logs {
            log.tx_index = tx_index as u64;
            log.index = log_index;
            log_index += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::{EvmLog, CODE_INSUFFICIENT_FUNDS, CODE_OK, TRANSFER_GAS};
    use alloy_primitives::{Address, B256};

    fn log() -> EvmLog {
        EvmLog {
            address: Address::ZERO,
            topics: Vec::new(),
            data: Vec::new(),
            tx_index: 99,
            index: 99,
        }
    }

    fn response(code: u32, gas_used: u64, logs: usize) -> TxResponse {
        TxResponse {
            tx_hash: B256::ZERO,
            code,
            log: String::new(),
            gas_used,
            cumulative_gas_used: 0,
            events: Vec::new(),
            logs: (0..logs).map(|_| log()).collect(),
        }
    }

    #[test]
    fn test_log_indices_are_block_global() {
        let mut responses = vec![
            response(CODE_OK, TRANSFER_GAS, 2),
            response(CODE_INSUFFICIENT_FUNDS, TRANSFER_GAS, 0),
            response(CODE_OK, TRANSFER_GAS, 1),
        ];
        patch_tx_responses(&mut responses);

        let positions: Vec<(u64, u64)> = responses
            .iter()
            .flat_map(|r| r.logs.iter().map(|l| (l.tx_index, l.index)))
            .collect();
        assert_eq!(positions, vec![(0, 0), (0, 1), (2, 2)]);
    }

    #[test]
    fn test_cumulative_gas() {
        let mut responses = vec![
            response(CODE_OK, TRANSFER_GAS, 0),
            response(CODE_OK, 0, 0),
            response(CODE_OK, TRANSFER_GAS, 0),
        ];
        patch_tx_responses(&mut responses);

        let cumulative: Vec<u64> = responses.iter().map(|r| r.cumulative_gas_used).collect();
        assert_eq!(cumulative, vec![TRANSFER_GAS, TRANSFER_GAS, 2 * TRANSFER_GAS]);
    }

    #[test]
    fn test_patch_is_idempotent() {
        let mut responses = vec![response(CODE_OK, TRANSFER_GAS, 1); 3];
        patch_tx_responses(&mut responses);
        let once = responses.clone();
        patch_tx_responses(&mut responses);

        assert_eq!(responses, once);
    }

    #[test]
    fn test_empty_block() {
        let mut responses: Vec<TxResponse> = Vec::new();
        patch_tx_responses(&mut responses);
        assert!(responses.is_empty());
    }
}
