//! Node configuration (spec §6's config table). Loading this from a file or
//! environment is out of scope; the struct itself, with sane defaults, is
//! the in-scope ambient config stack.

use common::multihash::SHA2_256;

/// Every tunable spec §6 names, with a [`Default`] carrying the values used
/// throughout this crate's tests and demo binary.
#[derive(Debug, Clone, Copy)]
pub struct NodeConfig {
    pub observing_interval_in_seconds: u64,
    pub max_concurrent_downloads: usize,
    pub max_anchor_file_size_in_bytes: usize,
    pub max_map_file_size_in_bytes: usize,
    pub max_batch_file_size_in_bytes: usize,
    pub max_operations_per_batch: usize,
    pub max_number_of_operations_per_transaction_time: u64,
    pub max_number_of_transactions_per_transaction_time: u64,
    pub hash_algorithm_in_multihash_code: u64,
    pub normalized_fee_to_per_operation_fee_multiplier: f64,
    pub value_time_lock_amount_multiplier: f64,
    pub min_number_of_ops_for_value_time_lock: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            observing_interval_in_seconds: 5,
            max_concurrent_downloads: 20,
            max_anchor_file_size_in_bytes: 1_000_000,
            max_map_file_size_in_bytes: 1_000_000,
            max_batch_file_size_in_bytes: 20_000_000,
            max_operations_per_batch: 10_000,
            max_number_of_operations_per_transaction_time: 10_000,
            max_number_of_transactions_per_transaction_time: 1,
            hash_algorithm_in_multihash_code: SHA2_256,
            normalized_fee_to_per_operation_fee_multiplier: 0.01,
            value_time_lock_amount_multiplier: 1.0,
            min_number_of_ops_for_value_time_lock: 100,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_use_sha2_256_as_the_multihash_code() {
        assert_eq!(NodeConfig::default().hash_algorithm_in_multihash_code, 18);
    }
}
