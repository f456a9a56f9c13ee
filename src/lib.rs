//! Signed-transfer workloads driven through the block-stm executors.
//!
//! This crate generates deterministic blocks of signed value transfers and
//! executes them against a partitioned in-memory store, either sequentially
//! or with the optimistic parallel executor from the `block-stm` crate. Both
//! strategies produce the same responses and the same final store.
//!
//! # Architecture
//!
//! - **Workload**: pre-generated accounts and signed transactions
//! - **Transfer**: the apply callback run once per transaction attempt
//! - **Executor**: a strategy for running a block (sequential, parallel)
//! - **Patch**: block-level post-processing of the responses
//!
//! # Quick Start
//!
//! ```
//! use txn_exec::{Executor, SequentialExecutor, Workload, WorkloadConfig};
//!
//! let config = WorkloadConfig {
//!     num_accounts: 100,
//!     num_transactions: 50,
//!     conflict_factor: 0.0,
//!     seed: 42,
//!     chain_id: 1,
//! };
//!
//! // Generate workload (signs all transactions upfront)
//! let workload = Workload::generate(config).unwrap();
//! let mut store = workload.create_store();
//!
//! // Execute with signature verification
//! let executor = SequentialExecutor::new(true);
//! let output = executor.execute(&mut store, &workload).unwrap();
//!
//! assert_eq!(output.result.successful, 50);
//! ```

pub mod executor;
pub mod patch;
pub mod transfer;

pub use executor::{
    build_executor, BlockOutput, BlockStmExecutor, ExecutionMode, ExecutionResult, Executor,
    SequentialExecutor, TxExecutor, TxExecutorConfig,
};
pub use patch::patch_tx_responses;
pub use transfer::{apply_transfer, AccountRecord, EvmLog, TransferError, TxResponse};

use alloy_primitives::{keccak256, Address, Signature, B256, U256};
use block_stm::{KvStore, MemStore};
use k256::ecdsa::{SigningKey, VerifyingKey};
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::collections::HashMap;

/// Balance every workload account starts with: 1000 ETH.
pub const INITIAL_BALANCE: U256 = U256::from_limbs([0x35c9_adc5_dea0_0000, 0x36, 0, 0]);

/// Value moved by each generated transfer: 0.001 ETH.
pub const TRANSFER_VALUE: U256 = U256::from_limbs([1_000_000_000_000_000, 0, 0, 0]);

// ============================================================================
// Account & Key Management
// ============================================================================

/// An account with its signing key for transaction signing.
#[derive(Clone)]
pub struct Account {
    /// The secp256k1 signing key.
    pub signing_key: SigningKey,
    /// The Ethereum address derived from the public key.
    pub address: Address,
}

impl Account {
    /// Creates a new account from a signing key.
    pub fn from_signing_key(signing_key: SigningKey) -> Self {
        let verifying_key = VerifyingKey::from(&signing_key);
        let address = public_key_to_address(&verifying_key);
        Self {
            signing_key,
            address,
        }
    }

    /// Generates a deterministic account from a seed.
    pub fn from_seed(seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        // Out-of-range scalars are rejected; draw again from the same stream.
        let signing_key = loop {
            let mut key_bytes = [0u8; 32];
            rng.fill(&mut key_bytes);
            if let Ok(key) = SigningKey::from_bytes(&key_bytes.into()) {
                break key;
            }
        };
        Self::from_signing_key(signing_key)
    }
}

impl std::fmt::Debug for Account {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Account")
            .field("address", &self.address)
            .finish()
    }
}

/// Derives an Ethereum address from a secp256k1 public key.
fn public_key_to_address(verifying_key: &VerifyingKey) -> Address {
    let public_key_bytes = verifying_key.to_encoded_point(false);
    // Skip the 0x04 prefix byte, hash the rest.
    let hash = keccak256(&public_key_bytes.as_bytes()[1..]);
    Address::from_slice(&hash[12..])
}

// ============================================================================
// Signed Transaction
// ============================================================================

/// A signed value transfer ready for execution.
#[derive(Debug, Clone)]
pub struct SignedTransaction {
    /// The claimed sender; checked against the signature when verification is on.
    pub from: Address,
    pub to: Address,
    /// The value to transfer in wei.
    pub value: U256,
    pub nonce: u64,
    pub signature: Signature,
    /// The hash of the transaction data that was signed.
    pub tx_hash: B256,
}

impl SignedTransaction {
    /// Creates and signs a transfer over (from, to, value, nonce, chain_id).
    pub fn new(
        account: &Account,
        to: Address,
        value: U256,
        nonce: u64,
        chain_id: u64,
    ) -> Result<Self, k256::ecdsa::Error> {
        let tx_hash = Self::compute_tx_hash(account.address, to, value, nonce, chain_id);
        let signature = Self::sign(&account.signing_key, tx_hash)?;

        Ok(Self {
            from: account.address,
            to,
            value,
            nonce,
            signature,
            tx_hash,
        })
    }

    fn compute_tx_hash(from: Address, to: Address, value: U256, nonce: u64, chain_id: u64) -> B256 {
        let mut data = Vec::with_capacity(20 + 20 + 32 + 8 + 8);
        data.extend_from_slice(from.as_slice());
        data.extend_from_slice(to.as_slice());
        data.extend_from_slice(&value.to_be_bytes::<32>());
        data.extend_from_slice(&nonce.to_be_bytes());
        data.extend_from_slice(&chain_id.to_be_bytes());
        keccak256(&data)
    }

    fn sign(signing_key: &SigningKey, tx_hash: B256) -> Result<Signature, k256::ecdsa::Error> {
        let (sig, recovery_id) = signing_key.sign_prehash_recoverable(tx_hash.as_slice())?;
        Ok(Signature::from_signature_and_parity(
            sig,
            recovery_id.is_y_odd(),
        ))
    }

    /// Recovers the sender's address from the signature.
    /// Returns None if signature verification fails.
    pub fn recover_signer(&self) -> Option<Address> {
        self.signature
            .recover_address_from_prehash(&self.tx_hash)
            .ok()
    }

    /// Verifies the signature and returns true if valid.
    pub fn verify(&self) -> bool {
        self.recover_signer()
            .map(|addr| addr == self.from)
            .unwrap_or(false)
    }
}

// ============================================================================
// Workload Configuration & Generation
// ============================================================================

/// Configuration for workload generation.
#[derive(Debug, Clone)]
pub struct WorkloadConfig {
    /// Total number of accounts in the system.
    pub num_accounts: usize,
    /// Number of transactions in the block.
    pub num_transactions: usize,
    /// Conflict factor: 0.0 = no conflicts, 1.0 = all transactions touch the same two accounts.
    pub conflict_factor: f64,
    /// Random seed for reproducibility.
    pub seed: u64,
    /// Chain ID for transaction signing.
    pub chain_id: u64,
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        Self {
            num_accounts: 1000,
            num_transactions: 100,
            conflict_factor: 0.0,
            seed: 42,
            chain_id: 1,
        }
    }
}

/// A block of pre-generated accounts and signed transactions.
#[derive(Debug, Clone)]
pub struct Workload {
    pub accounts: Vec<Account>,
    pub transactions: Vec<SignedTransaction>,
    /// The configuration used to generate this workload.
    pub config: WorkloadConfig,
}

impl Workload {
    /// Generates a new workload from the given configuration.
    /// All transactions are pre-signed during generation.
    pub fn generate(config: WorkloadConfig) -> Result<Self, k256::ecdsa::Error> {
        let mut rng = StdRng::seed_from_u64(config.seed);

        let accounts: Vec<Account> = (0..config.num_accounts)
            .map(|i| Account::from_seed(config.seed.wrapping_add(i as u64)))
            .collect();

        // Per-sender nonces keep every generated transaction valid in block order.
        let mut nonces: HashMap<usize, u64> = HashMap::new();

        // "Hot" accounts shrink toward two as the conflict factor approaches one.
        let hot_account_count = if config.conflict_factor > 0.0 {
            (2.0 + (1.0 - config.conflict_factor) * (config.num_accounts as f64 - 2.0)).max(2.0)
                as usize
        } else {
            config.num_accounts
        };

        let mut transactions = Vec::with_capacity(config.num_transactions);
        if config.num_accounts < 2 {
            tracing::warn!(
                num_accounts = config.num_accounts,
                "need at least two accounts to generate transfers"
            );
        } else {
            for _ in 0..config.num_transactions {
                let use_hot = rng.gen::<f64>() < config.conflict_factor;
                let pool = if use_hot {
                    hot_account_count
                } else {
                    config.num_accounts
                };

                let from_idx = rng.gen_range(0..pool);
                let mut to_idx = rng.gen_range(0..pool);
                while to_idx == from_idx {
                    to_idx = rng.gen_range(0..pool);
                }

                let nonce = nonces.entry(from_idx).or_insert(0);
                transactions.push(SignedTransaction::new(
                    &accounts[from_idx],
                    accounts[to_idx].address,
                    TRANSFER_VALUE,
                    *nonce,
                    config.chain_id,
                )?);
                *nonce += 1;
            }
        }

        tracing::debug!(
            accounts = accounts.len(),
            transactions = transactions.len(),
            hot_accounts = hot_account_count,
            "generated workload"
        );

        Ok(Self {
            accounts,
            transactions,
            config,
        })
    }

    /// Creates a store pre-funded with [`INITIAL_BALANCE`] for every account.
    pub fn create_store(&self) -> MemStore {
        self.create_store_with_balance(INITIAL_BALANCE)
    }

    /// Creates a store where every account starts at nonce 0 with `balance`.
    pub fn create_store_with_balance(&self, balance: U256) -> MemStore {
        let mut store = MemStore::with_stores(transfer::stores());
        let record = AccountRecord::new(0, balance).encode();
        for account in &self.accounts {
            store.set(transfer::account_key(account.address), record.clone());
        }
        store
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use block_stm::KvRead;

    fn config(num_accounts: usize, num_transactions: usize, conflict_factor: f64) -> WorkloadConfig {
        WorkloadConfig {
            num_accounts,
            num_transactions,
            conflict_factor,
            seed: 123,
            chain_id: 1,
        }
    }

    #[test]
    fn test_balance_constants() {
        assert_eq!(
            INITIAL_BALANCE,
            U256::from(1_000_000_000_000_000_000_000u128)
        );
        assert_eq!(TRANSFER_VALUE, U256::from(1_000_000_000_000_000u64));
    }

    #[test]
    fn test_account_generation() {
        let acc1 = Account::from_seed(1);
        let acc2 = Account::from_seed(2);

        // Different seeds produce different accounts.
        assert_ne!(acc1.address, acc2.address);

        // Same seed produces same account.
        let acc1_copy = Account::from_seed(1);
        assert_eq!(acc1.address, acc1_copy.address);
    }

    #[test]
    fn test_signature_verification() {
        let account = Account::from_seed(42);
        let tx = SignedTransaction::new(&account, Address::ZERO, U256::from(1000), 0, 1).unwrap();

        assert!(tx.verify());
        assert_eq!(tx.recover_signer(), Some(account.address));
    }

    #[test]
    fn test_forged_sender_fails_verification() {
        let account = Account::from_seed(42);
        let mut tx =
            SignedTransaction::new(&account, Address::ZERO, U256::from(1000), 0, 1).unwrap();
        tx.from = Account::from_seed(43).address;

        assert!(!tx.verify());
    }

    #[test]
    fn test_workload_generation() {
        let workload = Workload::generate(config(10, 20, 0.0)).unwrap();

        assert_eq!(workload.accounts.len(), 10);
        assert_eq!(workload.transactions.len(), 20);

        for tx in &workload.transactions {
            assert!(tx.verify(), "Transaction signature should be valid");
            assert_ne!(tx.from, tx.to);
        }
    }

    #[test]
    fn test_workload_is_deterministic() {
        let a = Workload::generate(config(20, 30, 0.5)).unwrap();
        let b = Workload::generate(config(20, 30, 0.5)).unwrap();

        let hashes = |w: &Workload| w.transactions.iter().map(|tx| tx.tx_hash).collect::<Vec<_>>();
        assert_eq!(hashes(&a), hashes(&b));
    }

    #[test]
    fn test_nonces_are_sequential_per_sender() {
        let workload = Workload::generate(config(5, 50, 0.0)).unwrap();

        let mut expected: HashMap<Address, u64> = HashMap::new();
        for tx in &workload.transactions {
            let next = expected.entry(tx.from).or_insert(0);
            assert_eq!(tx.nonce, *next);
            *next += 1;
        }
    }

    #[test]
    fn test_full_conflict_uses_two_accounts() {
        let workload = Workload::generate(config(50, 40, 1.0)).unwrap();

        let hot = [workload.accounts[0].address, workload.accounts[1].address];
        for tx in &workload.transactions {
            assert!(hot.contains(&tx.from));
            assert!(hot.contains(&tx.to));
        }
    }

    #[test]
    fn test_single_account_generates_nothing() {
        let workload = Workload::generate(config(1, 10, 0.0)).unwrap();
        assert!(workload.transactions.is_empty());
    }

    #[test]
    fn test_create_store_funds_accounts() {
        let workload = Workload::generate(config(4, 0, 0.0)).unwrap();
        let store = workload.create_store();

        assert_eq!(store.len(), 4);
        for account in &workload.accounts {
            let record = transfer::load_account(&store, account.address).unwrap();
            assert_eq!(record, AccountRecord::new(0, INITIAL_BALANCE));
        }
        assert!(store.stores().contains(&transfer::evm_store()));
    }
}
