//! Transfer application: the apply callback the executors drive.
//!
//! Accounts live in the `acc` partition keyed by address. A transfer bumps the
//! sender nonce, then moves value inside a nested call guarded by a journal
//! snapshot. A call that runs out of funds is reverted and reported in the
//! response; only corrupt state is an execution error.

use crate::SignedTransaction;
use alloy_primitives::{keccak256, Address, B256, U256};
use block_stm::{BranchStore, Event, JournaledState, Key, KvRead, KvStore, StmError, StoreKey};

/// Gas charged for a plain value transfer.
pub const TRANSFER_GAS: u64 = 21_000;

pub const CODE_OK: u32 = 0;
pub const CODE_INVALID_SIGNATURE: u32 = 1;
pub const CODE_INVALID_NONCE: u32 = 2;
pub const CODE_INSUFFICIENT_FUNDS: u32 = 3;

/// Partition holding account records.
pub fn accounts_store() -> StoreKey {
    StoreKey::new("acc")
}

/// Partition reserved for contract state.
pub fn evm_store() -> StoreKey {
    StoreKey::new("evm")
}

/// Every partition the transfer application may touch.
pub fn stores() -> Vec<StoreKey> {
    vec![accounts_store(), evm_store()]
}

pub fn account_key(address: Address) -> Key {
    Key::new(&accounts_store(), address.as_slice().to_vec())
}

/// Errors that abort the whole block.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("corrupt account record for {address}: {len} bytes")]
    CorruptAccount { address: Address, len: usize },

    #[error("insufficient funds in {address}: have {balance}, need {needed}")]
    InsufficientFunds {
        address: Address,
        balance: U256,
        needed: U256,
    },

    #[error("balance overflow crediting {address}")]
    BalanceOverflow { address: Address },

    #[error(transparent)]
    Journal(#[from] StmError),
}

/// Persisted account state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AccountRecord {
    pub nonce: u64,
    pub balance: U256,
}

impl AccountRecord {
    pub const ENCODED_LEN: usize = 8 + 32;

    pub fn new(nonce: u64, balance: U256) -> Self {
        Self { nonce, balance }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::ENCODED_LEN);
        out.extend_from_slice(&self.nonce.to_be_bytes());
        out.extend_from_slice(&self.balance.to_be_bytes::<32>());
        out
    }

    pub fn decode(address: Address, bytes: &[u8]) -> Result<Self, TransferError> {
        let corrupt = || TransferError::CorruptAccount {
            address,
            len: bytes.len(),
        };
        if bytes.len() != Self::ENCODED_LEN {
            return Err(corrupt());
        }
        let nonce = u64::from_be_bytes(bytes[..8].try_into().map_err(|_| corrupt())?);
        let balance = U256::from_be_bytes::<32>(bytes[8..].try_into().map_err(|_| corrupt())?);
        Ok(Self { nonce, balance })
    }
}

/// Loads an account, treating a missing record as empty.
pub fn load_account<S: KvRead + ?Sized>(
    store: &S,
    address: Address,
) -> Result<AccountRecord, TransferError> {
    match store.get(&account_key(address)) {
        Some(bytes) => AccountRecord::decode(address, &bytes),
        None => Ok(AccountRecord::default()),
    }
}

/// An EVM-style log attached to a response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvmLog {
    pub address: Address,
    pub topics: Vec<B256>,
    pub data: Vec<u8>,
    /// Position of the transaction in the block.
    pub tx_index: u64,
    /// Block-global log index.
    pub index: u64,
}

/// Per-transaction response. Failures are encoded in `code`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxResponse {
    pub tx_hash: B256,
    pub code: u32,
    pub log: String,
    pub gas_used: u64,
    pub cumulative_gas_used: u64,
    pub events: Vec<Event>,
    pub logs: Vec<EvmLog>,
}

impl TxResponse {
    fn new(tx: &SignedTransaction, code: u32, log: impl Into<String>) -> Self {
        Self {
            tx_hash: tx.tx_hash,
            code,
            log: log.into(),
            gas_used: 0,
            cumulative_gas_used: 0,
            events: Vec::new(),
            logs: Vec::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.code == CODE_OK
    }
}

fn transfer_topic() -> B256 {
    keccak256("Transfer(address,address,uint256)")
}

/// Moves `value` from `from` to `to` directly on the working branch.
fn move_coins<P: KvRead + ?Sized>(
    working: &mut BranchStore<'_, P>,
    events: &mut Vec<Event>,
    from: Address,
    to: Address,
    value: U256,
) -> Result<(), TransferError> {
    let mut sender = load_account(&*working, from)?;
    sender.balance = sender
        .balance
        .checked_sub(value)
        .ok_or(TransferError::InsufficientFunds {
            address: from,
            balance: sender.balance,
            needed: value,
        })?;
    working.set(account_key(from), sender.encode());
    events.push(
        Event::new("coin_spent")
            .with_attribute("spender", from)
            .with_attribute("amount", value),
    );

    let mut receiver = load_account(&*working, to)?;
    receiver.balance = receiver
        .balance
        .checked_add(value)
        .ok_or(TransferError::BalanceOverflow { address: to })?;
    working.set(account_key(to), receiver.encode());
    events.push(
        Event::new("coin_received")
            .with_attribute("receiver", to)
            .with_attribute("amount", value),
    );
    Ok(())
}

/// Executes one transfer against `view`.
///
/// Invalid signatures, stale nonces and insufficient funds produce failed
/// responses. Only corrupt account records are returned as errors.
pub fn apply_transfer(
    tx: &SignedTransaction,
    view: &mut dyn KvStore,
    verify_signature: bool,
) -> Result<TxResponse, TransferError> {
    if verify_signature && !tx.verify() {
        return Ok(TxResponse::new(tx, CODE_INVALID_SIGNATURE, "invalid signature"));
    }

    let (changes, events, mut response) = {
        let mut state = JournaledState::new(&*view);

        let mut sender = load_account(&state, tx.from)?;
        if sender.nonce != tx.nonce {
            return Ok(TxResponse::new(
                tx,
                CODE_INVALID_NONCE,
                format!("invalid nonce: expected {}, got {}", sender.nonce, tx.nonce),
            ));
        }
        sender.nonce += 1;
        state.set(account_key(tx.from), sender.encode());

        let mut response = TxResponse::new(tx, CODE_OK, "");
        response.gas_used = TRANSFER_GAS;

        let call = state.snapshot();
        state.emit(
            Event::new("message")
                .with_attribute("sender", tx.from)
                .with_attribute("recipient", tx.to),
        );
        match state.native_change(|working, events| {
            move_coins(working, events, tx.from, tx.to, tx.value)
        }) {
            Ok(()) => {
                state.discard(call)?;
                response.logs.push(EvmLog {
                    address: tx.to,
                    topics: vec![transfer_topic(), tx.from.into_word(), tx.to.into_word()],
                    data: tx.value.to_be_bytes::<32>().to_vec(),
                    tx_index: 0,
                    index: 0,
                });
            }
            Err(TransferError::InsufficientFunds { balance, needed, .. }) => {
                state.revert_to(call)?;
                response.code = CODE_INSUFFICIENT_FUNDS;
                response.log = format!("insufficient funds: have {}, need {}", balance, needed);
            }
            Err(err) => return Err(err),
        }

        let (changes, events) = state.finish();
        (changes, events, response)
    };

    view.merge(changes)?;
    response.events = events;
    Ok(response)
}
