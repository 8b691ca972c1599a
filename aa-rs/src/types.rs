use ethers::types::{Address, Bytes, U256};

/// ERC-4337 UserOperation, EntryPoint v0.6 layout (the Kite testnet
/// EntryPoint). v0.7 packs this struct differently; do not mix them.
#[derive(Clone, Debug)]
pub struct UserOperation {
    pub sender: Address,
    pub nonce: U256,
    pub init_code: Bytes,
    pub call_data: Bytes,
    pub call_gas_limit: U256,
    pub verification_gas_limit: U256,
    pub pre_verification_gas: U256,
    pub max_fee_per_gas: U256,
    pub max_priority_fee_per_gas: U256,
    pub paymaster_and_data: Bytes,
    pub signature: Bytes,
}

impl UserOperation {
    /// A fresh, unsigned op with zeroed gas fields. Bundlers fill the gas
    /// limits during `eth_estimateUserOperationGas`; the placeholder
    /// 65-byte signature keeps estimation realistic.
    pub fn unsigned(
        sender: Address,
        nonce: U256,
        init_code: Bytes,
        call_data: Bytes,
        max_fee_per_gas: U256,
        max_priority_fee_per_gas: U256,
    ) -> Self {
        Self {
            sender,
            nonce,
            init_code,
            call_data,
            call_gas_limit: U256::zero(),
            verification_gas_limit: U256::zero(),
            pre_verification_gas: U256::zero(),
            max_fee_per_gas,
            max_priority_fee_per_gas,
            paymaster_and_data: Bytes::default(),
            signature: Bytes::from(vec![0u8; 65]),
        }
    }

    /// Tuple in Solidity struct order, for `EntryPoint.getUserOpHash((...))`.
    #[allow(clippy::type_complexity)]
    pub fn as_abi_tuple(
        &self,
    ) -> (
        Address,
        U256,
        Bytes,
        Bytes,
        U256,
        U256,
        U256,
        U256,
        U256,
        Bytes,
        Bytes,
    ) {
        (
            self.sender,
            self.nonce,
            self.init_code.clone(),
            self.call_data.clone(),
            self.call_gas_limit,
            self.verification_gas_limit,
            self.pre_verification_gas,
            self.max_fee_per_gas,
            self.max_priority_fee_per_gas,
            self.paymaster_and_data.clone(),
            self.signature.clone(),
        )
    }
}
