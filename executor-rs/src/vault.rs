use ethers::abi::{self, ParamType, Token};
use ethers::contract::abigen;
use ethers::providers::Middleware;
use ethers::types::{transaction::eip2718::TypedTransaction, Address, Bytes, TransactionRequest};
use ethers::utils::keccak256;
use eyre::{eyre, Result};
use paypai_vault::SpendingRule;
use std::sync::Arc;

// Minimal ABI for the executor bot.
//
// `getSpendingRules()` returns an array of dynamic tuples, which the
// human-readable parser cannot express, so that one view is called by hand
// below.
abigen!(
    ClientAgentVault,
    r#"[
        function checkSpendAllowed(uint256 amount, address provider) view returns (bool)
        function executeSpend(uint256 amount, address recipient)
        function settlementToken() view returns (address)
        function owner() view returns (address)
        function isExecutor(address executor) view returns (bool)
    ]"#
);

/// `getSpendingRules()` via a raw eth_call with a hand-decoded return.
pub async fn get_spending_rules<M: Middleware>(
    client: Arc<M>,
    vault: Address,
) -> Result<Vec<SpendingRule>> {
    let selector = &keccak256(b"getSpendingRules()")[..4];
    let call = TransactionRequest::new()
        .to(vault)
        .data(Bytes::from(selector.to_vec()));
    let tx: TypedTransaction = call.into();

    let out = client
        .call(&tx, None)
        .await
        .map_err(|e| eyre!("vault.getSpendingRules failed: {e}"))?;

    let decoded = abi::decode(
        &[ParamType::Array(Box::new(SpendingRule::abi_param_type()))],
        out.as_ref(),
    )
    .map_err(|e| eyre!("failed to decode getSpendingRules return data: {e}"))?;

    let Some(Token::Array(items)) = decoded.into_iter().next() else {
        return Err(eyre!("unexpected getSpendingRules return shape"));
    };

    items
        .iter()
        .map(|t| SpendingRule::from_abi_token(t).map_err(|e| eyre!("{e}")))
        .collect()
}
