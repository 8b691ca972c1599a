use anyhow::{anyhow, Context, Result};
use ethers::abi::{self, AbiParser, ParamType, Token};
use ethers::contract::Contract;
use ethers::providers::Middleware;
use ethers::types::{transaction::eip2718::TypedTransaction, Address, Bytes, TransactionRequest, H256, U256};
use ethers::utils::keccak256;
use paypai_vault::SpendingRule;
use std::sync::Arc;

// The vault's rule struct is a dynamic tuple, which the human-readable ABI
// parser does not handle, so calldata for rule-bearing functions is encoded
// by hand; the scalar views go through Contract like everything else.

fn selector(signature: &str) -> [u8; 4] {
    let hash = keccak256(signature.as_bytes());
    [hash[0], hash[1], hash[2], hash[3]]
}

fn encode_call(signature: &str, tokens: &[Token]) -> Bytes {
    let mut data = selector(signature).to_vec();
    data.extend_from_slice(&abi::encode(tokens));
    Bytes::from(data)
}

/// `configureSpendingRules(rules[])`: replaces the whole rule set.
pub fn configure_rules_calldata(rules: &[SpendingRule]) -> Bytes {
    let tokens = Token::Array(rules.iter().map(|r| r.to_abi_token()).collect());
    encode_call(
        "configureSpendingRules((address,uint256,uint256,uint256,address[],address[])[])",
        &[tokens],
    )
}

pub fn withdraw_calldata(token: Address, amount: U256, recipient: Address) -> Bytes {
    encode_call(
        "withdraw(address,uint256,address)",
        &[
            Token::Address(token),
            Token::Uint(amount),
            Token::Address(recipient),
        ],
    )
}

pub fn set_executor_calldata(executor: Address, allowed: bool) -> Bytes {
    encode_call(
        "setExecutor(address,bool)",
        &[Token::Address(executor), Token::Bool(allowed)],
    )
}

pub fn deploy_deterministic_calldata(
    admin: Address,
    spending_account: Address,
    salt: H256,
) -> Bytes {
    encode_call(
        "deployDeterministic(address,address,bytes32)",
        &[
            Token::Address(admin),
            Token::Address(spending_account),
            Token::FixedBytes(salt.as_bytes().to_vec()),
        ],
    )
}

/// The factory's authoritative CREATE2 prediction.
pub async fn get_vault_address<M: Middleware + 'static>(
    client: Arc<M>,
    factory: Address,
    admin: Address,
    spending_account: Address,
    salt: H256,
) -> Result<Address> {
    let factory_abi = AbiParser::default().parse(&[
        "function getVaultAddress(address admin, address spendingAccount, bytes32 userSalt) view returns (address)",
    ])?;
    let factory_c = Contract::new(factory, factory_abi, client);

    let addr: Address = factory_c
        .method("getVaultAddress", (admin, spending_account, salt.to_fixed_bytes()))?
        .call()
        .await
        .context("factory.getVaultAddress failed")?;
    Ok(addr)
}

pub async fn check_spend_allowed<M: Middleware + 'static>(
    client: Arc<M>,
    vault: Address,
    amount: U256,
    provider_addr: Address,
) -> Result<bool> {
    let vault_abi = AbiParser::default().parse(&[
        "function checkSpendAllowed(uint256 amount, address provider) view returns (bool)",
    ])?;
    let vault_c = Contract::new(vault, vault_abi, client);

    let allowed: bool = vault_c
        .method("checkSpendAllowed", (amount, provider_addr))?
        .call()
        .await
        .context("vault.checkSpendAllowed failed")?;
    Ok(allowed)
}

pub async fn settlement_token<M: Middleware + 'static>(
    client: Arc<M>,
    vault: Address,
) -> Result<Address> {
    let vault_abi =
        AbiParser::default().parse(&["function settlementToken() view returns (address)"])?;
    let vault_c = Contract::new(vault, vault_abi, client);
    let token: Address = vault_c
        .method("settlementToken", ())?
        .call()
        .await
        .context("vault.settlementToken failed")?;
    Ok(token)
}

pub async fn vault_owner<M: Middleware + 'static>(client: Arc<M>, vault: Address) -> Result<Address> {
    let vault_abi = AbiParser::default().parse(&["function owner() view returns (address)"])?;
    let vault_c = Contract::new(vault, vault_abi, client);
    let owner: Address = vault_c
        .method("owner", ())?
        .call()
        .await
        .context("vault.owner failed")?;
    Ok(owner)
}

pub async fn is_executor<M: Middleware + 'static>(
    client: Arc<M>,
    vault: Address,
    executor: Address,
) -> Result<bool> {
    let vault_abi =
        AbiParser::default().parse(&["function isExecutor(address executor) view returns (bool)"])?;
    let vault_c = Contract::new(vault, vault_abi, client);
    let ok: bool = vault_c
        .method("isExecutor", executor)?
        .call()
        .await
        .context("vault.isExecutor failed")?;
    Ok(ok)
}

/// `getSpendingRules()` with a hand-decoded tuple-array return.
pub async fn get_spending_rules<M: Middleware + 'static>(
    client: Arc<M>,
    vault: Address,
) -> Result<Vec<SpendingRule>> {
    let call = TransactionRequest::new()
        .to(vault)
        .data(Bytes::from(selector("getSpendingRules()").to_vec()));
    let tx: TypedTransaction = call.into();

    let out = client
        .call(&tx, None)
        .await
        .map_err(|e| anyhow!("vault.getSpendingRules failed: {e}"))?;

    let decoded = abi::decode(
        &[ParamType::Array(Box::new(SpendingRule::abi_param_type()))],
        out.as_ref(),
    )
    .context("failed to decode getSpendingRules return data")?;

    let Some(Token::Array(items)) = decoded.into_iter().next() else {
        return Err(anyhow!("unexpected getSpendingRules return shape"));
    };

    items
        .iter()
        .map(|t| SpendingRule::from_abi_token(t).map_err(|e| anyhow!("{e}")))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selectors_match_known_signatures() {
        // transfer(address,uint256) is the canonical reference vector.
        assert_eq!(selector("transfer(address,uint256)"), [0xa9, 0x05, 0x9c, 0xbb]);
        assert_eq!(selector("approve(address,uint256)"), [0x09, 0x5e, 0xa7, 0xb3]);
    }

    #[test]
    fn configure_rules_calldata_roundtrips_through_abi_decode() {
        let rule = SpendingRule {
            token: Address::from_low_u64_be(1),
            time_window: 3600,
            budget: U256::from(100),
            initial_window_start_time: 1000,
            whitelist: vec![],
            blacklist: vec![Address::from_low_u64_be(66)],
        };
        let calldata = configure_rules_calldata(std::slice::from_ref(&rule));

        let decoded = abi::decode(
            &[ParamType::Array(Box::new(SpendingRule::abi_param_type()))],
            &calldata[4..],
        )
        .unwrap();
        let Token::Array(items) = &decoded[0] else {
            panic!("expected array");
        };
        assert_eq!(SpendingRule::from_abi_token(&items[0]).unwrap(), rule);
    }

    #[test]
    fn withdraw_calldata_is_selector_plus_three_words() {
        let data = withdraw_calldata(
            Address::from_low_u64_be(1),
            U256::from(5),
            Address::from_low_u64_be(2),
        );
        assert_eq!(data.len(), 4 + 3 * 32);
        assert_eq!(&data[..4], &selector("withdraw(address,uint256,address)")[..]);
    }
}
