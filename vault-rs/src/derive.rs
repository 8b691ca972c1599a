use crate::VaultError;
use ethers::abi::Token;
use ethers::types::{Address, H256};
use ethers::utils::keccak256;
use std::str::FromStr;

/// Versioned domain tag mixed into every vault salt.
///
/// Bumping the scheme (`_V2`, ...) changes every derived salt, so a new
/// deployment scheme can never collide with addresses minted under V1.
pub const VAULT_SALT_TAG: &str = "PAYPAI_VAULT_V1";

/// A locally computed vault address.
///
/// `exact_init_code` is true only when the caller supplied the factory's
/// real proxy creation bytecode. Without it the address is a display
/// estimate and must never be used as a funding target; re-confirm through
/// `VaultFactory.getVaultAddress` before moving funds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VaultAddressEstimate {
    pub address: Address,
    pub exact_init_code: bool,
}

/// Parse a user-supplied account address, failing closed on malformed input.
pub fn parse_address(s: &str) -> Result<Address, VaultError> {
    let trimmed = s.trim();
    if !trimmed.starts_with("0x") || trimmed.len() != 42 {
        return Err(VaultError::InvalidAddress(s.to_string()));
    }
    Address::from_str(trimmed).map_err(|_| VaultError::InvalidAddress(s.to_string()))
}

/// Salt for the admin's vault: `keccak256(tag ++ admin)`, Solidity packed
/// encoding (UTF-8 tag bytes immediately followed by the 20 address bytes).
pub fn vault_salt(admin: Address) -> H256 {
    let mut buf = Vec::with_capacity(VAULT_SALT_TAG.len() + 20);
    buf.extend_from_slice(VAULT_SALT_TAG.as_bytes());
    buf.extend_from_slice(admin.as_bytes());
    H256(keccak256(buf))
}

/// EIP-1014: `last_20_bytes(keccak256(0xff ++ deployer ++ salt ++ init_code_hash))`.
pub fn create2_address(deployer: Address, salt: H256, init_code_hash: H256) -> Address {
    let mut buf = Vec::with_capacity(1 + 20 + 32 + 32);
    buf.push(0xff);
    buf.extend_from_slice(deployer.as_bytes());
    buf.extend_from_slice(salt.as_bytes());
    buf.extend_from_slice(init_code_hash.as_bytes());
    Address::from_slice(&keccak256(buf)[12..])
}

/// Calldata for `initialize(address settlementToken, address admin, address spendingAccount)`,
/// the initializer the factory forwards to a freshly deployed proxy.
pub fn initialize_calldata(
    settlement_token: Address,
    admin: Address,
    spending_account: Address,
) -> Vec<u8> {
    let selector = &keccak256(b"initialize(address,address,address)")[..4];
    let mut data = selector.to_vec();
    data.extend_from_slice(&ethers::abi::encode(&[
        Token::Address(settlement_token),
        Token::Address(admin),
        Token::Address(spending_account),
    ]));
    data
}

/// Hash of the init code the factory will execute:
/// `keccak256(proxy_bytecode ++ abi.encode(implementation, initData))`.
///
/// With an empty `proxy_bytecode` this only approximates what the factory
/// hashes on-chain; callers must treat the resulting address accordingly.
pub fn vault_init_code_hash(
    proxy_bytecode: &[u8],
    implementation: Address,
    init_data: &[u8],
) -> H256 {
    let ctor_args = ethers::abi::encode(&[
        Token::Address(implementation),
        Token::Bytes(init_data.to_vec()),
    ]);
    let mut buf = Vec::with_capacity(proxy_bytecode.len() + ctor_args.len());
    buf.extend_from_slice(proxy_bytecode);
    buf.extend_from_slice(&ctor_args);
    H256(keccak256(buf))
}

/// Predict where the admin's vault proxy will live once deployed.
///
/// Deterministic for fixed inputs. `proxy_bytecode` is the factory's proxy
/// creation code; pass `None` when it is not at hand, in which case the
/// result is marked as a display estimate only.
pub fn estimate_vault_address(
    factory: Address,
    implementation: Address,
    settlement_token: Address,
    admin: Address,
    spending_account: Address,
    proxy_bytecode: Option<&[u8]>,
) -> VaultAddressEstimate {
    let salt = vault_salt(admin);
    let init_data = initialize_calldata(settlement_token, admin, spending_account);
    let bytecode = proxy_bytecode.unwrap_or(&[]);
    let init_code_hash = vault_init_code_hash(bytecode, implementation, &init_data);

    VaultAddressEstimate {
        address: create2_address(factory, salt, init_code_hash),
        exact_init_code: !bytecode.is_empty(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> Address {
        s.parse().unwrap()
    }

    // EIP-1014 example vectors.
    #[test]
    fn create2_matches_eip1014_zero_vector() {
        let got = create2_address(
            Address::zero(),
            H256::zero(),
            H256(keccak256([0x00u8])),
        );
        assert_eq!(got, addr("0x4D1A2e2bB4F88F0250f26Ffff098B0b30B26BF38"));
    }

    #[test]
    fn create2_matches_eip1014_cafebabe_vector() {
        let salt = H256::from_str(
            "0x00000000000000000000000000000000000000000000000000000000cafebabe",
        )
        .unwrap();
        let got = create2_address(
            addr("0x00000000000000000000000000000000deadbeef"),
            salt,
            H256(keccak256(hex::decode("deadbeef").unwrap())),
        );
        assert_eq!(got, addr("0x60f3f640a8508fC6a86d45DF051962668E1e8AC7"));
    }

    #[test]
    fn create2_matches_eip1014_empty_init_code_vector() {
        let got = create2_address(Address::zero(), H256::zero(), H256(keccak256([0u8; 0])));
        assert_eq!(got, addr("0xE33C0C7F7df4809055C3ebA6c09CFe4BaF1BD9e0"));
    }

    #[test]
    fn salt_is_deterministic_and_admin_bound() {
        let a1 = addr("0x1111111111111111111111111111111111111111");
        let a2 = addr("0x2222222222222222222222222222222222222222");

        assert_eq!(vault_salt(a1), vault_salt(a1));
        assert_ne!(vault_salt(a1), vault_salt(a2));
    }

    #[test]
    fn estimate_is_deterministic_and_diverges_per_admin() {
        let factory = addr("0x00000000000000000000000000000000000000f1");
        let implementation = addr("0x00000000000000000000000000000000000000e2");
        let token = addr("0x0fF5393387ad2f9f691FD6Fd28e07E3969e27e63");
        let a1 = addr("0x1111111111111111111111111111111111111111");
        let a2 = addr("0x2222222222222222222222222222222222222222");
        let aa = addr("0x3333333333333333333333333333333333333333");

        let e1 = estimate_vault_address(factory, implementation, token, a1, aa, None);
        let e1_again = estimate_vault_address(factory, implementation, token, a1, aa, None);
        let e2 = estimate_vault_address(factory, implementation, token, a2, aa, None);

        assert_eq!(e1, e1_again);
        assert_ne!(e1.address, e2.address);
        assert!(!e1.exact_init_code);

        let exact = estimate_vault_address(
            factory,
            implementation,
            token,
            a1,
            aa,
            Some(&hex::decode("6080604052").unwrap()),
        );
        assert!(exact.exact_init_code);
        assert_ne!(exact.address, e1.address);
    }

    #[test]
    fn initialize_calldata_has_selector_and_three_words() {
        let token = addr("0x0fF5393387ad2f9f691FD6Fd28e07E3969e27e63");
        let admin = addr("0x1111111111111111111111111111111111111111");
        let aa = addr("0x2222222222222222222222222222222222222222");

        let data = initialize_calldata(token, admin, aa);
        assert_eq!(data.len(), 4 + 3 * 32);
        assert_eq!(
            &data[..4],
            &keccak256(b"initialize(address,address,address)")[..4]
        );
        // Address args are right-aligned in their 32-byte words.
        assert_eq!(&data[4 + 12..4 + 32], token.as_bytes());
        assert_eq!(&data[4 + 32 + 12..4 + 64], admin.as_bytes());
    }

    #[test]
    fn parse_address_rejects_malformed_input() {
        assert!(parse_address("0x1111111111111111111111111111111111111111").is_ok());
        assert!(matches!(
            parse_address("not-an-address"),
            Err(VaultError::InvalidAddress(_))
        ));
        assert!(parse_address("0x1111").is_err());
        assert!(parse_address("1111111111111111111111111111111111111111").is_err());
        assert!(parse_address("0xzz11111111111111111111111111111111111111").is_err());
    }
}
