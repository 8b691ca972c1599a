use ethers::contract::abigen;

// Minimal ERC20 ABI for executor-side prechecks.
//
// Only reads: the vault balance check avoids wasting gas on executeSpend()
// calls that would revert on transfer.
abigen!(
    Erc20,
    r#"[
        function balanceOf(address owner) view returns (uint256)
    ]"#
);
