mod agent;
mod bundler;
mod config;
mod encoding;
mod signer;
mod types;
mod vault_ops;

use agent::{AgentClient, CommandOutcome};
use anyhow::{anyhow, Context, Result};
use bundler::BundlerClient;
use clap::{Args, Parser, Subcommand};
use config::{load_deployment, Deployment};
use ethers::abi::{Abi, AbiParser};
use ethers::prelude::*;
use ethers::providers::Middleware;
use ethers::signers::Signer as _;
use paypai_vault::{estimate_vault_address, parse_address, vault_salt, RuleLedger, SpendingRule};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::Deserialize;
use signer::{SessionSigner, Signer};
use std::fs;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use types::UserOperation;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum StdoutMode {
    Normal,
    Json,
    OwnerEnvPath,
    OwnerAddress,
    SmartAccountAddress,
}

// Helper: in machine stdout modes, stdout carries exactly one scripting-friendly
// line; everything human-readable goes to stderr.
macro_rules! outln {
    ($machine_mode:expr, $($arg:tt)*) => {{
        if $machine_mode {
            eprintln!($($arg)*);
        } else {
            println!($($arg)*);
        }
    }};
}

#[derive(Parser, Debug)]
#[command(name = "paypai-aa", version)]
struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the counterfactual smart account address (and deployment status).
    Account(AccountArgs),

    /// Deploy the smart account by sending a self-targeted no-op user operation.
    Deploy(DeployArgs),

    /// Send ETH from the smart account.
    Send(SendArgs),

    /// Send an ERC-20 token from the smart account.
    SendErc20(SendErc20Args),

    /// Send an ERC-20 token directly from the owner EOA (no user operation).
    SendErc20Eoa(SendErc20EoaArgs),

    /// Approve an ERC-20 allowance from the smart account.
    Approve(ApproveArgs),

    /// Parse a natural-language command via Qwen and optionally submit it.
    Command(CommandArgs),

    /// Vault operations: prediction, deployment, rules, spends.
    #[command(subcommand)]
    Vault(VaultCommand),
}

#[derive(Subcommand, Debug)]
enum VaultCommand {
    /// Predict the vault address (local estimate + authoritative factory view).
    Address(VaultAddressArgs),

    /// Deploy the vault through the factory (direct EOA transaction).
    Deploy(VaultDeployArgs),

    /// Replace the vault's spending rules from a JSON file.
    Rules(VaultRulesArgs),

    /// Show vault configuration, rules, and balances.
    Info(VaultInfoArgs),

    /// Ask the vault whether a spend would currently be allowed.
    Check(VaultCheckArgs),

    /// Grant or revoke an executor.
    SetExecutor(VaultSetExecutorArgs),

    /// Withdraw funds from the vault (admin only, not subject to rules).
    Withdraw(VaultWithdrawArgs),

    /// Queue a spend request for the executor daemon.
    Request(VaultRequestArgs),
}

#[derive(Args, Debug)]
struct CommonArgs {
    /// Deployment artifact (chain, entrypoint, factories, settlement token).
    #[arg(long, default_value = "deployments/kite-testnet.json")]
    deployment: PathBuf,

    /// Override the chain RPC URL (otherwise uses deployment JSON).
    #[arg(long, env = "PAYPAI_AA_RPC_URL")]
    rpc: Option<String>,

    /// Override the EntryPoint address from the deployment JSON.
    #[arg(long, env = "PAYPAI_AA_ENTRYPOINT")]
    entrypoint: Option<String>,

    /// Override the smart-account factory address from the deployment JSON.
    #[arg(long, env = "PAYPAI_AA_FACTORY")]
    factory: Option<String>,

    /// Smart account owner private key.
    ///
    /// Recommended: set via env var PAYPAI_AA_OWNER_PRIVATE_KEY.
    #[arg(long, env = "PAYPAI_AA_OWNER_PRIVATE_KEY")]
    owner_private_key: Option<String>,

    /// Wallet-session JSON-RPC endpoint (signs via personal_sign).
    ///
    /// Use together with --session-address as an alternative to a raw key.
    #[arg(long, env = "PAYPAI_AA_SESSION_RPC")]
    session_rpc: Option<String>,

    /// Address of the unlocked account behind --session-rpc.
    #[arg(long, env = "PAYPAI_AA_SESSION_ADDRESS")]
    session_address: Option<String>,

    /// Generate a new random owner key and write it under .secrets/ locally.
    ///
    /// The private key is never printed; the env file should stay gitignored.
    #[arg(long, default_value_t = false)]
    new_owner: bool,

    /// With --new-owner: print the generated env file path to stdout as a
    /// single line (so scripts can `source "$(paypai-aa ... )"`).
    #[arg(long, default_value_t = false)]
    print_owner_env_path: bool,

    /// Print ONLY the owner address to stdout as a single line.
    #[arg(long, default_value_t = false)]
    print_owner: bool,

    /// Print ONLY the counterfactual smart account address to stdout.
    #[arg(long, default_value_t = false)]
    print_smart_account: bool,

    /// Print a single JSON object to stdout:
    /// `{ "owner": "0x...", "smartAccount": "0x...", "envPath": "/abs/path" }`
    #[arg(long, default_value_t = false)]
    json: bool,

    /// CREATE2 salt for the smart account.
    #[arg(long, default_value_t = 0)]
    salt: u64,
}

#[derive(Args, Clone, Debug)]
struct TxArgs {
    /// Bundler RPC URL (must support ERC-4337 JSON-RPC methods).
    ///
    /// Falls back to the deployment JSON's `bundler` field.
    #[arg(long, env = "PAYPAI_AA_BUNDLER_URL")]
    bundler: Option<String>,

    /// Gas price multiplier in basis points (e.g. 15000 = 1.5x).
    #[arg(long, default_value_t = 10000, env = "PAYPAI_AA_GAS_MULTIPLIER_BPS")]
    gas_multiplier_bps: u64,

    /// Do not send the UserOperation; only build + estimate gas.
    #[arg(long)]
    dry_run: bool,

    /// Do not wait for the userOp receipt.
    #[arg(long)]
    no_wait: bool,

    /// Max seconds to wait for userOp receipt. Use 0 to disable timeout.
    #[arg(long, default_value_t = 180)]
    max_wait_seconds: u64,
}

#[derive(Args, Debug)]
struct AccountArgs {
    #[command(flatten)]
    common: CommonArgs,
}

#[derive(Args, Debug)]
struct DeployArgs {
    #[command(flatten)]
    common: CommonArgs,

    #[command(flatten)]
    tx: TxArgs,

    /// Fund the smart account with ETH first (decimal amount, paid by the
    /// owner EOA; requires a raw-key signer).
    #[arg(long)]
    fund_eth: Option<String>,
}

#[derive(Args, Debug)]
struct SendArgs {
    #[command(flatten)]
    common: CommonArgs,

    #[command(flatten)]
    tx: TxArgs,

    /// Recipient address.
    #[arg(long)]
    recipient: String,

    /// Amount of ETH to send (decimal).
    #[arg(long)]
    amount: String,
}

#[derive(Args, Debug)]
struct SendErc20Args {
    #[command(flatten)]
    common: CommonArgs,

    #[command(flatten)]
    tx: TxArgs,

    /// Token address (defaults to the deployment's settlement token).
    #[arg(long)]
    token: Option<String>,

    /// Recipient address.
    #[arg(long)]
    recipient: String,

    /// Token amount (decimal).
    #[arg(long)]
    amount: String,

    /// Token decimals (defaults to the settlement token's decimals).
    #[arg(long)]
    decimals: Option<u32>,
}

#[derive(Args, Debug)]
struct SendErc20EoaArgs {
    #[command(flatten)]
    common: CommonArgs,

    /// Token address (defaults to the deployment's settlement token).
    #[arg(long)]
    token: Option<String>,

    /// Recipient address.
    #[arg(long)]
    recipient: String,

    /// Token amount (decimal).
    #[arg(long)]
    amount: String,

    /// Token decimals (defaults to the settlement token's decimals).
    #[arg(long)]
    decimals: Option<u32>,
}

#[derive(Args, Debug)]
struct ApproveArgs {
    #[command(flatten)]
    common: CommonArgs,

    #[command(flatten)]
    tx: TxArgs,

    /// Spender address (defaults to the signer's vault, resolved through the
    /// factory).
    #[arg(long)]
    spender: Option<String>,

    /// Token address (defaults to the deployment's settlement token).
    #[arg(long)]
    token: Option<String>,

    /// Allowance amount (decimal). Required unless --max is set.
    #[arg(long)]
    amount: Option<String>,

    /// Approve an unlimited allowance.
    #[arg(long, default_value_t = false)]
    max: bool,
}

#[derive(Args, Debug)]
struct CommandArgs {
    #[command(flatten)]
    common: CommonArgs,

    #[command(flatten)]
    tx: TxArgs,

    /// The natural-language command, e.g. "send 0.01 ETH to 0x...".
    text: String,

    /// Submit the parsed transaction as a user operation (otherwise the
    /// parsed command is only printed).
    #[arg(long, default_value_t = false)]
    submit: bool,
}

#[derive(Args, Debug)]
struct VaultAddressArgs {
    #[command(flatten)]
    common: CommonArgs,
}

#[derive(Args, Debug)]
struct VaultDeployArgs {
    #[command(flatten)]
    common: CommonArgs,
}

#[derive(Args, Debug)]
struct VaultRulesArgs {
    #[command(flatten)]
    common: CommonArgs,

    /// JSON file with the new rule set (replaces all existing rules).
    #[arg(long)]
    rules_file: PathBuf,

    /// Vault address (defaults to the signer's vault via the factory).
    #[arg(long)]
    vault: Option<String>,
}

#[derive(Args, Debug)]
struct VaultInfoArgs {
    #[command(flatten)]
    common: CommonArgs,

    /// Vault address (defaults to the signer's vault via the factory).
    #[arg(long)]
    vault: Option<String>,
}

#[derive(Args, Debug)]
struct VaultCheckArgs {
    #[command(flatten)]
    common: CommonArgs,

    /// Vault address (defaults to the signer's vault via the factory).
    #[arg(long)]
    vault: Option<String>,

    /// Spend amount (decimal, in settlement-token units).
    #[arg(long)]
    amount: String,

    /// The provider (recipient) the spend would pay.
    #[arg(long)]
    provider: String,
}

#[derive(Args, Debug)]
struct VaultSetExecutorArgs {
    #[command(flatten)]
    common: CommonArgs,

    /// Vault address (defaults to the signer's vault via the factory).
    #[arg(long)]
    vault: Option<String>,

    /// Executor address to toggle.
    #[arg(long)]
    executor: String,

    /// Grant (true) or revoke (false) authorization.
    #[arg(long)]
    allowed: bool,
}

#[derive(Args, Debug)]
struct VaultWithdrawArgs {
    #[command(flatten)]
    common: CommonArgs,

    /// Vault address (defaults to the signer's vault via the factory).
    #[arg(long)]
    vault: Option<String>,

    /// Token to withdraw (defaults to the deployment's settlement token).
    #[arg(long)]
    token: Option<String>,

    /// Amount to withdraw (decimal).
    #[arg(long)]
    amount: String,

    /// Recipient of the withdrawn funds (defaults to the owner EOA).
    #[arg(long)]
    recipient: Option<String>,
}

#[derive(Args, Debug)]
struct VaultRequestArgs {
    #[command(flatten)]
    common: CommonArgs,

    /// Vault address (defaults to the signer's vault via the factory).
    #[arg(long)]
    vault: Option<String>,

    /// Spend amount (decimal, in settlement-token units).
    #[arg(long)]
    amount: String,

    /// The provider (recipient) to pay.
    #[arg(long)]
    recipient: String,

    /// Optional free-text note stored with the request.
    #[arg(long)]
    note: Option<String>,

    /// Spend-request spool consumed by paypai-executor.
    #[arg(long, default_value = "executor-rs/state/requests.json")]
    spool: PathBuf,
}

/// Everything a command needs, resolved once at startup and passed down.
struct Ctx {
    dep: Deployment,
    provider: Provider<Http>,
    client: Arc<Provider<Http>>,
    chain_id: u64,
    mode: StdoutMode,
    machine: bool,
    signer: Signer,
    owner: Address,
    entry_point: Address,
    account_factory: Address,
    owner_env_path: Option<PathBuf>,
    salt: U256,
}

impl Ctx {
    /// Print the per-invocation owner/account lines the stdout mode asks for.
    fn announce(&self, account: Address, deployed: bool) {
        if let Some(p) = self.owner_env_path.as_ref() {
            match self.mode {
                StdoutMode::OwnerEnvPath => {
                    println!("{}", p.display());
                    eprintln!("generated new owner key; saved to {}", p.display());
                }
                StdoutMode::Json => {
                    eprintln!("generated new owner key; saved to {}", p.display());
                }
                _ => {
                    outln!(self.machine, "generated new owner key; saved to {}", p.display());
                }
            }
        }

        match self.mode {
            StdoutMode::OwnerAddress => println!("{}", self.owner),
            StdoutMode::SmartAccountAddress => println!("{}", account),
            StdoutMode::Json => {
                let env_path = self.owner_env_path.as_ref().map(|p| p.display().to_string());
                let out = serde_json::json!({
                    "owner": encoding::fmt_address(self.owner),
                    "smartAccount": encoding::fmt_address(account),
                    "envPath": env_path,
                });
                println!("{}", out);
            }
            _ => {}
        }

        outln!(self.machine, "smartAccount: {} (deployed={})", account, deployed);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        // Logs always go to stderr so stdout stays scripting-friendly.
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.cmd {
        Command::Account(args) => cmd_account(args).await,
        Command::Deploy(args) => cmd_deploy(args).await,
        Command::Send(args) => cmd_send(args).await,
        Command::SendErc20(args) => cmd_send_erc20(args).await,
        Command::SendErc20Eoa(args) => cmd_send_erc20_eoa(args).await,
        Command::Approve(args) => cmd_approve(args).await,
        Command::Command(args) => cmd_command(args).await,
        Command::Vault(vault_cmd) => match vault_cmd {
            VaultCommand::Address(args) => cmd_vault_address(args).await,
            VaultCommand::Deploy(args) => cmd_vault_deploy(args).await,
            VaultCommand::Rules(args) => cmd_vault_rules(args).await,
            VaultCommand::Info(args) => cmd_vault_info(args).await,
            VaultCommand::Check(args) => cmd_vault_check(args).await,
            VaultCommand::SetExecutor(args) => cmd_vault_set_executor(args).await,
            VaultCommand::Withdraw(args) => cmd_vault_withdraw(args).await,
            VaultCommand::Request(args) => cmd_vault_request(args).await,
        },
    }
}

async fn setup(common: &CommonArgs) -> Result<Ctx> {
    let dep = load_deployment(&common.deployment, common.rpc.clone())?;

    let mode = stdout_mode(common)?;
    let machine = mode != StdoutMode::Normal;

    let provider =
        Provider::<Http>::try_from(dep.rpc_url.as_str())?.interval(Duration::from_millis(350));

    let chain_id = provider.get_chainid().await?.as_u64();
    if chain_id != dep.chain_id {
        return Err(anyhow!(
            "chainId mismatch: deployment has {}, RPC returned {}",
            dep.chain_id,
            chain_id
        ));
    }

    let entry_point = match common.entrypoint.as_deref() {
        Some(s) => Address::from_str(s).context("invalid --entrypoint address")?,
        None => dep.entry_point,
    };
    let account_factory = match common.factory.as_deref() {
        Some(s) => Address::from_str(s).context("invalid --factory address")?,
        None => dep.account_factory,
    };

    let (signer, owner, owner_key_path) = load_or_generate_signer(common, chain_id)?;
    let owner_env_path = owner_key_path.map(|p| p.canonicalize().unwrap_or(p));

    Ok(Ctx {
        client: Arc::new(provider.clone()),
        provider,
        dep,
        chain_id,
        mode,
        machine,
        signer,
        owner,
        entry_point,
        account_factory,
        owner_env_path,
        salt: U256::from(common.salt),
    })
}

fn stdout_mode(common: &CommonArgs) -> Result<StdoutMode> {
    let picked = [
        common.print_owner_env_path,
        common.print_owner,
        common.print_smart_account,
        common.json,
    ]
    .iter()
    .filter(|b| **b)
    .count();

    if picked > 1 {
        return Err(anyhow!(
            "--print-owner-env-path, --print-owner, --print-smart-account, and --json are mutually exclusive"
        ));
    }

    if common.print_owner_env_path {
        if !common.new_owner {
            return Err(anyhow!("--print-owner-env-path requires --new-owner"));
        }
        return Ok(StdoutMode::OwnerEnvPath);
    }
    if common.print_owner {
        return Ok(StdoutMode::OwnerAddress);
    }
    if common.print_smart_account {
        return Ok(StdoutMode::SmartAccountAddress);
    }
    if common.json {
        return Ok(StdoutMode::Json);
    }

    Ok(StdoutMode::Normal)
}

fn choose_secrets_dir() -> Result<PathBuf> {
    // Prefer the repo root `.secrets/` even when run from a subdirectory.
    // Heuristic: walk up a few directories looking for `deployments/` or `.git/`.
    let mut dir = std::env::current_dir().context("failed to read current dir")?;

    for _ in 0..6 {
        if dir.join(".git").exists() || dir.join("deployments").is_dir() {
            return Ok(dir.join(".secrets"));
        }
        if !dir.pop() {
            break;
        }
    }

    let cwd = std::env::current_dir().context("failed to read current dir")?;
    Ok(cwd.join(".secrets"))
}

fn write_owner_env_file(path: &PathBuf, owner: Address, private_key_hex: &str) -> Result<()> {
    let contents = format!(
        "# Generated by paypai-aa --new-owner\n# DO NOT COMMIT THIS FILE.\nexport PAYPAI_AA_OWNER_PRIVATE_KEY={}\nexport PAYPAI_AA_OWNER_ADDRESS={}\n",
        private_key_hex, owner
    );

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).context("failed to create .secrets dir")?;
    }
    fs::write(path, contents).with_context(|| format!("failed to write {}", path.display()))?;

    // Best-effort restrictive permissions (unix).
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perm = fs::Permissions::from_mode(0o600);
        let _ = fs::set_permissions(path, perm);
    }

    Ok(())
}

fn generate_random_wallet(chain_id: u64) -> Result<(LocalWallet, Address, String)> {
    let mut rng = OsRng;
    // Very low probability of invalid key; loop until LocalWallet accepts.
    for _ in 0..64 {
        let mut bytes = [0u8; 32];
        rng.fill_bytes(&mut bytes);
        if bytes.iter().all(|b| *b == 0) {
            continue;
        }
        let pk_hex = format!("0x{}", hex::encode(bytes));
        if let Ok(mut wallet) = LocalWallet::from_str(&pk_hex) {
            wallet = wallet.with_chain_id(chain_id);
            let owner = wallet.address();
            return Ok((wallet, owner, pk_hex));
        }
    }
    Err(anyhow!(
        "failed to generate a valid random private key after multiple attempts"
    ))
}

/// Decide the signer once, here, at the boundary.
///
/// Raw key and wallet session are mutually exclusive; downstream code holds a
/// single `Signer` and never re-branches on its kind.
fn load_or_generate_signer(
    common: &CommonArgs,
    chain_id: u64,
) -> Result<(Signer, Address, Option<PathBuf>)> {
    if common.new_owner {
        let (wallet, owner, pk_hex) = generate_random_wallet(chain_id)?;

        let secrets_dir = choose_secrets_dir()?;
        let fname = format!("aa_owner_{}.env", hex::encode(owner.as_bytes()));
        let path = secrets_dir.join(fname);
        write_owner_env_file(&path, owner, &pk_hex)?;
        return Ok((Signer::RawKey(wallet), owner, Some(path)));
    }

    let has_session = common.session_rpc.is_some() || common.session_address.is_some();
    if common.owner_private_key.is_some() && has_session {
        return Err(anyhow!(
            "choose one signer: --owner-private-key or --session-rpc/--session-address, not both"
        ));
    }

    if let Some(owner_pk) = common.owner_private_key.clone() {
        let mut wallet = LocalWallet::from_str(&owner_pk).context("invalid owner private key")?;
        wallet = wallet.with_chain_id(chain_id);
        let owner = wallet.address();
        return Ok((Signer::RawKey(wallet), owner, None));
    }

    if has_session {
        let rpc = common
            .session_rpc
            .clone()
            .ok_or_else(|| anyhow!("--session-address requires --session-rpc"))?;
        let addr_raw = common
            .session_address
            .clone()
            .ok_or_else(|| anyhow!("--session-rpc requires --session-address"))?;
        let address = parse_address(&addr_raw).map_err(|e| anyhow!("{e}"))?;
        return Ok((
            Signer::Session(SessionSigner::new(rpc, address)),
            address,
            None,
        ));
    }

    Err(anyhow!(
        "no signer: set PAYPAI_AA_OWNER_PRIVATE_KEY (or --owner-private-key), pass \
         --session-rpc/--session-address, or use --new-owner"
    ))
}

async fn compute_account_address<M: Middleware + 'static>(
    client: Arc<M>,
    factory: Address,
    owner: Address,
    salt: U256,
) -> Result<(Address, bool)> {
    let factory_abi = AbiParser::default()
        .parse(&["function getAddress(address owner, uint256 salt) view returns (address)"])?;
    let factory_c = Contract::new(factory, factory_abi, client.clone());

    let account: Address = factory_c
        .method("getAddress", (owner, salt))?
        .call()
        .await
        .context("factory.getAddress failed")?;

    let code = client
        .get_code(account, None)
        .await
        .context("eth_getCode failed")?;

    Ok((account, !code.as_ref().is_empty()))
}

async fn fetch_entrypoint_nonce<M: Middleware + 'static>(
    client: Arc<M>,
    entry_point: Address,
    account: Address,
) -> Result<U256> {
    let entrypoint_abi = AbiParser::default()
        .parse(&["function getNonce(address sender, uint192 key) view returns (uint256)"])?;
    let entrypoint_c = Contract::new(entry_point, entrypoint_abi, client);

    let nonce: U256 = entrypoint_c
        .method("getNonce", (account, U256::zero()))?
        .call()
        .await
        .context("entryPoint.getNonce failed")?;
    Ok(nonce)
}

async fn build_init_code<M: Middleware + 'static>(
    client: Arc<M>,
    factory: Address,
    owner: Address,
    salt: U256,
    deployed: bool,
) -> Result<Bytes> {
    if deployed {
        return Ok(Bytes::default());
    }
    let factory_abi = AbiParser::default()
        .parse(&["function createAccount(address owner, uint256 salt) returns (address)"])?;
    let factory_c = Contract::new(factory, factory_abi, client);
    let create_calldata = factory_c
        .method::<_, Address>("createAccount", (owner, salt))?
        .calldata()
        .ok_or_else(|| anyhow!("failed to build createAccount calldata"))?;

    let mut v = Vec::with_capacity(20 + create_calldata.len());
    v.extend_from_slice(factory.as_bytes());
    v.extend_from_slice(create_calldata.as_ref());
    Ok(Bytes::from(v))
}

/// Payload for `SimpleAccount.execute(dest, value, func)` plus the nonce and
/// initCode the op needs.
async fn build_execute_payload(
    ctx: &Ctx,
    account: Address,
    deployed: bool,
    target: Address,
    value: U256,
    data: Bytes,
) -> Result<(Bytes, Bytes, U256)> {
    let nonce = fetch_entrypoint_nonce(ctx.client.clone(), ctx.entry_point, account).await?;
    let init_code = build_init_code(
        ctx.client.clone(),
        ctx.account_factory,
        ctx.owner,
        ctx.salt,
        deployed,
    )
    .await?;

    let account_abi = AbiParser::default()
        .parse(&["function execute(address dest, uint256 value, bytes func)"])?;
    let account_c = Contract::new(account, account_abi, ctx.client.clone());
    let call_data = account_c
        .method::<_, ()>("execute", (target, value, data))?
        .calldata()
        .ok_or_else(|| anyhow!("failed to build execute calldata"))?;

    Ok((call_data, init_code, nonce))
}

async fn sign_userop(ctx: &Ctx, op: &mut UserOperation) -> Result<()> {
    // Use the on-chain EntryPoint.getUserOpHash for correctness.
    let entrypoint_abi: Abi = serde_json::from_str(
        r#"[{"inputs":[{"components":[{"internalType":"address","name":"sender","type":"address"},{"internalType":"uint256","name":"nonce","type":"uint256"},{"internalType":"bytes","name":"initCode","type":"bytes"},{"internalType":"bytes","name":"callData","type":"bytes"},{"internalType":"uint256","name":"callGasLimit","type":"uint256"},{"internalType":"uint256","name":"verificationGasLimit","type":"uint256"},{"internalType":"uint256","name":"preVerificationGas","type":"uint256"},{"internalType":"uint256","name":"maxFeePerGas","type":"uint256"},{"internalType":"uint256","name":"maxPriorityFeePerGas","type":"uint256"},{"internalType":"bytes","name":"paymasterAndData","type":"bytes"},{"internalType":"bytes","name":"signature","type":"bytes"}],"internalType":"struct UserOperation","name":"userOp","type":"tuple"}],"name":"getUserOpHash","outputs":[{"internalType":"bytes32","name":"","type":"bytes32"}],"stateMutability":"view","type":"function"}]"#,
    )
    .context("failed to parse EntryPoint ABI")?;

    let entrypoint_c = Contract::new(ctx.entry_point, entrypoint_abi, ctx.client.clone());

    let user_op_hash: H256 = entrypoint_c
        .method("getUserOpHash", (op.as_abi_tuple(),))?
        .call()
        .await
        .context("entryPoint.getUserOpHash failed")?;

    op.signature = ctx.signer.sign_digest(user_op_hash).await?;
    Ok(())
}

/// Estimate, sign, and submit a user operation, then wait for its receipt.
/// Returns true when a receipt was fetched (neither --dry-run nor --no-wait
/// cut the flow short).
async fn send_userop(
    ctx: &Ctx,
    account: Address,
    call_data: Bytes,
    init_code: Bytes,
    nonce: U256,
    tx: &TxArgs,
) -> Result<bool> {
    let bundler_url = tx
        .bundler
        .clone()
        .or_else(|| ctx.dep.bundler_url.clone())
        .ok_or_else(|| {
            anyhow!("no bundler URL: pass --bundler, set PAYPAI_AA_BUNDLER_URL, or add `bundler` to the deployment JSON")
        })?;

    // Fee data (fallback to gas price for providers without EIP-1559 helpers).
    let gas_price = ctx
        .provider
        .get_gas_price()
        .await
        .context("failed to fetch gas price")?;
    let bps = tx.gas_multiplier_bps.max(1);
    let max_priority_fee_per_gas = gas_price * U256::from(bps) / U256::from(10_000u64);
    let max_fee_per_gas = max_priority_fee_per_gas;

    if bps != 10_000 {
        tracing::info!(
            "gas multiplier applied: {} bps (maxFeePerGas={}, maxPriorityFeePerGas={})",
            bps,
            max_fee_per_gas,
            max_priority_fee_per_gas
        );
    }

    let mut op = UserOperation::unsigned(
        account,
        nonce,
        init_code,
        call_data,
        max_fee_per_gas,
        max_priority_fee_per_gas,
    );

    let bundler = BundlerClient::new(bundler_url);

    // Sign for estimation, then re-sign with the estimated gas limits.
    sign_userop(ctx, &mut op).await?;

    let est = bundler
        .estimate_user_operation_gas(&op, ctx.entry_point)
        .await
        .context("bundler gas estimate failed")?;
    op.call_gas_limit = est.call_gas_limit;
    op.verification_gas_limit = est.verification_gas_limit;
    op.pre_verification_gas = est.pre_verification_gas;

    sign_userop(ctx, &mut op).await?;

    outln!(
        ctx.machine,
        "\nUserOperation (final):\n{}",
        serde_json::to_string_pretty(&encoding::user_op_to_json(&op))?
    );

    if tx.dry_run {
        outln!(ctx.machine, "\n--dry-run set: not sending user operation.");
        return Ok(false);
    }

    let user_op_hash = bundler
        .send_user_operation(&op, ctx.entry_point)
        .await
        .context("bundler send failed")?;

    outln!(ctx.machine, "\nuserOpHash: {}", encoding::fmt_h256(user_op_hash));

    if tx.no_wait {
        outln!(ctx.machine, "--no-wait set: not waiting for receipt.");
        return Ok(false);
    }

    let receipt = bundler
        .wait_user_operation_receipt(user_op_hash, Duration::from_secs(tx.max_wait_seconds))
        .await
        .context("failed waiting for userOp receipt")?;

    outln!(
        ctx.machine,
        "\nUserOp receipt:\n{}",
        serde_json::to_string_pretty(&receipt)?
    );

    Ok(true)
}

/// Direct EOA transaction (requires a raw-key signer). Waits for the receipt
/// and fails on revert.
async fn send_eoa_tx(ctx: &Ctx, to: Address, data: Bytes, value: U256) -> Result<TransactionReceipt> {
    let wallet = ctx.signer.raw_wallet()?.clone();
    let client = Arc::new(SignerMiddleware::new(ctx.provider.clone(), wallet));

    let tx = TransactionRequest::new().to(to).data(data).value(value);
    let pending = client
        .send_transaction(tx, None)
        .await
        .context("failed to send transaction")?;

    let receipt = pending
        .await
        .context("failed waiting for transaction receipt")?
        .ok_or_else(|| anyhow!("transaction dropped from mempool"))?;

    if receipt.status != Some(U64::from(1)) {
        return Err(anyhow!(
            "transaction {} mined but reverted",
            encoding::fmt_h256(receipt.transaction_hash)
        ));
    }
    Ok(receipt)
}

async fn erc20_transfer_calldata(ctx: &Ctx, recipient: Address, amount: U256) -> Result<Bytes> {
    let erc20_abi = AbiParser::default()
        .parse(&["function transfer(address to, uint256 amount) returns (bool)"])?;
    // The contract address is irrelevant for calldata construction.
    let erc20 = Contract::new(Address::zero(), erc20_abi, ctx.client.clone());
    erc20
        .method::<_, bool>("transfer", (recipient, amount))?
        .calldata()
        .ok_or_else(|| anyhow!("failed to build transfer calldata"))
}

/// Resolve the token and decimals a command operates on.
fn resolve_token(ctx: &Ctx, token: Option<&str>, decimals: Option<u32>) -> Result<(Address, u32)> {
    match token {
        Some(raw) => {
            let addr = parse_address(raw).map_err(|e| anyhow!("{e}"))?;
            Ok((addr, decimals.unwrap_or(ctx.dep.settlement_token_decimals)))
        }
        None => Ok((
            ctx.dep.settlement_token,
            decimals.unwrap_or(ctx.dep.settlement_token_decimals),
        )),
    }
}

/// The signer's vault address: explicit flag, or the factory's authoritative
/// prediction for (owner, smart account, salt scheme).
async fn resolve_vault(ctx: &Ctx, vault_flag: Option<&str>) -> Result<Address> {
    if let Some(raw) = vault_flag {
        return parse_address(raw).map_err(|e| anyhow!("{e}"));
    }

    let factory = ctx
        .dep
        .vault_factory
        .ok_or_else(|| anyhow!("no vault factory configured; pass --vault explicitly"))?;
    let (account, _) = compute_account_address(
        ctx.client.clone(),
        ctx.account_factory,
        ctx.owner,
        ctx.salt,
    )
    .await?;
    let salt = vault_salt(ctx.owner);
    vault_ops::get_vault_address(ctx.client.clone(), factory, ctx.owner, account, salt).await
}

fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|_| Duration::from_secs(0))
        .as_secs()
}

async fn cmd_account(args: AccountArgs) -> Result<()> {
    let ctx = setup(&args.common).await?;

    let (account, deployed) = compute_account_address(
        ctx.client.clone(),
        ctx.account_factory,
        ctx.owner,
        ctx.salt,
    )
    .await?;

    ctx.announce(account, deployed);

    outln!(ctx.machine, "chainId:        {}", ctx.chain_id);
    outln!(ctx.machine, "entryPoint:     {}", ctx.entry_point);
    outln!(ctx.machine, "accountFactory: {}", ctx.account_factory);
    outln!(ctx.machine, "owner:          {}", ctx.owner);

    Ok(())
}

async fn cmd_deploy(args: DeployArgs) -> Result<()> {
    let ctx = setup(&args.common).await?;

    let (account, deployed) = compute_account_address(
        ctx.client.clone(),
        ctx.account_factory,
        ctx.owner,
        ctx.salt,
    )
    .await?;
    ctx.announce(account, deployed);

    if deployed {
        outln!(ctx.machine, "smart account is already deployed; nothing to do.");
        return Ok(());
    }

    if let Some(eth) = args.fund_eth.clone() {
        let amount_wei = ethers::utils::parse_ether(eth.clone())
            .with_context(|| format!("invalid --fund-eth value: {eth}"))?;
        if !amount_wei.is_zero() {
            send_eoa_tx(&ctx, account, Bytes::default(), amount_wei).await?;
            tracing::info!("funded smart account with {} wei", amount_wei);
        }
    }

    // A no-op self-call; the initCode in the op does the actual deployment.
    let (call_data, init_code, nonce) =
        build_execute_payload(&ctx, account, deployed, ctx.owner, U256::zero(), Bytes::default())
            .await?;

    send_userop(&ctx, account, call_data, init_code, nonce, &args.tx).await?;
    Ok(())
}

async fn cmd_send(args: SendArgs) -> Result<()> {
    let ctx = setup(&args.common).await?;

    let recipient = parse_address(&args.recipient).map_err(|e| anyhow!("{e}"))?;
    let amount_wei = encoding::parse_positive_amount(&args.amount, 18)?;

    let (account, deployed) = compute_account_address(
        ctx.client.clone(),
        ctx.account_factory,
        ctx.owner,
        ctx.salt,
    )
    .await?;
    ctx.announce(account, deployed);

    let (call_data, init_code, nonce) =
        build_execute_payload(&ctx, account, deployed, recipient, amount_wei, Bytes::default())
            .await?;

    send_userop(&ctx, account, call_data, init_code, nonce, &args.tx).await?;
    Ok(())
}

async fn cmd_send_erc20(args: SendErc20Args) -> Result<()> {
    let ctx = setup(&args.common).await?;

    let recipient = parse_address(&args.recipient).map_err(|e| anyhow!("{e}"))?;
    let (token, decimals) = resolve_token(&ctx, args.token.as_deref(), args.decimals)?;
    let amount = encoding::parse_positive_amount(&args.amount, decimals)?;

    let (account, deployed) = compute_account_address(
        ctx.client.clone(),
        ctx.account_factory,
        ctx.owner,
        ctx.salt,
    )
    .await?;
    ctx.announce(account, deployed);

    let transfer = erc20_transfer_calldata(&ctx, recipient, amount).await?;
    let (call_data, init_code, nonce) =
        build_execute_payload(&ctx, account, deployed, token, U256::zero(), transfer).await?;

    send_userop(&ctx, account, call_data, init_code, nonce, &args.tx).await?;
    Ok(())
}

async fn cmd_send_erc20_eoa(args: SendErc20EoaArgs) -> Result<()> {
    let ctx = setup(&args.common).await?;

    let recipient = parse_address(&args.recipient).map_err(|e| anyhow!("{e}"))?;
    let (token, decimals) = resolve_token(&ctx, args.token.as_deref(), args.decimals)?;
    let amount = encoding::parse_positive_amount(&args.amount, decimals)?;

    let transfer = erc20_transfer_calldata(&ctx, recipient, amount).await?;
    let receipt = send_eoa_tx(&ctx, token, transfer, U256::zero()).await?;

    outln!(
        ctx.machine,
        "transferred {} ({} base units) to {}\ntx: {}",
        encoding::format_amount(amount, decimals),
        amount,
        recipient,
        encoding::fmt_h256(receipt.transaction_hash)
    );
    Ok(())
}

async fn cmd_approve(args: ApproveArgs) -> Result<()> {
    let ctx = setup(&args.common).await?;

    let (token, decimals) = resolve_token(&ctx, args.token.as_deref(), None)?;
    let amount = if args.max {
        U256::MAX
    } else {
        let raw = args
            .amount
            .as_deref()
            .ok_or_else(|| anyhow!("pass --amount or --max"))?;
        encoding::parse_positive_amount(raw, decimals)?
    };

    let spender = match args.spender.as_deref() {
        Some(raw) => parse_address(raw).map_err(|e| anyhow!("{e}"))?,
        None => resolve_vault(&ctx, None).await?,
    };

    let (account, deployed) = compute_account_address(
        ctx.client.clone(),
        ctx.account_factory,
        ctx.owner,
        ctx.salt,
    )
    .await?;
    ctx.announce(account, deployed);
    outln!(ctx.machine, "approving spender {} on token {}", spender, token);

    let erc20_abi = AbiParser::default()
        .parse(&["function approve(address spender, uint256 amount) returns (bool)"])?;
    let erc20 = Contract::new(token, erc20_abi, ctx.client.clone());
    let approve_calldata = erc20
        .method::<_, bool>("approve", (spender, amount))?
        .calldata()
        .ok_or_else(|| anyhow!("failed to build approve calldata"))?;

    let (call_data, init_code, nonce) =
        build_execute_payload(&ctx, account, deployed, token, U256::zero(), approve_calldata)
            .await?;

    send_userop(&ctx, account, call_data, init_code, nonce, &args.tx).await?;
    Ok(())
}

async fn cmd_command(args: CommandArgs) -> Result<()> {
    let ctx = setup(&args.common).await?;

    let agent = AgentClient::from_env()?;
    let outcome = agent
        .parse_command(&args.text)
        .await
        .context("Qwen command parsing failed")?;

    let cmd = match outcome {
        CommandOutcome::ParseError { reason } => {
            return Err(anyhow!("could not parse command: {reason}"));
        }
        CommandOutcome::Parsed(cmd) => cmd,
    };

    outln!(
        ctx.machine,
        "parsed command: action={} recipient={} amount={} token={}",
        cmd.action,
        cmd.recipient,
        cmd.amount,
        cmd.token
    );

    if !args.submit {
        outln!(ctx.machine, "(pass --submit to execute this as a user operation)");
        return Ok(());
    }

    let (account, deployed) = compute_account_address(
        ctx.client.clone(),
        ctx.account_factory,
        ctx.owner,
        ctx.salt,
    )
    .await?;
    ctx.announce(account, deployed);

    let (call_data, init_code, nonce) = if cmd.token.eq_ignore_ascii_case("eth") {
        let amount_wei = encoding::parse_positive_amount(&cmd.amount, 18)?;
        build_execute_payload(&ctx, account, deployed, cmd.recipient, amount_wei, Bytes::default())
            .await?
    } else {
        // Any non-ETH token routes through the settlement token, the only
        // ERC-20 this deployment transacts in.
        let amount =
            encoding::parse_positive_amount(&cmd.amount, ctx.dep.settlement_token_decimals)?;
        let transfer = erc20_transfer_calldata(&ctx, cmd.recipient, amount).await?;
        build_execute_payload(
            &ctx,
            account,
            deployed,
            ctx.dep.settlement_token,
            U256::zero(),
            transfer,
        )
        .await?
    };

    send_userop(&ctx, account, call_data, init_code, nonce, &args.tx).await?;
    Ok(())
}

async fn cmd_vault_address(args: VaultAddressArgs) -> Result<()> {
    let ctx = setup(&args.common).await?;

    let (account, account_deployed) = compute_account_address(
        ctx.client.clone(),
        ctx.account_factory,
        ctx.owner,
        ctx.salt,
    )
    .await?;
    ctx.announce(account, account_deployed);

    let salt = vault_salt(ctx.owner);
    outln!(ctx.machine, "vaultSalt:      {}", encoding::fmt_h256(salt));

    // Local estimate first: useful before any factory exists, but display
    // only, since the init-code hash omits the factory's proxy bytecode.
    if let Some(implementation) = ctx.dep.vault_implementation {
        let factory_for_estimate = ctx.dep.vault_factory.unwrap_or(Address::zero());
        let estimate = estimate_vault_address(
            factory_for_estimate,
            implementation,
            ctx.dep.settlement_token,
            ctx.owner,
            account,
            None,
        );
        outln!(
            ctx.machine,
            "localEstimate:  {} (display only{})",
            estimate.address,
            if estimate.exact_init_code { "" } else { ", inexact init code" }
        );
    } else {
        outln!(ctx.machine, "localEstimate:  unavailable (no vault implementation configured)");
    }

    // Authoritative answer once a factory is on-chain.
    match ctx.dep.vault_factory {
        Some(factory) => {
            let vault =
                vault_ops::get_vault_address(ctx.client.clone(), factory, ctx.owner, account, salt)
                    .await?;
            let code = ctx
                .client
                .get_code(vault, None)
                .await
                .context("eth_getCode failed")?;
            let deployed = !code.as_ref().is_empty();

            outln!(ctx.machine, "vaultFactory:   {}", factory);
            outln!(ctx.machine, "vaultAddress:   {} (authoritative)", vault);
            outln!(ctx.machine, "vaultDeployed:  {}", deployed);
        }
        None => {
            outln!(
                ctx.machine,
                "vaultAddress:   unavailable (factory not deployed; do not fund the local estimate)"
            );
        }
    }

    Ok(())
}

async fn cmd_vault_deploy(args: VaultDeployArgs) -> Result<()> {
    let ctx = setup(&args.common).await?;

    let factory = ctx
        .dep
        .vault_factory
        .ok_or_else(|| anyhow!("no vault factory configured in the deployment JSON"))?;

    let (account, account_deployed) = compute_account_address(
        ctx.client.clone(),
        ctx.account_factory,
        ctx.owner,
        ctx.salt,
    )
    .await?;
    ctx.announce(account, account_deployed);

    let salt = vault_salt(ctx.owner);
    let predicted =
        vault_ops::get_vault_address(ctx.client.clone(), factory, ctx.owner, account, salt).await?;

    let code = ctx.client.get_code(predicted, None).await?;
    if !code.as_ref().is_empty() {
        outln!(ctx.machine, "vault already deployed at {}", predicted);
        return Ok(());
    }

    outln!(ctx.machine, "deploying vault for admin {} (spendingAccount {})", ctx.owner, account);

    let calldata = vault_ops::deploy_deterministic_calldata(ctx.owner, account, salt);
    let receipt = send_eoa_tx(&ctx, factory, calldata, U256::zero()).await?;

    let vault =
        vault_ops::get_vault_address(ctx.client.clone(), factory, ctx.owner, account, salt).await?;

    outln!(
        ctx.machine,
        "vault deployed at {} (tx {})",
        vault,
        encoding::fmt_h256(receipt.transaction_hash)
    );
    Ok(())
}

/// One entry of the `vault rules` JSON file.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct RuleFileEntry {
    /// Token address; defaults to the deployment's settlement token.
    #[serde(default)]
    token: Option<String>,
    time_window_secs: u64,
    /// Budget per window, decimal, in human token units.
    budget: String,
    #[serde(default)]
    decimals: Option<u32>,
    /// Window-0 anchor; 0 or absent means "now".
    #[serde(default)]
    initial_window_start_time: u64,
    #[serde(default)]
    whitelist: Vec<String>,
    #[serde(default)]
    blacklist: Vec<String>,
}

fn rules_from_file(ctx: &Ctx, path: &PathBuf) -> Result<Vec<SpendingRule>> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read rules file {}", path.display()))?;
    let entries: Vec<RuleFileEntry> = serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse rules file {}", path.display()))?;

    let now = now_unix();
    let mut rules = Vec::with_capacity(entries.len());
    for entry in entries {
        let token = match entry.token.as_deref() {
            Some(raw) => parse_address(raw).map_err(|e| anyhow!("{e}"))?,
            None => ctx.dep.settlement_token,
        };
        let decimals = entry.decimals.unwrap_or(ctx.dep.settlement_token_decimals);
        let budget = encoding::parse_positive_amount(&entry.budget, decimals)?;
        let start = if entry.initial_window_start_time == 0 {
            now
        } else {
            entry.initial_window_start_time
        };

        let parse_list = |list: &[String]| -> Result<Vec<Address>> {
            list.iter()
                .map(|s| parse_address(s).map_err(|e| anyhow!("{e}")))
                .collect()
        };

        rules.push(SpendingRule {
            token,
            time_window: entry.time_window_secs,
            budget,
            initial_window_start_time: start,
            whitelist: parse_list(&entry.whitelist)?,
            blacklist: parse_list(&entry.blacklist)?,
        });
    }

    // Local validation (window > 0, one rule per token) before any gas is spent.
    let mut ledger = RuleLedger::new();
    ledger
        .configure_rules(rules.clone())
        .map_err(|e| anyhow!("{e}"))?;

    Ok(rules)
}

async fn cmd_vault_rules(args: VaultRulesArgs) -> Result<()> {
    let ctx = setup(&args.common).await?;

    let vault = resolve_vault(&ctx, args.vault.as_deref()).await?;
    ensure_deployed(&ctx, vault, "vault").await?;

    let rules = rules_from_file(&ctx, &args.rules_file)?;
    outln!(
        ctx.machine,
        "replacing spending rules on {} with {} rule(s)",
        vault,
        rules.len()
    );

    let calldata = vault_ops::configure_rules_calldata(&rules);
    let receipt = send_eoa_tx(&ctx, vault, calldata, U256::zero()).await?;

    outln!(
        ctx.machine,
        "rules configured (tx {})",
        encoding::fmt_h256(receipt.transaction_hash)
    );
    Ok(())
}

async fn cmd_vault_info(args: VaultInfoArgs) -> Result<()> {
    let ctx = setup(&args.common).await?;

    let vault = resolve_vault(&ctx, args.vault.as_deref()).await?;
    ensure_deployed(&ctx, vault, "vault").await?;

    let settlement = vault_ops::settlement_token(ctx.client.clone(), vault).await?;
    let admin = vault_ops::vault_owner(ctx.client.clone(), vault).await?;
    let rules = vault_ops::get_spending_rules(ctx.client.clone(), vault).await?;
    let eth_balance = ctx.client.get_balance(vault, None).await?;

    let erc20_abi = AbiParser::default()
        .parse(&["function balanceOf(address owner) view returns (uint256)"])?;
    let token_c = Contract::new(settlement, erc20_abi, ctx.client.clone());
    let token_balance: U256 = token_c.method("balanceOf", vault)?.call().await?;

    outln!(ctx.machine, "vault:           {}", vault);
    outln!(ctx.machine, "admin:           {}", admin);
    outln!(ctx.machine, "settlementToken: {}", settlement);
    outln!(
        ctx.machine,
        "tokenBalance:    {}",
        encoding::format_amount(token_balance, ctx.dep.settlement_token_decimals)
    );
    outln!(ctx.machine, "ethBalance:      {} wei", eth_balance);
    outln!(ctx.machine, "rules:           {}", rules.len());

    for rule in rules {
        outln!(
            ctx.machine,
            "  token={} window={}s budget={} start={} whitelist={} blacklist={}",
            rule.token,
            rule.time_window,
            rule.budget,
            rule.initial_window_start_time,
            rule.whitelist.len(),
            rule.blacklist.len()
        );
    }

    Ok(())
}

async fn cmd_vault_check(args: VaultCheckArgs) -> Result<()> {
    let ctx = setup(&args.common).await?;

    let provider_addr = parse_address(&args.provider).map_err(|e| anyhow!("{e}"))?;
    let amount =
        encoding::parse_positive_amount(&args.amount, ctx.dep.settlement_token_decimals)?;

    let vault = resolve_vault(&ctx, args.vault.as_deref()).await?;
    ensure_deployed(&ctx, vault, "vault").await?;

    let allowed =
        vault_ops::check_spend_allowed(ctx.client.clone(), vault, amount, provider_addr).await?;

    outln!(
        ctx.machine,
        "checkSpendAllowed(amount={}, provider={}) => {}",
        amount,
        provider_addr,
        allowed
    );
    Ok(())
}

async fn cmd_vault_set_executor(args: VaultSetExecutorArgs) -> Result<()> {
    let ctx = setup(&args.common).await?;

    let executor = parse_address(&args.executor).map_err(|e| anyhow!("{e}"))?;
    let vault = resolve_vault(&ctx, args.vault.as_deref()).await?;
    ensure_deployed(&ctx, vault, "vault").await?;

    let calldata = vault_ops::set_executor_calldata(executor, args.allowed);
    let receipt = send_eoa_tx(&ctx, vault, calldata, U256::zero()).await?;

    let confirmed = vault_ops::is_executor(ctx.client.clone(), vault, executor).await?;
    outln!(
        ctx.machine,
        "setExecutor({}, {}) done (tx {}); isExecutor => {}",
        executor,
        args.allowed,
        encoding::fmt_h256(receipt.transaction_hash),
        confirmed
    );
    Ok(())
}

async fn cmd_vault_withdraw(args: VaultWithdrawArgs) -> Result<()> {
    let ctx = setup(&args.common).await?;

    let (token, decimals) = resolve_token(&ctx, args.token.as_deref(), None)?;
    let amount = encoding::parse_positive_amount(&args.amount, decimals)?;
    let recipient = match args.recipient.as_deref() {
        Some(raw) => parse_address(raw).map_err(|e| anyhow!("{e}"))?,
        None => ctx.owner,
    };

    let vault = resolve_vault(&ctx, args.vault.as_deref()).await?;
    ensure_deployed(&ctx, vault, "vault").await?;

    let calldata = vault_ops::withdraw_calldata(token, amount, recipient);
    let receipt = send_eoa_tx(&ctx, vault, calldata, U256::zero()).await?;

    outln!(
        ctx.machine,
        "withdrew {} of {} to {} (tx {})",
        encoding::format_amount(amount, decimals),
        token,
        recipient,
        encoding::fmt_h256(receipt.transaction_hash)
    );
    Ok(())
}

/// Spool entry format shared with paypai-executor.
#[derive(Debug, serde::Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SpoolEntry {
    id: u64,
    vault: String,
    /// Decimal amount in settlement-token units.
    amount: String,
    recipient: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    note: Option<String>,
}

async fn cmd_vault_request(args: VaultRequestArgs) -> Result<()> {
    let ctx = setup(&args.common).await?;

    let recipient = parse_address(&args.recipient).map_err(|e| anyhow!("{e}"))?;
    // Validated here so a bad request never reaches the executor's spool.
    let amount =
        encoding::parse_positive_amount(&args.amount, ctx.dep.settlement_token_decimals)?;
    let vault = resolve_vault(&ctx, args.vault.as_deref()).await?;

    let mut entries: Vec<SpoolEntry> = if args.spool.exists() {
        let raw = fs::read_to_string(&args.spool)
            .with_context(|| format!("failed to read spool {}", args.spool.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse spool {}", args.spool.display()))?
    } else {
        Vec::new()
    };

    let id = entries.iter().map(|e| e.id).max().unwrap_or(0) + 1;
    entries.push(SpoolEntry {
        id,
        vault: encoding::fmt_address(vault),
        amount: args.amount.trim().to_string(),
        recipient: encoding::fmt_address(recipient),
        note: args.note.clone(),
    });

    if let Some(parent) = args.spool.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create spool dir {}", parent.display()))?;
        }
    }
    let json = serde_json::to_string_pretty(&entries)?;
    let tmp = args.spool.with_extension("json.tmp");
    fs::write(&tmp, json).with_context(|| format!("failed to write {}", tmp.display()))?;
    fs::rename(&tmp, &args.spool)
        .with_context(|| format!("failed to replace {}", args.spool.display()))?;

    outln!(
        ctx.machine,
        "queued spend request #{}: {} ({} base units) from {} to {}",
        id,
        args.amount.trim(),
        amount,
        vault,
        recipient
    );
    Ok(())
}

/// `NotDeployed` guard: refuse to interact with an address that has no code.
async fn ensure_deployed(ctx: &Ctx, addr: Address, what: &str) -> Result<()> {
    let code = ctx
        .client
        .get_code(addr, None)
        .await
        .context("eth_getCode failed")?;
    if code.as_ref().is_empty() {
        return Err(anyhow!("{what} not deployed at {addr}"));
    }
    Ok(())
}
