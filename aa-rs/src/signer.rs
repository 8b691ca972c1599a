use anyhow::{anyhow, Context, Result};
use ethers::signers::{LocalWallet, Signer as _};
use ethers::types::{Address, Bytes, H256};
use serde_json::Value;

/// The one place "raw private key vs. wallet session" is decided.
///
/// Every operation downstream takes a `Signer` and never re-branches on
/// which kind it holds. `RawKey` wraps a local private key; `Session`
/// delegates message signing to an unlocked wallet session over JSON-RPC
/// `personal_sign`. Both produce an EIP-191 personal-message signature over
/// the userOpHash, which is what the smart account's owner check verifies.
#[derive(Debug, Clone)]
pub enum Signer {
    RawKey(LocalWallet),
    Session(SessionSigner),
}

impl Signer {
    pub fn address(&self) -> Address {
        match self {
            Signer::RawKey(wallet) => wallet.address(),
            Signer::Session(session) => session.address,
        }
    }

    /// Sign a 32-byte digest as a personal message.
    pub async fn sign_digest(&self, digest: H256) -> Result<Bytes> {
        match self {
            Signer::RawKey(wallet) => {
                let sig = wallet
                    .sign_message(digest.as_bytes())
                    .await
                    .context("failed to sign digest with local key")?;
                Ok(Bytes::from(sig.to_vec()))
            }
            Signer::Session(session) => session.personal_sign(digest).await,
        }
    }

    /// The raw wallet, for flows that must submit plain EOA transactions.
    ///
    /// A wallet session cannot hand out its key, so those flows require the
    /// `RawKey` variant; this is the original system's constraint as well.
    pub fn raw_wallet(&self) -> Result<&LocalWallet> {
        match self {
            Signer::RawKey(wallet) => Ok(wallet),
            Signer::Session(_) => Err(anyhow!(
                "this operation sends a direct EOA transaction and needs a private key; \
                 a wallet-session signer cannot do that"
            )),
        }
    }
}

/// Signs through a wallet session: `personal_sign` against a JSON-RPC
/// endpoint that holds the unlocked account.
#[derive(Debug, Clone)]
pub struct SessionSigner {
    pub address: Address,
    url: String,
    http: reqwest::Client,
}

impl SessionSigner {
    pub fn new(url: String, address: Address) -> Self {
        Self {
            address,
            url,
            http: reqwest::Client::new(),
        }
    }

    async fn personal_sign(&self, digest: H256) -> Result<Bytes> {
        let req = serde_json::json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "personal_sign",
            "params": [
                format!("0x{}", hex::encode(digest.as_bytes())),
                format!("0x{}", hex::encode(self.address.as_bytes())),
            ],
        });

        let resp = self
            .http
            .post(&self.url)
            .json(&req)
            .send()
            .await
            .with_context(|| format!("POST {} failed", self.url))?;

        let status = resp.status();
        let body: Value = resp.json().await.context("failed to decode JSON")?;

        if !status.is_success() {
            return Err(anyhow!("HTTP {}: {}", status, body));
        }
        if let Some(err) = body.get("error") {
            return Err(anyhow!("personal_sign error: {}", err));
        }

        let sig_hex = body
            .get("result")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow!("personal_sign returned no result"))?;
        let sig = hex::decode(sig_hex.strip_prefix("0x").unwrap_or(sig_hex))
            .context("personal_sign returned invalid hex")?;
        if sig.len() != 65 {
            return Err(anyhow!(
                "personal_sign returned {}-byte signature, expected 65",
                sig.len()
            ));
        }
        Ok(Bytes::from(sig))
    }
}
