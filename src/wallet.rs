//! Signer management: one signing key per chain, sourced from an
//! environment variable or an AES-256-GCM encrypted keystore file. Keys are
//! derived per entry with PBKDF2-HMAC-SHA256 and a random salt; plaintext
//! key material never reaches the durable store or the logs.

use aes_gcm::aead::rand_core::RngCore;
use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use alloy::consensus::{SignableTransaction, TxEip1559, TxEnvelope};
use alloy::eips::eip2718::Encodable2718;
use alloy::network::TxSignerSync;
use alloy::signers::local::PrivateKeySigner;
use alloy::signers::SignerSync;
use pbkdf2::pbkdf2_hmac;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use solana_sdk::signature::{Keypair, Signer as SolanaSigner};
use std::collections::HashMap;
use std::path::Path;
use tracing::info;

use crate::config::PrivateKeySource;
use crate::constants::{AES_KEY_SIZE, PBKDF2_ITERATIONS, SALT_SIZE};
use crate::error::{BotError, BotResult};
use crate::types::ChainId;

/// Environment variable holding the keystore master password.
pub const MASTER_PASSWORD_ENV: &str = "TRIDENT_MASTER_PASSWORD";

/// One encrypted keystore entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeystoreEntry {
    pub name: String,
    pub chain: String,
    pub ciphertext_b64: String,
    pub nonce_b64: String,
    pub salt_b64: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Keystore {
    pub entries: Vec<KeystoreEntry>,
}

/// Per-chain signing capability. EVM chains share the secp256k1 signer
/// family; Solana signs ed25519.
pub enum ChainSigner {
    Evm(PrivateKeySigner),
    Solana(Keypair),
}

impl ChainSigner {
    pub fn address(&self) -> String {
        match self {
            ChainSigner::Evm(signer) => format!("{:#x}", signer.address()),
            ChainSigner::Solana(keypair) => keypair.pubkey().to_string(),
        }
    }
}

pub struct WalletManager {
    signers: HashMap<ChainId, ChainSigner>,
}

impl WalletManager {
    /// Load a signer for each enabled chain from its configured source.
    pub fn from_sources(sources: &HashMap<ChainId, PrivateKeySource>) -> BotResult<Self> {
        let mut signers = HashMap::new();
        for (chain, source) in sources {
            let signer = load_signer(*chain, source)?;
            info!("🔐 {chain} signer ready: {}", signer.address());
            signers.insert(*chain, signer);
        }
        Ok(Self { signers })
    }

    pub fn address(&self, chain: ChainId) -> BotResult<String> {
        self.signer(chain).map(|s| s.address())
    }

    pub fn signer(&self, chain: ChainId) -> BotResult<&ChainSigner> {
        self.signers
            .get(&chain)
            .ok_or_else(|| BotError::Signer(format!("no signer for {chain}")))
    }

    /// Sign an EIP-1559 transaction; returns (tx_hash, raw envelope bytes).
    pub fn sign_evm_tx(&self, chain: ChainId, mut tx: TxEip1559) -> BotResult<(String, Vec<u8>)> {
        let ChainSigner::Evm(signer) = self.signer(chain)? else {
            return Err(BotError::Signer(format!("{chain} signer is not EVM")));
        };
        let signature = signer
            .sign_transaction_sync(&mut tx)
            .map_err(|e| BotError::Signer(format!("evm sign: {e}")))?;
        let signed = tx.into_signed(signature);
        let hash = format!("{:#x}", signed.hash());
        let envelope = TxEnvelope::Eip1559(signed);
        let mut raw = Vec::new();
        envelope.encode_2718(&mut raw);
        Ok((hash, raw))
    }

    /// Flashbots-style auth header value: EIP-191 signature over the keccak
    /// hash of the request body, as `address:signature`.
    pub fn flashbots_signature(&self, chain: ChainId, body: &str) -> BotResult<String> {
        let ChainSigner::Evm(signer) = self.signer(chain)? else {
            return Err(BotError::Signer(format!("{chain} signer is not EVM")));
        };
        let digest = alloy::primitives::keccak256(body.as_bytes());
        let message = format!("0x{}", hex::encode(digest));
        let signature = signer
            .sign_message_sync(message.as_bytes())
            .map_err(|e| BotError::Signer(format!("flashbots sign: {e}")))?;
        Ok(format!(
            "{:#x}:0x{}",
            signer.address(),
            hex::encode(signature.as_bytes())
        ))
    }

    pub fn solana_keypair(&self) -> BotResult<&Keypair> {
        let ChainSigner::Solana(keypair) = self.signer(ChainId::Solana)? else {
            return Err(BotError::Signer("solana signer is not ed25519".into()));
        };
        Ok(keypair)
    }
}

fn load_signer(chain: ChainId, source: &PrivateKeySource) -> BotResult<ChainSigner> {
    match source {
        PrivateKeySource::Env { var } => {
            let raw = std::env::var(var)
                .map_err(|_| BotError::Signer(format!("env var {var} not set")))?;
            parse_key_material(chain, raw.trim())
        }
        PrivateKeySource::Keystore { path, entry } => {
            let password = std::env::var(MASTER_PASSWORD_ENV).map_err(|_| {
                BotError::Signer(format!("{MASTER_PASSWORD_ENV} not set for keystore"))
            })?;
            let material = read_keystore_entry(Path::new(path), entry, &password)?;
            parse_key_material(chain, &material)
        }
    }
}

fn parse_key_material(chain: ChainId, material: &str) -> BotResult<ChainSigner> {
    if chain.is_evm() {
        let signer: PrivateKeySigner = material
            .parse()
            .map_err(|e| BotError::Signer(format!("bad EVM key: {e}")))?;
        Ok(ChainSigner::Evm(signer))
    } else {
        let bytes = bs58::decode(material)
            .into_vec()
            .map_err(|e| BotError::Signer(format!("bad base58 key: {e}")))?;
        let keypair = Keypair::from_bytes(&bytes)
            .map_err(|e| BotError::Signer(format!("bad solana keypair: {e}")))?;
        Ok(ChainSigner::Solana(keypair))
    }
}

// ---------------------------------------------------------------------------
// Keystore encryption
// ---------------------------------------------------------------------------

fn derive_key(password: &str, salt: &[u8]) -> [u8; AES_KEY_SIZE] {
    let mut key = [0u8; AES_KEY_SIZE];
    pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, PBKDF2_ITERATIONS, &mut key);
    key
}

/// Encrypt key material into a keystore entry with a fresh salt and nonce.
/// Both come from the OS CSPRNG: a predictable GCM nonce under a reused key
/// forfeits confidentiality, and a predictable salt invites precomputation.
pub fn seal_entry(
    name: &str,
    chain: ChainId,
    material: &str,
    password: &str,
) -> BotResult<KeystoreEntry> {
    let mut salt = [0u8; SALT_SIZE];
    OsRng.fill_bytes(&mut salt);
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
    let key = derive_key(password, &salt);
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));
    let ciphertext = cipher
        .encrypt(&nonce, material.as_bytes())
        .map_err(|e| BotError::Signer(format!("keystore encrypt: {e}")))?;
    Ok(KeystoreEntry {
        name: name.to_string(),
        chain: chain.name().to_string(),
        ciphertext_b64: base64::encode(ciphertext),
        nonce_b64: base64::encode(nonce),
        salt_b64: base64::encode(salt),
    })
}

/// Decrypt one entry from a keystore file.
pub fn read_keystore_entry(path: &Path, entry_name: &str, password: &str) -> BotResult<String> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| BotError::Signer(format!("keystore {}: {e}", path.display())))?;
    let keystore: Keystore = serde_json::from_str(&raw)
        .map_err(|e| BotError::Signer(format!("keystore parse: {e}")))?;
    let entry = keystore
        .entries
        .iter()
        .find(|e| e.name == entry_name)
        .ok_or_else(|| BotError::Signer(format!("keystore entry {entry_name} not found")))?;
    open_entry(entry, password)
}

pub fn open_entry(entry: &KeystoreEntry, password: &str) -> BotResult<String> {
    let salt = base64::decode(&entry.salt_b64)
        .map_err(|e| BotError::Signer(format!("keystore salt: {e}")))?;
    let nonce_bytes = base64::decode(&entry.nonce_b64)
        .map_err(|e| BotError::Signer(format!("keystore nonce: {e}")))?;
    let ciphertext = base64::decode(&entry.ciphertext_b64)
        .map_err(|e| BotError::Signer(format!("keystore ciphertext: {e}")))?;
    let key = derive_key(password, &salt);
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));
    let plaintext = cipher
        .decrypt(Nonce::from_slice(&nonce_bytes), ciphertext.as_ref())
        .map_err(|_| BotError::Signer("keystore decrypt failed (wrong password?)".into()))?;
    String::from_utf8(plaintext).map_err(|e| BotError::Signer(format!("keystore utf8: {e}")))
}
