//! Profile Store: loads and decrypts the on-disk wallet/service profile.
//!
//! Two keystore shapes are accepted for the agent key: an array of
//! `{ "private_key": <V3-JSON-string | 0x-hex> }` entries, and a legacy
//! plain-hex file. V3 blobs are decrypted with the operator password.
//!
//! On-disk layout (see spec §6):
//! - `<base>/.operate/wallets/ethereum.json` — master safes, one per chain.
//! - `<base>/.operate/wallets/ethereum.txt` — master EOA keystore (V3 JSON).
//! - `<base>/.operate/services/sc-<uuid>/config.json` + `keys.json`.
//! - legacy: `<base>/.operate/services/sc-<uuid>/deployment/agent_keys/agent_0/ethereum_private_key.txt`.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use aes::Aes128;
use alloy::primitives::Address;
use alloy::signers::local::PrivateKeySigner;
use ctr::cipher::{KeyIvInit, StreamCipher};
use scrypt::Params as ScryptParams;
use serde::Deserialize;
use sha3::{Digest, Keccak256};

use crate::error::WorkerError;
use crate::types::Profile;

type Aes128Ctr64BE = ctr::Ctr64BE<Aes128>;

#[derive(Debug, Deserialize)]
struct KeystoreV3 {
    #[serde(default)]
    address: Option<String>,
    crypto: KeystoreCrypto,
}

#[derive(Debug, Deserialize)]
struct KeystoreCrypto {
    cipher: String,
    cipherparams: CipherParams,
    ciphertext: String,
    kdf: String,
    kdfparams: KdfParams,
    mac: String,
}

#[derive(Debug, Deserialize)]
struct CipherParams {
    iv: String,
}

#[derive(Debug, Deserialize)]
struct KdfParams {
    dklen: usize,
    salt: String,
    #[serde(default)]
    n: Option<u32>,
    #[serde(default)]
    r: Option<u32>,
    #[serde(default)]
    p: Option<u32>,
    #[serde(default)]
    c: Option<u32>,
}

/// Decrypt a V3 keystore JSON blob, returning the raw private key bytes.
pub fn decrypt_v3_keystore(json: &str, password: &str) -> Result<Vec<u8>, WorkerError> {
    let keystore: KeystoreV3 = serde_json::from_str(json)
        .map_err(|e| WorkerError::ProfileError(format!("malformed keystore JSON: {e}")))?;

    if keystore.crypto.kdf != "scrypt" {
        return Err(WorkerError::ProfileError(format!(
            "unsupported KDF: {}",
            keystore.crypto.kdf
        )));
    }

    let salt = hex::decode(&keystore.crypto.kdfparams.salt)
        .map_err(|e| WorkerError::ProfileError(format!("bad keystore salt: {e}")))?;
    let iv = hex::decode(&keystore.crypto.cipherparams.iv)
        .map_err(|e| WorkerError::ProfileError(format!("bad keystore iv: {e}")))?;
    let ciphertext = hex::decode(&keystore.crypto.ciphertext)
        .map_err(|e| WorkerError::ProfileError(format!("bad keystore ciphertext: {e}")))?;
    let mac = hex::decode(&keystore.crypto.mac)
        .map_err(|e| WorkerError::ProfileError(format!("bad keystore mac: {e}")))?;

    let n = keystore.crypto.kdfparams.n.unwrap_or(262_144);
    let r = keystore.crypto.kdfparams.r.unwrap_or(8);
    let p = keystore.crypto.kdfparams.p.unwrap_or(1);
    let dklen = keystore.crypto.kdfparams.dklen;

    let log_n = (31 - n.leading_zeros()) as u8;
    let params = ScryptParams::new(log_n, r, p, dklen)
        .map_err(|e| WorkerError::ProfileError(format!("bad scrypt params: {e}")))?;

    let mut derived_key = vec![0u8; dklen];
    scrypt::scrypt(password.as_bytes(), &salt, &params, &mut derived_key)
        .map_err(|e| WorkerError::ProfileError(format!("scrypt derivation failed: {e}")))?;

    let mut hasher = Keccak256::new();
    hasher.update(&derived_key[16..32]);
    hasher.update(&ciphertext);
    let computed_mac = hasher.finalize();
    if computed_mac.as_slice() != mac.as_slice() {
        return Err(WorkerError::ProfileError(
            "keystore MAC mismatch: wrong password".to_string(),
        ));
    }

    if keystore.crypto.cipher != "aes-128-ctr" {
        return Err(WorkerError::ProfileError(format!(
            "unsupported cipher: {}",
            keystore.crypto.cipher
        )));
    }

    let mut buf = ciphertext;
    let mut cipher = Aes128Ctr64BE::new(derived_key[0..16].into(), iv.as_slice().into());
    cipher.apply_keystream(&mut buf);

    if let Some(expected) = keystore.address.as_deref() {
        let derived_address = private_key_to_address(&buf)?;
        let expected_clean = expected.trim_start_matches("0x").to_lowercase();
        if derived_address.to_string().trim_start_matches("0x").to_lowercase() != expected_clean {
            tracing::warn!("keystore address field does not match derived address");
        }
    }

    Ok(buf)
}

fn private_key_to_address(raw: &[u8]) -> Result<Address, WorkerError> {
    let hex_key = hex::encode(raw);
    let signer: PrivateKeySigner = hex_key
        .parse()
        .map_err(|e| WorkerError::ProfileError(format!("invalid decrypted key: {e}")))?;
    Ok(signer.address())
}

/// Parse a single key-file entry: either a V3 JSON string or bare hex.
fn parse_key_entry(raw: &str, password: &str) -> Result<String, WorkerError> {
    let trimmed = raw.trim();
    if trimmed.starts_with('{') {
        let bytes = decrypt_v3_keystore(trimmed, password)?;
        Ok(hex::encode(bytes))
    } else {
        Ok(trimmed.trim_start_matches("0x").to_string())
    }
}

#[derive(Debug, Deserialize)]
struct EthereumWalletsFile {
    /// chain id (as decimal string) -> master safe address
    #[serde(flatten)]
    safes: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct ServiceConfig {
    #[serde(default)]
    token: Option<serde_json::Value>,
    #[serde(default)]
    multisig: Option<String>,
    #[serde(default)]
    mech: Option<String>,
    #[serde(default)]
    marketplace: Option<String>,
    #[serde(default)]
    staking_contract: Option<String>,
    #[serde(default)]
    chain_id: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct KeysFileEntry {
    private_key: String,
}

/// Find the directory among `services_root`'s `sc-*` children with the most
/// recent modification time.
fn latest_service_dir(services_root: &Path) -> Result<PathBuf, WorkerError> {
    let mut candidates: Vec<(SystemTime, PathBuf)> = Vec::new();

    let entries = fs::read_dir(services_root)
        .map_err(|e| WorkerError::ProfileError(format!("cannot read services dir: {e}")))?;

    for entry in entries {
        let entry = entry.map_err(|e| WorkerError::ProfileError(e.to_string()))?;
        let path = entry.path();
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if !path.is_dir() || !name.starts_with("sc-") {
            continue;
        }
        let modified = entry
            .metadata()
            .and_then(|m| m.modified())
            .map_err(|e| WorkerError::ProfileError(e.to_string()))?;
        candidates.push((modified, path));
    }

    candidates
        .into_iter()
        .max_by_key(|(modified, _)| *modified)
        .map(|(_, path)| path)
        .ok_or_else(|| WorkerError::ProfileError("no service directories found".to_string()))
}

/// Load and decrypt the full on-disk operator profile.
pub fn load_profile(password: &str, base_path: &Path) -> Result<Profile, WorkerError> {
    let wallets_dir = base_path.join(".operate").join("wallets");
    let services_root = base_path.join(".operate").join("services");

    let master_keystore_path = wallets_dir.join("ethereum.txt");
    let master_keystore = fs::read_to_string(&master_keystore_path)
        .map_err(|_| WorkerError::ProfileError("no master EOA keystore found".to_string()))?;
    let master_key_hex = parse_key_entry(&master_keystore, password)?;
    let master_signer: PrivateKeySigner = master_key_hex
        .parse()
        .map_err(|e| WorkerError::ProfileError(format!("invalid master key: {e}")))?;
    let master_eoa = master_signer.address();

    let safes_path = wallets_dir.join("ethereum.json");
    let safes_raw = fs::read_to_string(&safes_path)
        .map_err(|_| WorkerError::ProfileError("no master safes file found".to_string()))?;
    let safes_file: EthereumWalletsFile = serde_json::from_str(&safes_raw)
        .map_err(|e| WorkerError::ProfileError(format!("malformed wallets file: {e}")))?;

    let mut master_safe: HashMap<u64, Address> = HashMap::new();
    for (chain_str, value) in &safes_file.safes {
        let Ok(chain_id) = chain_str.parse::<u64>() else {
            continue;
        };
        let Some(addr_str) = value.as_str() else {
            continue;
        };
        let Ok(addr) = addr_str.parse::<Address>() else {
            continue;
        };
        master_safe.insert(chain_id, addr);
    }

    let service_dir = latest_service_dir(&services_root)?;

    let config_path = service_dir.join("config.json");
    let config_raw = fs::read_to_string(&config_path)
        .map_err(|e| WorkerError::ProfileError(format!("missing service config.json: {e}")))?;
    let config: ServiceConfig = serde_json::from_str(&config_raw)
        .map_err(|e| WorkerError::ProfileError(format!("malformed service config: {e}")))?;

    let service_safe: Address = config
        .multisig
        .as_deref()
        .ok_or_else(|| WorkerError::ProfileError("service has no multisig".to_string()))?
        .parse()
        .map_err(|e| WorkerError::ProfileError(format!("invalid multisig address: {e}")))?;

    let agent_private_key = load_agent_key(&service_dir, password)?;
    let agent_signer: PrivateKeySigner = agent_private_key
        .parse()
        .map_err(|e| WorkerError::ProfileError(format!("invalid agent key: {e}")))?;

    let mech_address: Address = config
        .mech
        .as_deref()
        .ok_or_else(|| WorkerError::ProfileError("service config missing mech address".to_string()))?
        .parse()
        .map_err(|e| WorkerError::ProfileError(format!("invalid mech address: {e}")))?;

    let marketplace_address: Address = config
        .marketplace
        .as_deref()
        .ok_or_else(|| WorkerError::ProfileError("service config missing marketplace address".to_string()))?
        .parse()
        .map_err(|e| WorkerError::ProfileError(format!("invalid marketplace address: {e}")))?;

    let staking_contract: Address = config
        .staking_contract
        .as_deref()
        .ok_or_else(|| WorkerError::ProfileError("service config missing staking contract".to_string()))?
        .parse()
        .map_err(|e| WorkerError::ProfileError(format!("invalid staking contract address: {e}")))?;

    let chain_id = config
        .chain_id
        .ok_or_else(|| WorkerError::ProfileError("service config missing chainId".to_string()))?;

    Ok(Profile {
        master_eoa,
        master_safe,
        service_safe,
        agent_eoa: agent_signer.address(),
        agent_private_key,
        mech_address,
        marketplace_address,
        staking_contract,
        chain_id,
    })
}

fn load_agent_key(service_dir: &Path, password: &str) -> Result<String, WorkerError> {
    let keys_path = service_dir.join("keys.json");
    if let Ok(raw) = fs::read_to_string(&keys_path) {
        let entries: Vec<KeysFileEntry> = serde_json::from_str(&raw)
            .map_err(|e| WorkerError::ProfileError(format!("malformed keys.json: {e}")))?;
        let entry = entries
            .first()
            .ok_or_else(|| WorkerError::ProfileError("keys.json has no entries".to_string()))?;
        return parse_key_entry(&entry.private_key, password);
    }

    let legacy_path = service_dir
        .join("deployment")
        .join("agent_keys")
        .join("agent_0")
        .join("ethereum_private_key.txt");
    let raw = fs::read_to_string(&legacy_path)
        .map_err(|_| WorkerError::ProfileError("no agent key file found".to_string()))?;
    parse_key_entry(&raw, password)
}

/// Delete any `sc-*` service directory whose `token` is absent/-1 and whose
/// `multisig` is absent — i.e. a service that was registered but never
/// actually deployed on-chain.
pub fn cleanup_undeployed_services(services_root: &Path) -> Result<Vec<PathBuf>, WorkerError> {
    let mut removed = Vec::new();

    let entries = fs::read_dir(services_root)
        .map_err(|e| WorkerError::ProfileError(format!("cannot read services dir: {e}")))?;

    for entry in entries {
        let entry = entry.map_err(|e| WorkerError::ProfileError(e.to_string()))?;
        let path = entry.path();
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if !path.is_dir() || !name.starts_with("sc-") {
            continue;
        }

        let config_path = path.join("config.json");
        let Ok(raw) = fs::read_to_string(&config_path) else {
            continue;
        };
        let Ok(config) = serde_json::from_str::<ServiceConfig>(&raw) else {
            continue;
        };

        let token_absent = match &config.token {
            None => true,
            Some(serde_json::Value::Number(n)) => n.as_i64() == Some(-1),
            Some(serde_json::Value::Null) => true,
            _ => false,
        };

        if token_absent && config.multisig.is_none() {
            fs::remove_dir_all(&path)
                .map_err(|e| WorkerError::ProfileError(format!("failed to remove {path:?}: {e}")))?;
            removed.push(path);
        }
    }

    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write_minimal_profile(dir: &Path, password_hash_entries: bool) {
        let wallets = dir.join(".operate").join("wallets");
        fs::create_dir_all(&wallets).unwrap();
        fs::write(
            wallets.join("ethereum.txt"),
            "ac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80",
        )
        .unwrap();
        fs::write(
            wallets.join("ethereum.json"),
            r#"{"1": "0x1111111111111111111111111111111111111111"}"#,
        )
        .unwrap();

        let service_dir = dir.join(".operate").join("services").join("sc-test");
        fs::create_dir_all(&service_dir).unwrap();
        fs::write(
            service_dir.join("config.json"),
            r#"{
                "token": 5,
                "multisig": "0x2222222222222222222222222222222222222222",
                "mech": "0x3333333333333333333333333333333333333333",
                "marketplace": "0x4444444444444444444444444444444444444444",
                "staking_contract": "0x5555555555555555555555555555555555555555",
                "chain_id": 8453
            }"#,
        )
        .unwrap();

        if password_hash_entries {
            fs::write(
                service_dir.join("keys.json"),
                r#"[{"private_key": "ac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff81"}]"#,
            )
            .unwrap();
        }
    }

    #[test]
    fn load_profile_reads_plain_hex_keys() {
        let tmp = tempfile::tempdir().unwrap();
        write_minimal_profile(tmp.path(), true);

        let profile = load_profile("unused", tmp.path()).unwrap();
        assert_eq!(profile.chain_id, 8453);
        assert_eq!(profile.master_safe.get(&1).copied().unwrap().to_string().to_lowercase(), "0x1111111111111111111111111111111111111111");
    }

    #[test]
    fn cleanup_removes_never_deployed_services() {
        let tmp = tempfile::tempdir().unwrap();
        let services_root = tmp.path().join(".operate").join("services");
        let undeployed = services_root.join("sc-undeployed");
        fs::create_dir_all(&undeployed).unwrap();
        fs::write(undeployed.join("config.json"), r#"{"token": -1}"#).unwrap();

        let deployed = services_root.join("sc-deployed");
        fs::create_dir_all(&deployed).unwrap();
        fs::write(
            deployed.join("config.json"),
            r#"{"token": 5, "multisig": "0x2222222222222222222222222222222222222222"}"#,
        )
        .unwrap();

        let removed = cleanup_undeployed_services(&services_root).unwrap();
        assert_eq!(removed.len(), 1);
        assert!(!undeployed.exists());
        assert!(deployed.exists());
    }
}
