//! Known hosts store for gateway host key verification
//!
//! Reads OpenSSH `known_hosts` format. Hashed hostnames are not matched.

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use parking_lot::RwLock;
use russh::keys::{PublicKey, PublicKeyBase64};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use super::error::TunnelError;

/// Result of host key verification
#[derive(Debug, Clone, PartialEq)]
pub enum HostKeyVerification {
    /// Key matches a stored entry
    Verified,
    /// No entry of this key type for the host
    Unknown { fingerprint: String },
    /// Stored key of the same type differs
    Changed {
        expected_fingerprint: String,
        actual_fingerprint: String,
    },
}

#[derive(Clone, Debug)]
struct HostKeyEntry {
    key_type: String,
    key_data: String,
}

pub struct KnownHostsStore {
    /// host (or `[host]:port`) -> keys, one per key type
    hosts: RwLock<HashMap<String, Vec<HostKeyEntry>>>,
    path: PathBuf,
}

/// `~/.ssh/known_hosts`
pub fn default_known_hosts_path() -> PathBuf {
    dirs::home_dir()
        .map(|h| h.join(".ssh").join("known_hosts"))
        .unwrap_or_else(|| PathBuf::from("~/.ssh/known_hosts"))
}

impl KnownHostsStore {
    /// Load the store at `path`, or the default location. A missing or
    /// unreadable file yields an empty store.
    pub fn open(path: Option<PathBuf>) -> Self {
        let path = path.unwrap_or_else(default_known_hosts_path);
        let store = Self {
            hosts: RwLock::new(HashMap::new()),
            path,
        };

        if let Err(e) = store.load() {
            warn!("Failed to load known_hosts {}: {}", store.path.display(), e);
        }

        store
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<(), TunnelError> {
        if !self.path.exists() {
            debug!("No known_hosts at {}", self.path.display());
            return Ok(());
        }

        let reader = BufReader::new(fs::File::open(&self.path)?);
        let mut hosts = self.hosts.write();
        let mut entry_count = 0;

        for line in reader.lines() {
            let line = line?;
            let line = line.trim();

            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            // hostname[,alias] keytype base64key [comment]
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() < 3 {
                continue;
            }

            let entry = HostKeyEntry {
                key_type: parts[1].to_string(),
                key_data: parts[2].to_string(),
            };

            for hostname in parts[0].split(',') {
                if hostname.starts_with('|') {
                    continue;
                }
                hosts
                    .entry(hostname.to_lowercase())
                    .or_default()
                    .push(entry.clone());
                entry_count += 1;
            }
        }

        debug!(
            "Loaded {} known host entries ({} unique hosts)",
            entry_count,
            hosts.len()
        );
        Ok(())
    }

    /// Lookup key for host:port, matching the file format
    fn make_key(host: &str, port: u16) -> String {
        let host = host.to_lowercase();
        if port == 22 {
            host
        } else {
            format!("[{}]:{}", host, port)
        }
    }

    /// SHA256 fingerprint in OpenSSH display form
    pub fn fingerprint(key: &PublicKey) -> String {
        Self::fingerprint_bytes(&key.public_key_bytes())
    }

    fn fingerprint_bytes(bytes: &[u8]) -> String {
        let hash = Sha256::digest(bytes);
        format!("SHA256:{}", BASE64.encode(hash).trim_end_matches('='))
    }

    pub fn verify(&self, host: &str, port: u16, key: &PublicKey) -> HostKeyVerification {
        let lookup_key = Self::make_key(host, port);
        let actual_key_b64 = BASE64.encode(key.public_key_bytes());
        let actual_key_type = key.algorithm().as_str().to_string();
        let fingerprint = Self::fingerprint(key);

        let hosts = self.hosts.read();
        let Some(entries) = hosts.get(&lookup_key) else {
            debug!("Unknown host: {}", lookup_key);
            return HostKeyVerification::Unknown { fingerprint };
        };

        match entries.iter().find(|e| e.key_type == actual_key_type) {
            Some(entry) if entry.key_data == actual_key_b64 => {
                debug!("Host key verified for {} ({})", lookup_key, actual_key_type);
                HostKeyVerification::Verified
            }
            Some(entry) => {
                let expected_fingerprint = BASE64
                    .decode(&entry.key_data)
                    .map(|bytes| Self::fingerprint_bytes(&bytes))
                    .unwrap_or_else(|_| "unknown".to_string());
                HostKeyVerification::Changed {
                    expected_fingerprint,
                    actual_fingerprint: fingerprint,
                }
            }
            None => {
                debug!(
                    "Host {} known but no {} key stored, treating as new",
                    lookup_key, actual_key_type
                );
                HostKeyVerification::Unknown { fingerprint }
            }
        }
    }

    /// Record `key` for host:port in memory and append it to the file
    pub fn add_host(&self, host: &str, port: u16, key: &PublicKey) -> Result<(), TunnelError> {
        let lookup_key = Self::make_key(host, port);
        let key_b64 = BASE64.encode(key.public_key_bytes());
        let key_type = key.algorithm().as_str().to_string();

        self.hosts
            .write()
            .entry(lookup_key.clone())
            .or_default()
            .push(HostKeyEntry {
                key_type: key_type.clone(),
                key_data: key_b64.clone(),
            });

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{} {} {}", lookup_key, key_type, key_b64)?;

        info!("Added host key for {} ({}) to known_hosts", lookup_key, key_type);
        Ok(())
    }
}
