use std::env::{self, VarError};
use std::net::IpAddr;
use std::path::PathBuf;

use hex::FromHex;

use crate::error::{Error, Result};

/// Default TCP port the wallet service binds when nothing is configured.
pub const DEFAULT_PORT: u16 = 3456;

/// Runtime configuration, read from `COSMOS_*` environment variables.
///
/// A `.env` file in the working directory participates: it is loaded before
/// the variables are read, with real environment entries taking precedence.
#[derive(Clone, Debug)]
pub struct Config {
    /// Full TCP endpoint, e.g. `127.0.0.1:3456`. Beats ip + port when set.
    pub endpoint: Option<String>,
    pub ip_address: IpAddr,
    pub port_number: u16,
    /// Worker tasks. The reference configuration is one; correctness does
    /// not require more.
    pub threads: usize,
    pub sqlite_path: Option<PathBuf>,
    /// Seed for the deterministic random mode. Production runs leave this
    /// unset and seed from the OS.
    pub seed: Option<Vec<u8>>,
    /// Nonce mixed into the DRBG at instantiation.
    pub nonce: Option<Vec<u8>>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            endpoint: None,
            ip_address: IpAddr::from([127, 0, 0, 1]),
            port_number: DEFAULT_PORT,
            threads: 1,
            sqlite_path: None,
            seed: None,
            nonce: None,
        }
    }
}

fn read_var(name: &str) -> Result<Option<String>> {
    match env::var(name) {
        Ok(v) if v.is_empty() => Ok(None),
        Ok(v) => Ok(Some(v)),
        Err(VarError::NotPresent) => Ok(None),
        Err(VarError::NotUnicode(_)) => {
            Err(Error::InvalidSyntax(format!("{name} is not valid unicode")))
        }
    }
}

impl Config {
    /// Read configuration from the environment, consulting `.env` first.
    pub fn from_env() -> Result<Self> {
        // A missing .env file is not an error; a malformed one is.
        match dotenvy::dotenv() {
            Ok(_) => {}
            Err(e) if e.not_found() => {}
            Err(e) => return Err(Error::InvalidSyntax(format!("reading .env: {e}"))),
        }

        let mut config = Config::default();

        config.endpoint = read_var("COSMOS_WALLET_ENDPOINT")?;

        if let Some(ip) = read_var("COSMOS_WALLET_IP_ADDRESS")? {
            config.ip_address = ip
                .parse()
                .map_err(|_| Error::InvalidSyntax(format!("invalid ip address {ip}")))?;
        }

        if let Some(port) = read_var("COSMOS_WALLET_PORT_NUMBER")? {
            config.port_number = port
                .parse()
                .map_err(|_| Error::InvalidSyntax(format!("invalid port number {port}")))?;
        }

        if let Some(threads) = read_var("COSMOS_THREADS")? {
            config.threads = threads
                .parse()
                .map_err(|_| Error::InvalidSyntax(format!("invalid thread count {threads}")))?;
        }

        config.sqlite_path = read_var("COSMOS_SQLITE_PATH")?.map(PathBuf::from);

        if let Some(seed) = read_var("COSMOS_SEED")? {
            let bytes = Vec::<u8>::from_hex(&seed)
                .map_err(|_| Error::InvalidSyntax(format!("COSMOS_SEED is not hex: {seed}")))?;
            config.seed = Some(bytes);
        }

        if let Some(nonce) = read_var("COSMOS_NONCE")? {
            let bytes = Vec::<u8>::from_hex(&nonce)
                .map_err(|_| Error::InvalidSyntax(format!("COSMOS_NONCE is not hex: {nonce}")))?;
            config.nonce = Some(bytes);
        }

        Ok(config)
    }

    /// The endpoint the HTTP layer should bind, resolved from either form.
    pub fn bind_address(&self) -> String {
        match &self.endpoint {
            Some(e) => e.clone(),
            None => format!("{}:{}", self.ip_address, self.port_number),
        }
    }
}
