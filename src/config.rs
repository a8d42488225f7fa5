//! Handle configuration of the clearance server.

use std::{
    env,
    net::{Ipv4Addr, TcpListener},
};

use dotenv::dotenv;

/// Credentials for the one-off admin account created at startup when no
/// admin exists yet.
#[derive(Debug, Clone)]
pub struct BootstrapAdmin {
    /// Username of the bootstrap admin
    pub username: String,
    /// Plaintext password, hashed before storage
    pub password: String,
}

/// Handles all configuration variables for the crate
#[derive(Debug)]
pub struct Config {
    /// The listener to bind to
    pub listener: TcpListener,
    /// The database url to connect to
    pub db_url: String,
    /// Secret used to sign and verify bearer tokens
    pub token_secret: String,
    /// Lifetime of an issued bearer token (in minutes)
    pub token_ttl_minutes: i64,
    /// Lifetime of a pending tag link before it lapses (in seconds)
    pub link_ttl_seconds: i64,
    /// Admin account to create at startup if none exists
    pub bootstrap_admin: Option<BootstrapAdmin>,
}

impl Config {
    /// Load configuration from the environment
    pub fn load() -> Result<Config, String> {
        dotenv().ok();

        let host: Ipv4Addr = env::var("HOST")
            .map_err(|_| "HOST must be set")?
            .parse()
            .map_err(|_| "HOST must be a valid IPv4 address")?;

        let port: u16 = env::var("PORT")
            .map_err(|_| "PORT must be set")?
            .parse()
            .map_err(|_| "PORT must be a valid port number")?;

        let listener = TcpListener::bind((host, port))
            .map_err(|e| format!("failed to bind to {}:{} due to error: {}", host, port, e))?;

        let bootstrap_admin = match (env::var("ADMIN_USERNAME"), env::var("ADMIN_PASSWORD")) {
            (Ok(username), Ok(password)) => Some(BootstrapAdmin { username, password }),
            _ => None,
        };

        Ok(Self {
            listener,
            db_url: env::var("DB_URL").map_err(|_| "DB_URL must be set")?,
            token_secret: env::var("TOKEN_SECRET").map_err(|_| "TOKEN_SECRET must be set")?,
            token_ttl_minutes: match env::var("TOKEN_TTL_MINUTES") {
                Ok(v) => v
                    .parse()
                    .map_err(|_| "TOKEN_TTL_MINUTES must be a 64-bit integer")?,
                Err(_) => 30,
            },
            link_ttl_seconds: match env::var("LINK_TTL_SECONDS") {
                Ok(v) => v
                    .parse()
                    .map_err(|_| "LINK_TTL_SECONDS must be a 64-bit integer")?,
                Err(_) => 120,
            },
            bootstrap_admin,
        })
    }
}
