#![cfg(not(tarpaulin_include))]
#![allow(dead_code)]

use std::{sync::Once, thread::JoinHandle};

use actix_web::{middleware::Logger, web::Data, App, HttpServer};
use serde::Deserialize;
use tokio::sync::oneshot;

use clearance_api_lib::{auth, config::Config, db::Database, endpoints, State};

static INIT: Once = Once::new();

pub fn init_logger() {
    INIT.call_once(|| {
        pretty_env_logger::init();
    });
}

#[derive(Clone, Deserialize, Debug)]
pub struct Token {
    pub access_token: String,
    pub token_type: String,
}

pub const ADMIN_USERNAME: &str = "root";
pub const ADMIN_PASSWORD: &str = "admin-password";
pub const TOKEN_SECRET: &str = "integration-test-secret";

pub fn find_open_port() -> std::net::TcpListener {
    for port in 1025..65535 {
        if let Ok(l) = std::net::TcpListener::bind(("127.0.0.1", port)) {
            return l;
        }
    }
    panic!("no open ports found");
}

fn test_config(db_url: &str) -> Config {
    Config {
        listener: find_open_port(),
        db_url: db_url.into(),
        token_secret: TOKEN_SECRET.into(),
        token_ttl_minutes: 30,
        link_ttl_seconds: 120,
        bootstrap_admin: None,
    }
}

/// Spin up the full application against a fresh file-backed database, with
/// one admin account already bootstrapped.
pub async fn create_server(
    database_url: String,
    port: std::net::TcpListener,
) -> (
    Data<Database>,
    Data<State>,
    JoinHandle<()>,
    oneshot::Sender<()>,
) {
    let _ = std::fs::remove_file(&database_url);
    std::fs::write(&database_url, b"").expect("able to create test database file");

    let state = Data::new(State {
        start_time: std::time::Instant::now(),
    });
    let config = Data::new(test_config(&database_url));

    let db = Data::new(Database::new(&database_url).expect("a valid database connection"));
    db.init().await.expect("valid migrations");

    let hashed = auth::hash_password(ADMIN_PASSWORD).expect("a valid password hash");
    db.ensure_bootstrap_admin(ADMIN_USERNAME, &hashed)
        .await
        .expect("able to bootstrap the admin account");

    let server_db = db.clone();
    let server_state = state.clone();
    let (tx, mut rx) = tokio::sync::oneshot::channel::<()>();
    let handle = std::thread::spawn(move || {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let mut server = HttpServer::new(move || {
            App::new()
                .app_data(server_db.clone())
                .app_data(server_state.clone())
                .app_data(config.clone())
                .configure(endpoints::token::configure)
                .configure(endpoints::users::configure)
                .configure(endpoints::students::configure)
                .configure(endpoints::clearance::configure)
                .configure(endpoints::devices::configure)
                .configure(endpoints::admin::configure)
                .configure(endpoints::rfid::configure)
                .configure(endpoints::info::configure)
                .wrap(Logger::default())
        })
        .listen(port)
        .unwrap()
        .run();
        rt.block_on(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = &mut rx => {
                        break;
                    }
                    _ = &mut server => {
                        break;
                    }
                }
            }
        });
    });

    (db, state, handle, tx)
}

/// Exchange the bootstrapped admin credentials for a bearer token.
pub async fn admin_token(address: &str) -> String {
    let client = reqwest::Client::new();
    let res = client
        .post(format!("http://{}/token", address))
        .form(&[("username", ADMIN_USERNAME), ("password", ADMIN_PASSWORD)])
        .send()
        .await
        .unwrap();
    assert!(res.status().is_success());
    let token: Token = res.json().await.unwrap();
    assert_eq!(token.token_type, "bearer");
    token.access_token
}
