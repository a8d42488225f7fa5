//! The clearance api which tracks student clearance across departments and
//! drives the rfid tag-link workflow for scanning devices

#![warn(
    missing_docs,
    missing_debug_implementations,
    missing_copy_implementations,
    trivial_casts,
    trivial_numeric_casts,
    unsafe_code,
    unstable_features,
    unused_import_braces,
    unused_qualifications,
    deprecated
)]

//TODO: add a background sweep for expired pending links so device_logs can record lapses
//TODO: add rate limiting for the token and device registration endpoints - can be implemented as middleware

#[macro_use]
extern crate diesel;

pub mod auth;
pub mod config;
pub mod db;
pub mod endpoints;
pub mod error;
pub mod models;
#[cfg(not(tarpaulin_include))]
pub mod schema;

use actix_web::{middleware::Logger, web::Data, App, HttpServer};
use config::Config;
use db::Database;
use log::info;

/// State holds process-wide information that is not persisted
#[derive(Debug)]
pub struct State {
    /// The instant that the server started
    pub start_time: std::time::Instant,
}

#[doc(hidden)]
pub async fn start(config: Config, state: Data<State>) -> Result<(), Box<dyn std::error::Error>> {
    let config = Data::new(config);

    let database = Database::new(&config.db_url)?;
    database.init().await?;

    if let Some(bootstrap) = &config.bootstrap_admin {
        let hashed = auth::hash_password(&bootstrap.password)?;
        if database
            .ensure_bootstrap_admin(&bootstrap.username, &hashed)
            .await?
        {
            info!("created bootstrap admin account '{}'", bootstrap.username);
        }
    }
    let database = Data::new(database);

    // begin listening for connections
    let server_config = config.clone();
    let server_handle = HttpServer::new(move || {
        App::new()
            .app_data(state.clone())
            .app_data(database.clone())
            .app_data(server_config.clone())
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
    .listen(config.listener.try_clone()?)?
    .run();

    tokio::select! {
        biased;

        _ = tokio::signal::ctrl_c() => {
            info!("Received SIGINT, shutting down");
        }

        _ = server_handle => {
            info!("Server task has exited, shutting down");
        }
    }

    Ok(())
}
