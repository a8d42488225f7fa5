use actix_web::web::Data;
use clearance_api_lib::{config::Config, start, State};

#[doc(hidden)]
#[actix_web::main]
pub async fn main() -> Result<(), Box<dyn std::error::Error>> {
    pretty_env_logger::init();
    let config = Config::load()?;
    let state = Data::new(State {
        start_time: std::time::Instant::now(),
    });
    start(config, state).await?;
    Ok(())
}
