mod config;
mod model;
mod web;

use std::sync::Arc;

use actix_web::{middleware, web::Data, App, HttpServer};
use dotenv::dotenv;
use log::{error, info};

use config::Config;
use model::{GenerationBackend, OpenAiBackend};
use web::routes;

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    // Initialize environment
    dotenv().ok();
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let config = Config::from_env();
    info!("Starting chat gateway on {}:{}", config.host, config.port);

    // The backend handle is loaded once and shared read-only across requests;
    // each request only carries its own conversation.
    let backend = match OpenAiBackend::new(&config) {
        Ok(backend) => backend,
        Err(e) => {
            error!("Failed to initialize generation backend: {}", e);
            std::process::exit(1);
        }
    };
    let backend: Data<dyn GenerationBackend> =
        Data::from(Arc::new(backend) as Arc<dyn GenerationBackend>);

    let bind_addr = (config.host.clone(), config.port);
    let config = Data::new(config);

    HttpServer::new(move || {
        App::new()
            .wrap(middleware::Logger::default())
            .app_data(backend.clone())
            .app_data(config.clone())
            .configure(routes::configure)
    })
    .bind(bind_addr)?
    .run()
    .await
}
