mod backend;
mod classifier;
mod config;
mod errors;
mod handlers;
mod labels;
mod models;
mod preprocess;

use std::io;
use std::sync::Arc;

use actix_cors::Cors;
use actix_web::middleware::Logger;
use actix_web::{web, App, HttpServer};
use log::{error, info};

use crate::classifier::ClassifierService;
use crate::config::AppConfig;
use crate::handlers::AppState;

#[actix_web::main]
async fn main() -> io::Result<()> {
    let env = env_logger::Env::default().default_filter_or("info");
    env_logger::Builder::from_env(env).init();

    let config = AppConfig::from_env().map_err(|e| {
        error!("Invalid configuration: {}", e);
        io::Error::new(io::ErrorKind::InvalidInput, e)
    })?;

    let classifier = Arc::new(ClassifierService::new());
    let state = web::Data::new(AppState {
        classifier: Arc::clone(&classifier),
        max_upload_bytes: config.max_upload_bytes,
        inference_timeout: config.inference_timeout,
    });
    let origins = config.cors_origins.clone();

    let server = HttpServer::new(move || {
        App::new()
            .app_data(state.clone())
            .wrap(cors(&origins))
            .wrap(Logger::default())
            .configure(handlers::configure)
    })
    .bind(&config.bind_addr)?
    .run();

    info!("Server running at http://{}", config.bind_addr);

    // Loading happens off the event loop so /health answers "starting" meanwhile.
    let options = config.load_options();
    actix_web::rt::task::spawn_blocking(move || {
        if classifier.load(&options).is_err() {
            error!("Serving without a model; /classify will answer 503");
        }
    });

    server.await
}

fn cors(origins: &[String]) -> Cors {
    let cors = if origins.iter().any(|origin| origin == "*") {
        Cors::default().allow_any_origin()
    } else {
        origins
            .iter()
            .fold(Cors::default(), |cors, origin| cors.allowed_origin(origin))
    };

    cors.allow_any_method().allow_any_header()
}
