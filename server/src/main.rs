#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]

mod api;
mod config;
mod retention;
mod ws;

use std::env;

use actix_cors::Cors;
use actix_web::{http, middleware, web, App, HttpServer};
use dicebox_session::SessionDb;
use tokio_util::sync::CancellationToken;

use crate::ws::registry::SessionRegistry;

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    env_logger::init();

    let service_port = {
        let args: Vec<String> = env::args().collect();

        if args.len() > 1 {
            args[1].parse::<u16>().unwrap()
        } else {
            8000
        }
    };

    let config = config::Config::from_env();
    log::debug!("Starting with {config:?}");

    let db = SessionDb::open(&config.db_path).map_err(std::io::Error::other)?;

    let registry = SessionRegistry::new(db.clone(), config.clone());

    let sweep_token = CancellationToken::new();
    let sweep = retention::spawn_sweep(
        db,
        config.retention_age,
        config.sweep_interval,
        sweep_token.clone(),
    );

    let http_server = {
        let registry = registry.clone();

        HttpServer::new(move || {
            let cors = Cors::default()
                .allow_any_origin()
                .allowed_methods(vec!["GET", "POST"])
                .allowed_headers(vec![http::header::AUTHORIZATION, http::header::ACCEPT])
                .allowed_header(http::header::CONTENT_TYPE)
                .supports_credentials()
                .max_age(3600);

            App::new()
                .wrap(cors)
                .wrap(middleware::Compress::default())
                .app_data(web::Data::new(registry.clone()))
                .service(api::health_endpoint)
                .service(api::websocket)
        })
        .bind(("0.0.0.0", service_port))?
        .run()
    };

    http_server.await?;

    log::debug!(
        "Shutting down {} live session coordinators",
        registry.session_count().await
    );
    registry.shutdown().await;
    sweep_token.cancel();
    let _ = sweep.await;

    Ok(())
}
