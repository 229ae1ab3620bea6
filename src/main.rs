use actix::Actor;
use actix_web::{web, App, HttpServer};
use log::info;

mod config;
mod game;
mod models;
mod routes;
mod server;
mod websocket;

use config::ServerConfig;
use server::MatchServer;

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let config = ServerConfig::from_env();
    let bind_addr = config.bind_addr.clone();
    info!("starting match server at http://{bind_addr}");

    let server = MatchServer::new(config).start();
    let server = web::Data::new(server);

    HttpServer::new(move || {
        App::new()
            .app_data(server.clone())
            .configure(routes::configure_routes)
    })
    .bind(bind_addr)?
    .run()
    .await
}
