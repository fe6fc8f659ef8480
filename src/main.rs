use actix_web::middleware::Logger;
use actix_web::{web, App, HttpServer};
use cogs::routes::{register_routes, UploadLimit};
use cogs::setup::{establish_context, setup_admin, setup_dotenv, Config};
use listenfd::ListenFd;
use log::{error, info};
use std::io;

#[actix_web::main]
async fn main() -> io::Result<()> {
    setup_dotenv();
    env_logger::init();

    let config = Config::from_env().map_err(|e| {
        error!("{}", e);
        io::Error::new(io::ErrorKind::InvalidInput, e.to_string())
    })?;
    let context = establish_context(&config)?;
    if let Err(e) = setup_admin(&context.auth, &config) {
        error!("Couldn't set up admin: {}", e);
        return Err(io::Error::new(io::ErrorKind::Other, e.to_string()));
    }

    let context = web::Data::new(context);
    let upload_limit = UploadLimit(config.max_upload_bytes);
    let server = HttpServer::new(move || {
        App::new()
            .app_data(context.clone())
            .app_data(upload_limit)
            .wrap(Logger::default())
            .configure(register_routes)
    });

    let mut listenfd = ListenFd::from_env();
    let server = match listenfd.take_tcp_listener(0)? {
        Some(listener) => {
            info!("Serving on inherited socket");
            server.listen(listener)?
        }
        None => {
            info!("Serving on {}", config.bind);
            server.bind(&config.bind)?
        }
    };
    server.run().await
}
